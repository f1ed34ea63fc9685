// 采集设备抽象
//
// 采集循环只通过 `SourceConnector` / `FrameReader` 访问设备，
// 设备句柄由读取器独占，关闭或丢弃读取器即释放设备。
//
// # 实现
//
// - `SyntheticReader`: 测试图案生成器（synthetic://）
// - `FfmpegReader`: 基于ffmpeg命令行的本地设备/网络流读取器

pub mod ffmpeg;
pub mod synthetic;

use async_trait::async_trait;
use common::{ConnectionTarget, RawFrame, Result, SourceDescriptor};
use tracing::debug;

pub use ffmpeg::{FfmpegOptions, FfmpegReader};
pub use synthetic::{SyntheticOptions, SyntheticReader};

/// 打开视频源
#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// 打开视频源并返回独占的读取器
    ///
    /// # 返回
    ///
    /// - `Ok(reader)`: 设备已打开
    /// - `Err(error)`: 打开失败，调用方负责退避重试
    async fn open(&self, descriptor: &SourceDescriptor) -> Result<Box<dyn FrameReader>>;
}

/// 已打开视频源的帧读取器
#[async_trait]
pub trait FrameReader: Send {
    /// 读取下一帧
    async fn read_frame(&mut self) -> Result<RawFrame>;

    /// 关闭并释放设备
    ///
    /// 实现必须保证丢弃读取器时同样释放设备。
    async fn close(&mut self) -> Result<()>;
}

/// 默认连接器，按连接目标选择后端
#[derive(Debug, Clone, Default)]
pub struct DeviceConnector {
    ffmpeg: FfmpegOptions,
}

impl DeviceConnector {
    pub fn new(ffmpeg: FfmpegOptions) -> Self {
        Self { ffmpeg }
    }
}

#[async_trait]
impl SourceConnector for DeviceConnector {
    async fn open(&self, descriptor: &SourceDescriptor) -> Result<Box<dyn FrameReader>> {
        match &descriptor.target {
            ConnectionTarget::Uri(uri) if uri.starts_with(synthetic::SCHEME) => {
                debug!("Opening synthetic source {} ({})", descriptor.source_id, uri);
                let options = SyntheticOptions::from_uri(uri, descriptor)?;
                Ok(Box::new(SyntheticReader::new(options)?))
            }
            _ => {
                debug!(
                    "Opening ffmpeg source {} ({})",
                    descriptor.source_id, descriptor.target
                );
                let reader = FfmpegReader::open(descriptor, &self.ffmpeg).await?;
                Ok(Box::new(reader))
            }
        }
    }
}
