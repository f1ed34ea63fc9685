// 测试图案视频源（模拟版本）
//
// 不依赖任何采集设备，按固定帧率生成渐变图案，用于联调和演示。
// URI格式：synthetic://<name>?fps=<帧率>

use async_trait::async_trait;
use bytes::Bytes;
use common::{CaptureError, RawFrame, Result, SourceDescriptor};
use tokio::time::{interval, Duration, Interval, MissedTickBehavior};
use tracing::debug;

use super::FrameReader;
use crate::multiplexer::cadence_from_fps;

pub(crate) const SCHEME: &str = "synthetic://";

const DEFAULT_WIDTH: u32 = 320;
const DEFAULT_HEIGHT: u32 = 240;

/// 测试图案参数
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticOptions {
    pub fps: f64,
    pub width: u32,
    pub height: u32,
}

impl SyntheticOptions {
    /// 从URI和视频源描述中解析参数
    pub fn from_uri(uri: &str, descriptor: &SourceDescriptor) -> Result<Self> {
        let mut options = Self {
            fps: 30.0,
            width: descriptor.width.unwrap_or(DEFAULT_WIDTH),
            height: descriptor.height.unwrap_or(DEFAULT_HEIGHT),
        };

        let query = uri
            .strip_prefix(SCHEME)
            .and_then(|rest| rest.split_once('?'))
            .map(|(_, query)| query)
            .unwrap_or("");

        for pair in query.split('&').filter(|pair| !pair.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            match key {
                "fps" => {
                    options.fps = value.parse().map_err(|_| {
                        CaptureError::InvalidParameter(format!("invalid fps in {}", uri))
                    })?;
                }
                other => debug!("Ignoring unknown synthetic option {}", other),
            }
        }

        if options.width == 0 || options.height == 0 {
            return Err(CaptureError::InvalidParameter(format!(
                "synthetic source {} needs a non-empty frame size",
                uri
            )));
        }
        options.frame_interval()?;
        Ok(options)
    }

    /// 两帧之间的间隔，帧率无法换算时返回 `InvalidParameter`
    pub fn frame_interval(&self) -> Result<Duration> {
        cadence_from_fps(self.fps)
    }
}

/// 测试图案读取器
pub struct SyntheticReader {
    options: SyntheticOptions,
    ticker: Interval,
    frame_count: u64,
}

impl SyntheticReader {
    pub fn new(options: SyntheticOptions) -> Result<Self> {
        let mut ticker = interval(options.frame_interval()?);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Ok(Self {
            options,
            ticker,
            frame_count: 0,
        })
    }

    /// 生成一帧RGB渐变图案，随帧号水平滚动
    fn render(&self) -> Bytes {
        let width = self.options.width as usize;
        let height = self.options.height as usize;
        let shift = self.frame_count as usize;
        let mut pixels = Vec::with_capacity(width * height * 3);

        for y in 0..height {
            for x in 0..width {
                pixels.push(((x + shift) % 256) as u8);
                pixels.push((y % 256) as u8);
                pixels.push((self.frame_count % 256) as u8);
            }
        }
        Bytes::from(pixels)
    }
}

#[async_trait]
impl FrameReader for SyntheticReader {
    async fn read_frame(&mut self) -> Result<RawFrame> {
        self.ticker.tick().await;
        let frame = RawFrame::new(self.render()).with_size(self.options.width, self.options.height);
        self.frame_count += 1;
        Ok(frame)
    }

    async fn close(&mut self) -> Result<()> {
        debug!(
            "Synthetic source closed after {} frames",
            self.frame_count
        );
        Ok(())
    }
}
