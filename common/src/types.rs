use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ErrorKind;

/// 视频源连接目标
///
/// 配置文件中整数表示本地设备序号，字符串表示流地址。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConnectionTarget {
    /// 本地采集设备（如 /dev/video0）
    Device(u32),
    /// 网络流或其他URI（rtsp://, http://, synthetic://）
    Uri(String),
}

impl ConnectionTarget {
    /// 从命令行/环境变量中的文本解析目标，纯数字视为设备序号
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        match text.parse::<u32>() {
            Ok(index) => ConnectionTarget::Device(index),
            Err(_) => ConnectionTarget::Uri(text.to_string()),
        }
    }
}

impl fmt::Display for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionTarget::Device(index) => write!(f, "device:{}", index),
            ConnectionTarget::Uri(uri) => f.write_str(uri),
        }
    }
}

/// 视频源描述
///
/// 注册后不可变。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub source_id: String,
    pub display_name: String,
    pub target: ConnectionTarget,
    /// 期望的采集宽度
    #[serde(default)]
    pub width: Option<u32>,
    /// 期望的采集高度
    #[serde(default)]
    pub height: Option<u32>,
}

impl SourceDescriptor {
    pub fn new(
        source_id: impl Into<String>,
        display_name: impl Into<String>,
        target: ConnectionTarget,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            display_name: display_name.into(),
            target,
            width: None,
            height: None,
        }
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }
}

/// 视频源状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceState {
    Connecting,
    Streaming,
    Reconnecting,
    Failed,
}

impl SourceState {
    /// 是否对消费者可用
    pub fn is_available(&self) -> bool {
        matches!(self, SourceState::Streaming)
    }
}

impl fmt::Display for SourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SourceState::Connecting => "connecting",
            SourceState::Streaming => "streaming",
            SourceState::Reconnecting => "reconnecting",
            SourceState::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// 采集后端产出的原始帧，发布前尚无序号
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub pixel_buffer: Bytes,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl RawFrame {
    pub fn new(pixel_buffer: impl Into<Bytes>) -> Self {
        Self {
            pixel_buffer: pixel_buffer.into(),
            width: None,
            height: None,
        }
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }
}

/// 最近一次错误记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn now(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            at: Utc::now(),
        }
    }
}
