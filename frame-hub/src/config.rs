use common::{CaptureError, ConnectionTarget, Result, SourceDescriptor};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::device::FfmpegOptions;
use crate::multiplexer::cadence_from_fps;
use crate::supervisor::BackoffPolicy;

/// 从环境变量读取视频源列表（逗号分隔的设备序号或URI）
pub const SOURCES_ENV: &str = "FRAME_HUB_SOURCES";

/// 帧中心配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// 采集循环参数
    pub capture: CaptureConfig,

    /// 重连退避参数
    pub reconnect: ReconnectConfig,

    /// 订阅流参数
    pub streaming: StreamingConfig,

    /// 状态上报参数
    pub status: StatusConfig,

    /// 日志配置
    pub logging: LoggingConfig,

    /// 启动时注册的视频源
    pub sources: Vec<SourceDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// 打开视频源超时（毫秒）
    pub open_timeout_ms: u64,

    /// 单帧读取超时（毫秒）
    pub read_timeout_ms: u64,

    /// 连续读取失败多少次后进入重连
    pub read_retry_limit: u32,

    /// 读取失败后原地重试前的等待（毫秒）
    pub read_retry_delay_ms: u64,

    /// 事件广播通道容量
    pub event_buffer: usize,

    /// ffmpeg可执行文件
    pub ffmpeg_program: String,

    /// ffmpeg输出的MJPEG质量（2-31）
    pub jpeg_quality: u8,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            open_timeout_ms: 5_000,
            read_timeout_ms: 2_000,
            read_retry_limit: 10,
            read_retry_delay_ms: 10,
            event_buffer: 256,
            ffmpeg_program: "ffmpeg".to_string(),
            jpeg_quality: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// 初始退避（毫秒）
    pub initial_backoff_ms: u64,

    /// 退避上限（毫秒）
    pub max_backoff_ms: u64,

    /// 连续失败多少次后进入Failed
    pub max_consecutive_failures: u32,

    /// 持续出流多久后退避重置为初始值（毫秒）
    pub stable_after_ms: u64,

    /// 不同视频源之间的错峰步长（毫秒）
    pub stagger_step_ms: u64,

    /// 错峰槽位数量
    pub stagger_slots: u32,

    /// Failed状态自动复位时间（毫秒），不设置则只能手动复位
    pub failed_auto_reset_ms: Option<u64>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            max_consecutive_failures: 10,
            stable_after_ms: 10_000,
            stagger_step_ms: 250,
            stagger_slots: 8,
            failed_auto_reset_ms: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// 预览订阅的默认帧率
    pub default_fps: f64,

    /// 检测结果缓存有效期（毫秒）
    pub analysis_ttl_ms: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            default_fps: 30.0,
            analysis_ttl_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    /// 状态快照上报间隔（毫秒）
    pub poll_interval_ms: u64,

    /// 超过该时长没有新帧视为过期（毫秒）
    pub stale_after_ms: u64,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            stale_after_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 日志级别 (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl HubConfig {
    /// 从TOML文件加载配置
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// 从TOML文本解析配置
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: HubConfig =
            toml::from_str(text).map_err(|e| CaptureError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.capture.read_timeout_ms == 0 || self.capture.open_timeout_ms == 0 {
            return Err(CaptureError::InvalidConfig(
                "capture timeouts must be greater than zero".to_string(),
            ));
        }
        if self.capture.event_buffer == 0 {
            return Err(CaptureError::InvalidConfig(
                "capture.event_buffer must be greater than zero".to_string(),
            ));
        }
        if !(2..=31).contains(&self.capture.jpeg_quality) {
            return Err(CaptureError::InvalidConfig(format!(
                "capture.jpeg_quality must be between 2 and 31, got {}",
                self.capture.jpeg_quality
            )));
        }
        if self.reconnect.initial_backoff_ms == 0 {
            return Err(CaptureError::InvalidConfig(
                "reconnect.initial_backoff_ms must be greater than zero".to_string(),
            ));
        }
        if self.reconnect.max_backoff_ms < self.reconnect.initial_backoff_ms {
            return Err(CaptureError::InvalidConfig(format!(
                "reconnect.max_backoff_ms ({}) is below initial_backoff_ms ({})",
                self.reconnect.max_backoff_ms, self.reconnect.initial_backoff_ms
            )));
        }
        if self.reconnect.max_consecutive_failures == 0 {
            return Err(CaptureError::InvalidConfig(
                "reconnect.max_consecutive_failures must be at least 1".to_string(),
            ));
        }
        if let Err(e) = cadence_from_fps(self.streaming.default_fps) {
            return Err(CaptureError::InvalidConfig(format!(
                "streaming.default_fps: {}",
                e
            )));
        }

        let mut seen = std::collections::HashSet::new();
        for source in &self.sources {
            if source.source_id.trim().is_empty() {
                return Err(CaptureError::InvalidConfig(
                    "source_id must not be empty".to_string(),
                ));
            }
            if !seen.insert(source.source_id.as_str()) {
                return Err(CaptureError::InvalidConfig(format!(
                    "duplicate source_id: {}",
                    source.source_id
                )));
            }
        }
        Ok(())
    }

    /// 用环境变量覆盖视频源列表
    pub fn apply_env(&mut self) {
        if let Ok(value) = std::env::var(SOURCES_ENV) {
            let parsed = parse_source_list(&value);
            if !parsed.is_empty() {
                self.sources = parsed;
            }
        }
    }

    /// 没有配置任何视频源时使用默认的两路本地摄像头
    pub fn sources_or_default(&self) -> Vec<SourceDescriptor> {
        if self.sources.is_empty() {
            default_sources()
        } else {
            self.sources.clone()
        }
    }

    pub fn capture_options(&self) -> CaptureOptions {
        CaptureOptions {
            open_timeout: Duration::from_millis(self.capture.open_timeout_ms),
            read_timeout: Duration::from_millis(self.capture.read_timeout_ms),
            read_retry_limit: self.capture.read_retry_limit,
            read_retry_delay: Duration::from_millis(self.capture.read_retry_delay_ms),
            failed_auto_reset: self.reconnect.failed_auto_reset_ms.map(Duration::from_millis),
        }
    }

    pub fn ffmpeg_options(&self) -> FfmpegOptions {
        FfmpegOptions {
            program: self.capture.ffmpeg_program.clone(),
            jpeg_quality: self.capture.jpeg_quality,
            ..FfmpegOptions::default()
        }
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_millis(self.reconnect.initial_backoff_ms),
            max: Duration::from_millis(self.reconnect.max_backoff_ms),
            max_consecutive_failures: self.reconnect.max_consecutive_failures,
            stable_after: Duration::from_millis(self.reconnect.stable_after_ms),
            stagger_step: Duration::from_millis(self.reconnect.stagger_step_ms),
            stagger_slots: self.reconnect.stagger_slots,
        }
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.status.stale_after_ms)
    }

    pub fn analysis_ttl(&self) -> Duration {
        Duration::from_millis(self.streaming.analysis_ttl_ms)
    }
}

/// 采集循环运行参数
#[derive(Debug, Clone)]
pub struct CaptureOptions {
    pub open_timeout: Duration,
    pub read_timeout: Duration,
    pub read_retry_limit: u32,
    pub read_retry_delay: Duration,
    pub failed_auto_reset: Option<Duration>,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        HubConfig::default().capture_options()
    }
}

/// 解析逗号分隔的视频源列表
pub fn parse_source_list(value: &str) -> Vec<SourceDescriptor> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .enumerate()
        .map(|(index, item)| {
            let target = ConnectionTarget::parse(item);
            let source_id = match &target {
                ConnectionTarget::Device(device) => format!("cam-{}", device),
                ConnectionTarget::Uri(_) => format!("stream-{}", index),
            };
            SourceDescriptor::new(source_id, format!("Camera {}", index + 1), target)
        })
        .collect()
}

/// 默认视频源：主摄像头和外接摄像头
pub fn default_sources() -> Vec<SourceDescriptor> {
    vec![
        SourceDescriptor::new("cam-0", "Main Camera", ConnectionTarget::Device(0))
            .with_size(640, 480),
        SourceDescriptor::new("cam-1", "External Camera", ConnectionTarget::Device(1))
            .with_size(640, 480),
    ]
}
