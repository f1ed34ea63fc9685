use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Failed to open source: {0}")]
    OpenFailure(String),

    #[error("Frame read failed: {0}")]
    ReadFailure(String),

    #[error("Frame read timed out after {0:?}")]
    ReadTimeout(Duration),

    #[error("Source is stale: {0}")]
    StaleSource(String),

    #[error("Source not found: {0}")]
    CacheMiss(String),

    #[error("Source {0} already registered with a different descriptor")]
    DescriptorConflict(String),

    #[error("Source {0} already has a live capture loop")]
    SourceBusy(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Analysis failed: {0}")]
    Analysis(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CaptureError {
    /// 对外上报的错误分类，注册/配置类错误没有对应分类
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            CaptureError::OpenFailure(_) => Some(ErrorKind::OpenFailure),
            CaptureError::ReadFailure(_)
            | CaptureError::ReadTimeout(_)
            | CaptureError::Io(_) => Some(ErrorKind::ReadFailure),
            CaptureError::StaleSource(_) => Some(ErrorKind::StaleSource),
            CaptureError::CacheMiss(_) => Some(ErrorKind::CacheMiss),
            _ => None,
        }
    }

    /// 是否可以在采集循环内原地重试
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CaptureError::ReadFailure(_) | CaptureError::ReadTimeout(_) | CaptureError::Io(_)
        )
    }
}

/// 错误分类
///
/// `SubscriberCancelled` 不是错误，仅用于记录订阅的正常结束。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    OpenFailure,
    ReadFailure,
    StaleSource,
    CacheMiss,
    SubscriberCancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::OpenFailure => "open_failure",
            ErrorKind::ReadFailure => "read_failure",
            ErrorKind::StaleSource => "stale_source",
            ErrorKind::CacheMiss => "cache_miss",
            ErrorKind::SubscriberCancelled => "subscriber_cancelled",
        };
        f.write_str(label)
    }
}

pub type Result<T> = std::result::Result<T, CaptureError>;
