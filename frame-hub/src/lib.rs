// 多源视频帧中心
//
// 从多个本地或网络视频源持续采集帧，缓存每个视频源的最新帧，
// 供检测协作方轮询读取，并按各自节奏分发给任意数量的预览订阅者。

pub mod analysis;
pub mod cache;
pub mod config;
pub mod device;
pub mod multiplexer;
pub mod registry;
pub mod source;
pub mod status;
pub mod supervisor;

pub use analysis::{
    AnalysisCache, AnalysisOutput, AnalysisResult, Annotation, FrameAnalyzer, FrameStatsAnalyzer,
};
pub use cache::{CachedFrame, FrameCache, FramePublisher};
pub use config::{CaptureOptions, HubConfig};
pub use device::{DeviceConnector, FrameReader, SourceConnector};
pub use multiplexer::{cadence_from_fps, FrameStream, StreamItem, StreamMultiplexer, MAX_CADENCE};
pub use registry::FrameHub;
pub use source::{SourceEvent, SourceEventKind, SourceHandle, SourceStatus};
pub use status::{SourceReport, StatusAggregator, StatusSummary};
pub use supervisor::{BackoffDecision, BackoffPolicy, ReconnectSupervisor, SourceBackoff};

pub use common::{
    CaptureError, ConnectionTarget, ErrorKind, ErrorRecord, RawFrame, Result, SourceDescriptor,
    SourceState,
};
