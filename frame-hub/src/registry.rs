// 视频源注册中心 - FrameHub实现
//
// 管理所有视频源的生命周期，对外提供统一入口：
// - 注册/注销视频源（启动/停止各自的采集任务）
// - 最新帧查询和订阅
// - 状态快照和事件订阅

use common::{CaptureError, Result, SourceDescriptor, SourceState};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::Stream;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::analysis::AnalysisCache;
use crate::cache::{CachedFrame, FrameCache};
use crate::config::{CaptureOptions, HubConfig};
use crate::device::{DeviceConnector, SourceConnector};
use crate::multiplexer::{FrameStream, StreamMultiplexer};
use crate::source::{SourceEvent, SourceHandle, SourceStatus};
use crate::status::{SourceReport, StatusAggregator, StatusSummary};
use crate::supervisor::ReconnectSupervisor;

/// 已注册的视频源
struct RegisteredSource {
    descriptor: SourceDescriptor,
    generation: u64,
    status: watch::Receiver<SourceStatus>,
    handle: Mutex<SourceHandle>,
}

/// 帧中心
///
/// # 示例
///
/// ```rust,ignore
/// let hub = FrameHub::new(&config);
/// for descriptor in config.sources_or_default() {
///     hub.register(descriptor)?;
/// }
///
/// let mut preview = hub.subscribe("cam-0", Duration::from_millis(100))?;
/// while let Some(item) = preview.next().await {
///     // ...
/// }
///
/// hub.shutdown().await;
/// ```
pub struct FrameHub {
    connector: Arc<dyn SourceConnector>,
    cache: FrameCache,
    supervisor: ReconnectSupervisor,
    multiplexer: StreamMultiplexer,
    status: StatusAggregator,
    analysis: AnalysisCache,
    events: broadcast::Sender<SourceEvent>,
    options: CaptureOptions,
    sources: DashMap<String, Arc<RegisteredSource>>,
    next_generation: AtomicU64,
}

impl FrameHub {
    /// 使用默认设备连接器创建
    pub fn new(config: &HubConfig) -> Self {
        Self::with_connector(config, Arc::new(DeviceConnector::new(config.ffmpeg_options())))
    }

    /// 使用指定的连接器创建
    pub fn with_connector(config: &HubConfig, connector: Arc<dyn SourceConnector>) -> Self {
        let cache = FrameCache::new();
        let (events, _) = broadcast::channel(config.capture.event_buffer.max(1));

        Self {
            connector,
            supervisor: ReconnectSupervisor::new(config.backoff_policy()),
            multiplexer: StreamMultiplexer::new(cache.clone()),
            status: StatusAggregator::new(cache.clone(), config.stale_after()),
            analysis: AnalysisCache::new(cache.clone(), config.analysis_ttl()),
            cache,
            events,
            options: config.capture_options(),
            sources: DashMap::new(),
            next_generation: AtomicU64::new(1),
        }
    }

    /// 注册视频源并启动采集
    ///
    /// 相同描述重复注册不做任何事；同一ID不同描述返回 `DescriptorConflict`。
    /// 上一次注册的采集任务尚未退出时返回 `SourceBusy`。
    pub fn register(&self, descriptor: SourceDescriptor) -> Result<()> {
        if descriptor.source_id.trim().is_empty() {
            return Err(CaptureError::InvalidParameter(
                "source_id must not be empty".to_string(),
            ));
        }

        match self.sources.entry(descriptor.source_id.clone()) {
            Entry::Occupied(existing) => {
                if existing.get().descriptor == descriptor {
                    debug!("Source {} already registered", descriptor.source_id);
                    Ok(())
                } else {
                    Err(CaptureError::DescriptorConflict(descriptor.source_id))
                }
            }
            Entry::Vacant(vacant) => {
                let source_id = descriptor.source_id.clone();
                let mut handle = SourceHandle::new(
                    descriptor.clone(),
                    self.connector.clone(),
                    self.cache.clone(),
                    self.supervisor.backoff_for(&source_id),
                    self.options.clone(),
                    self.events.clone(),
                );
                handle.start()?;

                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                self.status.track(&source_id, generation, handle.status());
                vacant.insert(Arc::new(RegisteredSource {
                    descriptor,
                    generation,
                    status: handle.status(),
                    handle: Mutex::new(handle),
                }));

                info!("✓ Registered source {}", source_id);
                Ok(())
            }
        }
    }

    /// 注销视频源
    ///
    /// 先停止采集任务（设备释放后才继续），再移除缓存槽位、状态记录和检测结果。
    /// 正在进行的订阅随之结束。
    pub async fn deregister(&self, source_id: &str) -> Result<()> {
        let (_, registered) = self
            .sources
            .remove(source_id)
            .ok_or_else(|| CaptureError::CacheMiss(source_id.to_string()))?;

        registered.handle.lock().await.stop().await;

        if !self.cache.remove_slot(source_id) {
            debug!("Cache slot for {} was taken over by a new registration", source_id);
        }
        self.status.untrack(source_id, registered.generation);
        self.analysis.forget(source_id);

        info!("Deregistered source {}", source_id);
        Ok(())
    }

    /// 复位Failed状态的视频源
    ///
    /// # 返回
    ///
    /// - `Ok(true)`: 已复位
    /// - `Ok(false)`: 视频源不在Failed状态
    pub async fn reset(&self, source_id: &str) -> Result<bool> {
        let registered = self.registered(source_id)?;
        let handle = registered.handle.lock().await;
        Ok(handle.reset())
    }

    pub fn state(&self, source_id: &str) -> Option<SourceState> {
        let registered = self.sources.get(source_id)?;
        let state = registered.status.borrow().state;
        Some(state)
    }

    /// 最新帧，未注册或还没有帧时为 `None`
    pub fn latest(&self, source_id: &str) -> Option<Arc<CachedFrame>> {
        self.cache.latest(source_id)
    }

    pub fn subscribe(&self, source_id: &str, cadence: Duration) -> Result<FrameStream> {
        self.multiplexer.subscribe(source_id, cadence)
    }

    pub fn snapshot(&self) -> BTreeMap<String, SourceReport> {
        self.status.snapshot()
    }

    pub fn summary(&self) -> StatusSummary {
        self.status.summary()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SourceEvent> {
        self.events.subscribe()
    }

    /// 事件流，消费过慢时跳过积压的事件
    pub fn event_stream(&self) -> impl Stream<Item = SourceEvent> + Send {
        BroadcastStream::new(self.events.subscribe()).filter_map(|result| match result {
            Ok(event) => Some(event),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!("Event consumer lagged, skipped {} events", skipped);
                None
            }
        })
    }

    /// 已注册的视频源ID（已排序）
    pub fn source_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sources.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn descriptor(&self, source_id: &str) -> Option<SourceDescriptor> {
        self.sources
            .get(source_id)
            .map(|entry| entry.value().descriptor.clone())
    }

    pub fn cache(&self) -> &FrameCache {
        &self.cache
    }

    pub fn multiplexer(&self) -> &StreamMultiplexer {
        &self.multiplexer
    }

    pub fn status(&self) -> &StatusAggregator {
        &self.status
    }

    pub fn analysis(&self) -> &AnalysisCache {
        &self.analysis
    }

    /// 注销所有视频源
    pub async fn shutdown(&self) {
        let ids = self.source_ids();
        info!("Shutting down {} sources", ids.len());

        let stops = ids.iter().map(|id| self.deregister(id));
        for (id, result) in ids.iter().zip(futures::future::join_all(stops).await) {
            if let Err(e) = result {
                warn!("Failed to deregister {} during shutdown: {}", id, e);
            }
        }
    }

    fn registered(&self, source_id: &str) -> Result<Arc<RegisteredSource>> {
        self.sources
            .get(source_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| CaptureError::CacheMiss(source_id.to_string()))
    }
}
