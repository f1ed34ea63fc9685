// 视频源句柄 - SourceHandle实现
//
// 每个视频源一个独立的采集任务，负责打开设备、循环读帧、发布到缓存、
// 失败后按自身的退避策略重连。一个视频源的失败不会影响其他视频源。
//
// # 状态机
//
// Connecting -> Streaming -> Reconnecting -> Connecting ...
//                                  \-> Failed（连续失败达到上限，等待复位）

use chrono::{DateTime, Utc};
use common::{CaptureError, ErrorKind, ErrorRecord, Result, SourceDescriptor, SourceState};
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::{FrameCache, FramePublisher};
use crate::config::CaptureOptions;
use crate::device::{FrameReader, SourceConnector};
use crate::supervisor::{BackoffDecision, SourceBackoff};

/// 视频源事件
#[derive(Debug, Clone, Serialize)]
pub struct SourceEvent {
    pub source_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: SourceEventKind,
}

/// 视频源事件类型
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SourceEventKind {
    /// 状态变化
    StateChanged { state: SourceState },
    /// 打开或读取失败
    Failure { kind: ErrorKind, message: String },
    /// 已安排重连
    BackoffScheduled { attempt: u32, delay: Duration },
}

/// 视频源的当前状态记录
///
/// 只由所属的采集任务写入。
#[derive(Debug, Clone)]
pub struct SourceStatus {
    pub source_id: String,
    pub display_name: String,
    pub state: SourceState,
    /// 进入当前状态的时间
    pub state_since: Instant,
    pub last_error: Option<ErrorRecord>,
    pub consecutive_failures: u32,
    pub last_update_time: DateTime<Utc>,
}

impl SourceStatus {
    pub(crate) fn new(descriptor: &SourceDescriptor) -> Self {
        Self {
            source_id: descriptor.source_id.clone(),
            display_name: descriptor.display_name.clone(),
            state: SourceState::Connecting,
            state_since: Instant::now(),
            last_error: None,
            consecutive_failures: 0,
            last_update_time: Utc::now(),
        }
    }
}

/// 视频源句柄
///
/// 独占一个视频源。`start()` 启动后台采集任务后立即返回；
/// `stop()` 在设备释放后才返回，不能在采集任务内部调用。
///
/// # 示例
///
/// ```rust,ignore
/// let mut handle = SourceHandle::new(descriptor, connector, cache.clone(), backoff, options, events);
/// handle.start()?;
///
/// // ... 消费者通过 cache.latest() 读取帧 ...
///
/// handle.stop().await;
/// ```
pub struct SourceHandle {
    descriptor: Arc<SourceDescriptor>,
    connector: Arc<dyn SourceConnector>,
    cache: FrameCache,
    backoff: SourceBackoff,
    options: CaptureOptions,
    events: broadcast::Sender<SourceEvent>,
    status: Arc<watch::Sender<SourceStatus>>,
    reset: Arc<watch::Sender<u64>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SourceHandle {
    pub fn new(
        descriptor: SourceDescriptor,
        connector: Arc<dyn SourceConnector>,
        cache: FrameCache,
        backoff: SourceBackoff,
        options: CaptureOptions,
        events: broadcast::Sender<SourceEvent>,
    ) -> Self {
        let (status, _) = watch::channel(SourceStatus::new(&descriptor));
        let (reset, _) = watch::channel(0u64);
        Self {
            descriptor: Arc::new(descriptor),
            connector,
            cache,
            backoff,
            options,
            events,
            status: Arc::new(status),
            reset: Arc::new(reset),
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    pub fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    pub fn source_id(&self) -> &str {
        &self.descriptor.source_id
    }

    /// 启动采集任务
    ///
    /// 已在运行或该视频源已被其他采集任务占用时返回 `SourceBusy`。
    pub fn start(&mut self) -> Result<()> {
        let source_id = self.descriptor.source_id.clone();
        if self.is_running() {
            return Err(CaptureError::SourceBusy(source_id));
        }

        self.cache.insert_slot(&source_id);
        let publisher = self
            .cache
            .claim_publisher(&source_id)
            .ok_or_else(|| CaptureError::SourceBusy(source_id.clone()))?;

        self.cancel = CancellationToken::new();
        self.status.send_modify(|status| {
            status.state = SourceState::Connecting;
            status.state_since = Instant::now();
            status.consecutive_failures = 0;
            status.last_update_time = Utc::now();
        });

        let capture = CaptureLoop {
            descriptor: self.descriptor.clone(),
            connector: self.connector.clone(),
            publisher,
            backoff: self.backoff.clone(),
            options: self.options.clone(),
            events: self.events.clone(),
            status: self.status.clone(),
            reset: self.reset.subscribe(),
            cancel: self.cancel.clone(),
            frames_published: 0,
        };

        debug!("Spawning capture loop for {}", source_id);
        self.task = Some(tokio::spawn(capture.run()));
        Ok(())
    }

    /// 停止采集任务
    ///
    /// 返回时设备句柄已经释放。状态记录保留停止前的最后状态，
    /// 状态汇总中的条目只由 `FrameHub::deregister` 移除；
    /// 停止后用 `is_running()` 判断采集任务是否存活。
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!("Capture loop for {} panicked", self.descriptor.source_id);
                }
            }
        }
    }

    /// 从Failed状态复位，非Failed状态下不做任何事
    pub fn reset(&self) -> bool {
        if self.state() != SourceState::Failed {
            return false;
        }
        info!("Resetting failed source {}", self.descriptor.source_id);
        self.reset.send_modify(|generation| *generation += 1);
        true
    }

    pub fn state(&self) -> SourceState {
        self.status.borrow().state
    }

    /// 订阅状态记录
    pub fn status(&self) -> watch::Receiver<SourceStatus> {
        self.status.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.task
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for SourceHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// 一次出流的结束原因
enum StreamOutcome {
    Cancelled,
    Failed(CaptureError),
}

/// 采集任务
struct CaptureLoop {
    descriptor: Arc<SourceDescriptor>,
    connector: Arc<dyn SourceConnector>,
    publisher: FramePublisher,
    backoff: SourceBackoff,
    options: CaptureOptions,
    events: broadcast::Sender<SourceEvent>,
    status: Arc<watch::Sender<SourceStatus>>,
    reset: watch::Receiver<u64>,
    cancel: CancellationToken,
    frames_published: u64,
}

impl CaptureLoop {
    async fn run(mut self) {
        info!(
            "📷 Capture loop started for {} ({})",
            self.descriptor.source_id, self.descriptor.target
        );

        loop {
            self.set_state(SourceState::Connecting);

            let opened = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                result = self.open() => Some(result),
            };

            let mut reader = match opened {
                None => break,
                Some(Ok(reader)) => reader,
                Some(Err(message)) => {
                    self.report_failure(ErrorKind::OpenFailure, message);
                    if !self.back_off().await {
                        break;
                    }
                    continue;
                }
            };

            self.set_state(SourceState::Streaming);
            info!("✓ Source {} is streaming", self.descriptor.source_id);
            let streaming_since = Instant::now();

            let outcome = self.stream(reader.as_mut()).await;

            // 任何结束路径都先释放设备
            match AssertUnwindSafe(reader.close()).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    "Error while closing source {}: {}",
                    self.descriptor.source_id, e
                ),
                Err(panic) => warn!(
                    "Source {} panicked while closing: {}",
                    self.descriptor.source_id,
                    panic_message(panic.as_ref())
                ),
            }
            drop(reader);

            match outcome {
                StreamOutcome::Cancelled => break,
                StreamOutcome::Failed(e) => {
                    warn!(
                        "Source {} dropped out of streaming: {}",
                        self.descriptor.source_id, e
                    );
                    self.backoff.record_stream_end(streaming_since.elapsed());
                    if !self.back_off().await {
                        break;
                    }
                }
            }
        }

        info!(
            "Capture loop stopped for {} ({} frames published)",
            self.descriptor.source_id, self.frames_published
        );
    }

    /// 打开视频源，后端的错误、超时和panic都转换为失败描述
    async fn open(&self) -> std::result::Result<Box<dyn FrameReader>, String> {
        let open = AssertUnwindSafe(self.connector.open(&self.descriptor)).catch_unwind();
        match timeout(self.options.open_timeout, open).await {
            Ok(Ok(Ok(reader))) => Ok(reader),
            Ok(Ok(Err(e))) => Err(e.to_string()),
            Ok(Err(panic)) => Err(format!(
                "source backend panicked during open: {}",
                panic_message(panic.as_ref())
            )),
            Err(_) => Err(format!(
                "open timed out after {:?}",
                self.options.open_timeout
            )),
        }
    }

    /// 出流循环，直到被取消或连续读取失败超过上限
    async fn stream(&mut self, reader: &mut dyn FrameReader) -> StreamOutcome {
        let mut read_failures = 0u32;

        loop {
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                result = timeout(
                    self.options.read_timeout,
                    AssertUnwindSafe(reader.read_frame()).catch_unwind(),
                ) => Some(result),
            };

            let error = match result {
                None => return StreamOutcome::Cancelled,
                Some(Ok(Ok(Ok(frame)))) => {
                    read_failures = 0;
                    let published = self.publisher.publish(frame);
                    self.frames_published += 1;
                    if self.frames_published % 100 == 0 {
                        debug!(
                            "Source {} published sequence {} ({} bytes)",
                            self.descriptor.source_id,
                            published.sequence,
                            published.pixel_buffer.len()
                        );
                    }
                    continue;
                }
                Some(Ok(Ok(Err(e)))) => e,
                // 读取器panic后状态不可信，直接重连
                Some(Ok(Err(panic))) => {
                    let error = CaptureError::ReadFailure(format!(
                        "source backend panicked during read: {}",
                        panic_message(panic.as_ref())
                    ));
                    self.report_failure(ErrorKind::ReadFailure, error.to_string());
                    return StreamOutcome::Failed(error);
                }
                Some(Err(_)) => CaptureError::ReadTimeout(self.options.read_timeout),
            };

            read_failures += 1;
            self.report_failure(ErrorKind::ReadFailure, error.to_string());

            if !error.is_transient() || read_failures > self.options.read_retry_limit {
                return StreamOutcome::Failed(error);
            }

            let cancelled = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => true,
                _ = sleep(self.options.read_retry_delay) => false,
            };
            if cancelled {
                return StreamOutcome::Cancelled;
            }
        }
    }

    /// 进入Reconnecting并等待退避，返回false表示已被取消
    async fn back_off(&mut self) -> bool {
        let decision = self.backoff.record_failure();
        self.set_state(SourceState::Reconnecting);

        match decision {
            BackoffDecision::RetryAfter { attempt, delay } => {
                info!(
                    "Source {} reconnect attempt {} in {:?}",
                    self.descriptor.source_id, attempt, delay
                );
                self.emit(SourceEventKind::BackoffScheduled { attempt, delay });

                let cancelled = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => true,
                    _ = sleep(delay) => false,
                };
                !cancelled
            }
            BackoffDecision::GiveUp { failures } => {
                error!(
                    "❌ Source {} failed {} times in a row, giving up until reset",
                    self.descriptor.source_id, failures
                );
                // 进入Failed之前的复位请求作废
                self.reset.borrow_and_update();
                self.set_state(SourceState::Failed);
                self.wait_for_reset().await
            }
        }
    }

    /// Failed状态下等待复位，返回false表示已被取消
    async fn wait_for_reset(&mut self) -> bool {
        let auto_reset = self.options.failed_auto_reset;

        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            changed = self.reset.changed() => Some(changed.is_ok()),
            _ = sleep_or_forever(auto_reset) => Some(true),
        };

        match outcome {
            Some(true) => {
                info!("Source {} leaving failed state", self.descriptor.source_id);
                self.backoff.reset();
                true
            }
            // 句柄已丢弃，等待取消
            Some(false) => {
                self.cancel.cancelled().await;
                false
            }
            None => false,
        }
    }

    fn set_state(&self, state: SourceState) {
        let failures = self.backoff.consecutive_failures();
        self.status.send_modify(|status| {
            status.state = state;
            status.state_since = Instant::now();
            status.consecutive_failures = failures;
            status.last_update_time = Utc::now();
        });

        debug!("Source {} -> {}", self.descriptor.source_id, state);
        self.emit(SourceEventKind::StateChanged { state });
    }

    fn report_failure(&self, kind: ErrorKind, message: String) {
        warn!(
            "Source {} {}: {}",
            self.descriptor.source_id, kind, message
        );
        let record = ErrorRecord::now(kind, message.clone());
        self.status.send_modify(|status| {
            status.last_update_time = record.at;
            status.last_error = Some(record);
        });
        self.emit(SourceEventKind::Failure { kind, message });
    }

    fn emit(&self, kind: SourceEventKind) {
        // 没有订阅者时忽略
        let _ = self.events.send(SourceEvent {
            source_id: self.descriptor.source_id.clone(),
            timestamp: Utc::now(),
            kind,
        });
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn sleep_or_forever(duration: Option<Duration>) {
    match duration {
        Some(duration) => sleep(duration).await,
        None => std::future::pending::<()>().await,
    }
}
