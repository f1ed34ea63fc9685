// 多路订阅 - StreamMultiplexer实现
//
// 每个订阅者按自己的节奏从帧缓存拉取最新帧，订阅之间互不影响：
// - 到达节奏间隔后，若有比上次更新的帧就立即交付，否则等待该视频源的变更通知
// - 视频源还没有帧时交付占位项，下一个节奏点再试
// - 丢弃流即取消订阅，视频源被移除时流结束

use async_stream::stream;
use common::{CaptureError, ErrorKind, Result};
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tracing::debug;
use uuid::Uuid;

use crate::cache::{CachedFrame, FrameCache};

/// 订阅流中的一项
#[derive(Debug, Clone)]
pub enum StreamItem {
    /// 最新帧（与缓存中的是同一个引用）
    Frame(Arc<CachedFrame>),
    /// 视频源暂时没有可用帧
    Placeholder { source_id: Arc<str> },
}

impl StreamItem {
    pub fn frame(&self) -> Option<&Arc<CachedFrame>> {
        match self {
            StreamItem::Frame(frame) => Some(frame),
            StreamItem::Placeholder { .. } => None,
        }
    }

    pub fn sequence(&self) -> Option<u64> {
        self.frame().map(|frame| frame.sequence)
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, StreamItem::Placeholder { .. })
    }
}

/// 允许的最大交付间隔
pub const MAX_CADENCE: Duration = Duration::from_secs(3600);

/// 将帧率换算为交付间隔
///
/// 换算结果必须落在 (0, `MAX_CADENCE`] 内，否则返回 `InvalidParameter`。
pub fn cadence_from_fps(fps: f64) -> Result<Duration> {
    if !fps.is_finite() || fps <= 0.0 {
        return Err(CaptureError::InvalidParameter(format!(
            "fps must be positive, got {}",
            fps
        )));
    }
    let cadence = Duration::try_from_secs_f64(1.0 / fps)
        .map_err(|_| CaptureError::InvalidParameter(format!("fps {} is too low", fps)))?;
    check_cadence(cadence)?;
    Ok(cadence)
}

fn check_cadence(cadence: Duration) -> Result<()> {
    if cadence.is_zero() {
        return Err(CaptureError::InvalidParameter(
            "subscription cadence must be greater than zero".to_string(),
        ));
    }
    if cadence > MAX_CADENCE {
        return Err(CaptureError::InvalidParameter(format!(
            "subscription cadence {:?} exceeds {:?}",
            cadence, MAX_CADENCE
        )));
    }
    Ok(())
}

/// 订阅流
///
/// 由消费者所在的任务驱动，丢弃即取消。
pub struct FrameStream {
    id: Uuid,
    source_id: Arc<str>,
    cadence: Duration,
    inner: Pin<Box<dyn Stream<Item = StreamItem> + Send>>,
    finished: bool,
}

impl FrameStream {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn cadence(&self) -> Duration {
        self.cadence
    }
}

impl Stream for FrameStream {
    type Item = StreamItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StreamItem>> {
        let item = futures::ready!(self.inner.poll_next_unpin(cx));
        if item.is_none() && !self.finished {
            self.finished = true;
            debug!(
                "Subscription {} ended: source {} was removed",
                self.id, self.source_id
            );
        }
        Poll::Ready(item)
    }
}

impl Drop for FrameStream {
    fn drop(&mut self) {
        if !self.finished {
            debug!(
                "Subscription {} on {} closed ({})",
                self.id,
                self.source_id,
                ErrorKind::SubscriberCancelled
            );
        }
    }
}

/// 订阅管理器
#[derive(Clone)]
pub struct StreamMultiplexer {
    cache: FrameCache,
}

impl StreamMultiplexer {
    pub fn new(cache: FrameCache) -> Self {
        Self { cache }
    }

    /// 订阅视频源
    ///
    /// # 参数
    ///
    /// - `source_id`: 视频源ID
    /// - `cadence`: 两次交付之间的最小间隔
    ///
    /// # 返回
    ///
    /// - `Ok(stream)`: 订阅流
    /// - `Err(CacheMiss)`: 视频源未注册
    /// - `Err(InvalidParameter)`: 间隔为零或超过 `MAX_CADENCE`
    pub fn subscribe(&self, source_id: &str, cadence: Duration) -> Result<FrameStream> {
        check_cadence(cadence)?;

        let (mut frames, guard) = self
            .cache
            .watch(source_id)
            .ok_or_else(|| CaptureError::CacheMiss(source_id.to_string()))?;

        let id = Uuid::new_v4();
        let source: Arc<str> = Arc::from(source_id);
        debug!(
            "Subscription {} opened on {} every {:?}",
            id, source_id, cadence
        );

        let placeholder_source = source.clone();
        let inner = stream! {
            let _guard = guard;
            let mut last_seen: Option<u64> = None;
            let mut next_due = Instant::now();

            loop {
                sleep_until(next_due).await;

                let current = frames.borrow_and_update().clone();
                match current {
                    Some(frame) if last_seen.map_or(true, |seen| frame.sequence > seen) => {
                        last_seen = Some(frame.sequence);
                        next_due = Instant::now() + cadence;
                        yield StreamItem::Frame(frame);
                    }
                    Some(_) => {
                        // 没有新帧，等待发布或视频源移除
                        if frames.changed().await.is_err() {
                            break;
                        }
                    }
                    None => {
                        if frames.has_changed().is_err() {
                            break;
                        }
                        next_due = Instant::now() + cadence;
                        yield StreamItem::Placeholder {
                            source_id: placeholder_source.clone(),
                        };
                    }
                }
            }
        };

        Ok(FrameStream {
            id,
            source_id: source,
            cadence,
            inner: Box::pin(inner),
            finished: false,
        })
    }

    /// 按帧率订阅
    pub fn subscribe_fps(&self, source_id: &str, fps: f64) -> Result<FrameStream> {
        self.subscribe(source_id, cadence_from_fps(fps)?)
    }

    /// 视频源当前的订阅者数量
    pub fn subscriber_count(&self, source_id: &str) -> usize {
        self.cache.subscriber_count(source_id)
    }
}
