// 多源帧缓存 - FrameCache实现
//
// 每个视频源对应一个槽位，槽位中保存最近一次发布的不可变帧和单调递增的序号。
//
// # 特性
//
// - 发布是一次引用替换（watch通道内部的短临界区），与读者数量无关
// - 读者拿到的是 `Arc<CachedFrame>`，持有旧帧的读者不受后续发布影响
// - 同一槽位同一时刻只允许一个发布者（对应唯一的采集循环）
// - 源被移除后保留其序号水位，重新注册时序号继续递增，不会复用

use bytes::Bytes;
use chrono::{DateTime, Utc};
use common::RawFrame;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

/// 已发布的帧
///
/// 发布后不可修改；新帧通过替换引用的方式覆盖旧帧。
#[derive(Debug, Clone)]
pub struct CachedFrame {
    /// 视频源ID
    pub source_id: Arc<str>,
    /// 序号（从0开始，同一视频源内严格递增）
    pub sequence: u64,
    /// 采集时间（单调时钟）
    pub captured_at: Instant,
    /// 采集时间（墙上时钟，用于上报）
    pub captured_wall: DateTime<Utc>,
    /// 图像数据（编码后或原始像素，对缓存不透明）
    pub pixel_buffer: Bytes,
    /// 宽度
    pub width: Option<u32>,
    /// 高度
    pub height: Option<u32>,
}

impl CachedFrame {
    /// 帧的存在时长
    pub fn age(&self) -> Duration {
        self.captured_at.elapsed()
    }
}

pub(crate) type FrameReceiver = watch::Receiver<Option<Arc<CachedFrame>>>;

/// 单个视频源的缓存槽位
struct FrameSlot {
    source_id: Arc<str>,
    frames: watch::Sender<Option<Arc<CachedFrame>>>,
    next_sequence: AtomicU64,
    claimed: AtomicBool,
    subscribers: Arc<AtomicUsize>,
}

impl FrameSlot {
    fn new(source_id: &str, first_sequence: u64) -> Self {
        let (frames, _) = watch::channel(None);
        Self {
            source_id: Arc::from(source_id),
            frames,
            next_sequence: AtomicU64::new(first_sequence),
            claimed: AtomicBool::new(false),
            subscribers: Arc::new(AtomicUsize::new(0)),
        }
    }
}

/// 多源最新帧缓存
///
/// 唯一一个被采集循环与消费者共享的可变结构。不同视频源之间没有共享锁。
///
/// # 示例
///
/// ```rust,ignore
/// let cache = FrameCache::new();
///
/// // 检测协作方每个推理周期读取一次
/// match cache.latest("cam-0") {
///     Some(frame) => run_inference(&frame),
///     None => skip_cycle(),
/// }
/// ```
#[derive(Clone, Default)]
pub struct FrameCache {
    slots: Arc<DashMap<String, Arc<FrameSlot>>>,
    /// 已移除视频源的下一个序号
    retired: Arc<DashMap<String, u64>>,
}

impl FrameCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为视频源创建空槽位，已存在时返回false
    pub(crate) fn insert_slot(&self, source_id: &str) -> bool {
        match self.slots.entry(source_id.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                let first_sequence = self
                    .retired
                    .remove(source_id)
                    .map(|(_, next)| next)
                    .unwrap_or(0);
                debug!(
                    "Creating cache slot for {} (first sequence {})",
                    source_id, first_sequence
                );
                vacant.insert(Arc::new(FrameSlot::new(source_id, first_sequence)));
                true
            }
        }
    }

    /// 移除槽位
    ///
    /// 仍有发布者持有的槽位不会被移除（说明新的采集循环已经接管）。
    pub(crate) fn remove_slot(&self, source_id: &str) -> bool {
        let removed = self
            .slots
            .remove_if(source_id, |_, slot| !slot.claimed.load(Ordering::Acquire));

        match removed {
            Some((id, slot)) => {
                let next = slot.next_sequence.load(Ordering::Acquire);
                self.retired.insert(id, next);
                debug!("Removed cache slot for {} (next sequence {})", source_id, next);
                true
            }
            None => false,
        }
    }

    /// 获取视频源的发布权
    ///
    /// 每个槽位同一时刻只有一个发布者，发布者被丢弃后释放。
    pub fn claim_publisher(&self, source_id: &str) -> Option<FramePublisher> {
        let slot = self.slots.get(source_id)?.value().clone();
        slot.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(FramePublisher { slot })
    }

    /// 获取最新帧
    ///
    /// 非阻塞。视频源从未发布过帧、未注册或已移除时返回 `None`。
    pub fn latest(&self, source_id: &str) -> Option<Arc<CachedFrame>> {
        let slot = self.slots.get(source_id)?;
        let frame = slot.frames.borrow().clone();
        frame
    }

    /// 最新帧的序号
    pub fn last_sequence(&self, source_id: &str) -> Option<u64> {
        self.latest(source_id).map(|frame| frame.sequence)
    }

    /// 是否存在该视频源的槽位
    pub fn contains(&self, source_id: &str) -> bool {
        self.slots.contains_key(source_id)
    }

    /// 所有视频源ID（已排序）
    pub fn source_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.slots.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    /// 当前订阅者数量
    pub fn subscriber_count(&self, source_id: &str) -> usize {
        self.slots
            .get(source_id)
            .map(|slot| slot.subscribers.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// 订阅槽位的变更通知
    pub(crate) fn watch(&self, source_id: &str) -> Option<(FrameReceiver, SubscriberGuard)> {
        let slot = self.slots.get(source_id)?;
        let receiver = slot.frames.subscribe();
        let guard = SubscriberGuard::new(slot.subscribers.clone());
        Some((receiver, guard))
    }
}

/// 视频源的发布权
///
/// 由拥有该视频源的采集循环持有。
pub struct FramePublisher {
    slot: Arc<FrameSlot>,
}

impl FramePublisher {
    pub fn source_id(&self) -> &str {
        &self.slot.source_id
    }

    /// 发布新帧
    ///
    /// 分配下一个序号并替换槽位中的引用，返回已发布的帧。
    pub fn publish(&self, frame: RawFrame) -> Arc<CachedFrame> {
        let sequence = self.slot.next_sequence.fetch_add(1, Ordering::AcqRel);
        let cached = Arc::new(CachedFrame {
            source_id: self.slot.source_id.clone(),
            sequence,
            captured_at: Instant::now(),
            captured_wall: Utc::now(),
            pixel_buffer: frame.pixel_buffer,
            width: frame.width,
            height: frame.height,
        });

        // 没有订阅者时 send 会失败，send_replace 总是写入
        self.slot.frames.send_replace(Some(cached.clone()));
        cached
    }
}

impl Drop for FramePublisher {
    fn drop(&mut self) {
        self.slot.claimed.store(false, Ordering::Release);
    }
}

/// 订阅计数守卫
pub(crate) struct SubscriberGuard {
    counter: Arc<AtomicUsize>,
}

impl SubscriberGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self { counter }
    }
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}
