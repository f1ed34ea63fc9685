// 状态汇总 - StatusAggregator实现
//
// 只读取各视频源的状态记录（watch）和帧缓存，不持有采集循环会等待的任何锁。

use chrono::{DateTime, Utc};
use common::{ErrorKind, ErrorRecord, SourceState};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::watch;

use crate::cache::FrameCache;
use crate::source::SourceStatus;

/// 单个视频源的状态报告
#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub display_name: String,
    pub state: SourceState,
    pub last_sequence: Option<u64>,
    pub last_error: Option<ErrorRecord>,
    pub last_update_time: DateTime<Utc>,
    pub consecutive_failures: u32,
    pub active_subscribers: usize,
    /// 出流中但长时间没有新帧
    pub stale: bool,
}

/// 汇总计数
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusSummary {
    pub total: usize,
    pub streaming: usize,
    pub reconnecting: usize,
    pub failed: usize,
    pub stale: usize,
}

struct TrackedSource {
    generation: u64,
    status: watch::Receiver<SourceStatus>,
}

/// 状态汇总器
pub struct StatusAggregator {
    cache: FrameCache,
    sources: DashMap<String, TrackedSource>,
    stale_after: Duration,
}

impl StatusAggregator {
    pub fn new(cache: FrameCache, stale_after: Duration) -> Self {
        Self {
            cache,
            sources: DashMap::new(),
            stale_after,
        }
    }

    /// 开始跟踪视频源
    ///
    /// # 参数
    ///
    /// - `generation`: 注册代次，用于避免旧的注销操作误删新注册的记录
    pub fn track(&self, source_id: &str, generation: u64, status: watch::Receiver<SourceStatus>) {
        self.sources.insert(
            source_id.to_string(),
            TrackedSource { generation, status },
        );
    }

    /// 停止跟踪视频源，代次不匹配时不做任何事
    pub fn untrack(&self, source_id: &str, generation: u64) -> bool {
        self.sources
            .remove_if(source_id, |_, tracked| tracked.generation == generation)
            .is_some()
    }

    /// 所有视频源的状态快照
    pub fn snapshot(&self) -> BTreeMap<String, SourceReport> {
        // 先复制状态记录，避免在构建报告时持有分片锁
        let statuses: Vec<SourceStatus> = self
            .sources
            .iter()
            .map(|entry| entry.value().status.borrow().clone())
            .collect();

        statuses
            .into_iter()
            .map(|status| (status.source_id.clone(), self.report(&status)))
            .collect()
    }

    /// 单个视频源的状态报告
    pub fn source(&self, source_id: &str) -> Option<SourceReport> {
        let status = self.sources.get(source_id)?.status.borrow().clone();
        Some(self.report(&status))
    }

    pub fn summary(&self) -> StatusSummary {
        let mut summary = StatusSummary::default();
        for report in self.snapshot().values() {
            summary.total += 1;
            match report.state {
                SourceState::Streaming => summary.streaming += 1,
                SourceState::Reconnecting => summary.reconnecting += 1,
                SourceState::Failed => summary.failed += 1,
                SourceState::Connecting => {}
            }
            if report.stale {
                summary.stale += 1;
            }
        }
        summary
    }

    fn report(&self, status: &SourceStatus) -> SourceReport {
        let latest = self.cache.latest(&status.source_id);

        let mut last_update_time = status.last_update_time;
        if let Some(frame) = &latest {
            last_update_time = last_update_time.max(frame.captured_wall);
        }

        let mut last_error = status.last_error.clone();
        let mut stale = false;
        if status.state == SourceState::Streaming {
            // 以本次出流开始后的最新帧为准
            let reference = latest
                .as_ref()
                .map(|frame| frame.captured_at.max(status.state_since))
                .unwrap_or(status.state_since);
            let idle = reference.elapsed();
            if idle > self.stale_after {
                stale = true;
                last_error = Some(ErrorRecord::now(
                    ErrorKind::StaleSource,
                    format!("no new frame for {} ms", idle.as_millis()),
                ));
            }
        }

        SourceReport {
            display_name: status.display_name.clone(),
            state: status.state,
            last_sequence: latest.as_ref().map(|frame| frame.sequence),
            last_error,
            last_update_time,
            consecutive_failures: status.consecutive_failures,
            active_subscribers: self.cache.subscriber_count(&status.source_id),
            stale,
        }
    }
}
