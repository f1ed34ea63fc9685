// 重连退避策略 - ReconnectSupervisor实现
//
// 每个视频源独立计算退避时间，互不等待。
//
// # 策略
//
// - 指数退避：initial * 2^attempt，封顶 max
// - 连续出流超过 stable_after 后重置为初始退避
// - 不同视频源分配不同的错峰偏移，避免同时重连占满共享资源（USB总线、出口带宽）
// - 连续失败达到上限后放弃自动重试（Failed），等待外部复位

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::debug;

/// 退避策略配置
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// 初始退避
    pub initial: Duration,
    /// 退避上限
    pub max: Duration,
    /// 连续失败上限
    pub max_consecutive_failures: u32,
    /// 持续出流多久视为恢复稳定
    pub stable_after: Duration,
    /// 错峰步长
    pub stagger_step: Duration,
    /// 错峰槽位数量
    pub stagger_slots: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            max_consecutive_failures: 10,
            stable_after: Duration::from_secs(10),
            stagger_step: Duration::from_millis(250),
            stagger_slots: 8,
        }
    }
}

impl BackoffPolicy {
    /// 计算第 `attempt` 次重试（从0开始）的退避时间，不含错峰偏移
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        // 2^31 已远超任何合理的上限
        let multiplier = 2u32.saturating_pow(attempt.min(31));
        self.initial
            .checked_mul(multiplier)
            .unwrap_or(self.max)
            .min(self.max)
    }

    /// 第 `slot` 个槽位的错峰偏移
    pub fn stagger_offset(&self, slot: u32) -> Duration {
        if self.stagger_slots == 0 {
            return Duration::ZERO;
        }
        self.stagger_step * (slot % self.stagger_slots)
    }
}

/// 一次失败后的处理决定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffDecision {
    /// 等待后重试
    RetryAfter {
        /// 第几次重试（从1开始）
        attempt: u32,
        delay: Duration,
    },
    /// 放弃自动重试
    GiveUp { failures: u32 },
}

/// 重连调度器
///
/// 只负责分配错峰槽位，不持有任何在重连过程中需要等待的锁。
#[derive(Debug, Default)]
pub struct ReconnectSupervisor {
    policy: BackoffPolicy,
    next_slot: AtomicU32,
}

impl ReconnectSupervisor {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            next_slot: AtomicU32::new(0),
        }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// 为新注册的视频源创建退避状态
    pub fn backoff_for(&self, source_id: &str) -> SourceBackoff {
        let slot = self.next_slot.fetch_add(1, Ordering::Relaxed);
        let stagger = self.policy.stagger_offset(slot);
        debug!(
            "Assigned reconnect slot {} (stagger {:?}) to {}",
            slot, stagger, source_id
        );
        SourceBackoff::new(self.policy.clone(), stagger)
    }
}

/// 单个视频源的退避状态
///
/// 由该视频源的采集循环独占。
#[derive(Debug, Clone)]
pub struct SourceBackoff {
    policy: BackoffPolicy,
    stagger: Duration,
    consecutive_failures: u32,
}

impl SourceBackoff {
    pub fn new(policy: BackoffPolicy, stagger: Duration) -> Self {
        Self {
            policy,
            stagger,
            consecutive_failures: 0,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn stagger(&self) -> Duration {
        self.stagger
    }

    /// 记录一次失败（打开失败或出流中断）
    pub fn record_failure(&mut self) -> BackoffDecision {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        if self.consecutive_failures >= self.policy.max_consecutive_failures {
            return BackoffDecision::GiveUp {
                failures: self.consecutive_failures,
            };
        }

        let attempt = self.consecutive_failures;
        let delay = self.policy.calculate_delay(attempt - 1) + self.stagger;
        BackoffDecision::RetryAfter { attempt, delay }
    }

    /// 出流结束时调用，持续时间足够长则重置退避
    pub fn record_stream_end(&mut self, streamed_for: Duration) {
        if streamed_for >= self.policy.stable_after {
            self.reset();
        }
    }

    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
    }
}
