//! 准入控制（Throttler）
//!
//! 按每秒/每分钟预算决定候选事件是否继续进入持久化流程：
//! - 旁路优先级（默认 critical/high）总是放行并计数；
//! - 其余事件在任一计数达到上限时被拒绝，`throttled_count` 加一；
//! - 拒绝是静默的背压，不是错误。
//!
//! 两个窗口各自按墙钟时间独立重置（距上次重置满 1s / 60s），而不是由调度器定时清零。
//! 因此恰好跨越窗口边界的突发流量可能在很短时间内被放行两倍上限，这是已接受的行为。
//!
use crate::config::ThrottleConfig;
use crate::envelope::EventPriority;
use serde::Serialize;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

const SECOND: Duration = Duration::from_secs(1);
const MINUTE: Duration = Duration::from_secs(60);

/// 节流计数快照
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ThrottleStats {
    pub events_this_second: u32,
    pub events_this_minute: u32,
    pub throttled_count: u64,
}

struct Window {
    second_started: Instant,
    minute_started: Instant,
    stats: ThrottleStats,
}

impl Window {
    fn new(now: Instant) -> Self {
        Self {
            second_started: now,
            minute_started: now,
            stats: ThrottleStats::default(),
        }
    }

    fn roll(&mut self, now: Instant) {
        if now.duration_since(self.second_started) >= SECOND {
            self.second_started = now;
            self.stats.events_this_second = 0;
        }
        if now.duration_since(self.minute_started) >= MINUTE {
            self.minute_started = now;
            self.stats.events_this_minute = 0;
        }
    }

    fn count(&mut self) {
        self.stats.events_this_second = self.stats.events_this_second.saturating_add(1);
        self.stats.events_this_minute = self.stats.events_this_minute.saturating_add(1);
    }
}

/// 单实例计数器，只通过方法调用修改，内部以互斥锁串行化
pub struct Throttler {
    config: ThrottleConfig,
    window: Mutex<Window>,
}

impl Throttler {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            window: Mutex::new(Window::new(Instant::now())),
        }
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    /// 判断候选事件是否放行
    pub fn admit(&self, priority: EventPriority) -> bool {
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        window.roll(Instant::now());

        if !self.config.enabled || self.config.bypass.contains(&priority) {
            window.count();
            return true;
        }

        let stats = &window.stats;
        if stats.events_this_second >= self.config.max_per_second
            || stats.events_this_minute >= self.config.max_per_minute
        {
            window.stats.throttled_count += 1;
            tracing::debug!(
                %priority,
                throttled_count = window.stats.throttled_count,
                "event throttled"
            );
            return false;
        }

        window.count();
        true
    }

    pub fn stats(&self) -> ThrottleStats {
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        window.roll(Instant::now());
        window.stats
    }

    /// 清零全部计数并以当前时间重新开始两个窗口
    pub fn reset(&self) {
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        *window = Window::new(Instant::now());
    }
}

impl Default for Throttler {
    fn default() -> Self {
        Self::new(ThrottleConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn throttler(per_second: u32, per_minute: u32) -> Throttler {
        Throttler::new(ThrottleConfig {
            max_per_second: per_second,
            max_per_minute: per_minute,
            ..Default::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn bypass_priorities_always_admitted() {
        let t = throttler(1, 1);
        assert!(t.admit(EventPriority::Low));
        assert!(!t.admit(EventPriority::Low));

        for _ in 0..50 {
            assert!(t.admit(EventPriority::Critical));
            assert!(t.admit(EventPriority::High));
        }
        let stats = t.stats();
        assert_eq!(stats.events_this_second, 101);
        assert_eq!(stats.throttled_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ceiling_plus_one_is_rejected_exactly_once() {
        let t = throttler(5, 1000);
        for _ in 0..5 {
            assert!(t.admit(EventPriority::Medium));
        }
        assert!(!t.admit(EventPriority::Medium));
        assert_eq!(t.stats().throttled_count, 1);
        assert_eq!(t.stats().events_this_second, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn second_window_resets_on_wall_clock() {
        let t = throttler(2, 1000);
        assert!(t.admit(EventPriority::Low));
        assert!(t.admit(EventPriority::Low));
        assert!(!t.admit(EventPriority::Low));

        tokio::time::advance(Duration::from_millis(1000)).await;
        assert!(t.admit(EventPriority::Low));
        assert_eq!(t.stats().events_this_second, 1);
        assert_eq!(t.stats().events_this_minute, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn minute_ceiling_applies_across_seconds() {
        let t = throttler(100, 3);
        for _ in 0..3 {
            assert!(t.admit(EventPriority::Medium));
            tokio::time::advance(Duration::from_secs(2)).await;
        }
        assert!(!t.admit(EventPriority::Medium));

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(t.admit(EventPriority::Medium));
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_throttler_admits_everything() {
        let t = Throttler::new(ThrottleConfig {
            enabled: false,
            max_per_second: 1,
            ..Default::default()
        });
        for _ in 0..10 {
            assert!(t.admit(EventPriority::Low));
        }
        assert_eq!(t.stats().throttled_count, 0);
        t.reset();
        assert_eq!(t.stats(), ThrottleStats::default());
    }
}
