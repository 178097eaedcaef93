//! 引擎配置
//!
//! 各组件的配置均为带文档化默认值的普通结构体，通过 builder 的
//! `config(...)` 注入；也可由宿主从 JSON 反序列化（缺省字段取默认值，
//! 时长字段以毫秒表示）。
//!
use crate::envelope::EventPriority;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 准入控制（节流）配置
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// 关闭后所有事件直接放行（仍然计数）
    pub enabled: bool,
    /// 每秒上限
    pub max_per_second: u32,
    /// 每分钟上限
    pub max_per_minute: u32,
    /// 不受上限约束的优先级
    pub bypass: Vec<EventPriority>,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_per_second: 100,
            max_per_minute: 1000,
            bypass: vec![EventPriority::Critical, EventPriority::High],
        }
    }
}

/// 批量写入配置
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// 关闭后每次 `add` 直接写入存储（单条批次）
    pub enabled: bool,
    /// 达到该数量立即刷写
    pub max_batch_size: usize,
    /// 首条未刷写事件到达后的最长等待
    #[serde(rename = "max_wait_ms", with = "duration_ms")]
    pub max_wait: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_batch_size: 50,
            max_wait: Duration::from_millis(1000),
        }
    }
}

/// 事件总线配置
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    pub throttle: ThrottleConfig,
    pub batch: BatchConfig,
    /// 单事件的分发并发（同一事件广播给多个订阅者）
    pub dispatch_concurrency: usize,
    /// 分发报告广播缓冲区容量
    pub report_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            throttle: ThrottleConfig::default(),
            batch: BatchConfig::default(),
            dispatch_concurrency: 8,
            report_capacity: 256,
        }
    }
}

/// 失败重试的退避策略
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryBackoff {
    /// 立即重试：失败项放回队首
    #[default]
    None,
    /// 指数退避：第 n 次重试前等待 `base * 2^(n-1)`，不超过 `max`
    Exponential {
        #[serde(rename = "base_ms", with = "duration_ms")]
        base: Duration,
        #[serde(rename = "max_ms", with = "duration_ms")]
        max: Duration,
    },
}

impl RetryBackoff {
    /// 第 `retry_count` 次重试前的等待时间
    pub fn delay_for(&self, retry_count: u32) -> Option<Duration> {
        match *self {
            RetryBackoff::None => None,
            RetryBackoff::Exponential { base, max } => {
                let exp = retry_count.saturating_sub(1).min(31);
                let delay = base.saturating_mul(1u32 << exp);
                Some(delay.min(max))
            }
        }
    }
}

/// 优先级队列配置
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// 同时处理的最大条目数
    pub max_concurrent: usize,
    /// 入队未指定时的最大重试次数
    pub default_max_retries: u32,
    pub retry_backoff: RetryBackoff,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            default_max_retries: 3,
            retry_backoff: RetryBackoff::None,
        }
    }
}

/// 规则引擎配置
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleEngineConfig {
    /// 延迟动作队列
    pub queue: QueueConfig,
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let bus = EventBusConfig::default();
        assert_eq!(bus.throttle.max_per_second, 100);
        assert_eq!(bus.throttle.max_per_minute, 1000);
        assert_eq!(bus.batch.max_batch_size, 50);
        assert_eq!(bus.batch.max_wait, Duration::from_millis(1000));
        assert_eq!(QueueConfig::default().retry_backoff, RetryBackoff::None);
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let cfg: EventBusConfig = serde_json::from_value(serde_json::json!({
            "batch": { "max_batch_size": 3, "max_wait_ms": 250 },
            "throttle": { "bypass": ["critical"] }
        }))
        .unwrap();
        assert_eq!(cfg.batch.max_batch_size, 3);
        assert_eq!(cfg.batch.max_wait, Duration::from_millis(250));
        assert!(cfg.batch.enabled);
        assert_eq!(cfg.throttle.bypass, vec![EventPriority::Critical]);
        assert_eq!(cfg.throttle.max_per_second, 100);
        assert_eq!(cfg.dispatch_concurrency, 8);
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let backoff = RetryBackoff::Exponential {
            base: Duration::from_millis(100),
            max: Duration::from_millis(500),
        };
        assert_eq!(backoff.delay_for(1), Some(Duration::from_millis(100)));
        assert_eq!(backoff.delay_for(2), Some(Duration::from_millis(200)));
        assert_eq!(backoff.delay_for(4), Some(Duration::from_millis(500)));
        assert_eq!(RetryBackoff::None.delay_for(3), None);

        let parsed: RetryBackoff = serde_json::from_value(serde_json::json!({
            "kind": "exponential", "base_ms": 100, "max_ms": 500
        }))
        .unwrap();
        assert_eq!(parsed, backoff);
    }
}
