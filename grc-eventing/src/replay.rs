//! 事件回放（ReplayManager）
//!
//! 按条件取出历史事件窗口，严格按 `created_at` 升序重新发布，
//! 并在 metadata 中写入回放标记供下游做幂等判断：
//! - `__replayed = true`
//! - `__original_id`：原事件 id
//! - `__original_timestamp`：原事件创建时间（RFC 3339）
//!
//! 单个事件发布失败（含被节流）只计入 `failed_events`，回放继续；
//! 取消在每次迭代开始前检查，被取消的回放返回部分计数而不是错误。
//! 同一个管理器同一时刻只允许一次回放。
//!
use crate::envelope::{EventEnvelope, EventPriority, NewEvent};
use crate::error::{EventingError, EventingResult as Result};
use crate::eventing::{EventBus, PublishOutcome};
use crate::store::EventQuery;
use bon::Builder;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub const REPLAYED_KEY: &str = "__replayed";
pub const ORIGINAL_ID_KEY: &str = "__original_id";
pub const ORIGINAL_TIMESTAMP_KEY: &str = "__original_timestamp";

/// 基础间隔，实际间隔为 `BASE_DELAY / speed`
const BASE_DELAY: Duration = Duration::from_millis(100);
/// 不小于该倍速时不再等待
const MAX_THROTTLED_SPEED: f64 = 10.0;

#[derive(Debug, Clone, Builder)]
pub struct ReplayConfig {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    #[builder(default)]
    pub event_types: Vec<String>,
    #[builder(default)]
    pub categories: Vec<String>,
    #[builder(default)]
    pub priorities: Vec<EventPriority>,
    #[builder(into)]
    pub source_module: Option<String>,
    pub limit: Option<usize>,
    /// 回放倍速，必须大于 0
    #[builder(default = 1.0)]
    pub speed: f64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ReplayConfig {
    fn query(&self, tenant_id: &str) -> EventQuery {
        EventQuery {
            tenant_id: tenant_id.to_string(),
            from: self.from,
            to: self.to,
            event_types: self.event_types.clone(),
            categories: self.categories.clone(),
            priorities: self.priorities.clone(),
            source_module: self.source_module.clone(),
            // 截断在排序之后进行，保证取到窗口内最早的事件
            limit: None,
        }
    }

    fn delay(&self) -> Option<Duration> {
        (self.speed < MAX_THROTTLED_SPEED).then(|| BASE_DELAY.div_f64(self.speed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayStatus {
    Running,
    Completed,
    Cancelled,
}

/// 每处理完一个事件交给进度回调的快照
#[derive(Debug, Clone, Serialize)]
pub struct ReplayProgress {
    pub total_events: usize,
    pub processed_events: usize,
    pub replayed_events: usize,
    pub failed_events: usize,
    pub current_event_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplayStats {
    pub total_events: usize,
    pub replayed_events: usize,
    pub failed_events: usize,
    pub status: ReplayStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

pub struct ReplayManager {
    bus: Arc<EventBus>,
    running: AtomicBool,
    cancel_requested: AtomicBool,
}

/// 回放结束（含提前返回）时释放运行标记
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ReplayManager {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            running: AtomicBool::new(false),
            cancel_requested: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// 请求取消当前回放，在下一次迭代开始前生效
    pub fn cancel_replay(&self) {
        if self.is_running() {
            self.cancel_requested.store(true, Ordering::Release);
        }
    }

    pub async fn start_replay<F>(&self, config: ReplayConfig, mut on_progress: F) -> Result<ReplayStats>
    where
        F: FnMut(&ReplayProgress) + Send,
    {
        if config.speed.is_nan() || config.speed <= 0.0 {
            return Err(EventingError::invalid_value(format!(
                "replay speed must be positive, got {}",
                config.speed
            )));
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(EventingError::ReplayAlreadyRunning);
        }
        let _guard = RunningGuard(&self.running);
        self.cancel_requested.store(false, Ordering::Release);

        let tenant_id = self.bus.tenant_id().to_string();
        let mut events = self.bus.store().query(&config.query(&tenant_id)).await?;
        // 稳定排序：同一时间戳保持存储返回的顺序
        events.sort_by_key(|e| e.created_at());
        if let Some(limit) = config.limit {
            events.truncate(limit);
        }

        let mut stats = ReplayStats {
            total_events: events.len(),
            replayed_events: 0,
            failed_events: 0,
            status: ReplayStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
        };
        tracing::info!(%tenant_id, total = stats.total_events, speed = config.speed, "replay started");

        let delay = config.delay();
        let last = events.len().saturating_sub(1);
        for (index, event) in events.iter().enumerate() {
            if self.cancel_requested.load(Ordering::Acquire) {
                stats.status = ReplayStatus::Cancelled;
                break;
            }

            match self.replay_one(event).await {
                Ok(()) => stats.replayed_events += 1,
                Err(err) => {
                    stats.failed_events += 1;
                    tracing::warn!(%tenant_id, error = %err, "replay item failed");
                }
            }

            on_progress(&ReplayProgress {
                total_events: stats.total_events,
                processed_events: index + 1,
                replayed_events: stats.replayed_events,
                failed_events: stats.failed_events,
                current_event_id: event.id().to_string(),
            });

            if let Some(delay) = delay {
                if index < last {
                    tokio::time::sleep(delay).await;
                }
            }
        }

        if stats.status == ReplayStatus::Running {
            stats.status = ReplayStatus::Completed;
        }
        stats.finished_at = Some(Utc::now());
        tracing::info!(
            %tenant_id,
            status = ?stats.status,
            replayed = stats.replayed_events,
            failed = stats.failed_events,
            "replay finished"
        );
        Ok(stats)
    }

    async fn replay_one(&self, event: &EventEnvelope) -> Result<()> {
        let item_error = |reason: String| EventingError::ReplayItem {
            event_id: event.id().to_string(),
            reason,
        };

        match self.bus.publish(replay_copy(event)).await {
            Ok(PublishOutcome::Published(_)) => Ok(()),
            Ok(PublishOutcome::Throttled { .. }) => Err(item_error("throttled".to_string())),
            Err(err) => Err(item_error(err.to_string())),
        }
    }
}

/// 复制原事件并写入回放标记
fn replay_copy(event: &EventEnvelope) -> NewEvent {
    let mut metadata = event.metadata().clone();
    metadata.insert(REPLAYED_KEY.to_string(), Value::Bool(true));
    metadata.insert(ORIGINAL_ID_KEY.to_string(), Value::String(event.id().to_string()));
    metadata.insert(
        ORIGINAL_TIMESTAMP_KEY.to_string(),
        Value::String(event.created_at().to_rfc3339()),
    );

    NewEvent {
        event_type: event.event_type().to_string(),
        event_category: event.event_category().to_string(),
        source_module: event.source_module().to_string(),
        entity_type: event.entity_type().map(str::to_string),
        entity_id: event.entity_id().map(str::to_string),
        priority: event.priority(),
        payload: event.payload().clone(),
        metadata,
    }
}

#[cfg(all(test, feature = "inmemory"))]
mod tests {
    use super::*;
    use crate::config::{BatchConfig, EventBusConfig, ThrottleConfig};
    use crate::store::InMemoryEventStore;
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::Mutex;

    fn historical(id: &str, minute: u32, priority: EventPriority) -> EventEnvelope {
        EventEnvelope::builder()
            .id(id)
            .tenant_id("t-1")
            .event_type("risk_assessed")
            .event_category("risk")
            .source_module("risks")
            .priority(priority)
            .payload(json!({ "seq": minute }).as_object().cloned().unwrap())
            .created_at(Utc.with_ymd_and_hms(2026, 3, 1, 9, minute, 0).unwrap())
            .build()
    }

    fn bus(store: Arc<InMemoryEventStore>, throttle: ThrottleConfig) -> Arc<EventBus> {
        Arc::new(
            EventBus::builder()
                .tenant_id("t-1")
                .store(store)
                .config(EventBusConfig {
                    throttle,
                    batch: BatchConfig {
                        enabled: false,
                        ..Default::default()
                    },
                    ..Default::default()
                })
                .build(),
        )
    }

    async fn replayed(store: &InMemoryEventStore) -> Vec<EventEnvelope> {
        store
            .events("t-1")
            .await
            .into_iter()
            .filter(|e| e.metadata().get(REPLAYED_KEY) == Some(&json!(true)))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn replays_in_created_at_order_with_markers() {
        let store = Arc::new(InMemoryEventStore::default());
        store
            .seed([
                historical("t3", 30, EventPriority::Low),
                historical("t1", 10, EventPriority::Low),
                historical("t2", 20, EventPriority::Low),
            ])
            .await;
        let manager = ReplayManager::new(bus(store.clone(), ThrottleConfig::default()));

        let progress = Mutex::new(Vec::new());
        let stats = manager
            .start_replay(ReplayConfig::default(), |p| {
                progress.lock().unwrap().push(p.current_event_id.clone())
            })
            .await
            .unwrap();

        assert_eq!(stats.status, ReplayStatus::Completed);
        assert_eq!((stats.total_events, stats.replayed_events, stats.failed_events), (3, 3, 0));
        assert_eq!(*progress.lock().unwrap(), ["t1", "t2", "t3"]);

        let copies = replayed(&store).await;
        let original_ids: Vec<&Value> = copies
            .iter()
            .map(|e| &e.metadata()[ORIGINAL_ID_KEY])
            .collect();
        assert_eq!(original_ids, [&json!("t1"), &json!("t2"), &json!("t3")]);
        assert_eq!(
            copies[0].metadata()[ORIGINAL_TIMESTAMP_KEY],
            json!("2026-03-01T09:10:00+00:00")
        );
        assert_eq!(copies[0].payload()["seq"], json!(10));
        assert!(!manager.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn limit_keeps_the_earliest_events_of_the_window() {
        let store = Arc::new(InMemoryEventStore::default());
        store
            .seed([
                historical("t3", 30, EventPriority::Low),
                historical("t1", 10, EventPriority::Low),
                historical("t2", 20, EventPriority::Low),
            ])
            .await;
        let manager = ReplayManager::new(bus(store.clone(), ThrottleConfig::default()));

        let stats = manager
            .start_replay(ReplayConfig::builder().limit(2).speed(50.0).build(), |_| {})
            .await
            .unwrap();

        assert_eq!((stats.total_events, stats.replayed_events), (2, 2));
        let original_ids: Vec<Value> = replayed(&store)
            .await
            .iter()
            .map(|e| e.metadata()[ORIGINAL_ID_KEY].clone())
            .collect();
        assert_eq!(original_ids, [json!("t1"), json!("t2")]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_returns_partial_counts() {
        let store = Arc::new(InMemoryEventStore::default());
        store
            .seed((0..5).map(|i| historical(&format!("e{i}"), i, EventPriority::Medium)))
            .await;
        let manager = Arc::new(ReplayManager::new(bus(store.clone(), ThrottleConfig::default())));

        let handle = manager.clone();
        let stats = manager
            .start_replay(ReplayConfig::builder().speed(0.5).build(), move |p| {
                if p.processed_events == 2 {
                    handle.cancel_replay();
                }
            })
            .await
            .unwrap();

        assert_eq!(stats.status, ReplayStatus::Cancelled);
        assert_eq!(stats.replayed_events, 2);
        assert!(stats.replayed_events < stats.total_events);
        assert_eq!(replayed(&store).await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_replay_is_rejected() {
        let store = Arc::new(InMemoryEventStore::default());
        store
            .seed((0..3).map(|i| historical(&format!("e{i}"), i, EventPriority::Medium)))
            .await;
        let manager = Arc::new(ReplayManager::new(bus(store, ThrottleConfig::default())));

        let first = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .start_replay(ReplayConfig::builder().speed(0.1).build(), |_| {})
                    .await
            })
        };
        while !manager.is_running() {
            tokio::task::yield_now().await;
        }

        let second = manager.start_replay(ReplayConfig::default(), |_| {}).await;
        assert_eq!(second.unwrap_err(), EventingError::ReplayAlreadyRunning);

        let stats = first.await.unwrap().unwrap();
        assert_eq!(stats.status, ReplayStatus::Completed);
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn throttled_items_count_as_failed_and_bad_speed_is_rejected() {
        let store = Arc::new(InMemoryEventStore::default());
        store
            .seed([
                historical("a", 1, EventPriority::Low),
                historical("b", 2, EventPriority::Low),
                historical("c", 3, EventPriority::Critical),
            ])
            .await;
        let throttle = ThrottleConfig {
            max_per_second: 1,
            ..Default::default()
        };
        let manager = ReplayManager::new(bus(store, throttle));

        let err = manager
            .start_replay(ReplayConfig::builder().speed(0.0).build(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, EventingError::InvalidValue { .. }));
        assert!(!manager.is_running());

        let stats = manager
            .start_replay(ReplayConfig::builder().speed(100.0).build(), |_| {})
            .await
            .unwrap();
        assert_eq!((stats.replayed_events, stats.failed_events), (2, 1));
    }

    #[tokio::test]
    async fn replay_window_honours_filters() {
        let store = Arc::new(InMemoryEventStore::default());
        store
            .seed([
                historical("old", 1, EventPriority::High),
                historical("mid", 20, EventPriority::Low),
                historical("new", 40, EventPriority::High),
            ])
            .await;
        let manager = ReplayManager::new(bus(store.clone(), ThrottleConfig::default()));

        let config = ReplayConfig::builder()
            .from(Utc.with_ymd_and_hms(2026, 3, 1, 9, 10, 0).unwrap())
            .priorities(vec![EventPriority::High])
            .speed(50.0)
            .build();
        let stats = manager.start_replay(config, |_| {}).await.unwrap();
        assert_eq!(stats.total_events, 1);
        assert_eq!(replayed(&store).await[0].metadata()[ORIGINAL_ID_KEY], json!("new"));
    }
}
