/// 事件总线（内存版）示例
/// 展示 发布 → 准入/批量写入 → 存储插入通知 → 订阅分发 的闭环，以及订阅者失败时的隔离
use anyhow::Result as AnyResult;
use grc_eventing::config::{BatchConfig, EventBusConfig, ThrottleConfig};
use grc_eventing::eventing::{EventBus, EventSubscriber};
use grc_eventing::store::InMemoryEventStore;
use grc_eventing::{EventEnvelope, EventPriority, NewEvent};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// 示例订阅者
// ============================================================================

struct PrintSubscriber {
    name: &'static str,
    fail_on: Option<&'static str>,
}

#[async_trait::async_trait]
impl EventSubscriber for PrintSubscriber {
    fn subscriber_name(&self) -> &str {
        self.name
    }

    async fn on_event(&self, event: &EventEnvelope) -> anyhow::Result<()> {
        if self.fail_on == Some(event.event_type()) {
            anyhow::bail!("{} failed on {}", self.name, event.event_type());
        }
        println!(
            "subscriber={} type={} entity={:?} payload={:?}",
            self.name,
            event.event_type(),
            event.entity_id(),
            event.payload()
        );
        Ok(())
    }
}

fn policy_event(ty: &str, id: &str, priority: EventPriority) -> NewEvent {
    NewEvent::builder()
        .event_type(ty)
        .event_category("policy")
        .source_module("policies")
        .entity_type("policy")
        .entity_id(id)
        .priority(priority)
        .payload(json!({ "title": format!("Policy {id}") }).as_object().cloned().unwrap_or_default())
        .build()
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> AnyResult<()> {
    tracing_subscriber::fmt().init();
    println!("=== 事件总线（内存版）示例 ===\n");

    let store = Arc::new(InMemoryEventStore::default());
    let bus = EventBus::builder()
        .tenant_id("tenant-demo")
        .store(store.clone())
        .config(EventBusConfig {
            throttle: ThrottleConfig {
                max_per_second: 3,
                ..Default::default()
            },
            batch: BatchConfig {
                max_batch_size: 10,
                max_wait: Duration::from_millis(50),
                ..Default::default()
            },
            ..Default::default()
        })
        .build();

    bus.subscribe(
        ["policy:*"],
        Arc::new(PrintSubscriber {
            name: "policy-index",
            fail_on: None,
        }),
    )
    .await?;
    bus.subscribe(
        ["policy_retired"],
        Arc::new(PrintSubscriber {
            name: "flaky-mailer",
            fail_on: Some("policy_retired"),
        }),
    )
    .await?;
    let mut reports = bus.dispatched();

    // 低优先级事件每秒最多 3 条，第 4、5 条被节流；critical 旁路
    let mut batch: Vec<NewEvent> = (1..=5)
        .map(|i| policy_event("policy_created", &format!("P-{i}"), EventPriority::Low))
        .collect();
    batch.push(policy_event("policy_retired", "P-0", EventPriority::Critical));

    let mut expected = 0;
    for outcome in bus.publish_many(batch).await {
        match outcome? {
            out if out.is_throttled() => println!("throttled: {out:?}"),
            _ => expected += 1,
        }
    }

    for _ in 0..expected {
        let report = tokio::time::timeout(Duration::from_secs(2), reports.recv()).await??;
        println!(
            "dispatched {} ({}): matched={} delivered={} failed={}",
            report.event_type, report.event_id, report.matched, report.delivered, report.failed
        );
    }

    println!("\nthrottle stats: {:?}", bus.throttle_stats());
    println!("batch stats:    {:?}", bus.batch_stats());
    for event in store.events("tenant-demo").await {
        println!("stored {} {} status={}", event.id(), event.event_type(), event.status());
    }

    bus.shutdown().await;
    Ok(())
}
