use async_trait::async_trait;
use chrono::Utc;
use grc_eventing::config::{BatchConfig, EventBusConfig, QueueConfig, RetryBackoff, RuleEngineConfig};
use grc_eventing::eventing::{EventBus, EventSubscriber};
use grc_eventing::replay::{ReplayConfig, ReplayManager};
use grc_eventing::rules::{ActionContext, ActionExecutor, RuleEngine};
use grc_eventing::search::{SearchFilters, SearchOptions, SortKey, search, summarize};
use grc_eventing::store::{EventQuery, EventStore, InMemoryEventStore};
use grc_eventing::{EventEnvelope, EventPriority, NewEvent};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const TENANT: &str = "acme-corp";

/// 规则以 JSON 形式维护，启动时整体装入
const RULES: &str = r#"[
  {
    "id": "escalate-critical-risk",
    "name": "Escalate critical risks to the CISO",
    "trigger_event_types": ["risk_assessed"],
    "conditions": {
      "type": "and",
      "rules": [
        { "type": "leaf", "field": "score", "operator": "gte", "value": 80 },
        { "type": "leaf", "field": "payload.status", "operator": "not_equals", "value": "accepted" }
      ]
    },
    "actions": [
      { "action_type": "notify", "config": { "to": "ciso@acme.test" } },
      { "action_type": "open_ticket", "config": { "queue": "risk" } }
    ],
    "priority": 10
  },
  {
    "id": "log-every-assessment",
    "name": "Record every assessment",
    "trigger_event_types": ["risk_assessed", "control_tested"],
    "actions": [{ "action_type": "notify", "config": { "to": "grc-log" } }],
    "execution_mode": "deferred"
  }
]"#;

struct Notifier;

#[async_trait]
impl ActionExecutor for Notifier {
    fn action_type(&self) -> &str {
        "notify"
    }

    async fn execute(&self, ctx: ActionContext<'_>) -> anyhow::Result<()> {
        tracing::info!(
            rule = %ctx.rule.id,
            event = %ctx.event.event_type(),
            to = %ctx.config["to"],
            "notification sent"
        );
        Ok(())
    }
}

/// 工单系统偶发失败，用于观察失败隔离
#[derive(Default)]
struct Ticketing {
    calls: AtomicUsize,
}

#[async_trait]
impl ActionExecutor for Ticketing {
    fn action_type(&self) -> &str {
        "open_ticket"
    }

    async fn execute(&self, ctx: ActionContext<'_>) -> anyhow::Result<()> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            anyhow::bail!("ticketing backend unavailable");
        }
        tracing::info!(entity = ?ctx.event.entity_id(), queue = %ctx.config["queue"], "ticket opened");
        Ok(())
    }
}

struct Dashboard;

#[async_trait]
impl EventSubscriber for Dashboard {
    fn subscriber_name(&self) -> &str {
        "dashboard"
    }

    async fn on_event(&self, event: &EventEnvelope) -> anyhow::Result<()> {
        println!(
            "[dashboard] {} {} priority={} at {}",
            event.event_category(),
            event.event_type(),
            event.priority(),
            event.created_at().format("%H:%M:%S%.3f")
        );
        Ok(())
    }
}

fn risk_assessed(risk: &str, score: u32, status: &str) -> NewEvent {
    let priority = if score >= 80 {
        EventPriority::High
    } else {
        EventPriority::Medium
    };
    NewEvent::builder()
        .event_type("risk_assessed")
        .event_category("risk")
        .source_module("risk-register")
        .entity_type("risk")
        .entity_id(risk)
        .priority(priority)
        .payload(
            json!({ "score": score, "status": status, "user_id": "analyst-7" })
                .as_object()
                .cloned()
                .unwrap_or_default(),
        )
        .build()
}

fn control_tested(control: &str, passed: bool) -> NewEvent {
    NewEvent::builder()
        .event_type("control_tested")
        .event_category("control")
        .source_module("controls")
        .entity_type("control")
        .entity_id(control)
        .payload(json!({ "passed": passed }).as_object().cloned().unwrap_or_default())
        .build()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let store = Arc::new(InMemoryEventStore::default());
    let bus = Arc::new(
        EventBus::builder()
            .tenant_id(TENANT)
            .store(store.clone())
            .config(EventBusConfig {
                batch: BatchConfig {
                    max_wait: Duration::from_millis(20),
                    ..Default::default()
                },
                ..Default::default()
            })
            .build(),
    );

    let engine = Arc::new(
        RuleEngine::builder()
            .actions(vec![
                Arc::new(Notifier) as Arc<dyn ActionExecutor>,
                Arc::new(Ticketing::default()) as Arc<dyn ActionExecutor>,
            ])
            .config(RuleEngineConfig {
                queue: QueueConfig {
                    retry_backoff: RetryBackoff::Exponential {
                        base: Duration::from_millis(50),
                        max: Duration::from_secs(1),
                    },
                    ..Default::default()
                },
            })
            .build(),
    );
    let loaded = engine.load_rules_json(RULES)?;
    tracing::info!(rules = loaded, "rules loaded");
    let engine_handle = engine.start();
    engine.attach(&bus).await?;
    bus.subscribe(["risk:*", "control_tested"], Arc::new(Dashboard)).await?;

    let started = Utc::now();
    let outcomes = bus
        .publish_many(vec![
            risk_assessed("R-101", 92, "open"),
            risk_assessed("R-102", 45, "open"),
            risk_assessed("R-103", 88, "accepted"),
            control_tested("C-7", false),
        ])
        .await;
    for outcome in outcomes {
        let envelope = outcome?.into_result()?;
        tracing::info!(id = %envelope.id(), event_type = %envelope.event_type(), "published");
    }

    // 等待分发与延迟规则执行完毕
    tokio::time::sleep(Duration::from_millis(300)).await;

    println!("\n--- replaying high-priority risk events ---");
    let replay = ReplayManager::new(bus.clone());
    let stats = replay
        .start_replay(
            ReplayConfig::builder()
                .from(started)
                .categories(vec!["risk".into()])
                .priorities(vec![EventPriority::High])
                .speed(2.0)
                .build(),
            |progress| {
                println!(
                    "replay {}/{} (failed {})",
                    progress.processed_events, progress.total_events, progress.failed_events
                )
            },
        )
        .await?;
    println!("replay finished: {}", serde_json::to_string(&stats)?);
    tokio::time::sleep(Duration::from_millis(300)).await;

    println!("\n--- search ---");
    let history = store.query(&EventQuery::builder().tenant_id(TENANT).build()).await?;
    let page = search(
        &history,
        &SearchFilters::builder()
            .categories(vec!["risk".into()])
            .user_id("analyst-7")
            .build(),
        &SearchOptions::builder()
            .sort_by(SortKey::Priority)
            .limit(3)
            .build(),
    );
    println!(
        "page {} ({} of {}, more: {})",
        page.page,
        page.events.len(),
        page.total,
        page.has_more
    );
    for event in &page.events {
        println!("  {} {:?} {}", event.priority(), event.entity_id(), event.status());
    }
    println!("summary: {}", serde_json::to_string_pretty(&summarize(&history))?);
    println!("deferred queue: {:?}", engine.queue().stats());

    engine_handle.shutdown();
    engine_handle.join().await;
    bus.shutdown().await;
    Ok(())
}
