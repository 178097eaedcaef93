//! 事件总线（EventBus）
//!
//! 编排单个租户上下文内的发布与订阅：
//! - 发布：候选事件 → 准入控制 → 批量写入 → 存储，返回带存储分配字段的信封；
//!   存储错误原样返回给调用方，本层不重试写入；
//! - 订阅：首次订阅时建立唯一一条到存储的变更订阅，每条插入通知按过滤表达式
//!   分发给全部活跃订阅者，单个订阅者的失败只记录日志，不影响其他订阅者；
//! - 分发相对发布是“发出即不管”的：`publish` 不等待分发完成。需要观察分发结果时，
//!   通过 `dispatched()` 订阅 `DispatchReport`。
//!
//! 投递语义为至少一次、尽力而为，同一事件在多个订阅者之间无顺序保证。
//! 至少一个订阅者实际处理（`Delivery::Handled`）时事件标记为 delivered，
//! 全部失败时标记为 failed，其余情况保持 pending。
//!
use super::batcher::{BatchStats, Batcher, PendingWrite};
use super::subscription::{
    Delivery, EventPattern, EventSubscriber, SubscriptionHandle, SubscriptionRegistry,
};
use super::throttler::{ThrottleStats, Throttler};
use crate::config::EventBusConfig;
use crate::envelope::{EventEnvelope, EventStatus, NewEvent};
use crate::error::{EventingError, EventingResult as Result};
use crate::store::EventStore;
use bon::bon;
use futures_core::stream::BoxStream;
use futures_util::{StreamExt, stream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 发布结果：被节流时返回可区分的结果而不是错误
#[derive(Debug, Clone, PartialEq)]
pub enum PublishOutcome {
    Published(EventEnvelope),
    Throttled { event_type: String },
}

impl PublishOutcome {
    pub fn envelope(&self) -> Option<&EventEnvelope> {
        match self {
            PublishOutcome::Published(envelope) => Some(envelope),
            PublishOutcome::Throttled { .. } => None,
        }
    }

    pub fn is_throttled(&self) -> bool {
        matches!(self, PublishOutcome::Throttled { .. })
    }

    /// 将节流转换为 `AdmissionRejected` 错误
    pub fn into_result(self) -> Result<EventEnvelope> {
        match self {
            PublishOutcome::Published(envelope) => Ok(envelope),
            PublishOutcome::Throttled { event_type } => {
                Err(EventingError::AdmissionRejected { event_type })
            }
        }
    }
}

/// 单个事件分发完成的报告
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub event_id: String,
    pub event_type: String,
    /// 匹配的订阅数
    pub matched: usize,
    /// 回调成功数
    pub delivered: usize,
    /// 回调成功但订阅者未作处理的数量
    pub skipped: usize,
    /// 回调失败数
    pub failed: usize,
}

struct FeedHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

pub struct EventBus {
    tenant_id: String,
    store: Arc<dyn EventStore>,
    config: EventBusConfig,
    throttler: Throttler,
    batcher: Batcher,
    subscriptions: Arc<SubscriptionRegistry>,
    feed: Mutex<Option<FeedHandle>>,
    reports: broadcast::Sender<DispatchReport>,
    closed: AtomicBool,
}

#[bon]
impl EventBus {
    /// 创建租户作用域的总线；启用批量时需在 tokio 运行时中调用
    #[builder]
    pub fn new(
        #[builder(into)] tenant_id: String,
        store: Arc<dyn EventStore>,
        #[builder(default)] config: EventBusConfig,
    ) -> Self {
        let throttler = Throttler::new(config.throttle.clone());
        let batcher = Batcher::start(tenant_id.clone(), store.clone(), config.batch.clone());
        let (reports, _rx) = broadcast::channel(config.report_capacity.max(1));

        Self {
            tenant_id,
            store,
            config,
            throttler,
            batcher,
            subscriptions: Arc::new(SubscriptionRegistry::default()),
            feed: Mutex::new(None),
            reports,
            closed: AtomicBool::new(false),
        }
    }
}

impl EventBus {
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    pub fn config(&self) -> &EventBusConfig {
        &self.config
    }

    /// 发布事件：准入 → 批量写入 → 存储
    pub async fn publish(&self, event: NewEvent) -> Result<PublishOutcome> {
        self.ensure_open()?;

        if !self.throttler.admit(event.priority) {
            return Ok(PublishOutcome::Throttled {
                event_type: event.event_type,
            });
        }

        let event_type = event.event_type.clone();
        let pending = self.batcher.add(event).await?;
        match pending.wait().await {
            Ok(stored) => {
                tracing::debug!(
                    tenant_id = %self.tenant_id,
                    event_id = %stored.id(),
                    event_type = %stored.event_type(),
                    "event published"
                );
                Ok(PublishOutcome::Published(stored))
            }
            Err(err) => {
                tracing::error!(
                    tenant_id = %self.tenant_id,
                    %event_type,
                    error = %err,
                    "publish failed"
                );
                Err(err)
            }
        }
    }

    /// 批量发布：先全部提交给批量写入器，再等待结果，结果与入参按下标对应
    pub async fn publish_many(&self, events: Vec<NewEvent>) -> Vec<Result<PublishOutcome>> {
        if let Err(err) = self.ensure_open() {
            return events.iter().map(|_| Err(err.clone())).collect();
        }

        enum Slot {
            Pending(PendingWrite),
            Done(Result<PublishOutcome>),
        }

        let mut slots = Vec::with_capacity(events.len());
        for event in events {
            if !self.throttler.admit(event.priority) {
                slots.push(Slot::Done(Ok(PublishOutcome::Throttled {
                    event_type: event.event_type,
                })));
                continue;
            }
            slots.push(match self.batcher.add(event).await {
                Ok(pending) => Slot::Pending(pending),
                Err(err) => Slot::Done(Err(err)),
            });
        }

        let mut out = Vec::with_capacity(slots.len());
        for slot in slots {
            out.push(match slot {
                Slot::Pending(pending) => pending.wait().await.map(PublishOutcome::Published),
                Slot::Done(result) => result,
            });
        }
        out
    }

    /// 订阅事件，`patterns` 支持精确类型、`category:*` 与 `*`
    pub async fn subscribe<I, S>(
        &self,
        patterns: I,
        subscriber: Arc<dyn EventSubscriber>,
    ) -> Result<SubscriptionHandle>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.ensure_open()?;

        let patterns: Vec<EventPattern> = patterns
            .into_iter()
            .map(|p| EventPattern::parse(p.as_ref()))
            .collect();
        if patterns.is_empty() {
            return Err(EventingError::invalid_value(
                "subscription requires at least one event type",
            ));
        }

        self.ensure_feed().await;

        let name = subscriber.subscriber_name().to_string();
        let id = self.subscriptions.insert(patterns, subscriber);
        tracing::debug!(tenant_id = %self.tenant_id, subscriber = %name, %id, "subscribed");
        Ok(SubscriptionHandle::new(id, &self.subscriptions))
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// 订阅分发完成报告
    pub fn dispatched(&self) -> broadcast::Receiver<DispatchReport> {
        self.reports.subscribe()
    }

    pub fn throttle_stats(&self) -> ThrottleStats {
        self.throttler.stats()
    }

    pub fn batch_stats(&self) -> BatchStats {
        self.batcher.stats()
    }

    /// 立即刷写待写事件
    pub async fn flush(&self) -> Result<()> {
        self.batcher.flush().await
    }

    /// 关闭总线：刷写待写事件并停止变更订阅
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.batcher.shutdown().await;
        if let Some(feed) = self.feed.lock().await.take() {
            feed.token.cancel();
            let _ = feed.task.await;
        }
        tracing::info!(tenant_id = %self.tenant_id, "event bus shut down");
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EventingError::ComponentClosed("event bus"));
        }
        Ok(())
    }

    async fn ensure_feed(&self) {
        let mut feed = self.feed.lock().await;
        if feed.as_ref().is_some_and(|f| !f.task.is_finished()) {
            return;
        }

        let stream = self.store.subscribe_inserts(&self.tenant_id).await;
        let token = CancellationToken::new();
        let dispatcher = Dispatcher {
            tenant_id: self.tenant_id.clone(),
            store: self.store.clone(),
            subscriptions: self.subscriptions.clone(),
            reports: self.reports.clone(),
            concurrency: self.config.dispatch_concurrency.max(1),
        };
        let task = tokio::spawn(dispatcher.run(stream, token.clone()));
        tracing::info!(tenant_id = %self.tenant_id, "change feed opened");

        *feed = Some(FeedHandle { token, task });
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        if let Some(feed) = self.feed.get_mut().take() {
            feed.token.cancel();
        }
    }
}

struct Dispatcher {
    tenant_id: String,
    store: Arc<dyn EventStore>,
    subscriptions: Arc<SubscriptionRegistry>,
    reports: broadcast::Sender<DispatchReport>,
    concurrency: usize,
}

impl Dispatcher {
    async fn run(
        self,
        mut stream: BoxStream<'static, Result<EventEnvelope>>,
        token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                next = stream.next() => match next {
                    Some(Ok(event)) => self.dispatch(event).await,
                    Some(Err(err)) => {
                        tracing::warn!(tenant_id = %self.tenant_id, error = %err, "change feed error");
                    }
                    None => {
                        tracing::info!(tenant_id = %self.tenant_id, "change feed closed by store");
                        break;
                    }
                }
            }
        }
    }

    async fn dispatch(&self, event: EventEnvelope) {
        let matched = self.subscriptions.matching(&event);
        let matched_count = matched.len();
        let delivered = AtomicUsize::new(0);
        let skipped = AtomicUsize::new(0);
        let failed = AtomicUsize::new(0);

        if !matched.is_empty() {
            let (ev, ok, idle, bad) = (&event, &delivered, &skipped, &failed);
            stream::iter(matched)
                .for_each_concurrent(Some(self.concurrency), move |(name, subscriber)| async move {
                    match subscriber.deliver(ev).await {
                        Ok(Delivery::Handled) => {
                            ok.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(Delivery::Skipped) => {
                            idle.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(err) => {
                            bad.fetch_add(1, Ordering::Relaxed);
                            let err = EventingError::Subscriber {
                                subscriber: name,
                                reason: format!("{err:#}"),
                            };
                            tracing::warn!(
                                tenant_id = %ev.tenant_id(),
                                event_id = %ev.id(),
                                error = %err,
                                "subscriber callback failed"
                            );
                        }
                    }
                })
                .await;
        }

        let report = DispatchReport {
            event_id: event.id().to_string(),
            event_type: event.event_type().to_string(),
            matched: matched_count,
            delivered: delivered.load(Ordering::Relaxed),
            skipped: skipped.load(Ordering::Relaxed),
            failed: failed.load(Ordering::Relaxed),
        };

        let status = if report.delivered > 0 {
            Some(EventStatus::Delivered)
        } else if report.failed > 0 {
            Some(EventStatus::Failed)
        } else {
            None
        };
        if let Some(status) = status {
            if let Err(err) = self
                .store
                .update_status(&self.tenant_id, event.id(), status)
                .await
            {
                tracing::warn!(event_id = %event.id(), error = %err, "status update failed");
            }
        }

        tracing::debug!(
            tenant_id = %self.tenant_id,
            event_id = %report.event_id,
            matched = report.matched,
            delivered = report.delivered,
            skipped = report.skipped,
            failed = report.failed,
            "event dispatched"
        );
        let _ = self.reports.send(report);
    }
}

#[cfg(all(test, feature = "inmemory"))]
mod tests {
    use super::*;
    use crate::config::BatchConfig;
    use crate::envelope::EventPriority;
    use crate::store::{EventQuery, InMemoryEventStore};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[derive(Default)]
    struct SpySubscriber {
        name: &'static str,
        fail: bool,
        seen: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl EventSubscriber for SpySubscriber {
        fn subscriber_name(&self) -> &str {
            self.name
        }
        async fn on_event(&self, event: &EventEnvelope) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push(event.event_type().to_string());
            if self.fail {
                anyhow::bail!("subscriber {} refuses", self.name);
            }
            Ok(())
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl EventStore for BrokenStore {
        async fn write(&self, _tenant_id: &str, _event: NewEvent) -> Result<EventEnvelope> {
            Err(EventingError::store_write("read-only replica"))
        }
        async fn query(&self, _query: &EventQuery) -> Result<Vec<EventEnvelope>> {
            Ok(vec![])
        }
        async fn subscribe_inserts(
            &self,
            _tenant_id: &str,
        ) -> BoxStream<'static, Result<EventEnvelope>> {
            Box::pin(stream::empty())
        }
        async fn update_status(
            &self,
            _tenant_id: &str,
            _event_id: &str,
            _status: EventStatus,
        ) -> Result<()> {
            Ok(())
        }
    }

    fn fast_config() -> EventBusConfig {
        EventBusConfig {
            batch: BatchConfig {
                max_wait: Duration::from_millis(5),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn ev(ty: &str, category: &str) -> NewEvent {
        NewEvent::builder()
            .event_type(ty)
            .event_category(category)
            .source_module("tests")
            .build()
    }

    async fn next_report(rx: &mut broadcast::Receiver<DispatchReport>) -> DispatchReport {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("dispatch report in time")
            .expect("report channel open")
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn publish_persists_and_dispatches_to_matching_subscribers() {
        let store = Arc::new(InMemoryEventStore::default());
        let bus = EventBus::builder()
            .tenant_id("t-1")
            .store(store.clone())
            .config(fast_config())
            .build();

        let policy = Arc::new(SpySubscriber {
            name: "policy",
            ..Default::default()
        });
        let everything = Arc::new(SpySubscriber {
            name: "all",
            ..Default::default()
        });
        bus.subscribe(["policy:*"], policy.clone()).await.unwrap();
        bus.subscribe(["*"], everything.clone()).await.unwrap();
        let mut reports = bus.dispatched();

        let outcome = bus.publish(ev("policy_created", "policy")).await.unwrap();
        let stored = outcome.envelope().cloned().unwrap();
        assert_eq!(stored.tenant_id(), "t-1");

        let report = next_report(&mut reports).await;
        assert_eq!(report.event_id, stored.id());
        assert_eq!((report.matched, report.delivered, report.failed), (2, 2, 0));

        bus.publish(ev("risk_raised", "risk")).await.unwrap();
        let report = next_report(&mut reports).await;
        assert_eq!(report.matched, 1);

        assert_eq!(*policy.seen.lock().unwrap(), ["policy_created"]);
        assert_eq!(*everything.seen.lock().unwrap(), ["policy_created", "risk_raised"]);
        let reloaded = store.get(stored.id()).await.unwrap();
        assert_eq!(reloaded.status(), EventStatus::Delivered);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failing_subscriber_does_not_block_others() {
        let store = Arc::new(InMemoryEventStore::default());
        let bus = EventBus::builder()
            .tenant_id("t-1")
            .store(store.clone())
            .config(fast_config())
            .build();

        let bad = Arc::new(SpySubscriber {
            name: "bad",
            fail: true,
            ..Default::default()
        });
        let good = Arc::new(SpySubscriber {
            name: "good",
            ..Default::default()
        });
        bus.subscribe(["audit_opened"], bad.clone()).await.unwrap();
        let good_handle = bus.subscribe(["audit_opened"], good.clone()).await.unwrap();
        let mut reports = bus.dispatched();

        bus.publish(ev("audit_opened", "audit")).await.unwrap();
        let report = next_report(&mut reports).await;
        assert_eq!((report.delivered, report.failed), (1, 1));
        assert_eq!(good.seen.lock().unwrap().len(), 1);

        assert!(good_handle.unsubscribe());
        let stored = bus
            .publish(ev("audit_opened", "audit"))
            .await
            .unwrap()
            .into_result()
            .unwrap();
        let report = next_report(&mut reports).await;
        assert_eq!((report.matched, report.failed), (1, 1));
        assert_eq!(good.seen.lock().unwrap().len(), 1);
        assert_eq!(store.get(stored.id()).await.unwrap().status(), EventStatus::Failed);
    }

    #[tokio::test]
    async fn throttled_publish_is_a_distinguishable_result() {
        let bus = EventBus::builder()
            .tenant_id("t-1")
            .store(Arc::new(InMemoryEventStore::default()))
            .config(EventBusConfig {
                throttle: crate::config::ThrottleConfig {
                    max_per_second: 1,
                    ..Default::default()
                },
                batch: BatchConfig {
                    enabled: false,
                    ..Default::default()
                },
                ..Default::default()
            })
            .build();

        assert!(!bus.publish(ev("kpi_breached", "kpi")).await.unwrap().is_throttled());
        let second = bus.publish(ev("kpi_breached", "kpi")).await.unwrap();
        assert!(second.is_throttled());
        assert!(matches!(
            second.into_result(),
            Err(EventingError::AdmissionRejected { .. })
        ));

        let urgent = NewEvent::builder()
            .event_type("kpi_breached")
            .event_category("kpi")
            .source_module("tests")
            .priority(EventPriority::Critical)
            .build();
        assert!(!bus.publish(urgent).await.unwrap().is_throttled());
        assert_eq!(bus.throttle_stats().throttled_count, 1);
    }

    #[tokio::test]
    async fn store_errors_propagate_unchanged() {
        let bus = EventBus::builder()
            .tenant_id("t-1")
            .store(Arc::new(BrokenStore))
            .config(fast_config())
            .build();

        let err = bus.publish(ev("control_tested", "control")).await.unwrap_err();
        assert_eq!(err, EventingError::store_write("read-only replica"));
    }

    #[tokio::test]
    async fn publish_many_shares_one_batch() {
        let store = Arc::new(InMemoryEventStore::default());
        let bus = EventBus::builder()
            .tenant_id("t-1")
            .store(store.clone())
            .config(fast_config())
            .build();

        let results = bus
            .publish_many(vec![ev("a", "x"), ev("b", "x"), ev("c", "x")])
            .await;
        let types: Vec<String> = results
            .into_iter()
            .map(|r| r.unwrap().into_result().unwrap().event_type().to_string())
            .collect();
        assert_eq!(types, ["a", "b", "c"]);
        assert_eq!(bus.batch_stats().batches_flushed, 1);
        assert_eq!(store.events("t-1").await.len(), 3);
    }

    #[tokio::test]
    async fn closed_bus_rejects_work() {
        let bus = EventBus::builder()
            .tenant_id("t-1")
            .store(Arc::new(InMemoryEventStore::default()))
            .config(fast_config())
            .build();
        bus.shutdown().await;

        assert!(matches!(
            bus.publish(ev("a", "x")).await,
            Err(EventingError::ComponentClosed(_))
        ));
        let sub = Arc::new(SpySubscriber {
            name: "late",
            ..Default::default()
        });
        assert!(bus.subscribe(["*"], sub).await.is_err());
    }
}
