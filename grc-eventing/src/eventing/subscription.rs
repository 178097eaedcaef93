//! 订阅（Subscription）
//!
//! 订阅是进程内的临时注册，不持久化，进程启动时由各模块重新建立。
//! 过滤表达式支持三种形式：
//! - 精确事件类型：`policy_created`；
//! - 分类通配：`policy:*`，匹配 `event_category == "policy"` 的全部事件；
//! - 全局通配：`*`。
//!
use crate::envelope::EventEnvelope;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use uuid::Uuid;

/// 单次回调的处理结果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    Handled,
    /// 订阅者检查后没有可做的事，不计入送达
    Skipped,
}

/// 事件订阅者：接收匹配过滤表达式的事件
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    /// 订阅者名称（用于日志与失败标记）
    fn subscriber_name(&self) -> &str;
    /// 处理事件；错误只记录，不影响其他订阅者
    async fn on_event(&self, event: &EventEnvelope) -> anyhow::Result<()>;

    /// 总线实际调用的入口，默认把 `on_event` 成功视为 `Handled`
    async fn deliver(&self, event: &EventEnvelope) -> anyhow::Result<Delivery> {
        self.on_event(event).await.map(|()| Delivery::Handled)
    }
}

/// 解析后的过滤表达式
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventPattern {
    Exact(String),
    Category(String),
    All,
}

impl EventPattern {
    pub fn parse(raw: &str) -> Self {
        if raw == "*" {
            return EventPattern::All;
        }
        match raw.strip_suffix(":*") {
            Some(category) => EventPattern::Category(category.to_string()),
            None => EventPattern::Exact(raw.to_string()),
        }
    }

    pub fn matches(&self, event: &EventEnvelope) -> bool {
        match self {
            EventPattern::Exact(ty) => ty == event.event_type(),
            EventPattern::Category(cat) => cat == event.event_category(),
            EventPattern::All => true,
        }
    }
}

pub type SubscriptionId = Uuid;

struct Subscription {
    name: String,
    patterns: Vec<EventPattern>,
    subscriber: Arc<dyn EventSubscriber>,
}

/// 活跃订阅表
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    entries: DashMap<SubscriptionId, Subscription>,
}

impl SubscriptionRegistry {
    pub(crate) fn insert(
        &self,
        patterns: Vec<EventPattern>,
        subscriber: Arc<dyn EventSubscriber>,
    ) -> SubscriptionId {
        let id = Uuid::new_v4();
        let name = subscriber.subscriber_name().to_string();
        self.entries.insert(
            id,
            Subscription {
                name,
                patterns,
                subscriber,
            },
        );
        id
    }

    pub(crate) fn remove(&self, id: &SubscriptionId) -> bool {
        self.entries.remove(id).is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// 返回匹配该事件的订阅者（无序）
    pub(crate) fn matching(&self, event: &EventEnvelope) -> Vec<(String, Arc<dyn EventSubscriber>)> {
        self.entries
            .iter()
            .filter(|entry| entry.patterns.iter().any(|p| p.matches(event)))
            .map(|entry| (entry.name.clone(), entry.subscriber.clone()))
            .collect()
    }
}

/// 订阅句柄：调用 `unsubscribe` 结束订阅
///
/// 丢弃句柄不会自动取消订阅。
#[derive(Clone)]
pub struct SubscriptionHandle {
    id: SubscriptionId,
    registry: Weak<SubscriptionRegistry>,
}

impl SubscriptionHandle {
    pub(crate) fn new(id: SubscriptionId, registry: &Arc<SubscriptionRegistry>) -> Self {
        Self {
            id,
            registry: Arc::downgrade(registry),
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// 返回订阅此前是否仍处于活跃状态
    pub fn unsubscribe(&self) -> bool {
        self.registry
            .upgrade()
            .is_some_and(|registry| registry.remove(&self.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EventEnvelope;
    use chrono::Utc;

    struct Noop(&'static str);

    #[async_trait]
    impl EventSubscriber for Noop {
        fn subscriber_name(&self) -> &str {
            self.0
        }
        async fn on_event(&self, _event: &EventEnvelope) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn event(ty: &str, category: &str) -> EventEnvelope {
        EventEnvelope::builder()
            .id("e")
            .tenant_id("t")
            .event_type(ty)
            .event_category(category)
            .source_module("m")
            .created_at(Utc::now())
            .build()
    }

    #[test]
    fn patterns_parse_and_match() {
        let ev = event("policy_created", "policy");
        assert_eq!(EventPattern::parse("*"), EventPattern::All);
        assert!(EventPattern::parse("*").matches(&ev));
        assert!(EventPattern::parse("policy_created").matches(&ev));
        assert!(!EventPattern::parse("policy_updated").matches(&ev));
        assert!(EventPattern::parse("policy:*").matches(&ev));
        assert!(!EventPattern::parse("risk:*").matches(&ev));
    }

    #[test]
    fn registry_matches_and_unsubscribes() {
        let registry = Arc::new(SubscriptionRegistry::default());
        let risk = registry.insert(vec![EventPattern::parse("risk:*")], Arc::new(Noop("risk")));
        let all = registry.insert(vec![EventPattern::All], Arc::new(Noop("all")));
        let handle = SubscriptionHandle::new(risk, &registry);

        let mut names: Vec<String> = registry
            .matching(&event("risk_raised", "risk"))
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        names.sort();
        assert_eq!(names, ["all", "risk"]);

        assert!(handle.unsubscribe());
        assert!(!handle.unsubscribe());
        assert_eq!(registry.len(), 1);
        assert!(registry.remove(&all));
    }
}
