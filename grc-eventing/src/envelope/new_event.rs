use super::{Attributes, EventPriority};
use bon::Builder;
use serde::{Deserialize, Serialize};

/// 候选事件：`publish` 的入参，尚未分配 `id`/`created_at`
///
/// 租户由总线的上下文决定，不在此处携带。
#[derive(Debug, Clone, Builder, Serialize, Deserialize)]
pub struct NewEvent {
    /// 语义事件类型，如 `policy_created`
    #[builder(into)]
    pub event_type: String,
    /// 粗粒度分组，如 `policy`、`risk`、`kpi`
    #[builder(into)]
    pub event_category: String,
    /// 来源子系统
    #[builder(into)]
    pub source_module: String,
    #[builder(into)]
    pub entity_type: Option<String>,
    #[builder(into)]
    pub entity_id: Option<String>,
    #[builder(default)]
    pub priority: EventPriority,
    /// 生产者拥有的业务数据
    #[builder(default)]
    pub payload: Attributes,
    /// 基础设施拥有的附加信息（如回放标记）
    #[builder(default)]
    pub metadata: Attributes,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let ev = NewEvent::builder()
            .event_type("policy_created")
            .event_category("policy")
            .source_module("policies")
            .build();
        assert_eq!(ev.priority, EventPriority::Medium);
        assert!(ev.payload.is_empty());
        assert!(ev.metadata.is_empty());
        assert!(ev.entity_id.is_none());
    }
}
