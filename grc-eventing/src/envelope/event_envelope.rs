use super::{Attributes, EventPriority, EventStatus, NewEvent};
use bon::Builder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 持久化后的事件记录
///
/// `id` 与 `created_at` 由存储分配；`created_at` 是回放与检索的权威排序键。
#[derive(Debug, Clone, Builder, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// 事件唯一标识符（存储分配）
    #[builder(into)]
    id: String,
    /// 租户隔离键
    #[builder(into)]
    tenant_id: String,
    #[builder(into)]
    event_type: String,
    #[builder(into)]
    event_category: String,
    #[builder(into)]
    source_module: String,
    #[builder(into)]
    entity_type: Option<String>,
    #[builder(into)]
    entity_id: Option<String>,
    #[builder(default)]
    priority: EventPriority,
    #[builder(default)]
    payload: Attributes,
    #[builder(default)]
    metadata: Attributes,
    #[builder(default)]
    status: EventStatus,
    created_at: DateTime<Utc>,
}

impl EventEnvelope {
    /// 由存储在持久化时调用：以候选事件为基础补齐存储分配的字段
    pub fn from_new(
        id: impl Into<String>,
        tenant_id: impl Into<String>,
        event: NewEvent,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            tenant_id: tenant_id.into(),
            event_type: event.event_type,
            event_category: event.event_category,
            source_module: event.source_module,
            entity_type: event.entity_type,
            entity_id: event.entity_id,
            priority: event.priority,
            payload: event.payload,
            metadata: event.metadata,
            status: EventStatus::Pending,
            created_at,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn event_category(&self) -> &str {
        &self.event_category
    }

    pub fn source_module(&self) -> &str {
        &self.source_module
    }

    pub fn entity_type(&self) -> Option<&str> {
        self.entity_type.as_deref()
    }

    pub fn entity_id(&self) -> Option<&str> {
        self.entity_id.as_deref()
    }

    pub fn priority(&self) -> EventPriority {
        self.priority
    }

    pub fn payload(&self) -> &Attributes {
        &self.payload
    }

    pub fn metadata(&self) -> &Attributes {
        &self.metadata
    }

    pub fn status(&self) -> EventStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// 状态是信封上唯一可变的字段，仅供存储实现使用
    pub fn with_status(mut self, status: EventStatus) -> Self {
        self.status = status;
        self
    }

    /// 按点分路径读取字段
    ///
    /// - `payload.a.b` / `metadata.a.b`：显式指定根；
    /// - `event_type`、`priority` 等信封字段：直接返回其字符串值；
    /// - 其它路径：先查 `payload`，再查 `metadata`。
    ///
    /// 路径不存在时返回 `None`，从不报错。
    pub fn field(&self, path: &str) -> Option<Value> {
        if let Some(rest) = path.strip_prefix("payload.") {
            return lookup(&self.payload, rest).cloned();
        }
        if let Some(rest) = path.strip_prefix("metadata.") {
            return lookup(&self.metadata, rest).cloned();
        }

        let envelope_field = match path {
            "id" => Some(self.id.clone()),
            "tenant_id" => Some(self.tenant_id.clone()),
            "event_type" => Some(self.event_type.clone()),
            "event_category" => Some(self.event_category.clone()),
            "source_module" => Some(self.source_module.clone()),
            "entity_type" => return self.entity_type.clone().map(Value::String),
            "entity_id" => return self.entity_id.clone().map(Value::String),
            "priority" => Some(self.priority.as_str().to_string()),
            "status" => Some(self.status.as_str().to_string()),
            _ => None,
        };
        if let Some(v) = envelope_field {
            return Some(Value::String(v));
        }

        lookup(&self.payload, path)
            .or_else(|| lookup(&self.metadata, path))
            .cloned()
    }
}

fn lookup<'a>(root: &'a Attributes, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = root.get(first)?;

    for seg in segments {
        current = match current {
            Value::Object(map) => map.get(seg)?,
            Value::Array(items) => items.get(seg.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }

    Some(current)
}
