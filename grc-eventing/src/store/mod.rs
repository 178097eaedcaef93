//! 事件存储协议（EventStore）
//!
//! 引擎把持久化与变更通知视为外部协作方，只依赖这里定义的最小接口：
//! - `write` / `write_batch`：持久化候选事件，返回带存储分配字段的信封；
//! - `query`：按条件读取历史事件（回放与检索使用）；
//! - `subscribe_inserts`：按租户订阅新插入事件的 `'static` 事件流，丢弃流即取消订阅；
//! - `update_status`：维护 `pending/delivered/failed` 便利状态。
//!
//! 所有读写都以 `tenant_id` 为作用域，不存在跨租户共享。
//!
use crate::envelope::{EventEnvelope, EventPriority, EventStatus, NewEvent};
use crate::error::EventingResult as Result;
use async_trait::async_trait;
use bon::Builder;
use chrono::{DateTime, Utc};
use futures_core::stream::BoxStream;

#[cfg(feature = "inmemory")]
mod inmemory;

#[cfg(feature = "inmemory")]
pub use inmemory::InMemoryEventStore;

/// 事件存储：持久化、查询与插入通知
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn write(&self, tenant_id: &str, event: NewEvent) -> Result<EventEnvelope>;

    /// 批量写入，返回值与入参按下标一一对应
    async fn write_batch(&self, tenant_id: &str, events: Vec<NewEvent>)
    -> Result<Vec<EventEnvelope>> {
        let mut out = Vec::with_capacity(events.len());
        for event in events {
            out.push(self.write(tenant_id, event).await?);
        }
        Ok(out)
    }

    /// 按 `created_at` 升序返回（相同时间保持写入顺序），`limit` 取最早的若干条
    async fn query(&self, query: &EventQuery) -> Result<Vec<EventEnvelope>>;

    /// 返回一个 'static 生命周期的插入事件流，便于在 tokio::spawn 中使用
    async fn subscribe_inserts(&self, tenant_id: &str)
    -> BoxStream<'static, Result<EventEnvelope>>;

    async fn update_status(&self, tenant_id: &str, event_id: &str, status: EventStatus)
    -> Result<()>;
}

/// 历史事件查询条件，空集合表示不过滤
#[derive(Debug, Clone, Default, Builder)]
pub struct EventQuery {
    #[builder(into)]
    pub tenant_id: String,
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
}

impl EventQuery {
    /// 时间区间为闭区间 `[from, to]`；不检查 `limit`
    pub fn matches(&self, event: &EventEnvelope) -> bool {
        if event.tenant_id() != self.tenant_id {
            return false;
        }
        if self.from.is_some_and(|from| event.created_at() < from) {
            return false;
        }
        if self.to.is_some_and(|to| event.created_at() > to) {
            return false;
        }
        if !self.event_types.is_empty()
            && !self.event_types.iter().any(|t| t == event.event_type())
        {
            return false;
        }
        if !self.categories.is_empty()
            && !self.categories.iter().any(|c| c == event.event_category())
        {
            return false;
        }
        if !self.priorities.is_empty() && !self.priorities.contains(&event.priority()) {
            return false;
        }
        if self
            .source_module
            .as_deref()
            .is_some_and(|m| m != event.source_module())
        {
            return false;
        }
        true
    }
}
