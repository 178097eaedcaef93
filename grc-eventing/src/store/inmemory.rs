//! 内存版事件存储（InMemoryEventStore）
//!
//! 基于 `tokio::sync::broadcast` 实现插入通知，满足 `EventStore` 协议：
//! - `write`/`write_batch`：分配 UUID 与时间戳后追加并广播；
//! - `subscribe_inserts`：返回按租户过滤的 `'static` 事件流；
//! - 典型用途：测试环境、示例与本地开发。
//!
//! 注意：广播缓冲区溢出时，落后的订阅流会收到一次 `ChangeFeed` 错误。

use crate::envelope::{EventEnvelope, EventStatus, NewEvent};
use crate::error::{EventingError, EventingResult as Result};
use crate::store::{EventQuery, EventStore};
use async_trait::async_trait;
use chrono::Utc;
use futures_core::stream::BoxStream;
use futures_util::{StreamExt, future};
use tokio::sync::{RwLock, broadcast};
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

/// 简单的内存事件存储实现
pub struct InMemoryEventStore {
    events: RwLock<Vec<EventEnvelope>>,
    tx: broadcast::Sender<EventEnvelope>,
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl InMemoryEventStore {
    /// 创建内存存储，`capacity` 为插入通知的广播缓冲区容量
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self {
            events: RwLock::new(Vec::new()),
            tx,
        }
    }

    /// 直接装入历史事件，不触发插入通知
    pub async fn seed(&self, events: impl IntoIterator<Item = EventEnvelope>) {
        self.events.write().await.extend(events);
    }

    /// 某租户当前全部事件（按插入顺序）
    pub async fn events(&self, tenant_id: &str) -> Vec<EventEnvelope> {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| e.tenant_id() == tenant_id)
            .cloned()
            .collect()
    }

    pub async fn get(&self, event_id: &str) -> Option<EventEnvelope> {
        self.events
            .read()
            .await
            .iter()
            .find(|e| e.id() == event_id)
            .cloned()
    }

    fn persist(tenant_id: &str, event: NewEvent) -> EventEnvelope {
        EventEnvelope::from_new(Uuid::new_v4().to_string(), tenant_id, event, Utc::now())
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn write(&self, tenant_id: &str, event: NewEvent) -> Result<EventEnvelope> {
        let stored = Self::persist(tenant_id, event);
        self.events.write().await.push(stored.clone());
        // 若当前无订阅者，broadcast 的 send 会返回错误，这里视为非致命并忽略
        let _ = self.tx.send(stored.clone());
        Ok(stored)
    }

    async fn write_batch(
        &self,
        tenant_id: &str,
        events: Vec<NewEvent>,
    ) -> Result<Vec<EventEnvelope>> {
        let stored: Vec<EventEnvelope> = events
            .into_iter()
            .map(|e| Self::persist(tenant_id, e))
            .collect();

        self.events.write().await.extend(stored.iter().cloned());
        for ev in &stored {
            let _ = self.tx.send(ev.clone());
        }
        Ok(stored)
    }

    async fn query(&self, query: &EventQuery) -> Result<Vec<EventEnvelope>> {
        let mut matched: Vec<EventEnvelope> = self
            .events
            .read()
            .await
            .iter()
            .filter(|e| query.matches(e))
            .cloned()
            .collect();
        matched.sort_by_key(|e| e.created_at());
        if let Some(limit) = query.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    async fn subscribe_inserts(
        &self,
        tenant_id: &str,
    ) -> BoxStream<'static, Result<EventEnvelope>> {
        let tenant = tenant_id.to_string();
        let stream = BroadcastStream::new(self.tx.subscribe()).filter_map(move |r| {
            future::ready(match r {
                Ok(ev) if ev.tenant_id() == tenant => Some(Ok(ev)),
                Ok(_) => None,
                Err(e) => Some(Err(EventingError::change_feed(e.to_string()))),
            })
        });
        Box::pin(stream)
    }

    async fn update_status(
        &self,
        tenant_id: &str,
        event_id: &str,
        status: EventStatus,
    ) -> Result<()> {
        let mut events = self.events.write().await;
        let Some(slot) = events
            .iter_mut()
            .find(|e| e.id() == event_id && e.tenant_id() == tenant_id)
        else {
            return Err(EventingError::not_found(format!("event {event_id}")));
        };
        *slot = slot.clone().with_status(status);
        Ok(())
    }
}
