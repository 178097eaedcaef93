use crate::envelope::{EventEnvelope, EventPriority};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

pub type QueueItemId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueItemStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// 队列工作项快照
#[derive(Debug, Clone)]
pub struct QueueItem<T> {
    pub id: QueueItemId,
    pub event: EventEnvelope,
    pub payload: T,
    pub priority: EventPriority,
    pub retry_count: u32,
    pub max_retries: u32,
    pub status: QueueItemStatus,
    pub added_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// 最近一次失败原因
    pub last_error: Option<String>,
}

/// 一次 `process` 期间到达终态的工作项
#[derive(Debug, Clone)]
pub struct ProcessReport<T> {
    pub completed: Vec<QueueItem<T>>,
    pub failed: Vec<QueueItem<T>>,
}

impl<T> Default for ProcessReport<T> {
    fn default() -> Self {
        Self {
            completed: Vec::new(),
            failed: Vec::new(),
        }
    }
}

impl<T> ProcessReport<T> {
    pub fn is_empty(&self) -> bool {
        self.completed.is_empty() && self.failed.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub failed: usize,
}
