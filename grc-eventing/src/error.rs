//! 事件引擎统一错误定义
//!
//! 覆盖准入、存储写入/查询、变更订阅、订阅者回调、规则动作、队列重试与回放等
//! 最小必要集合，便于在各实现层统一转换为 `EventingError`。
//!
//! 所有变体只携带可克隆的描述信息：批量写入失败时，同一个错误需要复制给
//! 批次内每一个等待中的结果句柄。
//!
use thiserror::Error;

/// 统一错误类型
#[non_exhaustive]
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EventingError {
    // --- 准入 ---
    #[error("admission rejected: event_type={event_type}")]
    AdmissionRejected { event_type: String },

    // --- 存储 ---
    #[error("store write failed: {reason}")]
    StoreWrite { reason: String },
    #[error("store query failed: {reason}")]
    StoreQuery { reason: String },
    #[error("change feed error: {reason}")]
    ChangeFeed { reason: String },

    // --- 分发/规则 ---
    #[error("subscriber callback failed: subscriber={subscriber}, reason={reason}")]
    Subscriber { subscriber: String, reason: String },
    #[error("action execution failed: action_type={action_type}, reason={reason}")]
    ActionExecution { action_type: String, reason: String },
    #[error("no executor registered for action_type={0}")]
    UnknownAction(String),

    // --- 队列 ---
    #[error("retry exhausted: item={item_id}, attempts={attempts}")]
    RetryExhausted { item_id: String, attempts: u32 },

    // --- 回放 ---
    #[error("replay item failed: event={event_id}, reason={reason}")]
    ReplayItem { event_id: String, reason: String },
    #[error("replay already in progress")]
    ReplayAlreadyRunning,

    // --- 通用 ---
    #[error("serialization error: {reason}")]
    Serde { reason: String },
    #[error("parse error: {reason}")]
    Parse { reason: String },
    #[error("not found: {reason}")]
    NotFound { reason: String },
    #[error("invalid state: {reason}")]
    InvalidState { reason: String },
    #[error("invalid value: {reason}")]
    InvalidValue { reason: String },
    #[error("component closed: {0}")]
    ComponentClosed(&'static str),
}

impl EventingError {
    pub fn store_write(reason: impl Into<String>) -> Self {
        Self::StoreWrite {
            reason: reason.into(),
        }
    }

    pub fn store_query(reason: impl Into<String>) -> Self {
        Self::StoreQuery {
            reason: reason.into(),
        }
    }

    pub fn change_feed(reason: impl Into<String>) -> Self {
        Self::ChangeFeed {
            reason: reason.into(),
        }
    }

    pub fn not_found(reason: impl Into<String>) -> Self {
        Self::NotFound {
            reason: reason.into(),
        }
    }

    pub fn invalid_state(reason: impl Into<String>) -> Self {
        Self::InvalidState {
            reason: reason.into(),
        }
    }

    pub fn invalid_value(reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            reason: reason.into(),
        }
    }
}

/// 统一 Result 类型别名
pub type EventingResult<T> = Result<T, EventingError>;

impl From<serde_json::Error> for EventingError {
    fn from(err: serde_json::Error) -> Self {
        EventingError::Serde {
            reason: err.to_string(),
        }
    }
}

impl From<uuid::Error> for EventingError {
    fn from(err: uuid::Error) -> Self {
        EventingError::Parse {
            reason: err.to_string(),
        }
    }
}

impl From<chrono::ParseError> for EventingError {
    fn from(err: chrono::ParseError) -> Self {
        EventingError::Parse {
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_failures_can_be_replicated() {
        let err = EventingError::store_write("connection reset");
        let copies: Vec<EventingError> = (0..3).map(|_| err.clone()).collect();
        assert!(copies.iter().all(|e| *e == err));
        assert_eq!(err.to_string(), "store write failed: connection reset");
    }

    #[test]
    fn serde_errors_convert() {
        let bad = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: EventingError = bad.into();
        assert!(matches!(err, EventingError::Serde { .. }));
    }
}
