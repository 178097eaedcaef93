//! 事件信封（EventEnvelope）与发布参数
//!
//! 定义持久化后的标准事件形态 `EventEnvelope`、发布前的候选事件 `NewEvent`，
//! 以及优先级与投递状态等基础枚举。信封一经存储即不可变，唯一例外是由存储维护的 `status`。

mod event_envelope;
mod new_event;
mod priority;
mod status;

pub use event_envelope::EventEnvelope;
pub use new_event::NewEvent;
pub use priority::EventPriority;
pub use status::EventStatus;

/// 任意键值集合，用于 `payload` 与 `metadata`
pub type Attributes = serde_json::Map<String, serde_json::Value>;
