//! GRC 事件引擎（grc-eventing）
//!
//! 为治理、风险与合规（GRC）应用提供进程内的事件基础设施：
//! - 信封（`envelope`）：持久化事件记录与候选事件；
//! - 存储协议（`store`）：写入、批量写入、查询与插入通知，附带内存实现；
//! - 事件系统（`eventing`）：准入控制、批量写入、订阅分发与事件总线；
//! - 工作队列（`queue`）：优先级队列、失败重试与延迟入队；
//! - 自动化规则（`rules`）：条件树、规则匹配与按动作类型注册的执行器；
//! - 回放（`replay`）与检索（`search`）。
//!
//! 本 crate 不绑定具体存储与传输实现，只定义协议与最小必要的错误类型，
//! 可对接任意满足 `EventStore` 协议的后端。
//!
//! 典型用法：
//! 1. 实现（或使用内存版）`EventStore`，按租户构建 `EventBus`；
//! 2. 注册动作执行器与规则，构建 `RuleEngine` 并以 `attach` 挂到总线上；
//! 3. 各业务模块通过 `EventBus::publish` 发布事件、`subscribe` 订阅事件；
//! 4. 需要重放历史时使用 `ReplayManager`，查询展示时使用 `search`。
//!
pub mod config;
pub mod envelope;
pub mod error;
pub mod eventing;
pub mod queue;
pub mod replay;
pub mod rules;
pub mod search;
pub mod store;

pub use envelope::{EventEnvelope, EventPriority, EventStatus, NewEvent};
pub use error::{EventingError, EventingResult};
pub use eventing::{EventBus, EventSubscriber, PublishOutcome};
pub use store::EventStore;
