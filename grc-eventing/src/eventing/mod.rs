//! 事件子系统（eventing）
//!
//! 提供单租户上下文内的发布/订阅运行时：
//! - `Throttler`：按每秒/每分钟预算进行准入控制，支持优先级旁路；
//! - `Batcher`：按数量或等待时间合并写入，摊薄存储往返；
//! - `EventBus`：编排“准入 → 批量写入 → 存储”的发布路径，以及
//!   “存储插入通知 → 过滤 → 并发分发”的订阅路径；
//! - `EventSubscriber`：订阅者协议，规则引擎即以 `*` 订阅的一员。
//!
//! 该模块不绑定具体存储实现，可对接任意满足 `EventStore` 协议的后端。
//!
pub mod batcher;
pub mod bus;
pub mod subscription;
pub mod throttler;

pub use batcher::{BatchStats, Batcher, PendingWrite};
pub use bus::{DispatchReport, EventBus, PublishOutcome};
pub use subscription::{
    Delivery, EventPattern, EventSubscriber, SubscriptionHandle, SubscriptionId,
};
pub use throttler::{ThrottleStats, Throttler};
