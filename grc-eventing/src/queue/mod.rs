//! 工作队列（queue）
//!
//! 承载“事件 + 处理载荷”形式的工作项，提供有序、可重试、有界并发的处理：
//! - `PriorityQueue`：按优先级降序出队，同优先级先进先出；失败项重试或保留为 failed；
//! - `ScheduledQueue`：在其上增加延迟入队与取消。
//!
//! 工作项只由队列自身的处理循环修改，外部获得的都是快照。
//!
mod item;
mod priority;
mod scheduled;

pub use item::{ProcessReport, QueueItem, QueueItemId, QueueItemStatus, QueueStats};
pub use priority::{PriorityQueue, QueueHandler};
pub use scheduled::{ScheduleId, ScheduledQueue};
