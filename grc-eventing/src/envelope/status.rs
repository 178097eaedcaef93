use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// 事件投递状态，由存储维护，进程内队列不修改它
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    /// 刚持久化
    #[default]
    Pending,
    /// 至少一个订阅者或规则已被调用且未报错
    Delivered,
    /// 匹配的订阅者全部失败
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Delivered => "delivered",
            EventStatus::Failed => "failed",
        }
    }
}

impl Display for EventStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
