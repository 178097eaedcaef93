use crate::error::{EventingError, EventingResult};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// 事件优先级，全序：low < medium < high < critical
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum EventPriority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl EventPriority {
    pub const ALL: [EventPriority; 4] = [
        EventPriority::Low,
        EventPriority::Medium,
        EventPriority::High,
        EventPriority::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventPriority::Low => "low",
            EventPriority::Medium => "medium",
            EventPriority::High => "high",
            EventPriority::Critical => "critical",
        }
    }
}

impl Display for EventPriority {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventPriority {
    type Err = EventingError;

    fn from_str(s: &str) -> EventingResult<Self> {
        match s {
            "low" => Ok(EventPriority::Low),
            "medium" => Ok(EventPriority::Medium),
            "high" => Ok(EventPriority::High),
            "critical" => Ok(EventPriority::Critical),
            other => Err(EventingError::Parse {
                reason: format!("unknown priority: {other}"),
            }),
        }
    }
}
