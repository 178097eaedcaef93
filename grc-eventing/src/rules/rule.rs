//! 自动化规则（AutomationRule）
//!
//! 规则 = 触发事件类型 + 条件树 + 有序动作列表。
//!
use super::condition::Condition;
use crate::envelope::EventEnvelope;
use bon::Builder;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// 在分发路径上同步执行
    #[default]
    Immediate,
    /// 交给队列异步执行
    Deferred,
}

/// 规则动作：`action_type` 决定由哪个执行器处理，`config` 原样交给执行器
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RuleAction {
    pub action_type: String,
    #[serde(default)]
    pub config: Value,
}

impl RuleAction {
    pub fn new(action_type: impl Into<String>, config: Value) -> Self {
        Self {
            action_type: action_type.into(),
            config,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Builder)]
pub struct AutomationRule {
    #[builder(into)]
    pub id: String,
    #[builder(into)]
    pub name: String,
    #[builder(default)]
    #[serde(default)]
    pub trigger_event_types: Vec<String>,
    /// 空条件组匹配全部触发事件
    #[builder(default)]
    #[serde(default)]
    pub conditions: Condition,
    #[builder(default)]
    #[serde(default)]
    pub actions: Vec<RuleAction>,
    /// 越大越先执行
    #[builder(default)]
    #[serde(default)]
    pub priority: i32,
    #[builder(default)]
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    #[builder(default = true)]
    #[serde(default = "enabled_by_default")]
    pub is_enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl AutomationRule {
    /// 启用 且 事件类型在触发集合内 且 条件成立
    pub fn matches(&self, event: &EventEnvelope) -> bool {
        self.is_enabled
            && self
                .trigger_event_types
                .iter()
                .any(|ty| ty == event.event_type())
            && self.conditions.evaluate(event)
    }
}
