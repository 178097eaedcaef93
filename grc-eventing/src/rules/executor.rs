//! 动作执行器（ActionExecutor）
//!
//! 规则动作的副作用对引擎不透明：引擎只保证执行顺序，并把
//! `{rule, event, config}` 交给按 `action_type` 注册的执行器。
//!
use super::rule::{AutomationRule, RuleAction};
use crate::envelope::EventEnvelope;
use crate::error::{EventingError, EventingResult as Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// 交给执行器的上下文
#[derive(Debug, Clone, Copy)]
pub struct ActionContext<'a> {
    pub rule: &'a AutomationRule,
    pub event: &'a EventEnvelope,
    pub config: &'a Value,
}

#[async_trait]
pub trait ActionExecutor: Send + Sync {
    /// 执行器负责的动作类型
    fn action_type(&self) -> &str;
    async fn execute(&self, ctx: ActionContext<'_>) -> anyhow::Result<()>;
}

/// 构造时一次性确定的执行器表，同一 `action_type` 后注册者覆盖先注册者
#[derive(Clone, Default)]
pub struct ActionRegistry {
    by_type: HashMap<String, Arc<dyn ActionExecutor>>,
}

impl ActionRegistry {
    pub fn new(executors: Vec<Arc<dyn ActionExecutor>>) -> Self {
        let mut by_type: HashMap<String, Arc<dyn ActionExecutor>> = HashMap::new();
        for executor in executors {
            let ty = executor.action_type().to_string();
            if by_type.insert(ty.clone(), executor).is_some() {
                tracing::warn!(action_type = %ty, "duplicate action executor replaced");
            }
        }
        Self { by_type }
    }

    pub fn contains(&self, action_type: &str) -> bool {
        self.by_type.contains_key(action_type)
    }

    pub fn action_types(&self) -> Vec<&str> {
        self.by_type.keys().map(String::as_str).collect()
    }

    /// 执行单个动作，失败统一转换为 `ActionExecution`/`UnknownAction`
    pub async fn execute(
        &self,
        rule: &AutomationRule,
        event: &EventEnvelope,
        action: &RuleAction,
    ) -> Result<()> {
        let executor = self
            .by_type
            .get(&action.action_type)
            .ok_or_else(|| EventingError::UnknownAction(action.action_type.clone()))?;

        executor
            .execute(ActionContext {
                rule,
                event,
                config: &action.config,
            })
            .await
            .map_err(|err| EventingError::ActionExecution {
                action_type: action.action_type.clone(),
                reason: err.to_string(),
            })
    }
}
