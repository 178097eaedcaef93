//! 自动化规则
//!
//! - `condition`：条件树及其求值；
//! - `rule`：规则定义与匹配；
//! - `executor`：按动作类型注册的外部执行器；
//! - `engine`：按优先级执行匹配规则，延迟规则交给队列。
//!
mod condition;
mod engine;
mod executor;
mod rule;

pub use condition::{Condition, ConditionOperator};
pub use engine::{DeferredAction, RuleDispatchReport, RuleEngine, RuleEngineHandle};
pub use executor::{ActionContext, ActionExecutor, ActionRegistry};
pub use rule::{AutomationRule, ExecutionMode, RuleAction};
