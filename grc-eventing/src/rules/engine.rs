//! 规则引擎（RuleEngine）
//!
//! - 同一事件匹配多条规则时按 `priority` 降序执行，优先级相同保持规则登记顺序；
//! - 单条规则内动作按列表顺序执行；
//! - `immediate` 规则在分发路径上同步执行，单个动作失败只记录日志，不影响后续动作与规则；
//! - `deferred` 规则整体作为一个工作项交给优先级队列，由 `start` 启动的常驻任务执行，
//!   失败按队列的重试策略整体重试，动作执行器需容忍重复执行。
//!
//! 引擎以 `*` 过滤表达式注册为总线订阅者（见 `attach`）。
//!
use super::executor::{ActionExecutor, ActionRegistry};
use super::rule::{AutomationRule, ExecutionMode};
use crate::config::RuleEngineConfig;
use crate::envelope::EventEnvelope;
use crate::error::EventingResult as Result;
use crate::eventing::{Delivery, EventBus, EventSubscriber, SubscriptionHandle};
use crate::queue::{PriorityQueue, ProcessReport, QueueHandler, QueueItem, QueueItemId};
use async_trait::async_trait;
use bon::bon;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 延迟执行的规则（队列工作项载荷）
#[derive(Debug, Clone)]
pub struct DeferredAction {
    pub rule: AutomationRule,
}

/// 单个事件的规则处理结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleDispatchReport {
    pub event_id: String,
    /// 按执行顺序排列的匹配规则 id
    pub matched_rules: Vec<String>,
    /// 同步执行成功的动作数
    pub executed: usize,
    /// 同步执行失败的动作数
    pub failed: usize,
    /// 延迟规则对应的队列工作项
    pub deferred: Vec<QueueItemId>,
}

pub struct RuleEngine {
    actions: Arc<ActionRegistry>,
    rules: RwLock<Vec<AutomationRule>>,
    queue: Arc<PriorityQueue<DeferredAction>>,
}

#[bon]
impl RuleEngine {
    #[builder]
    pub fn new(
        #[builder(default)] actions: Vec<Arc<dyn ActionExecutor>>,
        #[builder(default)] rules: Vec<AutomationRule>,
        #[builder(default)] config: RuleEngineConfig,
    ) -> Self {
        Self {
            actions: Arc::new(ActionRegistry::new(actions)),
            rules: RwLock::new(rules),
            queue: Arc::new(PriorityQueue::new(config.queue)),
        }
    }
}

impl RuleEngine {
    pub fn actions(&self) -> &ActionRegistry {
        &self.actions
    }

    /// 延迟规则所在的队列（用于检查失败项、批量重试等）
    pub fn queue(&self) -> &Arc<PriorityQueue<DeferredAction>> {
        &self.queue
    }

    pub fn rules(&self) -> Vec<AutomationRule> {
        self.read_rules().clone()
    }

    pub fn set_rules(&self, rules: Vec<AutomationRule>) {
        *self.write_rules() = rules;
    }

    /// 从 JSON 数组整体替换规则，返回规则数
    pub fn load_rules_json(&self, json: &str) -> Result<usize> {
        let rules: Vec<AutomationRule> = serde_json::from_str(json)?;
        let count = rules.len();
        self.set_rules(rules);
        Ok(count)
    }

    /// 按 id 插入或替换，返回被替换的旧规则
    pub fn upsert_rule(&self, rule: AutomationRule) -> Option<AutomationRule> {
        let mut rules = self.write_rules();
        match rules.iter_mut().find(|r| r.id == rule.id) {
            Some(existing) => Some(std::mem::replace(existing, rule)),
            None => {
                rules.push(rule);
                None
            }
        }
    }

    pub fn remove_rule(&self, rule_id: &str) -> Option<AutomationRule> {
        let mut rules = self.write_rules();
        let pos = rules.iter().position(|r| r.id == rule_id)?;
        Some(rules.remove(pos))
    }

    /// 对一个事件执行全部匹配规则
    pub async fn process_event(&self, event: &EventEnvelope) -> RuleDispatchReport {
        let mut matched: Vec<AutomationRule> = self
            .read_rules()
            .iter()
            .filter(|rule| rule.matches(event))
            .cloned()
            .collect();
        // 稳定排序：同优先级保持登记顺序
        matched.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut report = RuleDispatchReport {
            event_id: event.id().to_string(),
            ..Default::default()
        };

        for rule in matched {
            report.matched_rules.push(rule.id.clone());
            let mode = rule.execution_mode;
            match mode {
                ExecutionMode::Immediate => {
                    for action in &rule.actions {
                        match self.actions.execute(&rule, event, action).await {
                            Ok(()) => report.executed += 1,
                            Err(err) => {
                                report.failed += 1;
                                tracing::warn!(
                                    rule_id = %rule.id,
                                    event_id = %event.id(),
                                    action_type = %action.action_type,
                                    error = %err,
                                    "rule action failed"
                                );
                            }
                        }
                    }
                }
                ExecutionMode::Deferred => {
                    let rule_id = rule.id.clone();
                    let item_id =
                        self.queue
                            .enqueue(event.clone(), DeferredAction { rule }, event.priority(), None);
                    tracing::debug!(%rule_id, event_id = %event.id(), %item_id, "rule deferred");
                    report.deferred.push(item_id);
                }
            }
        }

        report
    }

    /// 立即排空延迟队列一次
    pub async fn drain_deferred(&self) -> ProcessReport<DeferredAction> {
        self.queue.process(self.runner()).await
    }

    /// 启动延迟规则的常驻执行任务
    pub fn start(&self) -> RuleEngineHandle {
        let token = CancellationToken::new();
        let worker = self.queue.spawn_worker(self.runner(), token.clone());
        RuleEngineHandle {
            token,
            tasks: vec![worker],
        }
    }

    /// 以 `*` 注册为总线订阅者
    pub async fn attach(self: &Arc<Self>, bus: &EventBus) -> Result<SubscriptionHandle> {
        let subscriber: Arc<dyn EventSubscriber> = self.clone();
        bus.subscribe(["*"], subscriber).await
    }

    fn runner(&self) -> Arc<dyn QueueHandler<DeferredAction>> {
        Arc::new(DeferredRunner {
            actions: self.actions.clone(),
        })
    }

    fn read_rules(&self) -> RwLockReadGuard<'_, Vec<AutomationRule>> {
        self.rules.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_rules(&self) -> RwLockWriteGuard<'_, Vec<AutomationRule>> {
        self.rules.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl EventSubscriber for RuleEngine {
    fn subscriber_name(&self) -> &str {
        "rule-engine"
    }

    async fn on_event(&self, event: &EventEnvelope) -> anyhow::Result<()> {
        self.deliver(event).await.map(|_| ())
    }

    /// 没有规则命中时返回 `Skipped`，不让引擎本身把事件标记为已送达
    async fn deliver(&self, event: &EventEnvelope) -> anyhow::Result<Delivery> {
        let report = self.process_event(event).await;
        if report.matched_rules.is_empty() {
            return Ok(Delivery::Skipped);
        }
        tracing::debug!(
            event_id = %report.event_id,
            rules = report.matched_rules.len(),
            executed = report.executed,
            failed = report.failed,
            deferred = report.deferred.len(),
            "rules dispatched"
        );
        Ok(Delivery::Handled)
    }
}

struct DeferredRunner {
    actions: Arc<ActionRegistry>,
}

#[async_trait]
impl QueueHandler<DeferredAction> for DeferredRunner {
    async fn handle(&self, item: &QueueItem<DeferredAction>) -> anyhow::Result<()> {
        let rule = &item.payload.rule;
        let mut failed = 0usize;

        for action in &rule.actions {
            if let Err(err) = self.actions.execute(rule, &item.event, action).await {
                failed += 1;
                tracing::warn!(
                    rule_id = %rule.id,
                    event_id = %item.event.id(),
                    action_type = %action.action_type,
                    attempt = item.retry_count + 1,
                    error = %err,
                    "deferred rule action failed"
                );
            }
        }

        if failed > 0 {
            anyhow::bail!(
                "{failed} of {} actions failed for rule {}",
                rule.actions.len(),
                rule.id
            );
        }
        Ok(())
    }
}

/// 延迟规则执行任务的句柄，丢弃时停止任务
pub struct RuleEngineHandle {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl RuleEngineHandle {
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub async fn join(mut self) {
        let tasks = std::mem::take(&mut self.tasks);

        for t in tasks {
            let _ = t.await;
        }
    }
}

impl Drop for RuleEngineHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
