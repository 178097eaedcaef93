//! 优先级队列（PriorityQueue）
//!
//! - 入队按优先级降序插入，同优先级保持先进先出；
//! - `process` 以不超过 `max_concurrent` 的并发排空队列，工作项经历
//!   `pending → processing → completed/failed`；
//! - 处理失败时 `retry_count` 加一，未达 `max_retries` 则放回队首尽快重试，
//!   否则标记为 failed 并保留，供人工检查或 `retry_failed` 批量重新入队；
//! - 只能取消尚未开始处理的工作项；
//! - 处理被取消时，被中断的在途项退回 pending 并放回队首。
//!
//! 默认不做退避；`QueueConfig::retry_backoff` 可开启指数退避，
//! 此时重试项仍位于队首，但在等待期满前不会被取出。
//!
use super::item::{ProcessReport, QueueItem, QueueItemId, QueueItemStatus, QueueStats};
use crate::config::QueueConfig;
use crate::envelope::{EventEnvelope, EventPriority};
use crate::error::{EventingError, EventingResult as Result};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::FutureExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// 工作项处理器
#[async_trait]
pub trait QueueHandler<T>: Send + Sync {
    async fn handle(&self, item: &QueueItem<T>) -> anyhow::Result<()>;
}

struct QueueState<T> {
    /// 待处理项的出队顺序
    order: VecDeque<QueueItemId>,
    items: HashMap<QueueItemId, QueueItem<T>>,
    /// 退避中的重试项最早可出队时间
    not_before: HashMap<QueueItemId, Instant>,
}

impl<T> QueueState<T> {
    fn insert_by_priority(&mut self, id: QueueItemId, priority: EventPriority) {
        let pos = self
            .order
            .iter()
            .position(|other| {
                self.items
                    .get(other)
                    .is_some_and(|item| item.priority < priority)
            })
            .unwrap_or(self.order.len());
        self.order.insert(pos, id);
    }
}

pub struct PriorityQueue<T> {
    config: QueueConfig,
    state: Mutex<QueueState<T>>,
    notify: Notify,
}

impl<T> PriorityQueue<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            state: Mutex::new(QueueState {
                order: VecDeque::new(),
                items: HashMap::new(),
                not_before: HashMap::new(),
            }),
            notify: Notify::new(),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// 入队，`max_retries` 为空时使用配置默认值
    pub fn enqueue(
        &self,
        event: EventEnvelope,
        payload: T,
        priority: EventPriority,
        max_retries: Option<u32>,
    ) -> QueueItemId {
        let id = Uuid::new_v4();
        let item = QueueItem {
            id,
            event,
            payload,
            priority,
            retry_count: 0,
            max_retries: max_retries.unwrap_or(self.config.default_max_retries),
            status: QueueItemStatus::Pending,
            added_at: Utc::now(),
            last_attempt_at: None,
            last_error: None,
        };

        {
            let mut state = self.lock();
            state.items.insert(id, item);
            state.insert_by_priority(id, priority);
        }
        self.notify.notify_one();

        tracing::debug!(item_id = %id, %priority, "queue item enqueued");
        id
    }

    /// 取消尚未开始处理的工作项
    pub fn cancel(&self, id: &QueueItemId) -> Result<()> {
        let mut state = self.lock();
        let Some(item) = state.items.get(id) else {
            return Err(EventingError::not_found(format!("queue item {id}")));
        };
        if item.status != QueueItemStatus::Pending {
            return Err(EventingError::invalid_state(format!(
                "queue item {id} is {:?}, only pending items can be cancelled",
                item.status
            )));
        }

        state.items.remove(id);
        state.order.retain(|other| other != id);
        state.not_before.remove(id);
        Ok(())
    }

    /// 将全部 failed 项重置后重新入队，返回数量
    pub fn retry_failed(&self) -> usize {
        let count = {
            let mut state = self.lock();
            let failed: Vec<(QueueItemId, EventPriority)> = state
                .items
                .values()
                .filter(|item| item.status == QueueItemStatus::Failed)
                .map(|item| (item.id, item.priority))
                .collect();

            for (id, priority) in &failed {
                if let Some(item) = state.items.get_mut(id) {
                    item.status = QueueItemStatus::Pending;
                    item.retry_count = 0;
                }
                state.insert_by_priority(*id, *priority);
            }
            failed.len()
        };

        if count > 0 {
            self.notify.notify_one();
        }
        count
    }

    /// 丢弃全部 failed 项，返回数量
    pub fn clear_failed(&self) -> usize {
        let mut state = self.lock();
        let before = state.items.len();
        state
            .items
            .retain(|_, item| item.status != QueueItemStatus::Failed);
        before - state.items.len()
    }

    pub fn failed_items(&self) -> Vec<QueueItem<T>> {
        self.lock()
            .items
            .values()
            .filter(|item| item.status == QueueItemStatus::Failed)
            .cloned()
            .collect()
    }

    pub fn get(&self, id: &QueueItemId) -> Option<QueueItem<T>> {
        self.lock().items.get(id).cloned()
    }

    /// 按出队顺序返回待处理项快照
    pub fn pending_items(&self) -> Vec<QueueItem<T>> {
        let state = self.lock();
        state
            .order
            .iter()
            .filter_map(|id| state.items.get(id).cloned())
            .collect()
    }

    /// 待处理项数量
    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.lock();
        let mut stats = QueueStats {
            pending: state.order.len(),
            ..Default::default()
        };
        for item in state.items.values() {
            match item.status {
                QueueItemStatus::Processing => stats.processing += 1,
                QueueItemStatus::Failed => stats.failed += 1,
                QueueItemStatus::Pending | QueueItemStatus::Completed => {}
            }
        }
        stats
    }

    /// 排空队列：并发处理直到没有待处理项与在途项
    ///
    /// 同优先级先进先出；高优先级优先出队，但不会抢占已在处理中的低优先级项。
    pub async fn process(&self, handler: Arc<dyn QueueHandler<T>>) -> ProcessReport<T> {
        self.process_until(handler, &CancellationToken::new()).await
    }

    /// 与 `process` 相同，但 `token` 取消后不再取出新项；
    /// 被中断的在途项退回 pending 并放回队首，不计入重试次数
    pub async fn process_until(
        &self,
        handler: Arc<dyn QueueHandler<T>>,
        token: &CancellationToken,
    ) -> ProcessReport<T> {
        let max_concurrent = self.config.max_concurrent.max(1);
        let mut in_flight: JoinSet<(QueueItemId, std::result::Result<(), String>)> =
            JoinSet::new();
        let mut running: HashSet<QueueItemId> = HashSet::new();
        let mut report = ProcessReport::default();

        loop {
            while !token.is_cancelled() && in_flight.len() < max_concurrent {
                let Some(item) = self.take_ready() else {
                    break;
                };
                running.insert(item.id);
                let handler = handler.clone();
                in_flight.spawn(async move {
                    let outcome = AssertUnwindSafe(handler.handle(&item))
                        .catch_unwind()
                        .await;
                    let result = match outcome {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(err)) => Err(format!("{err:#}")),
                        Err(_) => Err("handler panicked".to_string()),
                    };
                    (item.id, result)
                });
            }

            let wakeup = if token.is_cancelled() {
                None
            } else {
                self.next_wakeup()
            };
            if in_flight.is_empty() && wakeup.is_none() {
                break;
            }

            tokio::select! {
                _ = token.cancelled() => {
                    in_flight.abort_all();
                    while let Some(joined) = in_flight.join_next().await {
                        if let Ok((id, result)) = joined {
                            running.remove(&id);
                            self.settle(id, result, &mut report);
                        }
                    }
                    break;
                }
                joined = in_flight.join_next(), if !in_flight.is_empty() => {
                    match joined {
                        Some(Ok((id, result))) => {
                            running.remove(&id);
                            self.settle(id, result, &mut report);
                        }
                        Some(Err(err)) => {
                            tracing::error!(error = %err, "queue handler task aborted");
                        }
                        None => {}
                    }
                }
                _ = sleep_until(wakeup), if wakeup.is_some() => {}
            }
        }

        self.requeue_interrupted(running);
        report
    }

    /// 启动常驻处理任务：入队时唤醒并排空队列，直到 `token` 被取消
    ///
    /// 取消时正在处理的项退回队首，下次启动的任务会重新处理。
    pub fn spawn_worker(
        self: &Arc<Self>,
        handler: Arc<dyn QueueHandler<T>>,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = queue.notify.notified() => {
                        let report = queue.process_until(handler.clone(), &token).await;
                        if !report.is_empty() {
                            tracing::debug!(
                                completed = report.completed.len(),
                                failed = report.failed.len(),
                                "queue drained"
                            );
                        }
                    }
                }
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_ready(&self) -> Option<QueueItem<T>> {
        let mut state = self.lock();
        let now = Instant::now();
        let pos = state
            .order
            .iter()
            .position(|id| state.not_before.get(id).is_none_or(|at| *at <= now))?;
        let id = state.order.remove(pos)?;
        state.not_before.remove(&id);

        let item = state.items.get_mut(&id)?;
        item.status = QueueItemStatus::Processing;
        item.last_attempt_at = Some(Utc::now());
        Some(item.clone())
    }

    fn next_wakeup(&self) -> Option<Instant> {
        let state = self.lock();
        state
            .order
            .iter()
            .filter_map(|id| state.not_before.get(id).copied())
            .min()
    }

    fn requeue_interrupted(&self, ids: HashSet<QueueItemId>) {
        if ids.is_empty() {
            return;
        }
        {
            let mut guard = self.lock();
            let state = &mut *guard;
            for id in ids {
                if let Some(item) = state.items.get_mut(&id) {
                    if item.status == QueueItemStatus::Processing {
                        item.status = QueueItemStatus::Pending;
                        state.order.push_front(id);
                        tracing::warn!(item_id = %id, "queue item interrupted, requeued");
                    }
                }
            }
        }
        self.notify.notify_one();
    }

    fn settle(
        &self,
        id: QueueItemId,
        result: std::result::Result<(), String>,
        report: &mut ProcessReport<T>,
    ) {
        let mut state = self.lock();
        match result {
            Ok(()) => {
                if let Some(mut item) = state.items.remove(&id) {
                    item.status = QueueItemStatus::Completed;
                    report.completed.push(item);
                }
            }
            Err(reason) => {
                let Some(item) = state.items.get_mut(&id) else {
                    return;
                };
                item.retry_count += 1;
                item.last_error = Some(reason.clone());

                if item.retry_count < item.max_retries {
                    item.status = QueueItemStatus::Pending;
                    let retry_count = item.retry_count;
                    tracing::warn!(
                        item_id = %id,
                        retry_count,
                        error = %reason,
                        "queue item failed, retrying"
                    );
                    state.order.push_front(id);
                    if let Some(delay) = self.config.retry_backoff.delay_for(retry_count) {
                        state.not_before.insert(id, Instant::now() + delay);
                    }
                } else {
                    item.status = QueueItemStatus::Failed;
                    let err = EventingError::RetryExhausted {
                        item_id: id.to_string(),
                        attempts: item.retry_count,
                    };
                    tracing::error!(error = %err, reason = %reason, "queue item failed");
                    report.failed.push(item.clone());
                }
            }
        }
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
