//! 延迟队列（ScheduledQueue）
//!
//! 在 `PriorityQueue` 之上增加延迟入队：`schedule` 派生一个定时任务，
//! 到期后调用 `enqueue`；到期前可用 `cancel_scheduled` 撤销。
//!
use super::item::QueueItemId;
use super::priority::PriorityQueue;
use crate::envelope::EventEnvelope;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub type ScheduleId = Uuid;

pub struct ScheduledQueue<T> {
    queue: Arc<PriorityQueue<T>>,
    timers: Arc<DashMap<ScheduleId, CancellationToken>>,
}

impl<T> ScheduledQueue<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(queue: Arc<PriorityQueue<T>>) -> Self {
        Self {
            queue,
            timers: Arc::new(DashMap::new()),
        }
    }

    pub fn queue(&self) -> &Arc<PriorityQueue<T>> {
        &self.queue
    }

    /// 延迟 `delay` 后以事件自身优先级入队；需在 tokio 运行时中调用
    ///
    /// 返回的接收端在入队完成时收到工作项 id，撤销时被关闭。
    pub fn schedule(
        &self,
        event: EventEnvelope,
        payload: T,
        delay: Duration,
    ) -> (ScheduleId, oneshot::Receiver<QueueItemId>) {
        let id = Uuid::new_v4();
        let token = CancellationToken::new();
        let (tx, rx) = oneshot::channel();
        self.timers.insert(id, token.clone());

        let queue = self.queue.clone();
        let timers = self.timers.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    // 与 cancel_scheduled 竞争时，以先移除登记者为准
                    if timers.remove(&id).is_some() {
                        let priority = event.priority();
                        let item_id = queue.enqueue(event, payload, priority, None);
                        tracing::debug!(schedule_id = %id, %item_id, "scheduled item enqueued");
                        let _ = tx.send(item_id);
                    }
                }
            }
        });

        (id, rx)
    }

    /// 撤销尚未到期的延迟入队，返回是否撤销成功
    pub fn cancel_scheduled(&self, id: &ScheduleId) -> bool {
        match self.timers.remove(id) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn scheduled_count(&self) -> usize {
        self.timers.len()
    }
}

impl<T> Drop for ScheduledQueue<T> {
    fn drop(&mut self) {
        for entry in self.timers.iter() {
            entry.value().cancel();
        }
    }
}
