//! 批量写入器（Batcher）
//!
//! 将放行的发布请求合并为批次，摊薄存储往返：
//! - 队列达到 `max_batch_size`，或首条未刷写事件到达后经过 `max_wait`，二者先到者触发刷写；
//! - 刷写期间不再计时，刷写结束后若已有新事件到达则立即重新计时；
//! - 成功时每个结果句柄按下标收到对应的持久化信封；失败时全部句柄收到同一个错误，
//!   本层不做部分重试。
//!
//! 待刷写列表只由后台任务持有与修改，外部通过通道提交命令。
//! 关闭批量时 `add` 退化为同步直写（单条批次）。
//!
use crate::config::BatchConfig;
use crate::envelope::{EventEnvelope, NewEvent};
use crate::error::{EventingError, EventingResult as Result};
use crate::store::EventStore;
use futures_util::future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

type Reply = oneshot::Sender<Result<EventEnvelope>>;

enum BatchCommand {
    Add(NewEvent, Reply),
    Flush(oneshot::Sender<()>),
}

/// 单条写入的结果句柄
pub struct PendingWrite {
    rx: oneshot::Receiver<Result<EventEnvelope>>,
}

impl PendingWrite {
    fn ready(result: Result<EventEnvelope>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }

    /// 等待所在批次刷写完成
    pub async fn wait(self) -> Result<EventEnvelope> {
        self.rx
            .await
            .map_err(|_| EventingError::ComponentClosed("batcher"))?
    }
}

/// 刷写统计
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub batches_flushed: u64,
    pub events_flushed: u64,
    pub batches_failed: u64,
}

#[derive(Default)]
struct Counters {
    batches_flushed: AtomicU64,
    events_flushed: AtomicU64,
    batches_failed: AtomicU64,
}

pub struct Batcher {
    tenant_id: String,
    store: Arc<dyn EventStore>,
    config: BatchConfig,
    tx: mpsc::UnboundedSender<BatchCommand>,
    counters: Arc<Counters>,
    token: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Batcher {
    /// 启动批量写入器；启用批量时会在当前 tokio 运行时中派生刷写任务
    pub fn start(
        tenant_id: impl Into<String>,
        store: Arc<dyn EventStore>,
        config: BatchConfig,
    ) -> Self {
        let tenant_id = tenant_id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());
        let token = CancellationToken::new();

        let task = config.enabled.then(|| {
            tokio::spawn(Self::run(
                FlushContext {
                    tenant_id: tenant_id.clone(),
                    store: store.clone(),
                    counters: counters.clone(),
                },
                config.clone(),
                rx,
                token.clone(),
            ))
        });

        Self {
            tenant_id,
            store,
            config,
            tx,
            counters,
            token,
            task: Mutex::new(task),
        }
    }

    /// 提交一条候选事件，返回其结果句柄
    pub async fn add(&self, event: NewEvent) -> Result<PendingWrite> {
        if !self.config.enabled {
            let result = self.store.write(&self.tenant_id, event).await;
            self.counters.record(1, result.is_ok());
            return Ok(PendingWrite::ready(result));
        }

        let (reply, rx) = oneshot::channel();
        self.tx
            .send(BatchCommand::Add(event, reply))
            .map_err(|_| EventingError::ComponentClosed("batcher"))?;
        Ok(PendingWrite { rx })
    }

    /// 立即刷写当前待写事件，并等待刷写完成
    pub async fn flush(&self) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        let (done, rx) = oneshot::channel();
        self.tx
            .send(BatchCommand::Flush(done))
            .map_err(|_| EventingError::ComponentClosed("batcher"))?;
        rx.await
            .map_err(|_| EventingError::ComponentClosed("batcher"))
    }

    /// 停止后台任务；已提交的事件会在退出前刷写
    pub async fn shutdown(&self) {
        self.token.cancel();
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
    }

    pub fn stats(&self) -> BatchStats {
        BatchStats {
            batches_flushed: self.counters.batches_flushed.load(Ordering::Relaxed),
            events_flushed: self.counters.events_flushed.load(Ordering::Relaxed),
            batches_failed: self.counters.batches_failed.load(Ordering::Relaxed),
        }
    }

    async fn run(
        ctx: FlushContext,
        config: BatchConfig,
        mut rx: mpsc::UnboundedReceiver<BatchCommand>,
        token: CancellationToken,
    ) {
        let mut pending: Vec<(NewEvent, Reply)> = Vec::new();
        let mut deadline: Option<Instant> = None;

        loop {
            let sleep_at = deadline;
            let timer = async move {
                match sleep_at {
                    Some(at) => time::sleep_until(at).await,
                    None => future::pending().await,
                }
            };

            tokio::select! {
                _ = token.cancelled() => {
                    rx.close();
                    while let Some(cmd) = rx.recv().await {
                        match cmd {
                            BatchCommand::Add(event, reply) => pending.push((event, reply)),
                            BatchCommand::Flush(done) => {
                                let _ = done.send(());
                            }
                        }
                    }
                    ctx.flush(&mut pending).await;
                    break;
                }
                cmd = rx.recv() => match cmd {
                    Some(BatchCommand::Add(event, reply)) => {
                        if pending.is_empty() {
                            deadline = Some(Instant::now() + config.max_wait);
                        }
                        pending.push((event, reply));
                        if pending.len() >= config.max_batch_size {
                            ctx.flush(&mut pending).await;
                            deadline = None;
                        }
                    }
                    Some(BatchCommand::Flush(done)) => {
                        ctx.flush(&mut pending).await;
                        deadline = None;
                        let _ = done.send(());
                    }
                    None => {
                        ctx.flush(&mut pending).await;
                        break;
                    }
                },
                _ = timer => {
                    ctx.flush(&mut pending).await;
                    deadline = None;
                }
            }
        }
    }
}

impl Drop for Batcher {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl Counters {
    fn record(&self, events: u64, ok: bool) {
        if ok {
            self.batches_flushed.fetch_add(1, Ordering::Relaxed);
            self.events_flushed.fetch_add(events, Ordering::Relaxed);
        } else {
            self.batches_failed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

struct FlushContext {
    tenant_id: String,
    store: Arc<dyn EventStore>,
    counters: Arc<Counters>,
}

impl FlushContext {
    async fn flush(&self, pending: &mut Vec<(NewEvent, Reply)>) {
        if pending.is_empty() {
            return;
        }

        let (events, replies): (Vec<NewEvent>, Vec<Reply>) =
            std::mem::take(pending).into_iter().unzip();
        let count = events.len();

        let result = self
            .store
            .write_batch(&self.tenant_id, events)
            .await
            .and_then(|stored| {
                if stored.len() == count {
                    Ok(stored)
                } else {
                    Err(EventingError::store_write(format!(
                        "batch result length mismatch: expected={count}, got={}",
                        stored.len()
                    )))
                }
            });

        match result {
            Ok(stored) => {
                tracing::debug!(tenant_id = %self.tenant_id, size = count, "batch flushed");
                self.counters.record(count as u64, true);
                for (reply, envelope) in replies.into_iter().zip(stored) {
                    let _ = reply.send(Ok(envelope));
                }
            }
            Err(err) => {
                tracing::error!(
                    tenant_id = %self.tenant_id,
                    size = count,
                    error = %err,
                    "batch write failed"
                );
                self.counters.record(count as u64, false);
                for reply in replies {
                    let _ = reply.send(Err(err.clone()));
                }
            }
        }
    }
}
