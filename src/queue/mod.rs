//! At-least-once task transport between the dispatcher and the worker pool.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;

/// One due occurrence to materialize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct OccurrenceTask {
    pub transaction_id: i64,
    pub user_id: String,
    /// Zero-based delivery attempt; bumped on every nack.
    pub attempt: u32,
}

impl OccurrenceTask {
    pub(crate) fn new(transaction_id: i64, user_id: String) -> Self {
        Self {
            transaction_id,
            user_id,
            attempt: 0,
        }
    }

    pub(crate) fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }
}

pub(crate) trait TaskQueue: Send + Sync {
    fn enqueue(&self, task: OccurrenceTask) -> Result<()>;

    /// Redelivers `task` once `delay` has elapsed.
    fn enqueue_after(&self, task: OccurrenceTask, delay: Duration);
}

/// In-process transport over an unbounded tokio channel.
#[derive(Clone)]
pub(crate) struct MemoryQueue {
    tx: mpsc::UnboundedSender<OccurrenceTask>,
}

pub(crate) struct QueueReceiver {
    rx: mpsc::UnboundedReceiver<OccurrenceTask>,
}

pub(crate) fn channel() -> (MemoryQueue, QueueReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (MemoryQueue { tx }, QueueReceiver { rx })
}

impl TaskQueue for MemoryQueue {
    fn enqueue(&self, task: OccurrenceTask) -> Result<()> {
        self.tx
            .send(task)
            .map_err(|e| anyhow!("queue closed, dropped task for transaction {}", e.0.transaction_id))
    }

    fn enqueue_after(&self, task: OccurrenceTask, delay: Duration) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = tx.send(task) {
                tracing::warn!(
                    transaction_id = e.0.transaction_id,
                    "queue closed before delayed redelivery"
                );
            }
        });
    }
}

impl QueueReceiver {
    pub(crate) async fn recv(&mut self) -> Option<OccurrenceTask> {
        self.rx.recv().await
    }

    pub(crate) fn try_recv(&mut self) -> Option<OccurrenceTask> {
        self.rx.try_recv().ok()
    }
}
