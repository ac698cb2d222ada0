use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::throttle::{Admission, UserThrottle};
use crate::db::Ledger;
use crate::error::SchedulerError;
use crate::queue::{OccurrenceTask, QueueReceiver, TaskQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SkipReason {
    /// The template is gone or belongs to someone else.
    NotFound,
    /// Already advanced by an earlier delivery, or switched off.
    NotDue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Processed,
    Skipped(SkipReason),
}

#[async_trait]
pub(crate) trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &OccurrenceTask) -> Result<Outcome, SchedulerError>;
}

/// Where work that ran out of attempts ends up.
#[async_trait]
pub(crate) trait DeadLetterSink: Send + Sync {
    async fn dead_letter(
        &self,
        task: serde_json::Value,
        error: &SchedulerError,
        attempts: u32,
    ) -> Result<()>;
}

#[async_trait]
impl DeadLetterSink for Ledger {
    async fn dead_letter(
        &self,
        task: serde_json::Value,
        error: &SchedulerError,
        attempts: u32,
    ) -> Result<()> {
        let task = task.to_string();
        let error = error.to_string();
        self.call(move |db| db.insert_dead_letter(&task, &error, attempts, Utc::now()))
            .await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub timeout: Duration,
}

impl RetryPolicy {
    pub(crate) fn new(max_attempts: u32, timeout: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::from_secs(1),
            timeout,
        }
    }

    /// Delay before redelivering after failed attempt `attempt` (zero-based).
    pub(crate) fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
    }

    pub(crate) fn has_attempts_left(&self, attempt: u32) -> bool {
        attempt + 1 < self.max_attempts
    }
}

/// Final failure of a retried unit of work.
#[derive(Debug)]
pub(crate) struct Exhausted {
    pub error: SchedulerError,
    pub attempts: u32,
}

/// Runs `op` under the policy's timeout until it succeeds, fails
/// permanently, or runs out of attempts. Used for work that is retried in
/// place rather than through the queue.
pub(crate) async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    mut op: F,
) -> Result<T, Exhausted>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SchedulerError>>,
{
    let mut attempt = 0;
    loop {
        let result = match tokio::time::timeout(policy.timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(SchedulerError::Timeout(policy.timeout)),
        };
        match result {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && policy.has_attempts_left(attempt) => {
                let delay = policy.backoff(attempt);
                warn!(attempt, retry_in = ?delay, error = %err, "attempt failed; will retry");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => {
                return Err(Exhausted {
                    error,
                    attempts: attempt + 1,
                })
            }
        }
    }
}

/// What to do with a task after one attempt.
#[derive(Debug)]
pub(crate) enum Disposition {
    Ack(Outcome),
    Retry {
        task: OccurrenceTask,
        delay: Duration,
    },
    DeadLetter(SchedulerError),
}

pub(crate) async fn execute_attempt(
    handler: &dyn TaskHandler,
    task: &OccurrenceTask,
    policy: &RetryPolicy,
) -> Disposition {
    let result = match tokio::time::timeout(policy.timeout, handler.handle(task)).await {
        Ok(result) => result,
        Err(_) => Err(SchedulerError::Timeout(policy.timeout)),
    };

    match result {
        Ok(outcome) => Disposition::Ack(outcome),
        Err(err) if err.is_retryable() && policy.has_attempts_left(task.attempt) => {
            let delay = policy.backoff(task.attempt);
            warn!(
                transaction_id = task.transaction_id,
                user_id = %task.user_id,
                attempt = task.attempt,
                retry_in = ?delay,
                error = %err,
                "occurrence attempt failed; will retry"
            );
            Disposition::Retry {
                task: task.next_attempt(),
                delay,
            }
        }
        Err(err) => Disposition::DeadLetter(err),
    }
}

async fn dead_letter_task(sink: &dyn DeadLetterSink, task: &OccurrenceTask, err: SchedulerError) {
    error!(
        transaction_id = task.transaction_id,
        user_id = %task.user_id,
        attempts = task.attempt + 1,
        error = %err,
        "occurrence task dead-lettered"
    );
    let record = serde_json::to_value(task).unwrap_or(serde_json::Value::Null);
    if let Err(e) = sink.dead_letter(record, &err, task.attempt + 1).await {
        error!(
            transaction_id = task.transaction_id,
            error = %format!("{e:#}"),
            "failed to record dead letter"
        );
    }
}

fn log_ack(task: &OccurrenceTask, outcome: Outcome) {
    match outcome {
        Outcome::Processed => debug!(transaction_id = task.transaction_id, "task acked"),
        Outcome::Skipped(reason) => debug!(
            transaction_id = task.transaction_id,
            ?reason,
            "task acked without changes"
        ),
    }
}

// ── Pool ──────────────────────────────────────────────────────

pub(crate) struct WorkerPool {
    handler: Arc<dyn TaskHandler>,
    queue: Arc<dyn TaskQueue>,
    dead_letters: Arc<dyn DeadLetterSink>,
    throttle: UserThrottle,
    policy: RetryPolicy,
    workers: usize,
}

impl WorkerPool {
    pub(crate) fn new(
        handler: Arc<dyn TaskHandler>,
        queue: Arc<dyn TaskQueue>,
        dead_letters: Arc<dyn DeadLetterSink>,
        throttle: UserThrottle,
        policy: RetryPolicy,
        workers: usize,
    ) -> Self {
        Self {
            handler,
            queue,
            dead_letters,
            throttle,
            policy,
            workers: workers.max(1),
        }
    }

    /// Pulls tasks until the queue closes or `cancel` fires, then waits for
    /// in-flight attempts to settle.
    pub(crate) async fn run(self, mut rx: QueueReceiver, cancel: CancellationToken) {
        let slots = Arc::new(Semaphore::new(self.workers));
        info!(workers = self.workers, "worker pool started");

        loop {
            let task = tokio::select! {
                _ = cancel.cancelled() => break,
                task = rx.recv() => match task {
                    Some(task) => task,
                    None => break,
                },
            };

            let permit = match self.throttle.try_admit(&task.user_id) {
                Admission::Admitted(permit) => permit,
                Admission::Deferred(wait) => {
                    debug!(
                        transaction_id = task.transaction_id,
                        user_id = %task.user_id,
                        wait = ?wait,
                        "user over rate limit; deferring task"
                    );
                    self.queue.enqueue_after(task, wait);
                    continue;
                }
            };

            let slot = tokio::select! {
                // the template stays due, so the next dispatch cycle picks it up
                _ = cancel.cancelled() => break,
                slot = slots.clone().acquire_owned() => match slot {
                    Ok(slot) => slot,
                    Err(_) => break,
                },
            };

            let handler = self.handler.clone();
            let queue = self.queue.clone();
            let sink = self.dead_letters.clone();
            let policy = self.policy;
            tokio::spawn(async move {
                let _slot = slot;
                let _permit = permit;
                match execute_attempt(handler.as_ref(), &task, &policy).await {
                    Disposition::Ack(outcome) => log_ack(&task, outcome),
                    Disposition::Retry { task, delay } => queue.enqueue_after(task, delay),
                    Disposition::DeadLetter(err) => {
                        dead_letter_task(sink.as_ref(), &task, err).await;
                    }
                }
            });
        }

        // every slot back means every spawned attempt has finished
        let _ = slots.acquire_many(self.workers as u32).await;
        info!("worker pool stopped");
    }
}

// ── One-shot runner ───────────────────────────────────────────

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct DrainSummary {
    pub processed: usize,
    pub skipped: usize,
    pub dead_lettered: usize,
}

/// Works through everything already queued, one task at a time, sleeping
/// through retry backoff inline. Used by the CLI's single-cycle runs.
pub(crate) async fn drain_sequential(
    rx: &mut QueueReceiver,
    handler: &dyn TaskHandler,
    sink: &dyn DeadLetterSink,
    policy: &RetryPolicy,
) -> DrainSummary {
    let mut summary = DrainSummary::default();
    while let Some(mut task) = rx.try_recv() {
        loop {
            match execute_attempt(handler, &task, policy).await {
                Disposition::Ack(Outcome::Processed) => summary.processed += 1,
                Disposition::Ack(Outcome::Skipped(_)) => summary.skipped += 1,
                Disposition::Retry { task: next, delay } => {
                    tokio::time::sleep(delay).await;
                    task = next;
                    continue;
                }
                Disposition::DeadLetter(err) => {
                    dead_letter_task(sink, &task, err).await;
                    summary.dead_lettered += 1;
                }
            }
            break;
        }
    }
    summary
}

#[cfg(test)]
#[path = "worker_tests.rs"]
mod tests;
