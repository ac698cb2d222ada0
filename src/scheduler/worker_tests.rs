#![allow(clippy::unwrap_used)]

use super::*;
use crate::queue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

// ── Test doubles ──────────────────────────────────────────────

#[derive(Default)]
struct RecordingSink {
    letters: Mutex<Vec<(serde_json::Value, String, u32)>>,
}

impl RecordingSink {
    fn letters(&self) -> Vec<(serde_json::Value, String, u32)> {
        self.letters.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeadLetterSink for RecordingSink {
    async fn dead_letter(
        &self,
        task: serde_json::Value,
        error: &SchedulerError,
        attempts: u32,
    ) -> Result<()> {
        self.letters
            .lock()
            .unwrap()
            .push((task, error.to_string(), attempts));
        Ok(())
    }
}

/// Outcome chosen by transaction id: 1 processed, 2 skipped, 3 bad data,
/// 4 store failure, 5 hangs.
#[derive(Default)]
struct ScriptedHandler {
    calls: AtomicUsize,
}

#[async_trait]
impl TaskHandler for ScriptedHandler {
    async fn handle(&self, task: &OccurrenceTask) -> Result<Outcome, SchedulerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match task.transaction_id {
            2 => Ok(Outcome::Skipped(SkipReason::NotDue)),
            3 => Err(SchedulerError::DataIntegrity("no interval".into())),
            4 => Err(SchedulerError::Store(anyhow::anyhow!("database is locked"))),
            5 => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Outcome::Processed)
            }
            _ => Ok(Outcome::Processed),
        }
    }
}

/// Takes a while per task and tracks how many run at once.
#[derive(Default)]
struct SlowHandler {
    current: AtomicUsize,
    peak: AtomicUsize,
    done: AtomicUsize,
    attempts_seen: Mutex<Vec<u32>>,
}

#[async_trait]
impl TaskHandler for SlowHandler {
    async fn handle(&self, task: &OccurrenceTask) -> Result<Outcome, SchedulerError> {
        let running = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        self.attempts_seen.lock().unwrap().push(task.attempt);
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        self.done.fetch_add(1, Ordering::SeqCst);
        Ok(Outcome::Processed)
    }
}

fn policy() -> RetryPolicy {
    RetryPolicy::new(2, Duration::from_secs(30))
}

fn task(id: i64) -> OccurrenceTask {
    OccurrenceTask::new(id, "u1".into())
}

// ── Retry policy ──────────────────────────────────────────────

#[test]
fn test_backoff_doubles_per_attempt() {
    let p = policy();
    assert_eq!(p.backoff(0), Duration::from_secs(1));
    assert_eq!(p.backoff(1), Duration::from_secs(2));
    assert_eq!(p.backoff(3), Duration::from_secs(8));
    assert!(p.has_attempts_left(0));
    assert!(!p.has_attempts_left(1));
}

#[test]
fn test_policy_always_allows_one_attempt() {
    let p = RetryPolicy::new(0, Duration::from_secs(1));
    assert_eq!(p.max_attempts, 1);
    assert!(!p.has_attempts_left(0));
}

#[tokio::test]
async fn test_execute_attempt_dispositions() {
    let handler = ScriptedHandler::default();
    let p = policy();

    assert!(matches!(
        execute_attempt(&handler, &task(1), &p).await,
        Disposition::Ack(Outcome::Processed)
    ));
    assert!(matches!(
        execute_attempt(&handler, &task(2), &p).await,
        Disposition::Ack(Outcome::Skipped(SkipReason::NotDue))
    ));

    match execute_attempt(&handler, &task(4), &p).await {
        Disposition::Retry { task, delay } => {
            assert_eq!(task.attempt, 1);
            assert_eq!(delay, Duration::from_secs(1));
        }
        other => panic!("expected retry, got {other:?}"),
    }

    // last attempt used up
    let last = task(4).next_attempt();
    assert!(matches!(
        execute_attempt(&handler, &last, &p).await,
        Disposition::DeadLetter(SchedulerError::Store(_))
    ));

    // bad data is never retried
    assert!(matches!(
        execute_attempt(&handler, &task(3), &p).await,
        Disposition::DeadLetter(SchedulerError::DataIntegrity(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_execute_attempt_times_out() {
    let handler = ScriptedHandler::default();
    match execute_attempt(&handler, &task(5), &policy()).await {
        Disposition::Retry { task, .. } => assert_eq!(task.attempt, 1),
        other => panic!("expected retry after timeout, got {other:?}"),
    }
    let last = task(5).next_attempt();
    assert!(matches!(
        execute_attempt(&handler, &last, &policy()).await,
        Disposition::DeadLetter(SchedulerError::Timeout(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_retry_with_backoff_recovers() {
    let calls = &AtomicUsize::new(0);
    let start = tokio::time::Instant::now();
    let value = retry_with_backoff(&policy(), || async move {
        if calls.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(SchedulerError::Notification(anyhow::anyhow!("smtp timeout")))
        } else {
            Ok(42)
        }
    })
    .await
    .unwrap();
    assert_eq!(value, 42);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(start.elapsed() >= Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_retry_with_backoff_gives_up() {
    let calls = &AtomicUsize::new(0);
    let exhausted = retry_with_backoff(&policy(), || async move {
        calls.fetch_add(1, Ordering::SeqCst);
        Err::<(), _>(SchedulerError::Store(anyhow::anyhow!("disk full")))
    })
    .await
    .unwrap_err();
    assert_eq!(exhausted.attempts, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let calls = &AtomicUsize::new(0);
    let exhausted = retry_with_backoff(&policy(), || async move {
        calls.fetch_add(1, Ordering::SeqCst);
        Err::<(), _>(SchedulerError::DataIntegrity("budget 9 has no amount".into()))
    })
    .await
    .unwrap_err();
    assert_eq!(exhausted.attempts, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

// ── Pool ──────────────────────────────────────────────────────

async fn wait_for(mut done: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached");
}

#[tokio::test(start_paused = true)]
async fn test_pool_throttles_a_busy_user() {
    let handler = Arc::new(SlowHandler::default());
    let sink = Arc::new(RecordingSink::default());
    let (queue, rx) = queue::channel();
    let pool = WorkerPool::new(
        handler.clone(),
        Arc::new(queue.clone()),
        sink.clone(),
        UserThrottle::per_minute(10),
        policy(),
        16,
    );
    let cancel = CancellationToken::new();
    let start = tokio::time::Instant::now();
    let running = tokio::spawn(pool.run(rx, cancel.clone()));

    for id in 1..=25 {
        queue.enqueue(task(id)).unwrap();
    }
    wait_for(|| handler.done.load(Ordering::SeqCst) == 25).await;

    assert!(handler.peak.load(Ordering::SeqCst) <= 10);
    // 10 per rolling minute: the last five wait for the third window
    assert!(start.elapsed() >= Duration::from_secs(120));
    assert!(handler.attempts_seen.lock().unwrap().iter().all(|a| *a == 0));
    assert!(sink.letters().is_empty());

    cancel.cancel();
    running.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_pool_does_not_throttle_across_users() {
    let handler = Arc::new(SlowHandler::default());
    let (queue, rx) = queue::channel();
    let pool = WorkerPool::new(
        handler.clone(),
        Arc::new(queue.clone()),
        Arc::new(RecordingSink::default()),
        UserThrottle::per_minute(10),
        policy(),
        32,
    );
    let cancel = CancellationToken::new();
    let start = tokio::time::Instant::now();
    let running = tokio::spawn(pool.run(rx, cancel.clone()));

    for id in 1..=20 {
        let user = if id % 2 == 0 { "even" } else { "odd" };
        queue.enqueue(OccurrenceTask::new(id, user.into())).unwrap();
    }
    wait_for(|| handler.done.load(Ordering::SeqCst) == 20).await;
    assert!(start.elapsed() < Duration::from_secs(60));

    cancel.cancel();
    running.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_pool_retries_then_dead_letters() {
    let handler = Arc::new(ScriptedHandler::default());
    let sink = Arc::new(RecordingSink::default());
    let (queue, rx) = queue::channel();
    let pool = WorkerPool::new(
        handler.clone(),
        Arc::new(queue.clone()),
        sink.clone(),
        UserThrottle::per_minute(10),
        policy(),
        4,
    );
    let cancel = CancellationToken::new();
    let running = tokio::spawn(pool.run(rx, cancel.clone()));

    queue.enqueue(task(4)).unwrap();
    wait_for(|| !sink.letters().is_empty()).await;

    let letters = sink.letters();
    assert_eq!(letters.len(), 1);
    let (record, error, attempts) = &letters[0];
    assert_eq!(record["transaction_id"], 4);
    assert_eq!(record["user_id"], "u1");
    assert!(error.contains("database is locked"));
    assert_eq!(*attempts, 2);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 2);

    cancel.cancel();
    running.await.unwrap();
}

// ── Sequential drain ──────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_drain_sequential_summarizes() {
    let handler = ScriptedHandler::default();
    let sink = RecordingSink::default();
    let (queue, mut rx) = queue::channel();
    for id in [1, 2, 3, 4] {
        queue.enqueue(task(id)).unwrap();
    }

    let summary = drain_sequential(&mut rx, &handler, &sink, &policy()).await;
    assert_eq!(
        summary,
        DrainSummary {
            processed: 1,
            skipped: 1,
            dead_lettered: 2,
        }
    );
    // 1, 2, 3 once; 4 twice
    assert_eq!(handler.calls.load(Ordering::SeqCst), 5);
    let attempts: Vec<u32> = sink.letters().iter().map(|l| l.2).collect();
    assert_eq!(attempts, vec![1, 2]);
}
