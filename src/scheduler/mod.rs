//! The three background pipelines: recurring materialization, budget alerts
//! and monthly reports, each on its own fixed cadence.

mod budget_monitor;
mod dispatcher;
mod processor;
mod report;
mod throttle;
mod worker;

pub(crate) use budget_monitor::{BudgetCycleSummary, BudgetMonitor};
pub(crate) use dispatcher::dispatch_due;
pub(crate) use processor::OccurrenceProcessor;
pub(crate) use report::{ReportCycleSummary, ReportGenerator};
pub(crate) use throttle::UserThrottle;
pub(crate) use worker::{drain_sequential, DrainSummary, RetryPolicy, WorkerPool};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::calendar::{Cadence, Clock, SystemClock};
use crate::config::Config;
use crate::db::Ledger;
use crate::insights::{GeminiInsights, InsightGenerator};
use crate::notify::{Notifier, OutboxNotifier};
use crate::queue::{self, MemoryQueue};

/// Everything the pipelines share, built once from config.
pub(crate) struct Scheduler {
    ledger: Ledger,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    monitor: Arc<BudgetMonitor>,
    reports: Arc<ReportGenerator>,
    workers: usize,
    user_rate_limit: usize,
}

impl Scheduler {
    pub(crate) fn from_config(config: &Config, ledger: Ledger) -> Result<Self> {
        let notifier: Arc<dyn Notifier> = Arc::new(OutboxNotifier::new(ledger.clone()));
        let insights: Option<Arc<dyn InsightGenerator>> = match &config.gemini_api_key {
            Some(key) => Some(Arc::new(
                GeminiInsights::new(key.clone(), config.gemini_model.clone())
                    .context("Failed to set up insight generator")?,
            )),
            None => {
                info!("GEMINI_API_KEY not set; monthly reports use fallback insights");
                None
            }
        };

        let policy = RetryPolicy::new(config.max_attempts, config.task_timeout);
        let dead_letters = Arc::new(ledger.clone());
        let monitor = BudgetMonitor::new(
            ledger.clone(),
            notifier.clone(),
            dead_letters.clone(),
            config.alert_threshold,
            policy,
        );
        let reports = ReportGenerator::new(ledger.clone(), notifier, insights, dead_letters, policy);

        Ok(Self {
            ledger,
            clock: Arc::new(SystemClock),
            policy,
            monitor: Arc::new(monitor),
            reports: Arc::new(reports),
            workers: config.workers,
            user_rate_limit: config.user_rate_limit,
        })
    }

    fn processor(&self) -> Arc<OccurrenceProcessor> {
        Arc::new(OccurrenceProcessor::new(self.ledger.clone(), self.clock.clone()))
    }

    /// Runs all three triggers and the worker pool until `cancel` fires.
    pub(crate) async fn run(self, cancel: CancellationToken) -> Result<()> {
        let (queue, rx) = queue::channel();
        let pool = WorkerPool::new(
            self.processor(),
            Arc::new(queue.clone()),
            Arc::new(self.ledger.clone()),
            UserThrottle::per_minute(self.user_rate_limit),
            self.policy,
            self.workers,
        );
        let pool = tokio::spawn(pool.run(rx, cancel.clone()));

        let ledger = self.ledger.clone();
        let recurring = tokio::spawn(run_trigger(
            Cadence::Daily,
            "recurring-dispatch",
            cancel.clone(),
            move |now| {
                let ledger = ledger.clone();
                let queue: MemoryQueue = queue.clone();
                async move { dispatch_due(&ledger, &queue, now).await.map(|_| ()) }
            },
        ));

        let monitor = self.monitor.clone();
        let budgets = tokio::spawn(run_trigger(
            Cadence::EverySixHours,
            "budget-check",
            cancel.clone(),
            move |now| {
                let monitor = monitor.clone();
                async move { monitor.run_cycle(now).await.map(|_| ()) }
            },
        ));

        let reports = self.reports.clone();
        let monthly = tokio::spawn(run_trigger(
            Cadence::Monthly,
            "monthly-report",
            cancel.clone(),
            move |now| {
                let reports = reports.clone();
                async move { reports.run_cycle(now).await.map(|_| ()) }
            },
        ));

        let (pool, recurring, budgets, monthly) = tokio::join!(pool, recurring, budgets, monthly);
        for joined in [pool, recurring, budgets, monthly] {
            joined.context("Scheduler task panicked")?;
        }
        Ok(())
    }

    // ── One-shot cycles for the CLI ───────────────────────────

    pub(crate) async fn run_recurring_once(&self) -> Result<(usize, DrainSummary)> {
        let (queue, mut rx) = queue::channel();
        let dispatched = dispatch_due(&self.ledger, &queue, self.clock.now()).await?;
        let processor = self.processor();
        let summary =
            drain_sequential(&mut rx, processor.as_ref(), &self.ledger, &self.policy).await;
        Ok((dispatched, summary))
    }

    pub(crate) async fn run_budgets_once(&self) -> Result<BudgetCycleSummary> {
        self.monitor.run_cycle(self.clock.now()).await
    }

    pub(crate) async fn run_reports_once(&self) -> Result<ReportCycleSummary> {
        self.reports.run_cycle(self.clock.now()).await
    }
}

/// Fires `cycle` at each of the cadence's wall-clock times until cancelled.
/// A failed cycle is logged and the trigger waits for its next slot.
async fn run_trigger<F, Fut>(
    cadence: Cadence,
    name: &'static str,
    cancel: CancellationToken,
    mut cycle: F,
) where
    F: FnMut(DateTime<Utc>) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    info!(trigger = name, schedule = cadence.describe(), "trigger armed");
    loop {
        let now = Utc::now();
        let next = cadence.next_fire(now);
        let wait = (next - now).to_std().unwrap_or_default();
        info!(trigger = name, next = %next, "next fire scheduled");

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }

        if let Err(e) = cycle(Utc::now()).await {
            error!(trigger = name, error = %format!("{e:#}"), "cycle failed");
        }
    }
    info!(trigger = name, "trigger stopped");
}
