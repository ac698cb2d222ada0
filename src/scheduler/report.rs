use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{error, info};

use super::worker::{retry_with_backoff, DeadLetterSink, Exhausted, RetryPolicy};
use crate::calendar::DateRange;
use crate::db::Ledger;
use crate::error::SchedulerError;
use crate::insights::{insights_or_fallback, InsightGenerator};
use crate::models::User;
use crate::notify::{monthly_report_subject, NotificationPayload, Notifier};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct ReportCycleSummary {
    pub sent: usize,
    pub failed: usize,
}

/// Builds and sends each user's report for the month before the trigger.
pub(crate) struct ReportGenerator {
    ledger: Ledger,
    notifier: Arc<dyn Notifier>,
    insights: Option<Arc<dyn InsightGenerator>>,
    dead_letters: Arc<dyn DeadLetterSink>,
    policy: RetryPolicy,
}

impl ReportGenerator {
    pub(crate) fn new(
        ledger: Ledger,
        notifier: Arc<dyn Notifier>,
        insights: Option<Arc<dyn InsightGenerator>>,
        dead_letters: Arc<dyn DeadLetterSink>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            ledger,
            notifier,
            insights,
            dead_letters,
            policy,
        }
    }

    pub(crate) async fn run_cycle(&self, now: DateTime<Utc>) -> Result<ReportCycleSummary> {
        let users = self.ledger.call(|db| db.get_users()).await?;
        let range = DateRange::previous_month(now);
        let month = range.month_label();

        let mut summary = ReportCycleSummary::default();
        for user in &users {
            match self.report_for_user(user, range, &month).await {
                Ok(()) => summary.sent += 1,
                Err(exhausted) => {
                    summary.failed += 1;
                    error!(
                        user_id = %user.id,
                        month = %month,
                        attempts = exhausted.attempts,
                        error = %exhausted.error,
                        "monthly report failed"
                    );
                    let record = serde_json::json!({
                        "kind": "monthly-report",
                        "user_id": user.id,
                        "month": month,
                    });
                    if let Err(e) = self
                        .dead_letters
                        .dead_letter(record, &exhausted.error, exhausted.attempts)
                        .await
                    {
                        error!(user_id = %user.id, error = %format!("{e:#}"), "failed to record dead letter");
                    }
                }
            }
        }

        info!(
            month = %month,
            sent = summary.sent,
            failed = summary.failed,
            "monthly report cycle complete"
        );
        Ok(summary)
    }

    async fn report_for_user(
        &self,
        user: &User,
        range: DateRange,
        month: &str,
    ) -> Result<(), Exhausted> {
        let stats = retry_with_backoff(&self.policy, || {
            let user_id = user.id.clone();
            let ledger = self.ledger.clone();
            async move {
                ledger
                    .call(move |db| db.aggregate_monthly(&user_id, range))
                    .await
                    .map_err(SchedulerError::from_store)
            }
        })
        .await?;

        let insights = insights_or_fallback(self.insights.as_deref(), &stats, month).await;
        let payload = NotificationPayload::MonthlyReport {
            user_name: user.display_name().to_string(),
            month: month.to_string(),
            stats,
            insights,
        };
        let subject = monthly_report_subject(month);

        let (notifier, subject, payload) = (&self.notifier, &subject, &payload);
        retry_with_backoff(&self.policy, || async move {
            notifier
                .send(&user.email, subject, payload)
                .await
                .map_err(SchedulerError::Notification)
        })
        .await?;

        info!(user_id = %user.id, month, "monthly report sent");
        Ok(())
    }
}
