//! Outbound notifications. The daemon writes them to an outbox table; an
//! external mailer owns rendering and delivery.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::db::Ledger;
use crate::models::MonthlyStats;

pub(crate) const BUDGET_ALERT_SUBJECT: &str = "Budget Alert";

pub(crate) fn monthly_report_subject(month: &str) -> String {
    format!("Your Monthly Financial Report - {month}")
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub(crate) enum NotificationPayload {
    BudgetAlert {
        user_name: String,
        percentage_used: Decimal,
        budget_amount: Decimal,
        total_expenses: Decimal,
        account_name: String,
    },
    MonthlyReport {
        user_name: String,
        month: String,
        stats: MonthlyStats,
        insights: Vec<String>,
    },
}

impl NotificationPayload {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::BudgetAlert { .. } => "budget-alert",
            Self::MonthlyReport { .. } => "monthly-report",
        }
    }
}

#[async_trait]
pub(crate) trait Notifier: Send + Sync {
    async fn send(&self, recipient: &str, subject: &str, payload: &NotificationPayload)
        -> Result<()>;
}

pub(crate) struct OutboxNotifier {
    ledger: Ledger,
}

impl OutboxNotifier {
    pub(crate) fn new(ledger: Ledger) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl Notifier for OutboxNotifier {
    async fn send(
        &self,
        recipient: &str,
        subject: &str,
        payload: &NotificationPayload,
    ) -> Result<()> {
        let body = serde_json::to_string(payload).context("Failed to encode notification")?;
        let kind = payload.kind();
        let recipient = recipient.to_string();
        let subject = subject.to_string();
        let id = self
            .ledger
            .call(move |db| db.insert_notification(&recipient, &subject, kind, &body, Utc::now()))
            .await?;
        tracing::debug!(notification_id = id, kind, "notification queued in outbox");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::sync::Mutex;

    /// Records every send; can be told to fail.
    #[derive(Default)]
    pub(crate) struct RecordingNotifier {
        pub sent: Mutex<Vec<(String, String, NotificationPayload)>>,
        pub fail: bool,
    }

    impl RecordingNotifier {
        pub(crate) fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        pub(crate) fn sent(&self) -> Vec<(String, String, NotificationPayload)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send(
            &self,
            recipient: &str,
            subject: &str,
            payload: &NotificationPayload,
        ) -> Result<()> {
            if self.fail {
                anyhow::bail!("mailer unavailable");
            }
            self.sent.lock().unwrap().push((
                recipient.to_string(),
                subject.to_string(),
                payload.clone(),
            ));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::db::Database;
    use rust_decimal_macros::dec;

    #[test]
    fn test_payload_is_tagged_by_kind() {
        let payload = NotificationPayload::BudgetAlert {
            user_name: "Ada".into(),
            percentage_used: dec!(95.0),
            budget_amount: dec!(1000),
            total_expenses: dec!(950),
            account_name: "Checking".into(),
        };
        let json: serde_json::Value = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "budget-alert");
        assert_eq!(json["account_name"], "Checking");
        assert_eq!(json["percentage_used"], "95.0");
        assert_eq!(payload.kind(), "budget-alert");
    }

    #[test]
    fn test_report_subject_names_the_month() {
        assert_eq!(
            monthly_report_subject("February 2024"),
            "Your Monthly Financial Report - February 2024"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_outbox_notifier_persists_payload() {
        let ledger = Ledger::new(Database::open_in_memory().unwrap());
        let notifier = OutboxNotifier::new(ledger.clone());
        let payload = NotificationPayload::MonthlyReport {
            user_name: "Ada".into(),
            month: "January 2024".into(),
            stats: MonthlyStats::default(),
            insights: vec!["Spend less on coffee.".into()],
        };
        notifier
            .send("ada@example.com", &monthly_report_subject("January 2024"), &payload)
            .await
            .unwrap();

        let records = ledger.call(|db| db.list_notifications(10)).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].recipient, "ada@example.com");
        assert_eq!(records[0].kind, "monthly-report");
        let body: serde_json::Value = serde_json::from_str(&records[0].payload).unwrap();
        assert_eq!(body["month"], "January 2024");
        assert_eq!(body["insights"][0], "Spend less on coffee.");
    }
}
