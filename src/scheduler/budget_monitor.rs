use anyhow::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, error, info};

use super::worker::{retry_with_backoff, DeadLetterSink, RetryPolicy};
use crate::calendar::{self, DateRange};
use crate::db::Ledger;
use crate::error::SchedulerError;
use crate::models::BudgetTarget;
use crate::notify::{NotificationPayload, Notifier, BUDGET_ALERT_SUBJECT};

/// Whether a budget has already been alerted in the current month.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AlertState {
    NoAlertThisMonth,
    AlertSentThisMonth,
}

impl AlertState {
    pub(crate) fn derive(last_alert_sent: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Self {
        match last_alert_sent {
            Some(sent) if !calendar::is_earlier_month(sent, now) => Self::AlertSentThisMonth,
            _ => Self::NoAlertThisMonth,
        }
    }

    pub(crate) fn should_fire(self, percentage_used: Decimal, threshold: Decimal) -> bool {
        self == Self::NoAlertThisMonth && percentage_used >= threshold
    }
}

/// Share of `amount` spent, as a percentage.
pub(crate) fn percentage_used(
    budget_id: i64,
    total_expenses: Decimal,
    amount: Option<Decimal>,
) -> Result<Decimal, SchedulerError> {
    let amount = amount.ok_or_else(|| {
        SchedulerError::DataIntegrity(format!("budget {budget_id} has no amount"))
    })?;
    if amount <= Decimal::ZERO {
        return Err(SchedulerError::DataIntegrity(format!(
            "budget {budget_id} amount must be positive, got {amount}"
        )));
    }
    total_expenses
        .checked_div(amount)
        .and_then(|ratio| ratio.checked_mul(Decimal::ONE_HUNDRED))
        .ok_or_else(|| {
            SchedulerError::DataIntegrity(format!("budget {budget_id} percentage overflowed"))
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BudgetCheck {
    Alerted,
    BelowThreshold,
    AlreadyAlerted,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct BudgetCycleSummary {
    pub checked: usize,
    pub alerted: usize,
    pub failed: usize,
}

pub(crate) struct BudgetMonitor {
    ledger: Ledger,
    notifier: Arc<dyn Notifier>,
    dead_letters: Arc<dyn DeadLetterSink>,
    threshold: Decimal,
    policy: RetryPolicy,
}

impl BudgetMonitor {
    pub(crate) fn new(
        ledger: Ledger,
        notifier: Arc<dyn Notifier>,
        dead_letters: Arc<dyn DeadLetterSink>,
        threshold: Decimal,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            ledger,
            notifier,
            dead_letters,
            threshold,
            policy,
        }
    }

    /// Checks every monitored budget once. A failing budget is logged and
    /// dead-lettered; the rest of the cycle carries on.
    pub(crate) async fn run_cycle(&self, now: DateTime<Utc>) -> Result<BudgetCycleSummary> {
        let targets = self
            .ledger
            .call(|db| db.budgets_with_default_account())
            .await?;

        let mut summary = BudgetCycleSummary::default();
        for target in &targets {
            let budget_id = target.budget.id.unwrap_or_default();
            match retry_with_backoff(&self.policy, || self.check_budget(target, now)).await {
                Ok(check) => {
                    summary.checked += 1;
                    if check == BudgetCheck::Alerted {
                        summary.alerted += 1;
                    }
                }
                Err(exhausted) => {
                    summary.failed += 1;
                    error!(
                        budget_id,
                        user_id = %target.budget.user_id,
                        attempts = exhausted.attempts,
                        error = %exhausted.error,
                        "budget check failed"
                    );
                    let record = serde_json::json!({
                        "kind": "budget-check",
                        "budget_id": budget_id,
                        "user_id": target.budget.user_id,
                    });
                    if let Err(e) = self
                        .dead_letters
                        .dead_letter(record, &exhausted.error, exhausted.attempts)
                        .await
                    {
                        error!(budget_id, error = %format!("{e:#}"), "failed to record dead letter");
                    }
                }
            }
        }

        info!(
            checked = summary.checked,
            alerted = summary.alerted,
            failed = summary.failed,
            "budget check cycle complete"
        );
        Ok(summary)
    }

    async fn check_budget(
        &self,
        target: &BudgetTarget,
        now: DateTime<Utc>,
    ) -> Result<BudgetCheck, SchedulerError> {
        let budget = &target.budget;
        let budget_id = budget
            .id
            .ok_or_else(|| SchedulerError::DataIntegrity("budget row without id".into()))?;

        let account_id = target.account_id;
        let range = DateRange::month_of(now);
        let total_expenses = self
            .ledger
            .call(move |db| db.aggregate_expenses(account_id, range))
            .await
            .map_err(SchedulerError::from_store)?;

        let pct = percentage_used(budget_id, total_expenses, budget.amount)?;
        let state = AlertState::derive(budget.last_alert_sent, now);
        if !state.should_fire(pct, self.threshold) {
            debug!(budget_id, percentage_used = %pct, ?state, "no budget alert needed");
            return Ok(match state {
                AlertState::AlertSentThisMonth => BudgetCheck::AlreadyAlerted,
                AlertState::NoAlertThisMonth => BudgetCheck::BelowThreshold,
            });
        }

        let payload = NotificationPayload::BudgetAlert {
            user_name: target.user_name.clone().unwrap_or_default(),
            percentage_used: pct.round_dp(1),
            budget_amount: budget.amount.unwrap_or_default(),
            total_expenses,
            account_name: target.account_name.clone(),
        };
        self.notifier
            .send(&target.email, BUDGET_ALERT_SUBJECT, &payload)
            .await
            .map_err(SchedulerError::Notification)?;

        self.ledger
            .call(move |db| db.update_budget_alert_timestamp(budget_id, now))
            .await
            .map_err(SchedulerError::from_store)?;

        info!(
            budget_id,
            user_id = %budget.user_id,
            percentage_used = %pct.round_dp(1),
            "budget alert sent"
        );
        Ok(BudgetCheck::Alerted)
    }
}
