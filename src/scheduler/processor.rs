use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use super::worker::{Outcome, SkipReason, TaskHandler};
use crate::calendar::Clock;
use crate::db::{Ledger, Materialization};
use crate::error::SchedulerError;
use crate::queue::OccurrenceTask;

/// Turns one due recurring template into a concrete ledger entry.
pub(crate) struct OccurrenceProcessor {
    ledger: Ledger,
    clock: Arc<dyn Clock>,
}

impl OccurrenceProcessor {
    pub(crate) fn new(ledger: Ledger, clock: Arc<dyn Clock>) -> Self {
        Self { ledger, clock }
    }
}

#[async_trait]
impl TaskHandler for OccurrenceProcessor {
    async fn handle(&self, task: &OccurrenceTask) -> Result<Outcome, SchedulerError> {
        let now = self.clock.now();
        let id = task.transaction_id;

        let user_id = task.user_id.clone();
        let template = self
            .ledger
            .call(move |db| db.get_transaction(id, &user_id))
            .await
            .map_err(SchedulerError::from_store)?;

        let Some(template) = template else {
            info!(
                transaction_id = id,
                user_id = %task.user_id,
                "recurring transaction not found; discarding task"
            );
            return Ok(Outcome::Skipped(SkipReason::NotFound));
        };
        if !template.is_recurring || !template.is_due(now) {
            debug!(transaction_id = id, "transaction no longer due");
            return Ok(Outcome::Skipped(SkipReason::NotDue));
        }

        let user_id = task.user_id.clone();
        let written = self
            .ledger
            .call(move |db| db.materialize_occurrence(id, &user_id, now))
            .await
            .map_err(SchedulerError::from_store)?;

        match written {
            Materialization::Created {
                entry_id,
                account_id,
                new_balance,
                next_recurring_date,
            } => {
                info!(
                    transaction_id = id,
                    user_id = %task.user_id,
                    entry_id,
                    account_id,
                    %new_balance,
                    next = %next_recurring_date,
                    "recurring occurrence recorded"
                );
                Ok(Outcome::Processed)
            }
            Materialization::Missing => Ok(Outcome::Skipped(SkipReason::NotFound)),
            Materialization::Stale => {
                debug!(transaction_id = id, "occurrence already recorded by another delivery");
                Ok(Outcome::Skipped(SkipReason::NotDue))
            }
            Materialization::NoInterval => Err(SchedulerError::DataIntegrity(format!(
                "recurring transaction {id} has no interval"
            ))),
        }
    }
}
