use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::info;

use crate::db::Ledger;
use crate::models::DueItem;
use crate::queue::{OccurrenceTask, TaskQueue};

pub(crate) const SCAN_PAGE_SIZE: usize = 200;

/// Walks the due set in id order, one page per store call.
pub(crate) struct DueScanner {
    ledger: Ledger,
    now: DateTime<Utc>,
    after_id: i64,
    page_size: usize,
    exhausted: bool,
}

impl DueScanner {
    pub(crate) fn new(ledger: Ledger, now: DateTime<Utc>, page_size: usize) -> Self {
        Self {
            ledger,
            now,
            after_id: 0,
            page_size: page_size.max(1),
            exhausted: false,
        }
    }

    pub(crate) async fn next_page(&mut self) -> Result<Option<Vec<DueItem>>> {
        if self.exhausted {
            return Ok(None);
        }
        let (now, after_id, limit) = (self.now, self.after_id, self.page_size);
        let page = self
            .ledger
            .call(move |db| db.find_due_recurring_page(now, after_id, limit))
            .await?;

        if page.len() < self.page_size {
            self.exhausted = true;
        }
        match page.last() {
            Some(last) => {
                self.after_id = last.transaction_id;
                Ok(Some(page))
            }
            None => Ok(None),
        }
    }
}

/// Enqueues one task per due template. Returns how many were dispatched.
pub(crate) async fn dispatch_due(
    ledger: &Ledger,
    queue: &dyn TaskQueue,
    now: DateTime<Utc>,
) -> Result<usize> {
    let mut scanner = DueScanner::new(ledger.clone(), now, SCAN_PAGE_SIZE);
    let mut dispatched = 0;
    while let Some(page) = scanner.next_page().await? {
        for item in page {
            queue
                .enqueue(OccurrenceTask::new(item.transaction_id, item.user_id))
                .context("Failed to dispatch recurring task")?;
            dispatched += 1;
        }
    }
    info!(dispatched, "recurring dispatch cycle complete");
    Ok(dispatched)
}
