use anyhow::{anyhow, Result};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::Database;

/// Async handle over the single SQLite connection. Each call runs on the
/// blocking pool so store I/O never stalls the runtime's workers.
#[derive(Clone)]
pub(crate) struct Ledger {
    db: Arc<Mutex<Database>>,
}

impl Ledger {
    pub(crate) fn new(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    pub(crate) async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Database) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = db.blocking_lock();
            f(&mut guard)
        })
        .await
        .map_err(|e| anyhow!("store task failed: {e}"))?
    }
}
