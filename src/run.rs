mod cli;
mod daemon;

pub(crate) use cli::as_cli;
pub(crate) use daemon::as_daemon;

use anyhow::{Context, Result};

use crate::config::Config;
use crate::db::{Database, Ledger};

fn open_ledger(config: &Config) -> Result<Ledger> {
    if let Some(dir) = config.db_path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create data directory: {}", dir.display()))?;
    }
    let db = Database::open(&config.db_path)?;
    Ok(Ledger::new(db))
}
