use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::scheduler::Scheduler;

/// Runs every pipeline until Ctrl-C.
pub(crate) async fn as_daemon(config: &Config) -> Result<()> {
    let ledger = super::open_ledger(config)?;
    let scheduler = Scheduler::from_config(config, ledger)?;
    info!(
        db = %config.db_path.display(),
        workers = config.workers,
        user_rate_limit = config.user_rate_limit,
        "budgetd starting"
    );

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C");
            return;
        }
        info!("shutdown requested");
        shutdown.cancel();
    });

    scheduler.run(cancel).await?;
    info!("budgetd stopped");
    Ok(())
}
