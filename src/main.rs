mod calendar;
mod config;
mod db;
mod error;
mod insights;
mod models;
mod notify;
mod queue;
mod run;
mod scheduler;

use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args: Vec<String> = std::env::args().collect();
    let config = config::Config::from_env()?;

    match args.len() {
        1 => run::as_daemon(&config).await,
        _ => run::as_cli(&args, &config).await,
    }
}

fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("budgetd=info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
