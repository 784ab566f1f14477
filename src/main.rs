mod approvals;
mod bootstrap;
mod config;
mod error;
mod gateway;
mod settlement;

#[cfg(test)]
mod testing;

use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

// Initialize logging and tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,delegation_sweeper=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    info!("🚀 Starting delegation sweeper");

    let config = Config::load()?;
    let scheduler = bootstrap::initialize(&config).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = scheduler.start(shutdown_rx);

    info!("🌐 Sweeper running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    info!("🛑 Shutdown requested, waiting for in-flight cycles");
    shutdown_tx.send(true)?;

    for handle in handles {
        if let Err(e) = handle.await {
            error!("❌ Stage task ended abnormally: {}", e);
        }
    }

    info!("✓ Sweeper stopped");
    Ok(())
}
