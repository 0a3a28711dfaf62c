//! rolegate CLI entry point.

mod cli;

use clap::Parser;
use cli::Cli;
use rolegate::config::LogFormat;
use rolegate::{GateBuilder, GateEvent};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    // Initialize error handling
    color_eyre::install()?;

    // Parse CLI arguments and build configuration
    let config = Cli::parse().into_config()?;

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Text => registry.with(fmt::layer()).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }

    info!("rolegate v{}", env!("CARGO_PKG_VERSION"));

    // Build and run the gateway
    let mut gate = GateBuilder::new(config).build().await?;

    let mut events = gate.subscribe_events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(GateEvent::SettlementAmbiguous { key, payer, reason }) => {
                    warn!(
                        "Settlement for {key} needs reconciliation (payer {}): {reason}",
                        payer.as_deref().unwrap_or("unknown")
                    );
                }
                Ok(GateEvent::AttachDeferred { key, reason }) => {
                    warn!("Attach for {key} deferred to the sweeper: {reason}");
                }
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => warn!("Event log skipped {n} events"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    // Run until shutdown
    gate.run().await?;

    info!("Goodbye!");
    Ok(())
}
