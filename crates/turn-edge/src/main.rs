//! turn-edge: TURN server front-end binary

use anyhow::Result;
use clap::Parser;
use tracing::{error, info, info_span};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use turn_edge::{Cli, LifecycleManager, ServerConfig, TerminationSignal, TurnEngineFactory};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = ServerConfig::load(cli)?;

    let span = info_span!("turn", realm = %config.realm, port = config.port);
    let manager = LifecycleManager::new(config, span)?;
    let signal = TerminationSignal::install()?;

    info!("Starting turn-edge");
    let service = manager.start(&TurnEngineFactory).await?;

    if let Err(e) = service.run_until(signal.recv()).await {
        error!("Shutdown failed: {}", e);
        return Err(e.into());
    }

    Ok(())
}
