use anyhow::Context;
use tracing::info;

use gateway::config::Config;
use gateway::runtime::boot::{boot, init_tracing, init_tracing_basic};
use gateway::runtime::serve::serve;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Phase 1: basic tracing so config loading can log
    let basic_tracing = init_tracing_basic();

    info!("Starting GetGather Gateway v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load().context("Failed to load configuration")?;
    config
        .validate()
        .context("Configuration validation failed")?;

    // Phase 2: replace with the configured subscriber
    drop(basic_tracing);
    init_tracing(&config)?;

    info!("Configuration loaded successfully");

    let state = boot(config).await.context("Failed to initialize gateway")?;
    serve(state).await.context("Server error")?;

    info!("Server shut down gracefully");
    Ok(())
}
