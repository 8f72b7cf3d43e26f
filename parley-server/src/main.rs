//! Parley Server - Main entry point.

use anyhow::Result;
use parley_common::config::Config;
use parley_common::logging::init_logging;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
    );

    tracing::info!("Parley Server v{}", env!("CARGO_PKG_VERSION"));

    parley_server::start_server(&config).await
}
