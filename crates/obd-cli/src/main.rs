//! OBD-II Scanner - Main Entry Point

use obd_cli::{init_logging, run, ObdConfig, DEFAULT_CONFIG};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG.to_string());
    let config = ObdConfig::load(&path)?;
    init_logging(&config.log_level)?;

    info!("=== OBD Scanner v{} ===", env!("CARGO_PKG_VERSION"));
    info!("Scanning adapter on {}", config.transport.port);

    run(config).await
}
