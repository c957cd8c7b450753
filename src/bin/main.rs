use log::{error, info};
use std::sync::Arc;
use wgbridge::bridge::Bridge;
use wgbridge::settings::Settings;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let settings = Settings::from_env()?;
    info!(
        "wgbridge starting: node {} via {}",
        settings.node_id, settings.ledger_rpc_url
    );

    let bridge = Arc::new(Bridge::new(settings)?);
    if let Err(e) = bridge.start().await {
        error!("bridge failed to start: {}", e);
        return Err(e.into());
    }

    // Run until interrupted
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    bridge.stop().await;
    Ok(())
}
