//! progkv server binary.

use progkv::config::Config;
use progkv::runtime;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        max_connections = config.max_connections,
        buffer_size = config.buffer_size,
        "Starting progkv server"
    );

    if let Err(e) = runtime::run(config) {
        error!(error = %e, "Server failed");
        return Err(e.into());
    }
    Ok(())
}
