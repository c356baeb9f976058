use anyhow::Result;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use meetpay::{config::Config, BrokerError, MeetpayApp};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration before logging so the level and format apply
    let config = load_config().await?;
    init_tracing(&config);

    info!("Starting meetpay...");

    if let Err(e) = config.validate().map_err(BrokerError::Config) {
        error!("{}", e);
        std::process::exit(1);
    }

    let app = MeetpayApp::new(config).await?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

    let app_clone = app.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received shutdown signal, initiating graceful shutdown...");
                let _ = shutdown_tx.send(());
                if let Err(e) = app_clone.shutdown().await {
                    error!("Error during shutdown: {}", e);
                }
            }
            Err(e) => {
                error!("Failed to listen for shutdown signal: {}", e);
            }
        }
    });

    app.run_with_shutdown(shutdown_rx).await?;

    info!("Meetpay server stopped gracefully");
    Ok(())
}

/// RUST_LOG wins over the configured level
fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);
    match config.logging.format.as_str() {
        "json" => builder.json().init(),
        "compact" => builder.compact().init(),
        _ => builder.pretty().init(),
    }
}

/// Load configuration from file or use defaults
async fn load_config() -> Result<Config> {
    let mut config_paths = Vec::new();
    if let Ok(path) = std::env::var("MEETPAY_CONFIG") {
        config_paths.push(PathBuf::from(path));
    }
    config_paths.push(PathBuf::from("./meetpay.toml"));
    config_paths.push(PathBuf::from("/etc/meetpay/meetpay.toml"));
    if let Some(dir) = dirs::config_dir() {
        config_paths.push(dir.join("meetpay/meetpay.toml"));
    }

    for path in config_paths {
        if path.exists() {
            // tracing is not up yet
            eprintln!("Loading configuration from: {}", path.display());
            let content = tokio::fs::read_to_string(&path).await?;
            let config: Config = toml::from_str(&content)?;
            return Ok(config);
        }
    }

    Ok(Config::default())
}
