mod bridge;
mod config;
mod logging;
mod publisher;

use anyhow::Result;
use camrelay_rtc::SessionManager;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tracing::{error, info, warn};

use config::AppConfig;
use publisher::DirectoryPublisher;

/// Relays WebRTC camera sessions to a live HLS playlist or to snapshots.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Configuration file (toml, yaml or json)
    #[arg(short, long, env = "CAMRELAY_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load and validate configuration
    let config = AppConfig::load(args.config.as_deref())?;
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!(mode = ?config.relay.mode, "camrelay starting");

    // 3. Wire the manager to stdout and the snapshot directory
    tokio::fs::create_dir_all(&config.bridge.snapshot_dir).await?;
    let publisher = Arc::new(DirectoryPublisher::new(&config.bridge.snapshot_dir));
    let (outbound_tx, outbound_rx) = tokio::sync::mpsc::unbounded_channel();
    let manager = SessionManager::new(config.relay, Arc::new(outbound_tx), publisher)?;

    let writer = tokio::spawn(bridge::write_outbound(outbound_rx, tokio::io::stdout()));

    // 4. Serve until stdin closes or a signal arrives
    tokio::select! {
        result = bridge::read_inbound(BufReader::new(tokio::io::stdin()), &manager) => {
            if let Err(e) = result {
                error!(error = %e, "Signaling input failed");
            }
        }
        () = shutdown_signal() => {}
    }

    // 5. Graceful shutdown
    manager.shutdown().await;
    drop(manager);
    match tokio::time::timeout(Duration::from_secs(5), writer).await {
        Ok(Ok(Ok(written))) => info!(messages = written, "Signaling output drained"),
        Ok(Ok(Err(e))) => error!(error = %e, "Signaling output failed"),
        Ok(Err(e)) => error!(error = %e, "Signaling writer panicked"),
        Err(_) => warn!("Signaling output did not drain in time"),
    }

    info!("camrelay stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C signal"),
            Err(e) => error!("Failed to install Ctrl+C handler: {}", e),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
                info!("Received SIGTERM signal");
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
