// ABOUTME: Main entry point for the portico gateway

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use portico::config::{Cli, GatewayConfig};
use portico::server;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging();

    let cli = Cli::parse();
    let config = GatewayConfig::load(cli)?;

    let (drained_tx, drained_rx) = tokio::sync::oneshot::channel::<()>();
    let shutdown = async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        let _ = drained_tx.send(());
    };

    let mut serving = tokio::spawn(server::serve(config, shutdown));
    tokio::select! {
        result = &mut serving => result??,
        _ = async {
            let _ = drained_rx.await;
            tokio::time::sleep(SHUTDOWN_GRACE).await;
        } => {
            warn!("graceful shutdown timed out after {SHUTDOWN_GRACE:?}; aborting connections");
            serving.abort();
        }
    }

    info!("server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut hangup = signal(SignalKind::hangup()).expect("failed to install SIGHUP handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
        _ = hangup.recv() => {}
    }
}

fn setup_logging() {
    use std::fs::OpenOptions;
    use tracing_subscriber::prelude::*;

    // Log to a per-run file under the gateway's state directory, mirrored to
    // stderr.
    let log_dir = dirs::home_dir()
        .map(|home| home.join(".portico").join("logs"))
        .unwrap_or_else(|| PathBuf::from(".portico/logs"));

    let _ = std::fs::create_dir_all(&log_dir);

    let log_file = log_dir.join(format!(
        "portico-{}.log",
        chrono::Local::now().format("%Y%m%d-%H%M%S")
    ));

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "portico=info".into());

    match OpenOptions::new().create(true).append(true).open(&log_file) {
        Ok(file) => {
            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_writer(Arc::new(file))
                        .with_ansi(false),
                )
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .with(filter)
                .init();
        }
        Err(e) => {
            eprintln!("could not open log file {}: {e}", log_file.display());
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .with(filter)
                .init();
        }
    }
}
