//! mesos-dns-sync binary entry point.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use mesos_dns_sync::{telemetry, Config, MemorySink, SyncError, SyncServer};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// DNS name synchronization from a Mesos operator event stream.
#[derive(Parser, Debug)]
#[command(name = "mesos-dns-sync")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML).
    #[arg(short, long, default_value = "mesos-dns-sync.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration
    let config: Config = config::Config::builder()
        .add_source(config::File::from(args.config.clone()).required(false))
        .add_source(
            config::Environment::with_prefix("MESOS_DNS_SYNC")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .and_then(config::Config::try_deserialize)
        .map_err(|e| SyncError::Config(e.to_string()))?;

    // Initialize telemetry
    telemetry::init(&config.telemetry).map_err(|e| e as Box<dyn std::error::Error>)?;

    info!(
        config_file = %args.config.display(),
        master = %config.sync.master_url,
        domain = %config.sync.domain,
        "starting mesos-dns-sync"
    );

    // Setup graceful shutdown
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        signal_cancel.cancel();
    });

    // The replication layer is out of process; the in-memory sink holds
    // the latest zone for it to pick up.
    let sink = Arc::new(MemorySink::new());
    let server = SyncServer::new(config.sync, sink);
    if let Err(e) = server.run(cancel).await {
        error!("sync server error: {}", e);
        return Err(e.into());
    }

    info!("mesos-dns-sync shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
