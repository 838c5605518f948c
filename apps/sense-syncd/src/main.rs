//! # sense-syncd
//!
//! Telemetry sync daemon: forwards locally stored sensor records to the
//! configured MQTT broker and applies broker-pushed parameters.
//!
//! ## Process Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        sense-syncd                                      │
//! │                                                                         │
//! │  tracing init ─► DaemonConfig::load ─► SyncAgent::spawn                │
//! │                                              │                          │
//! │               SIGINT / SIGTERM ──────────────┤ shutdown, exit 0         │
//! │               startup exhausted / invalid ───┘ error log, exit 255      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::task::JoinError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use sense_local::HttpLocalQueue;
use sense_sync::{DaemonConfig, KeyProvisioner, MqttConnector, SyncAgent, SyncResult};

/// Exit status for unrecoverable startup failures.
const FATAL_EXIT_CODE: i32 = 255;

const DEFAULT_LOG_FILTER: &str = "info,sense=debug";

#[derive(Parser)]
#[command(name = "sense-syncd")]
#[command(about = "Forwards device telemetry to an MQTT broker", long_about = None)]
struct Cli {
    /// Daemon config file (defaults to SENSE_CONFIG, then the platform config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    init_tracing();

    if let Err(e) = run(Cli::parse()).await {
        error!(error = %format!("{:#}", e), "sense-syncd cannot continue");
        std::process::exit(FATAL_EXIT_CODE);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = DaemonConfig::load(cli.config).context("loading daemon config")?;
    info!(
        data_folder = %config.data_folder().display(),
        local_api = %config.daemon.local_api_url,
        "Starting sense-syncd"
    );

    let queue = Arc::new(
        HttpLocalQueue::new(&config.daemon.local_api_url).context("creating local API client")?,
    );
    let connector = Arc::new(MqttConnector::new(config.private_key_path()));
    let keys = KeyProvisioner::from_config(&config).context("creating key provisioner")?;

    let (handle, mut task) = SyncAgent::new(queue, connector, config.ack_timeout())
        .with_key_provisioner(keys)
        .spawn();

    tokio::select! {
        joined = &mut task => return finish(joined),
        _ = shutdown_signal() => {}
    }

    handle.shutdown().await;
    finish(task.await)?;

    info!("sense-syncd stopped");
    Ok(())
}

fn finish(joined: Result<SyncResult<()>, JoinError>) -> anyhow::Result<()> {
    joined.context("sync agent task failed")??;
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
