//! Entry point: loads configuration, opens the sync-daemon and
//! storage-tool adapters, and hands everything to the supervisor.

mod control;
mod scheduler;
mod supervisor;
mod tasks;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use triarchive_core::config::{read_all_folders, GlobalConfig};
use triarchive_core::logging::init_logging;
use triarchive_tools::storage_tool::StorageTool;
use triarchive_tools::sync_daemon::SyncDaemonClient;

use crate::control::run_control_socket;
use crate::supervisor::Supervisor;

#[derive(Parser, Debug)]
#[command(name = "triarchive", about = "Per-host backup orchestrator")]
struct Cli {
    /// Path to the process-wide configuration file.
    #[arg(long, env = "TRIARCHIVE_CONFIG")]
    config: PathBuf,

    /// Path to the storage-tool binary (`rclone`-shaped CLI).
    #[arg(long, env = "TRIARCHIVE_STORAGE_TOOL", default_value = "rclone")]
    storage_tool: PathBuf,

    /// Sync-daemon base URL, e.g. `http://localhost:8384`.
    #[arg(long, env = "TRIARCHIVE_SYNC_DAEMON_URL")]
    sync_daemon_url: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = GlobalConfig::read_from_file(&cli.config)?;
    let _log_guard = init_logging(&config)?;

    info!(config = %cli.config.display(), "triarchive starting");

    let folders = read_all_folders(&config.folder_configs)?;
    info!(count = folders.len(), "loaded folder configurations");

    let storage = Arc::new(StorageTool::new(
        cli.storage_tool,
        config.logging_folder.clone(),
        config.default_hashsum.clone().unwrap_or_else(|| "sha256".to_string()),
        config.storage_tool_gui.clone(),
    ));
    let sync_client = Arc::new(SyncDaemonClient::new(
        cli.sync_daemon_url,
        config.api_key.clone(),
        config.syncthing_retry_count,
        Duration::from_secs(config.syncthing_retry_delay_secs),
    ));

    let cancel = CancellationToken::new();
    let supervisor = Arc::new(Supervisor::new(config.clone(), folders, storage, sync_client, cancel.clone())?);

    let (control_tx, control_rx) = mpsc::channel(64);
    let control_cancel = cancel.clone();
    let control_host = config.message_listener_host.clone();
    let control_port = config.message_listener_port;
    let control_auth = config.message_listener_auth_token.clone();
    tokio::spawn(async move {
        if let Err(err) = run_control_socket(&control_host, control_port, control_auth, control_tx, control_cancel).await {
            error!(error = %err, "control socket exited");
        }
    });

    let shutdown_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received shutdown signal");
            shutdown_cancel.cancel();
        }
    });

    supervisor.run(control_rx).await?;
    Ok(())
}
