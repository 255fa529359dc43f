//! beamctl daemon: remote management control-plane for BEAM nodes.

use anyhow::Result;
use beamctl_core::config::Config;
use beamctl_daemon::core::Core;
use beamctl_daemon::shutdown;
use clap::Parser;
use tracing::{info, warn};

/// Remote management control-plane for a fleet of BEAM nodes
#[derive(Parser, Debug)]
#[command(name = "beamctl-daemon")]
#[command(about = "Remote management control-plane for BEAM nodes")]
#[command(version)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    beamctl_core::logging::init(args.verbose.then_some(tracing::Level::DEBUG));

    info!("beamctl daemon starting");

    let config = Config::from_env();
    if config.hosts.is_empty() {
        warn!("SSH_HOSTS is empty or unset; every operation will fail the configuration guard");
    }
    if config.private_key_pem.is_none() {
        warn!("no private key configured (SSH_PRIVATE_KEY / SSH_PRIVATE_KEY_B64)");
    }
    info!(hosts = config.hosts.len(), "configuration loaded");

    let core = Core::new(config);

    // The operation surface is driven by the embedding command framework;
    // the daemon itself only has to stay up and tear down cleanly.
    wait_for_shutdown_signal().await;

    shutdown::shutdown(&core).await;
    info!("beamctl daemon shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(err) => {
                    warn!(error = %err, "could not install SIGTERM handler; waiting on SIGINT only");
                    let _ = ctrl_c.await;
                    return;
                }
            };

        tokio::select! {
            _ = ctrl_c => {
                info!("received SIGINT");
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        info!("received Ctrl+C");
    }
}
