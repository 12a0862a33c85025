//! PST to SDP transfer daemon.
//!
//! Usage:
//!     sdp_transfer [--data_product_dashboard URL] [-v] LOCAL_PATH REMOTE_PATH SUBSYSTEM

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use pst_send::{SdpTransfer, SdpTransferConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Environment variable overriding the local root in containerized
/// deployments.
const PST_DSP_MOUNT: &str = "PST_DSP_MOUNT";

#[derive(Parser, Debug)]
#[command(name = "sdp_transfer", about = "Transfer PST voltage recorder data products to SDP")]
struct Cli {
    /// Local/source filesystem path in which PST data products are found
    local_path: PathBuf,

    /// Remote/dest filesystem path to which PST data products are written
    remote_path: PathBuf,

    /// Telescope subsystem identifier, the subdirectory name under both roots
    subsystem: String,

    /// Endpoint of the SDP Data Product Dashboard REST API
    /// [e.g. http://127.0.0.1:8888]
    #[arg(long = "data_product_dashboard")]
    data_product_dashboard: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let help = matches!(
                e.kind(),
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion
            );
            let _ = e.print();
            return if help {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(1)
            };
        }
    };

    let default_filter = if cli.verbose {
        "pst_send=debug,pst_send_metadata=debug"
    } else {
        "pst_send=info,pst_send_metadata=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let local_path = match std::env::var(PST_DSP_MOUNT) {
        Ok(mount) if !mount.is_empty() => {
            tracing::info!(mount = %mount, "local path overridden by {PST_DSP_MOUNT}");
            PathBuf::from(mount)
        }
        _ => cli.local_path,
    };

    if !local_path.is_dir() {
        eprintln!("error: local path {} is not a directory", local_path.display());
        return ExitCode::from(1);
    }
    if !cli.remote_path.is_dir() {
        eprintln!(
            "error: remote path {} is not a directory",
            cli.remote_path.display()
        );
        return ExitCode::from(1);
    }

    let mut config = SdpTransferConfig::new(local_path, cli.remote_path, cli.subsystem);
    config.dashboard_url = cli.data_product_dashboard;

    let sdp_transfer = match SdpTransfer::new(config) {
        Ok(sdp_transfer) => sdp_transfer,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::from(2);
        }
    };

    // SIGINT/SIGTERM set the shared token; workers complete their in-flight
    // file operation and exit.
    let cancel = sdp_transfer.cancellation_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received");
        cancel.cancel();
    });

    match sdp_transfer.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "unrecoverable runtime error");
            ExitCode::from(2)
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                tracing::warn!(error = %e, "cannot install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
