//! Run command implementation.
//!
//! Runs the daemon loop in the foreground until SIGINT, SIGTERM, or a
//! `control.shutdown: true` entry in the configuration.

use std::path::Path;

use anyhow::Result;
use console::style;
use tokio::sync::watch;
use tracing::{info, warn};

use qgate_sched::StopReason;

use super::common::create_daemon;

/// Execute the run command.
pub async fn execute(config_path: &Path) -> Result<()> {
    let mut daemon = create_daemon(config_path).await?;

    println!(
        "{} qgate serving {} user(s) into {}/{} as {}",
        style("→").cyan().bold(),
        daemon.config().users.len(),
        daemon.config().admission.cluster,
        daemon.config().admission.queue,
        style(&daemon.config().user).bold()
    );

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = tx.send(true);
    });

    let reason = daemon.serve(rx).await?;
    let why = match reason {
        StopReason::Signal => "signal received",
        StopReason::ConfigShutdown => "shutdown requested by configuration",
    };
    println!("{} qgate stopped: {why}", style("✓").green().bold());
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        () = ctrl_c => info!("Received SIGINT"),
        () = terminate => info!("Received SIGTERM"),
    }
}
