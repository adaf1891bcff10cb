//! Submit-once command implementation.

use std::path::Path;

use anyhow::Result;
use console::style;

use qgate_sched::CycleOutcome;

use super::common::create_daemon;

/// Execute one admission check and hand-off cycle.
pub async fn execute(config_path: &Path) -> Result<()> {
    let mut daemon = create_daemon(config_path).await?;

    match daemon.run_cycle().await? {
        CycleOutcome::Full(Some(status)) => {
            println!("{} Queue full ({status}), nothing submitted", style("■").yellow().bold());
        }
        CycleOutcome::Full(None) => {
            println!(
                "{} Cluster state unavailable, nothing submitted",
                style("■").yellow().bold()
            );
        }
        CycleOutcome::Worked(report) => {
            println!(
                "{} Submitted {}, rejected {}, lost {} race(s)",
                style("✓").green().bold(),
                report.submitted,
                report.rejected,
                report.raced
            );
            if let Some(fatal) = report.fatal {
                anyhow::bail!("Hand-off stopped early: {fatal}");
            }
        }
    }
    Ok(())
}
