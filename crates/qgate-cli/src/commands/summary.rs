//! Summary command implementation.
//!
//! Prints the cluster job table the daemons work from, read through the
//! shared cache.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Local};
use console::style;

use qgate_sched::{AdmissionController, CacheOptions, ClusterStateCache, PbsCommands};

use super::common::{load_config, process_user};

/// Execute the summary command.
pub async fn execute(config_path: &Path, fresh: bool, json: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let commands = Arc::new(PbsCommands::new(config.commands.clone()));
    let options = CacheOptions {
        cache_dir: config.cache_dir(),
        user: config.user.clone(),
        process_user: process_user(&config),
        retry: config.retry_policy(),
    };
    let mut cache = ClusterStateCache::new(commands, config.accounts.clone(), options).await?;
    if fresh {
        cache.invalidate();
    }

    let table = cache.job_table(config.stale_after()).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&*table)?);
        return Ok(());
    }

    print!("{}", table.render_summary());

    let limits = config.admission_limits();
    let status = AdmissionController::new(config.admission.clone()).count(&table.jobs, &config.user);
    let verdict = if limits.is_reached_by(&status) {
        style("full").red().bold()
    } else {
        style("open").green().bold()
    };
    println!(
        "{} {}/{} for {}: {status} (run limit {}, queue limit {}) {verdict}",
        style("→").cyan().bold(),
        config.admission.cluster,
        config.admission.queue,
        config.user,
        limits.run_limit,
        limits.queue_limit,
    );
    if let Some(at) = cache.snapshot_time() {
        let at: DateTime<Local> = at.into();
        println!("  snapshot taken {}", style(at.format("%Y-%m-%d %H:%M:%S")).dim());
    }
    Ok(())
}
