//! Check-config command implementation.

use std::path::Path;

use anyhow::Result;
use console::style;

use super::common::{load_config, process_user};

/// Load the configuration, validate it, and print what it resolves to.
pub async fn execute(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;

    println!(
        "{} {} is valid\n",
        style("✓").green().bold(),
        config_path.display()
    );

    let limits = config.admission_limits();
    println!("  {:<18} {}", style("Operating user").bold(), config.user);
    let running_as = process_user(&config);
    if running_as != config.user {
        println!(
            "  {:<18} {} {}",
            "",
            style("running as").yellow(),
            style(&running_as).yellow().bold()
        );
    }
    println!(
        "  {:<18} {}/{}",
        style("Admission queue").bold(),
        config.admission.cluster,
        config.admission.queue
    );
    println!(
        "  {:<18} run {}, queued {}{}",
        style("Limits").bold(),
        limits.run_limit,
        limits.queue_limit,
        limits
            .cpu_limit
            .map(|cpus| format!(", cpus {cpus}"))
            .unwrap_or_default()
    );
    println!(
        "  {:<18} every {}s, snapshots up to {}s old",
        style("Cycle").bold(),
        config.queue.sleep_secs,
        config.stale_after().as_secs()
    );
    println!(
        "  {:<18} {}",
        style("Cache").bold(),
        config
            .cache_dir()
            .map_or_else(|| "in memory".to_string(), |dir| dir.display().to_string())
    );
    println!(
        "  {:<18} {} {} / {} {}",
        style("Commands").bold(),
        config.commands.snapshot_program,
        config.commands.snapshot_args.join(" "),
        config.commands.submit_program,
        config.commands.submit_args.join(" ")
    );
    println!("  {:<18} {}", style("Accounts").bold(), config.accounts.len());

    println!("\n  {}", style("Users").bold());
    for user in &config.users {
        let dirs = config.directories.user_dirs(user);
        let state = if tokio::fs::metadata(&dirs.inbox).await.is_ok_and(|m| m.is_dir()) {
            style("ok").green()
        } else {
            style("no inbox").yellow()
        };
        println!("    {user:<16} {:<8} {}", state, dirs.inbox.display());
    }

    if config.control.shutdown {
        println!(
            "\n{} control.shutdown is set, daemons will stop",
            style("!").yellow().bold()
        );
    }
    Ok(())
}
