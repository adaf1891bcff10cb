//! Helpers shared by the commands.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use qgate_sched::config::current_user;
use qgate_sched::{ConfigWatcher, Daemon, DaemonConfig, PbsCommands};

/// Explicit path, or `qgate/qgate.yaml` in the user's config directory.
pub fn config_path(explicit: Option<PathBuf>) -> PathBuf {
    explicit.unwrap_or_else(|| {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("qgate")
            .join("qgate.yaml")
    })
}

/// Load and validate the configuration.
pub fn load_config(path: &Path) -> Result<DaemonConfig> {
    DaemonConfig::load(path).with_context(|| format!("Failed to load {}", path.display()))
}

/// Login name of this process, falling back to the configured user.
pub fn process_user(config: &DaemonConfig) -> String {
    current_user().unwrap_or_else(|| config.user.clone())
}

/// Build a daemon backed by the real scheduler commands.
pub async fn create_daemon(path: &Path) -> Result<Daemon> {
    let config = load_config(path)?;
    let commands = Arc::new(PbsCommands::new(config.commands.clone()));
    let daemon = Daemon::new(
        ConfigWatcher::new(path),
        commands.clone(),
        commands,
        process_user(&config),
    )
    .await?;
    Ok(daemon)
}
