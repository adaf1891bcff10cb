//! Per-user directory layout.
//!
//! Every user owns a base directory holding four subdirectories:
//!
//! - `inbox`: pending job files dropped by the user,
//! - `staging`: files claimed by a daemon and being submitted,
//! - `submitted`: archive of accepted job files,
//! - `info`: submit command output for the user to inspect.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::debug;

/// Placeholder replaced by the user name in [`DirectoryLayout::base_dir`].
pub const USER_PLACEHOLDER: &str = "{user}";

/// Directory names, shared by every user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryLayout {
    /// Base directory template, e.g. `/gpfs/group/{user}/qgate` or
    /// `~/qgate`. A leading `~` is the home directory of the daemon user.
    pub base_dir: String,
    pub inbox: String,
    pub staging: String,
    pub submitted: String,
    pub info: String,
    /// Mode applied to directories the daemon creates.
    pub dir_mode: u32,
}

impl Default for DirectoryLayout {
    fn default() -> Self {
        Self {
            base_dir: format!("/storage/home/{USER_PLACEHOLDER}/qgate"),
            inbox: "inbox".to_string(),
            staging: "staging".to_string(),
            submitted: "submitted".to_string(),
            info: "info".to_string(),
            dir_mode: 0o2770,
        }
    }
}

impl DirectoryLayout {
    /// Resolve the directories of one user.
    pub fn user_dirs(&self, user: &str) -> UserDirs {
        let base = expand_home(&self.base_dir.replace(USER_PLACEHOLDER, user));
        UserDirs {
            inbox: base.join(&self.inbox),
            staging: base.join(&self.staging),
            submitted: base.join(&self.submitted),
            info: base.join(&self.info),
            base,
        }
    }

    /// Subdirectory names, for validation.
    pub fn subdirectory_names(&self) -> [&str; 4] {
        [&self.inbox, &self.staging, &self.submitted, &self.info]
    }
}

pub(crate) fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => match dirs::home_dir() {
            Some(home) => home.join(rest.trim_start_matches('/')),
            None => PathBuf::from(path),
        },
        _ => PathBuf::from(path),
    }
}

/// Resolved directories of one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserDirs {
    pub base: PathBuf,
    pub inbox: PathBuf,
    pub staging: PathBuf,
    pub submitted: PathBuf,
    pub info: PathBuf,
}

impl UserDirs {
    /// Create any missing directory and apply `mode` to the ones created.
    pub async fn ensure(&self, mode: u32) -> std::io::Result<()> {
        for dir in [&self.base, &self.inbox, &self.staging, &self.submitted, &self.info] {
            ensure_dir(dir, mode).await?;
        }
        Ok(())
    }
}

async fn ensure_dir(dir: &Path, mode: u32) -> std::io::Result<()> {
    if fs::metadata(dir).await.is_ok_and(|m| m.is_dir()) {
        return Ok(());
    }
    fs::create_dir_all(dir).await?;
    fs::set_permissions(dir, std::fs::Permissions::from_mode(mode)).await?;
    debug!("Created directory {} with mode {mode:o}", dir.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_dirs() {
        let layout = DirectoryLayout {
            base_dir: "/srv/qgate/{user}".to_string(),
            ..DirectoryLayout::default()
        };
        let dirs = layout.user_dirs("alice");
        assert_eq!(dirs.base, PathBuf::from("/srv/qgate/alice"));
        assert_eq!(dirs.inbox, PathBuf::from("/srv/qgate/alice/inbox"));
        assert_eq!(dirs.staging, PathBuf::from("/srv/qgate/alice/staging"));
        assert_eq!(dirs.submitted, PathBuf::from("/srv/qgate/alice/submitted"));
        assert_eq!(dirs.info, PathBuf::from("/srv/qgate/alice/info"));
    }

    #[test]
    fn test_home_expansion() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home("~/qgate"), home.join("qgate"));
            assert_eq!(expand_home("~"), home);
        }
        assert_eq!(expand_home("~bob/qgate"), PathBuf::from("~bob/qgate"));
        assert_eq!(expand_home("/abs"), PathBuf::from("/abs"));
    }

    #[tokio::test]
    async fn test_ensure_creates_with_mode() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = DirectoryLayout {
            base_dir: format!("{}/{{user}}", tmp.path().display()),
            dir_mode: 0o750,
            ..DirectoryLayout::default()
        };
        let dirs = layout.user_dirs("alice");
        dirs.ensure(layout.dir_mode).await.unwrap();
        // Idempotent.
        dirs.ensure(layout.dir_mode).await.unwrap();

        let meta = std::fs::metadata(&dirs.staging).unwrap();
        assert!(meta.is_dir());
        assert_eq!(meta.permissions().mode() & 0o7777, 0o750);
    }
}
