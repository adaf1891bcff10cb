//! Single-step file moves used for every job state transition.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::fs;
use tracing::{debug, error};
use uuid::Uuid;

/// Result of trying to take exclusive ownership of a job file.
#[derive(Debug)]
pub enum ClaimOutcome {
    /// The file is now at the destination.
    Claimed,
    /// Someone else got there first: the source is gone, or the destination
    /// is already taken.
    Raced,
    /// The filesystem refused the move for another reason.
    Failed(io::Error),
}

/// Rename `from` to `to`, falling back to copy and delete when the two are
/// on different filesystems.
pub async fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
            debug!(from = %from.display(), to = %to.display(), "Cross-device move, copying");
            copy_then_remove(from, to).await
        }
        Err(e) => Err(e),
    }
}

/// Copy into a private temporary name next to `to`, then remove `from`.
///
/// Removing the source is the point of mutual exclusion: of two workers
/// copying the same file, only the one whose removal succeeds publishes its
/// copy. The loser deletes nothing but its own temporary file.
async fn copy_then_remove(from: &Path, to: &Path) -> io::Result<()> {
    let temp = temp_path_for(to);
    if let Err(e) = fs::copy(from, &temp).await {
        let _ = fs::remove_file(&temp).await;
        return Err(e);
    }
    if let Err(e) = fs::remove_file(from).await {
        let _ = fs::remove_file(&temp).await;
        return Err(e);
    }
    fs::rename(&temp, to).await.inspect_err(|e| {
        error!(
            temp = %temp.display(),
            to = %to.display(),
            error = %e,
            "Copied job file could not be put in place"
        );
    })
}

/// Hidden, unique sibling of `to`. Hidden names are never picked up as jobs.
fn temp_path_for(to: &Path) -> PathBuf {
    let name = to.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    to.with_file_name(format!(".{name}.{}.part", Uuid::new_v4().simple()))
}

/// Move `from` to `to` unless another worker already did, or `to` exists.
pub async fn claim(from: &Path, to: &Path) -> ClaimOutcome {
    if fs::try_exists(to).await.unwrap_or(false) {
        return ClaimOutcome::Raced;
    }
    match move_file(from, to).await {
        Ok(()) => ClaimOutcome::Claimed,
        // NotFound also covers a missing destination directory; only a
        // vanished source is a race.
        Err(e) if e.kind() == io::ErrorKind::NotFound && !fs::try_exists(from).await.unwrap_or(true) => {
            ClaimOutcome::Raced
        }
        Err(e) => ClaimOutcome::Failed(e),
    }
}

/// How long ago the file's inode last changed.
///
/// A rename updates the change time, so for a staged file this is the time
/// since it was claimed, whoever owns it.
pub async fn time_since_change(path: &Path) -> io::Result<Duration> {
    use std::os::unix::fs::MetadataExt;

    let meta = fs::metadata(path).await?;
    let changed = SystemTime::UNIX_EPOCH
        + Duration::from_secs(u64::try_from(meta.ctime()).unwrap_or(0))
        + Duration::from_nanos(u64::try_from(meta.ctime_nsec()).unwrap_or(0));
    Ok(SystemTime::now().duration_since(changed).unwrap_or(Duration::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_claim_moves_file() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("job.pbs");
        let to = dir.path().join("staged.pbs");
        fs::write(&from, "#PBS -l nodes=1\n").await.unwrap();

        assert!(matches!(claim(&from, &to).await, ClaimOutcome::Claimed));
        assert!(!from.exists());
        assert_eq!(fs::read_to_string(&to).await.unwrap(), "#PBS -l nodes=1\n");
    }

    #[tokio::test]
    async fn test_claim_of_vanished_file_is_a_race() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = claim(&dir.path().join("gone.pbs"), &dir.path().join("x.pbs")).await;
        assert!(matches!(outcome, ClaimOutcome::Raced));
    }

    #[tokio::test]
    async fn test_claim_onto_existing_file_is_a_race() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("a.pbs");
        let to = dir.path().join("b.pbs");
        fs::write(&from, "new").await.unwrap();
        fs::write(&to, "old").await.unwrap();

        assert!(matches!(claim(&from, &to).await, ClaimOutcome::Raced));
        assert_eq!(fs::read_to_string(&from).await.unwrap(), "new");
        assert_eq!(fs::read_to_string(&to).await.unwrap(), "old");
    }

    #[tokio::test]
    async fn test_claim_into_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("a.pbs");
        fs::write(&from, "x").await.unwrap();

        let outcome = claim(&from, &dir.path().join("missing").join("a.pbs")).await;
        assert!(matches!(outcome, ClaimOutcome::Failed(ref e) if e.kind() == io::ErrorKind::NotFound));
        assert!(from.exists());
    }

    fn names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_copy_then_remove() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("a.pbs");
        let to = dir.path().join("b.pbs");
        fs::write(&from, "payload").await.unwrap();

        copy_then_remove(&from, &to).await.unwrap();
        assert!(!from.exists());
        assert_eq!(fs::read_to_string(&to).await.unwrap(), "payload");
        assert_eq!(names(dir.path()), vec!["b.pbs"]);
    }

    #[tokio::test]
    async fn test_copy_then_remove_loser_keeps_winners_file() {
        let dir = tempfile::tempdir().unwrap();
        let inbox = dir.path().join("inbox");
        let staging = dir.path().join("staging");
        fs::create_dir(&inbox).await.unwrap();
        fs::create_dir(&staging).await.unwrap();
        let from = inbox.join("job.pbs");
        let to = staging.join("job.pbs");
        fs::write(&from, "payload").await.unwrap();

        copy_then_remove(&from, &to).await.unwrap();
        // The second worker finds the source already gone.
        let err = copy_then_remove(&from, &to).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert_eq!(fs::read_to_string(&to).await.unwrap(), "payload");
        assert_eq!(names(&staging), vec!["job.pbs"]);
    }

    #[test]
    fn test_temp_path_is_hidden_sibling() {
        let temp = temp_path_for(Path::new("/q/staging/job.pbs"));
        assert_eq!(temp.parent(), Some(Path::new("/q/staging")));
        let name = temp.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(".job.pbs."));
        assert!(name.ends_with(".part"));
        assert_ne!(temp, temp_path_for(Path::new("/q/staging/job.pbs")));
    }

    #[tokio::test]
    async fn test_time_since_change_is_recent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.pbs");
        fs::write(&path, "x").await.unwrap();
        assert!(time_since_change(&path).await.unwrap() < Duration::from_secs(60));
    }
}
