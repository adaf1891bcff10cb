//! On-disk cache files.
//!
//! Files are replaced atomically (write to a sibling temp file, stamp its
//! mtime, rename over the target) so readers in other processes never see a
//! partial file.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tokio::fs;

/// Modification time of a file, or `None` if it cannot be read.
pub async fn file_mtime(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).await.ok()?.modified().ok()
}

/// Read and decompress a gzip file.
pub async fn read_gzip(path: &Path) -> std::io::Result<Vec<u8>> {
    let compressed = fs::read(path).await?;
    let mut raw = Vec::new();
    GzDecoder::new(compressed.as_slice()).read_to_end(&mut raw)?;
    Ok(raw)
}

/// Compress `raw` and atomically write it to `path`.
pub async fn write_gzip(path: &Path, raw: &[u8], mtime: Option<SystemTime>) -> std::io::Result<SystemTime> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(raw)?;
    let compressed = encoder.finish()?;
    write_atomic(path, &compressed, mtime).await
}

/// Atomically replace `path` with `contents`.
///
/// When `mtime` is given the file is stamped with it before it becomes
/// visible. Returns the modification time of the installed file.
pub async fn write_atomic(path: &Path, contents: &[u8], mtime: Option<SystemTime>) -> std::io::Result<SystemTime> {
    let tmp = temp_sibling(path);
    fs::write(&tmp, contents).await?;

    let installed = async {
        if let Some(mtime) = mtime {
            set_mtime(&tmp, mtime).await?;
        }
        fs::rename(&tmp, path).await?;
        fs::metadata(path).await?.modified()
    }
    .await;

    if installed.is_err() {
        let _ = fs::remove_file(&tmp).await;
    }
    installed
}

/// Set a file's modification time.
pub async fn set_mtime(path: &Path, mtime: SystemTime) -> std::io::Result<()> {
    let file = fs::OpenOptions::new().write(true).open(path).await?;
    let file = file.into_std().await;
    tokio::task::spawn_blocking(move || file.set_modified(mtime))
        .await
        .map_err(std::io::Error::other)?
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.{}.tmp", uuid::Uuid::new_v4()))
}
