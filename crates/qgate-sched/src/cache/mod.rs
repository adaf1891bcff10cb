//! Three-tier cache of cluster state.
//!
//! Three data products are cached, each derived from the previous one:
//!
//! 1. the raw snapshot (`qstat -x` output), gzip-compressed on disk,
//! 2. the parsed job records, as JSON,
//! 3. the tabular projection, as JSON.
//!
//! Each product is served from memory if fresh, else from its cache file if
//! that file is fresh and at least as new as every file it derives from,
//! else recomputed from the product below it (or from the scheduler, for
//! the raw snapshot). Derived files are stamped with their source file's
//! mtime, so a derived value is never younger than the data it came from.
//!
//! Several processes may share one cache directory; every file is replaced
//! atomically so concurrent readers see either the old or the new version.

mod entry;
pub mod files;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::fs;
use tracing::{debug, error, info, warn};

use crate::accounts::AccountMap;
use crate::error::{CacheError, CacheResult, CommandError};
use crate::pbs::{SnapshotSource, parse_snapshot};
use crate::record::JobRecord;
use crate::table::JobTable;

use entry::{CacheEntry, is_fresh};

/// Default number of parse attempts before giving up.
pub const MAX_PARSE_ATTEMPTS: u32 = 15;

/// Default pause between parse attempts.
pub const PARSE_RETRY_BACKOFF: Duration = Duration::from_secs(5);

/// How hard to try re-reading a snapshot that will not parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Pause between attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_PARSE_ATTEMPTS,
            backoff: PARSE_RETRY_BACKOFF,
        }
    }
}

/// Construction options for [`ClusterStateCache`].
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Directory for cache files. `None` keeps everything in memory.
    pub cache_dir: Option<PathBuf>,
    /// User whose view of the cluster is cached.
    pub user: String,
    /// User this process runs as. The snapshot command is only run when
    /// the two match; other users can only read an existing cache file.
    pub process_user: String,
    /// Parse retry policy.
    pub retry: RetryPolicy,
}

/// Cluster state cache for one user.
///
/// Not shared between tasks; each daemon owns its own instance, and
/// cooperation between processes happens through the cache files.
pub struct ClusterStateCache {
    source: Arc<dyn SnapshotSource>,
    accounts: AccountMap,
    user: String,
    process_user: String,
    retry: RetryPolicy,
    raw: CacheEntry<Arc<Vec<u8>>>,
    records: CacheEntry<Arc<Vec<JobRecord>>>,
    table: CacheEntry<Arc<JobTable>>,
    /// Set after a snapshot failed to parse, until a fresh one is fetched.
    skip_raw_file: bool,
}

impl ClusterStateCache {
    /// Create a cache, creating the cache directory if needed.
    pub async fn new(
        source: Arc<dyn SnapshotSource>,
        accounts: AccountMap,
        options: CacheOptions,
    ) -> CacheResult<Self> {
        if let Some(dir) = &options.cache_dir {
            fs::create_dir_all(dir).await?;
        }
        let path = |suffix: &str| {
            options
                .cache_dir
                .as_ref()
                .map(|dir| dir.join(format!("qstat.{}.{suffix}", options.user)))
        };
        let (raw_path, records_path, table_path) = (path("raw.gz"), path("records.json"), path("table.json"));

        Ok(Self {
            raw: CacheEntry::new(raw_path),
            records: CacheEntry::new(records_path),
            table: CacheEntry::new(table_path),
            source,
            accounts,
            user: options.user,
            process_user: options.process_user,
            retry: options.retry,
            skip_raw_file: false,
        })
    }

    /// User whose jobs are cached.
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Account map used for parsing.
    pub fn accounts(&self) -> &AccountMap {
        &self.accounts
    }

    /// When the snapshot currently held in memory was taken.
    pub fn snapshot_time(&self) -> Option<SystemTime> {
        self.raw.value_time()
    }

    /// Drop every in-memory product and ignore the raw cache file until a
    /// new snapshot has been fetched.
    pub fn invalidate(&mut self) {
        self.raw.clear();
        self.records.clear();
        self.table.clear();
        self.skip_raw_file = true;
    }

    /// Raw snapshot no older than `stale_after`.
    pub async fn raw_snapshot(&mut self, stale_after: Duration) -> CacheResult<Arc<Vec<u8>>> {
        let now = SystemTime::now();
        if let Some(raw) = self.raw.fresh(now, stale_after) {
            debug!(user = %self.user, "Raw snapshot served from memory");
            return Ok(raw);
        }

        // Anything derived from the old snapshot is now suspect.
        self.records.clear();
        self.table.clear();

        if !self.skip_raw_file {
            if let Some(raw) = self.load_raw_file(now, stale_after).await {
                return Ok(raw);
            }
        }

        self.fetch_raw().await
    }

    /// Parsed job records no older than `stale_after`.
    ///
    /// A snapshot that fails to parse for a retryable reason is discarded and
    /// fetched again, up to the retry policy's attempt limit.
    pub async fn get_jobs(&mut self, stale_after: Duration) -> CacheResult<Arc<Vec<JobRecord>>> {
        let now = SystemTime::now();
        if let Some(records) = self.records.fresh(now, stale_after) {
            debug!(user = %self.user, "Job records served from memory");
            return Ok(records);
        }

        self.table.clear();

        if let Some(records) = self.load_records_file(now, stale_after).await {
            return Ok(records);
        }

        let mut attempts = 0;
        loop {
            attempts += 1;
            let raw = self.raw_snapshot(stale_after).await?;
            match parse_snapshot(&raw, &self.accounts) {
                Ok(records) => {
                    let records = Arc::new(records);
                    let value_time = self.raw.value_time().unwrap_or(now);
                    self.records.store(Arc::clone(&records), value_time);
                    self.records.file_time = persist_json(
                        self.records.path.as_deref(),
                        records.as_slice(),
                        self.raw.file_time,
                    )
                    .await;
                    debug!(user = %self.user, jobs = records.len(), "Parsed job records");
                    return Ok(records);
                }
                Err(source) if source.is_retryable() && attempts < self.retry.max_attempts => {
                    warn!(
                        attempt = attempts,
                        max_attempts = self.retry.max_attempts,
                        error = %source,
                        "Snapshot failed to parse, fetching again"
                    );
                    self.invalidate();
                    tokio::time::sleep(self.retry.backoff).await;
                }
                Err(source) => {
                    error!(attempts, error = %source, "Giving up on unparseable snapshot");
                    self.invalidate();
                    return Err(CacheError::Parse { attempts, source });
                }
            }
        }
    }

    /// Tabular projection no older than `stale_after`.
    pub async fn job_table(&mut self, stale_after: Duration) -> CacheResult<Arc<JobTable>> {
        let now = SystemTime::now();
        if let Some(table) = self.table.fresh(now, stale_after) {
            debug!(user = %self.user, "Job table served from memory");
            return Ok(table);
        }

        if let Some(table) = self.load_table_file(now, stale_after).await {
            return Ok(table);
        }

        let records = self.get_jobs(stale_after).await?;
        let table = Arc::new(JobTable::from_records(&records));
        let value_time = self.records.value_time().unwrap_or(now);
        self.table.store(Arc::clone(&table), value_time);
        self.table.file_time =
            persist_json(self.table.path.as_deref(), &*table, self.records.file_time).await;
        Ok(table)
    }

    async fn load_raw_file(&mut self, now: SystemTime, stale_after: Duration) -> Option<Arc<Vec<u8>>> {
        let path = self.raw.path.clone()?;
        let mtime = fresh_chain(&[&path], now, stale_after).await?;
        match files::read_gzip(&path).await {
            Ok(raw) if !raw.is_empty() => {
                debug!(path = %path.display(), "Raw snapshot loaded from cache file");
                let raw = Arc::new(raw);
                self.raw.store(Arc::clone(&raw), mtime);
                self.raw.file_time = Some(mtime);
                Some(raw)
            }
            Ok(_) => {
                warn!(path = %path.display(), "Ignoring empty snapshot cache file");
                None
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable snapshot cache file");
                None
            }
        }
    }

    async fn load_records_file(&mut self, now: SystemTime, stale_after: Duration) -> Option<Arc<Vec<JobRecord>>> {
        if self.skip_raw_file {
            return None;
        }
        let path = self.records.path.clone()?;
        let raw_path = self.raw.path.clone()?;
        let mtime = fresh_chain(&[&path, &raw_path], now, stale_after).await?;
        let records: Vec<JobRecord> = load_json(&path).await?;
        debug!(path = %path.display(), jobs = records.len(), "Job records loaded from cache file");
        let records = Arc::new(records);
        self.records.store(Arc::clone(&records), mtime);
        self.records.file_time = Some(mtime);
        Some(records)
    }

    async fn load_table_file(&mut self, now: SystemTime, stale_after: Duration) -> Option<Arc<JobTable>> {
        if self.skip_raw_file {
            return None;
        }
        let path = self.table.path.clone()?;
        let records_path = self.records.path.clone()?;
        let raw_path = self.raw.path.clone()?;
        let mtime = fresh_chain(&[&path, &records_path, &raw_path], now, stale_after).await?;
        let table: JobTable = load_json(&path).await?;
        debug!(path = %path.display(), "Job table loaded from cache file");
        let table = Arc::new(table);
        self.table.store(Arc::clone(&table), mtime);
        self.table.file_time = Some(mtime);
        Some(table)
    }

    async fn fetch_raw(&mut self) -> CacheResult<Arc<Vec<u8>>> {
        if self.user != self.process_user {
            return Err(CommandError::ForeignUser {
                command: self.source.describe(),
                user: self.user.clone(),
                process_user: self.process_user.clone(),
            }
            .into());
        }

        let raw = match self.source.snapshot().await {
            Ok(raw) => raw,
            Err(e) => {
                error!(command = %self.source.describe(), error = %e, "Snapshot command failed");
                return Err(e.into());
            }
        };
        let fetched_at = SystemTime::now();
        self.skip_raw_file = false;

        self.raw.file_time = None;
        if let Some(path) = &self.raw.path {
            match files::write_gzip(path, &raw, None).await {
                Ok(mtime) => self.raw.file_time = Some(mtime),
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to write snapshot cache file"),
            }
        }

        info!(user = %self.user, bytes = raw.len(), "Fetched cluster snapshot");
        let raw = Arc::new(raw);
        self.raw
            .store(Arc::clone(&raw), self.raw.file_time.unwrap_or(fetched_at));
        Ok(raw)
    }
}

/// Modification time of `paths[0]` if every file in the chain is fresh and
/// no file is older than the one it derives from (`paths[i + 1]`).
async fn fresh_chain(paths: &[&Path], now: SystemTime, stale_after: Duration) -> Option<SystemTime> {
    let mut mtimes = Vec::with_capacity(paths.len());
    for path in paths {
        let mtime = files::file_mtime(path).await?;
        if !is_fresh(mtime, now, stale_after) {
            return None;
        }
        mtimes.push(mtime);
    }
    if mtimes.windows(2).any(|pair| pair[0] < pair[1]) {
        return None;
    }
    mtimes.first().copied()
}

async fn load_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read cache file");
            return None;
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Ignoring corrupt cache file");
            None
        }
    }
}

/// Write a derived product stamped with its source file's mtime. Nothing is
/// written when the source has no file, since the chain check would reject
/// the result anyway.
async fn persist_json<T: Serialize + ?Sized>(
    path: Option<&Path>,
    value: &T,
    source_mtime: Option<SystemTime>,
) -> Option<SystemTime> {
    let path = path?;
    let source_mtime = source_mtime?;
    let json = match serde_json::to_vec(value) {
        Ok(json) => json,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to serialize cache file");
            return None;
        }
    };
    match files::write_atomic(path, &json, Some(source_mtime)).await {
        Ok(mtime) => Some(mtime),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to write cache file");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::error::CommandResult;

    const ONE_JOB: &str = "<Data><Job><Job_Id>1.srv</Job_Id><Job_Owner>alice@login</Job_Owner>\
<job_state>R</job_state><server>srv</server><Account_Name>open</Account_Name></Job></Data>
";

    struct CountingSource {
        payload: Vec<u8>,
        calls: AtomicUsize,
    }

    impl CountingSource {
        fn new(payload: &str) -> Arc<Self> {
            Arc::new(Self {
                payload: payload.as_bytes().to_vec(),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SnapshotSource for CountingSource {
        async fn snapshot(&self) -> CommandResult<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.payload.clone())
        }

        fn describe(&self) -> String {
            "mock-qstat".to_string()
        }
    }

    fn options(dir: Option<&Path>, user: &str, process_user: &str) -> CacheOptions {
        CacheOptions {
            cache_dir: dir.map(Path::to_path_buf),
            user: user.to_string(),
            process_user: process_user.to_string(),
            retry: RetryPolicy {
                max_attempts: 3,
                backoff: Duration::ZERO,
            },
        }
    }

    #[tokio::test]
    async fn test_memory_tier_serves_repeat_calls() {
        let source = CountingSource::new(ONE_JOB);
        let mut cache = ClusterStateCache::new(source.clone(), AccountMap::default(), options(None, "alice", "alice"))
            .await
            .unwrap();

        let stale = Duration::from_secs(60);
        let first = cache.get_jobs(stale).await.unwrap();
        let second = cache.get_jobs(stale).await.unwrap();
        let table = cache.job_table(stale).await.unwrap();

        assert_eq!(source.calls(), 1);
        assert_eq!(first, second);
        assert_eq!(table.jobs.len(), 1);
        assert!(cache.snapshot_time().is_some());
    }

    #[tokio::test]
    async fn test_zero_threshold_always_refetches() {
        let source = CountingSource::new(ONE_JOB);
        let mut cache = ClusterStateCache::new(source.clone(), AccountMap::default(), options(None, "alice", "alice"))
            .await
            .unwrap();

        cache.raw_snapshot(Duration::ZERO).await.unwrap();
        cache.raw_snapshot(Duration::ZERO).await.unwrap();
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_foreign_user_needs_a_cache_file() {
        let source = CountingSource::new(ONE_JOB);
        let mut cache = ClusterStateCache::new(source.clone(), AccountMap::default(), options(None, "bob", "alice"))
            .await
            .unwrap();

        let err = cache.get_jobs(Duration::from_secs(60)).await.unwrap_err();
        assert!(matches!(
            err,
            CacheError::UpstreamCommand(CommandError::ForeignUser { .. })
        ));
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test]
    async fn test_foreign_user_reads_shared_files() {
        let dir = tempfile::tempdir().unwrap();
        let stale = Duration::from_secs(60);

        let owner_source = CountingSource::new(ONE_JOB);
        let mut owner = ClusterStateCache::new(
            owner_source.clone(),
            AccountMap::default(),
            options(Some(dir.path()), "bob", "bob"),
        )
        .await
        .unwrap();
        owner.job_table(stale).await.unwrap();

        let reader_source = CountingSource::new(ONE_JOB);
        let mut reader = ClusterStateCache::new(
            reader_source.clone(),
            AccountMap::default(),
            options(Some(dir.path()), "bob", "alice"),
        )
        .await
        .unwrap();
        let table = reader.job_table(stale).await.unwrap();

        assert_eq!(table.jobs.len(), 1);
        assert_eq!(owner_source.calls(), 1);
        assert_eq!(reader_source.calls(), 0);
    }

    #[tokio::test]
    async fn test_cache_file_names() {
        let dir = tempfile::tempdir().unwrap();
        let source = CountingSource::new(ONE_JOB);
        let mut cache = ClusterStateCache::new(source, AccountMap::default(), options(Some(dir.path()), "alice", "alice"))
            .await
            .unwrap();
        cache.job_table(Duration::from_secs(60)).await.unwrap();

        for name in ["qstat.alice.raw.gz", "qstat.alice.records.json", "qstat.alice.table.json"] {
            assert!(dir.path().join(name).exists(), "{name} missing");
        }
        let raw_mtime = files::file_mtime(&dir.path().join("qstat.alice.raw.gz")).await.unwrap();
        let records_mtime = files::file_mtime(&dir.path().join("qstat.alice.records.json")).await.unwrap();
        assert_eq!(raw_mtime, records_mtime);
    }
}
