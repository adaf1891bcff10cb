//! The daemon loop: reconfigure, check admission, hand off, sleep.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::admission::{AdmissionController, QueueStatus};
use crate::cache::{CacheOptions, ClusterStateCache};
use crate::config::{ConfigUpdate, ConfigWatcher, DaemonConfig};
use crate::error::{ConfigError, QgateResult};
use crate::handoff::{CycleReport, HandoffEngine};
use crate::pbs::{SnapshotSource, SubmitSink};

/// Result of one daemon cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The admission queue had no room; nothing was submitted. Carries the
    /// observed counts, if the cluster state could be read.
    Full(Option<QueueStatus>),
    /// The hand-off engine ran.
    Worked(CycleReport),
}

/// Why [`Daemon::serve`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// A termination signal was received.
    Signal,
    /// The configuration asked every daemon to stop.
    ConfigShutdown,
}

/// One meta-scheduler worker.
///
/// Several daemons, possibly on different hosts and under different users,
/// can serve the same inboxes; they coordinate only through the filesystem.
pub struct Daemon {
    watcher: ConfigWatcher,
    config: Arc<DaemonConfig>,
    source: Arc<dyn SnapshotSource>,
    process_user: String,
    cache: ClusterStateCache,
    admission: AdmissionController,
    engine: HandoffEngine,
}

impl Daemon {
    /// Load the configuration and build every component.
    ///
    /// The scheduler commands are fixed for the life of the daemon. The
    /// directories of the operating user are created if missing.
    pub async fn new(
        mut watcher: ConfigWatcher,
        source: Arc<dyn SnapshotSource>,
        sink: Arc<dyn SubmitSink>,
        process_user: impl Into<String>,
    ) -> QgateResult<Self> {
        let config = match watcher.poll().await? {
            ConfigUpdate::Reloaded(config) => config,
            _ => watcher
                .current()
                .ok_or_else(|| ConfigError::Invalid("no configuration loaded".to_string()))?,
        };
        let process_user = process_user.into();

        let cache = build_cache(&config, Arc::clone(&source), &process_user).await?;
        let engine = HandoffEngine::new(config.directories.clone(), sink, config.user.clone())
            .with_orphan_grace(config.orphan_grace());
        ensure_own_dirs(&config).await?;

        info!(
            user = %config.user,
            users = config.users.len(),
            cluster = %config.admission.cluster,
            queue = %config.admission.queue,
            "Daemon initialized"
        );

        Ok(Self {
            admission: AdmissionController::new(config.admission.clone()),
            watcher,
            config,
            source,
            process_user,
            cache,
            engine,
        })
    }

    /// Adjust the hand-off engine, e.g. to seed its random source.
    pub fn with_engine(mut self, configure: impl FnOnce(HandoffEngine) -> HandoffEngine) -> Self {
        self.engine = configure(self.engine);
        self
    }

    /// Configuration in effect.
    pub fn config(&self) -> &Arc<DaemonConfig> {
        &self.config
    }

    /// Cluster state cache, for inspection.
    pub fn cache_mut(&mut self) -> &mut ClusterStateCache {
        &mut self.cache
    }

    /// Run one admission check and, if there is room, one hand-off cycle.
    pub async fn run_cycle(&mut self) -> QgateResult<CycleOutcome> {
        let config = Arc::clone(&self.config);
        let limits = config.admission_limits();

        if self
            .admission
            .is_full(&mut self.cache, config.stale_after(), &config.user, &limits)
            .await
        {
            return Ok(CycleOutcome::Full(self.admission.last_status()));
        }

        let free = self.admission.free_slots(&limits);
        let report = self.engine.run_cycle(&config.users, free).await?;
        if report.attempts() > 0 || report.fatal.is_some() {
            // The snapshot no longer reflects our own submissions. A cycle
            // that ended on a filesystem failure may have submitted one.
            self.cache.invalidate();
        }
        Ok(CycleOutcome::Worked(report))
    }

    /// Run cycles until a signal arrives on `shutdown`, the configuration
    /// requests a stop, or an error occurs.
    pub async fn serve(&mut self, mut shutdown: watch::Receiver<bool>) -> QgateResult<StopReason> {
        loop {
            if *shutdown.borrow() {
                return Ok(StopReason::Signal);
            }

            self.reconfigure().await?;
            if self.config.control.shutdown {
                info!("Shutdown requested by configuration");
                return Ok(StopReason::ConfigShutdown);
            }

            match self.run_cycle().await? {
                CycleOutcome::Full(status) => {
                    info!(status = ?status, "Queue full, waiting");
                }
                CycleOutcome::Worked(report) => {
                    if let Some(fatal) = &report.fatal {
                        error!(error = %fatal, "Hand-off cycle ended early");
                    }
                }
            }

            let sleep = self.config.sleep();
            tokio::select! {
                () = tokio::time::sleep(sleep) => {}
                _ = shutdown.changed() => {
                    info!("Received shutdown signal");
                    return Ok(StopReason::Signal);
                }
            }
        }
    }

    async fn reconfigure(&mut self) -> QgateResult<()> {
        let config = match self.watcher.poll().await? {
            ConfigUpdate::Reloaded(config) => config,
            ConfigUpdate::Unchanged | ConfigUpdate::Missing { .. } => return Ok(()),
        };

        if config.commands != self.config.commands {
            warn!("Scheduler command settings changed, restart the daemon to apply them");
        }

        self.cache = build_cache(&config, Arc::clone(&self.source), &self.process_user).await?;
        self.admission = AdmissionController::new(config.admission.clone());
        self.engine
            .reconfigure(config.directories.clone(), config.orphan_grace());
        ensure_own_dirs(&config).await?;

        info!(users = config.users.len(), "Configuration applied");
        self.config = config;
        Ok(())
    }
}

async fn build_cache(
    config: &DaemonConfig,
    source: Arc<dyn SnapshotSource>,
    process_user: &str,
) -> QgateResult<ClusterStateCache> {
    let options = CacheOptions {
        cache_dir: config.cache_dir(),
        user: config.user.clone(),
        process_user: process_user.to_string(),
        retry: config.retry_policy(),
    };
    Ok(ClusterStateCache::new(source, config.accounts.clone(), options).await?)
}

async fn ensure_own_dirs(config: &DaemonConfig) -> QgateResult<()> {
    config
        .directories
        .user_dirs(&config.user)
        .ensure(config.directories.dir_mode)
        .await?;
    Ok(())
}
