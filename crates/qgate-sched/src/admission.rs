//! Admission control: is there room for another job?

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cache::ClusterStateCache;
use crate::record::{Cluster, JobRecord, JobState};

/// Per (cluster, queue) limits, as published by the site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaSpec {
    pub cluster: String,
    pub queue: String,
    /// Jobs one user may have running before the queue counts as full.
    pub soft_jobs: usize,
    /// Jobs the scheduler itself will accept from one user.
    pub hard_jobs: usize,
    #[serde(default)]
    pub soft_total_cpus: Option<u64>,
    #[serde(default)]
    pub hard_total_cpus: Option<u64>,
    /// Longest walltime the queue accepts, in seconds.
    #[serde(default)]
    pub max_walltime_secs: Option<u64>,
    #[serde(default)]
    pub preemptible: bool,
}

impl QuotaSpec {
    /// Longest walltime the queue accepts.
    pub fn max_walltime(&self) -> Option<Duration> {
        self.max_walltime_secs.map(Duration::from_secs)
    }

    /// Whether this quota covers the given queue.
    pub fn covers(&self, cluster: &Cluster, queue: &str) -> bool {
        self.cluster == cluster.as_str() && self.queue == queue
    }
}

/// The one (cluster, queue) this daemon admits jobs into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionQueue {
    pub cluster: Cluster,
    pub queue: String,
}

impl Default for AdmissionQueue {
    fn default() -> Self {
        Self {
            cluster: Cluster::new("aci"),
            queue: "open".to_string(),
        }
    }
}

/// Effective limits for one admission decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionLimits {
    pub run_limit: usize,
    pub queue_limit: usize,
    /// Upper bound on CPUs requested by running jobs.
    pub cpu_limit: Option<u64>,
}

impl AdmissionLimits {
    /// Combine the configured limits with the queue's quota, taking the
    /// tighter of the two.
    pub fn new(run_limit: usize, queue_limit: usize, quota: Option<&QuotaSpec>) -> Self {
        match quota {
            Some(quota) => Self {
                run_limit: run_limit.min(quota.soft_jobs),
                queue_limit,
                cpu_limit: quota.soft_total_cpus,
            },
            None => Self {
                run_limit,
                queue_limit,
                cpu_limit: None,
            },
        }
    }

    /// Whether the observed counts leave no room. Reaching a limit counts.
    pub fn is_reached_by(&self, status: &QueueStatus) -> bool {
        status.running >= self.run_limit
            || status.queued >= self.queue_limit
            || self.cpu_limit.is_some_and(|limit| status.running_cpus >= limit)
    }
}

/// Observed job counts for one user in the admission queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub running: usize,
    pub queued: usize,
    pub other: usize,
    /// CPUs requested by the running jobs.
    pub running_cpus: u64,
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "running={} queued={} other={}",
            self.running, self.queued, self.other
        )
    }
}

/// Decides whether the admission queue has room for the operating user.
#[derive(Debug, Clone)]
pub struct AdmissionController {
    target: AdmissionQueue,
    last_status: Option<QueueStatus>,
}

impl AdmissionController {
    /// Create a controller for one admission queue.
    pub fn new(target: AdmissionQueue) -> Self {
        Self {
            target,
            last_status: None,
        }
    }

    /// The admission queue.
    pub fn target(&self) -> &AdmissionQueue {
        &self.target
    }

    /// Count `user`'s jobs in the admission queue.
    pub fn count(&self, records: &[JobRecord], user: &str) -> QueueStatus {
        records
            .iter()
            .filter(|job| job.owner == user && job.is_in(&self.target.cluster, &self.target.queue))
            .fold(QueueStatus::default(), |mut status, job| {
                match job.state {
                    JobState::Running => {
                        status.running += 1;
                        status.running_cpus += job.requested_cpus();
                    }
                    JobState::Queued => status.queued += 1,
                    JobState::Other => status.other += 1,
                }
                status
            })
    }

    /// Whether the queue is full for `user`.
    ///
    /// Never fails: if the cluster state cannot be obtained the queue is
    /// reported full, so nothing is admitted on unknown state.
    pub async fn is_full(
        &mut self,
        cache: &mut ClusterStateCache,
        stale_after: Duration,
        user: &str,
        limits: &AdmissionLimits,
    ) -> bool {
        let records = match cache.get_jobs(stale_after).await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "Cluster state unavailable, treating queue as full");
                self.last_status = None;
                return true;
            }
        };

        let status = self.count(&records, user);
        self.last_status = Some(status);
        let full = limits.is_reached_by(&status);
        info!(
            cluster = %self.target.cluster,
            queue = %self.target.queue,
            user,
            %status,
            run_limit = limits.run_limit,
            queue_limit = limits.queue_limit,
            full,
            "Queue status"
        );
        full
    }

    /// Counts observed by the last [`is_full`](Self::is_full), or `None` if
    /// the cluster state was unavailable then.
    pub fn last_status(&self) -> Option<QueueStatus> {
        self.last_status
    }

    /// Submissions that fit under the run limit given the last observation.
    pub fn free_slots(&self, limits: &AdmissionLimits) -> usize {
        let running = self.last_status.map_or(0, |s| s.running);
        limits.run_limit.saturating_sub(running)
    }
}
