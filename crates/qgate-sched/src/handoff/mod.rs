//! Crash-safe hand-off of job files to the batch scheduler.
//!
//! A job file lives in exactly one of the owner's directories at any time,
//! and every transition is a single move:
//!
//! ```text
//! inbox --claim--> staging --submit ok--> submitted
//!   ^                 |
//!   +---submit failed-+
//! ```
//!
//! A crash between transitions leaves the file in `staging`. Staged files
//! that have sat there longer than the orphan grace period are moved back
//! to the inbox (renamed if the user has reused the name) and retried ahead
//! of fresh work, so a crash can cause a duplicate submission but never a
//! lost job. Neither the inbox nor `submitted` ever has a file overwritten.

pub mod audit;
pub mod moves;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashSet;
use tokio::fs;
use tracing::{debug, error, info, warn};

use crate::error::{HandoffError, HandoffResult};
use crate::layout::{DirectoryLayout, UserDirs};
use crate::pbs::{SubmitSink, parse_qsub_output};

use audit::{SubmitOutcome, SubmitRecord, write_record};
use moves::{ClaimOutcome, claim, move_file, time_since_change};

/// Suffix tag for a file returned to an inbox under a taken name.
const REQUEUED_TAG: &str = "requeued";
/// Suffix tag for an archived file whose name is already in `submitted/`.
const ARCHIVED_TAG: &str = "archived";

/// Default time a file may sit in staging before it counts as orphaned.
pub const DEFAULT_ORPHAN_GRACE: Duration = Duration::from_secs(600);

/// A job file waiting in some user's directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PendingJob {
    pub owner: String,
    pub file_name: String,
}

impl std::fmt::Display for PendingJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.file_name)
    }
}

/// Work found by one scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Candidates {
    /// Staged files left behind by a crashed worker.
    pub orphans: Vec<PendingJob>,
    /// Inbox files.
    pub pending: Vec<PendingJob>,
}

impl Candidates {
    /// Whether there is nothing to do.
    pub fn is_empty(&self) -> bool {
        self.orphans.is_empty() && self.pending.is_empty()
    }
}

/// Result of one pick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt {
    /// Accepted by the scheduler and archived.
    Submitted(PendingJob),
    /// Refused by the scheduler (or the command failed) and returned to the
    /// inbox.
    Rejected(PendingJob),
    /// Another worker claimed the file first. Not a submission attempt.
    Raced(PendingJob),
    /// No candidate left.
    NoWork,
}

/// Tally of one throughput cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub submitted: usize,
    pub rejected: usize,
    pub raced: usize,
    /// Set when the cycle ended early on a filesystem failure.
    pub fatal: Option<String>,
}

impl CycleReport {
    /// Submission attempts made (accepted or rejected).
    pub fn attempts(&self) -> usize {
        self.submitted + self.rejected
    }
}

/// Remove one element chosen uniformly at random.
pub fn take_random<T, R: Rng + ?Sized>(pool: &mut Vec<T>, rng: &mut R) -> Option<T> {
    if pool.is_empty() {
        return None;
    }
    let idx = rng.gen_range(0..pool.len());
    Some(pool.swap_remove(idx))
}

/// Moves job files from user inboxes to the scheduler.
pub struct HandoffEngine {
    layout: DirectoryLayout,
    sink: Arc<dyn SubmitSink>,
    operator: String,
    orphan_grace: Duration,
    rng: StdRng,
}

impl HandoffEngine {
    /// Create an engine submitting as `operator`.
    pub fn new(layout: DirectoryLayout, sink: Arc<dyn SubmitSink>, operator: impl Into<String>) -> Self {
        Self {
            layout,
            sink,
            operator: operator.into(),
            orphan_grace: DEFAULT_ORPHAN_GRACE,
            rng: StdRng::from_entropy(),
        }
    }

    /// Set how long a staged file may sit before it is recovered.
    pub fn with_orphan_grace(mut self, grace: Duration) -> Self {
        self.orphan_grace = grace;
        self
    }

    /// Use a specific random source (seeded in tests).
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    /// Apply a reloaded layout and grace period, keeping the random source.
    pub fn reconfigure(&mut self, layout: DirectoryLayout, orphan_grace: Duration) {
        self.layout = layout;
        self.orphan_grace = orphan_grace;
    }

    /// Directory layout in use.
    pub fn layout(&self) -> &DirectoryLayout {
        &self.layout
    }

    /// Find orphaned staged files and pending inbox files of `users`.
    ///
    /// Users without an inbox are skipped with a warning. Only regular files
    /// count, and names starting with `.` are ignored.
    pub async fn scan(&self, users: &[String]) -> HandoffResult<Candidates> {
        let mut candidates = Candidates::default();
        for user in users {
            let dirs = self.layout.user_dirs(user);
            if !fs::metadata(&dirs.inbox).await.is_ok_and(|m| m.is_dir()) {
                warn!(user = %user, inbox = %dirs.inbox.display(), "User has no inbox directory");
                continue;
            }

            for file_name in list_job_files(&dirs.inbox).await? {
                candidates.pending.push(PendingJob {
                    owner: user.clone(),
                    file_name,
                });
            }

            if fs::metadata(&dirs.staging).await.is_ok_and(|m| m.is_dir()) {
                for file_name in list_job_files(&dirs.staging).await? {
                    let age = match time_since_change(&dirs.staging.join(&file_name)).await {
                        Ok(age) => age,
                        // Finished by its worker while we were looking.
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                        Err(e) => return Err(e.into()),
                    };
                    if age >= self.orphan_grace {
                        candidates.orphans.push(PendingJob {
                            owner: user.clone(),
                            file_name,
                        });
                    }
                }
            }
        }
        candidates.orphans.sort();
        Ok(candidates)
    }

    /// Pick one job and hand it to the scheduler.
    ///
    /// Returns `true` iff the scheduler accepted a job.
    pub async fn try_submit_one(&mut self, users: &[String]) -> HandoffResult<bool> {
        let attempt = self.attempt_one(users, &FxHashSet::default()).await?;
        Ok(matches!(attempt, Attempt::Submitted(_)))
    }

    /// Submit up to `free` jobs, stopping when work runs out or the
    /// filesystem fails.
    ///
    /// Races do not count against `free`. A job that loses a race or is
    /// rejected is not picked again within the same cycle.
    pub async fn run_cycle(&mut self, users: &[String], free: usize) -> HandoffResult<CycleReport> {
        let mut report = CycleReport::default();
        let mut skip = FxHashSet::default();

        while report.attempts() < free {
            match self.attempt_one(users, &skip).await {
                Ok(Attempt::Submitted(_)) => report.submitted += 1,
                Ok(Attempt::Rejected(job)) => {
                    report.rejected += 1;
                    skip.insert(job);
                }
                Ok(Attempt::Raced(job)) => {
                    report.raced += 1;
                    skip.insert(job);
                }
                Ok(Attempt::NoWork) => break,
                Err(e @ HandoffError::FilesystemFatal { .. }) => {
                    error!(error = %e, "Stopping hand-off cycle on filesystem failure");
                    report.fatal = Some(e.to_string());
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            submitted = report.submitted,
            rejected = report.rejected,
            raced = report.raced,
            free,
            "Hand-off cycle finished"
        );
        Ok(report)
    }

    /// Pick one candidate not in `skip`, orphans first, and run it through
    /// the state machine.
    pub async fn attempt_one(&mut self, users: &[String], skip: &FxHashSet<PendingJob>) -> HandoffResult<Attempt> {
        let mut candidates = self.scan(users).await?;
        candidates.orphans.retain(|job| !skip.contains(job));
        candidates.pending.retain(|job| !skip.contains(job));

        if let Some(job) = candidates.orphans.first().cloned() {
            let dirs = self.layout.user_dirs(&job.owner);
            let staged = dirs.staging.join(&job.file_name);
            // The user may have reused the name since the crash.
            let inbox = free_path(&dirs.inbox, &job.file_name, REQUEUED_TAG).await;
            return match claim(&staged, &inbox).await {
                ClaimOutcome::Claimed => {
                    let recovered = PendingJob {
                        owner: job.owner.clone(),
                        file_name: file_name_of(&inbox, &job.file_name),
                    };
                    info!(job = %job, recovered_as = %recovered.file_name, "Recovered orphaned job from staging");
                    self.claim_and_submit(recovered, &dirs).await
                }
                ClaimOutcome::Raced => {
                    warn!(job = %job, "Orphaned job was recovered by another worker");
                    Ok(Attempt::Raced(job))
                }
                ClaimOutcome::Failed(source) => Err(HandoffError::FilesystemFatal {
                    from: staged,
                    to: inbox,
                    source,
                }),
            };
        }

        let Some(job) = take_random(&mut candidates.pending, &mut self.rng) else {
            debug!("No pending jobs");
            return Ok(Attempt::NoWork);
        };
        let dirs = self.layout.user_dirs(&job.owner);
        self.claim_and_submit(job, &dirs).await
    }

    async fn claim_and_submit(&self, job: PendingJob, dirs: &UserDirs) -> HandoffResult<Attempt> {
        let pending = dirs.inbox.join(&job.file_name);
        let staged = dirs.staging.join(&job.file_name);

        match claim(&pending, &staged).await {
            ClaimOutcome::Claimed => {}
            ClaimOutcome::Raced => {
                warn!(job = %job, "Job was claimed by another worker, moving on");
                return Ok(Attempt::Raced(job));
            }
            ClaimOutcome::Failed(source) => {
                return Err(HandoffError::FilesystemFatal {
                    from: pending,
                    to: staged,
                    source,
                });
            }
        }

        self.submit_staged(job, dirs, &staged).await
    }

    async fn submit_staged(&self, job: PendingJob, dirs: &UserDirs, staged: &Path) -> HandoffResult<Attempt> {
        let command = self.sink.describe(staged);
        info!(
            operator = %self.operator,
            owner = %job.owner,
            file = %job.file_name,
            "Submitting job"
        );

        let (outcome, exit_code, output) = match self.sink.submit(staged).await {
            Ok(out) if out.success => (SubmitOutcome::Submitted, out.exit_code, out.output),
            Ok(out) => {
                warn!(job = %job, exit_code = ?out.exit_code, output = %out.output.trim(), "Submit rejected");
                (SubmitOutcome::Rejected, out.exit_code, out.output)
            }
            Err(e) => {
                warn!(job = %job, error = %e, "Submit command failed");
                (SubmitOutcome::Rejected, None, e.to_string())
            }
        };

        let destination = match outcome {
            SubmitOutcome::Submitted => free_path(&dirs.submitted, &job.file_name, ARCHIVED_TAG).await,
            SubmitOutcome::Rejected => free_path(&dirs.inbox, &job.file_name, REQUEUED_TAG).await,
        };

        // Always attempted, whatever the submit outcome.
        let moved = move_file(staged, &destination).await;

        let scheduler_job_id = match outcome {
            SubmitOutcome::Submitted => parse_qsub_output(&output),
            SubmitOutcome::Rejected => None,
        };
        if let Some(id) = &scheduler_job_id {
            info!(job = %job, scheduler_job_id = %id, "Job submitted");
        }

        let record = SubmitRecord {
            job_file: job.file_name.clone(),
            owner: job.owner.clone(),
            submitted_by: self.operator.clone(),
            command,
            outcome,
            exit_code,
            output,
            scheduler_job_id,
            recorded_at: Utc::now(),
        };
        if let Err(e) = write_record(&dirs.info, &record).await {
            warn!(job = %job, info_dir = %dirs.info.display(), error = %e, "Failed to write submit record");
        }

        if let Err(source) = moved {
            error!(
                job = %job,
                to = %destination.display(),
                error = %source,
                "Job file stranded in staging"
            );
            return Err(HandoffError::FilesystemFatal {
                from: staged.to_path_buf(),
                to: destination,
                source,
            });
        }

        Ok(match outcome {
            SubmitOutcome::Submitted => Attempt::Submitted(job),
            SubmitOutcome::Rejected => Attempt::Rejected(job),
        })
    }
}

/// Regular, non-hidden files in `dir`, sorted by name.
async fn list_job_files(dir: &Path) -> HandoffResult<Vec<String>> {
    let mut names = Vec::new();
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        match entry.file_type().await {
            Ok(kind) if kind.is_file() => names.push(name),
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    names.sort();
    Ok(names)
}

/// Path in `dir` for `file_name` that does not overwrite an existing file.
///
/// Taken names get a `.<tag>-<unix secs>` suffix, plus a counter if that is
/// taken too.
async fn free_path(dir: &Path, file_name: &str, tag: &str) -> PathBuf {
    let path = dir.join(file_name);
    if !is_taken(&path).await {
        return path;
    }

    let stamp = Utc::now().timestamp();
    let mut candidate = dir.join(format!("{file_name}.{tag}-{stamp}"));
    let mut n = 1u32;
    while is_taken(&candidate).await {
        candidate = dir.join(format!("{file_name}.{tag}-{stamp}-{n}"));
        n += 1;
    }
    candidate
}

async fn is_taken(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}

fn file_name_of(path: &Path, fallback: &str) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| fallback.to_string())
}
