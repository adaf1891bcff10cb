//! Submission audit records, written to the job owner's info directory.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::files::write_atomic;
use crate::error::HandoffResult;

/// What happened to a submitted job file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitOutcome {
    /// Accepted; archived in `submitted/`.
    Submitted,
    /// Rejected or the command failed; returned to the inbox.
    Rejected,
}

/// One submission attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitRecord {
    pub job_file: String,
    pub owner: String,
    /// User the daemon runs as.
    pub submitted_by: String,
    pub command: String,
    pub outcome: SubmitOutcome,
    pub exit_code: Option<i32>,
    /// Combined command output, or the reason the command could not run.
    pub output: String,
    /// Job ID reported by the scheduler on success.
    pub scheduler_job_id: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl SubmitRecord {
    /// File name inside the info directory, e.g.
    /// `job.pbs.qsub.alice.20240101T120000.123456.out.json`.
    pub fn file_name(&self) -> String {
        let kind = match self.outcome {
            SubmitOutcome::Submitted => "out",
            SubmitOutcome::Rejected => "err",
        };
        format!(
            "{}.qsub.{}.{}.{kind}.json",
            self.job_file,
            self.submitted_by,
            self.recorded_at.format("%Y%m%dT%H%M%S%.6f")
        )
    }
}

/// Write the record into `info_dir`, returning its path.
pub async fn write_record(info_dir: &Path, record: &SubmitRecord) -> HandoffResult<PathBuf> {
    let path = info_dir.join(record.file_name());
    let json = serde_json::to_vec_pretty(record)?;
    write_atomic(&path, &json, None).await?;
    Ok(path)
}
