//! In-memory scheduler collaborators shared by the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use qgate_sched::error::{CommandError, CommandResult};
use qgate_sched::{SnapshotSource, SubmitOutput, SubmitSink};

/// Snapshot with a single running job owned by `owner`, charged to `open`.
pub fn one_running_job(owner: &str) -> String {
    format!(
        "<Data><Job><Job_Id>100.torque01.example.org</Job_Id><Job_Name>long_md</Job_Name>\
<Job_Owner>{owner}@login01.example.org</Job_Owner><job_state>R</job_state><queue>batch</queue>\
<server>torque01.example.org</server><Account_Name>open</Account_Name>\
<Resource_List><nodes>1:ppn=2</nodes><walltime>24:00:00</walltime></Resource_List></Job></Data>
"
    )
}

/// Snapshot cut off in the middle of a job.
pub const TRUNCATED: &str = "<Data><Job><Job_Id>100.torque01.example.org</Job_Id><Job_Name>long_md</Job_Name><Job_Own";

/// Snapshot with two copies of [`one_running_job`].
pub fn two_running_jobs(owner: &str) -> String {
    let job = one_running_job(owner);
    let job = job.trim().trim_start_matches("<Data>").trim_end_matches("</Data>");
    format!("<Data>{job}{job}</Data>")
}

/// [`two_running_jobs`] cut off at the job boundary: well-formed so far,
/// but a job short.
pub fn cut_after_first_job(owner: &str) -> String {
    let full = two_running_jobs(owner);
    full[..full.rfind("<Job>").unwrap_or(full.len())].to_string()
}

/// Snapshot source replaying scripted outputs. The last one repeats.
pub struct MockSource {
    outputs: Mutex<VecDeque<Vec<u8>>>,
    calls: AtomicUsize,
}

impl MockSource {
    pub fn new<I, S>(outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            outputs: Mutex::new(outputs.into_iter().map(|s| s.into().into_bytes()).collect()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Source that always reports `snapshot`.
    pub fn fixed(snapshot: impl Into<String>) -> Self {
        Self::new([snapshot.into()])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotSource for MockSource {
    async fn snapshot(&self) -> CommandResult<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut outputs = self.outputs.lock().unwrap();
        let output = if outputs.len() > 1 {
            outputs.pop_front()
        } else {
            outputs.front().cloned()
        };
        match output {
            Some(output) if !output.is_empty() => Ok(output),
            _ => Err(CommandError::EmptyOutput {
                command: self.describe(),
            }),
        }
    }

    fn describe(&self) -> String {
        "mock-qstat -x".to_string()
    }
}

/// Submit sink recording every call. Files containing `REJECT` are refused
/// by the scheduler, files containing `UNREACHABLE` make the command itself
/// fail, everything else is accepted.
#[derive(Default)]
pub struct MockSink {
    submitted: Mutex<Vec<PathBuf>>,
    next_id: AtomicUsize,
}

impl MockSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Paths handed to the sink, in order.
    pub fn submitted(&self) -> Vec<PathBuf> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.submitted.lock().unwrap().len()
    }
}

#[async_trait]
impl SubmitSink for MockSink {
    async fn submit(&self, job_file: &Path) -> CommandResult<SubmitOutput> {
        self.submitted.lock().unwrap().push(job_file.to_path_buf());
        let contents = tokio::fs::read_to_string(job_file).await.unwrap_or_default();
        if contents.contains("UNREACHABLE") {
            return Err(CommandError::Spawn {
                command: self.describe(job_file),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }
        if contents.contains("REJECT") {
            return Ok(SubmitOutput {
                success: false,
                exit_code: Some(1),
                output: "qsub: submit error (Bad UID for job execution MSG=ruserok failed)\n".to_string(),
            });
        }
        let id = 5000 + self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(SubmitOutput {
            success: true,
            exit_code: Some(0),
            output: format!("{id}.torque01.example.org\n"),
        })
    }

    fn describe(&self, job_file: &Path) -> String {
        format!("mock-qsub {}", job_file.display())
    }
}

/// Directory names under one user's base directory.
pub fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}
