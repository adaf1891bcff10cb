//! External scheduler commands behind async traits.
//!
//! The cache only ever asks for "a snapshot" and the hand-off engine only
//! ever asks to "submit this file"; both go through these traits so tests
//! can substitute in-memory collaborators.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

use crate::error::{CommandError, CommandResult};

/// Produces the raw cluster state snapshot.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Run the snapshot command and return its standard output.
    ///
    /// A non-zero exit or an empty output is an error, never "no jobs".
    async fn snapshot(&self) -> CommandResult<Vec<u8>>;

    /// Human-readable command line, for logs and errors.
    fn describe(&self) -> String;
}

/// Outcome of one submit invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitOutput {
    /// Whether the scheduler accepted the job.
    pub success: bool,
    /// Exit code, if the process exited normally.
    pub exit_code: Option<i32>,
    /// Combined standard output and standard error.
    pub output: String,
}

/// Hands a job file to the batch scheduler.
#[async_trait]
pub trait SubmitSink: Send + Sync {
    /// Submit the job file. `Err` means the command could not be run at all;
    /// a rejection by the scheduler is `Ok` with `success == false`.
    async fn submit(&self, job_file: &Path) -> CommandResult<SubmitOutput>;

    /// Human-readable command line for a given file.
    fn describe(&self, job_file: &Path) -> String;
}

/// Scheduler command configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandsConfig {
    /// Snapshot program (e.g. `qstat`).
    pub snapshot_program: String,
    /// Arguments producing the XML attribute listing.
    pub snapshot_args: Vec<String>,
    /// Submit program (e.g. `qsub`).
    pub submit_program: String,
    /// Arguments placed before the job file.
    pub submit_args: Vec<String>,
    /// Snapshot command timeout in seconds. Unset waits indefinitely and
    /// leaves hang protection to the supervisor.
    pub snapshot_timeout_secs: Option<u64>,
    /// Submit command timeout in seconds.
    pub submit_timeout_secs: Option<u64>,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            snapshot_program: "qstat".to_string(),
            snapshot_args: vec!["-x".to_string()],
            submit_program: "qsub".to_string(),
            submit_args: vec!["-m".to_string(), "p".to_string(), "-A".to_string(), "open".to_string()],
            snapshot_timeout_secs: None,
            submit_timeout_secs: None,
        }
    }
}

/// Real `qstat`/`qsub` invocations.
#[derive(Debug, Clone)]
pub struct PbsCommands {
    config: CommandsConfig,
}

impl PbsCommands {
    /// Create command runners from configuration.
    pub fn new(config: CommandsConfig) -> Self {
        Self { config }
    }

    /// The configuration in use.
    pub fn config(&self) -> &CommandsConfig {
        &self.config
    }

    async fn run(
        command: &mut Command,
        described: String,
        timeout_secs: Option<u64>,
    ) -> CommandResult<std::process::Output> {
        debug!(command = %described, "Running scheduler command");
        let output = command
            .kill_on_drop(true)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output();

        let result = match timeout_secs {
            Some(secs) => tokio::time::timeout(Duration::from_secs(secs), output)
                .await
                .map_err(|_| CommandError::Timeout {
                    command: described.clone(),
                    secs,
                })?,
            None => output.await,
        };
        result.map_err(|source| CommandError::Spawn {
            command: described,
            source,
        })
    }
}

fn join_command(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

#[async_trait]
impl SnapshotSource for PbsCommands {
    async fn snapshot(&self) -> CommandResult<Vec<u8>> {
        let described = SnapshotSource::describe(self);
        let output = Self::run(
            Command::new(&self.config.snapshot_program).args(&self.config.snapshot_args),
            described.clone(),
            self.config.snapshot_timeout_secs,
        )
        .await?;

        if !output.status.success() {
            return Err(CommandError::Failed {
                command: described,
                status: output.status.code(),
                output: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        if output.stdout.iter().all(u8::is_ascii_whitespace) {
            return Err(CommandError::EmptyOutput { command: described });
        }

        Ok(output.stdout)
    }

    fn describe(&self) -> String {
        join_command(&self.config.snapshot_program, &self.config.snapshot_args)
    }
}

#[async_trait]
impl SubmitSink for PbsCommands {
    async fn submit(&self, job_file: &Path) -> CommandResult<SubmitOutput> {
        let output = Self::run(
            Command::new(&self.config.submit_program)
                .args(&self.config.submit_args)
                .arg(job_file),
            SubmitSink::describe(self, job_file),
            self.config.submit_timeout_secs,
        )
        .await?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok(SubmitOutput {
            success: output.status.success(),
            exit_code: output.status.code(),
            output: combined,
        })
    }

    fn describe(&self, job_file: &Path) -> String {
        format!(
            "{} {}",
            join_command(&self.config.submit_program, &self.config.submit_args),
            job_file.display()
        )
    }
}
