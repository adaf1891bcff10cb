//! Error handling for the meta-scheduler.

use std::path::PathBuf;

use thiserror::Error;

/// Result type for cluster state cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Result type for job hand-off operations.
pub type HandoffResult<T> = Result<T, HandoffError>;

/// Result type for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Result type for external command invocations.
pub type CommandResult<T> = Result<T, CommandError>;

/// Result type for daemon-level operations.
pub type QgateResult<T> = Result<T, QgateError>;

/// Errors raised while invoking the batch scheduler's external commands.
#[derive(Error, Debug)]
pub enum CommandError {
    /// The command could not be started at all.
    #[error("Failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The command ran but exited unsuccessfully.
    #[error("{command} exited with status {status:?}: {output}")]
    Failed {
        command: String,
        status: Option<i32>,
        output: String,
    },

    /// The command did not finish in time.
    #[error("{command} timed out after {secs}s")]
    Timeout { command: String, secs: u64 },

    /// The command succeeded but printed nothing.
    #[error("{command} produced no output")]
    EmptyOutput { command: String },

    /// The command is not allowed for the requested user.
    #[error("Cannot run {command} on behalf of user {user} (running as {process_user})")]
    ForeignUser {
        command: String,
        user: String,
        process_user: String,
    },
}

/// Errors converting a single scheduler value into a typed quantity.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UnitError {
    /// Not a `<n>[kmgtpe][b|w]` size.
    #[error("invalid size {0:?}")]
    InvalidSize(String),

    /// Not a `[[[d:]h:]m:]s` duration.
    #[error("invalid duration {0:?}")]
    InvalidDuration(String),

    /// Neither epoch seconds nor a scheduler date.
    #[error("invalid timestamp {0:?}")]
    InvalidTimestamp(String),

    /// Not an integer.
    #[error("invalid integer {0:?}")]
    InvalidInteger(String),
}

/// Errors raised by the snapshot record parser.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The snapshot is not well-formed XML, or not the expected
    /// `<Data><Job>` tree.
    #[error("Malformed snapshot at byte {position}: {message}")]
    Xml { position: u64, message: String },

    /// The snapshot ended before its closing tags.
    #[error("Snapshot ends inside <{open}>")]
    Truncated { open: String },

    /// A job block is missing an attribute every record needs.
    #[error("Job {job_id} is missing required attribute {attribute}")]
    MissingAttribute {
        job_id: String,
        attribute: &'static str,
    },

    /// An attribute value could not be converted.
    #[error("Job {job_id}: bad value for {attribute}: {source}")]
    InvalidValue {
        job_id: String,
        attribute: String,
        #[source]
        source: UnitError,
    },

    /// The job's account is not in the account map.
    #[error("Job {job_id}: unhandled account {account:?}")]
    UnknownAccount { job_id: String, account: String },
}

impl ParseError {
    /// Whether re-reading the snapshot could make this error go away.
    ///
    /// A snapshot captured while the scheduler was rewriting it shows up as a
    /// truncated or garbled document; an unmapped account is deterministic.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ParseError::UnknownAccount { .. })
    }
}

/// Errors that can occur while fetching cluster state.
#[derive(Error, Debug)]
pub enum CacheError {
    /// The external snapshot command could not produce a snapshot.
    #[error("Upstream command error: {0}")]
    UpstreamCommand(#[from] CommandError),

    /// The snapshot stayed unparseable after every retry.
    #[error("Parse error after {attempts} attempt(s): {source}")]
    Parse {
        attempts: u32,
        #[source]
        source: ParseError,
    },

    /// IO error on the cache directory.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that can occur while handing a job off to the batch scheduler.
#[derive(Error, Debug)]
pub enum HandoffError {
    /// A move failed for a reason other than a lost race.
    #[error("Filesystem failure moving {} to {}: {source}", .from.display(), .to.display())]
    FilesystemFatal {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// IO error outside of a state transition (listing, audit records).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error for audit records.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("Failed to read config {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid YAML for the schema.
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml_ng::Error),

    /// The configuration parsed but violates an invariant.
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    /// The configuration file has been missing for longer than allowed.
    #[error("Config {} missing for {missing_secs}s (limit {grace_secs}s)", .path.display())]
    MissingTooLong {
        path: PathBuf,
        missing_secs: u64,
        grace_secs: u64,
    },
}

/// Top-level error for the daemon.
#[derive(Error, Debug)]
pub enum QgateError {
    /// Configuration error.
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Cluster state cache error.
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// Hand-off error.
    #[error("Hand-off error: {0}")]
    Handoff(#[from] HandoffError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
