//! Typed job records parsed from a scheduler snapshot.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Coarse job state used for admission decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum JobState {
    /// State code `R`.
    Running,
    /// State code `Q`.
    Queued,
    /// Any other state code (held, exiting, completed, ...).
    Other,
}

impl JobState {
    /// Map a scheduler state code to a coarse state.
    pub fn from_code(code: &str) -> Self {
        match code.trim() {
            "R" => JobState::Running,
            "Q" => JobState::Queued,
            _ => JobState::Other,
        }
    }

    /// Short label used in summaries.
    pub fn label(&self) -> &'static str {
        match self {
            JobState::Running => "R",
            JobState::Queued => "Q",
            JobState::Other => "other",
        }
    }
}

/// Cluster a job runs on, as resolved from its account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cluster(pub String);

impl Cluster {
    /// Create a cluster name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The cluster name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A scheduler attribute with no dedicated field on [`JobRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    /// Free-form text, including comma-joined repeated sub-requests.
    Text(String),
    /// Integer quantity.
    Integer(i64),
    /// Size normalized to bytes.
    Bytes(u64),
    /// Duration.
    Duration(Duration),
    /// Boolean flag (e.g. a `nodes` property without a value).
    Flag(bool),
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValue::Text(s) => write!(f, "{s}"),
            FieldValue::Integer(i) => write!(f, "{i}"),
            FieldValue::Bytes(b) => write!(f, "{b}"),
            FieldValue::Duration(d) => write!(f, "{}", d.as_secs_f64()),
            FieldValue::Flag(b) => write!(f, "{b}"),
        }
    }
}

/// One job as reported by the batch scheduler.
///
/// Records are rebuilt from scratch on every parse and never mutated
/// afterwards; the cache swaps whole lists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Numeric part of the job ID (e.g. `12345`).
    pub job_id: String,
    /// Full job ID as reported (e.g. `12345.pbs-server.example.org`).
    pub full_job_id: String,
    /// Job name.
    pub name: String,
    /// Local username of the owner, without the `@host` suffix.
    pub owner: String,
    /// Coarse state.
    pub state: JobState,
    /// Raw single-letter state code.
    pub state_code: String,
    /// Scheduler server that owns the job.
    pub server: String,
    /// Raw account the job was charged to.
    pub account: String,
    /// Queue name as the scheduler reports it.
    pub raw_queue: Option<String>,
    /// Derived cluster.
    pub cluster: Cluster,
    /// Derived queue within the cluster.
    pub queue: String,
    /// Requested quality of service.
    pub qos: Option<String>,

    pub submit_args: Option<String>,
    pub submit_host: Option<String>,
    pub exec_host: Option<String>,
    pub init_work_dir: Option<String>,
    pub interactive: Option<bool>,
    pub exit_status: Option<i32>,

    pub start_time: Option<DateTime<Utc>>,
    pub create_time: Option<DateTime<Utc>>,
    pub eligible_time: Option<DateTime<Utc>>,
    pub modify_time: Option<DateTime<Utc>>,
    pub queued_time: Option<DateTime<Utc>>,
    pub completion_time: Option<DateTime<Utc>>,

    /// Requested walltime.
    pub walltime: Option<Duration>,
    pub total_runtime: Option<Duration>,
    pub used_cpu_time: Option<Duration>,
    pub used_walltime: Option<Duration>,

    pub requested_nodes: Option<u32>,
    pub requested_cpus_per_node: Option<u32>,
    pub requested_memory_bytes: Option<u64>,
    pub used_memory_bytes: Option<u64>,
    pub used_virtual_memory_bytes: Option<u64>,

    /// Remaining scheduler attributes keyed by normalized name
    /// (`req_*`, `used_*`, and collapsed `req_information` entries).
    #[serde(default)]
    pub extra: BTreeMap<String, FieldValue>,
}

impl JobRecord {
    /// Total CPUs requested (nodes x cpus per node, each defaulting to 1).
    pub fn requested_cpus(&self) -> u64 {
        u64::from(self.requested_nodes.unwrap_or(1)) * u64::from(self.requested_cpus_per_node.unwrap_or(1))
    }

    /// Whether the job sits in the given cluster and queue.
    pub fn is_in(&self, cluster: &Cluster, queue: &str) -> bool {
        &self.cluster == cluster && self.queue == queue
    }
}

#[cfg(test)]
impl JobRecord {
    /// Minimal record for unit tests.
    pub(crate) fn stub(id: &str, owner: &str, cluster: Cluster, queue: &str, state: JobState) -> Self {
        Self {
            job_id: id.to_string(),
            full_job_id: format!("{id}.srv"),
            name: format!("job{id}"),
            owner: owner.to_string(),
            state,
            state_code: state.label().to_string(),
            server: "srv".to_string(),
            account: queue.to_string(),
            raw_queue: None,
            cluster,
            queue: queue.to_string(),
            qos: None,
            submit_args: None,
            submit_host: None,
            exec_host: None,
            init_work_dir: None,
            interactive: None,
            exit_status: None,
            start_time: None,
            create_time: None,
            eligible_time: None,
            modify_time: None,
            queued_time: None,
            completion_time: None,
            walltime: None,
            total_runtime: None,
            used_cpu_time: None,
            used_walltime: None,
            requested_nodes: None,
            requested_cpus_per_node: None,
            requested_memory_bytes: None,
            used_memory_bytes: None,
            used_virtual_memory_bytes: None,
            extra: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_state_from_code() {
        assert_eq!(JobState::from_code("R"), JobState::Running);
        assert_eq!(JobState::from_code("Q"), JobState::Queued);
        assert_eq!(JobState::from_code(" R "), JobState::Running);
        assert_eq!(JobState::from_code("H"), JobState::Other);
        assert_eq!(JobState::from_code("C"), JobState::Other);
        assert_eq!(JobState::from_code("r"), JobState::Other);
    }

    #[test]
    fn test_field_value_serde_is_tagged() {
        let value = FieldValue::Bytes(2048);
        let json = serde_json::to_string(&value).unwrap();
        assert_eq!(json, r#"{"kind":"bytes","value":2048}"#);
        let back: FieldValue = serde_json::from_str(&json).unwrap();
        assert_eq!(back, value);
    }
}
