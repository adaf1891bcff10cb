//! qgate: a meta-scheduler in front of a PBS/Torque batch scheduler.
//!
//! Users drop job files into an inbox directory. One or more daemons watch
//! the cluster state and, whenever the target queue has room, hand those
//! files to the scheduler. Cooperating daemons share nothing but the
//! filesystem: a cache directory for the cluster snapshot and the users'
//! job directories.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use qgate_sched::{ConfigWatcher, Daemon, DaemonConfig, PbsCommands};
//!
//! let config = DaemonConfig::load("qgate.yaml")?;
//! let commands = Arc::new(PbsCommands::new(config.commands.clone()));
//! let mut daemon = Daemon::new(
//!     ConfigWatcher::new("qgate.yaml"),
//!     commands.clone(),
//!     commands,
//!     config.user.clone(),
//! )
//! .await?;
//! let outcome = daemon.run_cycle().await?;
//! ```

pub mod accounts;
pub mod admission;
pub mod cache;
pub mod config;
pub mod daemon;
pub mod error;
pub mod handoff;
pub mod layout;
pub mod pbs;
pub mod record;
pub mod table;

pub use accounts::AccountMap;
pub use admission::{AdmissionController, AdmissionLimits, AdmissionQueue, QueueStatus, QuotaSpec};
pub use cache::{CacheOptions, ClusterStateCache, RetryPolicy};
pub use config::{ConfigUpdate, ConfigWatcher, DaemonConfig};
pub use daemon::{CycleOutcome, Daemon, StopReason};
pub use error::{
    CacheError, CacheResult, CommandError, ConfigError, ConfigResult, HandoffError, HandoffResult, ParseError,
    QgateError, QgateResult,
};
pub use handoff::{CycleReport, HandoffEngine};
pub use layout::{DirectoryLayout, UserDirs};
pub use pbs::{CommandsConfig, PbsCommands, SnapshotSource, SubmitOutput, SubmitSink};
pub use record::{Cluster, FieldValue, JobRecord, JobState};
pub use table::{JobTable, QueueCounts};
