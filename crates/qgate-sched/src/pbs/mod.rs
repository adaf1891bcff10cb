//! PBS/Torque integration: the external commands and the parsers for their
//! output.

mod commands;
mod parser;
pub mod units;

pub use commands::{CommandsConfig, PbsCommands, SnapshotSource, SubmitOutput, SubmitSink};
pub use parser::{parse_qsub_output, parse_snapshot};
