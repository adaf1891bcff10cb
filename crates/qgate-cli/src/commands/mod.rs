//! CLI command implementations.

pub mod check_config;
pub mod common;
pub mod run;
pub mod submit_once;
pub mod summary;
pub mod version;
