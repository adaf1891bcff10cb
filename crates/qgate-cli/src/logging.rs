//! Logging setup.
//!
//! Supports:
//! - Console output (interactive use)
//! - JSON structured logging (daemon under a supervisor)

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable console output.
    Console,
    /// One JSON object per line.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Filter directive (e.g. "info", "qgate_sched=debug").
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Console,
        }
    }
}

impl LogConfig {
    /// Build from the `-v` count and the environment.
    ///
    /// Environment variables:
    /// - `QGATE_LOG_LEVEL`, then `RUST_LOG`: filter (default: "info")
    /// - `QGATE_LOG_FORMAT`: "console" or "json" (default: "console")
    ///
    /// Any `-v` flag takes precedence over the environment.
    pub fn from_env(verbose: u8) -> Self {
        Self::from_lookup(verbose, |key| std::env::var(key).ok())
    }

    fn from_lookup(verbose: u8, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let level = match verbose {
            0 => lookup("QGATE_LOG_LEVEL")
                .or_else(|| lookup("RUST_LOG"))
                .unwrap_or_else(|| "info".to_string()),
            1 => "debug".to_string(),
            _ => "trace".to_string(),
        };
        let format = match lookup("QGATE_LOG_FORMAT").as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Console,
        };
        Self { level, format }
    }
}

/// Install the global subscriber.
pub fn init(config: &LogConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = match config.format {
        LogFormat::Console => fmt::layer().with_target(false).boxed(),
        LogFormat::Json => fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .json()
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        assert_eq!(LogConfig::from_lookup(0, lookup(&[])), LogConfig::default());
    }

    #[test]
    fn test_env_level_and_format() {
        let config = LogConfig::from_lookup(
            0,
            lookup(&[
                ("RUST_LOG", "warn"),
                ("QGATE_LOG_LEVEL", "qgate_sched=debug"),
                ("QGATE_LOG_FORMAT", "json"),
            ]),
        );
        assert_eq!(config.level, "qgate_sched=debug");
        assert_eq!(config.format, LogFormat::Json);
    }

    #[test]
    fn test_verbose_overrides_env() {
        let env = [("QGATE_LOG_LEVEL", "warn")];
        assert_eq!(LogConfig::from_lookup(1, lookup(&env)).level, "debug");
        assert_eq!(LogConfig::from_lookup(3, lookup(&env)).level, "trace");
    }
}
