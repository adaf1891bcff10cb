//! qgate Command-Line Interface
//!
//! Runs the meta-scheduler daemon in the foreground and offers a few
//! operator commands around it.

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use console::style;

mod commands;
mod logging;

use commands::{check_config, run, submit_once, summary, version};

/// qgate - admission control and job hand-off for PBS/Torque clusters
#[derive(Parser)]
#[command(name = "qgate")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file (default: ~/.config/qgate/qgate.yaml)
    #[arg(short, long, global = true, env = "QGATE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon loop in the foreground
    Run,

    /// Print the cluster job summary
    Summary {
        /// Ignore cached snapshots and query the scheduler
        #[arg(long)]
        fresh: bool,

        /// Print the job table as JSON
        #[arg(long)]
        json: bool,
    },

    /// Load and validate the configuration
    CheckConfig,

    /// Run a single admission check and hand-off cycle
    SubmitOnce,

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    if let Err(e) = logging::init(&logging::LogConfig::from_env(cli.verbose)) {
        eprintln!("{} {e}", style("Warning:").yellow().bold());
    }

    let config_path = commands::common::config_path(cli.config);

    let result = match cli.command {
        Commands::Run => run::execute(&config_path).await,
        Commands::Summary { fresh, json } => summary::execute(&config_path, fresh, json).await,
        Commands::CheckConfig => check_config::execute(&config_path).await,
        Commands::SubmitOnce => submit_once::execute(&config_path).await,
        Commands::Version => {
            version::execute();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("{} {:#}", style("Error:").red().bold(), e);
        std::process::exit(1);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from(["qgate", "run"]).unwrap();
        assert!(matches!(cli.command, Commands::Run));
        assert_eq!(cli.verbose, 0);
    }

    #[test]
    fn test_parse_summary_flags() {
        let cli = Cli::try_parse_from(["qgate", "-vv", "summary", "--fresh", "--json"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(matches!(
            cli.command,
            Commands::Summary {
                fresh: true,
                json: true
            }
        ));
    }

    #[test]
    fn test_parse_global_config() {
        let cli = Cli::try_parse_from(["qgate", "check-config", "--config", "/etc/qgate.yaml"]).unwrap();
        assert!(matches!(cli.command, Commands::CheckConfig));
        assert_eq!(cli.config, Some(PathBuf::from("/etc/qgate.yaml")));
    }

    #[test]
    fn test_parse_submit_once() {
        let cli = Cli::try_parse_from(["qgate", "submit-once"]).unwrap();
        assert!(matches!(cli.command, Commands::SubmitOnce));
    }

    #[test]
    fn test_unknown_subcommand_fails() {
        assert!(Cli::try_parse_from(["qgate", "frobnicate"]).is_err());
        assert!(Cli::try_parse_from(["qgate"]).is_err());
    }
}
