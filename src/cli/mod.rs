//! CLI interface and argument parsing
//!
//! This module provides the command-line interface for iaso-export using clap.

pub mod commands;

use clap::{Parser, Subcommand};

/// Exit code of a run that completed without errored units
pub const EXIT_OK: i32 = 0;
/// Exit code of a run that completed with errored units
pub const EXIT_PARTIAL: i32 = 1;
/// Exit code of configuration and request validation errors
pub const EXIT_CONFIG: i32 = 2;
/// Exit code of database or DHIS2 connection errors
pub const EXIT_CONNECTION: i32 = 4;
/// Exit code of any other error
pub const EXIT_FATAL: i32 = 5;
/// Exit code of a run stopped by a signal
pub const EXIT_INTERRUPTED: i32 = 130;

/// IASO export - DHIS2 data value export
#[derive(Parser, Debug)]
#[command(name = "iaso-export")]
#[command(version, about, long_about = None)]
#[command(author = "IASO Contributors")]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "iaso-export.toml", env = "IASO_CONFIG")]
    pub config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "IASO_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Queue an export request and send its submissions to DHIS2
    Export(commands::export::ExportArgs),

    /// Validate configuration file
    ValidateConfig(commands::validate::ValidateArgs),

    /// Show export requests and their statuses
    Status(commands::status::StatusArgs),

    /// Initialize a new configuration file
    Init(commands::init::InitArgs),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_export() {
        let cli = Cli::parse_from(["iaso-export", "export", "--request-id", "4"]);
        assert_eq!(cli.config, "iaso-export.toml");
        assert!(matches!(cli.command, Commands::Export(_)));
    }

    #[test]
    fn test_cli_parse_with_config() {
        let cli = Cli::parse_from([
            "iaso-export",
            "--config",
            "custom.toml",
            "export",
            "--request-id",
            "4",
        ]);
        assert_eq!(cli.config, "custom.toml");
    }

    #[test]
    fn test_cli_parse_with_log_level() {
        let cli = Cli::parse_from(["iaso-export", "--log-level", "debug", "status"]);
        assert_eq!(cli.log_level, Some("debug".to_string()));
    }

    #[test]
    fn test_cli_parse_validate_config() {
        let cli = Cli::parse_from(["iaso-export", "validate-config"]);
        assert!(matches!(cli.command, Commands::ValidateConfig(_)));
    }

    #[test]
    fn test_cli_parse_status() {
        let cli = Cli::parse_from(["iaso-export", "status"]);
        assert!(matches!(cli.command, Commands::Status(_)));
    }

    #[test]
    fn test_cli_parse_init() {
        let cli = Cli::parse_from(["iaso-export", "init"]);
        assert!(matches!(cli.command, Commands::Init(_)));
    }
}
