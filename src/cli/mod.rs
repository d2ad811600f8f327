//! Command Line Interface module
//!
//! Implements the CLI commands and argument parsing for bookstream.

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "bookstream")]
#[command(about = "Bookstream Market Data Collector")]
#[command(long_about = "Multi-exchange order book collector publishing to NATS")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file path
    #[arg(long, default_value = "config.toml")]
    pub config_file: String,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the collector service
    Run,

    /// Validate the configuration file and exit
    Check,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Reset configuration to defaults
    Reset,
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Resolve the effective log level against the configured one
    pub fn effective_log_level(&self, configured: &str) -> String {
        if self.verbose {
            return "debug".to_string();
        }
        self.log_level
            .clone()
            .unwrap_or_else(|| configured.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["bookstream", "run"]).unwrap();
        assert!(matches!(cli.command, Commands::Run));
        assert_eq!(cli.config_file, "config.toml");
    }

    #[test]
    fn test_check_command() {
        let cli =
            Cli::try_parse_from(["bookstream", "--config-file", "other.toml", "check"]).unwrap();
        assert!(matches!(cli.command, Commands::Check));
        assert_eq!(cli.config_file, "other.toml");
    }

    #[test]
    fn test_verbose_overrides_level() {
        let cli = Cli::try_parse_from(["bookstream", "--verbose", "run"]).unwrap();
        assert_eq!(cli.effective_log_level("info"), "debug");

        let cli = Cli::try_parse_from(["bookstream", "run"]).unwrap();
        assert_eq!(cli.effective_log_level("warn"), "warn");

        let cli = Cli::try_parse_from(["bookstream", "--log-level", "trace", "run"]).unwrap();
        assert_eq!(cli.effective_log_level("info"), "trace");
    }
}
