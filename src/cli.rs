use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Command-line interface for the session usage tracker.
#[derive(Debug, Parser)]
#[command(author, version, about = "Local Claude Code session usage tracker", long_about = None)]
pub struct Cli {
    /// Path to a TOML configuration file (defaults to ./claude-usage.toml if present).
    #[arg(long, value_name = "FILE", global = true)]
    pub config_path: Option<PathBuf>,
    /// Rebuild usage data by truncating every table before ingesting.
    #[arg(long, global = true)]
    pub rebuild: bool,
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Import every session log once and print a summary.
    Import {
        /// Import a single session file instead of the whole projects tree.
        #[arg(long, value_name = "FILE")]
        file: Option<PathBuf>,
    },
    /// Import, then keep tailing session logs until interrupted (the default).
    Watch,
    /// Print aggregate statistics as JSON.
    Stats {
        /// Show one session's events instead of the global rollups.
        #[arg(long, value_name = "SESSION_ID")]
        session: Option<String>,
    },
}

impl Cli {
    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Watch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_watch() {
        let cli = Cli::try_parse_from(["claude-usage-tracker"]).unwrap();
        assert!(matches!(cli.command(), Command::Watch));
        assert!(!cli.rebuild);
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "claude-usage-tracker",
            "import",
            "--file",
            "/tmp/s.jsonl",
            "--rebuild",
            "--config-path",
            "custom.toml",
        ])
        .unwrap();
        assert!(cli.rebuild);
        assert_eq!(cli.config_path, Some(PathBuf::from("custom.toml")));
        let Command::Import { file } = cli.command() else {
            panic!("expected import");
        };
        assert_eq!(file, Some(PathBuf::from("/tmp/s.jsonl")));
    }
}
