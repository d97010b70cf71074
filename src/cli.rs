//! Command-line interface built on clap.
//!
//! [`Cli`] carries the global flags (`--config`, `--verbose`) and one
//! [`Command`]: print the catalog, show a record's status menu, or run a bulk
//! transition over in-memory demo records.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use statewright::executor::TransactionMode;

/// Statewright: finite-state transitions for records.
#[derive(Debug, Parser)]
#[command(name = "statewright", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Configuration file (defaults to `statewright.toml`).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log at debug level regardless of the configured filter.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ModeArg {
    /// One transaction per record.
    PerRecord,
    /// One transaction for the batch, committed despite failures.
    Batched,
    /// One transaction for the batch, rolled back on any failure.
    AllOrNothing,
}

impl From<ModeArg> for TransactionMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::PerRecord => TransactionMode::PerRecord,
            ModeArg::Batched => TransactionMode::BatchedCommit,
            ModeArg::AllOrNothing => TransactionMode::AllOrNothing,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Lists every transition, grouped by source state.
    Catalog,

    /// Shows the status menu of a record in the given state.
    Menu {
        /// Current state of the record.
        #[arg(long)]
        state: String,

        /// Capability the principal lacks. Repeatable.
        #[arg(long)]
        deny: Vec<String>,
    },

    /// Moves a batch of in-memory records sharing one state.
    Demo {
        /// Number of records to create.
        #[arg(long, default_value_t = 5)]
        records: usize,

        /// State the records start in (defaults to the first declared state).
        #[arg(long)]
        from: Option<String>,

        /// State to move them into.
        #[arg(long)]
        target: String,

        /// Records (1-based) the principal may not touch. Repeatable.
        #[arg(long)]
        deny_record: Vec<usize>,

        #[arg(long, value_enum, default_value_t = ModeArg::PerRecord)]
        mode: ModeArg,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_menu_subcommand() {
        let cli = Cli::parse_from([
            "statewright",
            "menu",
            "--state",
            "pending",
            "--deny",
            "approve",
            "--deny",
            "update",
        ]);
        match cli.command {
            Command::Menu { state, deny } => {
                assert_eq!(state, "pending");
                assert_eq!(deny, ["approve", "update"]);
            }
            _ => panic!("expected Menu command"),
        }
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from(["statewright", "--config", "wf.toml", "--verbose", "catalog"]);
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("wf.toml")));
        assert!(matches!(cli.command, Command::Catalog));
    }

    #[test]
    fn cli_parses_demo_defaults() {
        let cli = Cli::parse_from(["statewright", "demo", "--target", "approved"]);
        match cli.command {
            Command::Demo {
                records,
                from,
                target,
                deny_record,
                mode,
            } => {
                assert_eq!(records, 5);
                assert!(from.is_none());
                assert_eq!(target, "approved");
                assert!(deny_record.is_empty());
                assert_eq!(TransactionMode::from(mode), TransactionMode::PerRecord);
            }
            _ => panic!("expected Demo command"),
        }
    }

    #[test]
    fn cli_parses_mode() {
        let cli = Cli::parse_from([
            "statewright",
            "demo",
            "--target",
            "approved",
            "--mode",
            "all-or-nothing",
        ]);
        let Command::Demo { mode, .. } = cli.command else {
            panic!("expected Demo command");
        };
        assert_eq!(TransactionMode::from(mode), TransactionMode::AllOrNothing);
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
