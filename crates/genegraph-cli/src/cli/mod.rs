//! CLI command definitions for the `genegraphd` binary.
//!
//! Uses clap derive macros for argument parsing.

pub mod execution;
pub mod status;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

/// Run and inspect workflow DAG executions.
#[derive(Parser)]
#[command(name = "genegraphd", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Engine configuration file. Defaults to `<data dir>/genegraph.toml`.
    #[arg(long, global = true, env = "GENEGRAPH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory holding the database and default config.
    #[arg(long, global = true, env = "GENEGRAPH_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// SQLite database URL. Overrides `database_url` from the config file.
    #[arg(long, global = true, env = "GENEGRAPH_DATABASE_URL")]
    pub db: Option<String>,

    /// Host directory backing volume claims. Overrides `volume_root`.
    #[arg(long, global = true)]
    pub volume_root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Submit an execution from a YAML file and drive it to completion.
    Run {
        /// Path to the execution YAML file.
        file: PathBuf,

        /// Execution name. Overrides the name in the file.
        #[arg(long)]
        name: Option<String>,

        /// Store the execution without reconciling it (pick it up with
        /// `resume`).
        #[arg(long)]
        detach: bool,
    },

    /// Validate an execution file without submitting it.
    Validate {
        /// Path to the execution YAML file.
        file: PathBuf,
    },

    /// Show the status of one execution and its vertices.
    Status {
        /// Execution name.
        name: String,
    },

    /// List stored executions.
    #[command(alias = "ls")]
    List,

    /// Cancel an execution's running jobs and delete it.
    #[command(alias = "rm")]
    Delete {
        /// Execution name.
        name: String,
    },

    /// Reconcile every unfinished execution until it settles.
    Resume,

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

impl Cli {
    /// Log filter implied by `-v`/`--quiet`, if any.
    pub fn verbosity_filter(&self) -> Option<&'static str> {
        match self.verbose {
            0 if self.quiet => Some("error"),
            0 => None,
            1 => Some("info,genegraph_core=debug,genegraph_infra=debug"),
            _ => Some("trace"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "genegraphd",
            "run",
            "wgs.yaml",
            "--name",
            "wgs-2",
            "--json",
            "-vv",
        ])
        .unwrap();
        assert!(cli.json);
        assert_eq!(cli.verbosity_filter(), Some("trace"));
        match cli.command {
            Commands::Run { file, name, detach } => {
                assert_eq!(file, PathBuf::from("wgs.yaml"));
                assert_eq!(name.as_deref(), Some("wgs-2"));
                assert!(!detach);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_quiet_maps_to_error_filter() {
        let cli = Cli::try_parse_from(["genegraphd", "--quiet", "list"]).unwrap();
        assert_eq!(cli.verbosity_filter(), Some("error"));
    }
}
