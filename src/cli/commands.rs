//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;

/// Stackform - dependency-ordered provisioning for static-site stacks.
#[derive(Parser, Debug)]
#[command(name = "stackform")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the settings file.
    #[arg(short, long, global = true, env = "STACKFORM_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new Stackform project.
    Init {
        /// Directory to initialize (defaults to current directory).
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Force overwrite existing files.
        #[arg(short, long)]
        force: bool,

        /// Skip the provider credential check.
        #[arg(long)]
        offline: bool,
    },

    /// Load and validate the declarations.
    Validate {
        /// Variable inputs.
        #[command(flatten)]
        vars: VarArgs,
    },

    /// Show what apply would change.
    ///
    /// Exits 0 when nothing changes, 2 when changes are pending.
    Plan {
        /// Plan destruction of every recorded resource.
        #[arg(long)]
        destroy: bool,

        /// Planning options.
        #[command(flatten)]
        options: PlanArgs,
    },

    /// Plan and apply changes.
    Apply {
        /// Skip the confirmation prompt.
        #[arg(long)]
        auto_approve: bool,

        /// Maximum concurrent provider calls (overrides settings).
        #[arg(long, value_parser = clap::value_parser!(u32).range(1..=64))]
        parallelism: Option<u32>,

        /// Planning options.
        #[command(flatten)]
        options: PlanArgs,
    },

    /// Destroy every recorded resource.
    Destroy {
        /// Skip the confirmation prompt.
        #[arg(long)]
        auto_approve: bool,

        /// Maximum concurrent provider calls (overrides settings).
        #[arg(long, value_parser = clap::value_parser!(u32).range(1..=64))]
        parallelism: Option<u32>,
    },

    /// Show outputs from the State Record.
    Output {
        /// Output name (all outputs if omitted).
        name: Option<String>,

        /// Print strings without quotes.
        #[arg(long, requires = "name")]
        raw: bool,
    },

    /// Inspect or repair the State Record.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// Options shared by `plan` and `apply`.
#[derive(Args, Debug, Clone)]
pub struct PlanArgs {
    /// Read recorded resources from the provider before diffing.
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub refresh: bool,

    /// Variable inputs.
    #[command(flatten)]
    pub vars: VarArgs,
}

/// Variable inputs shared by commands that load declarations.
#[derive(Args, Debug, Clone, Default)]
pub struct VarArgs {
    /// Set a variable (`name=value`); repeatable.
    #[arg(long = "var", value_name = "NAME=VALUE")]
    pub vars: Vec<String>,

    /// Variable override file (overrides the settings `var_file`).
    #[arg(long)]
    pub var_file: Option<PathBuf>,
}

/// State management subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Show the State Record.
    Show,

    /// List recorded resource addresses.
    List,

    /// Release the state lock.
    Unlock {
        /// Lock ID to release.
        #[arg(long)]
        lock_id: Option<String>,

        /// Break the lock whoever holds it.
        #[arg(long)]
        force: bool,
    },
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

impl Cli {
    /// Parses CLI arguments from the command line.
    #[must_use]
    pub fn parse_args() -> Self {
        Self::parse()
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
    fn test_parse_apply_flags() {
        let cli = Cli::try_parse_from([
            "stackform",
            "apply",
            "--auto-approve",
            "--parallelism",
            "4",
            "--refresh=false",
            "--var",
            "site_name=docs",
            "--output",
            "json",
        ])
        .expect("valid arguments");

        assert_eq!(cli.output, OutputFormat::Json);
        match cli.command {
            Commands::Apply {
                auto_approve,
                parallelism,
                options,
            } => {
                assert!(auto_approve);
                assert_eq!(parallelism, Some(4));
                assert!(!options.refresh);
                assert_eq!(options.vars.vars, vec!["site_name=docs"]);
            }
            other => panic!("expected apply, got {other:?}"),
        }
    }

    #[test]
    fn test_parallelism_is_bounded() {
        assert!(Cli::try_parse_from(["stackform", "apply", "--parallelism", "0"]).is_err());
        assert!(Cli::try_parse_from(["stackform", "apply", "--parallelism", "65"]).is_err());
    }

    #[test]
    fn test_refresh_defaults_on() {
        let cli = Cli::try_parse_from(["stackform", "plan"]).expect("valid arguments");
        match cli.command {
            Commands::Plan { destroy, options } => {
                assert!(!destroy);
                assert!(options.refresh);
            }
            other => panic!("expected plan, got {other:?}"),
        }
    }
}
