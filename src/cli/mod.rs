//! CLI module for Stackform.
//!
//! This module provides the command-line interface: argument parsing and
//! the formatting of plans, apply results, state and outputs.

mod commands;
mod output;

pub use commands::{Cli, Commands, OutputFormat, PlanArgs, StateCommands, VarArgs};
pub use output::OutputFormatter;
