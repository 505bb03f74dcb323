//! CLI module for the keel deployment tool.
//!
//! This module provides the command-line interface for planning and applying
//! deployments and inspecting the state file.

mod commands;
mod output;

pub use commands::{Cli, Commands, LogFormat, OutputFormat, StateCommands};
pub use output::OutputFormatter;
