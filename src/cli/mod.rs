//! CLI module for the rollwarden tool.
//!
//! This module provides the command-line interface for planning, applying
//! and rolling back environments and managing their secrets.

mod commands;
mod output;

pub use commands::{Cli, Commands, LogFormat, OutputFormat, SecretCommands};
pub use output::OutputFormatter;
