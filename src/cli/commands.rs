//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::Environment;

/// Rollwarden - health-gated rollouts for dev, stage and prod.
#[derive(Parser, Debug)]
#[command(name = "rollwarden")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true, env = "ROLLWARDEN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Log format (text, json).
    #[arg(long, global = true, default_value = "text", env = "ROLLWARDEN_LOG_FORMAT")]
    pub log_format: LogFormat,

    /// Run against an in-memory cluster and history.
    #[arg(long, global = true)]
    pub simulate: bool,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate the configuration.
    Validate {
        /// Show all warnings, not just errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Render an environment's manifest.
    Render {
        /// Target environment.
        #[arg(value_parser = parse_environment)]
        environment: Environment,
    },

    /// Show what a rollout would change.
    Plan {
        /// Target environment.
        #[arg(value_parser = parse_environment)]
        environment: Environment,

        /// Show the changed fields of each update.
        #[arg(short, long)]
        detailed: bool,
    },

    /// Plan and roll out an environment.
    Apply {
        /// Target environment.
        #[arg(value_parser = parse_environment)]
        environment: Environment,

        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Roll an environment back to its previous good state.
    Rollback {
        /// Target environment.
        #[arg(value_parser = parse_environment)]
        environment: Environment,

        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Show the head record, lock and drift of environments.
    Status {
        /// Environment (all environments if omitted).
        #[arg(value_parser = parse_environment)]
        environment: Option<Environment>,
    },

    /// Show recent rollouts.
    History {
        /// Target environment.
        #[arg(value_parser = parse_environment)]
        environment: Environment,

        /// Number of records to show.
        #[arg(short = 'n', long, default_value = "10")]
        limit: usize,
    },

    /// Settle a rollout interrupted by a crash.
    Recover {
        /// Target environment.
        #[arg(value_parser = parse_environment)]
        environment: Environment,
    },

    /// Manage secret material.
    Secret {
        /// Secret subcommand.
        #[command(subcommand)]
        command: SecretCommands,
    },
}

/// Secret management subcommands.
#[derive(Subcommand, Debug)]
pub enum SecretCommands {
    /// Create every referenced key with a placeholder value.
    Init {
        /// Target environment.
        #[arg(value_parser = parse_environment)]
        environment: Environment,
    },

    /// Check values for placeholders, empties and missing keys.
    Validate {
        /// Target environment.
        #[arg(value_parser = parse_environment)]
        environment: Environment,
    },

    /// List keys and versions.
    List {
        /// Target environment.
        #[arg(value_parser = parse_environment)]
        environment: Environment,
    },

    /// Set a value, creating the key if needed (value read from stdin).
    Put {
        /// Target environment.
        #[arg(value_parser = parse_environment)]
        environment: Environment,

        /// Secret key.
        key: String,

        /// Read the value from this environment variable instead of stdin.
        #[arg(long)]
        from_env: Option<String>,
    },

    /// Replace the value of an existing key (value read from stdin).
    Rotate {
        /// Target environment.
        #[arg(value_parser = parse_environment)]
        environment: Environment,

        /// Secret key.
        key: String,

        /// Read the value from this environment variable instead of stdin.
        #[arg(long)]
        from_env: Option<String>,
    },

    /// Print one value; the access is audited.
    Reveal {
        /// Target environment.
        #[arg(value_parser = parse_environment)]
        environment: Environment,

        /// Secret key.
        key: String,

        /// Why the value is needed.
        #[arg(long)]
        reason: String,
    },

    /// Generate a new sealing key.
    Keygen {
        /// Write the key to the configured or default key file instead of
        /// printing it.
        #[arg(long)]
        write: bool,
    },
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

/// Log format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// Human-readable log lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

fn parse_environment(value: &str) -> Result<Environment, String> {
    value.parse().map_err(|e: crate::error::ConfigError| e.to_string())
}

impl Cli {
    /// Parses CLI arguments from the command line.
    #[must_use]
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
