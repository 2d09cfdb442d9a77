//! Rollwarden CLI entrypoint.
//!
//! This is the main entrypoint for the rollwarden command-line tool.

use std::io::{IsTerminal, Write};
use std::path::Path;
use std::process::ExitCode;

use rollwarden::cli::{Cli, Commands, LogFormat, OutputFormatter, SecretCommands};
use rollwarden::config::Environment;
use rollwarden::error::{ConfigError, Result, RollwardenError};
use rollwarden::orchestrator::{
    Orchestrator, OrchestratorOptions, default_key_file, load_config, write_key_file,
};
use rollwarden::rollout::{RolloutHandle, RolloutOutcome, RolloutState};
use rollwarden::secrets::{RevealAcknowledgement, generate_key};
use rollwarden::state::generate_holder_id;

use clap::Parser;
use secrecy::{ExposeSecret, SecretString};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Exit code for a rollout that was rolled back and settled.
const EXIT_ROLLED_BACK: u8 = 2;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.verbose, cli.log_format);

    // Run async runtime
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system. Logs go to stderr; stdout carries results.
fn init_logging(verbose: bool, format: LogFormat) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<ExitCode> {
    let formatter = OutputFormatter::new(cli.output);
    let options = OrchestratorOptions {
        simulate: cli.simulate,
    };
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Validate { warnings } => cmd_validate(config, warnings, &formatter),
        Commands::Render { environment } => {
            let orchestrator = open(config, options).await?;
            let manifest = orchestrator.render(environment)?;
            formatter.emit(&formatter.format_manifest(&manifest));
            Ok(ExitCode::SUCCESS)
        }
        Commands::Plan { environment, detailed } => {
            let orchestrator = open(config, options).await?;
            let planned = orchestrator.plan(environment).await?;
            formatter.emit(&formatter.format_plan(&planned, detailed));
            Ok(ExitCode::SUCCESS)
        }
        Commands::Apply { environment, yes } => {
            cmd_apply(&open(config, options).await?, environment, yes, &formatter).await
        }
        Commands::Rollback { environment, yes } => {
            cmd_rollback(&open(config, options).await?, environment, yes, &formatter).await
        }
        Commands::Status { environment } => {
            let orchestrator = open(config, options).await?;
            let environments = environment.map_or_else(|| Environment::ALL.to_vec(), |env| vec![env]);
            let mut statuses = Vec::with_capacity(environments.len());
            for env in environments {
                statuses.push(orchestrator.status(env).await?);
            }
            formatter.emit(&formatter.format_status(&statuses));
            Ok(ExitCode::SUCCESS)
        }
        Commands::History { environment, limit } => {
            let orchestrator = open(config, options).await?;
            let records = orchestrator.history(environment, limit).await?;
            formatter.emit(&formatter.format_history(environment, &records));
            Ok(ExitCode::SUCCESS)
        }
        Commands::Recover { environment } => {
            let orchestrator = open(config, options).await?;
            let outcome = orchestrator.recover(environment).await?;
            formatter.emit(&formatter.format_recovery(environment, outcome.as_ref()));
            Ok(outcome.as_ref().map_or(ExitCode::SUCCESS, exit_code))
        }
        Commands::Secret { command } => cmd_secret(config, options, command, &formatter).await,
    }
}

/// Validate configuration.
fn cmd_validate(config: Option<&Path>, show_warnings: bool, formatter: &OutputFormatter) -> Result<ExitCode> {
    let loaded = load_config(config)?;
    info!("Validating configuration: {}", loaded.path.display());
    formatter.emit(&formatter.format_config(&loaded, show_warnings));
    Ok(ExitCode::SUCCESS)
}

/// Plan, confirm and roll out an environment.
async fn cmd_apply(
    orchestrator: &Orchestrator,
    environment: Environment,
    auto_approve: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let planned = orchestrator.plan(environment).await?;

    if planned.plan.is_empty() {
        formatter.success(&format!("No changes to apply to {environment}."));
        return Ok(ExitCode::SUCCESS);
    }

    if !formatter.is_json() {
        eprintln!("{}", formatter.format_plan(&planned, false));
    }

    if orchestrator.requires_confirmation(environment)
        && !auto_approve
        && !confirm_environment(environment, "apply this plan to")?
    {
        formatter.warning("Apply cancelled.");
        return Ok(ExitCode::SUCCESS);
    }

    let handle = orchestrator.apply(planned).await?;
    info!("Rollout {} started for {environment}", handle.record_id());
    let outcome = follow(handle, formatter).await?;

    formatter.emit(&formatter.format_outcome(&outcome));
    Ok(exit_code(&outcome))
}

/// Confirm and roll an environment back.
async fn cmd_rollback(
    orchestrator: &Orchestrator,
    environment: Environment,
    auto_approve: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    if orchestrator.requires_confirmation(environment)
        && !auto_approve
        && !confirm_environment(environment, "roll back")?
    {
        formatter.warning("Rollback cancelled.");
        return Ok(ExitCode::SUCCESS);
    }

    let handle = orchestrator.rollback(environment).await?;
    info!("Rollback {} started for {environment}", handle.record_id());
    let outcome = follow(handle, formatter).await?;

    formatter.emit(&formatter.format_outcome(&outcome));
    Ok(exit_code(&outcome))
}

/// Secret management commands.
async fn cmd_secret(
    config: Option<&Path>,
    options: OrchestratorOptions,
    command: SecretCommands,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    match command {
        SecretCommands::Keygen { write } => return cmd_keygen(config, write, formatter).await,
        SecretCommands::Init { environment } => {
            let created = open(config, options).await?.secret_init(environment).await?;
            if created.is_empty() {
                formatter.success(&format!("All referenced keys already exist in {environment}."));
            } else {
                formatter.success(&format!(
                    "Created {} key(s) in {environment} with placeholder values: {}",
                    created.len(),
                    created.join(", ")
                ));
            }
        }
        SecretCommands::Validate { environment } => {
            let validation = open(config, options).await?.secret_validate(environment).await?;
            formatter.emit(&formatter.format_secret_validation(&validation));
            if !validation.is_ok() {
                return Ok(ExitCode::FAILURE);
            }
        }
        SecretCommands::List { environment } => {
            let keys = open(config, options).await?.secret_list(environment).await?;
            formatter.emit(&formatter.format_secret_list(environment, &keys));
        }
        SecretCommands::Put {
            environment,
            key,
            from_env,
        } => {
            let orchestrator = open(config, options).await?;
            let value = read_secret_value(from_env.as_deref())?;
            let version = orchestrator.secret_put(environment, &key, value).await?;
            formatter.success(&format!("Stored {key} in {environment} as v{version}."));
        }
        SecretCommands::Rotate {
            environment,
            key,
            from_env,
        } => {
            let orchestrator = open(config, options).await?;
            let value = read_secret_value(from_env.as_deref())?;
            let version = orchestrator.secret_rotate(environment, &key, value).await?;
            formatter.success(&format!("Rotated {key} in {environment} to v{version}."));
        }
        SecretCommands::Reveal {
            environment,
            key,
            reason,
        } => {
            let requested_by = std::env::var("USER")
                .or_else(|_| std::env::var("USERNAME"))
                .unwrap_or_else(|_| generate_holder_id());
            let ack = RevealAcknowledgement::new(requested_by, reason);
            let value = open(config, options)
                .await?
                .secret_reveal(environment, &key, &ack)
                .await?;
            formatter.emit(value.expose_secret());
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Generate a sealing key.
async fn cmd_keygen(config: Option<&Path>, write: bool, formatter: &OutputFormatter) -> Result<ExitCode> {
    let key = generate_key()?;
    if !write {
        formatter.emit(key.expose_secret());
        return Ok(ExitCode::SUCCESS);
    }

    let loaded = load_config(config)?;
    let path = match loaded.config.secrets.key_file.as_deref() {
        Some(file) => loaded.root.join(file),
        None => default_key_file(&loaded.config.project.name)
            .ok_or_else(|| RollwardenError::internal("Cannot determine the user configuration directory"))?,
    };
    if path.exists() {
        return Err(RollwardenError::internal(format!(
            "Key file {} already exists; refusing to overwrite it",
            path.display()
        )));
    }

    write_key_file(&path, &key).await?;
    formatter.success(&format!("Sealing key written to {}", path.display()));
    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Loads configuration and wires the orchestrator.
async fn open(config: Option<&Path>, options: OrchestratorOptions) -> Result<Orchestrator> {
    let loaded = load_config(config)?;
    for warning in &loaded.warnings {
        warn!("{warning}");
    }
    Orchestrator::open(loaded, options).await
}

/// Streams state transitions until the rollout ends; Ctrl-C cancels it.
async fn follow(handle: RolloutHandle, formatter: &OutputFormatter) -> Result<RolloutOutcome> {
    let environment = handle.environment();
    let mut states = handle.subscribe();
    let mut printed = None;
    let mut cancel_requested = false;

    loop {
        let state = *states.borrow_and_update();
        if printed != Some(state) {
            if !formatter.is_json() {
                eprintln!("{}", formatter.format_transition(environment, state));
            }
            printed = Some(state);
        }
        if state.is_terminal() {
            break;
        }

        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c(), if !cancel_requested => {
                cancel_requested = true;
                warn!("Cancellation requested; rolling back {environment}");
                handle.cancel();
            }
        }
    }

    handle.wait().await
}

/// Maps a terminal state to the process exit code.
fn exit_code(outcome: &RolloutOutcome) -> ExitCode {
    match outcome.state {
        RolloutState::Succeeded => ExitCode::SUCCESS,
        RolloutState::Settled => ExitCode::from(EXIT_ROLLED_BACK),
        _ => ExitCode::FAILURE,
    }
}

/// Asks the operator to type the environment name.
fn confirm_environment(environment: Environment, action: &str) -> Result<bool> {
    eprint!("\nYou are about to {action} {environment}. Type '{environment}' to confirm: ");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim() == environment.as_str())
}

/// Reads a secret value from an environment variable or stdin.
fn read_secret_value(from_env: Option<&str>) -> Result<SecretString> {
    let value = match from_env {
        Some(name) => std::env::var(name).map_err(|_| ConfigError::MissingEnvVar {
            name: name.to_string(),
        })?,
        None => {
            let stdin = std::io::stdin();
            if stdin.is_terminal() {
                eprint!("Value: ");
                std::io::stderr().flush()?;
            }
            let mut value = String::new();
            stdin.read_line(&mut value)?;
            value.trim_end_matches(['\r', '\n']).to_string()
        }
    };
    Ok(SecretString::from(value))
}
