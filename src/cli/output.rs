//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use serde_json::json;
use std::fmt::Write as _;
use std::io::Write as _;
use tabled::{Table, Tabled};

use crate::config::Environment;
use crate::manifest::ManifestSet;
use crate::orchestrator::{EnvironmentStatus, LoadedConfig, PlannedRollout, RecordSummary};
use crate::planner::{ActionType, DiffType, field_changes};
use crate::rollout::{RolloutOutcome, RolloutState};
use crate::secrets::{SecretSummary, SecretValidation, ValidationPolicy};
use crate::state::ResultState;

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan action row for table display.
#[derive(Tabled)]
struct PlanActionRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Namespace")]
    namespace: String,
    #[tabled(rename = "Name")]
    name: String,
}

/// History row for table display.
#[derive(Tabled)]
struct HistoryRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Result")]
    result: String,
    #[tabled(rename = "Applied")]
    applied: String,
    #[tabled(rename = "Actions")]
    actions: usize,
    #[tabled(rename = "Digest")]
    digest: String,
    #[tabled(rename = "Error")]
    error: String,
}

/// Environment status row for table display.
#[derive(Tabled)]
struct StatusRow {
    #[tabled(rename = "Env")]
    environment: String,
    #[tabled(rename = "Namespace")]
    namespace: String,
    #[tabled(rename = "Resources")]
    resources: usize,
    #[tabled(rename = "Head")]
    head: String,
    #[tabled(rename = "Result")]
    result: String,
    #[tabled(rename = "Lock")]
    lock: String,
    #[tabled(rename = "Drift")]
    drift: String,
}

/// Secret key row for table display.
#[derive(Tabled)]
struct SecretRow {
    #[tabled(rename = "Key")]
    key: String,
    #[tabled(rename = "Version")]
    version: u64,
    #[tabled(rename = "Rotated")]
    rotated: String,
    #[tabled(rename = "Retained")]
    retained: usize,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Returns true for JSON output.
    #[must_use]
    pub const fn is_json(&self) -> bool {
        matches!(self.format, OutputFormat::Json)
    }

    /// Formats a rendered manifest: YAML stream or JSON array.
    #[must_use]
    pub fn format_manifest(&self, manifest: &ManifestSet) -> String {
        match self.format {
            OutputFormat::Json => {
                let documents: Vec<_> = manifest.iter().map(|(_, doc)| doc).collect();
                serde_json::to_string_pretty(&documents).unwrap_or_default()
            }
            OutputFormat::Text => manifest.to_yaml().unwrap_or_default(),
        }
    }

    /// Formats a plan for display.
    #[must_use]
    pub fn format_plan(&self, planned: &PlannedRollout, detailed: bool) -> String {
        let plan = planned.plan.redacted();
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&json!({
                "plan": plan,
                "counts": plan.counts(),
                "secret_issues": planned.validation.issues,
            }))
            .unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = String::new();
                let _ = write!(
                    output,
                    "\n📋 Plan for {}\n   Manifest digest: {}\n\n",
                    plan.environment.to_string().bold(),
                    planned.manifest.short_digest()
                );

                if plan.is_empty() {
                    let _ = writeln!(
                        output,
                        "{} No changes required - {} matches the manifest.",
                        "✓".green(),
                        plan.environment
                    );
                } else {
                    let rows: Vec<PlanActionRow> = plan
                        .actions
                        .iter()
                        .enumerate()
                        .map(|(i, a)| PlanActionRow {
                            index: i + 1,
                            action: Self::format_action_type(a.action_type),
                            kind: a.id.kind.clone(),
                            namespace: a.id.namespace.clone(),
                            name: a.id.name.clone(),
                        })
                        .collect();
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');

                    if detailed {
                        Self::write_details(&mut output, &plan.actions);
                    }

                    let counts = plan.counts();
                    let _ = writeln!(
                        output,
                        "\nPlan: {} to create, {} to update, {} to delete",
                        counts.creates.to_string().green(),
                        counts.updates.to_string().yellow(),
                        counts.deletes.to_string().red()
                    );
                }

                Self::write_secret_issues(&mut output, &planned.validation);
                output
            }
        }
    }

    fn write_details(output: &mut String, actions: &[crate::planner::Action]) {
        for action in actions.iter().filter(|a| a.action_type == ActionType::Update) {
            let (Some(before), Some(after)) = (&action.before, &action.after) else {
                continue;
            };
            let _ = writeln!(output, "\n  ~ {}", action.id);
            for change in field_changes(before, after) {
                let _ = writeln!(
                    output,
                    "      {}: {} -> {}",
                    change.field,
                    Self::truncate(change.old_value.as_deref().unwrap_or("<none>"), 40).red(),
                    Self::truncate(change.new_value.as_deref().unwrap_or("<none>"), 40).green()
                );
            }
        }
    }

    fn write_secret_issues(output: &mut String, validation: &SecretValidation) {
        if validation.is_ok() {
            return;
        }
        let marker = match validation.policy {
            ValidationPolicy::Fatal => "✗".red(),
            ValidationPolicy::Warn => "⚠".yellow(),
        };
        let _ = write!(output, "\n{marker} Secret issues in {}:\n", validation.environment);
        for issue in &validation.issues {
            let _ = writeln!(output, "   - {issue}");
        }
    }

    /// Formats a progress line for a state transition.
    #[must_use]
    pub fn format_transition(&self, environment: Environment, state: RolloutState) -> String {
        let label = match state {
            RolloutState::Planned => state.to_string().dimmed(),
            RolloutState::Applying | RolloutState::Monitoring => state.to_string().cyan(),
            RolloutState::Succeeded => state.to_string().green(),
            RolloutState::RollingBack | RolloutState::Settled => state.to_string().yellow(),
            RolloutState::Failed => state.to_string().red(),
        };
        format!("   {environment}: {label}")
    }

    /// Formats the outcome of a rollout.
    #[must_use]
    pub fn format_outcome(&self, outcome: &RolloutOutcome) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(outcome).unwrap_or_default(),
            OutputFormat::Text => {
                let headline = match outcome.state {
                    RolloutState::Succeeded => format!("{} Rollout of {} succeeded", "✓".green(), outcome.environment),
                    RolloutState::Settled => {
                        format!("{} Rollout of {} was rolled back", "⚠".yellow(), outcome.environment)
                    }
                    _ => format!("{} Rollout of {} failed", "✗".red(), outcome.environment),
                };

                let mut output = format!("\n{headline}\n\n");
                let _ = writeln!(output, "   Record: {}", outcome.record_id);
                let _ = writeln!(output, "   State: {}", outcome.state);
                let _ = writeln!(output, "   Actions applied: {}", outcome.applied);
                if let Some(error) = &outcome.error {
                    let _ = writeln!(output, "   Reason: {error}");
                }
                output
            }
        }
    }

    /// Formats the result of `recover`.
    #[must_use]
    pub fn format_recovery(&self, environment: Environment, outcome: Option<&RolloutOutcome>) -> String {
        match outcome {
            Some(outcome) => self.format_outcome(outcome),
            None => match self.format {
                OutputFormat::Json => serde_json::to_string_pretty(&json!({
                    "environment": environment,
                    "recovered": false,
                }))
                .unwrap_or_default(),
                OutputFormat::Text => format!("{} Nothing to recover in {environment}.\n", "✓".green()),
            },
        }
    }

    /// Formats environment status.
    #[must_use]
    pub fn format_status(&self, statuses: &[EnvironmentStatus]) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(statuses).unwrap_or_default(),
            OutputFormat::Text => {
                let rows: Vec<StatusRow> = statuses
                    .iter()
                    .map(|s| StatusRow {
                        environment: s.environment.to_string(),
                        namespace: s.namespace.clone(),
                        resources: s.managed_resources,
                        head: s.head.as_ref().map_or_else(|| String::from("-"), |h| Self::short(&h.id)),
                        result: s
                            .head
                            .as_ref()
                            .map_or_else(|| String::from("-"), |h| Self::format_result(h.result_state)),
                        lock: s.lock.as_ref().map_or_else(
                            || String::from("-"),
                            |l| format!("{} ({}s left)", l.holder, l.remaining_secs()),
                        ),
                        drift: match &s.drift {
                            None => String::from("-"),
                            Some(d) if d.has_changes() => format!("{} change(s)", d.total_changes()).yellow().to_string(),
                            Some(_) => "none".green().to_string(),
                        },
                    })
                    .collect();

                let mut output = format!("\n📦 Environments\n\n{}\n", Table::new(rows));

                for status in statuses {
                    let Some(drift) = status.drift.as_ref().filter(|d| d.has_changes()) else {
                        continue;
                    };
                    let _ = write!(output, "\n{} Drift in {}:\n", "⚠".yellow(), status.environment);
                    for diff in drift.actionable_diffs() {
                        let marker = match diff.diff_type {
                            DiffType::Create => "missing".red(),
                            DiffType::Delete => "extra".yellow(),
                            _ => "changed".yellow(),
                        };
                        let _ = writeln!(output, "   - {} ({marker})", diff);
                    }
                }
                output
            }
        }
    }

    /// Formats rollout history.
    #[must_use]
    pub fn format_history(&self, environment: Environment, records: &[RecordSummary]) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(records).unwrap_or_default(),
            OutputFormat::Text => {
                if records.is_empty() {
                    return format!("No rollouts recorded for {environment}.\n");
                }
                let rows: Vec<HistoryRow> = records
                    .iter()
                    .map(|r| HistoryRow {
                        id: Self::short(&r.id),
                        kind: r.kind.to_string(),
                        result: Self::format_result(r.result_state),
                        applied: r.applied_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                        actions: r.actions,
                        digest: Self::short(&r.manifest_digest),
                        error: Self::truncate(r.error.as_deref().unwrap_or(""), 50),
                    })
                    .collect();
                format!("\n🕘 History of {environment}\n\n{}\n", Table::new(rows))
            }
        }
    }

    /// Formats a secret validation result.
    #[must_use]
    pub fn format_secret_validation(&self, validation: &SecretValidation) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(validation).unwrap_or_default(),
            OutputFormat::Text => {
                if validation.is_ok() {
                    return format!("{} Secrets for {} are valid.\n", "✓".green(), validation.environment);
                }
                let mut output = String::new();
                Self::write_secret_issues(&mut output, validation);
                output
            }
        }
    }

    /// Formats secret keys and versions.
    #[must_use]
    pub fn format_secret_list(&self, environment: Environment, keys: &[SecretSummary]) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(keys).unwrap_or_default(),
            OutputFormat::Text => {
                if keys.is_empty() {
                    return format!("No secrets stored for {environment}.\n");
                }
                let rows: Vec<SecretRow> = keys
                    .iter()
                    .map(|k| SecretRow {
                        key: k.key.clone(),
                        version: k.version,
                        rotated: k.last_rotated_at.format("%Y-%m-%d %H:%M").to_string(),
                        retained: k.retained,
                    })
                    .collect();
                format!("\n🔐 Secrets in {environment}\n\n{}\n", Table::new(rows))
            }
        }
    }

    /// Formats a configuration summary.
    #[must_use]
    pub fn format_config(&self, loaded: &LoadedConfig, show_warnings: bool) -> String {
        let config = &loaded.config;
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&json!({
                "valid": true,
                "path": loaded.path,
                "project": config.project.name,
                "warnings": loaded.warnings,
            }))
            .unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = format!("{} Configuration is valid!\n", "✓".green());
                if show_warnings && !loaded.warnings.is_empty() {
                    output.push_str("\nWarnings:\n");
                    for warning in &loaded.warnings {
                        let _ = writeln!(output, "  - {warning}");
                    }
                }

                output.push_str("\nConfiguration summary:\n");
                let _ = writeln!(output, "  Project: {}", config.project.name);
                for (env, cfg) in [
                    (Environment::Dev, &config.environments.dev),
                    (Environment::Stage, &config.environments.stage),
                    (Environment::Prod, &config.environments.prod),
                ] {
                    let confirm = if cfg.requires_confirmation { " (confirmation required)" } else { "" };
                    let _ = writeln!(output, "  {env}: namespace {}{confirm}", cfg.namespace);
                }
                let _ = writeln!(output, "  History backend: {:?}", config.state.backend);
                output
            }
        }
    }

    /// Writes a result to stdout.
    pub fn emit(&self, text: &str) {
        let mut stdout = std::io::stdout().lock();
        let _ = stdout.write_all(text.as_bytes());
        if !text.ends_with('\n') {
            let _ = stdout.write_all(b"\n");
        }
    }

    /// Prints a success message.
    pub fn success(&self, message: &str) {
        self.notice("success", &format!("{} {message}", "✓".green()), message);
    }

    /// Prints an error message.
    pub fn error(&self, message: &str) {
        self.notice("error", &format!("{} {message}", "✗".red()), message);
    }

    /// Prints a warning message.
    pub fn warning(&self, message: &str) {
        self.notice("warning", &format!("{} {message}", "⚠".yellow()), message);
    }

    fn notice(&self, status: &str, text: &str, message: &str) {
        let line = match self.format {
            OutputFormat::Json => json!({ "status": status, "message": message }).to_string(),
            OutputFormat::Text => text.to_string(),
        };
        let _ = writeln!(std::io::stderr().lock(), "{line}");
    }

    /// Formats an action type with color.
    fn format_action_type(action_type: ActionType) -> String {
        match action_type {
            ActionType::Create => "+create".green().to_string(),
            ActionType::Update => "~update".yellow().to_string(),
            ActionType::Delete => "-delete".red().to_string(),
        }
    }

    /// Formats a record result with color.
    fn format_result(result: ResultState) -> String {
        match result {
            ResultState::Succeeded => result.to_string().green().to_string(),
            ResultState::InProgress => result.to_string().cyan().to_string(),
            ResultState::RolledBack => result.to_string().yellow().to_string(),
            ResultState::Failed => result.to_string().red().to_string(),
        }
    }

    fn short(id: &str) -> String {
        id.chars().take(8).collect()
    }

    /// Truncates a string to a maximum length.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{head}...")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_counts_characters() {
        assert_eq!(OutputFormatter::truncate("short", 10), "short");
        assert_eq!(OutputFormatter::truncate("ééééééééééééé", 8), "ééééé...");
    }

    #[test]
    fn test_outcome_json() {
        let formatter = OutputFormatter::new(OutputFormat::Json);
        let outcome = RolloutOutcome {
            environment: Environment::Stage,
            record_id: String::from("rec-1"),
            state: RolloutState::Settled,
            applied: 3,
            error: Some(String::from("Workload Deployment/shop-stage/web not healthy within 300s")),
        };
        let value: serde_json::Value = serde_json::from_str(&formatter.format_outcome(&outcome)).unwrap();
        assert_eq!(value["state"], "settled");
        assert_eq!(value["environment"], "stage");
        assert_eq!(value["applied"], 3);
    }

    #[test]
    fn test_empty_history_text() {
        let formatter = OutputFormatter::new(OutputFormat::Text);
        let text = formatter.format_history(Environment::Dev, &[]);
        assert!(text.contains("No rollouts recorded for dev"));
    }
}
