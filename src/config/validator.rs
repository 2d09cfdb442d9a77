//! Configuration validation.
//!
//! Collects every problem in a configuration before anything touches the
//! cluster; warnings are reported but do not block.

use crate::error::{ConfigError, Result, RollwardenError};
use std::collections::HashMap;
use tracing::debug;

use super::spec::{Environment, RolloutConfig, RollwardenConfig, StateBackend};

/// Validator for rollout configurations.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a configuration.
    ///
    /// # Errors
    ///
    /// Returns the first validation error if any were found.
    pub fn validate(&self, config: &RollwardenConfig) -> Result<ValidationResult> {
        let mut result = ValidationResult::default();

        Self::validate_project(config, &mut result);
        Self::validate_environments(config, &mut result);
        Self::validate_manifests(config, &mut result);
        Self::validate_rollout(&config.rollout, &mut result);
        Self::validate_state(config, &mut result);

        if result.errors.is_empty() {
            debug!("Configuration validation passed");
            Ok(result)
        } else {
            let first_error = &result.errors[0];
            Err(RollwardenError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }))
        }
    }

    fn validate_project(config: &RollwardenConfig, result: &mut ValidationResult) {
        let name = &config.project.name;
        if name.is_empty() {
            result.error("project.name", "Project name cannot be empty");
        } else if !is_valid_name(name) {
            result.error(
                "project.name",
                format!("Project name '{name}' is invalid. Must be lowercase alphanumeric with hyphens."),
            );
        }
    }

    fn validate_environments(config: &RollwardenConfig, result: &mut ValidationResult) {
        let envs = &config.environments;
        let mut seen: HashMap<(&str, Option<&str>), Environment> = HashMap::new();

        for (environment, env) in [
            (Environment::Dev, &envs.dev),
            (Environment::Stage, &envs.stage),
            (Environment::Prod, &envs.prod),
        ] {
            let field = format!("environments.{environment}.namespace");
            if !is_valid_name(&env.namespace) {
                result.error(
                    &field,
                    format!("Namespace '{}' is not a valid DNS label", env.namespace),
                );
            }

            if let Some(other) = seen.insert((env.namespace.as_str(), env.context.as_deref()), environment) {
                result.error(
                    &field,
                    format!(
                        "Namespace '{}' is shared by {other} and {environment}; environments must be isolated",
                        env.namespace
                    ),
                );
            }

            if let Some(cpu) = &env.resources.cpu
                && cpu.trim().is_empty()
            {
                result.error(format!("environments.{environment}.resources.cpu"), "CPU limit cannot be empty");
            }
            if let Some(memory) = &env.resources.memory
                && memory.trim().is_empty()
            {
                result.error(
                    format!("environments.{environment}.resources.memory"),
                    "Memory limit cannot be empty",
                );
            }
        }

        if !envs.prod.requires_confirmation {
            result
                .warnings
                .push(String::from("prod does not require confirmation; apply will proceed unattended"));
        }
    }

    fn validate_manifests(config: &RollwardenConfig, result: &mut ValidationResult) {
        if config.manifests.base.trim().is_empty() {
            result.error("manifests.base", "Base directory cannot be empty");
        }

        for environment in Environment::ALL {
            match config.manifests.overlays.get(&environment) {
                None => result
                    .warnings
                    .push(format!("No overlay declared for {environment}; rendering it will fail")),
                Some(dirs) if dirs.iter().any(|d| d.trim().is_empty()) => result.error(
                    format!("manifests.overlays.{environment}"),
                    "Overlay directory cannot be empty",
                ),
                Some(_) => {}
            }
        }
    }

    fn validate_rollout(rollout: &RolloutConfig, result: &mut ValidationResult) {
        if rollout.poll_interval_secs == 0 {
            result.error("rollout.poll_interval_secs", "Poll interval must be at least 1 second");
        }
        if rollout.stability_polls == 0 {
            result.error("rollout.stability_polls", "At least one stable poll is required");
        }
        if rollout.workload_timeout_secs < rollout.poll_interval_secs * u64::from(rollout.stability_polls) {
            result.error(
                "rollout.workload_timeout_secs",
                "Workload timeout is shorter than the stability window",
            );
        }
        if rollout.rollback_timeout_secs == 0 {
            result.error("rollout.rollback_timeout_secs", "Rollback timeout must be positive");
        }
        if rollout.apply_retry.attempts == 0 {
            result.error("rollout.apply_retry.attempts", "At least one attempt is required");
        } else if rollout.apply_retry.attempts > 10 {
            result
                .warnings
                .push(format!("{} apply attempts per action is unusually high", rollout.apply_retry.attempts));
        }
        if rollout.apply_retry.factor == 0 {
            result.error("rollout.apply_retry.factor", "Backoff factor must be at least 1");
        }
    }

    fn validate_state(config: &RollwardenConfig, result: &mut ValidationResult) {
        if config.state.backend == StateBackend::S3
            && config.state.bucket.as_ref().is_none_or(String::is_empty)
        {
            result.error("state.bucket", "S3 bucket name is required when using S3 backend");
        }
    }
}

impl ValidationResult {
    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Returns true if there are no errors.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Checks that a name is a lowercase DNS label.
fn is_valid_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 63 {
        return false;
    }

    let mut chars = name.chars();

    // First character must be a letter
    if let Some(first) = chars.next()
        && !first.is_ascii_lowercase()
    {
        return false;
    }

    if chars.any(|c| !c.is_ascii_lowercase() && !c.is_ascii_digit() && c != '-') {
        return false;
    }

    !name.ends_with('-') && !name.contains("--")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;

    fn config(yaml: &str) -> RollwardenConfig {
        ConfigParser::new().parse_yaml(yaml, None).unwrap()
    }

    const VALID: &str = r"
project:
  name: shop
environments:
  dev: { namespace: shop-dev }
  stage: { namespace: shop-stage }
  prod: { namespace: shop-prod, requires_confirmation: true }
manifests:
  base: k8s/base
  overlays:
    dev: [k8s/overlays/dev]
    stage: [k8s/overlays/stage]
    prod: [k8s/overlays/prod]
";

    #[test]
    fn test_valid_name() {
        assert!(is_valid_name("shop-dev"));
        assert!(is_valid_name("a1"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("Shop"));
        assert!(!is_valid_name("1shop"));
        assert!(!is_valid_name("shop_dev"));
        assert!(!is_valid_name("shop-"));
        assert!(!is_valid_name("shop--dev"));
    }

    #[test]
    fn test_valid_config_passes() {
        let result = ConfigValidator::new().validate(&config(VALID)).unwrap();
        assert!(result.is_valid());
        assert_eq!(result.warning_count(), 0);
    }

    #[test]
    fn test_shared_namespace_is_rejected() {
        let yaml = VALID.replace("shop-stage", "shop-dev");
        let err = ConfigValidator::new().validate(&config(&yaml)).unwrap_err();
        assert!(err.to_string().contains("shared"));
    }

    #[test]
    fn test_unconfirmed_prod_warns() {
        let yaml = VALID.replace(", requires_confirmation: true", "");
        let result = ConfigValidator::new().validate(&config(&yaml)).unwrap();
        assert_eq!(result.warning_count(), 1);
    }

    #[test]
    fn test_s3_requires_bucket() {
        let yaml = format!("{VALID}state:\n  backend: s3\n");
        assert!(ConfigValidator::new().validate(&config(&yaml)).is_err());
    }

    #[test]
    fn test_timeout_shorter_than_window_is_rejected() {
        let yaml = format!("{VALID}rollout:\n  poll_interval_secs: 60\n  workload_timeout_secs: 120\n");
        let err = ConfigValidator::new().validate(&config(&yaml)).unwrap_err();
        assert!(err.to_string().contains("stability window"));
    }
}
