//! Configuration specification types for the rollout controller.
//!
//! This module defines the structs that map to `rollwarden.yaml` and the
//! immutable [`Environments`] set built from them at process start.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// A deployment environment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Development.
    Dev,
    /// Staging.
    Stage,
    /// Production.
    Prod,
}

impl Environment {
    /// All environments, in promotion order.
    pub const ALL: [Self; 3] = [Self::Dev, Self::Stage, Self::Prod];

    /// Returns the lowercase name of the environment.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Dev => "dev",
            Self::Stage => "stage",
            Self::Prod => "prod",
        }
    }

    /// Returns true for the production environment.
    #[must_use]
    pub const fn is_production(self) -> bool {
        matches!(self, Self::Prod)
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dev" | "development" => Ok(Self::Dev),
            "stage" | "staging" => Ok(Self::Stage),
            "prod" | "production" => Ok(Self::Prod),
            _ => Err(ConfigError::UnknownEnvironment {
                name: s.to_string(),
            }),
        }
    }
}

/// The root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RollwardenConfig {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// Per-environment settings; all three environments must be declared.
    pub environments: EnvironmentsConfig,
    /// Manifest base and overlay layout.
    pub manifests: ManifestsConfig,
    /// Rollout timing and retry settings.
    #[serde(default)]
    pub rollout: RolloutConfig,
    /// History backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Secret store configuration.
    #[serde(default)]
    pub secrets: SecretsConfig,
    /// Cluster access configuration.
    #[serde(default)]
    pub cluster: ClusterConfig,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Project name, used in lock and state paths.
    pub name: String,
}

/// Declarations for the three environments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvironmentsConfig {
    /// Development environment.
    pub dev: EnvironmentConfig,
    /// Staging environment.
    pub stage: EnvironmentConfig,
    /// Production environment.
    pub prod: EnvironmentConfig,
}

/// Settings for one environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvironmentConfig {
    /// Target namespace.
    pub namespace: String,
    /// Whether `apply` and `rollback` must be confirmed by the operator.
    #[serde(default)]
    pub requires_confirmation: bool,
    /// Default limits for workload containers that declare none.
    #[serde(default)]
    pub resources: ResourceProfile,
    /// Kube context to target (defaults to the current context).
    #[serde(default)]
    pub context: Option<String>,
}

/// Default resource limits applied to workload containers.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceProfile {
    /// CPU limit (e.g. "500m").
    #[serde(default)]
    pub cpu: Option<String>,
    /// Memory limit (e.g. "512Mi").
    #[serde(default)]
    pub memory: Option<String>,
}

impl ResourceProfile {
    /// Returns true if the profile sets no limits.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.cpu.is_none() && self.memory.is_none()
    }
}

/// Manifest layout configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestsConfig {
    /// Directory holding the shared base documents.
    pub base: String,
    /// Ordered overlay directories per environment.
    #[serde(default)]
    pub overlays: BTreeMap<Environment, Vec<String>>,
}

/// Rollout timing and retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RolloutConfig {
    /// Health poll interval in seconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Consecutive healthy polls required.
    #[serde(default = "default_stability_polls")]
    pub stability_polls: u32,
    /// Per-workload health timeout in seconds.
    #[serde(default = "default_timeout")]
    pub workload_timeout_secs: u64,
    /// Health timeout for rollback in seconds.
    #[serde(default = "default_timeout")]
    pub rollback_timeout_secs: u64,
    /// Retry policy for individual actions.
    #[serde(default)]
    pub apply_retry: RetryConfig,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            stability_polls: default_stability_polls(),
            workload_timeout_secs: default_timeout(),
            rollback_timeout_secs: default_timeout(),
            apply_retry: RetryConfig::default(),
        }
    }
}

/// Bounded exponential backoff for apply actions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    /// Delay before the second attempt, in milliseconds.
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    /// Multiplier applied to the delay after each attempt.
    #[serde(default = "default_factor")]
    pub factor: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            base_delay_ms: default_base_delay(),
            factor: default_factor(),
        }
    }
}

/// History backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Backend type (local or s3).
    #[serde(default)]
    pub backend: StateBackend,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    #[serde(default)]
    pub region: Option<String>,
    /// Local history directory (for local backend).
    #[serde(default)]
    pub path: Option<String>,
}

/// History backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based storage.
    #[default]
    Local,
    /// AWS S3-based storage.
    S3,
}

/// Secret store configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecretsConfig {
    /// Directory for sealed secret records.
    #[serde(default = "default_secrets_path")]
    pub path: String,
    /// Environment variable holding the base64 sealing key.
    #[serde(default = "default_key_env")]
    pub key_env: String,
    /// Key file used when the variable is unset.
    #[serde(default)]
    pub key_file: Option<String>,
    /// Identifier stored alongside sealed records.
    #[serde(default = "default_key_id")]
    pub key_id: String,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            path: default_secrets_path(),
            key_env: default_key_env(),
            key_file: None,
            key_id: default_key_id(),
        }
    }
}

/// Cluster access configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterConfig {
    /// Path to the kubectl binary.
    #[serde(default = "default_kubectl")]
    pub kubectl: String,
    /// Kinds fetched when taking a snapshot.
    #[serde(default = "default_kinds")]
    pub kinds: Vec<String>,
    /// Timeout for a single kubectl invocation, in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            kubectl: default_kubectl(),
            kinds: default_kinds(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Resolved settings for one environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentSpec {
    /// Environment identity.
    pub environment: Environment,
    /// Target namespace.
    pub namespace: String,
    /// Promotion policy.
    pub requires_confirmation: bool,
    /// Resource-limit profile.
    pub resources: ResourceProfile,
    /// Kube context.
    pub context: Option<String>,
}

/// The immutable environment set, built once from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environments {
    specs: [EnvironmentSpec; 3],
}

impl Environments {
    /// Builds the environment set from configuration.
    #[must_use]
    pub fn from_config(config: &EnvironmentsConfig) -> Self {
        let build = |environment: Environment, cfg: &EnvironmentConfig| EnvironmentSpec {
            environment,
            namespace: cfg.namespace.clone(),
            requires_confirmation: cfg.requires_confirmation,
            resources: cfg.resources.clone(),
            context: cfg.context.clone(),
        };

        Self {
            specs: [
                build(Environment::Dev, &config.dev),
                build(Environment::Stage, &config.stage),
                build(Environment::Prod, &config.prod),
            ],
        }
    }

    /// Returns the settings for an environment.
    #[must_use]
    pub const fn get(&self, environment: Environment) -> &EnvironmentSpec {
        match environment {
            Environment::Dev => &self.specs[0],
            Environment::Stage => &self.specs[1],
            Environment::Prod => &self.specs[2],
        }
    }

    /// Iterates over all environments in promotion order.
    pub fn iter(&self) -> impl Iterator<Item = &EnvironmentSpec> {
        self.specs.iter()
    }
}

/// Timing and retry knobs consumed by the rollout controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RolloutSettings {
    /// Health poll interval.
    pub poll_interval: Duration,
    /// Consecutive healthy polls required.
    pub stability_polls: u32,
    /// Per-workload health timeout.
    pub workload_timeout: Duration,
    /// Health timeout while rolling back.
    pub rollback_timeout: Duration,
    /// Total attempts per action.
    pub retry_attempts: u32,
    /// Delay before the first retry.
    pub retry_base_delay: Duration,
    /// Backoff multiplier.
    pub retry_factor: u32,
}

impl Default for RolloutSettings {
    fn default() -> Self {
        Self::from_config(&RolloutConfig::default())
    }
}

impl RolloutSettings {
    /// Converts the configuration section into durations.
    #[must_use]
    pub const fn from_config(config: &RolloutConfig) -> Self {
        Self {
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            stability_polls: config.stability_polls,
            workload_timeout: Duration::from_secs(config.workload_timeout_secs),
            rollback_timeout: Duration::from_secs(config.rollback_timeout_secs),
            retry_attempts: config.apply_retry.attempts,
            retry_base_delay: Duration::from_millis(config.apply_retry.base_delay_ms),
            retry_factor: config.apply_retry.factor,
        }
    }

    /// The failure-event window: stability polls times the poll interval.
    #[must_use]
    pub fn stability_window(&self) -> Duration {
        self.poll_interval * self.stability_polls
    }
}

// Default value functions

const fn default_poll_interval() -> u64 {
    10
}

const fn default_stability_polls() -> u32 {
    3
}

const fn default_timeout() -> u64 {
    300
}

const fn default_attempts() -> u32 {
    3
}

const fn default_base_delay() -> u64 {
    1000
}

const fn default_factor() -> u32 {
    2
}

fn default_secrets_path() -> String {
    String::from(".rollwarden/secrets")
}

fn default_key_env() -> String {
    String::from("ROLLWARDEN_SECRET_KEY")
}

fn default_key_id() -> String {
    String::from("default")
}

fn default_kubectl() -> String {
    String::from("kubectl")
}

const fn default_request_timeout() -> u64 {
    60
}

fn default_kinds() -> Vec<String> {
    [
        "namespaces",
        "configmaps",
        "secrets",
        "serviceaccounts",
        "persistentvolumeclaims",
        "deployments",
        "statefulsets",
        "daemonsets",
        "jobs",
        "cronjobs",
        "services",
        "ingresses",
        "networkpolicies",
    ]
    .iter()
    .map(|s| (*s).to_string())
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_parse_and_display() {
        assert_eq!("prod".parse::<Environment>().unwrap(), Environment::Prod);
        assert_eq!("Staging".parse::<Environment>().unwrap(), Environment::Stage);
        assert_eq!(Environment::Dev.to_string(), "dev");
        assert!("qa".parse::<Environment>().is_err());
    }

    #[test]
    fn test_environment_ordering() {
        let mut envs = vec![Environment::Prod, Environment::Dev, Environment::Stage];
        envs.sort();
        assert_eq!(envs, Environment::ALL.to_vec());
    }

    #[test]
    fn test_rollout_defaults() {
        let settings = RolloutSettings::default();
        assert_eq!(settings.poll_interval, Duration::from_secs(10));
        assert_eq!(settings.stability_polls, 3);
        assert_eq!(settings.workload_timeout, Duration::from_secs(300));
        assert_eq!(settings.retry_attempts, 3);
        assert_eq!(settings.retry_base_delay, Duration::from_secs(1));
        assert_eq!(settings.stability_window(), Duration::from_secs(30));
    }

    #[test]
    fn test_environments_lookup() {
        let env = |ns: &str, confirm: bool| EnvironmentConfig {
            namespace: ns.to_string(),
            requires_confirmation: confirm,
            resources: ResourceProfile::default(),
            context: None,
        };
        let envs = Environments::from_config(&EnvironmentsConfig {
            dev: env("app-dev", false),
            stage: env("app-stage", false),
            prod: env("app-prod", true),
        });

        assert_eq!(envs.get(Environment::Stage).namespace, "app-stage");
        assert!(envs.get(Environment::Prod).requires_confirmation);
        assert_eq!(envs.iter().count(), 3);
    }
}
