//! Configuration module for the rollout controller.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `rollwarden.yaml`
//! - Environment overrides and `.env` loading
//! - Validation of configuration values

mod parser;
mod spec;
mod validator;

pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, find_config_file};
pub use spec::{
    ClusterConfig, Environment, EnvironmentConfig, EnvironmentSpec, Environments,
    EnvironmentsConfig, ManifestsConfig, ProjectConfig, ResourceProfile, RetryConfig,
    RolloutConfig, RolloutSettings, RollwardenConfig, SecretsConfig, StateBackend, StateConfig,
};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
