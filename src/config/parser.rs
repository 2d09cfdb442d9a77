//! Configuration parser for loading configuration files.
//!
//! This module handles loading configuration from YAML files and environment
//! variables, with proper precedence and error handling.

use crate::error::{ConfigError, Result, RollwardenError};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::spec::{Environment, RollwardenConfig, StateBackend};

/// Configuration parser for loading rollout configuration.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving relative paths.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Resolves a path from the configuration against the base path.
    #[must_use]
    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        match &self.base_path {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }

    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<RollwardenConfig> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(RollwardenError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            RollwardenError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<RollwardenConfig> {
        debug!("Parsing YAML configuration");

        let config: RollwardenConfig = serde_yaml::from_str(content).map_err(|e| {
            let location = source.map(|p| p.display().to_string());
            RollwardenError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        debug!("Parsed configuration for project: {}", config.project.name);
        Ok(config)
    }

    /// Loads configuration with environment variable overrides.
    ///
    /// Variables use the form `ROLLWARDEN_<SECTION>_<KEY>`, and
    /// `ROLLWARDEN_<ENV>_NAMESPACE` / `ROLLWARDEN_<ENV>_CONTEXT` for
    /// per-environment settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<RollwardenConfig> {
        let mut config = self.load_file(path)?;
        Self::apply_env_overrides(&mut config);
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(config: &mut RollwardenConfig) {
        if let Ok(name) = std::env::var("ROLLWARDEN_PROJECT_NAME") {
            debug!("Overriding project.name from environment");
            config.project.name = name;
        }

        for environment in Environment::ALL {
            let upper = environment.as_str().to_ascii_uppercase();
            let target = match environment {
                Environment::Dev => &mut config.environments.dev,
                Environment::Stage => &mut config.environments.stage,
                Environment::Prod => &mut config.environments.prod,
            };

            if let Ok(namespace) = std::env::var(format!("ROLLWARDEN_{upper}_NAMESPACE")) {
                debug!("Overriding environments.{environment}.namespace from environment");
                target.namespace = namespace;
            }
            if let Ok(context) = std::env::var(format!("ROLLWARDEN_{upper}_CONTEXT")) {
                debug!("Overriding environments.{environment}.context from environment");
                target.context = Some(context);
            }
        }

        if let Ok(backend) = std::env::var("ROLLWARDEN_STATE_BACKEND") {
            match backend.to_ascii_lowercase().as_str() {
                "s3" => config.state.backend = StateBackend::S3,
                "local" => config.state.backend = StateBackend::Local,
                other => debug!("Ignoring unknown ROLLWARDEN_STATE_BACKEND '{other}'"),
            }
        }

        if let Ok(bucket) = std::env::var("ROLLWARDEN_STATE_BUCKET") {
            debug!("Overriding state.bucket from environment");
            config.state.bucket = Some(bucket);
        }

        if let Ok(prefix) = std::env::var("ROLLWARDEN_STATE_PREFIX") {
            debug!("Overriding state.prefix from environment");
            config.state.prefix = Some(prefix);
        }

        if let Ok(kubectl) = std::env::var("ROLLWARDEN_KUBECTL") {
            debug!("Overriding cluster.kubectl from environment");
            config.cluster.kubectl = kubectl;
        }
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                RollwardenError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }
}

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["rollwarden.yaml", "rollwarden.yml"];

/// Finds the configuration file in the given directory or its parents.
///
/// # Errors
///
/// Returns an error if no configuration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(RollwardenError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}
