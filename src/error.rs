//! Error types for the Rollwarden rollout controller.
//!
//! This module provides the error hierarchy for every stage of a rollout:
//! configuration, rendering, secrets, planning, the cluster boundary, the
//! rollout state machine and the history store.

use std::path::PathBuf;
use thiserror::Error;

use crate::config::Environment;

/// The main error type for Rollwarden.
#[derive(Debug, Error)]
pub enum RollwardenError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Manifest rendering errors.
    #[error("Render error: {0}")]
    Render(#[from] RenderError),

    /// Secret store errors.
    #[error("Secret error: {0}")]
    Secret(#[from] SecretError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Cluster boundary errors.
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// Rollout errors.
    #[error("Rollout error: {0}")]
    Rollout(#[from] RolloutError),

    /// History store errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },

    /// Unknown environment name.
    #[error("Unknown environment '{name}' (expected dev, stage or prod)")]
    UnknownEnvironment {
        /// The unrecognized name.
        name: String,
    },
}

/// Manifest rendering errors.
#[derive(Debug, Error)]
pub enum RenderError {
    /// An overlay, or a file it references, could not be resolved.
    #[error("Unresolved overlay for {environment}: {message}")]
    UnresolvedOverlay {
        /// Environment being rendered.
        environment: Environment,
        /// What could not be resolved.
        message: String,
    },

    /// A patch is malformed or targets a field path that does not resolve.
    #[error("Invalid patch on {target} at '{path}': {message}")]
    InvalidPatch {
        /// Resource the patch targets.
        target: String,
        /// Field path within the document.
        path: String,
        /// Description of the problem.
        message: String,
    },

    /// A patch targets a resource that is not in the base.
    #[error("Patch targets missing base resource {target}")]
    MissingBase {
        /// Resource the patch targets.
        target: String,
    },

    /// A Secret document carries literal values instead of references.
    #[error("Secret {resource} contains a literal value at '{path}'; use ${{secret:KEY}} references")]
    PlaintextSecret {
        /// The offending Secret.
        resource: String,
        /// Field path of the literal value.
        path: String,
    },

    /// Two documents share the same resource identity.
    #[error("Duplicate resource {resource}")]
    DuplicateResource {
        /// The duplicated identity.
        resource: String,
    },
}

/// Secret store errors.
#[derive(Debug, Error)]
pub enum SecretError {
    /// Validation failed under a blocking policy.
    #[error("Secret validation failed for {environment}: {issues} issue(s): {summary}")]
    ValidationFailed {
        /// Environment validated.
        environment: Environment,
        /// Number of issues found.
        issues: usize,
        /// One-line summary of the issues (never includes values).
        summary: String,
    },

    /// The key does not exist.
    #[error("Secret key '{key}' not found in {environment}")]
    KeyNotFound {
        /// Environment searched.
        environment: Environment,
        /// The missing key.
        key: String,
    },

    /// The pinned version is no longer retained.
    #[error("Secret key '{key}' has no retained version {version} in {environment}")]
    VersionNotFound {
        /// Environment searched.
        environment: Environment,
        /// The key.
        key: String,
        /// The missing version.
        version: u64,
    },

    /// The key name is not acceptable.
    #[error("Malformed secret key '{key}'")]
    MalformedKey {
        /// The rejected key.
        key: String,
    },

    /// A pinned reference could not be parsed.
    #[error("Malformed secret reference '{reference}'")]
    MalformedReference {
        /// The rejected reference.
        reference: String,
    },

    /// A reveal was requested without a reason.
    #[error("Revealing '{key}' requires an acknowledgement with a reason")]
    AcknowledgementRequired {
        /// The requested key.
        key: String,
    },

    /// Sealing a record failed.
    #[error("Failed to seal secret record: {message}")]
    Seal {
        /// Description of the failure.
        message: String,
    },

    /// Unsealing a record failed.
    #[error("Failed to unseal secret record: {message}")]
    Unseal {
        /// Description of the failure.
        message: String,
    },

    /// The sealing key is missing or invalid.
    #[error("Invalid secret sealing key: {message}")]
    InvalidKey {
        /// Description of the problem.
        message: String,
    },

    /// The at-rest backend failed.
    #[error("Secret backend error: {message}")]
    Backend {
        /// Description of the failure.
        message: String,
    },
}

/// Planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// The observed snapshot predates the latest recorded rollout activity.
    #[error("Snapshot for {environment} captured at {captured_at} predates record {record_id} ({recorded_at}); re-fetch and re-plan")]
    SnapshotStale {
        /// Environment planned.
        environment: Environment,
        /// When the snapshot was taken.
        captured_at: String,
        /// Record that supersedes the snapshot.
        record_id: String,
        /// When that record was last written.
        recorded_at: String,
    },

    /// Target and snapshot belong to different environments.
    #[error("Environment mismatch: target is {target}, snapshot is {observed}")]
    EnvironmentMismatch {
        /// Target environment.
        target: Environment,
        /// Snapshot environment.
        observed: Environment,
    },

    /// There is nothing to roll back to.
    #[error("No rollback target for {environment}: {reason}")]
    NoRollbackTarget {
        /// Environment.
        environment: Environment,
        /// Why no target exists.
        reason: String,
    },
}

/// Cluster boundary errors.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Network-level failure talking to the cluster.
    #[error("Network error talking to cluster: {message}")]
    Network {
        /// Description of the failure.
        message: String,
    },

    /// Write conflict (the object changed underneath us).
    #[error("Conflict applying {resource}: {message}")]
    Conflict {
        /// Resource being written.
        resource: String,
        /// Description of the conflict.
        message: String,
    },

    /// The resource does not exist.
    #[error("Resource not found: {resource}")]
    NotFound {
        /// The missing resource.
        resource: String,
    },

    /// The cluster rejected the request.
    #[error("Cluster rejected request for {resource}: {message}")]
    Rejected {
        /// Resource involved.
        resource: String,
        /// Rejection reason.
        message: String,
    },

    /// The cluster tool failed or produced unexpected output.
    #[error("Cluster command failed: {message}")]
    CommandFailed {
        /// Description of the failure.
        message: String,
    },

    /// The cluster returned data that could not be interpreted.
    #[error("Invalid response from cluster: {message}")]
    InvalidResponse {
        /// Description of the problem.
        message: String,
    },
}

/// Rollout errors.
#[derive(Debug, Error)]
pub enum RolloutError {
    /// Another rollout holds the environment.
    #[error("A rollout is already in progress for {environment} (holder: {holder})")]
    RolloutInProgress {
        /// Locked environment.
        environment: Environment,
        /// Lock holder description.
        holder: String,
    },

    /// An action failed after exhausting its retries.
    #[error("Action {action} failed after {attempts} attempt(s): {message}")]
    ApplyActionFailed {
        /// Action description.
        action: String,
        /// Attempts made.
        attempts: u32,
        /// Last error.
        message: String,
    },

    /// Workloads did not become healthy in time.
    #[error("Workload {workload} not healthy within {timeout_secs}s")]
    HealthTimeout {
        /// The workload.
        workload: String,
        /// Timeout that elapsed.
        timeout_secs: u64,
    },

    /// The rollback itself failed; operator intervention is required.
    #[error("Rollback failed for {environment} (record {record_id}): {message}")]
    RollbackFailed {
        /// Environment.
        environment: Environment,
        /// Record of the failed attempt.
        record_id: String,
        /// What went wrong.
        message: String,
    },

    /// A previous rollout was interrupted and must be recovered first.
    #[error("Record {record_id} for {environment} is still in progress; run `rollwarden recover {environment}`")]
    Unreconciled {
        /// Environment.
        environment: Environment,
        /// The in-progress record.
        record_id: String,
    },

    /// The rollout task stopped without reporting an outcome.
    #[error("Rollout task for {environment} aborted: {message}")]
    TaskAborted {
        /// Environment.
        environment: Environment,
        /// Description of the failure.
        message: String,
    },
}

/// History store errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// History is corrupted.
    #[error("History is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// Lock acquisition failed.
    #[error("Failed to acquire lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// Lock is held by another process.
    #[error("Environment is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// The record does not exist.
    #[error("Rollout record {record_id} not found")]
    RecordNotFound {
        /// The missing record id.
        record_id: String,
    },

    /// The record already reached a terminal state.
    #[error("Rollout record {record_id} is already {state}")]
    RecordFinalized {
        /// The record id.
        record_id: String,
        /// Its terminal state.
        state: String,
    },

    /// Filesystem backend error.
    #[error("Local history backend error: {message}")]
    LocalError {
        /// Description of the error.
        message: String,
    },

    /// S3 backend error.
    #[error("S3 history backend error: {message}")]
    S3Error {
        /// Description of the S3 error.
        message: String,
    },

    /// Serialization error.
    #[error("History serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// History format version mismatch.
    #[error("History version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected version.
        expected: String,
        /// Found version.
        found: String,
    },
}

/// Result type alias for Rollwarden operations.
pub type Result<T> = std::result::Result<T, RollwardenError>;

impl RollwardenError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is transient and the operation may be retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Cluster(ClusterError::Network { .. } | ClusterError::Conflict { .. })
                | Self::Plan(PlanError::SnapshotStale { .. })
                | Self::State(StateError::LockFailed { .. })
        )
    }

    /// Returns the suggested retry delay in seconds, if applicable.
    #[must_use]
    pub const fn retry_delay_secs(&self) -> Option<u64> {
        match self {
            Self::Cluster(ClusterError::Network { .. }) => Some(5),
            Self::Cluster(ClusterError::Conflict { .. }) | Self::State(StateError::LockFailed { .. }) => {
                Some(1)
            }
            Self::Plan(PlanError::SnapshotStale { .. }) => Some(0),
            _ => None,
        }
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }
}

impl RenderError {
    /// Creates an invalid patch error.
    #[must_use]
    pub fn invalid_patch(
        target: impl Into<String>,
        path: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::InvalidPatch {
            target: target.into(),
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates an unresolved overlay error.
    #[must_use]
    pub fn unresolved(environment: Environment, message: impl Into<String>) -> Self {
        Self::UnresolvedOverlay {
            environment,
            message: message.into(),
        }
    }
}

impl SecretError {
    /// Creates a backend error with the given message.
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }
}

impl ClusterError {
    /// Creates a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Returns true for transient failures worth retrying.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Network { .. } | Self::Conflict { .. })
    }
}

impl StateError {
    /// Creates an S3 error with the given message.
    #[must_use]
    pub fn s3(message: impl Into<String>) -> Self {
        Self::S3Error {
            message: message.into(),
        }
    }

    /// Creates a local backend error with the given message.
    #[must_use]
    pub fn local(message: impl Into<String>) -> Self {
        Self::LocalError {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_cluster_errors_are_retryable() {
        let err = RollwardenError::Cluster(ClusterError::network("connection refused"));
        assert!(err.is_retryable());
        assert_eq!(err.retry_delay_secs(), Some(5));

        let err = RollwardenError::Cluster(ClusterError::NotFound {
            resource: String::from("Deployment/dev/web"),
        });
        assert!(!err.is_retryable());
        assert_eq!(err.retry_delay_secs(), None);
    }

    #[test]
    fn test_stale_snapshot_is_retryable() {
        let err = RollwardenError::Plan(PlanError::SnapshotStale {
            environment: Environment::Dev,
            captured_at: String::from("a"),
            record_id: String::from("r"),
            recorded_at: String::from("b"),
        });
        assert!(err.is_retryable());
    }

    #[test]
    fn test_render_errors_are_not_retryable() {
        let err = RollwardenError::Render(RenderError::MissingBase {
            target: String::from("Deployment/web"),
        });
        assert!(!err.is_retryable());
    }
}
