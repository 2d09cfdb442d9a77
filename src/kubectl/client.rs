//! Process client for the `kubectl` binary.
//!
//! Every call passes the environment's context and namespace explicitly;
//! nothing relies on the operator's current kubeconfig selection.

use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, trace};

use crate::config::{ClusterConfig, EnvironmentSpec};
use crate::error::ClusterError;

/// Maximum number of attempts for read commands.
const MAX_RETRIES: u32 = 3;

/// Delay between read retries in milliseconds.
const RETRY_DELAY_MS: u64 = 1000;

/// Stderr fragments that indicate a transient connectivity problem.
const NETWORK_MARKERS: &[&str] = &[
    "connection refused",
    "unable to connect to the server",
    "i/o timeout",
    "tls handshake timeout",
    "context deadline exceeded",
    "connection reset by peer",
    "the server is currently unable to handle the request",
];

/// Stderr fragments that indicate a write conflict.
const CONFLICT_MARKERS: &[&str] = &["the object has been modified", "conflict"];

/// `kubectl` invocation wrapper.
#[derive(Debug, Clone)]
pub struct KubectlClient {
    /// Binary to execute.
    binary: String,
    /// Per-invocation timeout.
    timeout: Duration,
}

impl KubectlClient {
    /// Creates a client from the cluster configuration.
    #[must_use]
    pub fn new(config: &ClusterConfig) -> Self {
        Self {
            binary: config.kubectl.clone(),
            timeout: Duration::from_secs(config.request_timeout_secs),
        }
    }

    /// Leading arguments selecting the environment's context and namespace.
    #[must_use]
    pub fn scope_args(spec: &EnvironmentSpec) -> Vec<String> {
        let mut args = Vec::with_capacity(4);
        if let Some(context) = &spec.context {
            args.push(String::from("--context"));
            args.push(context.clone());
        }
        args.push(String::from("--namespace"));
        args.push(spec.namespace.clone());
        args
    }

    /// Runs a read-only command, retrying transient failures.
    ///
    /// # Errors
    ///
    /// Returns the last error once retries are exhausted, or the first
    /// non-transient error.
    pub async fn read(&self, spec: &EnvironmentSpec, args: &[&str]) -> Result<String, ClusterError> {
        let mut last_error = None;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                debug!("Retry attempt {attempt} of {MAX_RETRIES}");
                tokio::time::sleep(Duration::from_millis(RETRY_DELAY_MS * u64::from(attempt))).await;
            }

            match self.run(spec, args, None).await {
                Ok(output) => return Ok(output),
                Err(e) if e.is_transient() => last_error = Some(e),
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| ClusterError::network("Max retries exceeded")))
    }

    /// Runs a command once, feeding `stdin` if given.
    ///
    /// Writes are not retried here; the rollout controller owns the retry
    /// policy for actions.
    ///
    /// # Errors
    ///
    /// Returns a classified [`ClusterError`] when the process fails, times
    /// out or exits unsuccessfully.
    pub async fn run(
        &self,
        spec: &EnvironmentSpec,
        args: &[&str],
        stdin: Option<&[u8]>,
    ) -> Result<String, ClusterError> {
        let mut full_args = Self::scope_args(spec);
        full_args.extend(args.iter().map(|a| (*a).to_string()));
        trace!("Executing {} {}", self.binary, full_args.join(" "));

        let mut child = Command::new(&self.binary)
            .args(&full_args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ClusterError::CommandFailed {
                message: format!("Failed to start {}: {e}", self.binary),
            })?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input).await.map_err(|e| ClusterError::CommandFailed {
                message: format!("Failed to write to {} stdin: {e}", self.binary),
            })?;
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ClusterError::network(format!("kubectl timed out after {}s", self.timeout.as_secs())))?
            .map_err(|e| ClusterError::CommandFailed {
                message: format!("Failed to wait for {}: {e}", self.binary),
            })?;

        if output.status.success() {
            return String::from_utf8(output.stdout).map_err(|e| ClusterError::InvalidResponse {
                message: format!("Non UTF-8 output: {e}"),
            });
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(classify(args.first().copied().unwrap_or_default(), &stderr))
    }
}

/// Maps kubectl's stderr to an error kind.
#[must_use]
pub fn classify(resource: &str, stderr: &str) -> ClusterError {
    let lower = stderr.to_lowercase();
    if NETWORK_MARKERS.iter().any(|m| lower.contains(m)) {
        ClusterError::network(stderr)
    } else if CONFLICT_MARKERS.iter().any(|m| lower.contains(m)) {
        ClusterError::Conflict {
            resource: resource.to_string(),
            message: stderr.to_string(),
        }
    } else if lower.contains("(notfound)") || lower.contains("not found") {
        ClusterError::NotFound {
            resource: resource.to_string(),
        }
    } else if lower.contains("forbidden") || lower.contains("invalid") || lower.contains("denied") {
        ClusterError::Rejected {
            resource: resource.to_string(),
            message: stderr.to_string(),
        }
    } else {
        ClusterError::CommandFailed {
            message: stderr.to_string(),
        }
    }
}
