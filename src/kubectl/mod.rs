//! `kubectl`-backed cluster access.

mod client;
mod provider;

pub use client::{KubectlClient, classify};
pub use provider::{KubectlCluster, count_failure_events, observed_document, ready_replicas};
