//! Cluster boundary.
//!
//! The controller talks to a cluster only through [`ClusterProvider`] and
//! [`HealthSignal`]. [`InMemoryCluster`] implements both for simulations;
//! the `kubectl` module implements them for real clusters.

mod memory;
mod provider;

pub use memory::{ClusterOperation, InMemoryCluster, InjectedFailure};
pub use provider::{ClusterProvider, ClusterSnapshot, HealthSignal};
