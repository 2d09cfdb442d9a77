// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![warn(warnings)]                    // All warnings are reported
#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![warn(dead_code)]                   // Unused code is reported
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![warn(unused_imports)]              // Unused imports are reported
#![warn(unused_variables)]            // Unused variables are reported
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Rollwarden
//!
//! A multi-environment rollout controller for Kubernetes: renders per
//! environment manifests, plans the changes against the live cluster, applies
//! them behind a health gate and rolls back automatically when workloads do
//! not become healthy.
//!
//! ## Overview
//!
//! Rollwarden manages a fixed `dev` / `stage` / `prod` promotion path:
//!
//! - Render an environment from a shared base plus ordered overlays
//! - Pin secret references to immutable versions before a rollout
//! - Compute an ordered create/update/delete plan against a fresh snapshot
//! - Apply with bounded retries, then wait for workloads to stay ready
//! - Roll back to the last successful manifest on failure or cancellation
//! - Keep an append-only history of every attempt per environment
//!
//! ## Architecture
//!
//! 1. **Renderer** ([`manifest`]): base + overlays → `ManifestSet`
//! 2. **Secrets** ([`secrets`]): sealed, versioned values and pinning
//! 3. **Planner** ([`planner`]): `ManifestSet` × `ClusterSnapshot` → `Plan`
//! 4. **Controller** ([`rollout`]): `Planned → Applying → Monitoring → …`
//! 5. **History** ([`state`]): records and cross-process locks
//!
//! The cluster is reached only through the traits in [`cluster`]; the
//! [`kubectl`] module implements them for real clusters and
//! [`cluster::InMemoryCluster`] for tests and `--simulate`.
//! [`orchestrator`] wires everything together for the [`cli`].
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: shop
//!
//! environments:
//!   dev:
//!     namespace: shop-dev
//!   stage:
//!     namespace: shop-stage
//!   prod:
//!     namespace: shop-prod
//!     requires_confirmation: true
//!
//! manifests:
//!   base: k8s/base
//!   overlays:
//!     dev: [k8s/overlays/dev]
//!     stage: [k8s/overlays/stage]
//!     prod: [k8s/overlays/prod]
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod cluster;
pub mod config;
pub mod error;
pub mod kubectl;
pub mod manifest;
pub mod orchestrator;
pub mod planner;
pub mod rollout;
pub mod secrets;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigParser, ConfigValidator, Environment, Environments, RollwardenConfig};
pub use error::{Result, RollwardenError};
pub use manifest::{ManifestRenderer, ManifestSet, ResourceId};
pub use orchestrator::{Orchestrator, OrchestratorOptions, PlannedRollout};
pub use planner::{Action, ActionType, DiffEngine, Plan};
pub use rollout::{RolloutController, RolloutHandle, RolloutOutcome, RolloutState};
pub use secrets::SecretStore;
pub use state::{HistoryStore, LocalHistoryStore, MemoryHistoryStore, RolloutRecord, S3HistoryStore};
