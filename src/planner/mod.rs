//! Planner.
//!
//! Compares a rendered manifest with an observed cluster snapshot and
//! produces an ordered, immutable [`Plan`].

mod diff;
mod plan;

pub use diff::{DiffDetail, DiffEngine, DiffResult, DiffType, ResourceDiff, field_changes, normalize, plan};
pub use plan::{Action, ActionType, Plan, PlanCounts, inverse_of, order_actions};
