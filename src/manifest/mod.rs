//! Manifest Renderer.
//!
//! Resolves an environment's overlay (shared base plus ordered patches) into
//! a [`ManifestSet`] of structured documents.

mod loader;
mod patch;
mod renderer;
mod types;

pub use loader::{load_overlay_inputs, parse_documents};
pub use patch::{MergeKeys, Overlay, Patch, PatchTarget, SetOperation, set_path, strategic_merge};
pub use renderer::{ManifestRenderer, OverlayInputs, OverlayLayer, SourceDocument, render};
pub use types::{
    ENVIRONMENT_LABEL, KindPriority, LAST_APPLIED_ANNOTATION, MANAGED_BY_LABEL, MANAGED_BY_VALUE,
    MIN_READY_ANNOTATION, ManifestSet, ResourceId, SECRET_REFS_ANNOTATION, is_cluster_scoped,
    is_managed_by, is_monitored_workload, pod_spec_pointer,
};
