//! Secret Store Adapter.
//!
//! Versioned secret material per environment, sealed with AES-256-GCM before
//! it reaches storage, with pinning of manifest references to immutable
//! versions.

mod backend;
mod encryption;
mod pinning;
mod store;
mod types;

pub use backend::{LocalSecretBackend, MemorySecretBackend, SecretBackend};
pub use encryption::{EncryptedValue, KEY_LEN, SealingKey, generate_key};
pub use pinning::{inject, is_redacted, mask, materialize, referenced_keys};
pub use store::SecretStore;
pub use types::{
    INIT_PLACEHOLDER, PinnedRef, REDACTED, RETAINED_VERSIONS, RevealAcknowledgement, SealedPayload,
    SecretEntry, SecretIssue, SecretRecord, SecretSummary, SecretValidation, SecretVersion,
    ValidationPolicy, is_placeholder, is_valid_key, parse_reference,
};
