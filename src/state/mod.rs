//! Deployment History Store.
//!
//! Append-only record of rollout attempts per environment, plus the
//! cross-process environment locks that keep rollouts exclusive.

mod local;
mod lock;
mod memory;
mod s3;
mod store;
mod types;

pub use local::{LocalHistoryStore, STATE_DIR, write_atomic};
pub use lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
pub use memory::MemoryHistoryStore;
pub use s3::S3HistoryStore;
pub use store::HistoryStore;
pub use types::{HISTORY_VERSION, HistoryLog, RecordKind, ResultState, RolloutRecord};
