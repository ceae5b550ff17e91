//! State management module for Stackform.
//!
//! This module persists the State Record: which resources exist, their
//! provider ids and attributes, evaluated outputs and run history. Access
//! is serialized through a single-writer lock.

mod local;
mod lock;
mod s3;
mod store;
mod types;

pub use local::{LocalStateStore, STATE_DIR};
pub use lock::{generate_holder_id, LockInfo, LOCK_EXPIRY_SECS, LOCK_RENEW_SECS};
pub use s3::S3StateStore;
pub use store::{with_lock_renewal, StateStore};
pub use types::{
    HistoryEntry, HistoryOperation, OutputValue, ResourceRecord, StateRecord, MAX_HISTORY,
    STATE_VERSION,
};
