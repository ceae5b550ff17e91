//! State locking for single-writer access.
//!
//! A lock names its holder and the operation it guards, and expires after
//! [`LOCK_EXPIRY_SECS`]. An expired lock may be taken over by the next writer.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Seconds a lock stays valid.
pub const LOCK_EXPIRY_SECS: i64 = 300;

/// Seconds between renewals while a run holds the lock.
pub const LOCK_RENEW_SECS: u64 = 60;

/// The lock record stored next to the State Record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Unique lock identifier, required to release it.
    pub lock_id: String,
    /// Host, pid and a random suffix of the writer.
    pub holder: String,
    /// What the holder is doing (`apply`, `destroy`, ...).
    #[serde(default)]
    pub operation: String,
    /// When the lock was taken.
    pub acquired_at: DateTime<Utc>,
    /// After this instant the lock may be taken over.
    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    /// Creates a lock valid from now.
    #[must_use]
    pub fn new(holder: &str, operation: &str) -> Self {
        let acquired_at = Utc::now();
        Self {
            lock_id: Uuid::new_v4().to_string(),
            holder: holder.to_string(),
            operation: operation.to_string(),
            acquired_at,
            expires_at: acquired_at + Duration::seconds(LOCK_EXPIRY_SECS),
        }
    }

    /// Extends the lock for another [`LOCK_EXPIRY_SECS`] from now.
    pub fn refresh(&mut self) {
        self.expires_at = Utc::now() + Duration::seconds(LOCK_EXPIRY_SECS);
    }

    /// Checks if the lock may be taken over.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Seconds until the lock expires, zero once it has.
    #[must_use]
    pub fn remaining_secs(&self) -> i64 {
        (self.expires_at - Utc::now()).num_seconds().max(0)
    }
}

impl fmt::Display for LockInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} held by {} for {} since {}",
            self.lock_id,
            self.holder,
            if self.operation.is_empty() { "unknown operation" } else { &self.operation },
            self.acquired_at.format("%Y-%m-%d %H:%M:%S UTC")
        )?;
        if self.is_expired() {
            write!(f, " (expired)")
        } else {
            write!(f, " (expires in {}s)", self.remaining_secs())
        }
    }
}

/// Generates a holder id for this process: `host-pid-random`.
#[must_use]
pub fn generate_holder_id() -> String {
    let host = hostname::get()
        .map_or_else(|_| String::from("unknown"), |h| h.to_string_lossy().to_string());
    let suffix = Uuid::new_v4().simple().to_string();

    format!("{host}-{}-{}", std::process::id(), &suffix[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_lock_is_valid() {
        let lock = LockInfo::new("ci-runner", "apply");
        assert_eq!(lock.operation, "apply");
        assert!(!lock.is_expired());
        assert!(lock.remaining_secs() > LOCK_EXPIRY_SECS - 5);
        assert!(lock.to_string().contains("held by ci-runner for apply"));
    }

    #[test]
    fn test_expired_lock() {
        let mut lock = LockInfo::new("ci-runner", "destroy");
        lock.expires_at = Utc::now() - Duration::seconds(1);
        assert!(lock.is_expired());
        assert_eq!(lock.remaining_secs(), 0);
        assert!(lock.to_string().ends_with("(expired)"));
    }

    #[test]
    fn test_refresh_revives_an_expired_lock() {
        let mut lock = LockInfo::new("ci-runner", "apply");
        let acquired_at = lock.acquired_at;
        lock.expires_at = Utc::now() - Duration::seconds(1);

        lock.refresh();
        assert!(!lock.is_expired());
        assert_eq!(lock.acquired_at, acquired_at);
    }

    #[test]
    fn test_holder_ids_are_unique_per_call() {
        let first = generate_holder_id();
        assert_ne!(first, generate_holder_id());
        assert!(first.contains(&std::process::id().to_string()));
    }
}
