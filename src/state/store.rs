//! State store trait definition.
//!
//! This module defines the common interface for state storage backends.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error};

use super::lock::LockInfo;
use super::types::StateRecord;
use crate::error::{Result, StateError};

/// Trait for state storage backends.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the State Record.
    ///
    /// Returns `None` if no state exists yet.
    async fn load(&self) -> Result<Option<StateRecord>>;

    /// Saves the State Record.
    async fn save(&self, state: &StateRecord) -> Result<()>;

    /// Checks if state exists.
    async fn exists(&self) -> Result<bool>;

    /// Makes the backend ready to hold state (creates the directory or
    /// checks the bucket is reachable).
    async fn prepare(&self) -> Result<()>;

    /// Acquires the state lock.
    ///
    /// An empty holder is replaced with a generated one. Fails with
    /// `LockedByOther` while another unexpired lock is held.
    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo>;

    /// Releases the lock if `lock_id` matches the current holder.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Extends a lock this run holds and returns the renewed record.
    ///
    /// Fails with `LockLost` when the stored lock no longer carries
    /// `lock.lock_id`.
    async fn refresh_lock(&self, lock: &LockInfo) -> Result<LockInfo>;

    /// Gets current lock information if locked.
    async fn get_lock_info(&self) -> Result<Option<LockInfo>>;

    /// Saves the State Record only while `lock_id` still holds the lock.
    async fn save_locked(&self, state: &StateRecord, lock_id: &str) -> Result<()> {
        match self.get_lock_info().await? {
            Some(current) if current.lock_id == lock_id => self.save(state).await,
            _ => Err(StateError::LockLost {
                lock_id: lock_id.to_string(),
            }
            .into()),
        }
    }

    /// Checks if the state is locked by an unexpired lock.
    async fn is_locked(&self) -> Result<bool>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;

    /// Describes where the state lives.
    fn location(&self) -> String;
}

#[async_trait]
impl StateStore for Box<dyn StateStore> {
    async fn load(&self) -> Result<Option<StateRecord>> {
        (**self).load().await
    }

    async fn save(&self, state: &StateRecord) -> Result<()> {
        (**self).save(state).await
    }

    async fn exists(&self) -> Result<bool> {
        (**self).exists().await
    }

    async fn prepare(&self) -> Result<()> {
        (**self).prepare().await
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        (**self).acquire_lock(holder, operation).await
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        (**self).release_lock(lock_id).await
    }

    async fn refresh_lock(&self, lock: &LockInfo) -> Result<LockInfo> {
        (**self).refresh_lock(lock).await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        (**self).get_lock_info().await
    }

    async fn save_locked(&self, state: &StateRecord, lock_id: &str) -> Result<()> {
        (**self).save_locked(state, lock_id).await
    }

    async fn is_locked(&self) -> Result<bool> {
        (**self).is_locked().await
    }

    fn backend_type(&self) -> &'static str {
        (**self).backend_type()
    }

    fn location(&self) -> String {
        (**self).location()
    }
}

/// Drives `work` to completion while renewing `lock` every `every`.
///
/// Renewal stops at the first failure; the holder's next locked save then
/// reports the lost lock.
pub async fn with_lock_renewal<F>(
    store: &dyn StateStore,
    lock: &LockInfo,
    every: Duration,
    work: F,
) -> F::Output
where
    F: Future,
{
    let keep_alive = async {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        let mut current = lock.clone();
        loop {
            ticker.tick().await;
            match store.refresh_lock(&current).await {
                Ok(renewed) => {
                    debug!("Renewed state lock {} until {}", renewed.lock_id, renewed.expires_at);
                    current = renewed;
                }
                Err(e) => {
                    error!("Could not renew state lock {}: {e}", current.lock_id);
                    return;
                }
            }
        }
    };

    tokio::pin!(work);
    tokio::select! {
        output = &mut work => output,
        () = keep_alive => work.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StackformError;
    use crate::state::LocalStateStore;
    use chrono::Utc;
    use tempfile::TempDir;

    fn write_lock(dir: &std::path::Path, lock: &LockInfo) {
        let content = serde_json::to_string(lock).expect("serialize lock");
        std::fs::write(dir.join("state.lock"), content).expect("write lock");
    }

    #[tokio::test]
    async fn test_renewal_keeps_a_long_run_locked() {
        let temp = TempDir::new().expect("temp dir");
        let store = LocalStateStore::with_base_dir(temp.path());
        let mut lock = store.acquire_lock("run-a", "apply").await.expect("lock");

        // Leave only a sliver of lifetime so the run outlives it.
        lock.expires_at = Utc::now() + chrono::Duration::milliseconds(30);
        write_lock(temp.path(), &lock);

        let second = with_lock_renewal(&store, &lock, Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_millis(80)).await;
            store.acquire_lock("run-b", "apply").await
        })
        .await;

        assert!(matches!(
            second,
            Err(StackformError::State(StateError::LockedByOther { ref holder, .. })) if holder == "run-a"
        ));
        let current = store.get_lock_info().await.expect("read").expect("locked");
        assert_eq!(current.lock_id, lock.lock_id);
        assert!(current.expires_at > lock.expires_at);
    }

    #[tokio::test]
    async fn test_taken_over_lock_cannot_save_or_renew() {
        let temp = TempDir::new().expect("temp dir");
        let store = LocalStateStore::with_base_dir(temp.path());
        let mut stale = store.acquire_lock("run-a", "apply").await.expect("lock");
        stale.expires_at = Utc::now() - chrono::Duration::seconds(1);
        write_lock(temp.path(), &stale);

        let fresh = store.acquire_lock("run-b", "apply").await.expect("takeover");
        assert_ne!(fresh.lock_id, stale.lock_id);

        let renewed = store.refresh_lock(&stale).await;
        assert!(matches!(
            renewed,
            Err(StackformError::State(StateError::LockLost { ref lock_id })) if *lock_id == stale.lock_id
        ));

        let state = StateRecord::new("site", "dev");
        assert!(store.save_locked(&state, &stale.lock_id).await.is_err());
        assert!(!store.exists().await.expect("exists"));

        store.save_locked(&state, &fresh.lock_id).await.expect("holder saves");
        assert!(store.exists().await.expect("exists"));
    }
}
