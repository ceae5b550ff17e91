//! Local file-based state storage backend.
//!
//! State lives in `.stackform/state.json`; the lock is a sibling file
//! created with `create_new` so two processes can never both win it.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{Result, StateError};

use super::lock::{generate_holder_id, LockInfo, LOCK_EXPIRY_SECS};
use super::store::StateStore;
use super::types::StateRecord;

/// Default state directory name.
pub const STATE_DIR: &str = ".stackform";

/// State file name.
const STATE_FILE: &str = "state.json";

/// Lock file name.
const LOCK_FILE: &str = "state.lock";

/// Attempts at taking over an expired lock before giving up.
const TAKEOVER_ATTEMPTS: u32 = 3;

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Path to the state file.
    state_path: PathBuf,
    /// Path to the lock file.
    lock_path: PathBuf,
}

impl LocalStateStore {
    /// Creates a new local state store with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let state_path = base_dir.join(STATE_FILE);
        let lock_path = base_dir.join(LOCK_FILE);

        Self {
            base_dir,
            state_path,
            lock_path,
        }
    }

    /// Creates a new local state store from a custom state file path.
    #[must_use]
    pub fn with_state_path(state_path: impl Into<PathBuf>) -> Self {
        let state_path = state_path.into();
        let base_dir = state_path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        let lock_path = base_dir.join(LOCK_FILE);

        Self {
            base_dir,
            state_path,
            lock_path,
        }
    }

    /// Gets the path of the state file.
    #[must_use]
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Ensures the state directory exists.
    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir)
                .await
                .map_err(|e| StateError::backend(format!("Failed to create state directory: {e}")))?;
        }
        Ok(())
    }

    /// Reads the lock file if it exists.
    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        let content = match fs::read_to_string(&self.lock_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StateError::Corrupted {
                    message: format!("Failed to read lock file: {e}"),
                }
                .into());
            }
        };

        let lock_info: LockInfo = serde_json::from_str(&content).map_err(|e| StateError::Corrupted {
            message: format!("Failed to parse lock file: {e}"),
        })?;

        Ok(Some(lock_info))
    }

    /// Creates the lock file. Returns `false` if it already exists.
    async fn create_lock_file(&self, lock_info: &LockInfo) -> Result<bool> {
        self.ensure_dir().await?;

        let content = serde_json::to_string_pretty(lock_info)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;

        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => {
                return Err(StateError::LockFailed {
                    message: format!("Failed to create lock file: {e}"),
                }
                .into());
            }
        };

        file.write_all(content.as_bytes())
            .await
            .map_err(|e| StateError::LockFailed {
                message: format!("Failed to write lock file: {e}"),
            })?;

        file.sync_all().await.map_err(|e| StateError::LockFailed {
            message: format!("Failed to sync lock file: {e}"),
        })?;

        Ok(true)
    }

    /// Replaces the lock file contents via a temporary file and rename.
    async fn overwrite_lock_file(&self, lock_info: &LockInfo) -> Result<()> {
        let content = serde_json::to_string_pretty(lock_info)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;
        let temp_path = self.lock_path.with_extension("lock.tmp");

        fs::write(&temp_path, content.as_bytes())
            .await
            .map_err(|e| StateError::LockFailed {
                message: format!("Failed to write lock file: {e}"),
            })?;
        fs::rename(&temp_path, &self.lock_path)
            .await
            .map_err(|e| StateError::LockFailed {
                message: format!("Failed to replace lock file: {e}"),
            })?;
        Ok(())
    }

    /// Deletes the lock file.
    async fn delete_lock_file(&self) -> Result<()> {
        match fs::remove_file(&self.lock_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StateError::LockFailed {
                message: format!("Failed to delete lock file: {e}"),
            }
            .into()),
        }
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self) -> Result<Option<StateRecord>> {
        if !self.state_path.exists() {
            debug!("State file does not exist: {}", self.state_path.display());
            return Ok(None);
        }

        debug!("Loading state from: {}", self.state_path.display());

        let content = fs::read_to_string(&self.state_path)
            .await
            .map_err(|e| StateError::Corrupted {
                message: format!("Failed to read state file: {e}"),
            })?;

        StateRecord::from_json(&content).map(Some)
    }

    async fn save(&self, state: &StateRecord) -> Result<()> {
        self.ensure_dir().await?;

        debug!(
            "Saving state serial {} to: {}",
            state.serial,
            self.state_path.display()
        );

        let content = state.to_json()?;

        // Write to a temporary file first, then rename for atomicity
        let temp_path = self.state_path.with_extension("tmp");

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| StateError::backend(format!("Failed to create temp state file: {e}")))?;

        file.write_all(content.as_bytes())
            .await
            .map_err(|e| StateError::backend(format!("Failed to write state file: {e}")))?;

        file.sync_all()
            .await
            .map_err(|e| StateError::backend(format!("Failed to sync state file: {e}")))?;

        fs::rename(&temp_path, &self.state_path)
            .await
            .map_err(|e| StateError::backend(format!("Failed to rename state file: {e}")))?;

        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.state_path.exists())
    }

    async fn prepare(&self) -> Result<()> {
        self.ensure_dir().await
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };
        let lock_info = LockInfo::new(&holder_id, operation);

        for _ in 0..TAKEOVER_ATTEMPTS {
            if self.create_lock_file(&lock_info).await? {
                info!(
                    "Acquired state lock: {} (expires in {}s)",
                    lock_info.lock_id, LOCK_EXPIRY_SECS
                );
                return Ok(lock_info);
            }

            match self.read_lock_file().await? {
                Some(existing) if !existing.is_expired() => {
                    return Err(StateError::LockedByOther {
                        holder: existing.holder,
                        since: existing.acquired_at.to_rfc3339(),
                    }
                    .into());
                }
                Some(existing) => {
                    warn!(
                        "Taking over expired lock {} held by {}",
                        existing.lock_id, existing.holder
                    );
                    self.delete_lock_file().await?;
                }
                // Released between our attempt and the read
                None => {}
            }
        }

        Err(StateError::LockFailed {
            message: String::from("Lock file kept changing while acquiring"),
        }
        .into())
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock_file().await? {
            if existing.lock_id == lock_id {
                self.delete_lock_file().await?;
                info!("Released state lock: {lock_id}");
            } else {
                debug!(
                    "Lock ID mismatch: expected {lock_id}, found {}",
                    existing.lock_id
                );
            }
        }
        Ok(())
    }

    async fn refresh_lock(&self, lock: &LockInfo) -> Result<LockInfo> {
        match self.read_lock_file().await? {
            Some(current) if current.lock_id == lock.lock_id => {
                let mut renewed = current;
                renewed.refresh();
                self.overwrite_lock_file(&renewed).await?;
                Ok(renewed)
            }
            _ => Err(StateError::LockLost {
                lock_id: lock.lock_id.clone(),
            }
            .into()),
        }
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    async fn is_locked(&self) -> Result<bool> {
        if let Some(lock_info) = self.read_lock_file().await? {
            return Ok(!lock_info.is_expired());
        }
        Ok(false)
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }

    fn location(&self) -> String {
        self.state_path.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StackformError;
    use crate::state::ResourceRecord;
    use tempfile::TempDir;

    fn create_test_store() -> (LocalStateStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(temp_dir.path().join(STATE_DIR));
        (store, temp_dir)
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let (store, _temp) = create_test_store();

        let mut state = StateRecord::new("site", "dev");
        state.set_resource(ResourceRecord::new("bucket", "site", "bucket-0001"));
        state.touch();
        store.save(&state).await.expect("Failed to save state");

        let loaded = store
            .load()
            .await
            .expect("Failed to load state")
            .expect("State should exist");

        assert_eq!(loaded, state);
    }

    #[tokio::test]
    async fn test_load_nonexistent() {
        let (store, _temp) = create_test_store();

        let result = store.load().await.expect("Load should not fail");
        assert!(result.is_none());
        assert!(!store.exists().await.expect("exists check failed"));
    }

    #[tokio::test]
    async fn test_prepare_creates_directory() {
        let (store, temp) = create_test_store();

        store.prepare().await.expect("prepare");
        assert!(temp.path().join(STATE_DIR).is_dir());
        assert!(!store.exists().await.expect("exists check failed"));
    }

    #[tokio::test]
    async fn test_corrupted_state_is_reported() {
        let (store, _temp) = create_test_store();
        std::fs::create_dir_all(store.state_path().parent().expect("parent")).expect("mkdir");
        std::fs::write(store.state_path(), "{ not json").expect("write");

        let result = store.load().await;
        assert!(matches!(
            result,
            Err(StackformError::State(StateError::Corrupted { .. }))
        ));
    }

    #[tokio::test]
    async fn test_lock_acquire_release() {
        let (store, _temp) = create_test_store();

        let lock = store
            .acquire_lock("test-holder", "apply")
            .await
            .expect("Failed to acquire lock");

        assert!(store.is_locked().await.expect("is_locked failed"));

        store
            .release_lock(&lock.lock_id)
            .await
            .expect("Failed to release lock");

        assert!(!store.is_locked().await.expect("is_locked failed"));
    }

    #[tokio::test]
    async fn test_lock_conflict() {
        let (store, _temp) = create_test_store();

        let _lock1 = store
            .acquire_lock("holder-1", "apply")
            .await
            .expect("Failed to acquire first lock");

        let result = store.acquire_lock("holder-2", "apply").await;
        assert!(matches!(
            result,
            Err(StackformError::State(StateError::LockedByOther { ref holder, .. })) if holder == "holder-1"
        ));
    }

    #[tokio::test]
    async fn test_expired_lock_is_taken_over() {
        let (store, _temp) = create_test_store();

        let mut stale = LockInfo::new("crashed", "apply");
        stale.expires_at = chrono::Utc::now() - chrono::Duration::seconds(1);
        assert!(store.create_lock_file(&stale).await.expect("write stale lock"));

        let lock = store
            .acquire_lock("fresh", "apply")
            .await
            .expect("expired lock should be taken over");
        assert_eq!(lock.holder, "fresh");
    }

    #[tokio::test]
    async fn test_release_with_wrong_id_keeps_lock() {
        let (store, _temp) = create_test_store();

        let _lock = store.acquire_lock("holder", "apply").await.expect("lock");
        store.release_lock("not-the-id").await.expect("release");
        assert!(store.is_locked().await.expect("is_locked failed"));
    }
}
