//! S3-based state storage backend.
//!
//! This module provides remote state storage on AWS S3 (or compatible services)
//! for shared environments. The lock object is written with a conditional
//! `If-None-Match: *` put so only one writer can create it.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use tracing::{debug, info, warn};

use crate::error::{Result, StateError};

use super::lock::{generate_holder_id, LockInfo, LOCK_EXPIRY_SECS};
use super::store::StateStore;
use super::types::StateRecord;

/// State file key suffix.
const STATE_KEY: &str = "state.json";

/// Lock file key suffix.
const LOCK_KEY: &str = "state.lock";

/// HTTP status S3 returns when a conditional put loses.
const PRECONDITION_FAILED: u16 = 412;

/// Attempts at taking over an expired lock before giving up.
const TAKEOVER_ATTEMPTS: u32 = 3;

/// S3-based state store.
#[derive(Debug)]
pub struct S3StateStore {
    /// S3 client.
    client: Client,
    /// Bucket name.
    bucket: String,
    /// Key prefix, empty or ending in `/`.
    prefix: String,
}

fn normalize_prefix(prefix: Option<&str>) -> String {
    prefix
        .map(|p| {
            let p = p.trim_matches('/');
            if p.is_empty() {
                String::new()
            } else {
                format!("{p}/")
            }
        })
        .unwrap_or_default()
}

impl S3StateStore {
    /// Creates a new S3 state store.
    ///
    /// # Errors
    ///
    /// Returns an error if the S3 client cannot be initialized.
    pub async fn new(bucket: &str, prefix: Option<&str>, region: Option<&str>) -> Result<Self> {
        let config = if let Some(region_str) = region {
            aws_config::from_env()
                .region(aws_config::Region::new(region_str.to_string()))
                .load()
                .await
        } else {
            aws_config::load_from_env().await
        };

        Ok(Self::with_client(Client::new(&config), bucket, prefix))
    }

    /// Creates a new S3 state store with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalize_prefix(prefix),
        }
    }

    /// Gets the full S3 key for a file.
    fn key(&self, file: &str) -> String {
        format!("{}{file}", self.prefix)
    }

    /// Gets an object from S3.
    async fn get_object(&self, key: &str) -> Result<Option<String>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(response) => {
                let bytes = response
                    .body
                    .collect()
                    .await
                    .map_err(|e| StateError::backend(format!("Failed to read S3 object: {e}")))?;

                let content =
                    String::from_utf8(bytes.to_vec()).map_err(|e| StateError::Corrupted {
                        message: format!("Invalid UTF-8 in S3 object: {e}"),
                    })?;

                Ok(Some(content))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(StateError::backend(format!("S3 get error: {service_err}")).into())
                }
            }
        }
    }

    /// Puts an object to S3.
    async fn put_object(&self, key: &str, content: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.as_bytes().to_vec().into())
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| StateError::backend(format!("S3 put error: {e}")))?;

        Ok(())
    }

    /// Puts an object only if the key is absent. Returns `false` if it exists.
    async fn put_object_if_absent(&self, key: &str, content: &str) -> Result<bool> {
        let result = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .if_none_match("*")
            .body(content.as_bytes().to_vec().into())
            .content_type("application/json")
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(sdk_err) => {
                let status = sdk_err.raw_response().map(|r| r.status().as_u16());
                if status == Some(PRECONDITION_FAILED) {
                    Ok(false)
                } else {
                    Err(StateError::LockFailed {
                        message: format!("S3 conditional put error: {sdk_err}"),
                    }
                    .into())
                }
            }
        }
    }

    /// Deletes an object from S3.
    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StateError::backend(format!("S3 delete error: {e}")))?;

        Ok(())
    }

    /// Checks if an object exists in S3.
    async fn object_exists(&self, key: &str) -> Result<bool> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_not_found() {
                    Ok(false)
                } else {
                    Err(StateError::backend(format!("S3 head error: {service_err}")).into())
                }
            }
        }
    }
}

#[async_trait]
impl StateStore for S3StateStore {
    async fn load(&self) -> Result<Option<StateRecord>> {
        let key = self.key(STATE_KEY);
        debug!("Loading state from s3://{}/{key}", self.bucket);

        match self.get_object(&key).await? {
            Some(json) => {
                let state = StateRecord::from_json(&json)?;
                debug!(
                    "Loaded state serial {} for {}/{}",
                    state.serial, state.project, state.environment
                );
                Ok(Some(state))
            }
            None => {
                debug!("No state found in S3");
                Ok(None)
            }
        }
    }

    async fn save(&self, state: &StateRecord) -> Result<()> {
        let key = self.key(STATE_KEY);
        debug!("Saving state serial {} to s3://{}/{key}", state.serial, self.bucket);

        self.put_object(&key, &state.to_json()?).await
    }

    async fn exists(&self) -> Result<bool> {
        let key = self.key(STATE_KEY);
        self.object_exists(&key).await
    }

    async fn prepare(&self) -> Result<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| {
                StateError::backend(format!(
                    "State bucket {} is not reachable: {}",
                    self.bucket,
                    e.into_service_error()
                ))
            })?;
        debug!("State bucket {} is reachable", self.bucket);
        Ok(())
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        let key = self.key(LOCK_KEY);

        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };
        let lock_info = LockInfo::new(&holder_id, operation);
        let content = serde_json::to_string_pretty(&lock_info)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;

        for _ in 0..TAKEOVER_ATTEMPTS {
            if self.put_object_if_absent(&key, &content).await? {
                info!(
                    "Acquired state lock: {} (expires in {}s)",
                    lock_info.lock_id, LOCK_EXPIRY_SECS
                );
                return Ok(lock_info);
            }

            match self.get_lock_info().await? {
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
                    self.delete_object(&key).await?;
                }
                None => {}
            }
        }

        Err(StateError::LockFailed {
            message: String::from("Lock object kept changing while acquiring"),
        }
        .into())
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        let key = self.key(LOCK_KEY);

        if let Some(existing) = self.get_lock_info().await? {
            if existing.lock_id == lock_id {
                self.delete_object(&key).await?;
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
        match self.get_lock_info().await? {
            Some(current) if current.lock_id == lock.lock_id => {
                let mut renewed = current;
                renewed.refresh();
                let content = serde_json::to_string_pretty(&renewed).map_err(|e| {
                    StateError::serialization(format!("Failed to serialize lock: {e}"))
                })?;
                self.put_object(&self.key(LOCK_KEY), &content).await?;
                Ok(renewed)
            }
            _ => Err(StateError::LockLost {
                lock_id: lock.lock_id.clone(),
            }
            .into()),
        }
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        let key = self.key(LOCK_KEY);

        if let Some(content) = self.get_object(&key).await? {
            let lock_info: LockInfo =
                serde_json::from_str(&content).map_err(|e| StateError::Corrupted {
                    message: format!("Failed to parse lock: {e}"),
                })?;

            return Ok(Some(lock_info));
        }

        Ok(None)
    }

    async fn is_locked(&self) -> Result<bool> {
        if let Some(lock_info) = self.get_lock_info().await? {
            return Ok(!lock_info.is_expired());
        }
        Ok(false)
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }

    fn location(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.key(STATE_KEY))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_normalization() {
        assert_eq!(normalize_prefix(None), "");
        assert_eq!(normalize_prefix(Some("/")), "");
        assert_eq!(normalize_prefix(Some("/site/dev/")), "site/dev/");
        assert_eq!(normalize_prefix(Some("site")), "site/");
    }
}
