//! Provider trait definition.
//!
//! This module defines the interface the planner and executor use to talk
//! to a cloud control plane.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

/// Attribute map exchanged with a provider.
pub type Attributes = Map<String, Value>;

/// A resource as reported by the provider after a create.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderResource {
    /// Provider-assigned identifier.
    pub id: String,
    /// All attributes, configured and computed.
    #[serde(default)]
    pub attributes: Attributes,
}

/// Trait for cloud provider backends.
///
/// Errors are [`crate::error::ProviderError`] values wrapped in the crate
/// error; transient ones are retried by the caller.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Provider: Send + Sync {
    /// Gets the provider name.
    fn name(&self) -> &'static str;

    /// Verifies credentials and returns the account identity.
    async fn check_auth(&self) -> Result<String>;

    /// Reads a resource. Returns `None` if it no longer exists.
    async fn read(&self, kind: &str, id: &str) -> Result<Option<Attributes>>;

    /// Creates a resource.
    async fn create(&self, kind: &str, attributes: &Attributes) -> Result<ProviderResource>;

    /// Updates a resource in place and returns its new attributes.
    async fn update(&self, kind: &str, id: &str, attributes: &Attributes) -> Result<Attributes>;

    /// Deletes a resource.
    async fn delete(&self, kind: &str, id: &str) -> Result<()>;
}
