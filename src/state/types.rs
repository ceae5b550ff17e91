//! State types for tracking provisioned resources.
//!
//! The State Record is what the planner diffs against and what the
//! executor writes after every successful step.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::error::{Result, StateError};
use crate::provider::Attributes;

/// Current version of the state format.
pub const STATE_VERSION: &str = "1";

/// Maximum number of history entries kept.
pub const MAX_HISTORY: usize = 100;

/// The complete State Record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    /// State format version.
    pub version: String,
    /// Incremented on every save.
    pub serial: u64,
    /// Fixed at creation; identifies this record across copies.
    pub lineage: String,
    /// Project name.
    pub project: String,
    /// Environment name.
    pub environment: String,
    /// Recorded resources by address.
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceRecord>,
    /// Evaluated outputs by name.
    #[serde(default)]
    pub outputs: BTreeMap<String, OutputValue>,
    /// Fingerprint of the last applied declarations.
    #[serde(default)]
    pub declaration_hash: String,
    /// When the record was last updated.
    pub last_updated: DateTime<Utc>,
    /// Recent apply runs.
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

/// A provisioned resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    /// Address (`kind.name`).
    pub address: String,
    /// Resource kind.
    pub kind: String,
    /// Resource name.
    pub name: String,
    /// Provider id of the live instance.
    pub id: String,
    /// Configured attributes as last applied.
    #[serde(default)]
    pub config: Attributes,
    /// Attributes as last reported by the provider.
    #[serde(default)]
    pub attributes: Attributes,
    /// Addresses this resource depended on when applied.
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    /// Ids of replaced instances still awaiting deletion.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deposed: Vec<String>,
    /// When the instance was created.
    pub created_at: DateTime<Utc>,
    /// When the record was last updated.
    pub updated_at: DateTime<Utc>,
}

/// An evaluated output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputValue {
    /// Value.
    pub value: Value,
    /// Masked in listings.
    #[serde(default)]
    pub sensitive: bool,
    /// Description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A single entry in the run history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// When the run finished.
    pub timestamp: DateTime<Utc>,
    /// Type of run.
    pub operation: HistoryOperation,
    /// Declaration fingerprint at the time of the run.
    pub declaration_hash: String,
    /// Addresses touched by successful steps.
    pub resources: Vec<String>,
    /// Whether every step succeeded.
    pub success: bool,
    /// Error message, if the run failed.
    #[serde(default)]
    pub error: Option<String>,
}

/// Types of runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HistoryOperation {
    /// Plan applied.
    Apply,
    /// Everything destroyed.
    Destroy,
}

impl StateRecord {
    /// Creates a new empty record with a fresh lineage.
    #[must_use]
    pub fn new(project: &str, environment: &str) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            serial: 0,
            lineage: Uuid::new_v4().to_string(),
            project: project.to_string(),
            environment: environment.to_string(),
            resources: BTreeMap::new(),
            outputs: BTreeMap::new(),
            declaration_hash: String::new(),
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Parses a record from JSON and checks its version.
    ///
    /// # Errors
    ///
    /// Returns an error if the content is not a valid record or was written
    /// by an incompatible version.
    pub fn from_json(content: &str) -> Result<Self> {
        let record: Self = serde_json::from_str(content).map_err(|e| StateError::Corrupted {
            message: format!("Failed to parse state: {e}"),
        })?;
        if record.version != STATE_VERSION {
            return Err(StateError::VersionMismatch {
                expected: STATE_VERSION.to_string(),
                found: record.version,
            }
            .into());
        }
        Ok(record)
    }

    /// Serializes the record as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| StateError::serialization(format!("Failed to serialize state: {e}")).into())
    }

    /// Gets a resource by address.
    #[must_use]
    pub fn get(&self, address: &str) -> Option<&ResourceRecord> {
        self.resources.get(address)
    }

    /// Gets a mutable resource by address.
    pub fn get_mut(&mut self, address: &str) -> Option<&mut ResourceRecord> {
        self.resources.get_mut(address)
    }

    /// Adds or replaces a resource.
    pub fn set_resource(&mut self, record: ResourceRecord) {
        self.resources.insert(record.address.clone(), record);
        self.last_updated = Utc::now();
    }

    /// Removes a resource by address.
    pub fn remove_resource(&mut self, address: &str) -> Option<ResourceRecord> {
        let removed = self.resources.remove(address);
        if removed.is_some() {
            self.last_updated = Utc::now();
        }
        removed
    }

    /// Bumps the serial ahead of a save.
    pub fn touch(&mut self) {
        self.serial += 1;
        self.last_updated = Utc::now();
    }

    /// Adds a history entry, dropping the oldest beyond the cap.
    pub fn add_history(&mut self, entry: HistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            let excess = self.history.len() + 1 - MAX_HISTORY;
            self.history.drain(..excess);
        }
        self.history.push(entry);
    }

    /// Returns all recorded addresses.
    #[must_use]
    pub fn addresses(&self) -> Vec<&str> {
        self.resources.keys().map(String::as_str).collect()
    }

    /// Returns true if nothing is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

impl ResourceRecord {
    /// Creates a record for a freshly created instance.
    #[must_use]
    pub fn new(kind: &str, name: &str, id: &str) -> Self {
        let now = Utc::now();
        Self {
            address: format!("{kind}.{name}"),
            kind: kind.to_string(),
            name: name.to_string(),
            id: id.to_string(),
            config: Attributes::new(),
            attributes: Attributes::new(),
            dependencies: BTreeSet::new(),
            deposed: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Looks up an attribute, falling back to the configured value.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&Value> {
        if name == "id" {
            return self.attributes.get("id").or(self.config.get("id"));
        }
        self.attributes.get(name).or_else(|| self.config.get(name))
    }
}

impl HistoryEntry {
    /// Creates a successful history entry.
    #[must_use]
    pub fn new(operation: HistoryOperation, declaration_hash: &str, resources: Vec<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            declaration_hash: declaration_hash.to_string(),
            resources,
            success: true,
            error: None,
        }
    }

    /// Creates a failed history entry.
    #[must_use]
    pub fn failed(
        operation: HistoryOperation,
        declaration_hash: &str,
        resources: Vec<String>,
        error: &str,
    ) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Self::new(operation, declaration_hash, resources)
        }
    }
}

impl std::fmt::Display for HistoryOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Apply => "apply",
            Self::Destroy => "destroy",
        };
        write!(f, "{op}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StackformError;

    #[test]
    fn test_history_is_bounded() {
        let mut state = StateRecord::new("site", "dev");
        for i in 0..(MAX_HISTORY + 5) {
            state.add_history(HistoryEntry::new(
                HistoryOperation::Apply,
                &format!("hash-{i}"),
                Vec::new(),
            ));
        }
        assert_eq!(state.history.len(), MAX_HISTORY);
        assert_eq!(state.history[0].declaration_hash, "hash-5");
    }

    #[test]
    fn test_json_roundtrip_keeps_lineage() {
        let mut state = StateRecord::new("site", "dev");
        state.set_resource(ResourceRecord::new("bucket", "site", "bucket-0001"));
        state.touch();

        let parsed = StateRecord::from_json(&state.to_json().expect("serialize")).expect("parse");
        assert_eq!(parsed.lineage, state.lineage);
        assert_eq!(parsed.serial, 1);
        assert_eq!(parsed.addresses(), vec!["bucket.site"]);
    }

    #[test]
    fn test_version_mismatch_is_rejected() {
        let mut state = StateRecord::new("site", "dev");
        state.version = String::from("99");
        let json = serde_json::to_string(&state).expect("serialize");

        let result = StateRecord::from_json(&json);
        assert!(matches!(
            result,
            Err(StackformError::State(StateError::VersionMismatch { .. }))
        ));
    }

    #[test]
    fn test_attribute_falls_back_to_config() {
        let mut record = ResourceRecord::new("bucket", "site", "bucket-0001");
        record
            .config
            .insert(String::from("acl"), Value::String(String::from("private")));
        record
            .attributes
            .insert(String::from("arn"), Value::String(String::from("arn:x")));
        assert_eq!(record.attribute("acl"), Some(&Value::String(String::from("private"))));
        assert_eq!(record.attribute("arn"), Some(&Value::String(String::from("arn:x"))));
        assert!(record.attribute("missing").is_none());
    }
}
