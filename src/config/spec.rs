//! Settings types.
//!
//! This module defines the structs that map to `stackform.yaml`: project
//! identity, provider endpoint, state backend and apply tuning. Resources
//! themselves live in declaration documents, not here.

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::provider::{RetryPolicy, DEFAULT_ENDPOINT};

/// Default settings file name.
pub const SETTINGS_FILE: &str = "stackform.yaml";

/// The root settings structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
pub struct Settings {
    /// Project identity.
    #[validate(nested)]
    pub project: ProjectConfig,
    /// Provider endpoint and credentials lookup.
    #[serde(default)]
    #[validate(nested)]
    pub provider: ProviderConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Apply tuning.
    #[serde(default)]
    #[validate(nested)]
    pub apply: ApplyConfig,
    /// Declaration files or directories, relative to the settings file.
    #[serde(default = "default_declarations")]
    #[validate(length(min = 1))]
    pub declarations: Vec<String>,
    /// Variable override file, relative to the settings file.
    #[serde(default = "default_var_file")]
    pub var_file: String,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct ProjectConfig {
    /// Unique name for the project.
    #[validate(length(min = 1, max = 63))]
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    #[validate(length(min = 1, max = 32))]
    pub environment: String,
}

/// Provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct ProviderConfig {
    /// Control plane endpoint.
    #[serde(default = "default_endpoint")]
    #[validate(length(min = 1))]
    pub endpoint: String,
    /// Default region passed to resources that do not set one.
    #[serde(default)]
    pub region: Option<String>,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    #[validate(range(min = 1, max = 600))]
    pub timeout_secs: u64,
}

/// State backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StateConfig {
    /// Backend type (local or s3).
    #[serde(default)]
    pub backend: StateBackend,
    /// Local state file path (for local backend).
    #[serde(default)]
    pub path: Option<String>,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    #[serde(default)]
    pub region: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
}

/// Apply tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
pub struct ApplyConfig {
    /// Maximum concurrent provider calls per stage.
    #[serde(default = "default_parallelism")]
    #[validate(range(min = 1, max = 64))]
    pub parallelism: usize,
    /// Backoff for transient provider errors.
    #[serde(default)]
    #[validate(nested)]
    pub retry: RetryPolicy,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            region: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            retry: RetryPolicy::default(),
        }
    }
}

impl Settings {
    /// Creates settings with defaults for a project.
    #[must_use]
    pub fn new(name: &str, environment: &str) -> Self {
        Self {
            project: ProjectConfig {
                name: name.to_string(),
                environment: environment.to_string(),
            },
            provider: ProviderConfig::default(),
            state: StateConfig::default(),
            apply: ApplyConfig::default(),
            declarations: default_declarations(),
            var_file: default_var_file(),
        }
    }

    /// Returns the full project identifier.
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{}-{}", self.project.name, self.project.environment)
    }
}

impl std::fmt::Display for StateBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::S3 => write!(f, "s3"),
        }
    }
}

fn default_environment() -> String {
    String::from("dev")
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

const fn default_timeout_secs() -> u64 {
    30
}

const fn default_parallelism() -> usize {
    1
}

fn default_declarations() -> Vec<String> {
    vec![String::from("declarations")]
}

fn default_var_file() -> String {
    String::from("stackform.vars.yaml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::new("site", "dev");
        assert_eq!(settings.apply.parallelism, 1);
        assert_eq!(settings.declarations, vec!["declarations"]);
        assert_eq!(settings.state.backend, StateBackend::Local);
        assert_eq!(settings.full_name(), "site-dev");
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_parallelism_bounds() {
        let mut settings = Settings::new("site", "dev");
        settings.apply.parallelism = 0;
        assert!(settings.validate().is_err());
        settings.apply.parallelism = 65;
        assert!(settings.validate().is_err());
        settings.apply.parallelism = 64;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_nested_retry_is_validated() {
        let mut settings = Settings::new("site", "dev");
        settings.apply.retry.max_attempts = 0;
        assert!(settings.validate().is_err());
    }
}
