//! Configuration module for Stackform.
//!
//! This module handles project settings:
//! - Parsing and deserializing `stackform.yaml`
//! - Environment overrides, `.env` loading and credential lookup
//! - Validation of settings and of declarations against the resource catalog

mod parser;
mod spec;
mod validator;

pub use parser::{
    credentials_path, find_settings_file, read_credentials, SettingsParser, DEFAULT_SETTINGS_FILES,
    TOKEN_ENV,
};
pub use spec::{
    ApplyConfig, ProjectConfig, ProviderConfig, Settings, StateBackend, StateConfig, SETTINGS_FILE,
};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
