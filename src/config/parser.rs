//! Settings parser.
//!
//! This module loads `stackform.yaml`, applies environment overrides and
//! finds the provider credential.

use crate::error::{ConfigError, Result, StackformError};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::spec::{Settings, StateBackend, SETTINGS_FILE};

/// Environment variable holding the provider token.
pub const TOKEN_ENV: &str = "STACKFORM_TOKEN";

/// Settings parser.
#[derive(Debug, Default)]
pub struct SettingsParser {
    /// Directory holding the settings file; `.env` is looked up here.
    base_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct CredentialsFile {
    token: String,
}

impl SettingsParser {
    /// Creates a new settings parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving `.env`.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads settings from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<Settings> {
        let path = path.as_ref();
        info!("Loading settings from: {}", path.display());

        if !path.exists() {
            return Err(StackformError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            StackformError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses settings from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<Settings> {
        let settings: Settings = serde_yaml::from_str(content).map_err(|e| {
            let file = source.map_or_else(|| String::from("<settings>"), |p| p.display().to_string());
            let location = e
                .location()
                .map_or(file.clone(), |l| format!("{file}:{}:{}", l.line(), l.column()));
            StackformError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location: Some(location),
            })
        })?;

        debug!("Parsed settings for project: {}", settings.project.name);
        Ok(settings)
    }

    /// Loads settings with environment variable overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<Settings> {
        let mut settings = self.load_file(path)?;
        Self::apply_env_overrides_from(&mut settings, |name| std::env::var(name).ok());
        Ok(settings)
    }

    /// Applies `STACKFORM_*` overrides using the given lookup.
    pub fn apply_env_overrides_from<F>(settings: &mut Settings, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(endpoint) = lookup("STACKFORM_ENDPOINT") {
            debug!("Overriding provider.endpoint from environment");
            settings.provider.endpoint = endpoint;
        }

        if let Some(region) = lookup("STACKFORM_REGION") {
            debug!("Overriding provider.region from environment");
            settings.provider.region = Some(region);
        }

        if let Some(bucket) = lookup("STACKFORM_STATE_BUCKET") {
            debug!("Overriding state.bucket from environment");
            settings.state.bucket = Some(bucket);
            settings.state.backend = StateBackend::S3;
        }

        if let Some(prefix) = lookup("STACKFORM_STATE_PREFIX") {
            debug!("Overriding state.prefix from environment");
            settings.state.prefix = Some(prefix);
        }
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                StackformError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }

    /// Gets the provider token.
    ///
    /// Looks at `STACKFORM_TOKEN` first, then the credentials file under the
    /// user's config directory.
    ///
    /// # Errors
    ///
    /// Returns an error if no token is found or the credentials file is invalid.
    pub fn resolve_token() -> Result<String> {
        if let Ok(token) = std::env::var(TOKEN_ENV)
            && !token.trim().is_empty()
        {
            return Ok(token);
        }

        match credentials_path() {
            Some(path) if path.exists() => read_credentials(&path),
            _ => Err(StackformError::Config(ConfigError::MissingEnvVar {
                name: TOKEN_ENV.to_string(),
            })),
        }
    }
}

/// Location of the optional credentials file.
#[must_use]
pub fn credentials_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("stackform").join("credentials"))
}

/// Reads a `token:` entry from a credentials file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or has no token.
pub fn read_credentials(path: &Path) -> Result<String> {
    debug!("Reading credentials from: {}", path.display());
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ParseError {
        message: format!("Failed to read credentials: {e}"),
        location: Some(path.display().to_string()),
    })?;
    let credentials: CredentialsFile =
        serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseError {
            message: format!("Invalid credentials file: {e}"),
            location: Some(path.display().to_string()),
        })?;
    if credentials.token.trim().is_empty() {
        return Err(ConfigError::validation("Credentials token is empty", "token").into());
    }
    Ok(credentials.token)
}

/// Settings file names to search for.
pub const DEFAULT_SETTINGS_FILES: &[&str] = &[SETTINGS_FILE, "stackform.yml"];

/// Finds the settings file in the given directory or its parents.
///
/// # Errors
///
/// Returns an error if no settings file is found.
pub fn find_settings_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_SETTINGS_FILES {
            let settings_path = current.join(filename);
            if settings_path.exists() {
                debug!("Found settings file: {}", settings_path.display());
                return Ok(settings_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(StackformError::Config(ConfigError::FileNotFound {
        path: start.join(SETTINGS_FILE),
    }))
}
