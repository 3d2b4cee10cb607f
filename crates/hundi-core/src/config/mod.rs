//! Service configuration parsing.
//!
//! This module handles the TOML configuration file consumed by the
//! hundi binaries: where the ledger database lives, the default
//! tracing filter, and the currency label used for display. Commission
//! rate tables are *not* configured here — they are administrator data
//! in the store (see [`crate::commission`]).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from loading the service configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigFileError {
    /// The file could not be read.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The TOML was invalid.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The parsed config failed validation.
    #[error("invalid config: {0}")]
    Validation(String),
}

/// Top-level service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Path to the `SQLite` ledger database.
    #[serde(default = "default_database")]
    pub database: PathBuf,

    /// Default tracing filter (overridable via `RUST_LOG`).
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    /// Display label for the currency; all amounts are minor units of
    /// this currency.
    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_database() -> PathBuf {
    PathBuf::from("hundi.db")
}

fn default_log_filter() -> String {
    "info".to_string()
}

fn default_currency() -> String {
    "INR".to_string()
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            log_filter: default_log_filter(),
            currency: default_currency(),
        }
    }
}

impl ServiceConfig {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigFileError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parses configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or a field fails
    /// validation.
    pub fn from_toml(content: &str) -> Result<Self, ConfigFileError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigFileError> {
        if self.database.as_os_str().is_empty() {
            return Err(ConfigFileError::Validation(
                "database path must not be empty".to_string(),
            ));
        }
        if self.currency.is_empty() {
            return Err(ConfigFileError::Validation(
                "currency label must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
