//! Error handling module for piprovision
//!
//! Provides centralized error handling with proper error types using thiserror.
//! Configuration errors are the only errors that abort a run; everything a
//! unit does wrong is folded into its `UnitResult` instead.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while locating, reading, parsing, or validating the manifest.
///
/// Every variant is fatal to the run and surfaces before any unit executes.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The manifest file does not exist
    #[error("Configuration file not found: {}", path.display())]
    NotFound { path: PathBuf },

    /// The manifest exists but could not be read
    #[error("Configuration file {} is unreadable: {source}", path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The manifest is not valid YAML (or not a mapping at the top level)
    #[error("Invalid YAML in {}: {message}", path.display())]
    InvalidSyntax { path: PathBuf, message: String },

    /// A recognized key holds a value that can never be applied
    #[error("Invalid value for '{key}': {message}")]
    Invalid { key: String, message: String },
}

impl ConfigError {
    /// Create a validation error for a single key
    pub fn invalid(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.into(),
            message: message.into(),
        }
    }
}

/// Main error type for piprovision
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// IO errors (state directory, file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors (loading, parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// State tracker errors (marker directory, marker writes)
    #[error("State error: {0}")]
    State(String),

    /// General errors (catch-all for edge cases)
    #[error("{0}")]
    General(String),
}

/// Result type alias for piprovision operations
pub type Result<T> = std::result::Result<T, ProvisionError>;

impl ProvisionError {
    /// Create a state error
    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    /// Create a general error
    pub fn general(msg: impl Into<String>) -> Self {
        Self::General(msg.into())
    }

    /// True when the error came from loading or validating the manifest
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ConfigError::invalid("hostname", "must start with a letter");
        assert_eq!(
            err.to_string(),
            "Invalid value for 'hostname': must start with a letter"
        );

        let err = ConfigError::NotFound {
            path: PathBuf::from("config.yml"),
        };
        assert_eq!(err.to_string(), "Configuration file not found: config.yml");
    }

    #[test]
    fn test_config_error_conversion() {
        let err: ProvisionError = ConfigError::invalid("k3s_role", "unknown role").into();
        assert!(err.is_config());
        assert!(err.to_string().starts_with("Configuration error:"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: ProvisionError = io_err.into();
        assert!(matches!(err, ProvisionError::Io(_)));
        assert!(!err.is_config());
    }

    #[test]
    fn test_error_constructors() {
        let err = ProvisionError::state("marker directory missing");
        assert!(matches!(err, ProvisionError::State(_)));

        let err = ProvisionError::general("cannot transition");
        assert_eq!(err.to_string(), "cannot transition");
    }
}
