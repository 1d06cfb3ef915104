// Configuration error types and constants

use crate::error::ErrorCode;
use log::error;
use std::fmt;

/// Configuration error code constants
///
/// Error code range: 2001-2004
pub struct ConfigErrorCodes {}

impl ConfigErrorCodes {
    /// A recognized argument carried an invalid value
    pub const INVALID_ARGUMENT: i32 = 2001;

    /// An argument key is not recognized
    pub const UNKNOWN_ARGUMENT: i32 = 2002;

    /// The argument string or JSON document could not be parsed
    pub const PARSE_FAILED: i32 = 2003;

    /// The configuration file could not be read
    pub const IO: i32 = 2004;
}

/// Log a configuration error with structured context
pub fn log_config_error(err: &ConfigError, context: &str) {
    error!(
        "Config error in {}: code={}, component=BridgeConfig, message={}",
        context,
        err.code(),
        err.message()
    );
}

/// Configuration errors, reported at module init time
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// Value rejected for a known key
    InvalidArgument { key: String, value: String },

    /// Key not recognized
    UnknownArgument { key: String },

    /// Syntax error
    ParseFailed { reason: String },

    /// File could not be read
    Io { path: String, reason: String },
}

impl ErrorCode for ConfigError {
    fn code(&self) -> i32 {
        match self {
            ConfigError::InvalidArgument { .. } => ConfigErrorCodes::INVALID_ARGUMENT,
            ConfigError::UnknownArgument { .. } => ConfigErrorCodes::UNKNOWN_ARGUMENT,
            ConfigError::ParseFailed { .. } => ConfigErrorCodes::PARSE_FAILED,
            ConfigError::Io { .. } => ConfigErrorCodes::IO,
        }
    }

    fn message(&self) -> String {
        match self {
            ConfigError::InvalidArgument { key, value } => {
                format!("Invalid value '{}' for argument '{}'", value, key)
            }
            ConfigError::UnknownArgument { key } => format!("Unknown argument '{}'", key),
            ConfigError::ParseFailed { reason } => {
                format!("Failed to parse module arguments: {}", reason)
            }
            ConfigError::Io { path, reason } => {
                format!("Failed to read config file {}: {}", path, reason)
            }
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ConfigError::{:?} (code {}): {}",
            self,
            self.code(),
            self.message()
        )
    }
}

impl std::error::Error for ConfigError {}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::ParseFailed {
            reason: err.to_string(),
        }
    }
}
