// Error types for the graph bridge
//
// This module defines custom error types for bridge lifecycle, configuration and
// frame codec operations, providing structured error handling with stable error codes.

mod bridge;
mod codec;
mod config;

pub use bridge::{log_bridge_error, BridgeError, BridgeErrorCodes};
pub use codec::{CodecError, CodecErrorCodes};
pub use config::{log_config_error, ConfigError, ConfigErrorCodes};

/// Error codes for structured error reporting
///
/// This trait provides a standard way to get error codes and messages
/// from custom error types, enabling consistent error handling across
/// the module boundary.
pub trait ErrorCode {
    /// Get the numeric error code
    fn code(&self) -> i32;

    /// Get the human-readable error message
    fn message(&self) -> String;
}
