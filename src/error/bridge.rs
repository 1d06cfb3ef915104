// Bridge error types and constants

use crate::error::{ConfigError, ErrorCode};
use crate::graph::GraphError;
use crate::host::HostError;
use log::error;
use std::fmt;

/// Bridge error code constants
///
/// Error code range: 1001-1011
pub struct BridgeErrorCodes {}

impl BridgeErrorCodes {
    /// The graph client library cannot be initialized at all
    pub const LIBRARY_UNAVAILABLE: i32 = 1001;

    /// The graph server is not running or not reachable
    pub const GRAPH_UNAVAILABLE: i32 = 1002;

    /// Opening a graph client failed for another reason
    pub const CLIENT_OPEN_FAILED: i32 = 1003;

    /// Activating a graph client failed
    pub const ACTIVATE_FAILED: i32 = 1004;

    /// Registering a graph port failed
    pub const PORT_REGISTER_FAILED: i32 = 1005;

    /// The host refused to create a sink or source
    pub const ENDPOINT_CREATE_FAILED: i32 = 1006;

    /// The management thread could not be spawned
    pub const THREAD_SPAWN_FAILED: i32 = 1007;

    /// Mutex/RwLock was poisoned
    pub const LOCK_POISONED: i32 = 1008;

    /// No bridge with the given id is registered
    pub const UNKNOWN_BRIDGE: i32 = 1009;

    /// The management thread missed a realtime deadline
    pub const OVERRUN: i32 = 1010;

    /// Module configuration rejected at init
    pub const INVALID_CONFIG: i32 = 1011;
}

/// Log a bridge error with structured context
///
/// The logging is non-blocking and will not panic on failure.
pub fn log_bridge_error(err: &BridgeError, context: &str) {
    error!(
        "Bridge error in {}: code={}, component=Bridge, message={}",
        context,
        err.code(),
        err.message()
    );
}

/// Bridge-related errors
///
/// These errors cover bridge creation, endpoint wiring and graph connection
/// handling. Only [`BridgeError::is_fatal`] errors abort module initialization.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeError {
    /// Graph client library cannot be initialized
    LibraryUnavailable { details: String },

    /// Graph server unreachable (transient)
    GraphUnavailable { server: Option<String> },

    /// Graph client could not be opened
    ClientOpenFailed { name: String, reason: String },

    /// Graph client could not be activated
    ActivateFailed { name: String, reason: String },

    /// Port registration failed
    PortRegisterFailed { port: String, reason: String },

    /// Host sink/source creation failed
    EndpointCreateFailed { name: String, reason: String },

    /// Management thread spawn failed
    ThreadSpawnFailed { reason: String },

    /// Mutex/RwLock was poisoned
    LockPoisoned { component: String },

    /// Bridge id not present in the registry
    UnknownBridge { id: u32 },

    /// Realtime deadline missed by the management thread
    Overrun { bridge: String },

    /// Configuration rejected at module init
    InvalidConfig { reason: String },
}

impl BridgeError {
    /// Whether this error belongs to the fatal initialization class.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BridgeError::LibraryUnavailable { .. }
                | BridgeError::EndpointCreateFailed { .. }
                | BridgeError::ThreadSpawnFailed { .. }
                | BridgeError::InvalidConfig { .. }
        )
    }
}

impl ErrorCode for BridgeError {
    fn code(&self) -> i32 {
        match self {
            BridgeError::LibraryUnavailable { .. } => BridgeErrorCodes::LIBRARY_UNAVAILABLE,
            BridgeError::GraphUnavailable { .. } => BridgeErrorCodes::GRAPH_UNAVAILABLE,
            BridgeError::ClientOpenFailed { .. } => BridgeErrorCodes::CLIENT_OPEN_FAILED,
            BridgeError::ActivateFailed { .. } => BridgeErrorCodes::ACTIVATE_FAILED,
            BridgeError::PortRegisterFailed { .. } => BridgeErrorCodes::PORT_REGISTER_FAILED,
            BridgeError::EndpointCreateFailed { .. } => BridgeErrorCodes::ENDPOINT_CREATE_FAILED,
            BridgeError::ThreadSpawnFailed { .. } => BridgeErrorCodes::THREAD_SPAWN_FAILED,
            BridgeError::LockPoisoned { .. } => BridgeErrorCodes::LOCK_POISONED,
            BridgeError::UnknownBridge { .. } => BridgeErrorCodes::UNKNOWN_BRIDGE,
            BridgeError::Overrun { .. } => BridgeErrorCodes::OVERRUN,
            BridgeError::InvalidConfig { .. } => BridgeErrorCodes::INVALID_CONFIG,
        }
    }

    fn message(&self) -> String {
        match self {
            BridgeError::LibraryUnavailable { details } => {
                format!("Graph client library unavailable: {}", details)
            }
            BridgeError::GraphUnavailable { server } => match server {
                Some(name) => format!("Graph server '{}' is not reachable", name),
                None => "Default graph server is not reachable".to_string(),
            },
            BridgeError::ClientOpenFailed { name, reason } => {
                format!("Failed to open graph client '{}': {}", name, reason)
            }
            BridgeError::ActivateFailed { name, reason } => {
                format!("Failed to activate graph client '{}': {}", name, reason)
            }
            BridgeError::PortRegisterFailed { port, reason } => {
                format!("Failed to register port '{}': {}", port, reason)
            }
            BridgeError::EndpointCreateFailed { name, reason } => {
                format!("Failed to create endpoint '{}': {}", name, reason)
            }
            BridgeError::ThreadSpawnFailed { reason } => {
                format!("Failed to spawn management thread: {}", reason)
            }
            BridgeError::LockPoisoned { component } => {
                format!("Lock poisoned on {}", component)
            }
            BridgeError::UnknownBridge { id } => format!("No bridge with id {}", id),
            BridgeError::Overrun { bridge } => {
                format!("Management thread of '{}' missed a realtime deadline", bridge)
            }
            BridgeError::InvalidConfig { reason } => format!("Invalid configuration: {}", reason),
        }
    }
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BridgeError::{:?} (code {}): {}",
            self,
            self.code(),
            self.message()
        )
    }
}

impl std::error::Error for BridgeError {}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::ThreadSpawnFailed {
            reason: err.to_string(),
        }
    }
}

impl From<ConfigError> for BridgeError {
    fn from(err: ConfigError) -> Self {
        BridgeError::InvalidConfig {
            reason: err.message(),
        }
    }
}

impl From<GraphError> for BridgeError {
    fn from(err: GraphError) -> Self {
        match err {
            GraphError::LibraryUnavailable(details) => BridgeError::LibraryUnavailable { details },
            GraphError::ServerUnreachable(server) => BridgeError::GraphUnavailable { server },
            GraphError::ClientClosed(name) => BridgeError::ClientOpenFailed {
                name,
                reason: "client is closed".to_string(),
            },
            GraphError::PortRegistration(port) => BridgeError::PortRegisterFailed {
                port,
                reason: "rejected by graph".to_string(),
            },
            GraphError::Connect { source, destination } => BridgeError::ClientOpenFailed {
                name: source,
                reason: format!("connect to {} failed", destination),
            },
            GraphError::Activate(name) => BridgeError::ActivateFailed {
                name,
                reason: "rejected by graph".to_string(),
            },
        }
    }
}

impl From<HostError> for BridgeError {
    fn from(err: HostError) -> Self {
        BridgeError::EndpointCreateFailed {
            name: err.subject().to_string(),
            reason: err.to_string(),
        }
    }
}
