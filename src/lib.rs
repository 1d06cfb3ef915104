// Graph Bridge - per-application streams on an external realtime audio graph
// Lock-free data path between the graph's realtime thread and one management
// thread per bridge, driven by a single-threaded module on the host's main
// control thread.

// Module declarations
pub mod bridge;
pub mod codec;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod graph;
pub mod host;
pub mod module;
pub mod recovery;
pub mod registry;
pub mod timer;
pub mod transport;

// Re-exports for convenience
pub use bridge::{BridgeId, BridgeSnapshot, BridgeState};
pub use config::{BridgeConfig, MergeMode};
pub use error::{BridgeError, ConfigError, ErrorCode};
pub use events::{LifecycleEvent, ModuleEvent};
pub use module::{BridgeModule, ModuleSnapshot};
pub use registry::RouteOutcome;

use tracing_subscriber::EnvFilter;

/// Install a `tracing` subscriber for binaries and manual runs.
///
/// Verbosity comes from `RUST_LOG` and defaults to `info`. Calling it twice is
/// harmless.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
