//! External audio graph client contract.
//!
//! The bridge only needs the client side of the graph: open/activate a named
//! client, register ports, query latency, connect to physical ports and receive
//! the per-cycle process callback plus shutdown notification. Everything else
//! (scheduling, the server process) belongs to the graph.

use std::fmt;
use std::sync::Arc;

pub mod mock;

pub use mock::MockGraph;

/// Frame counter of the graph's clock (wraps like the graph's own `nframes_t`).
pub type FrameTime = u32;

/// Port direction from the graph's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortFlow {
    /// Port receives audio from the graph (feeds a host source)
    Input,
    /// Port produces audio into the graph (fed by a host sink)
    Output,
}

impl PortFlow {
    /// Flow of the physical ports an autoconnected port of this flow attaches to.
    pub fn physical_peer(self) -> PortFlow {
        match self {
            PortFlow::Input => PortFlow::Output,
            PortFlow::Output => PortFlow::Input,
        }
    }
}

/// Handle of a port registered on one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortId(pub u32);

/// Which latency range to query on a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatencyMode {
    Capture,
    Playback,
}

/// Latency range in frames.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LatencyRange {
    pub min: u32,
    pub max: u32,
}

/// Options for opening a client.
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    /// Target a specific named server instance
    pub server_name: Option<String>,
    /// Fail fast instead of trying to start a server
    pub no_start_server: bool,
}

/// Errors reported by graph clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// The client library itself cannot be initialized
    LibraryUnavailable(String),
    /// No server is running (or the named one is missing)
    ServerUnreachable(Option<String>),
    /// Operation on a client the server already dropped
    ClientClosed(String),
    /// Port registration rejected
    PortRegistration(String),
    /// Connection between two ports failed
    Connect { source: String, destination: String },
    /// Activation rejected
    Activate(String),
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphError::LibraryUnavailable(details) => {
                write!(f, "graph library unavailable: {}", details)
            }
            GraphError::ServerUnreachable(Some(name)) => write!(f, "server '{}' unreachable", name),
            GraphError::ServerUnreachable(None) => write!(f, "server unreachable"),
            GraphError::ClientClosed(name) => write!(f, "client '{}' is closed", name),
            GraphError::PortRegistration(port) => write!(f, "cannot register port '{}'", port),
            GraphError::Connect {
                source,
                destination,
            } => write!(f, "cannot connect {} to {}", source, destination),
            GraphError::Activate(name) => write!(f, "cannot activate client '{}'", name),
        }
    }
}

impl std::error::Error for GraphError {}

/// Buffers handed to the process callback for one cycle.
///
/// `capture` holds one buffer per registered input port and `playback` one per
/// registered output port, both in registration order. They are only valid for
/// the duration of the callback.
pub struct ProcessCycle<'a, 'b> {
    pub frames: u32,
    pub frame_time: FrameTime,
    pub capture: &'a [&'b [f32]],
    pub playback: &'a mut [&'b mut [f32]],
}

/// Callbacks a client registers with the graph.
///
/// `process` runs on the graph's realtime thread and must not allocate, log or
/// block beyond the bounded render handshake.
pub trait ProcessHandler: Send {
    fn process(&mut self, cycle: &mut ProcessCycle<'_, '_>);

    fn buffer_size_changed(&mut self, _frames: u32) {}

    fn thread_init(&mut self) {}

    /// The server went away. Called from a graph-owned thread.
    fn shutdown(&mut self);
}

/// An open client connection.
pub trait GraphClient: Send + Sync {
    /// Actual client name (the server may have made it unique).
    fn name(&self) -> String;
    fn sample_rate(&self) -> u32;
    fn buffer_size(&self) -> u32;
    fn frame_time(&self) -> FrameTime;
    fn activate(&self, handler: Box<dyn ProcessHandler>) -> Result<(), GraphError>;
    /// Registers a terminal audio port.
    fn register_port(&self, name: &str, flow: PortFlow) -> Result<PortId, GraphError>;
    /// Full `client:port` name.
    fn port_name(&self, port: PortId) -> Option<String>;
    fn latency_range(&self, port: PortId, mode: LatencyMode) -> LatencyRange;
    /// Physical ports of the given flow, in server order.
    fn physical_ports(&self, flow: PortFlow) -> Vec<String>;
    fn connect(&self, source: &str, destination: &str) -> Result<(), GraphError>;
    fn close(&self);
}

/// Process-wide error reporting callback.
pub type ErrorReporter = fn(&str);

/// The client library.
pub trait GraphBackend: Send + Sync {
    fn open(&self, name: &str, options: &OpenOptions) -> Result<Arc<dyn GraphClient>, GraphError>;
    fn set_error_reporter(&self, reporter: ErrorReporter);
}

/// Default error reporter: graph errors are logged, never fatal.
pub fn report_graph_error(message: &str) {
    let line = message.split(['\n', '\r']).next().unwrap_or_default();
    tracing::warn!("[Graph] error >{}<", line);
}

/// Positional port name for channel `index` of an endpoint with `channels` channels.
pub fn port_name(flow: PortFlow, index: usize, channels: usize) -> String {
    match (flow, channels) {
        (PortFlow::Output, 1) => "out".to_string(),
        (PortFlow::Input, 1) => "in".to_string(),
        (PortFlow::Output, 2) => ["left", "right"][index.min(1)].to_string(),
        // Suffixed so a client with both endpoints has unique port names.
        (PortFlow::Input, 2) => ["left_in", "right_in"][index.min(1)].to_string(),
        (PortFlow::Output, _) => format!("out_{}", index + 1),
        (PortFlow::Input, _) => format!("in_{}", index + 1),
    }
}
