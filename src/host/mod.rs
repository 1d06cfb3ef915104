//! Host media server contract.
//!
//! The bridge drives host-side sinks and sources, moves application streams
//! between endpoints and reads stream metadata. The host's own mixing, module
//! loading and hook dispatch stay on the host side of these traits.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::codec;
use crate::graph::PortFlow;

pub mod stub;

pub use stub::StubHost;

/// Well-known stream and endpoint property keys.
pub mod properties {
    pub const APPLICATION_NAME: &str = "application.name";
    pub const APPLICATION_PROCESS_ID: &str = "application.process.id";
    pub const APPLICATION_PROCESS_BINARY: &str = "application.process.binary";
    pub const DEVICE_DESCRIPTION: &str = "device.description";
    pub const DEVICE_STRING: &str = "device.string";
    pub const JACK_NAME: &str = "jack.name";
    pub const JACK_CLIENT_NAME: &str = "jack.client_name";
    pub const JACK_REF: &str = "jack.ref";
}

/// Property bag attached to streams and endpoints.
pub type PropertyList = BTreeMap<String, String>;

/// Audio direction, named from the application's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Recording streams, served by a host source fed from graph input ports
    Input,
    /// Playback streams, served by a host sink feeding graph output ports
    Output,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::Input, Direction::Output];

    /// Flow of the graph ports backing an endpoint of this direction.
    pub fn port_flow(self) -> PortFlow {
        match self {
            Direction::Input => PortFlow::Input,
            Direction::Output => PortFlow::Output,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Input => "input",
            Direction::Output => "output",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque handle of one application stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub struct StreamId(pub u32);

/// Opaque handle of one host sink or source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub struct EndpointId(pub u32);

/// What the host tells us about an application stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    pub id: StreamId,
    pub direction: Direction,
    pub channels: u32,
    pub properties: PropertyList,
    /// Stream asked not to be moved; routing leaves it alone
    pub dont_move: bool,
}

impl StreamInfo {
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn application_name(&self) -> Option<&str> {
        self.property(properties::APPLICATION_NAME)
    }

    pub fn process_id(&self) -> Option<&str> {
        self.property(properties::APPLICATION_PROCESS_ID)
    }

    pub fn process_binary(&self) -> Option<&str> {
        self.property(properties::APPLICATION_PROCESS_BINARY)
    }
}

/// Host-side endpoint state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Running,
    Idle,
    Suspended,
    Unlinked,
}

impl EndpointState {
    /// Only a running endpoint exchanges audio; anything else gets silence.
    pub fn is_streaming(self) -> bool {
        self == EndpointState::Running
    }
}

/// Sample format of an endpoint: 32-bit float native-endian at `rate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleSpec {
    pub rate: u32,
    pub channels: u32,
}

impl SampleSpec {
    pub fn frame_size(&self) -> usize {
        codec::frame_size(self.channels as usize)
    }

    pub fn frames_to_usec(&self, frames: u64) -> u64 {
        if self.rate == 0 {
            return 0;
        }
        frames * 1_000_000 / self.rate as u64
    }
}

/// Everything the host needs to create a sink or source.
#[derive(Debug, Clone)]
pub struct EndpointSpec {
    pub name: String,
    pub direction: Direction,
    pub sample_spec: SampleSpec,
    pub properties: PropertyList,
}

/// Whether a hook consumer handled a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookResult {
    Continue,
    Stop,
}

/// Errors returned by the host server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    /// Endpoint creation refused
    Refused { name: String, reason: String },
    UnknownStream(StreamId),
    UnknownEndpoint(EndpointId),
    /// Move of a stream rejected by the host
    MoveRejected { stream: StreamId, target: EndpointId },
}

impl HostError {
    /// Name of the object the error is about.
    pub fn subject(&self) -> String {
        match self {
            HostError::Refused { name, .. } => name.clone(),
            HostError::UnknownStream(id) => format!("stream #{}", id.0),
            HostError::UnknownEndpoint(id) => format!("endpoint #{}", id.0),
            HostError::MoveRejected { stream, .. } => format!("stream #{}", stream.0),
        }
    }
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostError::Refused { name, reason } => {
                write!(f, "host refused endpoint '{}': {}", name, reason)
            }
            HostError::UnknownStream(id) => write!(f, "no stream #{}", id.0),
            HostError::UnknownEndpoint(id) => write!(f, "no endpoint #{}", id.0),
            HostError::MoveRejected { stream, target } => {
                write!(f, "cannot move stream #{} to endpoint #{}", stream.0, target.0)
            }
        }
    }
}

impl std::error::Error for HostError {}

/// A host sink: renders the mix of its playback streams.
pub trait HostSink: Send + Sync {
    fn id(&self) -> EndpointId;
    fn name(&self) -> String;
    fn state(&self) -> EndpointState;
    /// Render `out.len() / channels` interleaved frames of the current mix.
    fn render(&self, out: &mut [f32]);
    fn set_max_request(&self, bytes: usize);
    fn set_fixed_latency(&self, usec: u64);
    fn unlink(&self);
}

/// A host source: distributes captured audio to its recording streams.
pub trait HostSource: Send + Sync {
    fn id(&self) -> EndpointId;
    fn name(&self) -> String;
    fn state(&self) -> EndpointState;
    /// Hand interleaved captured frames to the host.
    fn post(&self, samples: &[f32]);
    fn set_fixed_latency(&self, usec: u64);
    fn unlink(&self);
}

/// The host media server.
pub trait HostServer: Send + Sync {
    fn create_sink(&self, spec: &EndpointSpec) -> Result<Arc<dyn HostSink>, HostError>;
    fn create_source(&self, spec: &EndpointSpec) -> Result<Arc<dyn HostSource>, HostError>;
    fn default_endpoint(&self, direction: Direction) -> Option<EndpointId>;
    fn set_default_endpoint(&self, direction: Direction, id: EndpointId) -> Result<(), HostError>;
    fn move_stream(
        &self,
        stream: StreamId,
        direction: Direction,
        target: EndpointId,
    ) -> Result<(), HostError>;
    /// Streams currently known to the host, in creation order.
    fn streams(&self) -> Vec<StreamInfo>;
    fn is_shutting_down(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(props: &[(&str, &str)]) -> StreamInfo {
        StreamInfo {
            id: StreamId(1),
            direction: Direction::Output,
            channels: 2,
            properties: props
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            dont_move: false,
        }
    }

    #[test]
    fn test_stream_identity_accessors() {
        let info = stream(&[
            (properties::APPLICATION_NAME, "Player"),
            (properties::APPLICATION_PROCESS_ID, "4242"),
            (properties::APPLICATION_PROCESS_BINARY, ""),
        ]);
        assert_eq!(info.application_name(), Some("Player"));
        assert_eq!(info.process_id(), Some("4242"));
        assert_eq!(info.process_binary(), None, "empty values count as absent");
    }

    #[test]
    fn test_sample_spec_conversions() {
        let spec = SampleSpec {
            rate: 48_000,
            channels: 2,
        };
        assert_eq!(spec.frame_size(), 8);
        assert_eq!(spec.frames_to_usec(48_000), 1_000_000);
    }

    #[test]
    fn test_direction_port_flow() {
        assert_eq!(Direction::Output.port_flow(), PortFlow::Output);
        assert_eq!(Direction::Input.port_flow(), PortFlow::Input);
        assert_eq!(Direction::Input.to_string(), "input");
    }

    #[test]
    fn test_endpoint_state_streaming() {
        assert!(EndpointState::Running.is_streaming());
        assert!(!EndpointState::Idle.is_streaming());
        assert!(!EndpointState::Suspended.is_streaming());
        assert!(!EndpointState::Unlinked.is_streaming());
    }

    #[test]
    fn test_host_error_subject() {
        let err = HostError::Refused {
            name: "player".to_string(),
            reason: "no memory".to_string(),
        };
        assert_eq!(err.subject(), "player");
        assert!(err.to_string().contains("no memory"));
    }
}
