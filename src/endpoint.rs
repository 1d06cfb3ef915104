//! Endpoint adapter: one host sink or source driven by a bridge.
//!
//! The adapter is owned by the main control thread (creation, port table) and
//! read by the bridge's management thread (render, capture, latency). The
//! bookkeeping the management thread writes lives in atomics.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::BridgeError;
use crate::graph::{FrameTime, GraphClient, LatencyMode, PortId};
use crate::host::{
    properties, Direction, EndpointId, EndpointSpec, EndpointState, HostServer, HostSink,
    HostSource, PropertyList, SampleSpec,
};
use crate::transport::block_pool::{ensure_len, AudioBlock};

/// The host object behind an adapter.
#[derive(Clone)]
pub enum HostEndpoint {
    Sink(Arc<dyn HostSink>),
    Source(Arc<dyn HostSource>),
}

impl HostEndpoint {
    pub fn id(&self) -> EndpointId {
        match self {
            HostEndpoint::Sink(sink) => sink.id(),
            HostEndpoint::Source(source) => source.id(),
        }
    }

    pub fn state(&self) -> EndpointState {
        match self {
            HostEndpoint::Sink(sink) => sink.state(),
            HostEndpoint::Source(source) => source.state(),
        }
    }

    fn set_fixed_latency(&self, usec: u64) {
        match self {
            HostEndpoint::Sink(sink) => sink.set_fixed_latency(usec),
            HostEndpoint::Source(source) => source.set_fixed_latency(usec),
        }
    }

    fn unlink(&self) {
        match self {
            HostEndpoint::Sink(sink) => sink.unlink(),
            HostEndpoint::Source(source) => source.unlink(),
        }
    }
}

/// Property bag for a new endpoint.
///
/// Built-in keys first, then the user's properties replace them.
pub fn endpoint_properties(
    client_name: &str,
    merge_key: Option<&str>,
    server_name: Option<&str>,
    user: &PropertyList,
) -> PropertyList {
    let mut props = PropertyList::new();
    if let Some(server) = server_name {
        props.insert(properties::DEVICE_STRING.to_string(), server.to_string());
    }
    props.insert(
        properties::DEVICE_DESCRIPTION.to_string(),
        format!("Jack ({})", client_name),
    );
    props.insert(properties::JACK_CLIENT_NAME.to_string(), client_name.to_string());
    props.insert(properties::JACK_NAME.to_string(), client_name.to_string());
    if let Some(key) = merge_key {
        props.insert(properties::JACK_REF.to_string(), key.to_string());
    }
    for (key, value) in user {
        props.insert(key.clone(), value.clone());
    }
    props
}

pub struct EndpointAdapter {
    direction: Direction,
    endpoint: HostEndpoint,
    sample_spec: SampleSpec,
    ports: Vec<PortId>,
    frames_in_buffer: AtomicU32,
    saved_frame_time: AtomicU32,
    saved_frame_time_valid: AtomicBool,
    frozen_latency_usec: AtomicU64,
}

impl EndpointAdapter {
    /// Create the host sink or source described by `spec`.
    pub fn create(host: &dyn HostServer, spec: &EndpointSpec) -> Result<Self, BridgeError> {
        let endpoint = match spec.direction {
            Direction::Output => HostEndpoint::Sink(host.create_sink(spec)?),
            Direction::Input => HostEndpoint::Source(host.create_source(spec)?),
        };
        Ok(Self::new(spec.direction, endpoint, spec.sample_spec))
    }

    pub fn new(direction: Direction, endpoint: HostEndpoint, sample_spec: SampleSpec) -> Self {
        Self {
            direction,
            endpoint,
            sample_spec,
            ports: Vec::new(),
            frames_in_buffer: AtomicU32::new(0),
            saved_frame_time: AtomicU32::new(0),
            saved_frame_time_valid: AtomicBool::new(false),
            frozen_latency_usec: AtomicU64::new(0),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn id(&self) -> EndpointId {
        self.endpoint.id()
    }

    pub fn channels(&self) -> u32 {
        self.sample_spec.channels
    }

    pub fn ports(&self) -> &[PortId] {
        &self.ports
    }

    /// Replace the port table; ports die with the graph connection.
    pub fn set_ports(&mut self, ports: Vec<PortId>) {
        self.ports = ports;
    }

    pub fn clear_ports(&mut self) {
        self.ports.clear();
    }

    fn latency_mode(&self) -> LatencyMode {
        match self.direction {
            Direction::Output => LatencyMode::Playback,
            Direction::Input => LatencyMode::Capture,
        }
    }

    fn record_frame_time(&self, frame_time: FrameTime) {
        self.saved_frame_time.store(frame_time, Ordering::Release);
        self.saved_frame_time_valid.store(true, Ordering::Release);
    }

    /// Produce `frames` interleaved frames into `block`.
    ///
    /// Returns false when silence must be played instead: the sink is not
    /// running or the graph is not connected.
    pub fn render(
        &self,
        frames: u32,
        frame_time: FrameTime,
        connected: bool,
        block: &mut AudioBlock,
    ) -> bool {
        let mut rendered = false;
        if let HostEndpoint::Sink(sink) = &self.endpoint {
            if connected && sink.state().is_streaming() {
                let len = frames as usize * self.channels() as usize;
                ensure_len(block, len);
                sink.render(&mut block[..len]);
                rendered = true;
            }
        }
        self.frames_in_buffer.store(frames, Ordering::Release);
        self.record_frame_time(frame_time);
        rendered
    }

    /// Hand captured interleaved frames to the host source.
    pub fn capture(&self, frames: u32, frame_time: FrameTime, samples: &[f32]) {
        if let HostEndpoint::Source(source) = &self.endpoint {
            let len = frames as usize * self.channels() as usize;
            if frames > 0 && samples.len() >= len && source.state().is_streaming() {
                source.post(&samples[..len]);
            }
        }
        self.record_frame_time(frame_time);
    }

    /// Current latency in microseconds.
    ///
    /// With a client the worst-case port latency is adjusted by the graph time
    /// elapsed since the last exchange: subtracted (floored at zero) for
    /// output, added for input. Without a client the last computed value is
    /// returned unchanged.
    pub fn latency(&self, client: Option<&dyn GraphClient>) -> u64 {
        let (Some(client), Some(port)) = (client, self.ports.first()) else {
            return self.frozen_latency_usec.load(Ordering::Acquire);
        };

        let worst = client.latency_range(*port, self.latency_mode()).max;
        let elapsed = if self.saved_frame_time_valid.load(Ordering::Acquire) {
            client
                .frame_time()
                .saturating_sub(self.saved_frame_time.load(Ordering::Acquire))
        } else {
            0
        };

        let frames = match self.direction {
            Direction::Output => {
                let buffered = self.frames_in_buffer.load(Ordering::Acquire);
                (worst as u64 + buffered as u64).saturating_sub(elapsed as u64)
            }
            Direction::Input => worst as u64 + elapsed as u64,
        };
        let usec = self.sample_spec.frames_to_usec(frames);
        self.frozen_latency_usec.store(usec, Ordering::Release);
        usec
    }

    /// Publish the fixed latency from the worst-case port latency range.
    pub fn apply_fixed_latency(&self, client: &dyn GraphClient) -> u64 {
        let worst = self
            .ports
            .first()
            .map(|port| client.latency_range(*port, self.latency_mode()).max)
            .unwrap_or(0);
        let usec = self.sample_spec.frames_to_usec(worst as u64);
        self.endpoint.set_fixed_latency(usec);
        self.frozen_latency_usec.store(usec, Ordering::Release);
        usec
    }

    /// Graph period changed: the sink may be asked for at most one period.
    pub fn buffer_size_changed(&self, frames: u32) {
        if let HostEndpoint::Sink(sink) = &self.endpoint {
            sink.set_max_request(frames as usize * self.sample_spec.frame_size());
        }
    }

    pub fn unlink(&self) {
        self.endpoint.unlink();
    }
}
