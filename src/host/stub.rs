//! In-memory host server for tests and the simulator.
//!
//! Starts with a null sink and a null source as defaults, keeps every created
//! endpoint for inspection and tracks which endpoint each stream sits on.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{
    Direction, EndpointId, EndpointSpec, EndpointState, HostError, HostServer, HostSink,
    HostSource, PropertyList, SampleSpec, StreamId, StreamInfo,
};

/// Level rendered by stub sinks unless changed.
pub const DEFAULT_RENDER_LEVEL: f32 = 0.5;

const NULL_SINK: EndpointId = EndpointId(0);
const NULL_SOURCE: EndpointId = EndpointId(1);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Shared state of one stub endpoint.
struct EndpointCore {
    id: EndpointId,
    name: String,
    direction: Direction,
    sample_spec: SampleSpec,
    properties: PropertyList,
    state: Mutex<EndpointState>,
    fixed_latency: AtomicU64,
}

impl EndpointCore {
    fn new(id: EndpointId, spec: &EndpointSpec) -> Self {
        Self {
            id,
            name: spec.name.clone(),
            direction: spec.direction,
            sample_spec: spec.sample_spec,
            properties: spec.properties.clone(),
            state: Mutex::new(EndpointState::Running),
            fixed_latency: AtomicU64::new(0),
        }
    }
}

/// Sink that renders a constant level.
pub struct StubSink {
    core: EndpointCore,
    level: Mutex<f32>,
    rendered_frames: AtomicU64,
    max_request: AtomicUsize,
}

impl StubSink {
    pub fn sample_spec(&self) -> SampleSpec {
        self.core.sample_spec
    }

    pub fn properties(&self) -> &PropertyList {
        &self.core.properties
    }

    pub fn set_level(&self, level: f32) {
        *lock(&self.level) = level;
    }

    pub fn rendered_frames(&self) -> u64 {
        self.rendered_frames.load(Ordering::SeqCst)
    }

    pub fn max_request(&self) -> usize {
        self.max_request.load(Ordering::SeqCst)
    }

    pub fn fixed_latency(&self) -> u64 {
        self.core.fixed_latency.load(Ordering::SeqCst)
    }

    pub fn set_state(&self, state: EndpointState) {
        *lock(&self.core.state) = state;
    }
}

impl HostSink for StubSink {
    fn id(&self) -> EndpointId {
        self.core.id
    }

    fn name(&self) -> String {
        self.core.name.clone()
    }

    fn state(&self) -> EndpointState {
        *lock(&self.core.state)
    }

    fn render(&self, out: &mut [f32]) {
        let level = *lock(&self.level);
        out.fill(level);
        let channels = self.core.sample_spec.channels.max(1) as usize;
        self.rendered_frames
            .fetch_add((out.len() / channels) as u64, Ordering::SeqCst);
    }

    fn set_max_request(&self, bytes: usize) {
        self.max_request.store(bytes, Ordering::SeqCst);
    }

    fn set_fixed_latency(&self, usec: u64) {
        self.core.fixed_latency.store(usec, Ordering::SeqCst);
    }

    fn unlink(&self) {
        self.set_state(EndpointState::Unlinked);
    }
}

/// Source that records everything posted to it.
pub struct StubSource {
    core: EndpointCore,
    recorded: Mutex<Vec<f32>>,
    posted_frames: AtomicU64,
}

impl StubSource {
    pub fn sample_spec(&self) -> SampleSpec {
        self.core.sample_spec
    }

    pub fn properties(&self) -> &PropertyList {
        &self.core.properties
    }

    pub fn posted_frames(&self) -> u64 {
        self.posted_frames.load(Ordering::SeqCst)
    }

    /// Interleaved samples received so far.
    pub fn recorded(&self) -> Vec<f32> {
        lock(&self.recorded).clone()
    }

    pub fn fixed_latency(&self) -> u64 {
        self.core.fixed_latency.load(Ordering::SeqCst)
    }

    pub fn set_state(&self, state: EndpointState) {
        *lock(&self.core.state) = state;
    }
}

impl HostSource for StubSource {
    fn id(&self) -> EndpointId {
        self.core.id
    }

    fn name(&self) -> String {
        self.core.name.clone()
    }

    fn state(&self) -> EndpointState {
        *lock(&self.core.state)
    }

    fn post(&self, samples: &[f32]) {
        lock(&self.recorded).extend_from_slice(samples);
        let channels = self.core.sample_spec.channels.max(1) as usize;
        self.posted_frames
            .fetch_add((samples.len() / channels) as u64, Ordering::SeqCst);
    }

    fn set_fixed_latency(&self, usec: u64) {
        self.core.fixed_latency.store(usec, Ordering::SeqCst);
    }

    fn unlink(&self) {
        self.set_state(EndpointState::Unlinked);
    }
}

struct StubStream {
    info: StreamInfo,
    location: Option<EndpointId>,
}

struct StubState {
    next_endpoint: u32,
    next_stream: u32,
    sinks: Vec<Arc<StubSink>>,
    sources: Vec<Arc<StubSource>>,
    streams: BTreeMap<StreamId, StubStream>,
    default_sink: Option<EndpointId>,
    default_source: Option<EndpointId>,
    failing_moves: HashSet<StreamId>,
    refuse_endpoints: bool,
    move_count: u32,
}

/// In-memory host server.
pub struct StubHost {
    state: Mutex<StubState>,
    shutting_down: AtomicBool,
}

impl StubHost {
    pub fn new() -> Self {
        let null_spec = |name: &str, direction| EndpointSpec {
            name: name.to_string(),
            direction,
            sample_spec: SampleSpec {
                rate: 48_000,
                channels: 2,
            },
            properties: PropertyList::new(),
        };
        let null_sink = Arc::new(StubSink {
            core: EndpointCore::new(NULL_SINK, &null_spec("null", Direction::Output)),
            level: Mutex::new(0.0),
            rendered_frames: AtomicU64::new(0),
            max_request: AtomicUsize::new(0),
        });
        let null_source = Arc::new(StubSource {
            core: EndpointCore::new(NULL_SOURCE, &null_spec("null.monitor", Direction::Input)),
            recorded: Mutex::new(Vec::new()),
            posted_frames: AtomicU64::new(0),
        });
        Self {
            state: Mutex::new(StubState {
                next_endpoint: 2,
                next_stream: 1,
                sinks: vec![null_sink],
                sources: vec![null_source],
                streams: BTreeMap::new(),
                default_sink: Some(NULL_SINK),
                default_source: Some(NULL_SOURCE),
                failing_moves: HashSet::new(),
                refuse_endpoints: false,
                move_count: 0,
            }),
            shutting_down: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StubState> {
        lock(&self.state)
    }

    /// Id of the built-in endpoint streams fall back to.
    pub fn null_endpoint(direction: Direction) -> EndpointId {
        match direction {
            Direction::Output => NULL_SINK,
            Direction::Input => NULL_SOURCE,
        }
    }

    /// Create an application stream placed on the current default endpoint.
    pub fn add_stream(
        &self,
        direction: Direction,
        channels: u32,
        properties: &[(&str, &str)],
    ) -> StreamInfo {
        let mut state = self.lock();
        let id = StreamId(state.next_stream);
        state.next_stream += 1;
        let info = StreamInfo {
            id,
            direction,
            channels,
            properties: properties
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            dont_move: false,
        };
        let location = match direction {
            Direction::Output => state.default_sink,
            Direction::Input => state.default_source,
        };
        state.streams.insert(
            id,
            StubStream {
                info: info.clone(),
                location,
            },
        );
        info
    }

    /// Mark a stream as not movable.
    pub fn pin_stream(&self, id: StreamId) {
        if let Some(stream) = self.lock().streams.get_mut(&id) {
            stream.info.dont_move = true;
        }
    }

    pub fn remove_stream(&self, id: StreamId) -> Option<StreamInfo> {
        self.lock().streams.remove(&id).map(|s| s.info)
    }

    pub fn stream(&self, id: StreamId) -> Option<StreamInfo> {
        self.lock().streams.get(&id).map(|s| s.info.clone())
    }

    /// Endpoint a stream currently sits on.
    pub fn stream_location(&self, id: StreamId) -> Option<EndpointId> {
        self.lock().streams.get(&id).and_then(|s| s.location)
    }

    /// Make moves of this stream fail until cleared.
    pub fn fail_moves(&self, id: StreamId, fail: bool) {
        let mut state = self.lock();
        if fail {
            state.failing_moves.insert(id);
        } else {
            state.failing_moves.remove(&id);
        }
    }

    pub fn refuse_endpoints(&self, refuse: bool) {
        self.lock().refuse_endpoints = refuse;
    }

    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    pub fn move_count(&self) -> u32 {
        self.lock().move_count
    }

    pub fn sinks(&self) -> Vec<Arc<StubSink>> {
        self.lock().sinks.clone()
    }

    pub fn sources(&self) -> Vec<Arc<StubSource>> {
        self.lock().sources.clone()
    }

    pub fn sink(&self, id: EndpointId) -> Option<Arc<StubSink>> {
        self.lock().sinks.iter().find(|s| s.core.id == id).cloned()
    }

    pub fn source(&self, id: EndpointId) -> Option<Arc<StubSource>> {
        self.lock().sources.iter().find(|s| s.core.id == id).cloned()
    }

    pub fn sink_by_name(&self, name: &str) -> Option<Arc<StubSink>> {
        self.lock()
            .sinks
            .iter()
            .find(|s| s.core.name == name && s.state() != EndpointState::Unlinked)
            .cloned()
    }

    pub fn source_by_name(&self, name: &str) -> Option<Arc<StubSource>> {
        self.lock()
            .sources
            .iter()
            .find(|s| s.core.name == name && s.state() != EndpointState::Unlinked)
            .cloned()
    }

    fn endpoint_state(state: &StubState, id: EndpointId) -> Option<(Direction, EndpointState)> {
        state
            .sinks
            .iter()
            .find(|s| s.core.id == id)
            .map(|s| (s.core.direction, s.state()))
            .or_else(|| {
                state
                    .sources
                    .iter()
                    .find(|s| s.core.id == id)
                    .map(|s| (s.core.direction, s.state()))
            })
    }

    /// Rehome streams left on unlinked endpoints and reset stale defaults.
    fn collect_orphans(state: &mut StubState) {
        let unlinked: HashSet<EndpointId> = state
            .sinks
            .iter()
            .filter(|s| s.state() == EndpointState::Unlinked)
            .map(|s| s.core.id)
            .chain(
                state
                    .sources
                    .iter()
                    .filter(|s| s.state() == EndpointState::Unlinked)
                    .map(|s| s.core.id),
            )
            .collect();
        if unlinked.is_empty() {
            return;
        }
        for stream in state.streams.values_mut() {
            if matches!(stream.location, Some(id) if unlinked.contains(&id)) {
                stream.location = Some(Self::null_endpoint(stream.info.direction));
            }
        }
        if matches!(state.default_sink, Some(id) if unlinked.contains(&id)) {
            state.default_sink = Some(NULL_SINK);
        }
        if matches!(state.default_source, Some(id) if unlinked.contains(&id)) {
            state.default_source = Some(NULL_SOURCE);
        }
    }

    /// Apply the host's reaction to endpoints unlinked since the last call.
    pub fn settle(&self) {
        Self::collect_orphans(&mut self.lock());
    }
}

impl Default for StubHost {
    fn default() -> Self {
        Self::new()
    }
}

impl HostServer for StubHost {
    fn create_sink(&self, spec: &EndpointSpec) -> Result<Arc<dyn HostSink>, HostError> {
        let mut state = self.lock();
        if state.refuse_endpoints {
            return Err(HostError::Refused {
                name: spec.name.clone(),
                reason: "endpoint creation disabled".to_string(),
            });
        }
        let id = EndpointId(state.next_endpoint);
        state.next_endpoint += 1;
        let sink = Arc::new(StubSink {
            core: EndpointCore::new(id, spec),
            level: Mutex::new(DEFAULT_RENDER_LEVEL),
            rendered_frames: AtomicU64::new(0),
            max_request: AtomicUsize::new(0),
        });
        state.sinks.push(Arc::clone(&sink));
        Ok(sink)
    }

    fn create_source(&self, spec: &EndpointSpec) -> Result<Arc<dyn HostSource>, HostError> {
        let mut state = self.lock();
        if state.refuse_endpoints {
            return Err(HostError::Refused {
                name: spec.name.clone(),
                reason: "endpoint creation disabled".to_string(),
            });
        }
        let id = EndpointId(state.next_endpoint);
        state.next_endpoint += 1;
        let source = Arc::new(StubSource {
            core: EndpointCore::new(id, spec),
            recorded: Mutex::new(Vec::new()),
            posted_frames: AtomicU64::new(0),
        });
        state.sources.push(Arc::clone(&source));
        Ok(source)
    }

    fn default_endpoint(&self, direction: Direction) -> Option<EndpointId> {
        let mut state = self.lock();
        Self::collect_orphans(&mut state);
        match direction {
            Direction::Output => state.default_sink,
            Direction::Input => state.default_source,
        }
    }

    fn set_default_endpoint(&self, direction: Direction, id: EndpointId) -> Result<(), HostError> {
        let mut state = self.lock();
        match Self::endpoint_state(&state, id) {
            Some((dir, endpoint_state))
                if dir == direction && endpoint_state != EndpointState::Unlinked => {}
            _ => return Err(HostError::UnknownEndpoint(id)),
        }
        match direction {
            Direction::Output => state.default_sink = Some(id),
            Direction::Input => state.default_source = Some(id),
        }
        Ok(())
    }

    fn move_stream(
        &self,
        stream: StreamId,
        direction: Direction,
        target: EndpointId,
    ) -> Result<(), HostError> {
        let mut state = self.lock();
        Self::collect_orphans(&mut state);
        match Self::endpoint_state(&state, target) {
            Some((dir, endpoint_state))
                if dir == direction && endpoint_state != EndpointState::Unlinked => {}
            _ => return Err(HostError::UnknownEndpoint(target)),
        }
        if state.failing_moves.contains(&stream) {
            return Err(HostError::MoveRejected { stream, target });
        }
        let entry = state
            .streams
            .get_mut(&stream)
            .ok_or(HostError::UnknownStream(stream))?;
        entry.location = Some(target);
        state.move_count += 1;
        Ok(())
    }

    fn streams(&self) -> Vec<StreamInfo> {
        self.lock().streams.values().map(|s| s.info.clone()).collect()
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::properties;

    fn spec(name: &str, direction: Direction) -> EndpointSpec {
        EndpointSpec {
            name: name.to_string(),
            direction,
            sample_spec: SampleSpec {
                rate: 48_000,
                channels: 2,
            },
            properties: PropertyList::new(),
        }
    }

    #[test]
    fn test_streams_start_on_default_endpoint() {
        let host = StubHost::new();
        let stream = host.add_stream(
            Direction::Output,
            2,
            &[(properties::APPLICATION_NAME, "player")],
        );
        assert_eq!(host.stream_location(stream.id), Some(NULL_SINK));
        assert_eq!(host.streams().len(), 1);
    }

    #[test]
    fn test_move_and_failure() {
        let host = StubHost::new();
        let stream = host.add_stream(Direction::Output, 2, &[]);
        let sink = host.create_sink(&spec("s", Direction::Output)).unwrap();

        host.move_stream(stream.id, Direction::Output, sink.id()).unwrap();
        assert_eq!(host.stream_location(stream.id), Some(sink.id()));

        host.fail_moves(stream.id, true);
        assert!(host
            .move_stream(stream.id, Direction::Output, NULL_SINK)
            .is_err());
        assert!(
            host.move_stream(stream.id, Direction::Input, NULL_SOURCE).is_err(),
            "direction mismatch must be rejected"
        );
    }

    #[test]
    fn test_unlink_rehomes_streams_and_default() {
        let host = StubHost::new();
        let sink = host.create_sink(&spec("s", Direction::Output)).unwrap();
        host.set_default_endpoint(Direction::Output, sink.id()).unwrap();
        let stream = host.add_stream(Direction::Output, 2, &[]);
        assert_eq!(host.stream_location(stream.id), Some(sink.id()));

        sink.unlink();
        host.settle();
        assert_eq!(host.stream_location(stream.id), Some(NULL_SINK));
        assert_eq!(host.default_endpoint(Direction::Output), Some(NULL_SINK));
    }

    #[test]
    fn test_sink_renders_level_and_source_records() {
        let host = StubHost::new();
        host.create_sink(&spec("s", Direction::Output)).unwrap();
        let stub = host.sink_by_name("s").unwrap();
        let mut out = [0.0f32; 8];
        stub.render(&mut out);
        assert!(out.iter().all(|s| *s == DEFAULT_RENDER_LEVEL));
        assert_eq!(stub.rendered_frames(), 4);

        host.create_source(&spec("r", Direction::Input)).unwrap();
        let source = host.source_by_name("r").unwrap();
        source.post(&[0.1, 0.2, 0.3, 0.4]);
        assert_eq!(source.posted_frames(), 2);
        assert_eq!(source.recorded().len(), 4);
    }

    #[test]
    fn test_refused_endpoints() {
        let host = StubHost::new();
        host.refuse_endpoints(true);
        let err = host.create_sink(&spec("s", Direction::Output)).err().unwrap();
        assert_eq!(err.subject(), "s");
    }
}
