//! In-memory graph server used for deterministic testing and the simulator.
//!
//! It simulates the pieces of a real server the bridge depends on: named
//! clients, port registration, physical ports, connections, latency ranges and
//! a frame clock. Cycles are driven explicitly with [`MockGraph::run_cycle`],
//! which invokes every active client's process handler on the calling thread.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{
    ErrorReporter, FrameTime, GraphBackend, GraphClient, GraphError, LatencyMode, LatencyRange,
    OpenOptions, PortFlow, PortId, ProcessCycle, ProcessHandler,
};

pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;
pub const DEFAULT_BUFFER_SIZE: u32 = 256;
pub const DEFAULT_PORT_LATENCY: u32 = 512;

struct ServerState {
    running: bool,
    library_ok: bool,
    clients: Vec<Arc<MockClient>>,
    physical_capture: Vec<String>,
    physical_playback: Vec<String>,
    connections: Vec<(String, String)>,
    refused_names: HashSet<String>,
    opens: Vec<OpenOptions>,
    error_reporter: Option<ErrorReporter>,
}

struct Shared {
    state: Mutex<ServerState>,
    frame_time: AtomicU32,
    buffer_size: AtomicU32,
    sample_rate: u32,
    port_latency: AtomicU32,
    capture_level: Mutex<f32>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ServerState> {
        // The mock never panics while holding the lock; recover the data if a
        // test thread did.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Deterministic in-process graph server.
#[derive(Clone)]
pub struct MockGraph {
    shared: Arc<Shared>,
}

impl MockGraph {
    /// Running server with two physical capture and two physical playback ports.
    pub fn new() -> Self {
        Self::with_physical_ports(2, 2)
    }

    pub fn with_physical_ports(capture: usize, playback: usize) -> Self {
        let state = ServerState {
            running: true,
            library_ok: true,
            clients: Vec::new(),
            physical_capture: (1..=capture).map(|i| format!("system:capture_{}", i)).collect(),
            physical_playback: (1..=playback)
                .map(|i| format!("system:playback_{}", i))
                .collect(),
            connections: Vec::new(),
            refused_names: HashSet::new(),
            opens: Vec::new(),
            error_reporter: None,
        };
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                frame_time: AtomicU32::new(0),
                buffer_size: AtomicU32::new(DEFAULT_BUFFER_SIZE),
                sample_rate: DEFAULT_SAMPLE_RATE,
                port_latency: AtomicU32::new(DEFAULT_PORT_LATENCY),
                capture_level: Mutex::new(0.25),
            }),
        }
    }

    /// Simulate a client library that cannot be loaded.
    pub fn set_library_available(&self, available: bool) {
        self.shared.lock().library_ok = available;
    }

    pub fn is_running(&self) -> bool {
        self.shared.lock().running
    }

    /// Bring the server (back) up. Existing clients are not restored.
    pub fn start_server(&self) {
        self.shared.lock().running = true;
    }

    /// Kill the server: every client is dropped and receives its shutdown callback.
    pub fn stop_server(&self) {
        let clients = {
            let mut state = self.shared.lock();
            state.running = false;
            state.connections.clear();
            std::mem::take(&mut state.clients)
        };
        for client in clients {
            client.server_shutdown();
        }
    }

    /// Refuse future opens of clients with this name (simulates a partial outage).
    pub fn refuse_client(&self, name: &str) {
        self.shared.lock().refused_names.insert(name.to_string());
    }

    pub fn allow_client(&self, name: &str) {
        self.shared.lock().refused_names.remove(name);
    }

    pub fn set_port_latency(&self, frames: u32) {
        self.shared.port_latency.store(frames, Ordering::SeqCst);
    }

    /// Value written into every capture port buffer on each cycle.
    pub fn set_capture_level(&self, level: f32) {
        *self
            .shared
            .capture_level
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = level;
    }

    /// Change the buffer size and notify every active client.
    pub fn set_buffer_size(&self, frames: u32) {
        self.shared.buffer_size.store(frames, Ordering::SeqCst);
        for client in self.clients() {
            client.notify_buffer_size(frames);
        }
    }

    /// Advance the frame clock without running a cycle.
    pub fn advance_frames(&self, frames: u32) {
        self.shared.frame_time.fetch_add(frames, Ordering::SeqCst);
    }

    pub fn frame_time(&self) -> FrameTime {
        self.shared.frame_time.load(Ordering::SeqCst)
    }

    /// Run one process cycle for every active client. Returns the clients processed.
    pub fn run_cycle(&self) -> usize {
        if !self.is_running() {
            return 0;
        }
        let frames = self.shared.buffer_size.load(Ordering::SeqCst);
        let frame_time = self.frame_time();
        let level = *self
            .shared
            .capture_level
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut processed = 0;
        for client in self.clients() {
            if client.run_cycle(frames, frame_time, level) {
                processed += 1;
            }
        }
        self.shared.frame_time.fetch_add(frames, Ordering::SeqCst);
        processed
    }

    pub fn clients(&self) -> Vec<Arc<MockClient>> {
        self.shared.lock().clients.clone()
    }

    pub fn client(&self, name: &str) -> Option<Arc<MockClient>> {
        self.shared
            .lock()
            .clients
            .iter()
            .find(|c| c.name == name)
            .cloned()
    }

    pub fn connections(&self) -> Vec<(String, String)> {
        self.shared.lock().connections.clone()
    }

    /// Options passed to every `open` call so far, oldest first.
    pub fn open_log(&self) -> Vec<OpenOptions> {
        self.shared.lock().opens.clone()
    }

    /// Forward a message to the installed error reporter. Returns false when
    /// none is installed.
    pub fn emit_error(&self, message: &str) -> bool {
        let reporter = self.shared.lock().error_reporter;
        match reporter {
            Some(report) => {
                report(message);
                true
            }
            None => false,
        }
    }

    fn unique_name(state: &ServerState, name: &str) -> String {
        if !state.clients.iter().any(|c| c.name == name) {
            return name.to_string();
        }
        (1..)
            .map(|i| format!("{}-{:02}", name, i))
            .find(|candidate| !state.clients.iter().any(|c| &c.name == candidate))
            .unwrap_or_else(|| name.to_string())
    }
}

impl Default for MockGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphBackend for MockGraph {
    fn open(&self, name: &str, options: &OpenOptions) -> Result<Arc<dyn GraphClient>, GraphError> {
        let mut state = self.shared.lock();
        state.opens.push(options.clone());
        if !state.library_ok {
            return Err(GraphError::LibraryUnavailable(
                "mock library disabled".to_string(),
            ));
        }
        if !state.running || state.refused_names.contains(name) {
            return Err(GraphError::ServerUnreachable(options.server_name.clone()));
        }

        let client = Arc::new(MockClient {
            name: Self::unique_name(&state, name),
            shared: Arc::clone(&self.shared),
            closed: AtomicBool::new(false),
            ports: Mutex::new(Vec::new()),
            handler: Mutex::new(None),
            buffers: Mutex::new(CycleBuffers::default()),
        });
        state.clients.push(Arc::clone(&client));
        Ok(client)
    }

    fn set_error_reporter(&self, reporter: ErrorReporter) {
        self.shared.lock().error_reporter = Some(reporter);
    }
}

struct MockPort {
    short_name: String,
    flow: PortFlow,
}

#[derive(Default)]
struct CycleBuffers {
    capture: Vec<Vec<f32>>,
    playback: Vec<Vec<f32>>,
}

/// One client of the mock server.
pub struct MockClient {
    name: String,
    shared: Arc<Shared>,
    closed: AtomicBool,
    ports: Mutex<Vec<MockPort>>,
    handler: Mutex<Option<Box<dyn ProcessHandler>>>,
    buffers: Mutex<CycleBuffers>,
}

impl MockClient {
    pub fn client_name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_active(&self) -> bool {
        self.lock_handler().is_some()
    }

    /// Short names of registered ports of one flow, in registration order.
    pub fn port_names(&self, flow: PortFlow) -> Vec<String> {
        self.lock_ports()
            .iter()
            .filter(|p| p.flow == flow)
            .map(|p| p.short_name.clone())
            .collect()
    }

    /// Copy of the playback buffers written during the last cycle.
    pub fn playback_snapshot(&self) -> Vec<Vec<f32>> {
        self.buffers
            .lock()
            .map(|b| b.playback.clone())
            .unwrap_or_default()
    }

    fn lock_ports(&self) -> MutexGuard<'_, Vec<MockPort>> {
        self.ports.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_handler(&self) -> MutexGuard<'_, Option<Box<dyn ProcessHandler>>> {
        self.handler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn run_cycle(&self, frames: u32, frame_time: FrameTime, level: f32) -> bool {
        if self.is_closed() {
            return false;
        }
        let mut handler = self.lock_handler();
        let Some(handler) = handler.as_mut() else {
            return false;
        };

        let (capture_count, playback_count) = {
            let ports = self.lock_ports();
            (
                ports.iter().filter(|p| p.flow == PortFlow::Input).count(),
                ports.iter().filter(|p| p.flow == PortFlow::Output).count(),
            )
        };

        let mut buffers = self
            .buffers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let n = frames as usize;
        buffers.capture.resize_with(capture_count, Vec::new);
        buffers.playback.resize_with(playback_count, Vec::new);
        for (c, buffer) in buffers.capture.iter_mut().enumerate() {
            buffer.clear();
            buffer.resize(n, level + c as f32 * 0.01);
        }
        for buffer in buffers.playback.iter_mut() {
            buffer.clear();
            buffer.resize(n, f32::NAN);
        }

        let CycleBuffers { capture, playback } = &mut *buffers;
        let capture_refs: Vec<&[f32]> = capture.iter().map(|b| b.as_slice()).collect();
        let mut playback_refs: Vec<&mut [f32]> =
            playback.iter_mut().map(|b| b.as_mut_slice()).collect();
        let mut cycle = ProcessCycle {
            frames,
            frame_time,
            capture: &capture_refs,
            playback: &mut playback_refs,
        };
        handler.process(&mut cycle);
        true
    }

    fn notify_buffer_size(&self, frames: u32) {
        if let Some(handler) = self.lock_handler().as_mut() {
            handler.buffer_size_changed(frames);
        }
    }

    fn server_shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let handler = self.lock_handler().take();
        if let Some(mut handler) = handler {
            handler.shutdown();
        }
    }

    fn ensure_open(&self) -> Result<(), GraphError> {
        if self.is_closed() {
            return Err(GraphError::ClientClosed(self.name.clone()));
        }
        Ok(())
    }
}

impl GraphClient for MockClient {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn sample_rate(&self) -> u32 {
        self.shared.sample_rate
    }

    fn buffer_size(&self) -> u32 {
        self.shared.buffer_size.load(Ordering::SeqCst)
    }

    fn frame_time(&self) -> FrameTime {
        self.shared.frame_time.load(Ordering::SeqCst)
    }

    fn activate(&self, handler: Box<dyn ProcessHandler>) -> Result<(), GraphError> {
        self.ensure_open()?;
        let mut slot = self.lock_handler();
        if slot.is_some() {
            return Err(GraphError::Activate(self.name.clone()));
        }
        let mut handler = handler;
        handler.thread_init();
        *slot = Some(handler);
        Ok(())
    }

    fn register_port(&self, name: &str, flow: PortFlow) -> Result<PortId, GraphError> {
        self.ensure_open()?;
        let mut ports = self.lock_ports();
        if ports.iter().any(|p| p.short_name == name) {
            return Err(GraphError::PortRegistration(format!("{}:{}", self.name, name)));
        }
        ports.push(MockPort {
            short_name: name.to_string(),
            flow,
        });
        Ok(PortId(ports.len() as u32 - 1))
    }

    fn port_name(&self, port: PortId) -> Option<String> {
        self.lock_ports()
            .get(port.0 as usize)
            .map(|p| format!("{}:{}", self.name, p.short_name))
    }

    fn latency_range(&self, _port: PortId, _mode: LatencyMode) -> LatencyRange {
        LatencyRange {
            min: self.buffer_size(),
            max: self.shared.port_latency.load(Ordering::SeqCst),
        }
    }

    fn physical_ports(&self, flow: PortFlow) -> Vec<String> {
        let state = self.shared.lock();
        match flow {
            PortFlow::Output => state.physical_capture.clone(),
            PortFlow::Input => state.physical_playback.clone(),
        }
    }

    fn connect(&self, source: &str, destination: &str) -> Result<(), GraphError> {
        self.ensure_open()?;
        let mut state = self.shared.lock();
        let known = |port: &str| {
            state.physical_capture.iter().any(|p| p == port)
                || state.physical_playback.iter().any(|p| p == port)
                || port.starts_with(&format!("{}:", self.name))
        };
        if !known(source) || !known(destination) {
            return Err(GraphError::Connect {
                source: source.to_string(),
                destination: destination.to_string(),
            });
        }
        state
            .connections
            .push((source.to_string(), destination.to_string()));
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Drop the handler outside the server lock; it owns transport endpoints.
        let handler = self.lock_handler().take();
        drop(handler);
        let prefix = format!("{}:", self.name);
        let mut state = self.shared.lock();
        state.clients.retain(|c| c.name != self.name);
        state
            .connections
            .retain(|(s, d)| !s.starts_with(&prefix) && !d.starts_with(&prefix));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingHandler {
        cycles: Arc<AtomicUsize>,
        shutdowns: Arc<AtomicUsize>,
    }

    impl ProcessHandler for CountingHandler {
        fn process(&mut self, cycle: &mut ProcessCycle<'_, '_>) {
            self.cycles.fetch_add(1, Ordering::SeqCst);
            for out in cycle.playback.iter_mut() {
                out.fill(0.5);
            }
        }

        fn shutdown(&mut self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting() -> (Box<CountingHandler>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let cycles = Arc::new(AtomicUsize::new(0));
        let shutdowns = Arc::new(AtomicUsize::new(0));
        (
            Box::new(CountingHandler {
                cycles: Arc::clone(&cycles),
                shutdowns: Arc::clone(&shutdowns),
            }),
            cycles,
            shutdowns,
        )
    }

    #[test]
    fn test_duplicate_client_names_are_made_unique() {
        let graph = MockGraph::new();
        let a = graph.open("player", &OpenOptions::default()).unwrap();
        let b = graph.open("player", &OpenOptions::default()).unwrap();
        assert_eq!(a.name(), "player");
        assert_eq!(b.name(), "player-01");
    }

    #[test]
    fn test_cycle_invokes_active_handlers() {
        let graph = MockGraph::new();
        let client = graph.open("c", &OpenOptions::default()).unwrap();
        client.register_port("left", PortFlow::Output).unwrap();
        let (handler, cycles, _) = counting();
        client.activate(handler).unwrap();

        assert_eq!(graph.run_cycle(), 1);
        assert_eq!(cycles.load(Ordering::SeqCst), 1);
        assert_eq!(graph.frame_time(), DEFAULT_BUFFER_SIZE);

        let snapshot = graph.client("c").unwrap().playback_snapshot();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot[0].iter().all(|s| *s == 0.5));
    }

    #[test]
    fn test_stop_server_notifies_and_rejects_opens() {
        let graph = MockGraph::new();
        let client = graph.open("c", &OpenOptions::default()).unwrap();
        let (handler, _, shutdowns) = counting();
        client.activate(handler).unwrap();

        graph.stop_server();
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
        assert!(matches!(
            graph.open("c", &OpenOptions::default()),
            Err(GraphError::ServerUnreachable(None))
        ));
        assert!(client.register_port("x", PortFlow::Input).is_err());
    }

    #[test]
    fn test_library_unavailable() {
        let graph = MockGraph::new();
        graph.set_library_available(false);
        assert!(matches!(
            graph.open("c", &OpenOptions::default()),
            Err(GraphError::LibraryUnavailable(_))
        ));
    }

    #[test]
    fn test_connect_records_known_ports_only() {
        let graph = MockGraph::new();
        let client = graph.open("c", &OpenOptions::default()).unwrap();
        let port = client.register_port("left", PortFlow::Output).unwrap();
        let full = client.port_name(port).unwrap();
        assert_eq!(full, "c:left");

        client.connect(&full, "system:playback_1").unwrap();
        assert!(client.connect(&full, "nowhere:in").is_err());
        assert_eq!(graph.connections().len(), 1);

        client.close();
        assert!(graph.connections().is_empty());
        assert!(graph.client("c").is_none());
    }
}
