//! Bridge: one graph client, at most one endpoint per direction, a management
//! thread and the streams attached to it.
//!
//! # Lifecycle
//! `created` (client open, no ports) -> `active` (ports registered) ->
//! `disconnected` (graph gone, waiting for recovery) -> `unloading` ->
//! `destroyed`. A bridge is driven from the main control thread only; its
//! management thread reads the client handle and the port table but never
//! changes them.
//!
//! # Teardown order
//! Attached streams are moved to the default endpoint, the host endpoints are
//! unlinked, the graph client is closed, the management thread is told to stop
//! and joined, and only then is the remaining state released.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, RwLock, RwLockWriteGuard};
use std::thread::{self, JoinHandle};

use serde::Serialize;

use crate::codec::MAX_CHANNELS;
use crate::config::BridgeConfig;
use crate::endpoint::{endpoint_properties, EndpointAdapter};
use crate::error::{log_bridge_error, BridgeError};
use crate::events::{LifecycleBroadcaster, LifecycleEvent, ModuleEvent};
use crate::graph::{self, GraphBackend, GraphClient, OpenOptions, PortFlow, PortId};
use crate::host::{Direction, EndpointId, EndpointSpec, HostServer, SampleSpec, StreamId};
use crate::transport::{self, ControlHandle, ControlMessage, Doorbell, TransportStats};

pub(crate) mod process;
mod worker;

use process::BridgeProcess;
use worker::Worker;

/// Sample rate assumed until a graph client reports the real one.
const FALLBACK_SAMPLE_RATE: u32 = 48_000;

/// Registry-assigned bridge identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct BridgeId(pub u32);

impl fmt::Display for BridgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeState {
    Created,
    Active,
    Disconnected,
    Unloading,
    Destroyed,
}

/// Endpoint slots of one bridge.
#[derive(Default)]
pub struct Endpoints {
    pub input: Option<EndpointAdapter>,
    pub output: Option<EndpointAdapter>,
}

impl Endpoints {
    pub fn get(&self, direction: Direction) -> Option<&EndpointAdapter> {
        match direction {
            Direction::Input => self.input.as_ref(),
            Direction::Output => self.output.as_ref(),
        }
    }

    fn slot(&mut self, direction: Direction) -> &mut Option<EndpointAdapter> {
        match direction {
            Direction::Input => &mut self.input,
            Direction::Output => &mut self.output,
        }
    }
}

/// State shared between a bridge and its management thread.
pub(crate) struct BridgeShared {
    pub(crate) name: String,
    pub(crate) endpoints: RwLock<Endpoints>,
    client: RwLock<Option<Arc<dyn GraphClient>>>,
    connected: Arc<AtomicBool>,
}

impl BridgeShared {
    fn client(&self) -> Option<Arc<dyn GraphClient>> {
        self.client
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn replace_client(
        &self,
        client: Option<Arc<dyn GraphClient>>,
    ) -> Option<Arc<dyn GraphClient>> {
        let mut slot = self.client.write().unwrap_or_else(|p| p.into_inner());
        std::mem::replace(&mut *slot, client)
    }

    fn write_endpoints(&self) -> Result<RwLockWriteGuard<'_, Endpoints>, BridgeError> {
        self.endpoints
            .write()
            .map_err(|_| BridgeError::LockPoisoned {
                component: format!("{} endpoints", self.name),
            })
    }

    /// Process-wide graph state is up and this bridge holds a client.
    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.client().is_some()
    }

    /// Latency of one endpoint; frozen while the graph is unreachable.
    pub(crate) fn latency(&self, direction: Direction) -> Option<u64> {
        let client = if self.connected.load(Ordering::SeqCst) {
            self.client()
        } else {
            None
        };
        let endpoints = self.endpoints.read().ok()?;
        endpoints
            .get(direction)
            .map(|endpoint| endpoint.latency(client.as_deref()))
    }
}

/// Everything a bridge needs from the module.
#[derive(Clone)]
pub struct BridgeContext {
    pub host: Arc<dyn HostServer>,
    pub graph: Arc<dyn GraphBackend>,
    pub config: Arc<BridgeConfig>,
    /// Recovery state: false while the graph is considered unreachable
    pub connected: Arc<AtomicBool>,
    /// Connection generation, bumped on every graph loss
    pub epoch: Arc<AtomicU64>,
    pub events: mpsc::Sender<ModuleEvent>,
    pub lifecycle: LifecycleBroadcaster,
}

/// Serializable view of one bridge.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BridgeSnapshot {
    pub id: BridgeId,
    pub name: String,
    pub client_name: Option<String>,
    pub merge_key: Option<String>,
    pub persistent: bool,
    pub state: BridgeState,
    pub connected: bool,
    pub input_channels: Option<u32>,
    pub output_channels: Option<u32>,
    pub input_streams: Vec<StreamId>,
    pub output_streams: Vec<StreamId>,
    pub overruns: u64,
    pub dropped_captures: u64,
}

/// Host endpoint name for one direction of a bridge.
pub fn endpoint_name(bridge: &str, direction: Direction) -> String {
    match direction {
        Direction::Output => format!("jack_out.{}", bridge),
        Direction::Input => format!("jack_in.{}", bridge),
    }
}

pub struct Bridge {
    id: BridgeId,
    name: String,
    merge_key: Option<String>,
    persistent: bool,
    state: BridgeState,
    sample_rate: u32,
    client_name: Option<String>,
    shared: Arc<BridgeShared>,
    control: ControlHandle,
    worker: Option<JoinHandle<()>>,
    bell: Arc<Doorbell>,
    stats: Arc<TransportStats>,
    streams_in: BTreeSet<StreamId>,
    streams_out: BTreeSet<StreamId>,
}

impl Bridge {
    /// Start the management thread and open a graph client named `name`.
    ///
    /// Only fatal errors are returned. An unreachable server leaves the
    /// bridge `disconnected` for the recovery state machine to pick up.
    pub fn create(
        ctx: &BridgeContext,
        id: BridgeId,
        name: &str,
        merge_key: Option<String>,
        persistent: bool,
    ) -> Result<Self, BridgeError> {
        let (control_tx, control_rx) = mpsc::channel();
        let bell = Arc::new(Doorbell::new());
        let stats = Arc::new(TransportStats::default());
        let shared = Arc::new(BridgeShared {
            name: name.to_string(),
            endpoints: RwLock::new(Endpoints::default()),
            client: RwLock::new(None),
            connected: Arc::clone(&ctx.connected),
        });

        let worker = Worker::new(
            id,
            Arc::clone(&shared),
            control_rx,
            Arc::clone(&bell),
            Arc::clone(&stats),
            ctx.events.clone(),
        );
        let handle = thread::Builder::new()
            .name(format!("bridge-{}", name))
            .spawn(move || worker.run())?;

        let mut bridge = Self {
            id,
            name: name.to_string(),
            merge_key,
            persistent,
            state: BridgeState::Created,
            sample_rate: FALLBACK_SAMPLE_RATE,
            client_name: None,
            shared,
            control: ControlHandle::new(control_tx, Arc::clone(&bell)),
            worker: Some(handle),
            bell,
            stats,
            streams_in: BTreeSet::new(),
            streams_out: BTreeSet::new(),
        };

        if ctx.connected.load(Ordering::SeqCst) {
            match bridge.connect_client(ctx, true) {
                Ok(()) => {}
                Err(err) if err.is_fatal() => {
                    log_bridge_error(&err, "Bridge::create");
                    bridge.stop_worker();
                    bridge.state = BridgeState::Destroyed;
                    return Err(err);
                }
                Err(err) => {
                    tracing::warn!(
                        "[Bridge:{}] Graph not reachable, waiting for recovery: {}",
                        bridge.name,
                        err
                    );
                    bridge.state = BridgeState::Disconnected;
                }
            }
        } else {
            bridge.state = BridgeState::Disconnected;
        }

        ctx.lifecycle.publish(LifecycleEvent::BridgeCreated {
            bridge: id,
            name: bridge.name.clone(),
            merge_key: bridge.merge_key.clone(),
        });
        Ok(bridge)
    }

    pub fn id(&self) -> BridgeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn merge_key(&self) -> Option<&str> {
        self.merge_key.as_deref()
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    /// Actual graph client name of the current connection.
    pub fn client_name(&self) -> Option<&str> {
        self.client_name.as_deref()
    }

    /// Whether this bridge currently holds a graph client.
    pub fn has_client(&self) -> bool {
        self.shared.client().is_some()
    }

    pub fn has_endpoint(&self, direction: Direction) -> bool {
        self.with_endpoint(direction, |_| ()).is_some()
    }

    pub fn endpoint_id(&self, direction: Direction) -> Option<EndpointId> {
        self.with_endpoint(direction, |endpoint| endpoint.id())
    }

    pub fn channels(&self, direction: Direction) -> Option<u32> {
        self.with_endpoint(direction, |endpoint| endpoint.channels())
    }

    /// Registered graph ports of one direction.
    pub fn ports(&self, direction: Direction) -> Vec<PortId> {
        self.with_endpoint(direction, |endpoint| endpoint.ports().to_vec())
            .unwrap_or_default()
    }

    fn with_endpoint<T>(
        &self,
        direction: Direction,
        f: impl FnOnce(&EndpointAdapter) -> T,
    ) -> Option<T> {
        let endpoints = self.shared.endpoints.read().ok()?;
        endpoints.get(direction).map(f)
    }

    pub fn streams(&self, direction: Direction) -> &BTreeSet<StreamId> {
        match direction {
            Direction::Input => &self.streams_in,
            Direction::Output => &self.streams_out,
        }
    }

    fn streams_mut(&mut self, direction: Direction) -> &mut BTreeSet<StreamId> {
        match direction {
            Direction::Input => &mut self.streams_in,
            Direction::Output => &mut self.streams_out,
        }
    }

    pub fn attach(&mut self, direction: Direction, stream: StreamId) -> bool {
        self.streams_mut(direction).insert(stream)
    }

    /// Remove a stream from whichever set holds it.
    pub fn detach(&mut self, stream: StreamId) -> Option<Direction> {
        Direction::ALL
            .into_iter()
            .find(|direction| self.streams_mut(*direction).remove(&stream))
    }

    /// No streams attached in either direction.
    pub fn is_idle(&self) -> bool {
        self.streams_in.is_empty() && self.streams_out.is_empty()
    }

    fn connect_client(&mut self, ctx: &BridgeContext, force: bool) -> Result<(), BridgeError> {
        let options = OpenOptions {
            server_name: ctx.config.server_name.clone(),
            no_start_server: !force,
        };
        let client = ctx.graph.open(&self.name, &options)?;
        let client_name = client.name();

        let block_len = client.buffer_size() as usize * MAX_CHANNELS;
        let (realtime, rings) = transport::channel(
            block_len,
            ctx.config.render_timeout(),
            Arc::clone(&self.bell),
            Arc::clone(&self.stats),
        );
        if let Err(err) = self.control.send(ControlMessage::Attach(Box::new(rings))) {
            client.close();
            return Err(err);
        }

        let handler = BridgeProcess::new(
            self.id,
            client_name.clone(),
            realtime,
            ctx.events.clone(),
            ctx.epoch.load(Ordering::SeqCst),
        );
        if let Err(err) = client.activate(Box::new(handler)) {
            client.close();
            return Err(BridgeError::ActivateFailed {
                name: client_name,
                reason: err.to_string(),
            });
        }

        tracing::info!(
            "[Bridge:{}] Connected as '{}' ({} Hz, {} frames)",
            self.name,
            client_name,
            client.sample_rate(),
            client.buffer_size()
        );
        self.sample_rate = client.sample_rate();
        self.client_name = Some(client_name);
        self.shared.replace_client(Some(client));
        Ok(())
    }

    /// Register one port per channel, then wire them to physical ports.
    fn register_ports(
        &self,
        client: &dyn GraphClient,
        direction: Direction,
        channels: u32,
        autoconnect: bool,
    ) -> Result<Vec<PortId>, BridgeError> {
        let flow = direction.port_flow();
        let channels = channels as usize;
        let mut ports = Vec::with_capacity(channels);
        for index in 0..channels {
            let name = graph::port_name(flow, index, channels);
            let port = client
                .register_port(&name, flow)
                .map_err(|err| BridgeError::PortRegisterFailed {
                    port: name.clone(),
                    reason: err.to_string(),
                })?;
            ports.push(port);
        }

        if autoconnect {
            self.autoconnect(client, flow, &ports);
        }
        Ok(ports)
    }

    /// Connect port N to the Nth physical port of the opposite flow. A
    /// shortage or a failed connect leaves the rest unconnected.
    fn autoconnect(&self, client: &dyn GraphClient, flow: PortFlow, ports: &[PortId]) {
        let physical = client.physical_ports(flow.physical_peer());
        for (index, port) in ports.iter().enumerate() {
            let Some(peer) = physical.get(index) else {
                tracing::info!(
                    "[Bridge:{}] Not enough physical ports, leaving {} port(s) unconnected",
                    self.name,
                    ports.len() - index
                );
                break;
            };
            let Some(own) = client.port_name(*port) else {
                break;
            };
            let (source, destination) = match flow {
                PortFlow::Output => (own.as_str(), peer.as_str()),
                PortFlow::Input => (peer.as_str(), own.as_str()),
            };
            tracing::info!("[Bridge:{}] Connecting {} to {}", self.name, source, destination);
            if let Err(err) = client.connect(source, destination) {
                tracing::warn!(
                    "[Bridge:{}] {}, leaving unconnected",
                    self.name,
                    err
                );
                break;
            }
        }
    }

    /// Give an endpoint fresh ports on `client` and publish its latency.
    fn wire_endpoint(&self, client: &dyn GraphClient, adapter: &mut EndpointAdapter, autoconnect: bool) {
        match self.register_ports(client, adapter.direction(), adapter.channels(), autoconnect) {
            Ok(ports) => adapter.set_ports(ports),
            Err(err) => log_bridge_error(&err, "Bridge::wire_endpoint"),
        }
        let latency = adapter.apply_fixed_latency(client);
        adapter.buffer_size_changed(client.buffer_size());
        tracing::debug!(
            "[Bridge:{}] {} endpoint fixed latency {} usec",
            self.name,
            adapter.direction(),
            latency
        );
    }

    /// Create the endpoint for `direction` unless it already exists.
    ///
    /// Returns false when the existing endpoint is reused. A zero channel
    /// count selects the configured default.
    pub fn add_endpoint(
        &mut self,
        ctx: &BridgeContext,
        direction: Direction,
        channels: u32,
    ) -> Result<bool, BridgeError> {
        if self.has_endpoint(direction) {
            return Ok(false);
        }

        let channels = match channels {
            0 => ctx.config.default_channels,
            n => n,
        }
        .min(MAX_CHANNELS as u32);
        let client_name = self
            .client_name
            .clone()
            .unwrap_or_else(|| self.name.clone());
        let user_properties = match direction {
            Direction::Output => &ctx.config.sink_properties,
            Direction::Input => &ctx.config.source_properties,
        };
        let spec = EndpointSpec {
            name: endpoint_name(&self.name, direction),
            direction,
            sample_spec: SampleSpec {
                rate: self.sample_rate,
                channels,
            },
            properties: endpoint_properties(
                &client_name,
                self.merge_key.as_deref(),
                ctx.config.server_name.as_deref(),
                user_properties,
            ),
        };

        let mut adapter = EndpointAdapter::create(ctx.host.as_ref(), &spec)?;
        if let Some(client) = self.shared.client() {
            self.wire_endpoint(client.as_ref(), &mut adapter, ctx.config.autoconnect);
        }
        *self.shared.write_endpoints()?.slot(direction) = Some(adapter);

        if self.state == BridgeState::Created {
            self.state = BridgeState::Active;
        }
        tracing::info!(
            "[Bridge:{}] Added {} endpoint with {} channel(s)",
            self.name,
            direction,
            channels
        );
        ctx.lifecycle.publish(LifecycleEvent::EndpointAdded {
            bridge: self.id,
            direction,
            channels,
        });
        Ok(true)
    }

    /// Forced unload. Returns the streams that were moved away so that a
    /// later move failure can be retried.
    pub fn teardown(&mut self, ctx: &BridgeContext) -> Vec<(StreamId, Direction)> {
        self.state = BridgeState::Unloading;
        tracing::info!("[Bridge:{}] Unloading", self.name);

        let mut relocated = Vec::new();
        for direction in Direction::ALL {
            let streams = std::mem::take(self.streams_mut(direction));
            if streams.is_empty() {
                continue;
            }
            let own = self.endpoint_id(direction);
            let target = ctx
                .host
                .default_endpoint(direction)
                .filter(|target| Some(*target) != own);
            for stream in streams {
                match target {
                    Some(target) => {
                        if let Err(err) = ctx.host.move_stream(stream, direction, target) {
                            tracing::warn!(
                                "[Bridge:{}] Failed to move stream {} to default: {}",
                                self.name,
                                stream.0,
                                err
                            );
                        }
                    }
                    None => tracing::warn!(
                        "[Bridge:{}] No default {} endpoint for stream {}",
                        self.name,
                        direction,
                        stream.0
                    ),
                }
                relocated.push((stream, direction));
            }
        }

        if let Ok(endpoints) = self.shared.endpoints.read() {
            for direction in Direction::ALL {
                if let Some(endpoint) = endpoints.get(direction) {
                    endpoint.unlink();
                }
            }
        }

        if let Some(client) = self.shared.replace_client(None) {
            client.close();
        }

        self.stop_worker();

        if let Ok(mut endpoints) = self.shared.endpoints.write() {
            *endpoints = Endpoints::default();
        }
        self.state = BridgeState::Destroyed;
        relocated
    }

    fn stop_worker(&mut self) {
        let Some(handle) = self.worker.take() else {
            return;
        };
        if let Err(err) = self.control.request(|ack| ControlMessage::Shutdown { ack }) {
            tracing::warn!("[Bridge:{}] Shutdown not acknowledged: {}", self.name, err);
        }
        if handle.join().is_err() {
            tracing::error!("[Bridge:{}] Management thread panicked", self.name);
        }
    }

    /// Graph went away: drop the client, keep the endpoints without ports.
    pub fn disconnect(&mut self) {
        if let Some(client) = self.shared.replace_client(None) {
            client.close();
        }
        if let Ok(mut endpoints) = self.shared.endpoints.write() {
            for direction in Direction::ALL {
                if let Some(endpoint) = endpoints.slot(direction).as_mut() {
                    endpoint.clear_ports();
                }
            }
        }
        if matches!(self.state, BridgeState::Created | BridgeState::Active) {
            self.state = BridgeState::Disconnected;
        }
    }

    /// Open a new client (without starting a server) and register fresh
    /// ports for every existing endpoint. A bridge that still holds a client
    /// is left alone.
    pub fn reconnect(&mut self, ctx: &BridgeContext) -> Result<(), BridgeError> {
        if self.has_client() {
            return Ok(());
        }
        self.connect_client(ctx, false)?;
        let Some(client) = self.shared.client() else {
            return Err(BridgeError::GraphUnavailable {
                server: ctx.config.server_name.clone(),
            });
        };

        let mut endpoints = self.shared.write_endpoints()?;
        let mut any_endpoint = false;
        for direction in Direction::ALL {
            if let Some(adapter) = endpoints.slot(direction).as_mut() {
                self.wire_endpoint(client.as_ref(), adapter, ctx.config.autoconnect);
                any_endpoint = true;
            }
        }
        drop(endpoints);

        self.state = if any_endpoint {
            BridgeState::Active
        } else {
            BridgeState::Created
        };
        Ok(())
    }

    /// Ask the management thread for the latency of one endpoint.
    pub fn query_latency(&self, direction: Direction) -> Result<Option<u64>, BridgeError> {
        self.control
            .request(|reply| ControlMessage::Latency { direction, reply })
    }

    pub fn snapshot(&self) -> BridgeSnapshot {
        BridgeSnapshot {
            id: self.id,
            name: self.name.clone(),
            client_name: self.client_name.clone(),
            merge_key: self.merge_key.clone(),
            persistent: self.persistent,
            state: self.state,
            connected: self.shared.is_connected(),
            input_channels: self.channels(Direction::Input),
            output_channels: self.channels(Direction::Output),
            input_streams: self.streams_in.iter().copied().collect(),
            output_streams: self.streams_out.iter().copied().collect(),
            overruns: self.stats.overruns(),
            dropped_captures: self.stats.dropped_captures(),
        }
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        if self.worker.is_some() {
            if let Some(client) = self.shared.replace_client(None) {
                client.close();
            }
            self.stop_worker();
        }
    }
}
