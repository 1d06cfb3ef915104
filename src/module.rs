//! Top-level module object living on the host's main control thread.
//!
//! Host hooks, graph shutdown notifications and management-thread failures
//! arrive as [`ModuleEvent`]s and are handled one at a time by
//! [`BridgeModule::dispatch`]. Timers (idle unload, recovery) are kept in a
//! [`TimerQueue`] against the host's clock and fired from [`BridgeModule::poll`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::bridge::{BridgeContext, BridgeId, BridgeSnapshot};
use crate::config::BridgeConfig;
use crate::error::{log_bridge_error, log_config_error, BridgeError};
use crate::events::{LifecycleBroadcaster, LifecycleEvent, ModuleEvent};
use crate::graph::{report_graph_error, GraphBackend};
use crate::host::{Direction, HookResult, HostServer, StreamId, StreamInfo};
use crate::recovery::RecoveryState;
use crate::registry::{BridgeRegistry, RouteOutcome};
use crate::timer::{TimeSource, TimerKey, TimerQueue};

/// Serializable view of the whole module.
#[derive(Debug, Clone, Serialize)]
pub struct ModuleSnapshot {
    pub connected: bool,
    pub epoch: u64,
    pub default_bridge: Option<BridgeId>,
    pub bridges: Vec<BridgeSnapshot>,
}

pub struct BridgeModule {
    ctx: BridgeContext,
    registry: BridgeRegistry,
    recovery: RecoveryState,
    timers: TimerQueue,
    clock: Arc<dyn TimeSource>,
    events: mpsc::Receiver<ModuleEvent>,
    default_bridge: Option<BridgeId>,
    /// Streams moved to the default endpoint by a teardown
    relocated: HashMap<StreamId, Direction>,
    shut_down: bool,
}

impl BridgeModule {
    /// Load the module: validate the configuration, create the default bridge
    /// and, if configured, route the streams that already exist.
    ///
    /// Fails on invalid configuration, a graph client library that cannot be
    /// used at all, or a host that refuses to create endpoints.
    pub fn init(
        host: Arc<dyn HostServer>,
        graph: Arc<dyn GraphBackend>,
        config: BridgeConfig,
        clock: Arc<dyn TimeSource>,
    ) -> Result<Self, BridgeError> {
        if let Err(err) = config.validate() {
            log_config_error(&err, "BridgeModule::init");
            return Err(err.into());
        }
        graph.set_error_reporter(report_graph_error);

        let (events_tx, events_rx) = mpsc::channel();
        let connected = Arc::new(AtomicBool::new(true));
        let epoch = Arc::new(AtomicU64::new(0));
        let ctx = BridgeContext {
            host,
            graph,
            config: Arc::new(config),
            connected: Arc::clone(&connected),
            epoch: Arc::clone(&epoch),
            events: events_tx,
            lifecycle: LifecycleBroadcaster::new(),
        };

        let mut module = Self {
            ctx,
            registry: BridgeRegistry::new(),
            recovery: RecoveryState::new(connected, epoch),
            timers: TimerQueue::new(),
            clock,
            events: events_rx,
            default_bridge: None,
            relocated: HashMap::new(),
            shut_down: false,
        };

        module.create_default_bridge()?;
        if module.ctx.config.prepare_existing {
            for stream in module.ctx.host.streams() {
                if let Err(err) = module.on_stream_ready(&stream) {
                    if err.is_fatal() {
                        return Err(err);
                    }
                    log_bridge_error(&err, "BridgeModule::init");
                }
            }
        }
        tracing::info!(
            "[Module] Loaded with {} bridge(s), merge mode {:?}",
            module.registry.len(),
            module.ctx.config.merge_mode
        );
        Ok(module)
    }

    fn create_default_bridge(&mut self) -> Result<(), BridgeError> {
        let name = self.ctx.config.default_bridge_name.clone();
        let id = self.registry.create_bridge(&self.ctx, &name, None, true)?;
        self.default_bridge = Some(id);

        let Some(bridge) = self.registry.get_mut(id) else {
            return Err(BridgeError::UnknownBridge { id: id.0 });
        };
        for direction in Direction::ALL {
            bridge.add_endpoint(&self.ctx, direction, 0)?;
            let Some(endpoint) = bridge.endpoint_id(direction) else {
                continue;
            };
            if let Err(err) = self.ctx.host.set_default_endpoint(direction, endpoint) {
                tracing::warn!("[Module] Could not make '{}' the default {}: {}", name, direction, err);
            }
        }
        self.check_connectivity();
        Ok(())
    }

    /// The default bridge failed and was torn down: build a fresh one and
    /// hand it the streams the teardown left behind.
    fn replace_default_bridge(&mut self) {
        tracing::warn!("[Module] Default bridge lost, recreating it");
        if let Err(err) = self.create_default_bridge() {
            log_bridge_error(&err, "BridgeModule::replace_default_bridge");
            return;
        }
        let moved: Vec<StreamId> = self
            .relocated
            .iter()
            .filter_map(|(stream, direction)| {
                let target = self.ctx.host.default_endpoint(*direction)?;
                self.ctx.host.move_stream(*stream, *direction, target).ok()?;
                Some(*stream)
            })
            .collect();
        for stream in moved {
            self.relocated.remove(&stream);
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.ctx.config
    }

    pub fn registry(&self) -> &BridgeRegistry {
        &self.registry
    }

    pub fn default_bridge(&self) -> Option<BridgeId> {
        self.default_bridge
    }

    pub fn is_connected(&self) -> bool {
        self.recovery.is_connected()
    }

    /// Whether a timer of this kind is pending.
    pub fn is_armed(&self, key: TimerKey) -> bool {
        self.timers.is_armed(key)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.ctx.lifecycle.subscribe()
    }

    /// Sender for host hooks delivered from other threads.
    pub fn event_sender(&self) -> mpsc::Sender<ModuleEvent> {
        self.ctx.events.clone()
    }

    /// Handle one event. Returns whether a hook should stop propagating.
    pub fn dispatch(&mut self, event: ModuleEvent) -> HookResult {
        match event {
            ModuleEvent::StreamReady(stream) => {
                if let Err(err) = self.on_stream_ready(&stream) {
                    log_bridge_error(&err, "BridgeModule::dispatch");
                }
                HookResult::Continue
            }
            ModuleEvent::StreamUnlink { stream, .. } => {
                self.on_stream_unlink(stream);
                HookResult::Continue
            }
            ModuleEvent::StreamMoveFailed { stream, direction } => {
                self.on_move_failed(stream, direction)
            }
            ModuleEvent::GraphShutdown { bridge, epoch } => {
                tracing::debug!("[Module] Graph shut down client of bridge {}", bridge);
                let delay = self
                    .recovery
                    .on_graph_shutdown(epoch, &self.ctx, &mut self.registry);
                self.arm_recovery(delay);
                HookResult::Continue
            }
            ModuleEvent::BridgeFailed { bridge, error } => {
                log_bridge_error(&error, "management thread");
                let was_default = self.default_bridge == Some(bridge);
                if self.unload(bridge) && was_default {
                    self.replace_default_bridge();
                }
                HookResult::Continue
            }
        }
    }

    /// Route a stream that became ready.
    pub fn on_stream_ready(&mut self, stream: &StreamInfo) -> Result<RouteOutcome, BridgeError> {
        let outcome = self.registry.route_stream(&self.ctx, stream)?;
        match outcome {
            RouteOutcome::Attached { bridge, created } => {
                if self.timers.cancel(TimerKey::IdleUnload(bridge)) {
                    tracing::debug!("[Module] Pending unload of bridge {} cancelled", bridge);
                }
                self.relocated.remove(&stream.id);
                if created {
                    self.check_connectivity();
                }
            }
            RouteOutcome::MoveFailed { bridge, created } => {
                if created {
                    self.check_connectivity();
                }
                if self.registry.get(bridge).is_some_and(|b| b.is_idle()) {
                    self.schedule_unload(bridge);
                }
            }
            RouteOutcome::Skipped => {}
        }
        Ok(outcome)
    }

    /// A stream is going away: detach it and arm its bridge's idle timer.
    pub fn on_stream_unlink(&mut self, stream: StreamId) -> Option<BridgeId> {
        self.relocated.remove(&stream);
        let bridge = self.registry.unlink_stream(&self.ctx, stream)?;
        self.schedule_unload(bridge);
        Some(bridge)
    }

    /// Retry moving a stream a teardown relocated. Stops propagation when the
    /// retry succeeds.
    pub fn on_move_failed(&mut self, stream: StreamId, direction: Direction) -> HookResult {
        if !self.relocated.contains_key(&stream) || self.ctx.host.is_shutting_down() {
            return HookResult::Continue;
        }
        let Some(target) = self.ctx.host.default_endpoint(direction) else {
            return HookResult::Continue;
        };
        match self.ctx.host.move_stream(stream, direction, target) {
            Ok(()) => {
                tracing::info!("[Module] Stream {} moved to default after failed move", stream.0);
                self.relocated.remove(&stream);
                HookResult::Stop
            }
            Err(err) => {
                tracing::warn!("[Module] Retry of stream {} failed: {}", stream.0, err);
                HookResult::Continue
            }
        }
    }

    /// Non-forced unload: (re)arm the idle timer unless unloading is disabled
    /// or the bridge is persistent.
    pub fn schedule_unload(&mut self, bridge: BridgeId) {
        let Some(delay) = self.ctx.config.idle_unload_delay() else {
            return;
        };
        if self.registry.get(bridge).map_or(true, |b| b.is_persistent()) {
            return;
        }
        let deadline = self.clock.now() + delay;
        self.timers.arm(TimerKey::IdleUnload(bridge), deadline);
    }

    /// Forced unload of one bridge.
    pub fn unload(&mut self, bridge: BridgeId) -> bool {
        self.timers.cancel(TimerKey::IdleUnload(bridge));
        let Some(relocated) = self.registry.remove(&self.ctx, bridge) else {
            return false;
        };
        self.relocated.extend(relocated);
        if self.default_bridge == Some(bridge) {
            self.default_bridge = None;
        }
        true
    }

    /// Latency of one endpoint of a bridge, in microseconds.
    pub fn latency(&self, bridge: BridgeId, direction: Direction) -> Result<Option<u64>, BridgeError> {
        self.registry
            .get(bridge)
            .ok_or(BridgeError::UnknownBridge { id: bridge.0 })?
            .query_latency(direction)
    }

    /// Drain pending events, then fire expired timers. Returns the number of
    /// items handled.
    pub fn poll(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events.try_recv() {
            self.dispatch(event);
            handled += 1;
        }
        for key in self.timers.expired(self.clock.now()) {
            self.fire(key);
            handled += 1;
        }
        handled
    }

    /// Wait up to `timeout` for an event or the next timer, then poll.
    pub fn poll_timeout(&mut self, timeout: Duration) -> usize {
        let now = self.clock.now();
        let wait = self
            .timers
            .next_deadline()
            .map(|deadline| deadline.saturating_sub(now).min(timeout))
            .unwrap_or(timeout);
        let mut handled = 0;
        if let Ok(event) = self.events.recv_timeout(wait) {
            self.dispatch(event);
            handled += 1;
        }
        handled + self.poll()
    }

    fn fire(&mut self, key: TimerKey) {
        match key {
            TimerKey::IdleUnload(bridge) => {
                let Some(idle) = self.registry.get(bridge).map(|b| b.is_idle()) else {
                    return;
                };
                if idle {
                    tracing::info!("[Module] Bridge {} idle, unloading", bridge);
                    self.unload(bridge);
                } else {
                    self.schedule_unload(bridge);
                }
            }
            TimerKey::Recovery => {
                let delay = self.recovery.attempt(&self.ctx, &mut self.registry);
                self.arm_recovery(delay);
            }
        }
    }

    fn arm_recovery(&mut self, delay: Option<Duration>) {
        if let Some(delay) = delay {
            let deadline = self.clock.now() + delay;
            self.timers.arm(TimerKey::Recovery, deadline);
        }
    }

    /// Keep "every bridge has a client while connected": a bridge that could
    /// not open its client sends the whole process into recovery.
    fn check_connectivity(&mut self) {
        if !self.recovery.is_connected() || self.registry.iter().all(|b| b.has_client()) {
            return;
        }
        tracing::warn!("[Module] Graph server not reachable, entering recovery");
        let delay = self.recovery.connection_lost(&self.ctx, &mut self.registry);
        self.arm_recovery(delay);
    }

    pub fn snapshot(&self) -> ModuleSnapshot {
        ModuleSnapshot {
            connected: self.recovery.is_connected(),
            epoch: self.recovery.epoch(),
            default_bridge: self.default_bridge,
            bridges: self.registry.iter().map(|b| b.snapshot()).collect(),
        }
    }

    /// Forced unload of every bridge, newest first. Idempotent.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        let mut ids = self.registry.ids();
        ids.reverse();
        for id in ids {
            self.unload(id);
        }
        self.timers = TimerQueue::new();
        tracing::info!("[Module] Unloaded");
    }
}

impl Drop for BridgeModule {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MergeMode;
    use crate::graph::MockGraph;
    use crate::host::{properties, EndpointId, StubHost};
    use crate::timer::ManualTimeSource;

    struct Fixture {
        host: Arc<StubHost>,
        graph: MockGraph,
        clock: Arc<ManualTimeSource>,
        module: BridgeModule,
    }

    fn fixture(config: BridgeConfig) -> Fixture {
        let host = Arc::new(StubHost::new());
        let graph = MockGraph::new();
        let clock = Arc::new(ManualTimeSource::new());
        let module = BridgeModule::init(
            host.clone(),
            Arc::new(graph.clone()),
            config,
            clock.clone(),
        )
        .unwrap();
        Fixture {
            host,
            graph,
            clock,
            module,
        }
    }

    fn app_stream(host: &StubHost, pid: &str) -> StreamInfo {
        host.add_stream(
            Direction::Output,
            2,
            &[
                (properties::APPLICATION_NAME, "Player"),
                (properties::APPLICATION_PROCESS_ID, pid),
            ],
        )
    }

    #[test]
    fn test_init_creates_default_bridge() {
        let f = fixture(BridgeConfig::default());
        let id = f.module.default_bridge().unwrap();
        let bridge = f.module.registry().get(id).unwrap();
        assert_eq!(bridge.name(), "pulseaudio");
        assert!(bridge.is_persistent());
        assert_eq!(
            f.host.default_endpoint(Direction::Output),
            bridge.endpoint_id(Direction::Output)
        );
        assert_eq!(
            f.host.default_endpoint(Direction::Input),
            bridge.endpoint_id(Direction::Input)
        );
        assert!(f.module.is_connected());
    }

    #[test]
    fn test_init_rejects_invalid_config() {
        let config = BridgeConfig {
            default_channels: 0,
            ..BridgeConfig::default()
        };
        let result = BridgeModule::init(
            Arc::new(StubHost::new()),
            Arc::new(MockGraph::new()),
            config,
            Arc::new(ManualTimeSource::new()),
        );
        assert!(matches!(result, Err(BridgeError::InvalidConfig { .. })));
    }

    #[test]
    fn test_init_fails_without_graph_library() {
        let graph = MockGraph::new();
        graph.set_library_available(false);
        let result = BridgeModule::init(
            Arc::new(StubHost::new()),
            Arc::new(graph),
            BridgeConfig::default(),
            Arc::new(ManualTimeSource::new()),
        );
        assert!(matches!(result, Err(BridgeError::LibraryUnavailable { .. })));
    }

    #[test]
    fn test_prepare_existing_routes_streams() {
        let host = Arc::new(StubHost::new());
        let stream = app_stream(&host, "7");
        let module = BridgeModule::init(
            host.clone(),
            Arc::new(MockGraph::new()),
            BridgeConfig::default(),
            Arc::new(ManualTimeSource::new()),
        )
        .unwrap();
        assert_eq!(module.registry().len(), 2);
        assert!(module.registry().owner(stream.id).is_some());
    }

    #[test]
    fn test_prepare_existing_disabled() {
        let host = Arc::new(StubHost::new());
        let stream = app_stream(&host, "7");
        let config = BridgeConfig {
            prepare_existing: false,
            ..BridgeConfig::default()
        };
        let module = BridgeModule::init(
            host.clone(),
            Arc::new(MockGraph::new()),
            config,
            Arc::new(ManualTimeSource::new()),
        )
        .unwrap();
        assert_eq!(module.registry().len(), 1);
        assert!(module.registry().owner(stream.id).is_none());
    }

    #[test]
    fn test_idle_unload_after_delay() {
        let mut f = fixture(BridgeConfig::default());
        let stream = app_stream(&f.host, "7");
        f.module.dispatch(ModuleEvent::StreamReady(stream.clone()));
        let bridge = f.module.registry().owner(stream.id).unwrap();

        f.module.dispatch(ModuleEvent::StreamUnlink {
            stream: stream.id,
            direction: Direction::Output,
        });
        assert!(f.module.is_armed(TimerKey::IdleUnload(bridge)));

        f.clock.advance(Duration::from_secs(4));
        f.module.poll();
        assert!(f.module.registry().get(bridge).is_some());

        f.clock.advance(Duration::from_secs(1));
        f.module.poll();
        assert!(f.module.registry().get(bridge).is_none());
    }

    #[test]
    fn test_move_failed_retry_only_for_relocated_streams() {
        let mut f = fixture(BridgeConfig {
            merge_mode: MergeMode::ByPid,
            ..BridgeConfig::default()
        });
        let stream = app_stream(&f.host, "7");
        assert_eq!(
            f.module.on_move_failed(stream.id, Direction::Output),
            HookResult::Continue,
            "never relocated"
        );

        f.module.on_stream_ready(&stream).unwrap();
        let bridge = f.module.registry().owner(stream.id).unwrap();
        f.host.fail_moves(stream.id, true);
        assert!(f.module.unload(bridge));

        f.host.fail_moves(stream.id, false);
        assert_eq!(
            f.module.on_move_failed(stream.id, Direction::Output),
            HookResult::Stop
        );
        assert_eq!(
            f.host.stream_location(stream.id),
            f.host.default_endpoint(Direction::Output)
        );
    }

    #[test]
    fn test_bridge_failure_unloads_bridge() {
        let mut f = fixture(BridgeConfig::default());
        let stream = app_stream(&f.host, "7");
        f.module.on_stream_ready(&stream).unwrap();
        let bridge = f.module.registry().owner(stream.id).unwrap();

        f.module.event_sender()
            .send(ModuleEvent::BridgeFailed {
                bridge,
                error: BridgeError::Overrun {
                    bridge: "Player".to_string(),
                },
            })
            .unwrap();
        f.module.poll();
        assert!(f.module.registry().get(bridge).is_none());
        assert_eq!(
            f.host.stream_location(stream.id),
            f.host.default_endpoint(Direction::Output)
        );
    }

    #[test]
    fn test_default_bridge_failure_recreates_it() {
        let mut f = fixture(BridgeConfig::default());
        let old = f.module.default_bridge().unwrap();

        f.module
            .event_sender()
            .send(ModuleEvent::BridgeFailed {
                bridge: old,
                error: BridgeError::Overrun {
                    bridge: "pulseaudio".to_string(),
                },
            })
            .unwrap();
        f.module.poll();

        assert!(f.module.registry().get(old).is_none());
        let new = f.module.default_bridge().expect("default bridge recreated");
        assert_ne!(new, old);
        let bridge = f.module.registry().get(new).unwrap();
        assert!(bridge.is_persistent());
        assert!(bridge.has_client());
        for direction in Direction::ALL {
            assert_eq!(
                f.host.default_endpoint(direction),
                bridge.endpoint_id(direction),
                "host default {}",
                direction
            );
        }

        // An app bridge unloaded afterwards hands its stream to the new sink.
        let stream = app_stream(&f.host, "7");
        f.module.on_stream_ready(&stream).unwrap();
        let app = f.module.registry().owner(stream.id).unwrap();
        assert!(f.module.unload(app));
        assert_eq!(
            f.host.stream_location(stream.id),
            bridge_endpoint(&f.module, new, Direction::Output)
        );
    }

    fn bridge_endpoint(
        module: &BridgeModule,
        id: BridgeId,
        direction: Direction,
    ) -> Option<EndpointId> {
        module.registry().get(id).and_then(|b| b.endpoint_id(direction))
    }

    #[test]
    fn test_init_installs_graph_error_reporter() {
        let f = fixture(BridgeConfig::default());
        assert!(f.graph.emit_error("server went away\nsecond line"));
        assert!(!MockGraph::new().emit_error("nobody listening"));
    }

    #[test]
    fn test_shutdown_unloads_everything_once() {
        let mut f = fixture(BridgeConfig::default());
        let stream = app_stream(&f.host, "7");
        f.module.on_stream_ready(&stream).unwrap();
        assert_eq!(f.graph.clients().len(), 2);

        f.module.shutdown();
        assert!(f.module.registry().is_empty());
        assert!(f.graph.clients().is_empty());
        f.module.shutdown();
    }
}
