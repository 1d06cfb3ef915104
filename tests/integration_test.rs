// Integration tests: the module driven end to end against the in-memory host
// and graph server with a manual clock.

use std::sync::Arc;
use std::time::{Duration, Instant};

use graph_bridge::graph::{MockGraph, PortFlow};
use graph_bridge::host::{properties, Direction, HookResult, HostServer, StreamInfo, StubHost};
use graph_bridge::recovery::{RECOVERY_BACKOFF, RECOVERY_INTERVAL};
use graph_bridge::timer::{ManualTimeSource, TimerKey};
use graph_bridge::{
    BridgeConfig, BridgeModule, BridgeState, LifecycleEvent, MergeMode, ModuleEvent, RouteOutcome,
};

struct Harness {
    host: Arc<StubHost>,
    graph: MockGraph,
    clock: Arc<ManualTimeSource>,
    module: BridgeModule,
}

impl Harness {
    fn new(config: BridgeConfig) -> Self {
        Self::with_graph(config, MockGraph::new())
    }

    fn with_graph(config: BridgeConfig, graph: MockGraph) -> Self {
        let host = Arc::new(StubHost::new());
        let clock = Arc::new(ManualTimeSource::new());
        let module = BridgeModule::init(
            host.clone(),
            Arc::new(graph.clone()),
            config,
            clock.clone(),
        )
        .expect("module init");
        Self {
            host,
            graph,
            clock,
            module,
        }
    }

    fn stream(&self, direction: Direction, channels: u32, app: &str, binary: &str, pid: &str) -> StreamInfo {
        self.host.add_stream(
            direction,
            channels,
            &[
                (properties::APPLICATION_NAME, app),
                (properties::APPLICATION_PROCESS_BINARY, binary),
                (properties::APPLICATION_PROCESS_ID, pid),
            ],
        )
    }

    fn ready(&mut self, stream: &StreamInfo) {
        self.module.dispatch(ModuleEvent::StreamReady(stream.clone()));
    }

    fn unlink(&mut self, stream: &StreamInfo) {
        self.host.remove_stream(stream.id);
        self.module.dispatch(ModuleEvent::StreamUnlink {
            stream: stream.id,
            direction: stream.direction,
        });
    }

    fn advance(&mut self, by: Duration) {
        self.clock.advance(by);
        self.module.poll();
    }
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn config(merge_mode: MergeMode) -> BridgeConfig {
    BridgeConfig {
        merge_mode,
        ..BridgeConfig::default()
    }
}

#[test]
fn test_merge_by_binary_shares_one_bridge() {
    let mut h = Harness::new(config(MergeMode::ByBinary));
    let first = h.stream(Direction::Output, 2, "Player Main", "player", "100");
    let second = h.stream(Direction::Output, 6, "Player Preview", "player", "101");
    h.ready(&first);
    h.ready(&second);

    assert_eq!(h.module.registry().len(), 2, "default bridge plus one");
    let id = h.module.registry().owner(first.id).unwrap();
    assert_eq!(h.module.registry().owner(second.id), Some(id));

    let bridge = h.module.registry().get(id).unwrap();
    assert_eq!(bridge.name(), "Player Main");
    assert_eq!(bridge.merge_key(), Some("player"));
    assert_eq!(bridge.channels(Direction::Output), Some(2));
    assert!(!bridge.has_endpoint(Direction::Input));
    assert_eq!(bridge.streams(Direction::Output).len(), 2);

    let sink = bridge.endpoint_id(Direction::Output);
    assert_eq!(h.host.stream_location(first.id), sink);
    assert_eq!(h.host.stream_location(second.id), sink);
}

#[test]
fn test_merged_streams_of_both_directions_keep_independent_endpoints() {
    let mut h = Harness::new(config(MergeMode::ByPid));
    let playback = h.stream(Direction::Output, 2, "Call", "voip", "55");
    let record = h.stream(Direction::Input, 1, "Call", "voip", "55");
    h.ready(&playback);
    h.graph.run_cycle();
    h.ready(&record);

    let id = h.module.registry().owner(playback.id).unwrap();
    assert_eq!(h.module.registry().owner(record.id), Some(id));
    let bridge = h.module.registry().get(id).unwrap();
    assert_eq!(bridge.channels(Direction::Output), Some(2));
    assert_eq!(bridge.channels(Direction::Input), Some(1));

    let client = h.graph.client("Call").unwrap();
    assert_eq!(client.port_names(PortFlow::Output), vec!["left", "right"]);
    assert_eq!(client.port_names(PortFlow::Input), vec!["in"]);
}

#[test]
fn test_zero_physical_ports_is_not_fatal() {
    let mut h = Harness::with_graph(config(MergeMode::ByPid), MockGraph::with_physical_ports(0, 0));
    let stream = h.stream(Direction::Output, 2, "Player", "player", "7");
    h.ready(&stream);

    let id = h.module.registry().owner(stream.id).expect("stream routed");
    let bridge = h.module.registry().get(id).unwrap();
    assert_eq!(bridge.state(), BridgeState::Active);
    assert_eq!(bridge.ports(Direction::Output).len(), 2);
    assert!(h.graph.connections().is_empty());
    assert!(h.module.is_connected());
}

#[test]
fn test_autoconnect_disabled_leaves_ports_unconnected() {
    let mut h = Harness::new(BridgeConfig {
        autoconnect: false,
        ..BridgeConfig::default()
    });
    let stream = h.stream(Direction::Output, 2, "Player", "player", "7");
    h.ready(&stream);
    assert!(h.graph.connections().is_empty());
}

#[test]
fn test_zero_delay_never_unloads() {
    let mut h = Harness::new(BridgeConfig {
        idle_unload_delay_secs: 0,
        ..BridgeConfig::default()
    });
    let stream = h.stream(Direction::Output, 2, "Player", "player", "7");
    h.ready(&stream);
    let id = h.module.registry().owner(stream.id).unwrap();

    h.unlink(&stream);
    assert!(!h.module.is_armed(TimerKey::IdleUnload(id)));
    h.advance(Duration::from_secs(3600));
    let bridge = h.module.registry().get(id).expect("bridge survives");
    assert!(bridge.is_idle());

    h.module.shutdown();
    assert!(h.module.registry().is_empty(), "removed at shutdown");
}

#[test]
fn test_idle_teardown_happens_once_and_reattach_cancels_it() {
    let mut h = Harness::new(config(MergeMode::ByPid));
    let mut lifecycle = h.module.subscribe();

    let first = h.stream(Direction::Output, 2, "Player", "player", "7");
    h.ready(&first);
    let id = h.module.registry().owner(first.id).unwrap();
    h.unlink(&first);
    assert!(h.module.is_armed(TimerKey::IdleUnload(id)));

    h.advance(Duration::from_secs(3));
    let second = h.stream(Direction::Output, 2, "Player", "player", "7");
    h.ready(&second);
    assert_eq!(h.module.registry().owner(second.id), Some(id));
    assert!(!h.module.is_armed(TimerKey::IdleUnload(id)), "reattach cancels");

    h.advance(Duration::from_secs(10));
    assert!(h.module.registry().get(id).is_some());

    h.unlink(&second);
    h.advance(Duration::from_secs(5));
    assert!(h.module.registry().get(id).is_none());
    h.advance(Duration::from_secs(5));

    let mut unloaded = 0;
    while let Ok(event) = lifecycle.try_recv() {
        if event
            == (LifecycleEvent::BridgeUnloaded {
                bridge: id,
                name: "Player".to_string(),
            })
        {
            unloaded += 1;
        }
    }
    assert_eq!(unloaded, 1);
    assert!(h.graph.client("Player").is_none());
}

#[test]
fn test_default_bridge_is_persistent_and_receives_relocated_streams() {
    let mut h = Harness::new(config(MergeMode::ByPid));
    let default = h.module.default_bridge().unwrap();
    let default_sink = h
        .module
        .registry()
        .get(default)
        .unwrap()
        .endpoint_id(Direction::Output);
    assert_eq!(h.host.default_endpoint(Direction::Output), default_sink);

    h.module.schedule_unload(default);
    assert!(!h.module.is_armed(TimerKey::IdleUnload(default)));

    let stream = h.stream(Direction::Output, 2, "Player", "player", "7");
    h.ready(&stream);
    let id = h.module.registry().owner(stream.id).unwrap();
    assert!(h.module.unload(id));
    assert_eq!(h.host.stream_location(stream.id), default_sink);
    assert!(h.module.registry().get(default).is_some());
}

#[test]
fn test_dont_move_streams_are_left_alone() {
    let mut h = Harness::new(config(MergeMode::ByPid));
    let stream = h.stream(Direction::Output, 2, "Pinned", "pinned", "9");
    h.host.pin_stream(stream.id);
    let location = h.host.stream_location(stream.id);

    let outcome = h
        .module
        .on_stream_ready(&h.host.stream(stream.id).unwrap())
        .unwrap();
    assert_eq!(outcome, RouteOutcome::Skipped);
    assert_eq!(h.host.stream_location(stream.id), location);
    assert_eq!(h.module.registry().len(), 1);
}

#[test]
fn test_move_failed_after_teardown_is_retried() {
    let mut h = Harness::new(config(MergeMode::ByPid));
    let stream = h.stream(Direction::Output, 2, "Player", "player", "7");
    h.ready(&stream);
    let id = h.module.registry().owner(stream.id).unwrap();

    h.host.fail_moves(stream.id, true);
    h.module.unload(id);
    h.host.fail_moves(stream.id, false);

    let result = h.module.dispatch(ModuleEvent::StreamMoveFailed {
        stream: stream.id,
        direction: Direction::Output,
    });
    assert_eq!(result, HookResult::Stop);
    assert_eq!(
        h.host.stream_location(stream.id),
        h.host.default_endpoint(Direction::Output)
    );
}

#[test]
fn test_move_failed_is_not_retried_while_host_shuts_down() {
    let mut h = Harness::new(config(MergeMode::ByPid));
    let stream = h.stream(Direction::Output, 2, "Player", "player", "7");
    h.ready(&stream);
    let id = h.module.registry().owner(stream.id).unwrap();

    h.host.fail_moves(stream.id, true);
    h.module.unload(id);
    h.host.begin_shutdown();
    h.host.fail_moves(stream.id, false);

    let result = h.module.on_move_failed(stream.id, Direction::Output);
    assert_eq!(result, HookResult::Continue);
}

#[test]
fn test_recovery_converges_and_audio_resumes() {
    let mut h = Harness::new(config(MergeMode::ByPid));
    let mut lifecycle = h.module.subscribe();
    let stream = h.stream(Direction::Output, 2, "Player", "player", "7");
    h.ready(&stream);
    let id = h.module.registry().owner(stream.id).unwrap();

    h.graph.run_cycle();
    let before = h.graph.client("Player").unwrap().playback_snapshot();
    assert!(before.iter().flatten().all(|s| *s == 0.5));

    h.graph.stop_server();
    h.module.poll();
    assert!(!h.module.is_connected());
    assert!(h.module.registry().iter().all(|b| !b.has_client()));
    assert_eq!(
        h.module.registry().get(id).unwrap().state(),
        BridgeState::Disconnected
    );
    assert_eq!(h.graph.run_cycle(), 0, "no audio while the server is gone");

    // First attempt while the server is still down backs off.
    h.advance(RECOVERY_INTERVAL);
    assert!(!h.module.is_connected());
    assert!(h.module.is_armed(TimerKey::Recovery));

    h.graph.start_server();
    h.advance(RECOVERY_BACKOFF);
    assert!(h.module.is_connected());
    assert!(!h.module.is_armed(TimerKey::Recovery));
    assert_eq!(
        h.module.registry().get(id).unwrap().state(),
        BridgeState::Active
    );

    assert_eq!(h.graph.run_cycle(), 2);
    let after = h.graph.client("Player").unwrap().playback_snapshot();
    assert!(after.iter().flatten().all(|s| *s == 0.5), "audio after reconnect");
    assert_eq!(h.graph.connections().len(), 6, "default and player ports rewired");

    let mut seen = Vec::new();
    while let Ok(event) = lifecycle.try_recv() {
        if matches!(
            event,
            LifecycleEvent::GraphDisconnected | LifecycleEvent::GraphReconnected { .. }
        ) {
            seen.push(event);
        }
    }
    assert_eq!(
        seen,
        vec![
            LifecycleEvent::GraphDisconnected,
            LifecycleEvent::GraphReconnected { attempts: 2 },
        ]
    );
}

#[test]
fn test_streams_routed_while_disconnected_get_ports_on_recovery() {
    let mut h = Harness::new(config(MergeMode::ByPid));
    h.graph.stop_server();
    h.module.poll();

    let stream = h.stream(Direction::Output, 2, "Late", "late", "8");
    h.ready(&stream);
    let id = h.module.registry().owner(stream.id).unwrap();
    assert!(h.module.registry().get(id).unwrap().ports(Direction::Output).is_empty());

    h.graph.start_server();
    h.advance(RECOVERY_INTERVAL);
    assert!(h.module.is_connected());
    assert_eq!(h.module.registry().get(id).unwrap().ports(Direction::Output).len(), 2);
}

#[test]
fn test_latency_is_bounded_and_frozen_while_disconnected() {
    let mut h = Harness::new(config(MergeMode::ByPid));
    let stream = h.stream(Direction::Output, 2, "Player", "player", "7");
    h.ready(&stream);
    let id = h.module.registry().owner(stream.id).unwrap();
    h.graph.run_cycle();

    // 512 frames of port latency plus one 256 frame period at 48 kHz.
    let bound = 16_000;
    let connected = h.module.latency(id, Direction::Output).unwrap().unwrap();
    assert!(connected <= bound, "{} exceeds {}", connected, bound);
    assert_eq!(h.module.latency(id, Direction::Input).unwrap(), None);

    h.graph.stop_server();
    h.module.poll();
    h.graph.advance_frames(48_000);
    let frozen = h.module.latency(id, Direction::Output).unwrap().unwrap();
    assert_eq!(frozen, connected);
}

#[test]
fn test_capture_reaches_the_default_source() {
    let h = Harness::new(BridgeConfig::default());
    let default = h.module.default_bridge().unwrap();
    let source_id = h
        .module
        .registry()
        .get(default)
        .unwrap()
        .endpoint_id(Direction::Input)
        .unwrap();
    let source = h.host.source(source_id).unwrap();

    for _ in 0..4 {
        h.graph.run_cycle();
    }
    assert!(wait_until(|| source.posted_frames() == 4 * 256));
}

#[test]
fn test_buffer_size_change_updates_max_request() {
    let h = Harness::new(BridgeConfig::default());
    let default = h.module.default_bridge().unwrap();
    let sink_id = h
        .module
        .registry()
        .get(default)
        .unwrap()
        .endpoint_id(Direction::Output)
        .unwrap();
    let sink = h.host.sink(sink_id).unwrap();
    assert_eq!(sink.max_request(), 256 * 8);

    h.graph.set_buffer_size(1024);
    assert!(wait_until(|| sink.max_request() == 1024 * 8));
}

#[test]
fn test_endpoint_properties_carry_client_identity() {
    let mut user = graph_bridge::host::PropertyList::new();
    user.insert("device.icon_name".to_string(), "audio-card".to_string());
    let mut h = Harness::new(BridgeConfig {
        server_name: Some("studio".to_string()),
        sink_properties: user,
        ..BridgeConfig::default()
    });
    let stream = h.stream(Direction::Output, 2, "Player", "player", "7");
    h.ready(&stream);

    let sink = h.host.sink_by_name("jack_out.Player").unwrap();
    let props = sink.properties();
    assert_eq!(props[properties::DEVICE_DESCRIPTION], "Jack (Player)");
    assert_eq!(props[properties::JACK_REF], "7");
    assert_eq!(props[properties::DEVICE_STRING], "studio");
    assert_eq!(props["device.icon_name"], "audio-card");
}
