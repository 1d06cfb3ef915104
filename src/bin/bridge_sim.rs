use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use graph_bridge::graph::mock::{DEFAULT_BUFFER_SIZE, DEFAULT_SAMPLE_RATE};
use graph_bridge::graph::MockGraph;
use graph_bridge::host::{properties, Direction, StubHost};
use graph_bridge::timer::{ManualTimeSource, TimeSource};
use graph_bridge::{BridgeConfig, BridgeModule, LifecycleEvent, ModuleEvent, ModuleSnapshot};
use serde::Serialize;
use tokio::sync::broadcast::error::TryRecvError;

#[derive(Parser, Debug)]
#[command(
    name = "bridge_sim",
    about = "Drive the graph bridge against an in-memory host and graph server"
)]
struct Cli {
    /// JSON configuration file
    #[arg(long, conflicts_with = "args")]
    config: Option<PathBuf>,
    /// Module argument string, e.g. "connect=no merge=binary"
    #[arg(long)]
    args: Option<String>,
    /// Number of playback streams to start
    #[arg(long, default_value_t = 1)]
    streams: u32,
    /// Binary (and application) name of the simulated streams
    #[arg(long, default_value = "player")]
    binary: String,
    /// Graph cycles to run
    #[arg(long, default_value_t = 200)]
    cycles: u32,
    /// Stop the graph server before this cycle
    #[arg(long)]
    outage_at: Option<u32>,
    /// How long the server stays down, in milliseconds of simulated time
    #[arg(long, default_value_t = 500)]
    outage_ms: u64,
    /// Close every simulated stream before this cycle
    #[arg(long)]
    unlink_at: Option<u32>,
    /// Write what the default capture endpoint received to this WAV file
    #[arg(long)]
    capture_wav: Option<PathBuf>,
}

#[derive(Serialize)]
struct Report {
    cycles: u32,
    client_cycles: usize,
    outage: bool,
    stream_moves: u32,
    captured_frames: u64,
    overruns: u64,
    lifecycle: Vec<LifecycleEvent>,
    snapshot: ModuleSnapshot,
}

fn main() -> ExitCode {
    graph_bridge::init_logging();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::from(1)
        }
    }
}

fn load_config(cli: &Cli) -> Result<BridgeConfig> {
    let config = match (&cli.config, &cli.args) {
        (Some(path), _) => BridgeConfig::load_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        (None, Some(args)) => BridgeConfig::from_module_args(args)
            .with_context(|| format!("parsing module arguments '{args}'"))?,
        (None, None) => BridgeConfig::default(),
    };
    Ok(config)
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let host = Arc::new(StubHost::new());
    let graph = MockGraph::new();
    graph.set_capture_level(0.25);
    let clock = Arc::new(ManualTimeSource::new());
    let mut module = BridgeModule::init(
        host.clone(),
        Arc::new(graph.clone()),
        config,
        clock.clone(),
    )
    .context("loading bridge module")?;
    let mut lifecycle = module.subscribe();
    let mut events = Vec::new();

    let mut streams = Vec::new();
    for index in 0..cli.streams {
        let pid = (1000 + index).to_string();
        let stream = host.add_stream(
            Direction::Output,
            2,
            &[
                (properties::APPLICATION_NAME, cli.binary.as_str()),
                (properties::APPLICATION_PROCESS_BINARY, cli.binary.as_str()),
                (properties::APPLICATION_PROCESS_ID, pid.as_str()),
            ],
        );
        module.dispatch(ModuleEvent::StreamReady(stream.clone()));
        streams.push(stream);
    }

    let period = Duration::from_secs_f64(DEFAULT_BUFFER_SIZE as f64 / DEFAULT_SAMPLE_RATE as f64);
    let mut outage_until: Option<Duration> = None;
    let mut client_cycles = 0;
    for cycle in 0..cli.cycles {
        if cli.outage_at == Some(cycle) {
            tracing::info!("[Sim] Stopping graph server at cycle {}", cycle);
            graph.stop_server();
            outage_until = Some(clock.now() + Duration::from_millis(cli.outage_ms));
        }
        if matches!(outage_until, Some(until) if clock.now() >= until) {
            tracing::info!("[Sim] Restarting graph server at cycle {}", cycle);
            graph.start_server();
            outage_until = None;
        }
        if cli.unlink_at == Some(cycle) {
            for stream in streams.drain(..) {
                host.remove_stream(stream.id);
                module.dispatch(ModuleEvent::StreamUnlink {
                    stream: stream.id,
                    direction: stream.direction,
                });
            }
        }

        client_cycles += graph.run_cycle();
        clock.advance(period);
        module.poll();
        drain_lifecycle(&mut lifecycle, &mut events);
    }

    let default_source = module
        .default_bridge()
        .and_then(|id| module.registry().get(id))
        .and_then(|bridge| bridge.endpoint_id(Direction::Input))
        .and_then(|id| host.source(id));
    if let Some(source) = &default_source {
        wait_for_captures(|| source.posted_frames());
    }
    let captured_frames = default_source
        .as_ref()
        .map(|source| source.posted_frames())
        .unwrap_or(0);

    if let Some(path) = &cli.capture_wav {
        let Some(source) = &default_source else {
            bail!("no capture endpoint to record from");
        };
        let spec = source.sample_spec();
        write_wav(path, spec.channels as u16, spec.rate, &source.recorded())?;
    }

    let snapshot = module.snapshot();
    let report = Report {
        cycles: cli.cycles,
        client_cycles,
        outage: cli.outage_at.is_some(),
        stream_moves: host.move_count(),
        captured_frames,
        overruns: snapshot.bridges.iter().map(|b| b.overruns).sum(),
        lifecycle: events,
        snapshot,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    module.shutdown();
    Ok(())
}

fn drain_lifecycle(
    receiver: &mut tokio::sync::broadcast::Receiver<LifecycleEvent>,
    into: &mut Vec<LifecycleEvent>,
) {
    loop {
        match receiver.try_recv() {
            Ok(event) => into.push(event),
            Err(TryRecvError::Lagged(skipped)) => {
                tracing::warn!("[Sim] {} lifecycle event(s) skipped", skipped);
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
        }
    }
}

/// Capture posts are asynchronous; wait until the count stops moving.
fn wait_for_captures(posted: impl Fn() -> u64) {
    let deadline = Instant::now() + Duration::from_secs(1);
    let mut last = posted();
    while Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
        let now = posted();
        if now == last {
            break;
        }
        last = now;
    }
}

fn write_wav(path: &Path, channels: u16, sample_rate: u32, samples: &[f32]) -> Result<()> {
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(path, spec)
        .with_context(|| format!("creating {}", path.display()))?;
    for sample in samples {
        writer.write_sample(*sample)?;
    }
    writer
        .finalize()
        .with_context(|| format!("finalizing {}", path.display()))?;
    Ok(())
}
