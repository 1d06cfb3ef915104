// Management thread of one bridge
//
// Sleeps on the bridge's doorbell and, on every wake-up:
// 1. drains control messages from the main control thread (attach, latency,
//    shutdown)
// 2. drains the transport: answers render requests synchronously, hands
//    captured blocks to the host source, applies buffer-size changes
// 3. checks the realtime side's overrun counter
//
// When the loop fails it posts BridgeFailed upward and keeps answering until
// the shutdown message arrives.

use std::sync::mpsc::{self, TryRecvError};
use std::sync::{Arc, RwLockReadGuard};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::codec::MAX_CHANNELS;
use crate::error::{log_bridge_error, BridgeError};
use crate::events::ModuleEvent;
use crate::transport::block_pool::ensure_len;
use crate::transport::{
    ControlMessage, Doorbell, RenderReply, TransportMessage, TransportStats, WorkerRings,
};

use super::{BridgeId, BridgeShared, Endpoints};

/// Upper bound of one doorbell wait, so counters are checked while idle.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

enum LoopExit {
    Shutdown(oneshot::Sender<()>),
    Failed(BridgeError),
    /// The bridge handle is gone without a shutdown message
    Orphaned,
}

pub(crate) struct Worker {
    bridge: BridgeId,
    shared: Arc<BridgeShared>,
    control: mpsc::Receiver<ControlMessage>,
    bell: Arc<Doorbell>,
    stats: Arc<TransportStats>,
    events: mpsc::Sender<ModuleEvent>,
    rings: Option<WorkerRings>,
    block_len: usize,
    seen_overruns: u64,
    seen_dropped: u64,
}

impl Worker {
    pub(crate) fn new(
        bridge: BridgeId,
        shared: Arc<BridgeShared>,
        control: mpsc::Receiver<ControlMessage>,
        bell: Arc<Doorbell>,
        stats: Arc<TransportStats>,
        events: mpsc::Sender<ModuleEvent>,
    ) -> Self {
        Self {
            bridge,
            shared,
            control,
            bell,
            stats,
            events,
            rings: None,
            block_len: 0,
            seen_overruns: 0,
            seen_dropped: 0,
        }
    }

    pub(crate) fn run(mut self) {
        tracing::debug!("[Worker:{}] Thread starting up", self.shared.name);

        match self.service() {
            LoopExit::Shutdown(ack) => {
                let _ = ack.send(());
            }
            LoopExit::Orphaned => {}
            LoopExit::Failed(err) => {
                log_bridge_error(&err, "management loop");
                let _ = self.events.send(ModuleEvent::BridgeFailed {
                    bridge: self.bridge,
                    error: err,
                });
                if let Some(ack) = self.wait_for_shutdown() {
                    let _ = ack.send(());
                }
            }
        }

        tracing::debug!("[Worker:{}] Thread shutting down", self.shared.name);
    }

    fn service(&mut self) -> LoopExit {
        loop {
            self.bell.wait_timeout(POLL_INTERVAL);

            loop {
                match self.control.try_recv() {
                    Ok(ControlMessage::Shutdown { ack }) => return LoopExit::Shutdown(ack),
                    Ok(ControlMessage::Attach(rings)) => self.attach(*rings),
                    Ok(ControlMessage::Latency { direction, reply }) => {
                        let latency = self.shared.latency(direction);
                        let _ = reply.send(latency);
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return LoopExit::Orphaned,
                }
            }

            if let Err(err) = self.drain_transport() {
                return LoopExit::Failed(err);
            }
            if let Err(err) = self.check_counters() {
                return LoopExit::Failed(err);
            }
        }
    }

    fn attach(&mut self, rings: WorkerRings) {
        tracing::debug!("[Worker:{}] Attached to new graph client", self.shared.name);
        self.rings = Some(rings);
    }

    fn drain_transport(&mut self) -> Result<(), BridgeError> {
        let Some(rings) = self.rings.as_mut() else {
            return Ok(());
        };
        let connected = self.shared.is_connected();

        while let Some(message) = rings.pop() {
            let endpoints = read_endpoints(&self.shared)?;
            match message {
                TransportMessage::RenderRequest {
                    frames,
                    frame_time,
                    mut block,
                } => {
                    let (audio, channels) = match endpoints.output.as_ref() {
                        Some(output) => (
                            output.render(frames, frame_time, connected, &mut block),
                            output.channels(),
                        ),
                        None => (false, 0),
                    };
                    rings.reply(RenderReply {
                        frame_time,
                        frames,
                        channels,
                        block,
                        audio,
                    });
                }
                TransportMessage::CapturePost {
                    frames,
                    channels,
                    frame_time,
                    mut block,
                } => {
                    if let Some(input) = endpoints.input.as_ref() {
                        if channels == input.channels() {
                            input.capture(frames, frame_time, &block);
                        } else {
                            input.capture(0, frame_time, &[]);
                        }
                    }
                    ensure_len(&mut block, self.block_len);
                    rings.recycle(block);
                }
                TransportMessage::BufferSize { frames } => {
                    tracing::debug!(
                        "[Worker:{}] Buffer size changed to {} frames",
                        self.shared.name,
                        frames
                    );
                    self.block_len = frames as usize * MAX_CHANNELS;
                    if let Some(output) = endpoints.output.as_ref() {
                        output.buffer_size_changed(frames);
                    }
                }
                TransportMessage::ReturnBlock { mut block } => {
                    ensure_len(&mut block, self.block_len);
                    rings.recycle(block);
                }
            }
        }
        Ok(())
    }

    fn check_counters(&mut self) -> Result<(), BridgeError> {
        let dropped = self.stats.dropped_captures();
        if dropped > self.seen_dropped {
            tracing::warn!(
                "[Worker:{}] {} capture block(s) dropped",
                self.shared.name,
                dropped - self.seen_dropped
            );
            self.seen_dropped = dropped;
        }

        let overruns = self.stats.overruns();
        if overruns > self.seen_overruns {
            self.seen_overruns = overruns;
            return Err(BridgeError::Overrun {
                bridge: self.shared.name.clone(),
            });
        }
        Ok(())
    }

    /// Fail path: answer everything with silence until told to stop.
    fn wait_for_shutdown(&mut self) -> Option<oneshot::Sender<()>> {
        loop {
            self.bell.wait_timeout(POLL_INTERVAL);
            loop {
                match self.control.try_recv() {
                    Ok(ControlMessage::Shutdown { ack }) => return Some(ack),
                    Ok(ControlMessage::Attach(rings)) => self.attach(*rings),
                    Ok(ControlMessage::Latency { reply, .. }) => {
                        let _ = reply.send(None);
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return None,
                }
            }
            if let Some(rings) = self.rings.as_mut() {
                while let Some(message) = rings.pop() {
                    match message {
                        TransportMessage::RenderRequest {
                            frames,
                            frame_time,
                            block,
                        } => rings.reply(RenderReply {
                            frame_time,
                            frames,
                            channels: 0,
                            block,
                            audio: false,
                        }),
                        TransportMessage::CapturePost { block, .. }
                        | TransportMessage::ReturnBlock { block } => rings.recycle(block),
                        TransportMessage::BufferSize { .. } => {}
                    }
                }
            }
        }
    }
}

fn read_endpoints(shared: &BridgeShared) -> Result<RwLockReadGuard<'_, Endpoints>, BridgeError> {
    shared
        .endpoints
        .read()
        .map_err(|_| BridgeError::LockPoisoned {
            component: format!("{} endpoints", shared.name),
        })
}
