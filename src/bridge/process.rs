// Realtime process handler registered with each bridge's graph client
//
// Runs on the graph's realtime thread. Per cycle:
// 1. Output ports: send a render request, wait (bounded) for the reply and
//    deinterleave it into the port buffers, or write silence
// 2. Input ports: interleave the port buffers into a pooled block and post it
//
// No allocation, no logging and no locks besides the transport's doorbells.

use std::sync::mpsc;

use crate::codec;
use crate::events::ModuleEvent;
use crate::graph::{ProcessCycle, ProcessHandler};
use crate::transport::RealtimeSide;

use super::BridgeId;

pub(crate) struct BridgeProcess {
    bridge: BridgeId,
    client_name: String,
    transport: RealtimeSide,
    events: mpsc::Sender<ModuleEvent>,
    epoch: u64,
}

impl BridgeProcess {
    pub(crate) fn new(
        bridge: BridgeId,
        client_name: String,
        transport: RealtimeSide,
        events: mpsc::Sender<ModuleEvent>,
        epoch: u64,
    ) -> Self {
        Self {
            bridge,
            client_name,
            transport,
            events,
            epoch,
        }
    }

    fn render(&mut self, cycle: &mut ProcessCycle<'_, '_>) {
        let frames = cycle.frames as usize;
        let channels = cycle.playback.len();
        match self.transport.request_render(cycle.frames, cycle.frame_time) {
            Some(reply) => {
                let written = reply.audio
                    && reply.channels as usize == channels
                    && codec::deinterleave(&reply.block, cycle.playback, frames).is_ok();
                if !written {
                    let _ = codec::fill_silence(cycle.playback, frames);
                }
                self.transport.return_block(reply.block);
            }
            None => {
                let _ = codec::fill_silence(cycle.playback, frames);
            }
        }
    }

    fn capture(&mut self, cycle: &ProcessCycle<'_, '_>) {
        let Some(mut block) = self.transport.take_capture_block() else {
            return;
        };
        let frames = match codec::interleave(cycle.capture, cycle.frames as usize, &mut block) {
            Ok(_) => cycle.frames,
            Err(_) => 0,
        };
        self.transport.post_capture(
            frames,
            cycle.capture.len() as u32,
            cycle.frame_time,
            block,
        );
    }
}

impl ProcessHandler for BridgeProcess {
    fn process(&mut self, cycle: &mut ProcessCycle<'_, '_>) {
        if !cycle.playback.is_empty() {
            self.render(cycle);
        }
        if !cycle.capture.is_empty() {
            self.capture(cycle);
        }
    }

    fn buffer_size_changed(&mut self, frames: u32) {
        self.transport.notify_buffer_size(frames);
    }

    fn thread_init(&mut self) {
        tracing::info!("[Graph:{}] Realtime thread starting up", self.client_name);
    }

    fn shutdown(&mut self) {
        tracing::info!("[Graph:{}] Server shut the client down", self.client_name);
        let _ = self.events.send(ModuleEvent::GraphShutdown {
            bridge: self.bridge,
            epoch: self.epoch,
        });
    }
}
