//! Cross-domain transport between the graph's realtime thread and a bridge's
//! management thread.
//!
//! - Realtime -> management: [`TransportMessage`] over an SPSC ring. Render
//!   requests are synchronous (the realtime side waits, bounded, for the
//!   matching [`RenderReply`]); capture posts are fire-and-forget.
//! - Management -> realtime: [`RenderReply`] over a second SPSC ring.
//! - Main control thread -> management: [`ControlMessage`] over an mpsc
//!   channel, with `oneshot` replies where the caller needs an answer.
//!
//! The management thread sleeps on a [`Doorbell`] that both the realtime side
//! and the control handle ring after queueing a message.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use rtrb::{Consumer, Producer, PushError};
use tokio::sync::oneshot;

use crate::error::BridgeError;
use crate::graph::FrameTime;
use crate::host::Direction;

pub mod block_pool;

pub use block_pool::{AudioBlock, BlockPool, BlockPoolChannels, DEFAULT_BLOCK_COUNT};

const REQUEST_RING_SLACK: usize = 4;
const REPLY_RING_CAPACITY: usize = 4;

/// Messages from the realtime thread to the management thread.
#[derive(Debug)]
pub enum TransportMessage {
    /// Produce `frames` frames now; the block is lent for the reply
    RenderRequest {
        frames: u32,
        frame_time: FrameTime,
        block: AudioBlock,
    },
    /// `frames` interleaved frames of `channels` captured at `frame_time`
    CapturePost {
        frames: u32,
        channels: u32,
        frame_time: FrameTime,
        block: AudioBlock,
    },
    /// The graph changed its period size
    BufferSize { frames: u32 },
    /// A block the realtime side has no slot for; goes back to the pool
    ReturnBlock { block: AudioBlock },
}

/// Answer to a render request.
#[derive(Debug)]
pub struct RenderReply {
    /// Frame time of the request being answered
    pub frame_time: FrameTime,
    pub frames: u32,
    /// Channel count of the interleaved audio in `block`
    pub channels: u32,
    pub block: AudioBlock,
    /// False when the block holds no audio and silence must be written
    pub audio: bool,
}

/// Messages from the main control thread to the management thread.
pub enum ControlMessage {
    /// Switch to the rings of a freshly activated graph client
    Attach(Box<WorkerRings>),
    /// Latency of one endpoint in microseconds, `None` if the direction is absent
    Latency {
        direction: Direction,
        reply: oneshot::Sender<Option<u64>>,
    },
    /// Leave the loop; acknowledged right before the thread exits
    Shutdown { ack: oneshot::Sender<()> },
}

/// Wake-up primitive the management thread waits on.
#[derive(Debug, Default)]
pub struct Doorbell {
    rung: Mutex<bool>,
    cond: Condvar,
}

impl Doorbell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ring(&self) {
        let mut rung = self.rung.lock().unwrap_or_else(|p| p.into_inner());
        *rung = true;
        self.cond.notify_all();
    }

    /// Wait until rung or `timeout` elapses. Returns whether it was rung and
    /// clears the flag.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let rung = self.rung.lock().unwrap_or_else(|p| p.into_inner());
        let (mut rung, _) = self
            .cond
            .wait_timeout_while(rung, timeout, |rung| !*rung)
            .unwrap_or_else(|p| p.into_inner());
        std::mem::replace(&mut *rung, false)
    }
}

/// Counters written by the realtime side, reported by the management thread.
#[derive(Debug, Default)]
pub struct TransportStats {
    overruns: AtomicU64,
    dropped_captures: AtomicU64,
}

impl TransportStats {
    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    pub fn dropped_captures(&self) -> u64 {
        self.dropped_captures.load(Ordering::Relaxed)
    }

    fn flag_overrun(&self) {
        self.overruns.fetch_add(1, Ordering::Relaxed);
    }

    fn flag_dropped_capture(&self) {
        self.dropped_captures.fetch_add(1, Ordering::Relaxed);
    }
}

/// Realtime end of one transport instance. Owned by the process handler.
pub struct RealtimeSide {
    requests: Producer<TransportMessage>,
    replies: Consumer<RenderReply>,
    supply: Consumer<AudioBlock>,
    render_block: Option<AudioBlock>,
    /// Holding area when the request ring is full. Reserved for every block
    /// of the pool, so pushing never reallocates.
    spares: Vec<AudioBlock>,
    worker_bell: Arc<Doorbell>,
    reply_bell: Arc<Doorbell>,
    stats: Arc<TransportStats>,
    render_timeout: Duration,
}

impl RealtimeSide {
    /// Ask the management thread for `frames` frames and wait for the answer.
    ///
    /// Returns `None` (and flags an overrun) when no block is available, the
    /// ring is full or the reply misses the deadline. A reply that arrives
    /// later is recognized by its frame time and discarded.
    pub fn request_render(&mut self, frames: u32, frame_time: FrameTime) -> Option<RenderReply> {
        self.reclaim_stale_replies();

        let Some(block) = self
            .render_block
            .take()
            .or_else(|| self.spares.pop())
            .or_else(|| self.supply.pop().ok())
        else {
            self.stats.flag_overrun();
            return None;
        };

        let request = TransportMessage::RenderRequest {
            frames,
            frame_time,
            block,
        };
        if let Err(PushError::Full(TransportMessage::RenderRequest { block, .. })) =
            self.requests.push(request)
        {
            self.render_block = Some(block);
            self.stats.flag_overrun();
            return None;
        }
        self.worker_bell.ring();

        let deadline = Instant::now() + self.render_timeout;
        loop {
            while let Ok(reply) = self.replies.pop() {
                if reply.frame_time == frame_time {
                    return Some(reply);
                }
                self.keep_block(reply.block);
            }
            let now = Instant::now();
            if now >= deadline {
                self.stats.flag_overrun();
                return None;
            }
            self.reply_bell.wait_timeout(deadline - now);
        }
    }

    /// Hand back the block of a consumed reply.
    pub fn return_block(&mut self, block: AudioBlock) {
        self.keep_block(block);
    }

    /// Empty block for capture, if the pool has one.
    pub fn take_capture_block(&mut self) -> Option<AudioBlock> {
        match self.supply.pop() {
            Ok(block) => Some(block),
            Err(_) => {
                self.stats.flag_dropped_capture();
                None
            }
        }
    }

    /// Queue captured audio without waiting. Zero `frames` marks a cycle whose
    /// audio did not fit the block; the block still goes back to be grown.
    pub fn post_capture(
        &mut self,
        frames: u32,
        channels: u32,
        frame_time: FrameTime,
        block: AudioBlock,
    ) {
        if frames == 0 {
            self.stats.flag_dropped_capture();
        }
        let message = TransportMessage::CapturePost {
            frames,
            channels,
            frame_time,
            block,
        };
        match self.requests.push(message) {
            Ok(()) => self.worker_bell.ring(),
            Err(PushError::Full(TransportMessage::CapturePost { block, .. })) => {
                self.stats.flag_dropped_capture();
                self.keep_block(block);
            }
            Err(PushError::Full(_)) => self.stats.flag_dropped_capture(),
        }
    }

    pub fn notify_buffer_size(&mut self, frames: u32) {
        if self
            .requests
            .push(TransportMessage::BufferSize { frames })
            .is_ok()
        {
            self.worker_bell.ring();
        }
    }

    fn reclaim_stale_replies(&mut self) {
        while let Ok(reply) = self.replies.pop() {
            self.keep_block(reply.block);
        }
    }

    /// Keep one block for the next render; send any other back to the
    /// management thread instead of freeing it here.
    fn keep_block(&mut self, block: AudioBlock) {
        if self.render_block.is_none() {
            self.render_block = Some(block);
            return;
        }
        match self.requests.push(TransportMessage::ReturnBlock { block }) {
            Ok(()) => self.worker_bell.ring(),
            Err(PushError::Full(TransportMessage::ReturnBlock { block })) => {
                if self.spares.len() < self.spares.capacity() {
                    self.spares.push(block);
                }
            }
            Err(PushError::Full(_)) => {}
        }
    }
}

/// Management end of one transport instance.
pub struct WorkerRings {
    requests: Consumer<TransportMessage>,
    replies: Producer<RenderReply>,
    recycle: Producer<AudioBlock>,
    reply_bell: Arc<Doorbell>,
}

impl WorkerRings {
    pub fn pop(&mut self) -> Option<TransportMessage> {
        self.requests.pop().ok()
    }

    /// Send a render reply and wake the realtime side.
    pub fn reply(&mut self, reply: RenderReply) {
        if self.replies.push(reply).is_ok() {
            self.reply_bell.ring();
        }
    }

    /// Return a capture block to the pool.
    pub fn recycle(&mut self, block: AudioBlock) {
        let _ = self.recycle.push(block);
    }
}

/// Build the rings for one graph client activation.
///
/// `block_len` is the initial length of every pooled block in samples.
pub fn channel(
    block_len: usize,
    render_timeout: Duration,
    worker_bell: Arc<Doorbell>,
    stats: Arc<TransportStats>,
) -> (RealtimeSide, WorkerRings) {
    let BlockPoolChannels {
        recycle,
        mut supply,
    } = BlockPool::new(DEFAULT_BLOCK_COUNT, block_len);
    let render_block = supply.pop().ok();
    let (request_tx, request_rx) = rtrb::RingBuffer::new(DEFAULT_BLOCK_COUNT + REQUEST_RING_SLACK);
    let (reply_tx, reply_rx) = rtrb::RingBuffer::new(REPLY_RING_CAPACITY);
    let reply_bell = Arc::new(Doorbell::new());

    let realtime = RealtimeSide {
        requests: request_tx,
        replies: reply_rx,
        supply,
        render_block,
        spares: Vec::with_capacity(DEFAULT_BLOCK_COUNT),
        worker_bell,
        reply_bell: Arc::clone(&reply_bell),
        stats,
        render_timeout,
    };
    let worker = WorkerRings {
        requests: request_rx,
        replies: reply_tx,
        recycle,
        reply_bell,
    };
    (realtime, worker)
}

/// Sending side of a management thread's control channel.
#[derive(Clone)]
pub struct ControlHandle {
    sender: mpsc::Sender<ControlMessage>,
    bell: Arc<Doorbell>,
}

impl ControlHandle {
    pub fn new(sender: mpsc::Sender<ControlMessage>, bell: Arc<Doorbell>) -> Self {
        Self { sender, bell }
    }

    pub fn send(&self, message: ControlMessage) -> Result<(), BridgeError> {
        self.sender
            .send(message)
            .map_err(|_| BridgeError::ThreadSpawnFailed {
                reason: "management thread is gone".to_string(),
            })?;
        self.bell.ring();
        Ok(())
    }

    /// Send a message built around a reply channel and wait for the answer.
    pub fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> ControlMessage,
    ) -> Result<T, BridgeError> {
        let (tx, rx) = oneshot::channel();
        self.send(build(tx))?;
        rx.blocking_recv()
            .map_err(|_| BridgeError::ThreadSpawnFailed {
                reason: "management thread dropped the reply".to_string(),
            })
    }
}
