// Event types flowing through the module
//
// - ModuleEvent: inputs to the main control thread's dispatch loop (host hooks,
//   graph shutdown notifications, management thread failures)
// - LifecycleEvent: what the module publishes to observers over a tokio
//   broadcast channel

use serde::Serialize;
use tokio::sync::broadcast;

use crate::bridge::BridgeId;
use crate::error::BridgeError;
use crate::host::{Direction, StreamId, StreamInfo};

/// Buffer size of the lifecycle broadcast channel
pub const LIFECYCLE_CHANNEL_CAPACITY: usize = 100;

/// Events consumed by `BridgeModule::dispatch` on the main control thread.
#[derive(Debug, Clone)]
pub enum ModuleEvent {
    /// Host hook: an application stream is ready to be routed
    StreamReady(StreamInfo),
    /// Host hook: an application stream is going away
    StreamUnlink {
        stream: StreamId,
        direction: Direction,
    },
    /// Host hook: moving a stream failed
    StreamMoveFailed {
        stream: StreamId,
        direction: Direction,
    },
    /// The graph server shut a client down. `epoch` identifies the connection
    /// generation the client belonged to.
    GraphShutdown { bridge: BridgeId, epoch: u64 },
    /// A management thread left its loop abnormally and asks to be unloaded
    BridgeFailed { bridge: BridgeId, error: BridgeError },
}

/// Lifecycle notifications for observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    BridgeCreated {
        bridge: BridgeId,
        name: String,
        merge_key: Option<String>,
    },
    EndpointAdded {
        bridge: BridgeId,
        direction: Direction,
        channels: u32,
    },
    StreamAttached {
        bridge: BridgeId,
        stream: StreamId,
        direction: Direction,
    },
    StreamDetached {
        bridge: BridgeId,
        stream: StreamId,
        direction: Direction,
    },
    BridgeUnloaded { bridge: BridgeId, name: String },
    GraphDisconnected,
    GraphReconnected { attempts: u32 },
}

/// Sender side of the lifecycle channel.
///
/// Publishing never fails: with no subscriber the event is simply dropped.
#[derive(Clone)]
pub struct LifecycleBroadcaster {
    sender: broadcast::Sender<LifecycleEvent>,
}

impl LifecycleBroadcaster {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(LIFECYCLE_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn publish(&self, event: LifecycleEvent) {
        tracing::debug!("[Lifecycle] {:?}", event);
        let _ = self.sender.send(event);
    }

    /// Each subscriber receives every event published after it subscribed.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }
}

impl Default for LifecycleBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}
