//! Bridge registry and stream routing policy.
//!
//! Owned by the main control thread. Bridges are kept in insertion order so
//! that the first matching bridge wins a merge-key lookup, and a lookup table
//! maps every routed stream to the bridge it is attached to.

use std::collections::HashMap;

use crate::bridge::{Bridge, BridgeContext, BridgeId};
use crate::config::MergeMode;
use crate::error::BridgeError;
use crate::events::LifecycleEvent;
use crate::host::{Direction, StreamId, StreamInfo};

/// What `route_stream` did with a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Stream must not be moved; left where it is
    Skipped,
    /// Stream attached and moved onto the bridge's endpoint
    Attached { bridge: BridgeId, created: bool },
    /// The host refused the move; the stream stays where it was
    MoveFailed { bridge: BridgeId, created: bool },
}

/// Routing identity of a stream under `mode`.
pub fn merge_key(stream: &StreamInfo, mode: MergeMode) -> Option<String> {
    let key = match mode {
        MergeMode::None => None,
        MergeMode::ByPid => stream.process_id(),
        MergeMode::ByBinary => stream.process_binary(),
        MergeMode::ByAppName => stream.application_name(),
    };
    key.map(str::to_string)
}

/// Name of a bridge created for `stream`: its application identity.
pub fn bridge_name(stream: &StreamInfo) -> String {
    stream
        .application_name()
        .or_else(|| stream.process_binary())
        .map(str::to_string)
        .unwrap_or_else(|| format!("stream-{}", stream.id.0))
}

#[derive(Default)]
pub struct BridgeRegistry {
    bridges: Vec<Bridge>,
    owners: HashMap<StreamId, BridgeId>,
    next_id: u32,
}

impl BridgeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.bridges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bridges.is_empty()
    }

    pub fn get(&self, id: BridgeId) -> Option<&Bridge> {
        self.bridges.iter().find(|b| b.id() == id)
    }

    pub fn get_mut(&mut self, id: BridgeId) -> Option<&mut Bridge> {
        self.bridges.iter_mut().find(|b| b.id() == id)
    }

    /// Bridges in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Bridge> {
        self.bridges.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Bridge> {
        self.bridges.iter_mut()
    }

    pub fn ids(&self) -> Vec<BridgeId> {
        self.bridges.iter().map(Bridge::id).collect()
    }

    /// Bridge a stream is attached to.
    pub fn owner(&self, stream: StreamId) -> Option<BridgeId> {
        self.owners.get(&stream).copied()
    }

    /// Create a bridge and append it to the registry.
    pub fn create_bridge(
        &mut self,
        ctx: &BridgeContext,
        name: &str,
        merge_key: Option<String>,
        persistent: bool,
    ) -> Result<BridgeId, BridgeError> {
        self.next_id += 1;
        let id = BridgeId(self.next_id);
        let bridge = Bridge::create(ctx, id, name, merge_key, persistent)?;
        tracing::info!("[Registry] Created bridge {} '{}'", id, name);
        self.bridges.push(bridge);
        Ok(id)
    }

    /// Attach a ready stream to a bridge, creating one when no bridge with
    /// the same merge key exists, and move the stream onto its endpoint.
    pub fn route_stream(
        &mut self,
        ctx: &BridgeContext,
        stream: &StreamInfo,
    ) -> Result<RouteOutcome, BridgeError> {
        if stream.dont_move {
            tracing::debug!("[Registry] Stream {} must not be moved, skipping", stream.id.0);
            return Ok(RouteOutcome::Skipped);
        }
        if let Some(bridge) = self.owner(stream.id) {
            return Ok(RouteOutcome::Attached {
                bridge,
                created: false,
            });
        }

        let direction = stream.direction;
        let key = merge_key(stream, ctx.config.merge_mode);
        let existing = key.as_deref().and_then(|key| {
            self.bridges
                .iter()
                .find(|b| b.merge_key() == Some(key))
                .map(Bridge::id)
        });

        let (id, created) = match existing {
            Some(id) => (id, false),
            None => {
                let id = self.create_bridge(ctx, &bridge_name(stream), key, false)?;
                (id, true)
            }
        };

        let Some(bridge) = self.get_mut(id) else {
            return Err(BridgeError::UnknownBridge { id: id.0 });
        };
        if let Err(err) = bridge.add_endpoint(ctx, direction, stream.channels) {
            if created {
                self.remove(ctx, id);
            }
            return Err(err);
        }
        let Some(target) = bridge.endpoint_id(direction) else {
            return Err(BridgeError::UnknownBridge { id: id.0 });
        };

        bridge.attach(direction, stream.id);
        self.owners.insert(stream.id, id);

        if let Err(err) = ctx.host.move_stream(stream.id, direction, target) {
            tracing::warn!(
                "[Registry] Failed to move stream {} to bridge {}: {}",
                stream.id.0,
                id,
                err
            );
            self.owners.remove(&stream.id);
            if let Some(bridge) = self.get_mut(id) {
                bridge.detach(stream.id);
            }
            return Ok(RouteOutcome::MoveFailed { bridge: id, created });
        }

        tracing::info!(
            "[Registry] Stream {} ({}) attached to bridge {}",
            stream.id.0,
            direction,
            id
        );
        ctx.lifecycle.publish(LifecycleEvent::StreamAttached {
            bridge: id,
            stream: stream.id,
            direction,
        });
        Ok(RouteOutcome::Attached { bridge: id, created })
    }

    /// Forget a stream that is going away. Returns its former bridge.
    pub fn unlink_stream(&mut self, ctx: &BridgeContext, stream: StreamId) -> Option<BridgeId> {
        let id = self.owners.remove(&stream)?;
        let direction = self.get_mut(id)?.detach(stream)?;
        tracing::debug!("[Registry] Stream {} left bridge {}", stream.0, id);
        ctx.lifecycle.publish(LifecycleEvent::StreamDetached {
            bridge: id,
            stream,
            direction,
        });
        Some(id)
    }

    /// Forced unload of one bridge. Returns the streams it moved away, or
    /// `None` for an unknown id.
    pub fn remove(
        &mut self,
        ctx: &BridgeContext,
        id: BridgeId,
    ) -> Option<Vec<(StreamId, Direction)>> {
        let index = self.bridges.iter().position(|b| b.id() == id)?;
        let mut bridge = self.bridges.remove(index);
        let relocated = bridge.teardown(ctx);
        self.owners.retain(|_, owner| *owner != id);

        tracing::info!("[Registry] Bridge {} '{}' unloaded", id, bridge.name());
        ctx.lifecycle.publish(LifecycleEvent::BridgeUnloaded {
            bridge: id,
            name: bridge.name().to_string(),
        });
        Some(relocated)
    }
}
