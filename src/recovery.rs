//! Recovery state machine for a lost graph server.
//!
//! `connected` -> (graph shutdown) -> `disconnected` -> (every bridge
//! reconnected in one pass) -> `connected`. A pass that fails for any bridge
//! is undone and retried after a longer backoff, so the process is never left
//! half recovered.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::bridge::{BridgeContext, BridgeId};
use crate::error::log_bridge_error;
use crate::events::LifecycleEvent;
use crate::registry::BridgeRegistry;

/// Delay before the first reconnect attempt.
pub const RECOVERY_INTERVAL: Duration = Duration::from_secs(1);
/// Delay between failed reconnect attempts.
pub const RECOVERY_BACKOFF: Duration = Duration::from_secs(5);

pub struct RecoveryState {
    connected: Arc<AtomicBool>,
    epoch: Arc<AtomicU64>,
    attempts: u32,
}

impl RecoveryState {
    /// Shares the flag and generation counter with every bridge context.
    pub fn new(connected: Arc<AtomicBool>, epoch: Arc<AtomicU64>) -> Self {
        Self {
            connected,
            epoch,
            attempts: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Current connection generation.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Reconnect passes since the last loss.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// A client of generation `epoch` was shut down by the server.
    ///
    /// Returns the delay to arm the recovery timer with, or `None` when the
    /// notification belongs to a generation that was already handled.
    pub fn on_graph_shutdown(
        &mut self,
        epoch: u64,
        ctx: &BridgeContext,
        registry: &mut BridgeRegistry,
    ) -> Option<Duration> {
        if epoch != self.epoch() {
            tracing::debug!(
                "[Recovery] Ignoring shutdown of generation {} (now {})",
                epoch,
                self.epoch()
            );
            return None;
        }

        self.connected.store(false, Ordering::SeqCst);
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.attempts = 0;
        for bridge in registry.iter_mut() {
            bridge.disconnect();
        }

        tracing::warn!(
            "[Recovery] Graph connection lost, {} bridge(s) disconnected (generation {})",
            registry.len(),
            epoch
        );
        ctx.lifecycle.publish(LifecycleEvent::GraphDisconnected);
        Some(RECOVERY_INTERVAL)
    }

    /// Treat the current generation as lost, e.g. when a bridge could not
    /// open its client while the graph was believed reachable.
    pub fn connection_lost(
        &mut self,
        ctx: &BridgeContext,
        registry: &mut BridgeRegistry,
    ) -> Option<Duration> {
        let epoch = self.epoch();
        self.on_graph_shutdown(epoch, ctx, registry)
    }

    /// Recovery timer fired: try to reconnect every bridge.
    ///
    /// Returns the delay to re-arm with, or `None` once connected.
    pub fn attempt(
        &mut self,
        ctx: &BridgeContext,
        registry: &mut BridgeRegistry,
    ) -> Option<Duration> {
        if self.is_connected() {
            return None;
        }
        self.attempts += 1;
        tracing::info!("[Recovery] Reconnect attempt {}", self.attempts);

        let mut reconnected: Vec<BridgeId> = Vec::new();
        let mut failed = false;
        for bridge in registry.iter_mut() {
            let had_client = bridge.has_client();
            match bridge.reconnect(ctx) {
                Ok(()) => {
                    if !had_client {
                        reconnected.push(bridge.id());
                    }
                }
                Err(err) => {
                    log_bridge_error(&err, "RecoveryState::attempt");
                    failed = true;
                    break;
                }
            }
        }

        if failed {
            for id in reconnected {
                if let Some(bridge) = registry.get_mut(id) {
                    bridge.disconnect();
                }
            }
            tracing::warn!(
                "[Recovery] Graph still unavailable, retrying in {:?}",
                RECOVERY_BACKOFF
            );
            return Some(RECOVERY_BACKOFF);
        }

        self.connected.store(true, Ordering::SeqCst);
        tracing::info!(
            "[Recovery] Reconnected {} bridge(s) after {} attempt(s)",
            registry.len(),
            self.attempts
        );
        ctx.lifecycle.publish(LifecycleEvent::GraphReconnected {
            attempts: self.attempts,
        });
        None
    }
}
