//! One-shot timers against a host-owned clock.
//!
//! The module keeps a [`TimerQueue`] of deadlines keyed by purpose and asks it
//! for the expired keys on every poll. Arming an armed key moves its deadline;
//! a key fires at most once per arming.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::bridge::BridgeId;

/// Monotonic clock the timers are scheduled against.
pub trait TimeSource: Send + Sync {
    /// Time elapsed since the clock's origin.
    fn now(&self) -> Duration;
}

/// Wall clock backed by `Instant`.
pub struct SystemTimeSource {
    origin: Instant,
}

impl SystemTimeSource {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Clock advanced by hand, for tests and the simulator.
#[derive(Default)]
pub struct ManualTimeSource {
    now: Mutex<Duration>,
}

impl ManualTimeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now += by;
    }
}

impl TimeSource for ManualTimeSource {
    fn now(&self) -> Duration {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// What a timer is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerKey {
    /// Idle-unload check of one bridge
    IdleUnload(BridgeId),
    /// Reconnect attempt of the recovery state machine
    Recovery,
}

#[derive(Debug, Default)]
pub struct TimerQueue {
    deadlines: BTreeMap<TimerKey, Duration>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm or re-arm `key` to fire at `deadline`.
    pub fn arm(&mut self, key: TimerKey, deadline: Duration) {
        self.deadlines.insert(key, deadline);
    }

    /// Returns whether the key was armed.
    pub fn cancel(&mut self, key: TimerKey) -> bool {
        self.deadlines.remove(&key).is_some()
    }

    pub fn is_armed(&self, key: TimerKey) -> bool {
        self.deadlines.contains_key(&key)
    }

    pub fn next_deadline(&self) -> Option<Duration> {
        self.deadlines.values().min().copied()
    }

    /// Remove and return every key due at `now`, earliest first.
    pub fn expired(&mut self, now: Duration) -> Vec<TimerKey> {
        let mut due: Vec<(Duration, TimerKey)> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, deadline)| (*deadline, *key))
            .collect();
        due.sort();
        for (_, key) in &due {
            self.deadlines.remove(key);
        }
        due.into_iter().map(|(_, key)| key).collect()
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}
