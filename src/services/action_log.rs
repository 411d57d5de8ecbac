//! Action log: serial-numbered replay cache for a session.
//!
//! DESIGN
//! ======
//! `serial` counts every action ever pushed. The cache holds a suffix of
//! that history: the entries the peer has not acknowledged yet. A reconnect
//! presenting serial `s` can be served from the cache when the cache still
//! reaches back to `s`; otherwise the caller falls back to a full sync.
//!
//! TRADE-OFFS
//! ==========
//! The cache is capped. An unresponsive peer that never acknowledges would
//! otherwise grow it without bound; evicting the oldest entry only turns a
//! later replay into a full resync, never into a silent gap.

use std::collections::VecDeque;

use serde_json::Value;

/// Bounded cache of dispatched actions keyed by a monotonic serial.
#[derive(Debug)]
pub struct ActionLog {
    cache: VecDeque<Value>,
    serial: u64,
    capacity: usize,
}

impl ActionLog {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: VecDeque::new(),
            serial: 0,
            capacity: capacity.max(1),
        }
    }

    /// Append an action and return its serial.
    pub fn push(&mut self, action: Value) -> u64 {
        self.cache.push_back(action);
        self.serial += 1;
        if self.cache.len() > self.capacity {
            self.cache.pop_front();
        }
        self.serial
    }

    /// Drop every entry the peer acknowledged up to `acknowledged`.
    ///
    /// Acknowledgments ahead of the log are clamped to the current serial.
    pub fn sync(&mut self, acknowledged: u64) {
        let acknowledged = acknowledged.min(self.serial);
        let keep = usize::try_from(self.serial - acknowledged).unwrap_or(usize::MAX);
        while self.cache.len() > keep {
            self.cache.pop_front();
        }
    }

    /// All unacknowledged actions, or `None` when there is nothing cached.
    #[must_use]
    pub fn cached_actions(&self) -> Option<Vec<Value>> {
        if self.cache.is_empty() {
            return None;
        }
        Some(self.cache.iter().cloned().collect())
    }

    /// Actions pushed after `serial`.
    ///
    /// Returns `None` when `serial` is ahead of the log or older than the
    /// oldest cached entry; the caller must resync from scratch.
    #[must_use]
    pub fn actions_since(&self, serial: u64) -> Option<Vec<Value>> {
        if serial > self.serial {
            return None;
        }
        let missed = usize::try_from(self.serial - serial).ok()?;
        if missed > self.cache.len() {
            return None;
        }
        Some(self.cache.iter().skip(self.cache.len() - missed).cloned().collect())
    }

    #[must_use]
    pub fn serial(&self) -> u64 {
        self.serial
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

#[cfg(test)]
#[path = "action_log_test.rs"]
mod tests;
