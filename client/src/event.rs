//! What the connection state machine reports to its callers.

use packets::Packet;
use serde_json::Value;

/// Lifecycle phase of the logical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Started, waiting for the network to become reachable.
    Idle,
    Connecting,
    Open,
    /// Transport dropped; reconnects when reachable.
    Closed,
    /// Server refused the session. Terminal.
    Rejected,
    /// Closed by the caller. Terminal.
    Terminated,
}

impl ConnectionState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Rejected | Self::Terminated)
    }
}

/// One update for a server-side tracker.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackerUpdate {
    Action { action: Value, serial: u64 },
    Event { event: String, data: Value },
    Open,
    Close { code: u16, message: String },
    Timestamp { server_time_ms: i64 },
}

impl TrackerUpdate {
    /// Split a tracker packet into its tracker id and update.
    ///
    /// Returns `None` for packets that are not addressed to a tracker.
    #[must_use]
    pub fn from_packet(packet: Packet) -> Option<(String, Self)> {
        let pair = match packet {
            Packet::TrackerAction {
                tracker,
                action,
                serial,
            } => (tracker, Self::Action { action, serial }),
            Packet::TrackerEvent { tracker, event, data } => (tracker, Self::Event { event, data }),
            Packet::TrackerOpen { tracker } => (tracker, Self::Open),
            Packet::TrackerClose {
                tracker,
                code,
                message,
            } => (tracker, Self::Close { code, message }),
            Packet::TrackerTimestamp {
                tracker,
                server_time_ms,
            } => (tracker, Self::Timestamp { server_time_ms }),
            _ => return None,
        };
        Some(pair)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// A connection attempt started. `attempt` counts failures since the
    /// last successful open.
    Connecting { attempt: u32 },
    Open,
    /// The transport closed; a reconnect follows once reachable.
    Close { code: u16 },
    /// The server refused the session; no reconnect follows.
    Rejected { code: u16 },
    /// A named server event, including `synced` and `action`.
    Event { name: String, data: Value },
    Tracker { tracker: String, update: TrackerUpdate },
}

impl ClientEvent {
    /// Classify a close code: 4000-4999 is a rejection, anything else is
    /// transient.
    #[must_use]
    pub fn closed_with(code: u16) -> Self {
        if packets::is_rejection(code) {
            Self::Rejected { code }
        } else {
            Self::Close { code }
        }
    }
}

#[cfg(test)]
#[path = "event_test.rs"]
mod tests;
