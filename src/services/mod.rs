//! Domain services used by the websocket route.
//!
//! ARCHITECTURE
//! ============
//! Leaves first: `action_log` → `channel` → `session` → `tracker`, with
//! `registry` mapping session tokens to live sessions. None of these know
//! about sockets; the route owns all transport concerns.

pub mod action_log;
pub mod channel;
pub mod registry;
pub mod session;
pub mod tracker;
