//! Real-time state sync over WebSocket.
//!
//! A [`services::session::Session`] outlives individual sockets: it keeps a
//! bounded log of the actions it has sent so a reconnecting peer can catch up
//! from its last serial instead of re-downloading everything. Trackers stream
//! shared [`services::channel::Channel`] actions into a session.

pub mod config;
pub mod demo;
pub mod routes;
pub mod services;
pub mod state;
