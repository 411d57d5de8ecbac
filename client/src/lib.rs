//! Peer half of resync: one logical connection to a sync server.
//!
//! SYSTEM CONTEXT
//! ==============
//! `client` owns the connection state machine and request correlation,
//! `connector` opens transports, and `event` defines what the state machine
//! reports to callers.

pub mod client;
pub mod connector;
pub mod error;
pub mod event;

pub use client::{Client, ClientConfig};
pub use connector::{Connector, Transport, WsConnector};
pub use error::ClientError;
pub use event::{ClientEvent, ConnectionState, TrackerUpdate};
