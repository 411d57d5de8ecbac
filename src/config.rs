//! Server configuration, loaded from environment variables.
//!
//! Every knob has a default; a missing or unparsable variable falls back to
//! it rather than failing startup.

use std::time::Duration;

use crate::services::channel::DEFAULT_CHANNEL_BACKLOG;
use crate::services::session::{DEFAULT_ACTION_LOG_CAPACITY, DEFAULT_SESSION_EXPIRY, SessionConfig};

pub const DEFAULT_PORT: u16 = 3000;

#[derive(Clone, Copy, Debug)]
pub struct ServerConfig {
    /// TCP port the HTTP/WebSocket listener binds.
    pub port: u16,
    pub session: SessionConfig,
    /// Actions each channel keeps for tracker replay.
    pub channel_backlog: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            session: SessionConfig::default(),
            channel_backlog: DEFAULT_CHANNEL_BACKLOG,
        }
    }
}

impl ServerConfig {
    /// Read `PORT`, `SESSION_EXPIRY_SECS`, `ACTION_LOG_CAPACITY` and `CHANNEL_BACKLOG`.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            port: env_parse("PORT", DEFAULT_PORT),
            session: SessionConfig {
                expiry: Duration::from_secs(env_parse("SESSION_EXPIRY_SECS", DEFAULT_SESSION_EXPIRY.as_secs())),
                action_log_capacity: env_parse("ACTION_LOG_CAPACITY", DEFAULT_ACTION_LOG_CAPACITY),
            },
            channel_backlog: env_parse("CHANNEL_BACKLOG", DEFAULT_CHANNEL_BACKLOG),
        }
    }
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
