//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor. It
//! holds the session registry and the channel hub, so the channel provider
//! is scoped to one server instance rather than being process-global.

use std::sync::Arc;

use crate::config::ServerConfig;
use crate::services::channel::ChannelHub;
use crate::services::registry::SessionRegistry;
use crate::services::session::{Apis, Initializer};

/// Clone is required by Axum; every field is cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionRegistry>,
    pub channels: ChannelHub,
    pub config: ServerConfig,
}

impl AppState {
    #[must_use]
    pub fn new(config: ServerConfig, channels: ChannelHub, apis: Apis, init: Arc<dyn Initializer>) -> Self {
        Self {
            sessions: Arc::new(SessionRegistry::new(apis, init, config.session)),
            channels,
            config,
        }
    }
}
