//! Session registry: token → live session lookup for incoming sockets.
//!
//! A session removes itself from the registry when it closes, whether by
//! expiry or explicitly, so a later connection presenting the same token gets
//! a brand-new session under that token.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;
use tracing::info;

use crate::services::session::{Apis, Initializer, Session, SessionConfig, SessionError};

const MAX_TOKEN_LEN: usize = 128;

/// Whether `token` is acceptable as a session id.
#[must_use]
pub fn is_valid_token(token: &str) -> bool {
    !token.is_empty()
        && token.len() <= MAX_TOKEN_LEN
        && token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

type SessionMap = Mutex<HashMap<String, Session>>;

pub struct SessionRegistry {
    sessions: Arc<SessionMap>,
    apis: Apis,
    init: Arc<dyn Initializer>,
    config: SessionConfig,
}

impl SessionRegistry {
    #[must_use]
    pub fn new(apis: Apis, init: Arc<dyn Initializer>, config: SessionConfig) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            apis,
            init,
            config,
        }
    }

    /// Resume the session for `token`, or create one (under `token` when
    /// given, otherwise under a fresh token).
    ///
    /// # Errors
    ///
    /// Returns the initializer's error for a new session.
    pub async fn open(&self, token: Option<String>, params: Value) -> Result<Session, SessionError> {
        if let Some(existing) = token.as_deref().and_then(|t| self.get(t)) {
            return Ok(existing);
        }

        let session = Session::create(token, params, &self.apis, self.init.as_ref(), self.config).await?;

        // Another connection may have created the same token meanwhile.
        let winner = {
            let mut sessions = self.lock();
            match sessions.get(session.id()) {
                Some(existing) if !existing.is_closed() => existing.clone(),
                _ => {
                    sessions.insert(session.id().to_owned(), session.clone());
                    session.clone()
                }
            }
        };
        if !winner.ptr_eq(&session) {
            session.close();
            return Ok(winner);
        }

        let sessions: Weak<SessionMap> = Arc::downgrade(&self.sessions);
        session.add_close_listener(move |id| {
            let Some(sessions) = sessions.upgrade() else {
                return;
            };
            let mut sessions = sessions.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            // A newer session may already hold the token.
            if sessions.get(id).is_some_and(Session::is_closed) {
                sessions.remove(id);
            }
        });

        info!(session_id = %session.id(), live = self.len(), "registry: session registered");
        Ok(session)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    #[must_use]
    pub fn get(&self, token: &str) -> Option<Session> {
        self.lock().get(token).filter(|s| !s.is_closed()).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
#[path = "registry_test.rs"]
mod tests;
