//! Sessions: logical peers that outlive individual sockets.
//!
//! ARCHITECTURE
//! ============
//! A session owns the synced value store, the [`ActionLog`], the resolved API
//! handlers and at most one attached socket. The socket is represented by an
//! outbound queue; the websocket route drains that queue onto the wire, so
//! everything in here is transport-agnostic and testable without a socket.
//!
//! LIFECYCLE
//! =========
//! 1. `create` resolves API handlers and awaits the initializer
//! 2. `attach` swaps the socket, replays or populates, sends `synced`;
//!    actions dispatched while populate runs are appended to its result
//! 3. inbound packets → `handle_*`; server code → `dispatch` / `set` / `emit`
//! 4. `detach` starts the expiry timer; a re-attach cancels it
//! 5. `close` (expiry or explicit) notifies close listeners exactly once
//!
//! CONCURRENCY
//! ===========
//! One mutex guards all mutable state. Serial assignment and the matching
//! send happen under it, so wire order always equals serial order. The lock
//! is never held across an `.await`, and close listeners run after it is
//! released so they may call back into the session.

use std::collections::HashMap;
use std::fmt::Write;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use packets::{CLOSE_REPLACED, CLOSE_SESSION_CLOSED, EVENT_ACTION, EVENT_SYNC, EVENT_SYNCED, Packet};
use rand::Rng;
use serde_json::{Map, Value, json};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::services::action_log::ActionLog;

/// Default grace period between losing the socket and destroying the session.
pub const DEFAULT_SESSION_EXPIRY: Duration = Duration::from_secs(5 * 60);
/// Default number of unacknowledged actions kept for replay.
pub const DEFAULT_ACTION_LOG_CAPACITY: usize = 1024;

/// Identifier of one physical connection attached to a session.
pub type SocketId = Uuid;
/// Handle returned by [`Session::add_close_listener`].
pub type ListenerId = u64;

pub(crate) fn bytes_to_hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}

/// Generate a random 32-byte hex session token.
#[must_use]
pub fn generate_token() -> String {
    let bytes: [u8; 32] = rand::rng().random();
    bytes_to_hex(&bytes)
}

// =============================================================================
// ERRORS
// =============================================================================

/// Failure reported back to the peer in an API response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ApiError {
    pub message: String,
}

impl ApiError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session {0} is closed")]
    Closed(String),
    #[error("session initialization failed: {0}")]
    Init(String),
    #[error("initial sync failed: {0}")]
    Populate(String),
    #[error("socket was replaced before the sync completed")]
    Replaced,
}

// =============================================================================
// APIS
// =============================================================================

pub type ApiResult = Result<Value, ApiError>;

/// A resolved API handler bound to one session.
pub type ApiHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, ApiResult> + Send + Sync>;

type ApiFactory = Arc<dyn Fn(&Session) -> ApiHandler + Send + Sync>;

/// Named API handler factories, resolved once per session at creation.
#[derive(Clone, Default)]
pub struct Apis {
    factories: HashMap<String, ApiFactory>,
}

impl Apis {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name`. The factory runs once per session and returns the
    /// handler that serves every call to `name` on that session.
    #[must_use]
    pub fn register<F, H, Fut>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&Session) -> H + Send + Sync + 'static,
        H: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ApiResult> + Send + 'static,
    {
        let factory: ApiFactory = Arc::new(move |session: &Session| {
            let handler = factory(session);
            Arc::new(move |payload: Value| handler(payload).boxed()) as ApiHandler
        });
        self.factories.insert(name.into(), factory);
        self
    }

    fn resolve(&self, session: &Session) -> HashMap<String, ApiHandler> {
        self.factories
            .iter()
            .map(|(name, factory)| (name.clone(), factory(session)))
            .collect()
    }
}

// =============================================================================
// INITIALIZER
// =============================================================================

/// Full-sync function: maps the connection context to the actions that
/// rebuild the peer's state from scratch.
pub type Populate =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Vec<Value>, SessionError>> + Send + Sync>;

/// Wrap an async closure as a [`Populate`].
pub fn populate_with<F, Fut>(f: F) -> Populate
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<Value>, SessionError>> + Send + 'static,
{
    Arc::new(move |context| f(context).boxed())
}

/// Prepares a freshly created session and supplies its full-sync function.
#[async_trait]
pub trait Initializer: Send + Sync {
    async fn init(&self, session: &Session) -> Result<Populate, SessionError>;
}

/// Initializer for apps whose state lives entirely in trackers.
pub struct EmptyPopulate;

#[async_trait]
impl Initializer for EmptyPopulate {
    async fn init(&self, _session: &Session) -> Result<Populate, SessionError> {
        Ok(populate_with(|_| async { Ok(Vec::new()) }))
    }
}

// =============================================================================
// CONFIG / OUTBOUND
// =============================================================================

#[derive(Clone, Copy, Debug)]
pub struct SessionConfig {
    /// How long a detached session waits for a re-attach before closing.
    pub expiry: Duration,
    /// Maximum unacknowledged actions kept for replay.
    pub action_log_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            expiry: DEFAULT_SESSION_EXPIRY,
            action_log_capacity: DEFAULT_ACTION_LOG_CAPACITY,
        }
    }
}

/// Work item for the transport that owns the attached socket.
#[derive(Clone, Debug, PartialEq)]
pub enum Outbound {
    Packet(Packet),
    Close { code: u16, reason: String },
}

/// A socket bound to a session by [`Session::attach`].
#[derive(Debug)]
pub struct Attachment {
    pub socket: SocketId,
    pub outbound: mpsc::UnboundedReceiver<Outbound>,
}

// =============================================================================
// SESSION
// =============================================================================

type CloseListener = Arc<dyn Fn(&str) + Send + Sync>;

struct SocketSlot {
    id: SocketId,
    tx: mpsc::UnboundedSender<Outbound>,
}

struct SessionState {
    socket: Option<SocketSlot>,
    synced: bool,
    /// A `synced` baseline has been delivered at least once.
    baselined: bool,
    values: Map<String, Value>,
    log: ActionLog,
    apis: HashMap<String, ApiHandler>,
    populate: Option<Populate>,
    listeners: Vec<(ListenerId, CloseListener)>,
    next_listener: ListenerId,
    expiry: Option<JoinHandle<()>>,
    closed: bool,
}

impl SessionState {
    fn send(&self, packet: Packet) -> bool {
        self.socket
            .as_ref()
            .is_some_and(|s| s.tx.send(Outbound::Packet(packet)).is_ok())
    }

    fn sync_values(&self, changed: Map<String, Value>) {
        if self.synced {
            self.send(Packet::event(EVENT_SYNC, Value::Object(changed)));
        }
    }

    fn deliver_synced(&mut self, actions: Vec<Value>) {
        let data = json!({
            "actions": actions,
            "serial": self.log.serial(),
            "values": Value::Object(self.values.clone()),
        });
        self.send(Packet::event(EVENT_SYNCED, data));
        self.synced = true;
        self.baselined = true;
    }
}

struct SessionInner {
    id: String,
    params: Value,
    config: SessionConfig,
    state: Mutex<SessionState>,
    /// Bumped after every `synced` baseline.
    baselines: watch::Sender<u64>,
}

/// Shared handle to one logical peer.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Create a session, resolving every API handler and awaiting the
    /// initializer. A `None` id issues a fresh random token.
    ///
    /// # Errors
    ///
    /// Returns whatever the initializer fails with.
    pub async fn create(
        id: Option<String>,
        params: Value,
        apis: &Apis,
        init: &dyn Initializer,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        let id = id.unwrap_or_else(generate_token);

        let mut values = Map::new();
        values.insert("id".into(), Value::String(id.clone()));
        values.insert("context".into(), Value::Null);

        let session = Self {
            inner: Arc::new(SessionInner {
                id,
                params,
                config,
                state: Mutex::new(SessionState {
                    socket: None,
                    synced: false,
                    baselined: false,
                    values,
                    log: ActionLog::new(config.action_log_capacity),
                    apis: HashMap::new(),
                    populate: None,
                    listeners: Vec::new(),
                    next_listener: 1,
                    expiry: None,
                    closed: false,
                }),
                baselines: watch::Sender::new(0),
            }),
        };

        let handlers = apis.resolve(&session);
        session.lock().apis = handlers;

        let populate = init.init(&session).await?;
        session.lock().populate = Some(populate);

        info!(session_id = %session.id(), "session: created");
        Ok(session)
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    #[must_use]
    pub fn params(&self) -> &Value {
        &self.inner.params
    }

    /// Whether two handles refer to the same session.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // -------------------------------------------------------------------------
    // attach / detach / close
    // -------------------------------------------------------------------------

    /// Bind a new socket, replacing any previous one, and bring it up to date.
    ///
    /// When `serial` is supplied and the action log still covers it, only the
    /// missed actions are replayed; otherwise the session's populate function
    /// rebuilds the peer's state from `context`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] for a closed session, the populate
    /// error when the full sync fails, and [`SessionError::Replaced`] when a
    /// newer socket took over while populating.
    pub async fn attach(
        &self,
        serial: Option<u64>,
        context: Value,
    ) -> Result<Attachment, SessionError> {
        let socket = Uuid::new_v4();
        let (tx, outbound) = mpsc::unbounded_channel();

        let (populate, before) = {
            let mut state = self.lock();
            if state.closed {
                return Err(SessionError::Closed(self.inner.id.clone()));
            }
            if let Some(expiry) = state.expiry.take() {
                expiry.abort();
            }
            if let Some(previous) = state.socket.replace(SocketSlot { id: socket, tx }) {
                info!(session_id = %self.id(), socket = %previous.id, "session: replacing socket");
                let _ = previous.tx.send(Outbound::Close {
                    code: CLOSE_REPLACED,
                    reason: "replaced by a newer connection".into(),
                });
            }
            state.synced = false;
            state.values.insert("context".into(), context.clone());

            let replay = serial
                .filter(|_| state.baselined)
                .and_then(|s| state.log.actions_since(s));
            if let Some(actions) = replay {
                debug!(session_id = %self.id(), replayed = actions.len(), "session: replaying");
                state.deliver_synced(actions);
                self.inner.baselines.send_modify(|n| *n += 1);
                return Ok(Attachment { socket, outbound });
            }
            (state.populate.clone(), state.log.serial())
        };

        let Some(populate) = populate else {
            return Err(SessionError::Closed(self.inner.id.clone()));
        };
        let mut actions = match populate(context).await {
            Ok(actions) => actions,
            Err(e) => {
                warn!(session_id = %self.id(), error = %e, "session: populate failed");
                self.release(socket);
                return Err(e);
            }
        };

        let mut state = self.lock();
        if state.socket.as_ref().map(|s| s.id) != Some(socket) {
            return Err(SessionError::Replaced);
        }
        // Dispatched while populate ran: counted in the serial, never sent.
        match state.log.actions_since(before) {
            Some(missed) => actions.extend(missed),
            None => warn!(session_id = %self.id(), before, "session: actions dispatched during populate were evicted"),
        }
        state.deliver_synced(actions);
        self.inner.baselines.send_modify(|n| *n += 1);
        Ok(Attachment { socket, outbound })
    }

    /// Drop `socket` without starting the expiry timer.
    fn release(&self, socket: SocketId) {
        let mut state = self.lock();
        if state.socket.as_ref().map(|s| s.id) == Some(socket) {
            state.socket = None;
            state.synced = false;
        }
    }

    /// The socket went away. Starts the expiry timer unless a newer socket
    /// already replaced it.
    pub fn detach(&self, socket: SocketId) {
        let mut state = self.lock();
        if state.closed || state.socket.as_ref().map(|s| s.id) != Some(socket) {
            return;
        }
        state.socket = None;
        state.synced = false;

        let session = self.clone();
        let expiry = self.inner.config.expiry;
        if let Some(previous) = state.expiry.replace(tokio::spawn(async move {
            tokio::time::sleep(expiry).await;
            info!(session_id = %session.id(), "session: expired");
            session.close();
        })) {
            previous.abort();
        }
        debug!(session_id = %self.id(), ?expiry, "session: detached");
    }

    /// Destroy the session. Idempotent.
    pub fn close(&self) {
        let listeners = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.synced = false;
            if let Some(expiry) = state.expiry.take() {
                expiry.abort();
            }
            if let Some(socket) = state.socket.take() {
                let _ = socket.tx.send(Outbound::Close {
                    code: CLOSE_SESSION_CLOSED,
                    reason: "session closed".into(),
                });
            }
            // Handlers and populate usually capture the session itself.
            state.apis.clear();
            state.populate = None;
            std::mem::take(&mut state.listeners)
        };

        info!(session_id = %self.id(), "session: closed");
        for (_, listener) in listeners {
            listener(self.id());
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.lock().socket.is_some()
    }

    #[must_use]
    pub fn is_synced(&self) -> bool {
        self.lock().synced
    }

    /// Watch the number of `synced` baselines delivered so far. Trackers use
    /// it to resume streams that stalled while the session was detached.
    #[must_use]
    pub fn baselines(&self) -> watch::Receiver<u64> {
        self.inner.baselines.subscribe()
    }

    /// Register `listener` to run with the session id when the session closes.
    pub fn add_close_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let mut state = self.lock();
        let id = state.next_listener;
        state.next_listener += 1;
        state.listeners.push((id, Arc::new(listener)));
        id
    }

    /// Returns whether the listener was registered.
    pub fn remove_close_listener(&self, id: ListenerId) -> bool {
        let mut state = self.lock();
        let before = state.listeners.len();
        state.listeners.retain(|(lid, _)| *lid != id);
        state.listeners.len() != before
    }

    // -------------------------------------------------------------------------
    // inbound
    // -------------------------------------------------------------------------

    /// Decode and handle one text frame. Malformed frames are logged and dropped.
    pub fn handle_text(&self, text: &str) {
        match packets::decode_text(text) {
            Ok(packet) => self.handle_packet(packet),
            Err(e) => warn!(session_id = %self.id(), error = %e, "session: invalid inbound packet"),
        }
    }

    /// Decode and handle one binary frame. Malformed frames are logged and dropped.
    pub fn handle_binary(&self, bytes: &[u8]) {
        match packets::decode_packet(bytes) {
            Ok(packet) => self.handle_packet(packet),
            Err(e) => warn!(session_id = %self.id(), error = %e, "session: invalid inbound packet"),
        }
    }

    /// Route one peer packet. API calls run on their own task.
    pub fn handle_packet(&self, packet: Packet) {
        match packet {
            Packet::Api { id, name, payload } => {
                let handler = self.lock().apis.get(&name).cloned();
                let Some(handler) = handler else {
                    warn!(session_id = %self.id(), api = %name, "session: unknown api");
                    self.send(Packet::api_err(id, format!("Unknown api {name}")));
                    return;
                };
                let session = self.clone();
                tokio::spawn(async move {
                    let response = match AssertUnwindSafe(handler(payload)).catch_unwind().await {
                        Ok(Ok(result)) => Packet::api_ok(id, result),
                        Ok(Err(e)) => Packet::api_err(id, e.message),
                        Err(_) => {
                            error!(session_id = %session.id(), api = %name, "session: api handler panicked");
                            Packet::api_err(id, format!("api {name} failed"))
                        }
                    };
                    session.send(response);
                });
            }
            Packet::Sync { serial } => self.lock().log.sync(serial),
            other => {
                warn!(session_id = %self.id(), kind = ?other.kind(), "session: unexpected packet from peer");
            }
        }
    }

    // -------------------------------------------------------------------------
    // outbound
    // -------------------------------------------------------------------------

    /// Queue a packet on the attached socket. Returns `false` when detached.
    pub fn send(&self, packet: Packet) -> bool {
        self.lock().send(packet)
    }

    /// Send a named event to the attached socket.
    pub fn emit(&self, event: impl Into<String>, data: Value) -> bool {
        self.send(Packet::event(event, data))
    }

    /// Record a state-changing action and forward it when synced.
    pub fn dispatch(&self, action: Value) -> u64 {
        let mut state = self.lock();
        let serial = state.log.push(action.clone());
        if state.synced {
            state.send(Packet::event(
                EVENT_ACTION,
                json!({ "action": action, "serial": serial }),
            ));
        }
        serial
    }

    #[must_use]
    pub fn serial(&self) -> u64 {
        self.lock().log.serial()
    }

    /// Set one synced value.
    pub fn set(&self, name: impl Into<String>, value: Value) {
        let name = name.into();
        let mut state = self.lock();
        state.values.insert(name.clone(), value.clone());
        let mut changed = Map::new();
        changed.insert(name, value);
        state.sync_values(changed);
    }

    /// Set several synced values, forwarded as a single delta.
    pub fn multi_set(&self, values: Map<String, Value>) {
        let mut state = self.lock();
        for (name, value) in &values {
            state.values.insert(name.clone(), value.clone());
        }
        state.sync_values(values);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Value> {
        self.lock().values.get(name).cloned()
    }

    #[must_use]
    pub fn context(&self) -> Value {
        self.get("context").unwrap_or(Value::Null)
    }

    pub fn set_context(&self, context: Value) {
        self.set("context", context);
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
