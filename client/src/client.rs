//! Connection state machine.
//!
//! DESIGN
//! ======
//! [`Client::start`] spawns one driver task that owns the transport. Callers
//! talk to it over a command queue and hear back through a broadcast channel
//! of [`ClientEvent`]s. The driver:
//! - Waits for reachability, then connects (`Connecting { attempt }`)
//! - On open, adopts the session token and serial announced by `synced` and
//!   acknowledges the baseline
//! - Correlates `execute` calls with API responses by request id
//! - On a transient close, reconnects with the last seen serial
//!
//! Failed connect attempts back off exponentially (1s doubling to 10s by
//! default). A clean close while reachable reconnects immediately.
//!
//! ERROR HANDLING
//! ==============
//! Malformed inbound frames are logged and skipped. Pending requests fail
//! with [`ClientError::Disconnected`] when the transport drops and with
//! [`ClientError::Closed`] when the caller closes the client.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use packets::{CLOSE_ABNORMAL, CLOSE_NO_STATUS, CLOSE_NORMAL, EVENT_ACTION, EVENT_SYNCED, Encoding, Packet};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, info, warn};

use crate::connector::{Connector, MessageSink, Transport, WsConnector, connect_url};
use crate::error::ClientError;
use crate::event::{ClientEvent, ConnectionState, TrackerUpdate};

pub const DEFAULT_BACKOFF_MIN: Duration = Duration::from_secs(1);
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(10);
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

// =============================================================================
// CONFIG
// =============================================================================

#[derive(Clone)]
pub struct ClientConfig {
    url: String,
    token: Option<String>,
    encoding: Encoding,
    reachability: Option<watch::Receiver<bool>>,
    connector: Arc<dyn Connector>,
    backoff_min: Duration,
    backoff_max: Duration,
    event_capacity: usize,
}

impl ClientConfig {
    /// Config for the socket endpoint at `url` (e.g. `ws://host:3000/ws`).
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            encoding: Encoding::Json,
            reachability: None,
            connector: Arc::new(WsConnector),
            backoff_min: DEFAULT_BACKOFF_MIN,
            backoff_max: DEFAULT_BACKOFF_MAX,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    /// Resume an existing session instead of starting a new one.
    #[must_use]
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    #[must_use]
    pub fn encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Network reachability signal. Without one the network is assumed
    /// always reachable.
    #[must_use]
    pub fn reachability(mut self, reachability: watch::Receiver<bool>) -> Self {
        self.reachability = Some(reachability);
        self
    }

    #[must_use]
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    #[must_use]
    pub fn backoff(mut self, min: Duration, max: Duration) -> Self {
        self.backoff_min = min;
        self.backoff_max = max.max(min);
        self
    }

    #[must_use]
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }
}

// =============================================================================
// CLIENT
// =============================================================================

enum Command {
    Execute {
        name: String,
        payload: Value,
        reply: oneshot::Sender<Result<Value, ClientError>>,
    },
    Acknowledge,
    Close,
}

/// Session identity carried across reconnects.
#[derive(Debug, Clone, Default)]
struct Resume {
    token: Option<String>,
    serial: Option<u64>,
}

/// Handle to a running connection. Cheap to clone; the connection ends when
/// [`Client::close`] is called or every handle is dropped.
#[derive(Clone)]
pub struct Client {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<ClientEvent>,
    state: watch::Receiver<ConnectionState>,
    resume: watch::Receiver<Resume>,
}

impl Client {
    /// Spawn the connection driver. The returned receiver sees every event
    /// from the first connection attempt on.
    #[must_use]
    pub fn start(config: ClientConfig) -> (Self, broadcast::Receiver<ClientEvent>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = broadcast::channel(config.event_capacity);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (resume_tx, resume_rx) = watch::channel(Resume {
            token: config.token.clone(),
            serial: None,
        });

        let driver = Driver::new(config, commands_rx, events_tx.clone(), state_tx, resume_tx);
        tokio::spawn(driver.run());

        let client = Self {
            commands: commands_tx,
            events: events_tx,
            state: state_rx,
            resume: resume_rx,
        };
        (client, events_rx)
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Wait until the connection reaches `state`, or a terminal state.
    pub async fn wait_for(&self, state: ConnectionState) -> ConnectionState {
        let mut rx = self.state.clone();
        match rx.wait_for(|s| *s == state || s.is_terminal()).await {
            Ok(s) => *s,
            Err(_) => ConnectionState::Terminated,
        }
    }

    /// Session token in use, once known.
    #[must_use]
    pub fn token(&self) -> Option<String> {
        self.resume.borrow().token.clone()
    }

    /// Serial of the last session action seen.
    #[must_use]
    pub fn serial(&self) -> Option<u64> {
        self.resume.borrow().serial
    }

    /// Call server API `name` and wait for its result.
    ///
    /// # Errors
    ///
    /// - [`ClientError::NotConnected`] when no connection is open
    /// - [`ClientError::Remote`] with the server's message when the call fails
    /// - [`ClientError::Disconnected`] when the connection drops first
    /// - [`ClientError::Closed`] once the client has stopped
    pub async fn execute(&self, name: impl Into<String>, payload: Value) -> Result<Value, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Execute {
                name: name.into(),
                payload,
                reply,
            })
            .map_err(|_| ClientError::Closed)?;
        rx.await.unwrap_or(Err(ClientError::Disconnected))
    }

    /// Tell the server every action up to the last seen serial has been
    /// applied, so it can drop them from its replay log.
    pub fn acknowledge(&self) {
        let _ = self.commands.send(Command::Acknowledge);
    }

    /// Close the connection for good.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }
}

// =============================================================================
// DRIVER
// =============================================================================

type Pending = HashMap<u64, oneshot::Sender<Result<Value, ClientError>>>;

/// How one open connection ended.
enum Ended {
    /// The socket went away with this close code.
    Closed(u16),
    Terminated,
}

struct Driver {
    url: String,
    encoding: Encoding,
    connector: Arc<dyn Connector>,
    backoff_min: Duration,
    backoff_max: Duration,
    commands: mpsc::UnboundedReceiver<Command>,
    events: broadcast::Sender<ClientEvent>,
    state: watch::Sender<ConnectionState>,
    resume: watch::Sender<Resume>,
    reachability: Option<watch::Receiver<bool>>,
    reachable: bool,
    pending: Pending,
    next_id: u64,
    attempt: u32,
}

impl Driver {
    fn new(
        config: ClientConfig,
        commands: mpsc::UnboundedReceiver<Command>,
        events: broadcast::Sender<ClientEvent>,
        state: watch::Sender<ConnectionState>,
        resume: watch::Sender<Resume>,
    ) -> Self {
        let mut reachability = config.reachability;
        let reachable = reachability.as_mut().is_none_or(|rx| *rx.borrow_and_update());
        Self {
            url: config.url,
            encoding: config.encoding,
            connector: config.connector,
            backoff_min: config.backoff_min,
            backoff_max: config.backoff_max,
            commands,
            events,
            state,
            resume,
            reachability,
            reachable,
            pending: HashMap::new(),
            next_id: 1,
            attempt: 0,
        }
    }

    async fn run(mut self) {
        let mut backoff = self.backoff_min;
        loop {
            if !self.wait_reachable().await {
                break;
            }

            self.set_state(ConnectionState::Connecting);
            self.emit(ClientEvent::Connecting { attempt: self.attempt });

            let transport = match self.connect().await {
                Some(Ok(transport)) => transport,
                Some(Err(e)) => {
                    warn!(error = %e, attempt = self.attempt, "client: connect failed");
                    self.attempt += 1;
                    self.set_state(ConnectionState::Closed);
                    if !self.sleep(backoff).await {
                        break;
                    }
                    backoff = (backoff * 2).min(self.backoff_max);
                    continue;
                }
                None => break,
            };

            self.attempt = 0;
            backoff = self.backoff_min;
            self.set_state(ConnectionState::Open);
            self.emit(ClientEvent::Open);
            info!(url = %self.url, "client: connected");

            let ended = self.run_open(transport).await;
            self.fail_pending(|| ClientError::Disconnected);
            let Ended::Closed(code) = ended else {
                break;
            };
            match ClientEvent::closed_with(code) {
                event @ ClientEvent::Rejected { .. } => {
                    warn!(code, "client: session rejected");
                    self.emit(event);
                    self.shutdown(ConnectionState::Rejected);
                    return;
                }
                event => {
                    info!(code, "client: connection closed");
                    self.set_state(ConnectionState::Closed);
                    self.emit(event);
                }
            }
        }

        self.shutdown(ConnectionState::Terminated);
        info!("client: terminated");
    }

    /// Stop accepting commands and settle everything still waiting.
    fn shutdown(&mut self, state: ConnectionState) {
        self.commands.close();
        while let Ok(cmd) = self.commands.try_recv() {
            if let Command::Execute { reply, .. } = cmd {
                let _ = reply.send(Err(ClientError::Closed));
            }
        }
        self.fail_pending(|| ClientError::Closed);
        self.set_state(state);
    }

    // -------------------------------------------------------------------------
    // offline phases
    // -------------------------------------------------------------------------

    /// Wait until the network is reachable. Returns `false` when the client
    /// was closed meanwhile.
    async fn wait_reachable(&mut self) -> bool {
        while !self.reachable {
            tokio::select! {
                reachable = next_reachability(&mut self.reachability) => self.reachable = reachable,
                cmd = self.commands.recv() => {
                    if !serve_offline(cmd) {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Connect, serving commands meanwhile. `None` means the client was
    /// closed before the attempt finished.
    async fn connect(&mut self) -> Option<Result<Transport, ClientError>> {
        let (url, token) = {
            let resume = self.resume.borrow();
            (connect_url(&self.url, resume.serial, self.encoding), resume.token.clone())
        };
        let connector = Arc::clone(&self.connector);
        let connecting = connector.connect(&url, token.as_deref());
        tokio::pin!(connecting);

        loop {
            tokio::select! {
                result = &mut connecting => return Some(result),
                cmd = self.commands.recv() => {
                    if !serve_offline(cmd) {
                        return None;
                    }
                }
            }
        }
    }

    /// Sleep through a backoff period. Returns `false` when the client was
    /// closed meanwhile.
    async fn sleep(&mut self, period: Duration) -> bool {
        let deadline = tokio::time::sleep(period);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                () = &mut deadline => return true,
                reachable = next_reachability(&mut self.reachability) => self.reachable = reachable,
                cmd = self.commands.recv() => {
                    if !serve_offline(cmd) {
                        return false;
                    }
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // open phase
    // -------------------------------------------------------------------------

    async fn run_open(&mut self, transport: Transport) -> Ended {
        let Transport { mut sink, mut stream } = transport;
        loop {
            tokio::select! {
                msg = stream.next() => {
                    let packet = match msg {
                        Some(Ok(Message::Text(text))) => packets::decode_text(text.as_str()),
                        Some(Ok(Message::Binary(bytes))) => packets::decode_packet(&bytes),
                        Some(Ok(Message::Close(frame))) => {
                            return Ended::Closed(frame.map_or(CLOSE_NO_STATUS, |f| u16::from(f.code)));
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            warn!(error = %e, "client: transport error");
                            return Ended::Closed(CLOSE_ABNORMAL);
                        }
                        None => return Ended::Closed(CLOSE_ABNORMAL),
                    };
                    match packet {
                        Ok(packet) => self.handle_packet(packet, &mut sink).await,
                        Err(e) => warn!(error = %e, "client: malformed packet"),
                    }
                }
                reachable = next_reachability(&mut self.reachability) => {
                    self.reachable = reachable;
                    if !reachable {
                        close_transport(&mut sink, CLOSE_NORMAL, "offline").await;
                        return Ended::Closed(CLOSE_NO_STATUS);
                    }
                }
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Execute { name, payload, reply }) => {
                        let id = self.next_id;
                        self.next_id += 1;
                        self.pending.insert(id, reply);
                        debug!(id, %name, "client: execute");
                        if !self.send(&mut sink, &Packet::Api { id, name, payload }).await {
                            return Ended::Closed(CLOSE_ABNORMAL);
                        }
                    }
                    Some(Command::Acknowledge) => {
                        let serial = self.resume.borrow().serial;
                        if let Some(serial) = serial {
                            let _ = self.send(&mut sink, &Packet::Sync { serial }).await;
                        }
                    }
                    Some(Command::Close) | None => {
                        close_transport(&mut sink, CLOSE_NORMAL, "client closed").await;
                        return Ended::Terminated;
                    }
                },
            }
        }
    }

    async fn handle_packet(&mut self, packet: Packet, sink: &mut MessageSink) {
        match packet {
            Packet::ApiResponse { id, error, result } => {
                let Some(reply) = self.pending.remove(&id) else {
                    debug!(id, "client: response for unknown request");
                    return;
                };
                let outcome = match error {
                    Some(message) => Err(ClientError::Remote(message)),
                    None => Ok(result.unwrap_or(Value::Null)),
                };
                let _ = reply.send(outcome);
            }
            Packet::Event { name, data } => {
                if name == EVENT_SYNCED {
                    let serial = data.get("serial").and_then(Value::as_u64);
                    let token = data
                        .pointer("/values/id")
                        .and_then(Value::as_str)
                        .map(str::to_owned);
                    self.resume.send_modify(|resume| {
                        if token.is_some() {
                            resume.token = token;
                        }
                        resume.serial = serial;
                    });
                    if let Some(serial) = serial {
                        let _ = self.send(sink, &Packet::Sync { serial }).await;
                    }
                } else if name == EVENT_ACTION {
                    if let Some(serial) = data.get("serial").and_then(Value::as_u64) {
                        self.resume.send_modify(|resume| resume.serial = Some(serial));
                    }
                }
                self.emit(ClientEvent::Event { name, data });
            }
            other => match TrackerUpdate::from_packet(other) {
                Some((tracker, update)) => self.emit(ClientEvent::Tracker { tracker, update }),
                None => debug!("client: ignoring unexpected packet"),
            },
        }
    }

    // -------------------------------------------------------------------------
    // helpers
    // -------------------------------------------------------------------------

    async fn send(&self, sink: &mut MessageSink, packet: &Packet) -> bool {
        let message = match self.encoding {
            Encoding::Json => Message::Text(packets::encode_text(packet).into()),
            Encoding::Binary => Message::Binary(packets::encode_packet(packet).into()),
        };
        match sink.send(message).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, kind = ?packet.kind(), "client: send failed");
                false
            }
        }
    }

    fn emit(&self, event: ClientEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn fail_pending(&mut self, error: impl Fn() -> ClientError) {
        for (_, reply) in self.pending.drain() {
            let _ = reply.send(Err(error()));
        }
    }
}

/// Serve a command while no connection is open. Returns `false` on close.
fn serve_offline(cmd: Option<Command>) -> bool {
    match cmd {
        Some(Command::Execute { reply, .. }) => {
            let _ = reply.send(Err(ClientError::NotConnected));
            true
        }
        Some(Command::Acknowledge) => true,
        Some(Command::Close) | None => false,
    }
}

/// Next reachability value. Pends forever once the signal's sender is gone,
/// leaving the last value in force.
async fn next_reachability(signal: &mut Option<watch::Receiver<bool>>) -> bool {
    let Some(rx) = signal.as_mut() else {
        return std::future::pending().await;
    };
    if rx.changed().await.is_ok() {
        return *rx.borrow_and_update();
    }
    *signal = None;
    std::future::pending().await
}

async fn close_transport(sink: &mut MessageSink, code: u16, reason: &str) {
    let frame = CloseFrame {
        code: CloseCode::from(code),
        reason: reason.to_owned().into(),
    };
    if let Err(e) = sink.send(Message::Close(Some(frame))).await {
        debug!(error = %e, "client: close frame not delivered");
    }
    let _ = sink.close().await;
}

#[cfg(test)]
#[path = "client_test.rs"]
mod tests;
