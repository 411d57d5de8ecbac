//! WebSocket handler: binds sockets to sessions.
//!
//! DESIGN
//! ======
//! On upgrade, the session cookie selects (or creates) a session and the
//! socket is attached to it. The connection then runs a `select!` loop:
//! - Incoming frames → decoded and handled by the session
//! - Session outbound queue → encoded onto the socket, or a close frame
//!
//! Query parameters: `serial` resumes from the last action the peer saw,
//! `encoding=binary` switches to protobuf frames, and every other parameter
//! becomes the session context.
//!
//! ERROR HANDLING
//! ==============
//! Session-level refusals are delivered as close codes in the 4000 range
//! after the upgrade, never as HTTP errors, so the peer can tell a rejection
//! apart from a network failure and stop reconnecting.

use std::collections::HashMap;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use axum_extra::extract::CookieJar;
use packets::{
    CLOSE_INVALID_SESSION, CLOSE_REPLACED, CLOSE_SESSION_CLOSED, CLOSE_SYNC_FAILED, Encoding, Packet, SESSION_COOKIE,
};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::services::registry::is_valid_token;
use crate::services::session::{Attachment, Outbound, SessionError};
use crate::state::AppState;

// =============================================================================
// UPGRADE
// =============================================================================

/// Connection parameters resolved from the upgrade request.
#[derive(Debug, Clone, PartialEq)]
struct Connect {
    token: Option<String>,
    serial: Option<u64>,
    encoding: Encoding,
    context: Value,
}

impl Connect {
    fn from_request(jar: &CookieJar, mut params: HashMap<String, String>) -> Self {
        let token = jar.get(SESSION_COOKIE).map(|c| c.value().to_owned());
        let serial = params.remove("serial").and_then(|s| s.parse().ok());
        let encoding = match params.remove("encoding").as_deref() {
            Some("binary") => Encoding::Binary,
            _ => Encoding::Json,
        };
        let context = if params.is_empty() {
            Value::Null
        } else {
            Value::Object(
                params
                    .into_iter()
                    .map(|(k, v)| (k, Value::String(v)))
                    .collect::<Map<_, _>>(),
            )
        };
        Self {
            token,
            serial,
            encoding,
            context,
        }
    }
}

pub async fn handle_ws(
    State(state): State<AppState>,
    jar: CookieJar,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let connect = Connect::from_request(&jar, params);
    ws.on_upgrade(move |socket| run_ws(socket, state, connect))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState, connect: Connect) {
    let Connect {
        token,
        serial,
        encoding,
        context,
    } = connect;

    if token.as_deref().is_some_and(|t| !is_valid_token(t)) {
        warn!("ws: rejecting malformed session token");
        close_socket(&mut socket, CLOSE_INVALID_SESSION, "invalid session token").await;
        return;
    }

    let session = match state.sessions.open(token, Value::Null).await {
        Ok(session) => session,
        Err(e) => {
            warn!(error = %e, "ws: session init failed");
            close_socket(&mut socket, attach_close_code(&e), &e.to_string()).await;
            return;
        }
    };

    let Attachment {
        socket: socket_id,
        mut outbound,
    } = match session.attach(serial, context).await {
        Ok(attachment) => attachment,
        Err(e) => {
            warn!(session_id = %session.id(), error = %e, "ws: attach failed");
            close_socket(&mut socket, attach_close_code(&e), &e.to_string()).await;
            return;
        }
    };

    info!(session_id = %session.id(), %socket_id, ?serial, encoding = encoding.as_str(), "ws: client connected");

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                match msg {
                    Message::Text(text) => session.handle_text(text.as_str()),
                    Message::Binary(bytes) => session.handle_binary(&bytes),
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            out = outbound.recv() => {
                match out {
                    Some(Outbound::Packet(packet)) => {
                        if send_packet(&mut socket, &packet, encoding).await.is_err() {
                            break;
                        }
                    }
                    Some(Outbound::Close { code, reason }) => {
                        close_socket(&mut socket, code, &reason).await;
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    session.detach(socket_id);
    info!(session_id = %session.id(), %socket_id, "ws: client disconnected");
}

// =============================================================================
// HELPERS
// =============================================================================

async fn send_packet(socket: &mut WebSocket, packet: &Packet, encoding: Encoding) -> Result<(), axum::Error> {
    debug!(kind = ?packet.kind(), "ws: send packet");
    let message = match encoding {
        Encoding::Json => Message::Text(packets::encode_text(packet).into()),
        Encoding::Binary => Message::Binary(packets::encode_packet(packet).into()),
    };
    socket.send(message).await
}

/// Close code for an attach the session refused.
fn attach_close_code(error: &SessionError) -> u16 {
    match error {
        SessionError::Replaced => CLOSE_REPLACED,
        SessionError::Closed(_) => CLOSE_SESSION_CLOSED,
        SessionError::Init(_) | SessionError::Populate(_) => CLOSE_SYNC_FAILED,
    }
}

/// Close frame payloads are capped at 125 bytes, two of which hold the code.
const MAX_CLOSE_REASON: usize = 123;

async fn close_socket(socket: &mut WebSocket, code: u16, reason: &str) {
    let mut end = reason.len().min(MAX_CLOSE_REASON);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    let frame = CloseFrame {
        code,
        reason: reason[..end].to_owned().into(),
    };
    if let Err(e) = socket.send(Message::Close(Some(frame))).await {
        debug!(error = %e, code, "ws: close frame not delivered");
    }
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
