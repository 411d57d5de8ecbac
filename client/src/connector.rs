//! Transport construction.
//!
//! The connection state machine never touches sockets directly: it asks a
//! [`Connector`] for a [`Transport`], a message sink plus a message stream.
//! [`WsConnector`] is the tokio-tungstenite implementation; tests substitute
//! their own.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{Sink, Stream, StreamExt};
use packets::{Encoding, SESSION_COOKIE};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::COOKIE;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::error::ClientError;

pub type MessageSink = Pin<Box<dyn Sink<Message, Error = tungstenite::Error> + Send>>;
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<Message, tungstenite::Error>> + Send>>;

/// An open connection, split into its outbound and inbound halves.
pub struct Transport {
    pub sink: MessageSink,
    pub stream: MessageStream,
}

impl Transport {
    pub fn new<S>(socket: S) -> Self
    where
        S: Sink<Message, Error = tungstenite::Error>
            + Stream<Item = Result<Message, tungstenite::Error>>
            + Send
            + 'static,
    {
        let (sink, stream) = socket.split();
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a transport to `url`, presenting `token` as the session cookie.
    async fn connect(&self, url: &str, token: Option<&str>) -> Result<Transport, ClientError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str, token: Option<&str>) -> Result<Transport, ClientError> {
        let mut request = url
            .into_client_request()
            .map_err(|_| ClientError::InvalidUrl(url.to_owned()))?;
        if let Some(token) = token {
            let cookie = HeaderValue::from_str(&format!("{SESSION_COOKIE}={token}"))
                .map_err(|e| ClientError::Connect(Box::new(tungstenite::Error::HttpFormat(e.into()))))?;
            request.headers_mut().insert(COOKIE, cookie);
        }

        let (socket, _) = connect_async(request)
            .await
            .map_err(|e| ClientError::Connect(Box::new(e)))?;
        Ok(Transport::new(socket))
    }
}

/// URL for one connection attempt. `serial` asks the server to resume from
/// the last action this peer saw.
#[must_use]
pub fn connect_url(base: &str, serial: Option<u64>, encoding: Encoding) -> String {
    let mut params = Vec::new();
    if let Some(serial) = serial {
        params.push(format!("serial={serial}"));
    }
    if encoding == Encoding::Binary {
        params.push(format!("encoding={}", encoding.as_str()));
    }
    if params.is_empty() {
        return base.to_owned();
    }
    let sep = if base.contains('?') { '&' } else { '?' };
    format!("{base}{sep}{}", params.join("&"))
}

#[cfg(test)]
#[path = "connector_test.rs"]
mod tests;
