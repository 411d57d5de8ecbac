//! Client error type.

use tokio_tungstenite::tungstenite;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("not connected")]
    NotConnected,
    #[error("connection dropped before the response arrived")]
    Disconnected,
    #[error("client is closed")]
    Closed,
    /// Error message returned by the server for an API call.
    #[error("{0}")]
    Remote(String),
    #[error("websocket connect failed: {0}")]
    Connect(Box<tungstenite::Error>),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
}
