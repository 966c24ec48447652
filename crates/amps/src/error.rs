use crate::auth::AuthError;
use crate::store::StoreError;
use thiserror::Error;

/// Errors that can occur during relay server operation.
#[derive(Debug, Error)]
pub enum AmpsError {
    /// WebSocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Binary message encoding or decoding error.
    #[error("wire error: {0}")]
    Wire(#[from] amp_common::WireError),
    /// Authentication failure during or after admission.
    #[error("{0}")]
    Auth(#[from] AuthError),
    /// The admission handshake was malformed or out of order.
    #[error("handshake rejected: {0}")]
    Handshake(String),
    /// Message store failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    /// Configuration rejected by validation.
    #[error("configuration error: {0}")]
    Config(String),
    /// The connection was closed by the remote peer.
    #[error("connection closed")]
    ConnectionClosed,
    /// `start` was called on a server that is already running.
    #[error("server already running")]
    AlreadyRunning,
}
