//! Admission handshake frames and connection policy constants.
//!
//! The first frame a client sends after the WebSocket upgrade is a JSON
//! auth frame; the relay answers with a single JSON response and switches
//! to binary CBOR traffic. Everything here is shared between the server
//! and test clients.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Frame type of the client auth request.
pub const FRAME_AUTH: &str = "auth";
/// Frame type of a successful auth response.
pub const FRAME_AUTH_OK: &str = "auth_ok";
/// Frame type of a failed auth response.
pub const FRAME_AUTH_FAIL: &str = "auth_fail";

/// Floor for the negotiated per-message size limit: 1 MiB.
pub const MIN_MAX_MSG_SIZE: usize = 1024 * 1024;
/// Accepted skew between the client auth timestamp and server time.
pub const TIMESTAMP_TOLERANCE_SECS: i64 = 300;

/// Interval between server pings on an established connection.
pub const PING_INTERVAL: Duration = Duration::from_secs(30);
/// A connection with no reads or pongs for this long is closed.
pub const READ_DEADLINE: Duration = Duration::from_secs(60);
/// Per-frame write budget.
pub const WRITE_DEADLINE: Duration = Duration::from_secs(10);
/// Time allowed between upgrade and a completed admission handshake.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(30);
/// Budget for enqueueing one frame onto a connection's send queue.
pub const ENQUEUE_TIMEOUT: Duration = Duration::from_millis(100);
/// Per-connection send queue depth.
pub const SEND_QUEUE_CAPACITY: usize = 256;
/// Time allowed between `stop()` and forced socket close.
pub const SHUTDOWN_BUDGET: Duration = Duration::from_secs(5);

/// Client → relay admission request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthFrame {
    /// Always [`FRAME_AUTH`].
    #[serde(rename = "type")]
    pub frame_type: String,
    /// The agent's DID.
    pub did: String,
    /// Signature over the connection nonce and timestamp.
    pub signature: String,
    /// Signature algorithm, e.g. `ed25519`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<String>,
    /// Unix timestamp (seconds) of the auth request.
    pub timestamp: i64,
    /// Client's requested per-message size limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_msg_size: Option<usize>,
    /// Replay-protection nonce.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

/// Relay → client admission response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponse {
    /// [`FRAME_AUTH_OK`] or [`FRAME_AUTH_FAIL`].
    #[serde(rename = "type")]
    pub frame_type: String,
    /// The relay's DID, for mutual authentication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_did: Option<String>,
    /// Human-readable error, present on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Stable error code, present on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// Negotiated per-message size limit, present on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_msg_size: Option<usize>,
    /// Server Unix timestamp (seconds).
    pub timestamp: i64,
}

impl AuthResponse {
    /// Builds a success response.
    #[must_use]
    pub fn ok(server_did: Option<String>, max_msg_size: usize, timestamp: i64) -> Self {
        Self {
            frame_type: FRAME_AUTH_OK.to_owned(),
            server_did,
            error: None,
            error_code: None,
            max_msg_size: Some(max_msg_size),
            timestamp,
        }
    }

    /// Builds a failure response.
    #[must_use]
    pub fn fail(error: &str, error_code: &str, timestamp: i64) -> Self {
        Self {
            frame_type: FRAME_AUTH_FAIL.to_owned(),
            server_did: None,
            error: Some(error.to_owned()),
            error_code: Some(error_code.to_owned()),
            max_msg_size: None,
            timestamp,
        }
    }

    /// Returns `true` for an `auth_ok` response.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.frame_type == FRAME_AUTH_OK
    }
}

/// Negotiates the effective per-message size limit.
///
/// The result is the smaller of the client's request and the server's
/// configured limit; a client that requests nothing (or zero) gets the
/// server limit.
#[must_use]
pub fn negotiate_max_msg_size(client_requested: usize, server_limit: usize) -> usize {
    if client_requested == 0 {
        server_limit
    } else {
        client_requested.min(server_limit)
    }
}
