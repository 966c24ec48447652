//! Message-type taxonomy and protocol constants for AMP.

/// Protocol version carried in every message (tag 1).
pub const PROTOCOL_VERSION: u64 = 1;

/// DID sentinel addressing the relay itself. Messages sent to this
/// address are handled locally and never forwarded.
pub const RELAY_DID: &str = "relay-server";

/// Broadcast sentinel. A message whose `to` field is empty or equals
/// this value is fanned out to every authenticated peer except the sender.
pub const BROADCAST_DID: &str = "*";

/// AMP message type codes. Types are grouped into 16-code ranges; the
/// relay routes unknown codes inside a known range as opaque payloads.
pub mod msg_type {
    /// Keepalive request.
    pub const PING: u8 = 0x01;
    /// Keepalive response.
    pub const PONG: u8 = 0x02;
    /// Delivery acknowledgement.
    pub const ACK: u8 = 0x03;
    /// Processing succeeded.
    pub const PROC_OK: u8 = 0x04;
    /// Processing failed.
    pub const PROC_FAIL: u8 = 0x05;
    /// Contact exchange request.
    pub const CONTACT_REQUEST: u8 = 0x06;
    /// Contact exchange response.
    pub const CONTACT_RESPONSE: u8 = 0x07;
    /// Contact revocation.
    pub const CONTACT_REVOKE: u8 = 0x08;
    /// Long-running operation accepted.
    pub const PROCESSING: u8 = 0x09;
    /// Progress update for a long-running operation.
    pub const PROGRESS: u8 = 0x0A;
    /// Operation is waiting on caller input.
    pub const INPUT_REQUIRED: u8 = 0x0B;
    /// Error report.
    pub const ERROR: u8 = 0x0F;

    /// Generic one-way message.
    pub const MESSAGE: u8 = 0x10;
    /// Request expecting a response.
    pub const REQUEST: u8 = 0x11;
    /// Response to a request.
    pub const RESPONSE: u8 = 0x12;
    /// Stream open.
    pub const STREAM_START: u8 = 0x13;
    /// Stream chunk.
    pub const STREAM_DATA: u8 = 0x14;
    /// Stream close.
    pub const STREAM_END: u8 = 0x15;

    /// Capability query.
    pub const CAP_QUERY: u8 = 0x20;
    /// Capability declaration.
    pub const CAP_DECLARE: u8 = 0x21;
    /// Capability invocation.
    pub const CAP_INVOKE: u8 = 0x22;
    /// Capability invocation result.
    pub const CAP_RESULT: u8 = 0x23;

    /// Document transfer.
    pub const DOC_SEND: u8 = 0x30;
    /// Document request.
    pub const DOC_REQUEST: u8 = 0x31;

    /// Credential issuance.
    pub const CRED_ISSUE: u8 = 0x40;
    /// Credential request.
    pub const CRED_REQUEST: u8 = 0x41;
    /// Credential presentation.
    pub const CRED_PRESENT: u8 = 0x42;
    /// Credential verification.
    pub const CRED_VERIFY: u8 = 0x43;

    /// Delegation grant.
    pub const DELEG_GRANT: u8 = 0x50;
    /// Delegation revocation.
    pub const DELEG_REVOKE: u8 = 0x51;
    /// Delegation query.
    pub const DELEG_QUERY: u8 = 0x52;

    /// Presence announcement.
    pub const PRESENCE: u8 = 0x60;
    /// Presence query.
    pub const PRESENCE_QUERY: u8 = 0x61;
    /// Presence subscription.
    pub const PRESENCE_SUB: u8 = 0x62;
    /// Presence unsubscription.
    pub const PRESENCE_UNSUB: u8 = 0x63;

    /// Session hello.
    pub const HELLO: u8 = 0x70;
    /// Session hello acknowledgement.
    pub const HELLO_ACK: u8 = 0x71;
    /// Session hello rejection.
    pub const HELLO_REJECT: u8 = 0x72;

    /// First code of the extension range (0xF0–0xFF).
    pub const EXTENSION: u8 = 0xF0;

    /// Returns `true` if the code falls in the control range (0x00–0x0F).
    #[must_use]
    pub const fn is_control(t: u8) -> bool {
        t <= ERROR
    }

    /// Returns `true` if the code falls inside a defined range.
    ///
    /// Defined ranges are 0x00–0x7F (control through handshake) and
    /// 0xF0–0xFF (extension). Codes in 0x80–0xEF are rejected by the relay.
    #[must_use]
    pub const fn is_known(t: u8) -> bool {
        t <= 0x7F || t >= EXTENSION
    }
}

/// Stable error-code strings carried in relay error messages.
pub mod error_code {
    /// The frame could not be decoded as an AMP message.
    pub const INVALID_FORMAT: &str = "invalid_format";
    /// The message `from` field does not match the connection's DID.
    pub const IDENTITY_MISMATCH: &str = "identity_mismatch";
    /// The message type falls outside every defined range.
    pub const UNKNOWN_TYPE: &str = "unknown_type";
    /// The message store rejected the write.
    pub const STORAGE_ERROR: &str = "storage_error";
    /// A registered action handler returned an error.
    pub const HANDLER_ERROR: &str = "handler_error";
    /// The sender exceeded its per-minute message budget.
    pub const RATE_LIMITED: &str = "rate_limited";
}
