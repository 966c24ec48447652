//! AMP message model and binary codec.
//!
//! Messages are CBOR maps keyed by small integer tags. Encoding is
//! canonical: keys ascend, absent optional fields are omitted, and tags
//! this version does not understand survive a decode→encode round trip.

use serde_cbor::Value;
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Wire tag for the protocol version field.
pub const TAG_VERSION: i128 = 1;
/// Wire tag for the message id.
pub const TAG_ID: i128 = 2;
/// Wire tag for the message type code.
pub const TAG_TYPE: i128 = 3;
/// Wire tag for the creation timestamp (Unix milliseconds).
pub const TAG_TS: i128 = 4;
/// Wire tag for the time-to-live (milliseconds).
pub const TAG_TTL: i128 = 5;
/// Wire tag for the sender DID.
pub const TAG_FROM: i128 = 6;
/// Wire tag for the recipient DID.
pub const TAG_TO: i128 = 7;
/// Wire tag for the id being replied to.
pub const TAG_REPLY_TO: i128 = 8;
/// Wire tag for the conversation thread id.
pub const TAG_THREAD_ID: i128 = 9;
/// Wire tag for the signature.
pub const TAG_SIG: i128 = 10;
/// Wire tag for the body.
pub const TAG_BODY: i128 = 11;
/// Wire tag for the unsigned extension map.
pub const TAG_EXT: i128 = 12;

/// A 16-byte message id: 8 bytes of big-endian millisecond timestamp
/// followed by 8 bytes from a cryptographic RNG.
pub type MessageId = [u8; 16];

/// Default message TTL for newly constructed messages: 24 hours.
pub const DEFAULT_TTL_MS: u64 = 86_400_000;

/// The AMP message envelope.
///
/// `body` and `ext` are carried as opaque CBOR values; the relay never
/// interprets them beyond the `ext["action"]` lookup. Tags that this
/// implementation does not recognise are kept in `unknown_tags` and
/// re-emitted verbatim on encode.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Protocol version, always 1.
    pub version: u64,
    /// Unique message id.
    pub id: MessageId,
    /// Message type code (see [`crate::types::msg_type`]).
    pub msg_type: u8,
    /// Creation time, Unix milliseconds.
    pub ts: u64,
    /// Lifetime in milliseconds. Zero means "deliver immediately".
    pub ttl: u64,
    /// Sender DID.
    pub from: String,
    /// Recipient DID. Empty for broadcast.
    pub to: String,
    /// Id of the message being replied to.
    pub reply_to: Option<Vec<u8>>,
    /// Opaque conversation id.
    pub thread_id: Option<Vec<u8>>,
    /// Signature over [`Message::signing_bytes`]. Not verified here.
    pub sig: Option<Vec<u8>>,
    /// Opaque typed payload.
    pub body: Option<Value>,
    /// Extension map. Excluded from the signature and from routing.
    pub ext: Option<BTreeMap<String, Value>>,
    /// Tags seen on decode that this version does not understand.
    pub unknown_tags: BTreeMap<i128, Value>,
}

/// Errors produced while encoding or decoding a message.
#[derive(Debug, Error)]
pub enum WireError {
    /// The input byte slice was empty.
    #[error("message is empty")]
    Empty,
    /// The top-level CBOR item was not a map.
    #[error("message is not a CBOR map")]
    NotAMap,
    /// A map key was not an integer tag.
    #[error("non-integer map key")]
    NonIntegerKey,
    /// A required tag was absent.
    #[error("missing required tag {0}")]
    MissingTag(i128),
    /// A field value had the wrong CBOR type for its tag.
    #[error("wrong value type for tag {0}")]
    FieldType(i128),
    /// The id field was not exactly 16 bytes.
    #[error("id must be 16 bytes, got {0}")]
    BadIdLength(usize),
    /// The type code did not fit in a byte.
    #[error("type code out of range: {0}")]
    TypeOutOfRange(i128),
    /// CBOR-level serialization failure.
    #[error("cbor encode: {0}")]
    Encode(#[source] serde_cbor::Error),
    /// CBOR-level deserialization failure.
    #[error("cbor decode: {0}")]
    Decode(#[source] serde_cbor::Error),
}

/// Returns the current Unix time in milliseconds.
///
/// Panics if the system clock is before the Unix epoch: every TTL and id
/// decision would be wrong, which is a systems-integrity fault, not a
/// recoverable condition.
#[must_use]
pub fn unix_now_ms() -> u64 {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch");
    u64::try_from(since_epoch.as_millis()).expect("system clock is implausibly far in the future")
}

/// Generates a message id for the given creation time.
///
/// Panics if the operating system RNG fails; id collisions would corrupt
/// the store, so this is a systems-integrity fault.
#[must_use]
pub fn new_id(now_ms: u64) -> MessageId {
    use rand::rngs::OsRng;
    use rand::RngCore;
    let mut id = [0u8; 16];
    id[..8].copy_from_slice(&now_ms.to_be_bytes());
    OsRng.fill_bytes(&mut id[8..]);
    id
}

impl Message {
    /// Creates a message with a fresh id, current timestamp, and the
    /// default 24-hour TTL.
    #[must_use]
    pub fn new(msg_type: u8, from: &str, to: &str, body: Option<Value>) -> Self {
        let now = unix_now_ms();
        Self {
            version: crate::types::PROTOCOL_VERSION,
            id: new_id(now),
            msg_type,
            ts: now,
            ttl: DEFAULT_TTL_MS,
            from: from.to_owned(),
            to: to.to_owned(),
            reply_to: None,
            thread_id: None,
            sig: None,
            body,
            ext: None,
            unknown_tags: BTreeMap::new(),
        }
    }

    /// Returns the message id as a hex string, used for store keys and logs.
    #[must_use]
    pub fn id_hex(&self) -> String {
        hex::encode(self.id)
    }

    /// Returns the action name from `ext["action"]`, if present.
    #[must_use]
    pub fn action(&self) -> Option<&str> {
        match self.ext.as_ref()?.get("action")? {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Sets `ext["action"]`, creating the extension map if needed.
    pub fn set_action(&mut self, action: &str) {
        self.ext
            .get_or_insert_with(BTreeMap::new)
            .insert("action".to_owned(), Value::Text(action.to_owned()));
    }

    /// Returns `true` if the message is expired at `now_ms`.
    ///
    /// A zero TTL means "deliver immediately, do not store" and never
    /// expires by this rule.
    #[must_use]
    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        if self.ttl == 0 {
            return false;
        }
        now_ms > self.ts.saturating_add(self.ttl)
    }

    /// Returns `true` if the message is expired now.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(unix_now_ms())
    }

    fn to_value_map(&self, include_unsigned: bool) -> BTreeMap<Value, Value> {
        let mut map = BTreeMap::new();
        map.insert(
            Value::Integer(TAG_VERSION),
            Value::Integer(i128::from(self.version)),
        );
        map.insert(Value::Integer(TAG_ID), Value::Bytes(self.id.to_vec()));
        map.insert(
            Value::Integer(TAG_TYPE),
            Value::Integer(i128::from(self.msg_type)),
        );
        map.insert(Value::Integer(TAG_TS), Value::Integer(i128::from(self.ts)));
        map.insert(Value::Integer(TAG_TTL), Value::Integer(i128::from(self.ttl)));
        map.insert(Value::Integer(TAG_FROM), Value::Text(self.from.clone()));
        map.insert(Value::Integer(TAG_TO), Value::Text(self.to.clone()));
        if let Some(reply_to) = &self.reply_to {
            map.insert(Value::Integer(TAG_REPLY_TO), Value::Bytes(reply_to.clone()));
        }
        if let Some(thread_id) = &self.thread_id {
            map.insert(Value::Integer(TAG_THREAD_ID), Value::Bytes(thread_id.clone()));
        }
        if include_unsigned {
            if let Some(sig) = &self.sig {
                map.insert(Value::Integer(TAG_SIG), Value::Bytes(sig.clone()));
            }
        }
        if let Some(body) = &self.body {
            map.insert(Value::Integer(TAG_BODY), body.clone());
        }
        if include_unsigned {
            if let Some(ext) = &self.ext {
                let ext_map = ext
                    .iter()
                    .map(|(k, v)| (Value::Text(k.clone()), v.clone()))
                    .collect();
                map.insert(Value::Integer(TAG_EXT), Value::Map(ext_map));
            }
        }
        for (tag, value) in &self.unknown_tags {
            map.entry(Value::Integer(*tag)).or_insert_with(|| value.clone());
        }
        map
    }

    /// Encodes the message to canonical CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Encode`] if CBOR serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        serde_cbor::to_vec(&Value::Map(self.to_value_map(true))).map_err(WireError::Encode)
    }

    /// Encodes the signed subset of the message: every field except
    /// `sig` (tag 10) and `ext` (tag 12).
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Encode`] if CBOR serialization fails.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, WireError> {
        serde_cbor::to_vec(&Value::Map(self.to_value_map(false))).map_err(WireError::Encode)
    }

    /// Decodes a message from CBOR bytes.
    ///
    /// Unrecognised tags are preserved in [`Message::unknown_tags`].
    /// Absent optional tags decode to `None`; absent scalar tags decode to
    /// their zero values. The id (tag 2) and type (tag 3) are required.
    ///
    /// # Errors
    ///
    /// Returns [`WireError`] if the input is empty, is not an
    /// integer-keyed CBOR map, has mistyped fields, or lacks the id or
    /// type tags.
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        if data.is_empty() {
            return Err(WireError::Empty);
        }
        let value: Value = serde_cbor::from_slice(data).map_err(WireError::Decode)?;
        let Value::Map(map) = value else {
            return Err(WireError::NotAMap);
        };

        let mut msg = Self {
            version: 0,
            id: [0u8; 16],
            msg_type: 0,
            ts: 0,
            ttl: 0,
            from: String::new(),
            to: String::new(),
            reply_to: None,
            thread_id: None,
            sig: None,
            body: None,
            ext: None,
            unknown_tags: BTreeMap::new(),
        };
        let mut saw_id = false;
        let mut saw_type = false;

        for (key, value) in map {
            let Value::Integer(tag) = key else {
                return Err(WireError::NonIntegerKey);
            };
            match tag {
                TAG_VERSION => msg.version = as_u64(value, tag)?,
                TAG_ID => {
                    let bytes = as_bytes(value, tag)?;
                    msg.id = bytes
                        .as_slice()
                        .try_into()
                        .map_err(|_| WireError::BadIdLength(bytes.len()))?;
                    saw_id = true;
                }
                TAG_TYPE => {
                    let code = as_u64(value, tag)?;
                    msg.msg_type =
                        u8::try_from(code).map_err(|_| WireError::TypeOutOfRange(i128::from(code)))?;
                    saw_type = true;
                }
                TAG_TS => msg.ts = as_u64(value, tag)?,
                TAG_TTL => msg.ttl = as_u64(value, tag)?,
                TAG_FROM => msg.from = as_text(value, tag)?,
                TAG_TO => msg.to = as_text(value, tag)?,
                TAG_REPLY_TO => msg.reply_to = Some(as_bytes(value, tag)?),
                TAG_THREAD_ID => msg.thread_id = Some(as_bytes(value, tag)?),
                TAG_SIG => msg.sig = Some(as_bytes(value, tag)?),
                TAG_BODY => msg.body = Some(value),
                TAG_EXT => msg.ext = Some(as_string_map(value, tag)?),
                other => {
                    msg.unknown_tags.insert(other, value);
                }
            }
        }

        if !saw_id {
            return Err(WireError::MissingTag(TAG_ID));
        }
        if !saw_type {
            return Err(WireError::MissingTag(TAG_TYPE));
        }
        Ok(msg)
    }
}

fn as_u64(value: Value, tag: i128) -> Result<u64, WireError> {
    match value {
        Value::Integer(i) => u64::try_from(i).map_err(|_| WireError::FieldType(tag)),
        _ => Err(WireError::FieldType(tag)),
    }
}

fn as_bytes(value: Value, tag: i128) -> Result<Vec<u8>, WireError> {
    match value {
        Value::Bytes(b) => Ok(b),
        _ => Err(WireError::FieldType(tag)),
    }
}

fn as_text(value: Value, tag: i128) -> Result<String, WireError> {
    match value {
        Value::Text(s) => Ok(s),
        _ => Err(WireError::FieldType(tag)),
    }
}

fn as_string_map(value: Value, tag: i128) -> Result<BTreeMap<String, Value>, WireError> {
    let Value::Map(map) = value else {
        return Err(WireError::FieldType(tag));
    };
    let mut out = BTreeMap::new();
    for (key, val) in map {
        let Value::Text(key) = key else {
            return Err(WireError::FieldType(tag));
        };
        out.insert(key, val);
    }
    Ok(out)
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn arb_id() -> impl Strategy<Value = MessageId> {
        prop::array::uniform16(any::<u8>())
    }

    fn arb_opt_bytes() -> impl Strategy<Value = Option<Vec<u8>>> {
        prop::option::of(prop::collection::vec(any::<u8>(), 0..64))
    }

    fn arb_message() -> impl Strategy<Value = Message> {
        (
            any::<u8>(),
            arb_id(),
            any::<u64>(),
            any::<u64>(),
            "[a-z:]{0,24}",
            "[a-z:]{0,24}",
            arb_opt_bytes(),
            arb_opt_bytes(),
            arb_opt_bytes(),
            prop::option::of(prop::collection::vec(any::<u8>(), 0..128)),
        )
            .prop_map(
                |(msg_type, id, ts, ttl, from, to, reply_to, thread_id, sig, body)| Message {
                    version: crate::types::PROTOCOL_VERSION,
                    id,
                    msg_type,
                    ts,
                    ttl,
                    from,
                    to,
                    reply_to,
                    thread_id,
                    sig,
                    body: body.map(Value::Bytes),
                    ext: None,
                    unknown_tags: BTreeMap::new(),
                },
            )
    }

    proptest! {
        #[test]
        fn encode_decode_round_trip(msg in arb_message()) {
            let bytes = msg.encode().unwrap();
            let decoded = Message::decode(&bytes).unwrap();
            prop_assert_eq!(msg, decoded);
        }

        #[test]
        fn round_trip_is_idempotent(msg in arb_message()) {
            let once = msg.encode().unwrap();
            let twice = Message::decode(&once).unwrap().encode().unwrap();
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn expiry_law(ts in 0u64..u64::MAX / 2, ttl in 1u64..u64::MAX / 4) {
            let mut msg = Message::new(0x10, "a", "b", None);
            msg.ts = ts;
            msg.ttl = ttl;
            prop_assert!(!msg.is_expired_at(ts + ttl));
            prop_assert!(msg.is_expired_at(ts + ttl + 1));
        }
    }
}
