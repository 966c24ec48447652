//! The relay engine: admission bookkeeping, routing, store-and-forward,
//! broadcast, action dispatch, and inactive-client cleanup.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_cbor::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use amp_common::message::unix_now_ms;
use amp_common::types::{error_code, msg_type, BROADCAST_DID, RELAY_DID};
use amp_common::Message;

use crate::hub::{ConnectionId, FrameHandler, Hub};
use crate::metrics::{counters, histograms};
use crate::store::MessageStore;

/// Cadence of the inactive-client cleanup loop.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
/// A client with no traffic for this long is removed and closed.
pub const INACTIVE_CUTOFF: Duration = Duration::from_secs(5 * 60);

/// What to do when a second live connection authenticates with a DID
/// that is already bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateDidPolicy {
    /// The newest connection receives all traffic; older ones stay open
    /// but get nothing forwarded.
    NewestWins,
    /// The newest connection wins and older ones are closed.
    RejectOlder,
}

/// Engine-level routing policy knobs.
#[derive(Debug, Clone, Copy)]
pub struct RelayPolicy {
    /// Duplicate-DID tie-break behavior.
    pub duplicate_did: DuplicateDidPolicy,
    /// When `true` (the default) a message matched by a local action
    /// handler is also forwarded to its remote recipient.
    pub dispatch_and_forward: bool,
}

impl Default for RelayPolicy {
    fn default() -> Self {
        Self {
            duplicate_did: DuplicateDidPolicy::NewestWins,
            dispatch_and_forward: true,
        }
    }
}

/// In-process handler for a named action.
pub type RouteHandler = Arc<dyn Fn(&Message) -> anyhow::Result<Option<Message>> + Send + Sync>;

/// Engine-side record of an authenticated connection.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    /// The DID bound during admission.
    pub did: String,
    /// When the admission handshake completed.
    pub authenticated_at: Instant,
    /// Last frame or pong seen from this connection.
    pub last_activity: Instant,
    /// Negotiated per-message size limit.
    pub max_msg_size: usize,
}

#[derive(Debug, Clone, Copy)]
struct DidRoute {
    conn: ConnectionId,
    authenticated_at: Instant,
}

/// The relay engine. Holds connections by id only; the transport hub
/// owns the connections themselves.
pub struct RelayEngine {
    hub: Arc<Hub>,
    store: Arc<dyn MessageStore>,
    clients: DashMap<ConnectionId, ClientInfo>,
    did_index: DashMap<String, DidRoute>,
    routes: RwLock<HashMap<String, RouteHandler>>,
    policy: RelayPolicy,
    default_ttl: Duration,
}

impl RelayEngine {
    /// Creates an engine over the given hub and store. `default_ttl` is
    /// the store retention for messages that carry no TTL of their own.
    #[must_use]
    pub fn new(
        hub: Arc<Hub>,
        store: Arc<dyn MessageStore>,
        default_ttl: Duration,
        policy: RelayPolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            hub,
            store,
            clients: DashMap::new(),
            did_index: DashMap::new(),
            routes: RwLock::new(HashMap::new()),
            policy,
            default_ttl,
        })
    }

    /// Binds a DID to a connection after a successful admission
    /// handshake. The newest binding wins the DID route.
    pub fn register_client(&self, conn: ConnectionId, did: &str, max_msg_size: usize) {
        let now = Instant::now();
        self.clients.insert(
            conn,
            ClientInfo {
                did: did.to_owned(),
                authenticated_at: now,
                last_activity: now,
                max_msg_size,
            },
        );
        let previous = self.did_index.insert(
            did.to_owned(),
            DidRoute {
                conn,
                authenticated_at: now,
            },
        );
        if let Some(old) = previous {
            if old.conn != conn {
                match self.policy.duplicate_did {
                    DuplicateDidPolicy::NewestWins => {
                        debug!(did, old = %old.conn, new = %conn, "duplicate DID, newest connection wins");
                    }
                    DuplicateDidPolicy::RejectOlder => {
                        info!(did, old = %old.conn, "duplicate DID, closing older connection");
                        self.hub.close(old.conn);
                    }
                }
            }
        }
    }

    /// Removes a connection's client record. The DID route is released
    /// only if this connection still owns it.
    pub fn unregister_client(&self, conn: ConnectionId) {
        if let Some((_, info)) = self.clients.remove(&conn) {
            self.did_index
                .remove_if(&info.did, |_, route| route.conn == conn);
        }
    }

    /// Records activity on a connection, deferring its cleanup.
    pub fn touch(&self, conn: ConnectionId) {
        if let Some(mut entry) = self.clients.get_mut(&conn) {
            entry.last_activity = Instant::now();
        }
    }

    /// Number of authenticated clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Returns the DID bound to a connection, if any.
    #[must_use]
    pub fn client_did(&self, conn: ConnectionId) -> Option<String> {
        self.clients.get(&conn).map(|entry| entry.value().did.clone())
    }

    /// Registers an in-process handler for a named action.
    pub fn register_route(&self, action: &str, handler: RouteHandler) {
        self.routes
            .write()
            .expect("route table poisoned")
            .insert(action.to_owned(), handler);
    }

    /// Removes an action handler. Removing an absent action is a no-op.
    pub fn unregister_route(&self, action: &str) {
        self.routes
            .write()
            .expect("route table poisoned")
            .remove(action);
    }

    /// Spawns the periodic inactive-client cleanup loop.
    pub fn spawn_cleanup(self: &Arc<Self>, cancel: CancellationToken) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => engine.cleanup_inactive_clients(INACTIVE_CUTOFF),
                }
            }
        });
    }

    fn cleanup_inactive_clients(&self, cutoff: Duration) {
        let stale: Vec<ConnectionId> = self
            .clients
            .iter()
            .filter(|entry| entry.value().last_activity.elapsed() >= cutoff)
            .map(|entry| *entry.key())
            .collect();
        for conn in stale {
            info!(%conn, "removing inactive client");
            self.hub.close(conn);
            self.unregister_client(conn);
        }
    }

    /// Routes one received binary frame from an authenticated connection.
    pub async fn handle_message(&self, conn: ConnectionId, data: Vec<u8>) {
        let start = Instant::now();
        let Some(did) = self.touch_and_get_did(conn) else {
            debug!(%conn, "frame from unknown connection, dropping");
            return;
        };
        counters::payload_bytes_total("in", data.len() as u64);

        let msg = match Message::decode(&data) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(%conn, error = %e, "undecodable frame");
                counters::messages_dropped_total("invalid_format");
                self.send_error(conn, &did, None, error_code::INVALID_FORMAT, &e.to_string())
                    .await;
                return;
            }
        };

        if msg.from != did {
            counters::messages_dropped_total("identity_mismatch");
            self.send_error(
                conn,
                &did,
                Some(msg.id.to_vec()),
                error_code::IDENTITY_MISMATCH,
                "message sender does not match the authenticated DID",
            )
            .await;
            return;
        }

        if msg.is_expired_at(unix_now_ms()) {
            debug!(id = %msg.id_hex(), "expired message discarded");
            counters::messages_dropped_total("expired");
            return;
        }

        match msg.msg_type {
            msg_type::PING => {
                self.send_pong(conn, &msg).await;
                return;
            }
            msg_type::PONG | msg_type::ACK => return,
            t if !msg_type::is_known(t) => {
                counters::messages_dropped_total("unknown_type");
                self.send_error(
                    conn,
                    &did,
                    Some(msg.id.to_vec()),
                    error_code::UNKNOWN_TYPE,
                    &format!("type {t:#04x} is outside every defined range"),
                )
                .await;
                return;
            }
            _ => {}
        }

        // A stored message survives a failed forward; the save must land
        // before any delivery attempt.
        let retention = if msg.ttl > 0 {
            Duration::from_millis(msg.ttl)
        } else {
            self.default_ttl
        };
        if let Err(e) = self.store.save(&msg, Some(retention)).await {
            warn!(id = %msg.id_hex(), error = %e, "store rejected message");
            self.send_error(
                conn,
                &did,
                Some(msg.id.to_vec()),
                error_code::STORAGE_ERROR,
                "failed to store message",
            )
            .await;
            return;
        }
        counters::messages_stored_total();

        let action_matched = self.dispatch_action(conn, &did, &msg).await;
        if !action_matched || self.policy.dispatch_and_forward {
            self.forward(conn, &msg, &data).await;
        }

        histograms::relay_latency_seconds(start.elapsed().as_secs_f64());
    }

    fn touch_and_get_did(&self, conn: ConnectionId) -> Option<String> {
        let mut entry = self.clients.get_mut(&conn)?;
        entry.last_activity = Instant::now();
        Some(entry.did.clone())
    }

    /// Dispatches to a registered action handler. Returns `true` if a
    /// handler matched, whatever its outcome.
    async fn dispatch_action(&self, conn: ConnectionId, did: &str, msg: &Message) -> bool {
        let Some(action) = msg.action() else {
            return false;
        };
        let handler = self
            .routes
            .read()
            .expect("route table poisoned")
            .get(action)
            .cloned();
        let Some(handler) = handler else {
            return false;
        };

        match handler(msg) {
            Ok(Some(mut response)) => {
                response.msg_type = msg_type::RESPONSE;
                response.reply_to = Some(msg.id.to_vec());
                match response.encode() {
                    Ok(bytes) => {
                        if !self.hub.send_to(conn, bytes).await {
                            debug!(%conn, action, "failed to deliver action response");
                        }
                    }
                    Err(e) => warn!(action, error = %e, "failed to encode action response"),
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(action, error = %e, "route handler failed");
                self.send_error(
                    conn,
                    did,
                    Some(msg.id.to_vec()),
                    error_code::HANDLER_ERROR,
                    &e.to_string(),
                )
                .await;
            }
        }
        true
    }

    /// Forwards the already-encoded frame to its recipient, or fans it
    /// out when the message is a broadcast. Forward failures are silent:
    /// the message is already in the store for later pickup.
    async fn forward(&self, sender: ConnectionId, msg: &Message, raw: &[u8]) {
        if msg.to == RELAY_DID {
            return;
        }
        if msg.to.is_empty() || msg.to == BROADCAST_DID {
            self.broadcast_from(sender, raw).await;
            return;
        }

        let Some(route) = self.did_index.get(&msg.to).map(|entry| *entry.value()) else {
            debug!(to = %msg.to, id = %msg.id_hex(), "recipient offline, message stored");
            counters::messages_dropped_total("offline");
            return;
        };
        if self.hub.send_to(route.conn, raw.to_vec()).await {
            counters::messages_relayed_total();
            counters::payload_bytes_total("out", raw.len() as u64);
        } else {
            debug!(to = %msg.to, id = %msg.id_hex(), "forward failed, message stored");
            counters::messages_dropped_total("undeliverable");
        }
    }

    /// Fans a frame out to every authenticated connection except the
    /// sender. A connection that cannot absorb the frame within the
    /// enqueue budget is closed as a slow consumer.
    async fn broadcast_from(&self, sender: ConnectionId, raw: &[u8]) {
        let targets: Vec<ConnectionId> = self
            .clients
            .iter()
            .map(|entry| *entry.key())
            .filter(|id| *id != sender)
            .collect();
        for conn in targets {
            if self.hub.send_to(conn, raw.to_vec()).await {
                counters::messages_relayed_total();
                counters::payload_bytes_total("out", raw.len() as u64);
            } else {
                debug!(%conn, "slow consumer during broadcast, closing");
                counters::messages_dropped_total("slow_consumer");
                self.hub.close(conn);
            }
        }
    }

    async fn send_pong(&self, conn: ConnectionId, ping: &Message) {
        let mut pong = Message::new(msg_type::PONG, RELAY_DID, &ping.from, ping.body.clone());
        pong.reply_to = Some(ping.id.to_vec());
        match pong.encode() {
            Ok(bytes) => {
                let _ = self.hub.send_to(conn, bytes).await;
            }
            Err(e) => warn!(error = %e, "failed to encode pong"),
        }
    }

    async fn send_error(
        &self,
        conn: ConnectionId,
        to: &str,
        reply_to: Option<Vec<u8>>,
        code: &str,
        detail: &str,
    ) {
        match error_message(to, reply_to, code, detail).encode() {
            Ok(bytes) => {
                let _ = self.hub.send_to(conn, bytes).await;
            }
            Err(e) => warn!(error = %e, "failed to encode error message"),
        }
    }
}

#[async_trait]
impl FrameHandler for RelayEngine {
    async fn on_frame(&self, conn: ConnectionId, data: Vec<u8>) -> Result<(), crate::AmpsError> {
        self.handle_message(conn, data).await;
        Ok(())
    }
}

/// Builds an error-typed message with a stable code and human detail.
#[must_use]
pub fn error_message(to: &str, reply_to: Option<Vec<u8>>, code: &str, detail: &str) -> Message {
    let mut body = BTreeMap::new();
    body.insert(
        Value::Text("code".to_owned()),
        Value::Text(code.to_owned()),
    );
    body.insert(
        Value::Text("message".to_owned()),
        Value::Text(detail.to_owned()),
    );
    let mut msg = Message::new(msg_type::ERROR, RELAY_DID, to, Some(Value::Map(body)));
    msg.reply_to = reply_to;
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    struct TestPeer {
        conn: ConnectionId,
        rx: mpsc::Receiver<Vec<u8>>,
    }

    impl TestPeer {
        async fn recv(&mut self) -> Message {
            let bytes = tokio::time::timeout(Duration::from_secs(1), self.rx.recv())
                .await
                .expect("timeout waiting for frame")
                .expect("channel closed");
            Message::decode(&bytes).unwrap()
        }

        async fn recv_raw(&mut self) -> Vec<u8> {
            tokio::time::timeout(Duration::from_secs(1), self.rx.recv())
                .await
                .expect("timeout waiting for frame")
                .expect("channel closed")
        }

        async fn expect_silence(&mut self) {
            let result = tokio::time::timeout(Duration::from_millis(100), self.rx.recv()).await;
            assert!(result.is_err(), "expected no frame, got one");
        }
    }

    fn setup() -> (Arc<Hub>, Arc<MemoryStore>, Arc<RelayEngine>) {
        setup_with_policy(RelayPolicy::default())
    }

    fn setup_with_policy(policy: RelayPolicy) -> (Arc<Hub>, Arc<MemoryStore>, Arc<RelayEngine>) {
        let hub = Arc::new(Hub::new());
        let store = Arc::new(MemoryStore::new());
        let engine = RelayEngine::new(
            Arc::clone(&hub),
            store.clone() as Arc<dyn MessageStore>,
            Duration::from_secs(300),
            policy,
        );
        (hub, store, engine)
    }

    fn connect(hub: &Hub, engine: &RelayEngine, did: &str) -> TestPeer {
        let (tx, rx) = mpsc::channel(256);
        let conn = hub.register(tx, CancellationToken::new());
        engine.register_client(conn, did, 1024 * 1024);
        TestPeer { conn, rx }
    }

    fn error_code_of(msg: &Message) -> String {
        let Some(Value::Map(body)) = &msg.body else {
            panic!("error message without map body");
        };
        let Some(Value::Text(code)) = body.get(&Value::Text("code".to_owned())) else {
            panic!("error body without code");
        };
        code.clone()
    }

    #[tokio::test]
    async fn addressed_message_is_forwarded_verbatim() {
        let (hub, _store, engine) = setup();
        let alice = connect(&hub, &engine, "did:web:alice");
        let mut bob = connect(&hub, &engine, "did:web:bob");

        let msg = Message::new(
            msg_type::MESSAGE,
            "did:web:alice",
            "did:web:bob",
            Some(Value::Text("hi".to_owned())),
        );
        let raw = msg.encode().unwrap();
        engine.handle_message(alice.conn, raw.clone()).await;

        assert_eq!(bob.recv_raw().await, raw);
    }

    #[tokio::test]
    async fn message_is_stored_before_forwarding() {
        let (hub, store, engine) = setup();
        let alice = connect(&hub, &engine, "did:web:alice");

        let msg = Message::new(msg_type::MESSAGE, "did:web:alice", "did:web:bob", None);
        engine
            .handle_message(alice.conn, msg.encode().unwrap())
            .await;

        // Recipient offline: no error to the sender, message in store.
        let stored = store.get(&msg.id_hex()).await.unwrap();
        assert_eq!(stored, Some(msg));
    }

    #[tokio::test]
    async fn ping_gets_a_pong_with_reply_to() {
        let (hub, _store, engine) = setup();
        let mut alice = connect(&hub, &engine, "did:web:alice");

        let ping = Message::new(msg_type::PING, "did:web:alice", RELAY_DID, None);
        engine
            .handle_message(alice.conn, ping.encode().unwrap())
            .await;

        let pong = alice.recv().await;
        assert_eq!(pong.msg_type, msg_type::PONG);
        assert_eq!(pong.reply_to, Some(ping.id.to_vec()));
        assert_eq!(pong.from, RELAY_DID);
    }

    #[tokio::test]
    async fn ping_is_not_stored() {
        let (hub, store, engine) = setup();
        let mut alice = connect(&hub, &engine, "did:web:alice");

        let ping = Message::new(msg_type::PING, "did:web:alice", RELAY_DID, None);
        engine
            .handle_message(alice.conn, ping.encode().unwrap())
            .await;
        let _ = alice.recv().await;
        assert!(store.get(&ping.id_hex()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn undecodable_frame_yields_invalid_format_error() {
        let (hub, _store, engine) = setup();
        let mut alice = connect(&hub, &engine, "did:web:alice");

        engine
            .handle_message(alice.conn, vec![0xDE, 0xAD, 0xBE, 0xEF])
            .await;

        let err = alice.recv().await;
        assert_eq!(err.msg_type, msg_type::ERROR);
        assert_eq!(error_code_of(&err), error_code::INVALID_FORMAT);
        assert_eq!(err.reply_to, None);
    }

    #[tokio::test]
    async fn spoofed_sender_yields_identity_mismatch() {
        let (hub, _store, engine) = setup();
        let mut alice = connect(&hub, &engine, "did:web:alice");

        let msg = Message::new(msg_type::MESSAGE, "did:web:mallory", "did:web:bob", None);
        engine
            .handle_message(alice.conn, msg.encode().unwrap())
            .await;

        let err = alice.recv().await;
        assert_eq!(error_code_of(&err), error_code::IDENTITY_MISMATCH);
        assert_eq!(err.reply_to, Some(msg.id.to_vec()));
    }

    #[tokio::test]
    async fn expired_message_is_dropped_silently() {
        let (hub, store, engine) = setup();
        let mut alice = connect(&hub, &engine, "did:web:alice");
        let mut bob = connect(&hub, &engine, "did:web:bob");

        let mut msg = Message::new(msg_type::MESSAGE, "did:web:alice", "did:web:bob", None);
        msg.ts = unix_now_ms() - 120_000;
        msg.ttl = 60_000;
        engine
            .handle_message(alice.conn, msg.encode().unwrap())
            .await;

        bob.expect_silence().await;
        alice.expect_silence().await;
        assert!(store.get(&msg.id_hex()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_type_outside_ranges_is_rejected() {
        let (hub, _store, engine) = setup();
        let mut alice = connect(&hub, &engine, "did:web:alice");

        let mut msg = Message::new(0x10, "did:web:alice", "did:web:bob", None);
        msg.msg_type = 0xC5;
        engine
            .handle_message(alice.conn, msg.encode().unwrap())
            .await;

        let err = alice.recv().await;
        assert_eq!(error_code_of(&err), error_code::UNKNOWN_TYPE);
    }

    #[tokio::test]
    async fn unknown_type_inside_a_range_is_routable() {
        let (hub, _store, engine) = setup();
        let alice = connect(&hub, &engine, "did:web:alice");
        let mut bob = connect(&hub, &engine, "did:web:bob");

        let mut msg = Message::new(0x10, "did:web:alice", "did:web:bob", None);
        msg.msg_type = 0x6F; // presence range, undefined code
        let raw = msg.encode().unwrap();
        engine.handle_message(alice.conn, raw.clone()).await;
        assert_eq!(bob.recv_raw().await, raw);
    }

    #[tokio::test]
    async fn broadcast_reaches_everyone_but_the_sender() {
        let (hub, _store, engine) = setup();
        let mut alice = connect(&hub, &engine, "did:web:alice");
        let mut bob = connect(&hub, &engine, "did:web:bob");
        let mut carol = connect(&hub, &engine, "did:web:carol");

        let msg = Message::new(msg_type::MESSAGE, "did:web:alice", "", None);
        let raw = msg.encode().unwrap();
        engine.handle_message(alice.conn, raw.clone()).await;

        assert_eq!(bob.recv_raw().await, raw);
        assert_eq!(carol.recv_raw().await, raw);
        alice.expect_silence().await;
    }

    #[tokio::test]
    async fn action_handler_gets_a_response_with_reply_to() {
        let (hub, _store, engine) = setup();
        engine.register_route(
            "echo",
            Arc::new(|msg: &Message| {
                Ok(Some(Message::new(
                    msg_type::RESPONSE,
                    RELAY_DID,
                    &msg.from,
                    msg.body.clone(),
                )))
            }),
        );
        let mut alice = connect(&hub, &engine, "did:web:alice");

        let mut req = Message::new(
            msg_type::REQUEST,
            "did:web:alice",
            RELAY_DID,
            Some(Value::Bytes(vec![0xAA, 0xBB])),
        );
        req.set_action("echo");
        engine
            .handle_message(alice.conn, req.encode().unwrap())
            .await;

        let resp = alice.recv().await;
        assert_eq!(resp.msg_type, msg_type::RESPONSE);
        assert_eq!(resp.reply_to, Some(req.id.to_vec()));
        assert_eq!(resp.body, Some(Value::Bytes(vec![0xAA, 0xBB])));
    }

    #[tokio::test]
    async fn failing_handler_yields_handler_error() {
        let (hub, _store, engine) = setup();
        engine.register_route("boom", Arc::new(|_| anyhow::bail!("kaput")));
        let mut alice = connect(&hub, &engine, "did:web:alice");

        let mut req = Message::new(msg_type::REQUEST, "did:web:alice", RELAY_DID, None);
        req.set_action("boom");
        engine
            .handle_message(alice.conn, req.encode().unwrap())
            .await;

        let err = alice.recv().await;
        assert_eq!(error_code_of(&err), error_code::HANDLER_ERROR);
    }

    #[tokio::test]
    async fn action_and_forward_both_happen_by_default() {
        let (hub, _store, engine) = setup();
        engine.register_route(
            "echo",
            Arc::new(|msg: &Message| {
                Ok(Some(Message::new(
                    msg_type::RESPONSE,
                    RELAY_DID,
                    &msg.from,
                    msg.body.clone(),
                )))
            }),
        );
        let mut alice = connect(&hub, &engine, "did:web:alice");
        let mut bob = connect(&hub, &engine, "did:web:bob");

        let mut req = Message::new(msg_type::REQUEST, "did:web:alice", "did:web:bob", None);
        req.set_action("echo");
        engine
            .handle_message(alice.conn, req.encode().unwrap())
            .await;

        let resp = alice.recv().await;
        assert_eq!(resp.msg_type, msg_type::RESPONSE);
        let forwarded = bob.recv().await;
        assert_eq!(forwarded.id, req.id);
    }

    #[tokio::test]
    async fn dispatch_only_policy_suppresses_forwarding() {
        let (hub, _store, engine) = setup_with_policy(RelayPolicy {
            duplicate_did: DuplicateDidPolicy::NewestWins,
            dispatch_and_forward: false,
        });
        engine.register_route("echo", Arc::new(|_| Ok(None)));
        let alice = connect(&hub, &engine, "did:web:alice");
        let mut bob = connect(&hub, &engine, "did:web:bob");

        let mut req = Message::new(msg_type::REQUEST, "did:web:alice", "did:web:bob", None);
        req.set_action("echo");
        engine
            .handle_message(alice.conn, req.encode().unwrap())
            .await;

        bob.expect_silence().await;
    }

    #[tokio::test]
    async fn duplicate_did_routes_to_the_newest_connection() {
        let (hub, _store, engine) = setup();
        let mut old = connect(&hub, &engine, "did:web:bob");
        let mut new = connect(&hub, &engine, "did:web:bob");
        let alice = connect(&hub, &engine, "did:web:alice");

        let msg = Message::new(msg_type::MESSAGE, "did:web:alice", "did:web:bob", None);
        engine
            .handle_message(alice.conn, msg.encode().unwrap())
            .await;

        let got = new.recv().await;
        assert_eq!(got.id, msg.id);
        old.expect_silence().await;
    }

    #[tokio::test]
    async fn reject_older_policy_closes_the_old_connection() {
        let (hub, _store, engine) = setup_with_policy(RelayPolicy {
            duplicate_did: DuplicateDidPolicy::RejectOlder,
            dispatch_and_forward: true,
        });
        let old = connect(&hub, &engine, "did:web:bob");
        let _new = connect(&hub, &engine, "did:web:bob");

        let handle = hub.unregister(old.conn).unwrap();
        assert!(handle.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn old_connection_leaving_does_not_steal_the_did_route() {
        let (hub, _store, engine) = setup();
        let old = connect(&hub, &engine, "did:web:bob");
        let mut new = connect(&hub, &engine, "did:web:bob");
        let alice = connect(&hub, &engine, "did:web:alice");

        // The older duplicate disconnects; the route must stay with the
        // newer connection.
        engine.unregister_client(old.conn);
        hub.unregister(old.conn);

        let msg = Message::new(msg_type::MESSAGE, "did:web:alice", "did:web:bob", None);
        engine
            .handle_message(alice.conn, msg.encode().unwrap())
            .await;
        let got = new.recv().await;
        assert_eq!(got.id, msg.id);
    }

    #[tokio::test]
    async fn unregistered_route_stops_matching() {
        let (hub, _store, engine) = setup();
        engine.register_route("echo", Arc::new(|_| anyhow::bail!("should not run")));
        engine.unregister_route("echo");
        let mut alice = connect(&hub, &engine, "did:web:alice");

        let mut req = Message::new(msg_type::REQUEST, "did:web:alice", RELAY_DID, None);
        req.set_action("echo");
        engine
            .handle_message(alice.conn, req.encode().unwrap())
            .await;

        alice.expect_silence().await;
    }

    #[tokio::test]
    async fn client_did_reflects_registration() {
        let (hub, _store, engine) = setup();
        let alice = connect(&hub, &engine, "did:web:alice");
        assert_eq!(engine.client_did(alice.conn), Some("did:web:alice".to_owned()));
        engine.unregister_client(alice.conn);
        assert_eq!(engine.client_did(alice.conn), None);
    }

    #[tokio::test]
    async fn inactive_clients_are_cleaned_up() {
        let (hub, _store, engine) = setup();
        let idle = connect(&hub, &engine, "did:web:idle");
        assert_eq!(engine.client_count(), 1);

        engine.cleanup_inactive_clients(Duration::ZERO);
        assert_eq!(engine.client_count(), 0);
        let handle = hub.unregister(idle.conn).unwrap();
        assert!(handle.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn zero_ttl_message_gets_the_default_retention() {
        let (hub, store, engine) = setup();
        let alice = connect(&hub, &engine, "did:web:alice");

        let mut msg = Message::new(msg_type::MESSAGE, "did:web:alice", "did:web:bob", None);
        msg.ttl = 0;
        engine
            .handle_message(alice.conn, msg.encode().unwrap())
            .await;
        assert!(store.get(&msg.id_hex()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn storage_failure_yields_storage_error() {
        let hub = Arc::new(Hub::new());
        let store = Arc::new(MemoryStore::with_capacity(1));
        let engine = RelayEngine::new(
            Arc::clone(&hub),
            store.clone() as Arc<dyn MessageStore>,
            Duration::from_secs(300),
            RelayPolicy::default(),
        );
        let mut alice = connect(&hub, &engine, "did:web:alice");

        let first = Message::new(msg_type::MESSAGE, "did:web:alice", "did:web:bob", None);
        engine
            .handle_message(alice.conn, first.encode().unwrap())
            .await;

        let second = Message::new(msg_type::MESSAGE, "did:web:alice", "did:web:bob", None);
        engine
            .handle_message(alice.conn, second.encode().unwrap())
            .await;

        let err = alice.recv().await;
        assert_eq!(error_code_of(&err), error_code::STORAGE_ERROR);
        assert_eq!(err.reply_to, Some(second.id.to_vec()));
    }
}
