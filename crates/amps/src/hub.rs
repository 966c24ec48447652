use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use amp_common::handshake::ENQUEUE_TIMEOUT;
use async_trait::async_trait;

/// Opaque identifier for one WebSocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Callback invoked once per binary frame received on an admitted
/// connection. The single crossing point between transport and routing.
#[async_trait]
pub trait FrameHandler: Send + Sync {
    /// Handles one received frame. Protocol faults are the handler's to
    /// report back to the sender; a returned error means an internal
    /// fault, which the transport logs.
    async fn on_frame(&self, conn: ConnectionId, data: Vec<u8>) -> Result<(), crate::error::AmpsError>;
}

/// Handle held in the connection table — used to push frames to a
/// connection's write half and to request its close.
#[derive(Clone)]
pub struct ConnHandle {
    /// Channel draining into the connection's write loop.
    pub tx: mpsc::Sender<Vec<u8>>,
    /// When the connection was registered (used for eviction guards).
    pub connected_at: Instant,
    /// Per-connection cancellation; fires on close and on shutdown.
    pub cancel: CancellationToken,
}

/// Connection table owned by the transport layer.
///
/// The hub holds connections by id; the engine refers to them by id
/// only, which keeps ownership acyclic.
pub struct Hub {
    conns: DashMap<ConnectionId, ConnHandle>,
    handler: OnceLock<Arc<dyn FrameHandler>>,
    next_id: AtomicU64,
}

impl Hub {
    /// Creates an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self {
            conns: DashMap::new(),
            handler: OnceLock::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers the frame handler. May be called once; later calls are
    /// ignored and return `false`.
    pub fn set_handler(&self, handler: Arc<dyn FrameHandler>) -> bool {
        self.handler.set(handler).is_ok()
    }

    /// Returns the registered frame handler, if any.
    #[must_use]
    pub fn handler(&self) -> Option<Arc<dyn FrameHandler>> {
        self.handler.get().cloned()
    }

    /// Adds a connection and returns its fresh id.
    pub fn register(&self, tx: mpsc::Sender<Vec<u8>>, cancel: CancellationToken) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.conns.insert(
            id,
            ConnHandle {
                tx,
                connected_at: Instant::now(),
                cancel,
            },
        );
        id
    }

    /// Removes a connection, returning its handle if it was present.
    /// Safe to call twice; the second call is a no-op.
    pub fn unregister(&self, id: ConnectionId) -> Option<ConnHandle> {
        self.conns.remove(&id).map(|(_, handle)| handle)
    }

    /// Enqueues one frame to a connection's send queue.
    ///
    /// Returns `false` when the connection is unknown, closing, or its
    /// queue stays saturated past the enqueue budget.
    pub async fn send_to(&self, id: ConnectionId, data: Vec<u8>) -> bool {
        // Clone the handle out so the map shard lock is not held across
        // the enqueue await.
        let Some(handle) = self.conns.get(&id).map(|entry| entry.value().clone()) else {
            return false;
        };
        if handle.cancel.is_cancelled() {
            return false;
        }
        match tokio::time::timeout(ENQUEUE_TIMEOUT, handle.tx.send(data)).await {
            Ok(Ok(())) => true,
            Ok(Err(_)) | Err(_) => false,
        }
    }

    /// Enqueues one frame to every connection. A connection whose queue
    /// stays saturated past the enqueue budget is closed — the
    /// slow-consumer policy protects fan-out latency for everyone else.
    pub async fn broadcast(&self, data: &[u8]) {
        let handles: Vec<(ConnectionId, ConnHandle)> = self
            .conns
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        for (id, handle) in handles {
            if handle.cancel.is_cancelled() {
                continue;
            }
            match tokio::time::timeout(ENQUEUE_TIMEOUT, handle.tx.send(data.to_vec())).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => {}
                Err(_) => {
                    debug!(%id, "send queue saturated during broadcast, closing slow consumer");
                    handle.cancel.cancel();
                }
            }
        }
    }

    /// Requests that a connection close. Returns `false` for unknown ids.
    /// Closing twice is a no-op after the first close.
    pub fn close(&self, id: ConnectionId) -> bool {
        match self.conns.get(&id) {
            Some(entry) => {
                entry.value().cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Number of registered connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}
