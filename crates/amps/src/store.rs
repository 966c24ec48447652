use amp_common::Message;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Errors a message store implementation may signal.
///
/// The in-memory reference can only fail on the capacity cap; the other
/// variants exist for disk and remote backends behind the same trait.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store's soft message cap is reached and the id is new.
    #[error("store capacity exceeded ({max} messages)")]
    CapacityExceeded {
        /// The configured cap.
        max: usize,
    },
    /// The backend could not be reached or failed an I/O operation.
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
}

/// Contract for message persistence backends.
///
/// Implementations must be safe under concurrent callers; reads may run
/// in parallel, writes are serialized. Expiry may be lazy (on read) or
/// eager (background sweep); deletion is idempotent.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Stores a message under its id. Saving an id twice overwrites.
    /// `retention` of `None` keeps the entry until explicitly deleted.
    async fn save(&self, message: &Message, retention: Option<Duration>)
        -> Result<(), StoreError>;

    /// Retrieves a message by hex id. Expired entries are removed and
    /// reported as absent.
    async fn get(&self, id_hex: &str) -> Result<Option<Message>, StoreError>;

    /// Removes a message by hex id. Removing an absent id succeeds.
    async fn delete(&self, id_hex: &str) -> Result<(), StoreError>;

    /// Returns every non-expired message, removing expired ones seen
    /// along the way.
    async fn list(&self) -> Result<Vec<Message>, StoreError>;
}

struct StoredMessage {
    message: Message,
    expires_at: Option<Instant>,
}

impl StoredMessage {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if now > at)
    }
}

/// In-memory [`MessageStore`] — the reference implementation.
///
/// A reader/writer-locked hash map keyed by hex id. Expiry is lazy on
/// `get` and `list`, with an optional background sweep.
pub struct MemoryStore {
    messages: RwLock<HashMap<String, StoredMessage>>,
    max_messages: usize,
}

impl MemoryStore {
    /// Creates an unbounded in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Creates a store with a soft cap. Zero means unlimited.
    #[must_use]
    pub fn with_capacity(max_messages: usize) -> Self {
        Self {
            messages: RwLock::new(HashMap::new()),
            max_messages,
        }
    }

    /// Number of entries currently held, including not-yet-swept expired
    /// ones.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.read().expect("store lock poisoned").len()
    }

    /// Returns `true` if the store holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every expired entry now.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut messages = self.messages.write().expect("store lock poisoned");
        let before = messages.len();
        messages.retain(|_, stored| !stored.is_expired(now));
        let removed = before - messages.len();
        if removed > 0 {
            debug!(removed, "swept expired messages");
        }
    }

    /// Spawns a background task sweeping expired entries every
    /// `interval` until `cancel` fires.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => store.sweep(),
                }
            }
        });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn save(&self, message: &Message, retention: Option<Duration>)
        -> Result<(), StoreError> {
        let id = message.id_hex();
        let expires_at = retention.map(|d| Instant::now() + d);
        let mut messages = self.messages.write().expect("store lock poisoned");

        if self.max_messages > 0
            && !messages.contains_key(&id)
            && messages.len() >= self.max_messages
        {
            // The cap is soft: purge expired entries before refusing.
            let now = Instant::now();
            messages.retain(|_, stored| !stored.is_expired(now));
            if messages.len() >= self.max_messages {
                return Err(StoreError::CapacityExceeded {
                    max: self.max_messages,
                });
            }
        }

        messages.insert(
            id,
            StoredMessage {
                message: message.clone(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn get(&self, id_hex: &str) -> Result<Option<Message>, StoreError> {
        let now = Instant::now();
        {
            let messages = self.messages.read().expect("store lock poisoned");
            match messages.get(id_hex) {
                None => return Ok(None),
                Some(stored) if !stored.is_expired(now) => {
                    return Ok(Some(stored.message.clone()));
                }
                Some(_) => {}
            }
        }

        // Expired under the shared lock: upgrade and re-check, since a
        // writer may have re-saved a fresh copy in the gap.
        let mut messages = self.messages.write().expect("store lock poisoned");
        if let Some(stored) = messages.get(id_hex) {
            if stored.is_expired(Instant::now()) {
                messages.remove(id_hex);
            } else {
                return Ok(Some(stored.message.clone()));
            }
        }
        Ok(None)
    }

    async fn delete(&self, id_hex: &str) -> Result<(), StoreError> {
        self.messages
            .write()
            .expect("store lock poisoned")
            .remove(id_hex);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Message>, StoreError> {
        let now = Instant::now();
        let mut messages = self.messages.write().expect("store lock poisoned");
        messages.retain(|_, stored| !stored.is_expired(now));
        Ok(messages.values().map(|s| s.message.clone()).collect())
    }
}
