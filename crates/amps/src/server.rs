use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use amp_common::handshake::SHUTDOWN_BUDGET;

use crate::auth::Authenticator;
use crate::config::Config;
use crate::connection::handle_connection;
use crate::engine::{RelayEngine, RelayPolicy, RouteHandler};
use crate::error::AmpsError;
use crate::hub::Hub;
use crate::store::MessageStore;

/// Maximum number of unauthenticated (pre-admission) connections.
/// Prevents a flood from exhausting file descriptors before the
/// handshake runs.
const MAX_PRE_AUTH_CONNECTIONS: usize = 1000;

/// Shared state for the relay server.
pub struct ServerState {
    /// Runtime configuration.
    pub config: Config,
    /// Transport-side connection table.
    pub hub: Arc<Hub>,
    /// Routing engine.
    pub engine: Arc<RelayEngine>,
    /// Admission authenticator.
    pub authenticator: Arc<dyn Authenticator>,
    /// Bounds unauthenticated connections.
    pub pre_auth_semaphore: Semaphore,
    /// Server-wide shutdown signal; connections hold child tokens.
    pub shutdown: CancellationToken,
}

/// Accept loop. Runs until the listener fails or `state.shutdown` fires.
///
/// # Errors
///
/// Returns an error if the accept loop hits an unrecoverable I/O failure.
pub async fn run(listener: TcpListener, state: Arc<ServerState>) -> Result<(), AmpsError> {
    let local_addr = listener.local_addr().map_err(AmpsError::Io)?;
    info!("relay listening on {}", local_addr);

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                info!("accept loop stopping");
                return Ok(());
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        let state = Arc::clone(&state);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, addr, state).await {
                                tracing::debug!("connection from {} closed: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("failed to accept connection: {}", e);
                    }
                }
            }
        }
    }
}

/// Server statistics for operators.
#[derive(Debug, Clone)]
pub struct ServerStats {
    /// Number of authenticated clients.
    pub connected_clients: usize,
    /// The configured listen address.
    pub address: String,
    /// Whether the server is currently running.
    pub running: bool,
}

/// The relay server: wires the hub, engine, store, and authenticator
/// together and owns the lifecycle.
pub struct RelayServer {
    state: Arc<ServerState>,
    running: AtomicBool,
    accept_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RelayServer {
    /// Builds a relay server with the default routing policy.
    #[must_use]
    pub fn new(
        config: Config,
        store: Arc<dyn MessageStore>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        Self::with_policy(config, store, authenticator, RelayPolicy::default())
    }

    /// Builds a relay server with an explicit routing policy.
    #[must_use]
    pub fn with_policy(
        config: Config,
        store: Arc<dyn MessageStore>,
        authenticator: Arc<dyn Authenticator>,
        policy: RelayPolicy,
    ) -> Self {
        let hub = Arc::new(Hub::new());
        let engine = RelayEngine::new(Arc::clone(&hub), store, config.default_ttl(), policy);
        // The engine is the hub's single frame handler; this is the only
        // coupling between transport and routing.
        hub.set_handler(engine.clone());

        let state = Arc::new(ServerState {
            config,
            hub,
            engine,
            authenticator,
            pre_auth_semaphore: Semaphore::new(MAX_PRE_AUTH_CONNECTIONS),
            shutdown: CancellationToken::new(),
        });
        Self {
            state,
            running: AtomicBool::new(false),
            accept_task: Mutex::new(None),
        }
    }

    /// Shared server state, used by embedders and tests.
    #[must_use]
    pub fn state(&self) -> Arc<ServerState> {
        Arc::clone(&self.state)
    }

    /// The server-wide shutdown token. Background collaborators (store
    /// sweepers, metrics) should hold child tokens of this.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.state.shutdown.clone()
    }

    /// Registers an in-process handler for a named action.
    pub fn register_route(&self, action: &str, handler: RouteHandler) {
        self.state.engine.register_route(action, handler);
    }

    /// Removes an action handler.
    pub fn unregister_route(&self, action: &str) {
        self.state.engine.unregister_route(action);
    }

    /// Binds the listener and starts accepting connections, along with
    /// the inactive-client cleanup loop. Returns the bound address.
    ///
    /// # Errors
    ///
    /// Returns [`AmpsError::AlreadyRunning`] on a second call and
    /// [`AmpsError::Io`] if the bind fails.
    pub async fn start(&self) -> Result<SocketAddr, AmpsError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(AmpsError::AlreadyRunning);
        }

        let listener = TcpListener::bind(self.state.config.listen_addr()).await?;
        let addr = listener.local_addr()?;

        self.state
            .engine
            .spawn_cleanup(self.state.shutdown.child_token());

        let state = Arc::clone(&self.state);
        let task = tokio::spawn(async move {
            if let Err(e) = run(listener, state).await {
                error!("server error: {}", e);
            }
        });
        *self.accept_task.lock().expect("accept task slot poisoned") = Some(task);

        Ok(addr)
    }

    /// Initiates graceful shutdown: stop accepting, close every
    /// connection, and wait for the loops to drain within the shutdown
    /// budget.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("stopping relay server");
        self.state.shutdown.cancel();

        let deadline = Instant::now() + SHUTDOWN_BUDGET;
        while self.state.hub.connection_count() > 0 && Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        if self.state.hub.connection_count() > 0 {
            warn!(
                remaining = self.state.hub.connection_count(),
                "shutdown budget exceeded with connections still open"
            );
        }

        let task = self
            .accept_task
            .lock()
            .expect("accept task slot poisoned")
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
        info!("relay server stopped");
    }

    /// Returns server statistics.
    #[must_use]
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            connected_clients: self.state.engine.client_count(),
            address: self.state.config.server.address.clone(),
            running: self.running.load(Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::NoOpAuthenticator;
    use crate::store::MemoryStore;

    fn test_server() -> RelayServer {
        let mut config = Config::default();
        config.server.address = "127.0.0.1:0".to_owned();
        RelayServer::new(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(NoOpAuthenticator::new()),
        )
    }

    #[tokio::test]
    async fn second_start_is_an_error() {
        let server = test_server();
        server.start().await.unwrap();
        assert!(matches!(
            server.start().await,
            Err(AmpsError::AlreadyRunning)
        ));
        server.stop().await;
    }

    #[tokio::test]
    async fn stop_without_start_is_a_noop() {
        let server = test_server();
        server.stop().await;
    }

    #[tokio::test]
    async fn stats_reflect_lifecycle() {
        let server = test_server();
        assert!(!server.stats().running);
        server.start().await.unwrap();
        assert!(server.stats().running);
        assert_eq!(server.stats().connected_clients, 0);
        server.stop().await;
        assert!(!server.stats().running);
    }
}
