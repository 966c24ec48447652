use amp_common::handshake::{AuthFrame, AuthResponse, FRAME_AUTH};
use amp_common::Message as AmpMessage;
use amps::auth::{Authenticator, NoOpAuthenticator, PlaceholderAuthenticator};
use amps::config::Config;
use amps::store::{MemoryStore, MessageStore};
use amps::RelayServer;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_tungstenite::tungstenite::Message as WsMessage;

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.server.address = "127.0.0.1:0".to_owned();
    // Tests drive far more than 60 messages a minute.
    config.security.rate_limit_per_minute = 0;
    config
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub server: RelayServer,
    pub store: Arc<MemoryStore>,
}

pub async fn start_server() -> TestServer {
    start_server_with_config(test_config()).await
}

pub async fn start_server_with_config(config: Config) -> TestServer {
    let authenticator: Arc<dyn Authenticator> = if config.security.enable_auth {
        Arc::new(PlaceholderAuthenticator::new())
    } else {
        Arc::new(NoOpAuthenticator::new())
    };
    let store = Arc::new(MemoryStore::new());
    let server = RelayServer::new(
        config,
        store.clone() as Arc<dyn MessageStore>,
        authenticator,
    );
    let addr = server.start().await.expect("server failed to start");
    TestServer {
        addr,
        server,
        store,
    }
}

pub fn unix_now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

type WsTx = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    WsMessage,
>;
type WsRx = futures_util::stream::SplitStream<
    tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
>;

pub struct TestClient {
    pub ws_tx: WsTx,
    pub ws_rx: WsRx,
    pub did: String,
    pub max_msg_size: usize,
}

impl TestClient {
    pub async fn connect(addr: &SocketAddr, did: &str) -> Self {
        let response = Self::try_connect(addr, did, unix_now_secs()).await;
        let (ws_tx, ws_rx, response) = response;
        assert!(
            response.is_ok(),
            "expected auth_ok, got {:?} ({:?})",
            response.frame_type,
            response.error_code
        );
        Self {
            ws_tx,
            ws_rx,
            did: did.to_owned(),
            max_msg_size: response.max_msg_size.unwrap_or(0),
        }
    }

    /// Runs the handshake with an arbitrary timestamp and returns the raw
    /// auth response instead of asserting success.
    pub async fn try_connect(
        addr: &SocketAddr,
        did: &str,
        timestamp: i64,
    ) -> (WsTx, WsRx, AuthResponse) {
        let url = format!("ws://{addr}/ws");
        let (ws, _) = tokio_tungstenite::connect_async(url)
            .await
            .expect("websocket connect failed");
        let (mut ws_tx, mut ws_rx) = ws.split();

        let nonce = hex::encode(rand::random::<[u8; 8]>());
        let auth = AuthFrame {
            frame_type: FRAME_AUTH.to_owned(),
            did: did.to_owned(),
            signature: "dev-signature".to_owned(),
            algorithm: None,
            timestamp,
            max_msg_size: None,
            nonce: Some(nonce),
        };
        ws_tx
            .send(WsMessage::Binary(serde_json::to_vec(&auth).unwrap()))
            .await
            .unwrap();

        let response = loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws_rx.next())
                .await
                .expect("timeout waiting for auth response")
                .expect("connection closed before auth response")
                .expect("websocket error during handshake");
            match msg {
                WsMessage::Binary(data) => {
                    break serde_json::from_slice::<AuthResponse>(&data)
                        .expect("unparseable auth response")
                }
                WsMessage::Ping(_) | WsMessage::Pong(_) => {}
                other => panic!("expected binary auth response, got {other:?}"),
            }
        };
        (ws_tx, ws_rx, response)
    }

    pub async fn send(&mut self, msg: &AmpMessage) {
        self.send_raw(msg.encode().unwrap()).await;
    }

    pub async fn send_raw(&mut self, data: Vec<u8>) {
        self.ws_tx.send(WsMessage::Binary(data)).await.unwrap();
    }

    pub async fn recv_raw(&mut self) -> Vec<u8> {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), self.ws_rx.next())
                .await
                .expect("timeout waiting for frame")
                .expect("connection closed")
                .expect("websocket error");
            match msg {
                WsMessage::Binary(data) => return data,
                WsMessage::Ping(_) | WsMessage::Pong(_) => {}
                other => panic!("expected binary frame, got {other:?}"),
            }
        }
    }

    pub async fn recv_message(&mut self) -> AmpMessage {
        let data = self.recv_raw().await;
        AmpMessage::decode(&data).expect("undecodable message frame")
    }

    pub async fn recv_message_timeout(&mut self, timeout: Duration) -> Option<AmpMessage> {
        tokio::time::timeout(timeout, self.recv_message()).await.ok()
    }

    /// Waits until the server closes this connection.
    pub async fn wait_for_close(&mut self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            match tokio::time::timeout(remaining, self.ws_rx.next()).await {
                Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(WsMessage::Close(_)))) => return true,
                Ok(Some(Ok(_))) => {}
                Err(_) => return false,
            }
        }
    }
}
