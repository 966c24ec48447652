use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use amp_common::handshake::{
    negotiate_max_msg_size, AuthFrame, AuthResponse, AUTH_TIMEOUT, FRAME_AUTH, MIN_MAX_MSG_SIZE,
    PING_INTERVAL, READ_DEADLINE, SEND_QUEUE_CAPACITY, TIMESTAMP_TOLERANCE_SECS, WRITE_DEADLINE,
};
use amp_common::types::{error_code, RELAY_DID};

use crate::auth::{unix_now_secs, AuthProof};
use crate::engine::error_message;
use crate::error::AmpsError;
use crate::hub::ConnectionId;
use crate::metrics::{counters, gauges};
use crate::ratelimit::RateLimiter;
use crate::server::ServerState;

type WsSink = SplitSink<WebSocketStream<TcpStream>, WsMessage>;
type WsRecv = SplitStream<WebSocketStream<TcpStream>>;

/// Drives one TCP connection from accept to close: plain-HTTP probes,
/// the WebSocket upgrade, the admission handshake, and the message loop.
pub(crate) async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    state: Arc<ServerState>,
) -> Result<(), AmpsError> {
    // Bound the number of unauthenticated connections so a flood cannot
    // exhaust file descriptors before the handshake. Released once the
    // admission handshake completes.
    let permit = state
        .pre_auth_semaphore
        .acquire()
        .await
        .map_err(|_| AmpsError::ConnectionClosed)?;

    let read_timeout = Duration::from_secs(state.config.server.read_timeout);
    let write_timeout = Duration::from_secs(state.config.server.write_timeout);

    // Peek the request so plain HTTP (health probes, stray browsers) can
    // be answered without a WebSocket handshake.
    let mut peek_buf = [0u8; 4096];
    let n = match timeout(read_timeout, stream.peek(&mut peek_buf)).await {
        Ok(Ok(n)) => n,
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => return Err(AmpsError::ConnectionClosed),
    };
    if let Ok(preview) = std::str::from_utf8(&peek_buf[..n]) {
        let is_http = preview.starts_with("GET ")
            || preview.starts_with("HEAD ")
            || preview.starts_with("POST ");
        let wants_upgrade = preview.to_ascii_lowercase().contains("upgrade: websocket");
        if is_http && !wants_upgrade {
            return respond_plain_http(stream, preview, &state, write_timeout).await;
        }
        if is_http && wants_upgrade && !state.config.server.enable_websocket {
            debug!(%peer_addr, "websocket endpoint disabled, rejecting upgrade");
            write_http_response(&mut stream, "404 Not Found", "", write_timeout).await?;
            return Ok(());
        }
    }

    let max_payload = state.config.server.max_payload_size;
    let ws_config = WebSocketConfig {
        max_message_size: Some(max_payload),
        max_frame_size: Some(max_payload),
        ..WebSocketConfig::default()
    };

    let allowed_origins = state.config.security.allowed_origins.clone();
    let ws_stream = tokio_tungstenite::accept_hdr_async_with_config(
        stream,
        move |req: &Request, resp: Response| {
            if req.uri().path() != "/ws" {
                return Err(error_response(StatusCode::NOT_FOUND));
            }
            if !origin_allowed(&allowed_origins, req.headers().get("origin")) {
                return Err(error_response(StatusCode::FORBIDDEN));
            }
            Ok(resp)
        },
        Some(ws_config),
    )
    .await
    .map_err(AmpsError::WebSocket)?;

    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let (did, max_msg_size) = perform_admission(&mut ws_tx, &mut ws_rx, &state).await?;
    drop(permit);

    let (deliver_tx, mut deliver_rx) = mpsc::channel::<Vec<u8>>(SEND_QUEUE_CAPACITY);
    let cancel = state.shutdown.child_token();
    let conn_id = state.hub.register(deliver_tx, cancel.clone());
    state.engine.register_client(conn_id, &did, max_msg_size);
    gauges::inc_connections_active();
    info!(%conn_id, %peer_addr, %did, "agent admitted");

    let result = run_message_loop(
        &mut ws_tx,
        &mut ws_rx,
        &mut deliver_rx,
        &state,
        conn_id,
        &cancel,
        &did,
    )
    .await;

    // Every exit path of the loop lands here exactly once.
    cancel.cancel();
    state.engine.unregister_client(conn_id);
    state.hub.unregister(conn_id);
    gauges::dec_connections_active();
    debug!(%conn_id, %did, "connection closed");

    result
}

/// Reads the auth frame, drives the authenticator, and answers with
/// `auth_ok` or `auth_fail`. Failures are terminal for the connection.
async fn perform_admission(
    ws_tx: &mut WsSink,
    ws_rx: &mut WsRecv,
    state: &ServerState,
) -> Result<(String, usize), AmpsError> {
    let frame = match timeout(AUTH_TIMEOUT, next_client_frame(ws_rx)).await {
        Ok(result) => result?,
        Err(_) => {
            counters::admissions_total("timeout");
            send_auth_fail(ws_tx, "authentication timed out", "auth_timeout").await;
            return Err(AmpsError::Handshake("authentication timed out".into()));
        }
    };

    let auth: AuthFrame = match serde_json::from_slice(&frame) {
        Ok(auth) => auth,
        Err(e) => {
            counters::admissions_total("rejected");
            send_auth_fail(ws_tx, "invalid auth frame format", error_code::INVALID_FORMAT).await;
            return Err(AmpsError::Handshake(format!("unparseable auth frame: {e}")));
        }
    };

    if auth.frame_type != FRAME_AUTH {
        counters::admissions_total("rejected");
        send_auth_fail(ws_tx, "expected auth frame", "invalid_type").await;
        return Err(AmpsError::Handshake(format!(
            "first frame must be auth, got {}",
            auth.frame_type
        )));
    }
    if auth.did.is_empty() {
        counters::admissions_total("rejected");
        send_auth_fail(ws_tx, "DID cannot be empty", "invalid_did").await;
        return Err(AmpsError::Handshake("empty DID".into()));
    }
    let now = unix_now_secs();
    if (now - auth.timestamp).abs() > TIMESTAMP_TOLERANCE_SECS {
        counters::admissions_total("rejected");
        send_auth_fail(ws_tx, "timestamp out of acceptable range", "invalid_timestamp").await;
        return Err(AmpsError::Handshake("auth timestamp out of range".into()));
    }

    // Hex-encoded signatures are decoded; anything else is passed to the
    // authenticator as opaque bytes.
    let signature = hex::decode(&auth.signature).unwrap_or_else(|_| auth.signature.clone().into_bytes());
    let proof = AuthProof {
        proof_type: "signature".to_owned(),
        data: signature,
        timestamp: auth.timestamp,
        challenge: auth.nonce.clone(),
        algorithm: auth.algorithm.clone(),
    };

    if let Err(e) = state.authenticator.verify(&auth.did, &proof).await {
        counters::admissions_total("rejected");
        send_auth_fail(ws_tx, &e.message, e.code.as_str()).await;
        return Err(e.into());
    }

    let negotiated = negotiate_max_msg_size(auth.max_msg_size.unwrap_or(0), MIN_MAX_MSG_SIZE);
    let response = AuthResponse::ok(Some(RELAY_DID.to_owned()), negotiated, now);
    send_auth_response(ws_tx, &response).await?;
    counters::admissions_total("admitted");
    Ok((auth.did, negotiated))
}

/// The per-connection select loop: client frames in, deliveries out,
/// pings on a cadence, idle and shutdown handling.
async fn run_message_loop(
    ws_tx: &mut WsSink,
    ws_rx: &mut WsRecv,
    deliver_rx: &mut mpsc::Receiver<Vec<u8>>,
    state: &ServerState,
    conn_id: ConnectionId,
    cancel: &CancellationToken,
    did: &str,
) -> Result<(), AmpsError> {
    let handler = state.hub.handler();
    let mut rate_limiter = RateLimiter::new(state.config.security.rate_limit_per_minute);
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last_activity = Instant::now();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = ws_tx.send(WsMessage::Close(None)).await;
                return Ok(());
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(WsMessage::Binary(data))) => {
                        last_activity = Instant::now();
                        if !rate_limiter.check_and_record() {
                            counters::messages_dropped_total("rate_limit");
                            let err = error_message(
                                did,
                                None,
                                error_code::RATE_LIMITED,
                                "per-minute message budget exceeded",
                            );
                            if let Ok(bytes) = err.encode() {
                                let _ = state.hub.send_to(conn_id, bytes).await;
                            }
                            continue;
                        }
                        if let Some(handler) = &handler {
                            if let Err(e) = handler.on_frame(conn_id, data).await {
                                debug!(%conn_id, "frame handler error: {}", e);
                            }
                        }
                    }
                    Some(Ok(WsMessage::Ping(payload))) => {
                        last_activity = Instant::now();
                        if let Err(e) = ws_tx.send(WsMessage::Pong(payload)).await {
                            debug!("failed to send pong: {}", e);
                        }
                    }
                    Some(Ok(WsMessage::Pong(_))) => {
                        last_activity = Instant::now();
                        state.engine.touch(conn_id);
                    }
                    Some(Ok(WsMessage::Text(_))) => {
                        debug!(%conn_id, "ignoring text frame after admission");
                    }
                    Some(Ok(WsMessage::Close(_))) | None => return Ok(()),
                    Some(Err(e)) => return Err(AmpsError::WebSocket(e)),
                    _ => {}
                }
            }
            delivery = deliver_rx.recv() => {
                match delivery {
                    Some(data) => {
                        counters::payload_bytes_total("out", data.len() as u64);
                        match timeout(WRITE_DEADLINE, ws_tx.send(WsMessage::Binary(data))).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => return Err(AmpsError::WebSocket(e)),
                            Err(_) => {
                                debug!(%conn_id, "write deadline exceeded");
                                return Err(AmpsError::ConnectionClosed);
                            }
                        }
                    }
                    None => return Ok(()),
                }
            }
            _ = ping_interval.tick() => {
                if last_activity.elapsed() >= READ_DEADLINE {
                    debug!(%conn_id, "read deadline reached, closing connection");
                    return Ok(());
                }
                if let Err(e) = ws_tx.send(WsMessage::Ping(Vec::new())).await {
                    debug!("failed to send ping: {}", e);
                    return Ok(());
                }
            }
        }
    }
}

async fn next_client_frame(ws_rx: &mut WsRecv) -> Result<Vec<u8>, AmpsError> {
    loop {
        let msg = ws_rx
            .next()
            .await
            .ok_or(AmpsError::ConnectionClosed)?
            .map_err(AmpsError::WebSocket)?;
        match msg {
            WsMessage::Binary(data) => return Ok(data),
            WsMessage::Text(text) => return Ok(text.into_bytes()),
            WsMessage::Ping(_) | WsMessage::Pong(_) => {}
            WsMessage::Close(_) => return Err(AmpsError::ConnectionClosed),
            _ => {}
        }
    }
}

async fn send_auth_response(ws_tx: &mut WsSink, response: &AuthResponse) -> Result<(), AmpsError> {
    let data = serde_json::to_vec(response)
        .map_err(|e| AmpsError::Handshake(format!("failed to encode auth response: {e}")))?;
    ws_tx
        .send(WsMessage::Binary(data))
        .await
        .map_err(AmpsError::WebSocket)
}

async fn send_auth_fail(ws_tx: &mut WsSink, error: &str, code: &str) {
    let response = AuthResponse::fail(error, code, unix_now_secs());
    if let Err(e) = send_auth_response(ws_tx, &response).await {
        debug!("failed to send auth failure: {}", e);
    }
}

fn error_response(status: StatusCode) -> ErrorResponse {
    let mut resp = ErrorResponse::new(None);
    *resp.status_mut() = status;
    resp
}

fn origin_allowed(allowed: &[String], origin: Option<&HeaderValue>) -> bool {
    if allowed.is_empty() || allowed.iter().any(|entry| entry == "*") {
        return true;
    }
    // Non-browser clients send no Origin header; the allowlist only
    // constrains browsers.
    let Some(origin) = origin.and_then(|v| v.to_str().ok()) else {
        return true;
    };
    allowed.iter().any(|entry| entry == origin)
}

async fn respond_plain_http(
    mut stream: TcpStream,
    preview: &str,
    state: &ServerState,
    write_timeout: Duration,
) -> Result<(), AmpsError> {
    use tokio::io::AsyncReadExt;

    // Consume the peeked request so the close after the response is
    // clean rather than a reset.
    let mut discard = [0u8; 4096];
    let _ = stream.read(&mut discard).await;

    let path = preview.split_whitespace().nth(1).unwrap_or("/");
    if path == "/health" || path.starts_with("/health?") {
        let body = format!(
            r#"{{"status":"ok","clients":{}}}"#,
            state.hub.connection_count()
        );
        write_http_response(&mut stream, "200 OK", &body, write_timeout).await?;
    } else {
        write_http_response(&mut stream, "404 Not Found", "", write_timeout).await?;
    }
    Ok(())
}

async fn write_http_response(
    stream: &mut TcpStream,
    status: &str,
    body: &str,
    write_timeout: Duration,
) -> Result<(), AmpsError> {
    let response = format!(
        "HTTP/1.1 {status}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {body}",
        body.len()
    );
    match timeout(write_timeout, stream.write_all(response.as_bytes())).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(AmpsError::ConnectionClosed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hv(s: &str) -> HeaderValue {
        HeaderValue::from_str(s).unwrap()
    }

    #[test]
    fn empty_allowlist_allows_any_origin() {
        assert!(origin_allowed(&[], Some(&hv("https://evil.example"))));
        assert!(origin_allowed(&[], None));
    }

    #[test]
    fn wildcard_entry_allows_any_origin() {
        let allowed = vec!["*".to_owned()];
        assert!(origin_allowed(&allowed, Some(&hv("https://anywhere"))));
    }

    #[test]
    fn allowlist_is_exact_match() {
        let allowed = vec!["https://app.example".to_owned()];
        assert!(origin_allowed(&allowed, Some(&hv("https://app.example"))));
        assert!(!origin_allowed(&allowed, Some(&hv("https://other.example"))));
    }

    #[test]
    fn missing_origin_header_is_allowed() {
        let allowed = vec!["https://app.example".to_owned()];
        assert!(origin_allowed(&allowed, None));
    }
}
