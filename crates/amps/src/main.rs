#![forbid(unsafe_code)]

use amp_common::types::{msg_type, RELAY_DID};
use amp_common::Message;
use amps::auth::{Authenticator, NoOpAuthenticator, PlaceholderAuthenticator};
use amps::config::{Args, Config};
use amps::metrics::{start_metrics_server, HealthState};
use amps::store::{MemoryStore, MessageStore};
use amps::RelayServer;
use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;

    init_logging(&config)?;

    let store = build_store(&config)?;
    let authenticator: Arc<dyn Authenticator> = if config.security.enable_auth {
        info!("authentication enabled (placeholder DID verification)");
        Arc::new(PlaceholderAuthenticator::new())
    } else {
        warn!("authentication disabled");
        Arc::new(NoOpAuthenticator::new())
    };

    let metrics_addr: std::net::SocketAddr = config
        .server
        .metrics_addr
        .parse()
        .with_context(|| format!("invalid metrics_addr {}", config.server.metrics_addr))?;
    let cleanup_interval = config.cleanup_interval();

    let server = RelayServer::new(
        config,
        store.clone() as Arc<dyn MessageStore>,
        authenticator,
    );
    store.spawn_sweeper(cleanup_interval, server.shutdown_token().child_token());

    server.register_route("ping", Arc::new(handle_ping));
    server.register_route("echo", Arc::new(handle_echo));

    let health_state = HealthState::new();
    tokio::spawn({
        let health_state = health_state.clone();
        async move {
            if let Err(e) = start_metrics_server(metrics_addr, health_state).await {
                warn!("metrics server error: {}", e);
            }
        }
    });

    let addr = server.start().await.context("failed to start relay")?;
    info!("AMP relay server running on {}", addr);

    tokio::signal::ctrl_c().await?;
    info!("received shutdown signal");
    health_state.set_ready(false);
    server.stop().await;

    Ok(())
}

fn build_store(config: &Config) -> Result<Arc<MemoryStore>> {
    match config.storage.kind.to_ascii_lowercase().as_str() {
        "memory" => Ok(Arc::new(MemoryStore::with_capacity(
            config.storage.max_messages,
        ))),
        other => anyhow::bail!("storage type {other:?} is not built in; use \"memory\""),
    }
}

fn handle_ping(msg: &Message) -> anyhow::Result<Option<Message>> {
    let body = serde_cbor::Value::Text("pong".to_owned());
    Ok(Some(Message::new(
        msg_type::RESPONSE,
        RELAY_DID,
        &msg.from,
        Some(body),
    )))
}

fn handle_echo(msg: &Message) -> anyhow::Result<Option<Message>> {
    Ok(Some(Message::new(
        msg_type::RESPONSE,
        RELAY_DID,
        &msg.from,
        msg.body.clone(),
    )))
}

fn init_logging(config: &Config) -> Result<()> {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .context("invalid log level")?;

    let format_json = config.logging.format.eq_ignore_ascii_case("json");
    match config.logging.output.as_str() {
        "stdout" => {
            if format_json {
                tracing_subscriber::fmt().with_env_filter(filter).json().init();
            } else {
                tracing_subscriber::fmt().with_env_filter(filter).init();
            }
        }
        "stderr" => {
            if format_json {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(std::io::stderr)
                    .json()
                    .init();
            } else {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(std::io::stderr)
                    .init();
            }
        }
        path => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {path}"))?;
            let writer = std::sync::Mutex::new(file);
            if format_json {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(writer)
                    .json()
                    .init();
            } else {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(writer)
                    .init();
            }
        }
    }
    Ok(())
}
