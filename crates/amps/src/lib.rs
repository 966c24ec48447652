//! AMP relay server — a WebSocket message hub for DID-identified agents.
//!
//! The crate decomposes along the protocol's seams: the transport [`hub`]
//! owns live connections, the [`engine`] routes decoded messages with
//! store-and-forward semantics, the [`store`] persists them, and the
//! [`auth`] module admits connections.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Authenticator contract and the shipped variants.
pub mod auth;
/// Configuration loading, env overrides, and validation.
pub mod config;
mod connection;
/// Relay engine: routing, broadcast, action dispatch, cleanup.
pub mod engine;
/// Error types for relay server operations.
pub mod error;
/// Transport-side connection table.
pub mod hub;
/// Prometheus metrics and the sidecar HTTP endpoint.
pub mod metrics;
mod ratelimit;
/// Accept loop, shared state, and the server lifecycle facade.
pub mod server;
/// Message store contract and the in-memory reference implementation.
pub mod store;

pub use error::AmpsError;
pub use server::{run, RelayServer, ServerState, ServerStats};
