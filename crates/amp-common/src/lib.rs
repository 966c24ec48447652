//! Common types and wire formats shared across the AMP relay stack.
//!
//! This crate provides:
//! - The tagged message model and CBOR codec ([`message`])
//! - The JSON admission handshake frames ([`handshake`])
//! - Message-type taxonomy and protocol constants ([`types`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod handshake;
pub mod message;
pub mod types;

pub use message::{Message, MessageId, WireError};
