//! fastsocket: schema-driven framed TCP services.
//!
//! A service is declared as a [`runtime::Protocol`]: how the byte stream is
//! split into frames, which message schemas a frame may carry, and which
//! handler answers each message. The runtime does the rest:
//! - Framing by fixed size or delimiter
//! - Big-endian binary codec with optional tag byte per message
//! - Optional handshake and strict or tolerant error handling
//! - Background emitters bound to a connection's lifetime
//!
//! Bundled services live in [`protocols`].

pub mod codec;
pub mod config;
pub mod protocols;
pub mod runtime;
pub mod schema;
pub mod server;
pub mod storage;
