//! Bundled services.
//!
//! Each service exposes `protocol()`, which builds and validates its
//! [`Protocol`](crate::runtime::Protocol) once at startup.
//!
//! - `echo`: newline-delimited lines sent straight back
//! - `means`: per-connection price history with mean queries
//! - `heartbeat`: handshake-gated ping/pong with periodic heartbeats
//! - `kv`: newline-delimited key-value store shared by all connections

pub mod echo;
pub mod heartbeat;
pub mod kv;
pub mod means;
