//! Heartbeat service.
//!
//! Inbound frames are a fixed 5 bytes: a type byte and one big-endian `u32`.
//!
//! ```text
//! 0x40 WantHeartbeat interval   must be the first frame; interval in 1/10 s
//! 0x50 Ping          nonce      reply: 0x51 Pong nonce
//! 0x60 Bye           code       reply: 0x61 Goodbye code, then close
//!
//! 0x10 Error         msg        server only; length-prefixed string
//! ```
//!
//! After the handshake the server writes a one-byte `0x41` heartbeat every
//! interval, interleaved with replies, until the connection closes. An
//! interval of zero disables heartbeats. Any malformed frame closes the
//! connection. A second `WantHeartbeat` gets an `Error` and then a close.

pub mod handler;

pub use handler::{protocol, HeartbeatSession, ALREADY_BEATING, FRAME_SIZE, NAME};
