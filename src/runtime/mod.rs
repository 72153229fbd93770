//! Connection runtime.
//!
//! - `framer`: byte stream to frames
//! - `dispatch`: message to handler
//! - `protocol`: validated bundle of framing, schemas, policy and handlers
//! - `connection`: per-connection session state machine and I/O loop
//!
//! The runtime is generic over the session data `S` of a protocol. Services
//! live in `crate::protocols`.

pub mod connection;
pub mod dispatch;
pub mod framer;
pub mod protocol;

pub use connection::{serve, CloseReason, ConnState, Session, SessionError};
pub use dispatch::{DispatchError, ReplyStream, Response};
pub use framer::{Frame, Framer, Framing, FramingError};
pub use protocol::{ErrorPolicy, Protocol, ProtocolBuilder, ProtocolError, DEFAULT_MAX_FRAME};
