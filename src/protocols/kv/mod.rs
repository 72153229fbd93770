//! Key-value service.
//!
//! Newline-delimited requests against one [`Store`](crate::storage::Store)
//! shared by all connections:
//!
//! ```text
//! foo=bar\n     insert (split on the first '='), no reply
//! foo\n         reply: foo=bar\n  (empty value when absent)
//! ```
//!
//! The `version` key is preset and cannot be overwritten. A request line
//! longer than [`MAX_REQUEST`] bytes closes the connection.

pub mod handler;

pub use handler::{protocol, MAX_REQUEST, NAME};
