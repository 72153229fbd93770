//! Echo service.
//!
//! Line based, for smoke and throughput testing:
//!
//! ```text
//! Request:  hello\n
//! Response: hello\n
//! ```
//!
//! A line that is not valid UTF-8 is dropped and the connection stays open.
//! A final line without a newline is never echoed.

pub mod handler;

pub use handler::{protocol, NAME};
