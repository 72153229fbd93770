//! Means-to-an-end service.
//!
//! Fixed 9-byte frames, all integers big-endian `i32`:
//!
//! ```text
//! 'I' timestamp price     insert, no reply
//! 'Q' mintime   maxtime   reply: mean (4 bytes)
//! ```
//!
//! Each connection has its own price history. Frames with an unknown type
//! byte are skipped.

pub mod handler;
pub mod prices;

pub use handler::{protocol, FRAME_SIZE, NAME};
pub use prices::Prices;
