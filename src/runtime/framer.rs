//! Splits a connection's byte stream into frames.
//!
//! Two strategies, fixed per protocol:
//! - `Fixed(n)`: every frame is exactly `n` bytes
//! - `Delimiter(sep)`: a frame is everything before the next `sep`, which is
//!   consumed and dropped
//!
//! The framer never blocks and never inspects frame content. Reading from the
//! transport happens outside, straight into [`Framer::buffer_mut`] or via
//! [`Framer::feed`].

use bytes::{BufMut, Bytes, BytesMut};

/// Initial capacity of the accumulation buffer.
const BUFFER_SIZE: usize = 4 * 1024;

/// One undecoded message.
pub type Frame = Bytes;

/// Framing strategy of a protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Framing {
    Fixed(usize),
    Delimiter(Bytes),
}

impl Framing {
    pub fn delimiter(sep: &'static [u8]) -> Self {
        Framing::Delimiter(Bytes::from_static(sep))
    }

    pub fn validate(&self) -> Result<(), FramingError> {
        match self {
            Framing::Fixed(0) => Err(FramingError::ZeroSize),
            Framing::Delimiter(sep) if sep.is_empty() => Err(FramingError::EmptyDelimiter),
            _ => Ok(()),
        }
    }

    /// Terminate an outbound message. Delimiter protocols end every reply
    /// with the delimiter; fixed-size replies are written as-is.
    pub fn terminate(&self, buf: &mut BytesMut) {
        if let Framing::Delimiter(sep) = self {
            buf.put_slice(sep);
        }
    }
}

/// Per-connection frame accumulator.
#[derive(Debug)]
pub struct Framer {
    framing: Framing,
    buffer: BytesMut,
    /// Bytes of `buffer` already known not to start a delimiter.
    searched: usize,
}

impl Framer {
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            buffer: BytesMut::with_capacity(BUFFER_SIZE),
            searched: 0,
        }
    }

    pub fn framing(&self) -> &Framing {
        &self.framing
    }

    /// Append bytes received from the transport.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Buffer to read into directly (e.g. with `AsyncReadExt::read_buf`).
    /// Only appending is allowed.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Number of bytes waiting for a complete frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Take the next complete frame, if the buffer holds one.
    pub fn next_frame(&mut self) -> Option<Frame> {
        match &self.framing {
            Framing::Fixed(size) => {
                if self.buffer.len() < *size {
                    return None;
                }
                Some(self.buffer.split_to(*size).freeze())
            }
            Framing::Delimiter(sep) => {
                let start = self.searched;
                let found = self.buffer[start..]
                    .windows(sep.len())
                    .position(|w| w == &sep[..]);
                match found {
                    Some(pos) => {
                        let end = start + pos;
                        let frame = self.buffer.split_to(end).freeze();
                        let _ = self.buffer.split_to(sep.len());
                        self.searched = 0;
                        Some(frame)
                    }
                    None => {
                        // A partial delimiter may sit at the tail; rescan it next time.
                        self.searched = self.buffer.len().saturating_sub(sep.len() - 1);
                        None
                    }
                }
            }
        }
    }

    /// All frames currently available, in arrival order.
    pub fn drain(&mut self) -> Drain<'_> {
        Drain { framer: self }
    }

    /// End of stream. Drops and releases whatever never formed a complete
    /// frame, returning how many bytes that was.
    pub fn finish(&mut self) -> usize {
        let discarded = self.buffer.len();
        self.buffer = BytesMut::new();
        self.searched = 0;
        discarded
    }
}

/// Iterator returned by [`Framer::drain`].
pub struct Drain<'a> {
    framer: &'a mut Framer,
}

impl Iterator for Drain<'_> {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        self.framer.next_frame()
    }
}

/// Invalid framing parameters, rejected when a protocol is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingError {
    ZeroSize,
    EmptyDelimiter,
}

impl std::fmt::Display for FramingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FramingError::ZeroSize => write!(f, "fixed frame size must be at least 1"),
            FramingError::EmptyDelimiter => write!(f, "frame delimiter must not be empty"),
        }
    }
}

impl std::error::Error for FramingError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(framer: &mut Framer) -> Vec<Bytes> {
        framer.drain().collect()
    }

    #[test]
    fn test_delimiter_frames() {
        let mut framer = Framer::new(Framing::delimiter(b"<sep>"));
        framer.feed(b"AB<sep>CD<sep>E");

        assert_eq!(collect(&mut framer), vec![&b"AB"[..], &b"CD"[..]]);
        assert_eq!(framer.buffered(), 1);

        framer.feed(b"F<sep>");
        assert_eq!(collect(&mut framer), vec![&b"EF"[..]]);
        assert_eq!(framer.finish(), 0);
    }

    #[test]
    fn test_delimiter_split_across_feeds() {
        let mut framer = Framer::new(Framing::delimiter(b"\r\n"));
        framer.feed(b"hello\r");
        assert!(framer.next_frame().is_none());
        framer.feed(b"\nworld\r\n");
        assert_eq!(collect(&mut framer), vec![&b"hello"[..], &b"world"[..]]);
    }

    #[test]
    fn test_empty_frames_between_delimiters() {
        let mut framer = Framer::new(Framing::delimiter(b"\n"));
        framer.feed(b"\n\nx\n");
        assert_eq!(collect(&mut framer), vec![&b""[..], &b""[..], &b"x"[..]]);
    }

    #[test]
    fn test_fixed_frames() {
        let mut framer = Framer::new(Framing::Fixed(3));
        framer.feed(b"abcdefgh");
        assert_eq!(collect(&mut framer), vec![&b"abc"[..], &b"def"[..]]);
        assert_eq!(framer.buffered(), 2);
    }

    #[test]
    fn test_fixed_chunk_independence() {
        let stream: Vec<u8> = (0..40u8).collect();

        let mut whole = Framer::new(Framing::Fixed(6));
        whole.feed(&stream);
        let expected = collect(&mut whole);

        let mut bytewise = Framer::new(Framing::Fixed(6));
        let mut frames = Vec::new();
        for b in &stream {
            bytewise.feed(std::slice::from_ref(b));
            frames.extend(bytewise.drain());
        }

        assert_eq!(frames, expected);
        assert_eq!(frames.len(), 6);
        assert_eq!(bytewise.finish(), 4);
    }

    #[test]
    fn test_delimiter_chunk_independence() {
        let stream = b"one\r\ntwo\r\n\r\nthree\r\nfour";

        let mut whole = Framer::new(Framing::delimiter(b"\r\n"));
        whole.feed(stream);
        let expected = collect(&mut whole);

        let mut bytewise = Framer::new(Framing::delimiter(b"\r\n"));
        let mut frames = Vec::new();
        for b in stream {
            bytewise.feed(std::slice::from_ref(b));
            frames.extend(bytewise.drain());
        }

        assert_eq!(frames, expected);
        assert_eq!(bytewise.finish(), 4);
    }

    #[test]
    fn test_finish_reports_discarded_bytes() {
        let mut framer = Framer::new(Framing::delimiter(b"\n"));
        framer.feed(b"complete\npartial");
        assert_eq!(framer.drain().count(), 1);
        assert_eq!(framer.finish(), 7);
    }

    #[test]
    fn test_validate() {
        assert_eq!(Framing::Fixed(0).validate(), Err(FramingError::ZeroSize));
        assert_eq!(
            Framing::delimiter(b"").validate(),
            Err(FramingError::EmptyDelimiter)
        );
        assert!(Framing::Fixed(9).validate().is_ok());
    }

    #[test]
    fn test_terminate() {
        let mut buf = BytesMut::from(&b"reply"[..]);
        Framing::delimiter(b"\n").terminate(&mut buf);
        assert_eq!(&buf[..], b"reply\n");

        let mut buf = BytesMut::from(&b"reply"[..]);
        Framing::Fixed(5).terminate(&mut buf);
        assert_eq!(&buf[..], b"reply");
    }
}
