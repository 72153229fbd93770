//! Connection session: state machine and per-connection loop.
//!
//! ```text
//! ACCEPTED ──open──▶ AWAITING_HANDSHAKE ──first frame ok──▶ STREAMING ──▶ CLOSED
//!     └──────────open (no handshake)─────────────────────────────▲
//! ```
//!
//! Everything for one frame (decode, dispatch, encode, write) happens before
//! the next read, so replies go out in frame order. Background emitters never
//! touch the transport: they hand messages to the connection task over a
//! channel, and the connection task is the only writer.

use crate::codec::{self, DecodeError, EncodeError, Message};
use crate::runtime::dispatch::{DispatchError, ReplyStream, Response};
use crate::runtime::framer::{Frame, Framer};
use crate::runtime::protocol::{ErrorPolicy, Protocol};
use bytes::BytesMut;
use futures::StreamExt;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Capacity of the emitter → connection channel.
const EMITTER_QUEUE: usize = 64;

/// Current state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Accepted,
    AwaitingHandshake,
    Streaming,
    Closed,
}

/// Why a session ended.
#[derive(Debug)]
pub enum CloseReason {
    EndOfStream,
    Handshake(SessionError),
    Decode(DecodeError),
    Encode(EncodeError),
    /// A handler returned [`Response::Close`].
    Handler,
    /// More than the protocol's frame limit arrived without completing a frame.
    FrameTooLarge { buffered: usize, limit: usize },
    Io(io::Error),
}

/// Handshake violation. Always fatal.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    Undecodable(DecodeError),
    UnexpectedMessage { expected: String, found: String },
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Undecodable(e) => write!(f, "handshake frame did not decode: {}", e),
            SessionError::UnexpectedMessage { expected, found } => {
                write!(f, "expected handshake '{expected}', got '{found}'")
            }
        }
    }
}

impl std::error::Error for SessionError {}

/// Per-connection state: framer, handshake stage and application data.
pub struct Session<S> {
    state: ConnState,
    framer: Framer,
    data: S,
    emitters: CancellationToken,
}

impl<S> Session<S> {
    pub fn new(protocol: &Protocol<S>) -> Self {
        Self {
            state: ConnState::Accepted,
            framer: Framer::new(protocol.framing().clone()),
            data: protocol.new_session(),
            emitters: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn data(&self) -> &S {
        &self.data
    }

    pub fn framer_mut(&mut self) -> &mut Framer {
        &mut self.framer
    }

    /// Leave `Accepted`, waiting for a handshake if the protocol needs one.
    pub fn open(&mut self, requires_handshake: bool) {
        if self.state == ConnState::Accepted {
            self.state = if requires_handshake {
                ConnState::AwaitingHandshake
            } else {
                ConnState::Streaming
            };
        }
    }

    /// Check the first frame of a handshake protocol and start streaming.
    pub fn accept_handshake(
        &mut self,
        expected: &str,
        decoded: Result<&Message, &DecodeError>,
    ) -> Result<(), SessionError> {
        match decoded {
            Ok(msg) if msg.name() == expected => {
                self.state = ConnState::Streaming;
                Ok(())
            }
            Ok(msg) => Err(SessionError::UnexpectedMessage {
                expected: expected.to_string(),
                found: msg.name().to_string(),
            }),
            Err(e) => Err(SessionError::Undecodable(e.clone())),
        }
    }

    /// Token that background emitters of this session watch.
    pub fn emitter_token(&self) -> CancellationToken {
        self.emitters.child_token()
    }

    /// Enter `Closed`: cancel emitters and release the buffer. Returns the
    /// number of unframed bytes that were discarded.
    pub fn close(&mut self) -> usize {
        self.state = ConnState::Closed;
        self.emitters.cancel();
        self.framer.finish()
    }
}

impl<S> Drop for Session<S> {
    fn drop(&mut self) {
        self.emitters.cancel();
    }
}

/// Outcome of processing one frame.
enum Step {
    Continue,
    Close(CloseReason),
}

/// Drive one connection until it closes.
///
/// Returns why the session ended. Transport errors are reported as
/// [`CloseReason::Io`] rather than as `Err`, so the caller always learns the
/// reason.
pub async fn serve<S, T>(io: T, protocol: Arc<Protocol<S>>) -> CloseReason
where
    S: Send + 'static,
    T: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (mut reader, writer) = tokio::io::split(io);
    let mut conn = Connection::new(writer, protocol);

    let reason = conn.run(&mut reader).await;

    let discarded = conn.session.close();
    if discarded > 0 {
        debug!(bytes = discarded, "Discarded incomplete trailing frame");
    }
    conn.outbox.close();
    reason
}

struct Connection<S, W> {
    protocol: Arc<Protocol<S>>,
    session: Session<S>,
    writer: W,
    outbox: mpsc::Receiver<Message>,
    outbox_tx: mpsc::Sender<Message>,
    out: BytesMut,
}

impl<S, W> Connection<S, W>
where
    S: Send + 'static,
    W: AsyncWrite + Unpin,
{
    fn new(writer: W, protocol: Arc<Protocol<S>>) -> Self {
        let (outbox_tx, outbox) = mpsc::channel(EMITTER_QUEUE);
        let mut session = Session::new(&protocol);
        session.open(protocol.handshake().is_some());
        Self {
            protocol,
            session,
            writer,
            outbox,
            outbox_tx,
            out: BytesMut::with_capacity(1024),
        }
    }

    async fn run<R: AsyncRead + Unpin>(&mut self, reader: &mut R) -> CloseReason {
        loop {
            while let Some(frame) = self.session.framer.next_frame() {
                if let Step::Close(reason) = self.process_frame(frame).await {
                    return reason;
                }
            }

            let buffered = self.session.framer.buffered();
            let limit = self.protocol.max_frame();
            if buffered > limit {
                warn!(buffered, limit, "Frame exceeds limit, closing");
                return CloseReason::FrameTooLarge { buffered, limit };
            }

            tokio::select! {
                read = reader.read_buf(self.session.framer.buffer_mut()) => match read {
                    Ok(0) => return CloseReason::EndOfStream,
                    Ok(n) => trace!(bytes = n, "Read from transport"),
                    Err(e) => return CloseReason::Io(e),
                },
                Some(msg) = self.outbox.recv() => {
                    if let Step::Close(reason) = self.send(vec![msg]).await {
                        return reason;
                    }
                }
            }
        }
    }

    async fn process_frame(&mut self, frame: Frame) -> Step {
        trace!(len = frame.len(), "Processing frame");
        let decoded = codec::decode(self.protocol.schemas(), &frame);

        if self.session.state() == ConnState::AwaitingHandshake {
            let expected = self
                .protocol
                .handshake()
                .map(|s| s.name().to_string())
                .unwrap_or_default();
            if let Err(e) = self.session.accept_handshake(&expected, decoded.as_ref()) {
                warn!(error = %e, "Handshake violation, closing");
                return Step::Close(CloseReason::Handshake(e));
            }
        }

        let msg = match decoded {
            Ok(msg) => msg,
            Err(e) => match self.protocol.policy() {
                ErrorPolicy::Tolerant => {
                    warn!(error = %e, "Dropping undecodable frame");
                    return Step::Continue;
                }
                ErrorPolicy::Strict => {
                    warn!(error = %e, "Undecodable frame, closing");
                    return Step::Close(CloseReason::Decode(e));
                }
            },
        };

        trace!(message = msg.name(), "Dispatching");
        let response = match self.protocol.dispatch(&msg, &mut self.session.data) {
            Ok(response) => response,
            Err(DispatchError::NoHandler(name)) => {
                warn!(message = %name, "No handler registered, dropping message");
                return Step::Continue;
            }
            Err(e) => {
                warn!(error = %e, "Dispatch failed, dropping message");
                return Step::Continue;
            }
        };

        match response {
            Response::Empty => Step::Continue,
            Response::Reply(reply) => self.send(vec![reply]).await,
            Response::Replies(replies) => self.send(replies).await,
            Response::Stream(stream) => {
                self.spawn_emitter(stream);
                Step::Continue
            }
            Response::Close(last) => {
                if let Step::Close(reason) = self.send(last.into_iter().collect()).await {
                    return Step::Close(reason);
                }
                Step::Close(CloseReason::Handler)
            }
        }
    }

    /// Encode and write replies in order, as one write.
    ///
    /// Under [`ErrorPolicy::Strict`] an unencodable reply ends the batch: the
    /// replies before it are still written, then the connection closes.
    async fn send(&mut self, replies: Vec<Message>) -> Step {
        self.out.clear();
        let mut failure = None;
        for reply in &replies {
            let start = self.out.len();
            match codec::encode_into(reply.schema(), reply.fields(), &mut self.out) {
                Ok(()) => self.protocol.framing().terminate(&mut self.out),
                Err(e) => {
                    self.out.truncate(start);
                    match self.protocol.policy() {
                        ErrorPolicy::Tolerant => {
                            warn!(error = %e, message = reply.name(), "Dropping unencodable reply");
                        }
                        ErrorPolicy::Strict => {
                            warn!(error = %e, message = reply.name(), "Unencodable reply, closing");
                            failure = Some(e);
                            break;
                        }
                    }
                }
            }
        }

        if !self.out.is_empty() {
            trace!(bytes = self.out.len(), replies = replies.len(), "Writing replies");
            if let Err(e) = self.writer.write_all(&self.out).await {
                return Step::Close(CloseReason::Io(e));
            }
            if let Err(e) = self.writer.flush().await {
                return Step::Close(CloseReason::Io(e));
            }
        }

        match failure {
            Some(e) => Step::Close(CloseReason::Encode(e)),
            None => Step::Continue,
        }
    }

    fn spawn_emitter(&self, mut stream: ReplyStream) {
        let token = self.session.emitter_token();
        let tx = self.outbox_tx.clone();
        debug!("Starting background emitter");

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    next = stream.next() => match next {
                        Some(msg) => {
                            if tx.send(msg).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            trace!("Background emitter stopped");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::framer::Framing;
    use crate::schema::{FieldDescriptor, FieldKind, MessageSchema, SchemaRegistry};
    use std::time::Duration;
    use tokio::io::duplex;
    use tokio_test::io::Builder;

    fn schema(name: &str, tag: u8) -> Arc<MessageSchema> {
        MessageSchema::builder(name)
            .tag(tag)
            .field(FieldDescriptor::new("n", FieldKind::U32))
            .build()
            .unwrap()
    }

    fn frame(tag: u8, n: u32) -> Vec<u8> {
        let mut frame = vec![tag];
        frame.extend_from_slice(&n.to_be_bytes());
        frame
    }

    struct Fixture {
        protocol: Arc<Protocol<u32>>,
        /// Held by every running tick emitter.
        ticks: Arc<()>,
    }

    /// Running-sum protocol: `A n` adds and replies `S total`, `B` replies
    /// and closes, `W` starts a ticker emitting `T 1`, `T 2`, ... and `Z`
    /// replies with a `Sum` that is missing its field. `R` replies with a
    /// batch whose middle entry is missing its field.
    fn fixture(policy: ErrorPolicy, with_handshake: bool) -> Fixture {
        let hello = schema("Hello", b'H');
        let add = schema("Add", b'A');
        let bye = schema("Bye", b'B');
        let watch = schema("Watch", b'W');
        let broken = schema("Broken", b'Z');
        let batch = schema("Batch", b'R');
        let sum = schema("Sum", b'S');
        let tick = schema("Tick", b'T');
        let ticks = Arc::new(());

        let registry = SchemaRegistry::tagged([
            Arc::clone(&hello),
            Arc::clone(&add),
            Arc::clone(&bye),
            Arc::clone(&watch),
            Arc::clone(&broken),
            Arc::clone(&batch),
        ])
        .unwrap();

        let mut builder = Protocol::<u32>::builder("sum", Framing::Fixed(5), registry).policy(policy);
        if with_handshake {
            builder = builder.handshake(&hello);
        }

        let sum_reply = Arc::clone(&sum);
        let incomplete = Arc::clone(&sum);
        let batched = Arc::clone(&sum);
        let guard = Arc::clone(&ticks);
        let protocol = builder
            .on(&hello, |_, _| Response::Empty)
            .unwrap()
            .on(&add, move |msg, total| {
                *total += msg.get("n").and_then(|v| v.as_u32()).unwrap_or(0);
                Message::new(&sum_reply).with("n", *total).into()
            })
            .unwrap()
            .on(&bye, move |_, total| {
                Response::Close(Some(Message::new(&sum).with("n", *total)))
            })
            .unwrap()
            .on(&broken, move |_, _| Message::new(&incomplete).into())
            .unwrap()
            .on(&batch, move |_, total| {
                Response::Replies(vec![
                    Message::new(&batched).with("n", *total),
                    Message::new(&batched),
                    Message::new(&batched).with("n", *total + 1),
                ])
            })
            .unwrap()
            .on(&watch, move |_, _| {
                let tick = Arc::clone(&tick);
                let state = (0u32, Arc::clone(&guard));
                let stream = futures::stream::unfold(state, move |(n, guard)| {
                    let tick = Arc::clone(&tick);
                    async move {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Some((Message::new(&tick).with("n", n + 1), (n + 1, guard)))
                    }
                });
                Response::Stream(stream.boxed())
            })
            .unwrap()
            .build()
            .unwrap();

        Fixture {
            protocol: Arc::new(protocol),
            ticks,
        }
    }

    #[tokio::test]
    async fn test_unknown_tag_is_skipped() {
        let fx = fixture(ErrorPolicy::Tolerant, false);
        let mut input = frame(b'A', 2);
        input.extend(frame(0x99, 7));
        input.extend(frame(b'A', 3));

        let io = Builder::new()
            .read(&input)
            .write(&frame(b'S', 2))
            .write(&frame(b'S', 5))
            .build();

        let reason = serve(io, fx.protocol).await;
        assert!(matches!(reason, CloseReason::EndOfStream));
    }

    #[tokio::test]
    async fn test_frame_split_across_reads() {
        let fx = fixture(ErrorPolicy::Tolerant, false);
        let io = Builder::new()
            .read(&[b'A', 0])
            .read(&[0, 0, 9])
            .write(&frame(b'S', 9))
            .build();

        assert!(matches!(serve(io, fx.protocol).await, CloseReason::EndOfStream));
    }

    #[tokio::test]
    async fn test_trailing_partial_frame_at_eof() {
        let fx = fixture(ErrorPolicy::Strict, false);
        let mut input = frame(b'A', 2);
        input.extend([b'A', 0]);

        let io = Builder::new().read(&input).write(&frame(b'S', 2)).build();
        assert!(matches!(serve(io, fx.protocol).await, CloseReason::EndOfStream));
    }

    #[tokio::test]
    async fn test_strict_decode_failure_closes() {
        let fx = fixture(ErrorPolicy::Strict, false);
        let mut input = frame(b'A', 1);
        input.extend(frame(0x99, 0));
        input.extend(frame(b'A', 1));

        let io = Builder::new().read(&input).write(&frame(b'S', 1)).build();
        let reason = serve(io, fx.protocol).await;
        assert!(matches!(
            reason,
            CloseReason::Decode(DecodeError::UnknownTag(0x99))
        ));
    }

    #[tokio::test]
    async fn test_unencodable_reply() {
        let mut input = frame(b'Z', 0);
        input.extend(frame(b'A', 1));

        let fx = fixture(ErrorPolicy::Tolerant, false);
        let io = Builder::new().read(&input).write(&frame(b'S', 1)).build();
        assert!(matches!(serve(io, fx.protocol).await, CloseReason::EndOfStream));

        let fx = fixture(ErrorPolicy::Strict, false);
        let io = Builder::new().read(&input).build();
        assert!(matches!(
            serve(io, fx.protocol).await,
            CloseReason::Encode(EncodeError::MissingField { .. })
        ));
    }

    #[tokio::test]
    async fn test_unencodable_reply_in_batch() {
        let mut input = frame(b'A', 7);
        input.extend(frame(b'R', 0));

        let fx = fixture(ErrorPolicy::Tolerant, false);
        let io = Builder::new()
            .read(&input)
            .write(&frame(b'S', 7))
            .write(&frame(b'S', 7))
            .write(&frame(b'S', 8))
            .build();
        assert!(matches!(serve(io, fx.protocol).await, CloseReason::EndOfStream));

        // The valid reply ahead of the failure still goes out.
        let fx = fixture(ErrorPolicy::Strict, false);
        let io = Builder::new()
            .read(&input)
            .write(&frame(b'S', 7))
            .write(&frame(b'S', 7))
            .build();
        assert!(matches!(
            serve(io, fx.protocol).await,
            CloseReason::Encode(EncodeError::MissingField { .. })
        ));
    }

    fn lines(max_frame: usize) -> Arc<Protocol<()>> {
        let line = MessageSchema::builder("Line")
            .field(FieldDescriptor::new("text", FieldKind::Text))
            .build()
            .unwrap();
        let protocol = Protocol::<()>::builder(
            "lines",
            Framing::delimiter(b"\n"),
            SchemaRegistry::single(Arc::clone(&line)),
        )
        .max_frame(max_frame)
        .on(&line, |msg, _| msg.clone().into())
        .unwrap()
        .build()
        .unwrap();
        Arc::new(protocol)
    }

    #[tokio::test]
    async fn test_oversized_frame_closes() {
        let io = Builder::new()
            .read(b"short\n")
            .write(b"short\n")
            .read(&[b'x'; 20])
            .build();

        let reason = serve(io, lines(16)).await;
        assert!(matches!(
            reason,
            CloseReason::FrameTooLarge { buffered: 20, limit: 16 }
        ));
    }

    #[tokio::test]
    async fn test_frame_limit_spans_reads() {
        // Each read is small, the total is not.
        let io = Builder::new()
            .read(b"0123456789")
            .read(b"0123456789")
            .build();
        assert!(matches!(
            serve(io, lines(16)).await,
            CloseReason::FrameTooLarge { limit: 16, .. }
        ));

        // A line at the limit, delimiter included, is accepted.
        let io = Builder::new()
            .read(b"0123456789abcde\n")
            .write(b"0123456789abcde\n")
            .build();
        assert!(matches!(serve(io, lines(16)).await, CloseReason::EndOfStream));
    }

    #[tokio::test]
    async fn test_handshake_violation_closes_without_reply() {
        let fx = fixture(ErrorPolicy::Tolerant, true);
        let io = Builder::new().read(&frame(b'A', 1)).build();

        let reason = serve(io, fx.protocol).await;
        assert!(matches!(
            reason,
            CloseReason::Handshake(SessionError::UnexpectedMessage { ref found, .. }) if found == "Add"
        ));
    }

    #[tokio::test]
    async fn test_undecodable_handshake_closes_even_when_tolerant() {
        let fx = fixture(ErrorPolicy::Tolerant, true);
        let io = Builder::new().read(&frame(0x99, 0)).build();

        let reason = serve(io, fx.protocol).await;
        assert!(matches!(
            reason,
            CloseReason::Handshake(SessionError::Undecodable(DecodeError::UnknownTag(0x99)))
        ));
    }

    #[tokio::test]
    async fn test_handshake_then_streaming() {
        let fx = fixture(ErrorPolicy::Strict, true);
        let mut input = frame(b'H', 0);
        input.extend(frame(b'A', 4));

        let io = Builder::new().read(&input).write(&frame(b'S', 4)).build();
        assert!(matches!(serve(io, fx.protocol).await, CloseReason::EndOfStream));
    }

    #[tokio::test]
    async fn test_handler_close_sends_last_reply() {
        let fx = fixture(ErrorPolicy::Tolerant, false);
        let mut input = frame(b'A', 5);
        input.extend(frame(b'B', 0));
        input.extend(frame(b'A', 1));

        let io = Builder::new()
            .read(&input)
            .write(&frame(b'S', 5))
            .write(&frame(b'S', 5))
            .build();
        assert!(matches!(serve(io, fx.protocol).await, CloseReason::Handler));
    }

    #[tokio::test]
    async fn test_emitter_stops_when_connection_closes() {
        let fx = fixture(ErrorPolicy::Tolerant, false);
        let baseline = Arc::strong_count(&fx.ticks);
        let (mut client, server) = duplex(64);
        let task = tokio::spawn(serve(server, Arc::clone(&fx.protocol)));

        client.write_all(&frame(b'W', 0)).await.unwrap();
        let mut buf = [0u8; 10];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[..5], &frame(b'T', 1)[..]);
        assert_eq!(&buf[5..], &frame(b'T', 2)[..]);

        drop(client);
        let reason = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            reason,
            CloseReason::EndOfStream | CloseReason::Io(_)
        ));

        tokio::time::timeout(Duration::from_secs(1), async {
            while Arc::strong_count(&fx.ticks) > baseline {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn test_session_state_machine() {
        let fx = fixture(ErrorPolicy::Strict, true);
        let mut session = Session::new(&fx.protocol);
        assert_eq!(session.state(), ConnState::Accepted);

        session.open(true);
        assert_eq!(session.state(), ConnState::AwaitingHandshake);

        let add = codec::decode(fx.protocol.schemas(), &frame(b'A', 1)).unwrap();
        assert!(session.accept_handshake("Hello", Ok(&add)).is_err());
        assert_eq!(session.state(), ConnState::AwaitingHandshake);

        let hello = codec::decode(fx.protocol.schemas(), &frame(b'H', 0)).unwrap();
        session.accept_handshake("Hello", Ok(&hello)).unwrap();
        assert_eq!(session.state(), ConnState::Streaming);
        assert_eq!(*session.data(), 0);

        let token = session.emitter_token();
        session.framer_mut().feed(b"AB");
        assert_eq!(session.close(), 2);
        assert!(token.is_cancelled());
        assert_eq!(session.state(), ConnState::Closed);

        session.open(false);
        assert_eq!(session.state(), ConnState::Closed);
    }
}
