use crate::codec::Message;
use crate::runtime::{ErrorPolicy, Framing, Protocol, ProtocolError, ReplyStream, Response};
use crate::schema::{FieldDescriptor, FieldKind, MessageSchema, SchemaRegistry, Value};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

pub const NAME: &str = "heartbeat";

/// Type byte plus one `u32`.
pub const FRAME_SIZE: usize = 5;

/// Text of the error sent before closing on a repeated `WantHeartbeat`.
pub const ALREADY_BEATING: &str = "heartbeat already requested";

/// One interval unit.
const DECISECOND: Duration = Duration::from_millis(100);

/// Per-connection state.
#[derive(Debug, Default)]
pub struct HeartbeatSession {
    heartbeat_requested: bool,
}

struct Outbound {
    heartbeat: Arc<MessageSchema>,
    pong: Arc<MessageSchema>,
    goodbye: Arc<MessageSchema>,
    error: Arc<MessageSchema>,
}

/// Build the heartbeat protocol.
pub fn protocol() -> Result<Protocol<HeartbeatSession>, ProtocolError> {
    let want = tagged_u32("WantHeartbeat", 0x40, "interval")?;
    let ping = tagged_u32("Ping", 0x50, "nonce")?;
    let bye = tagged_u32("Bye", 0x60, "code")?;
    let out = Arc::new(Outbound {
        heartbeat: MessageSchema::builder("Heartbeat").tag(0x41).build()?,
        pong: tagged_u32("Pong", 0x51, "nonce")?,
        goodbye: tagged_u32("Goodbye", 0x61, "code")?,
        error: MessageSchema::builder("Error")
            .tag(0x10)
            .field(FieldDescriptor::new("msg", FieldKind::Str))
            .build()?,
    });

    let registry = SchemaRegistry::tagged([Arc::clone(&want), Arc::clone(&ping), Arc::clone(&bye)])?;

    let on_want = Arc::clone(&out);
    let on_ping = Arc::clone(&out);
    let on_bye = out;
    Protocol::builder(NAME, Framing::Fixed(FRAME_SIZE), registry)
        .handshake(&want)
        .policy(ErrorPolicy::Strict)
        .on(&want, move |msg, session| handle_want(&on_want, msg, session))?
        .on(&ping, move |msg, _| {
            let nonce = field(msg, "nonce");
            Message::new(&on_ping.pong).with("nonce", nonce).into()
        })?
        .on(&bye, move |msg, _| {
            let code = field(msg, "code");
            debug!(code, "Client said goodbye");
            Response::Close(Some(Message::new(&on_bye.goodbye).with("code", code)))
        })?
        .build()
}

fn tagged_u32(name: &str, tag: u8, field: &str) -> Result<Arc<MessageSchema>, ProtocolError> {
    Ok(MessageSchema::builder(name)
        .tag(tag)
        .field(FieldDescriptor::new(field, FieldKind::U32))
        .build()?)
}

fn field(msg: &Message, name: &str) -> u32 {
    msg.get(name).and_then(Value::as_u32).unwrap_or_default()
}

fn handle_want(out: &Outbound, msg: &Message, session: &mut HeartbeatSession) -> Response {
    if session.heartbeat_requested {
        warn!("Repeated heartbeat request, closing");
        let error = Message::new(&out.error).with("msg", ALREADY_BEATING);
        return Response::Close(Some(error));
    }
    session.heartbeat_requested = true;

    let interval = field(msg, "interval");
    if interval == 0 {
        debug!("Heartbeats disabled");
        return Response::Empty;
    }

    let period = DECISECOND * interval;
    debug!(period_ms = period.as_millis() as u64, "Starting heartbeats");
    Response::Stream(heartbeats(&out.heartbeat, period))
}

/// Endless heartbeats, the first one `period` from now.
fn heartbeats(schema: &Arc<MessageSchema>, period: Duration) -> ReplyStream {
    let mut ticks = interval_at(Instant::now() + period, period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    futures::stream::unfold((ticks, Arc::clone(schema)), |(mut ticks, schema)| async move {
        ticks.tick().await;
        let beat = Message::new(&schema);
        Some((beat, (ticks, schema)))
    })
    .boxed()
}
