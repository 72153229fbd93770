use crate::codec::Message;
use crate::protocols::means::Prices;
use crate::runtime::{ErrorPolicy, Framing, Protocol, ProtocolError, Response};
use crate::schema::{FieldDescriptor, FieldKind, MessageSchema, SchemaRegistry, Value};
use std::sync::Arc;
use tracing::trace;

pub const NAME: &str = "means";

/// Type byte plus two `i32`s.
pub const FRAME_SIZE: usize = 9;

/// Build the means protocol.
pub fn protocol() -> Result<Protocol<Prices>, ProtocolError> {
    let insert = MessageSchema::builder("Insert")
        .tag(b'I')
        .field(FieldDescriptor::new("timestamp", FieldKind::I32))
        .field(FieldDescriptor::new("price", FieldKind::I32))
        .build()?;
    let query = MessageSchema::builder("Query")
        .tag(b'Q')
        .field(FieldDescriptor::new("mintime", FieldKind::I32))
        .field(FieldDescriptor::new("maxtime", FieldKind::I32))
        .build()?;
    let mean = MessageSchema::builder("Mean")
        .field(FieldDescriptor::new("mean", FieldKind::I32))
        .build()?;

    let registry = SchemaRegistry::tagged([Arc::clone(&insert), Arc::clone(&query)])?;

    Protocol::builder(NAME, Framing::Fixed(FRAME_SIZE), registry)
        .policy(ErrorPolicy::Tolerant)
        .on(&insert, handle_insert)?
        .on(&query, move |msg, prices| handle_query(&mean, msg, prices))?
        .build()
}

fn field(msg: &Message, name: &str) -> i32 {
    msg.get(name).and_then(Value::as_i32).unwrap_or_default()
}

fn handle_insert(msg: &Message, prices: &mut Prices) -> Response {
    let timestamp = field(msg, "timestamp");
    let price = field(msg, "price");
    trace!(timestamp, price, "Insert");
    prices.insert(timestamp, price);
    Response::Empty
}

fn handle_query(mean: &Arc<MessageSchema>, msg: &Message, prices: &mut Prices) -> Response {
    let mintime = field(msg, "mintime");
    let maxtime = field(msg, "maxtime");
    let value = prices.mean(mintime, maxtime);
    trace!(mintime, maxtime, mean = value, "Query");
    Message::new(mean).with("mean", value).into()
}
