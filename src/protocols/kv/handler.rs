use crate::codec::Message;
use crate::runtime::{ErrorPolicy, Framing, Protocol, ProtocolError, Response};
use crate::schema::{FieldDescriptor, FieldKind, MessageSchema, SchemaRegistry, Value};
use crate::storage::{InsertResult, Store};
use std::sync::Arc;
use tracing::{debug, trace};

pub const NAME: &str = "kv";

/// Longest request line, newline included.
pub const MAX_REQUEST: usize = 1000;

/// Build the kv protocol over `store`.
pub fn protocol(store: Arc<Store>) -> Result<Protocol<()>, ProtocolError> {
    let request = MessageSchema::builder("Request")
        .field(FieldDescriptor::new("text", FieldKind::Text))
        .build()?;
    let reply = MessageSchema::builder("Reply")
        .field(FieldDescriptor::new("text", FieldKind::Text))
        .build()?;

    Protocol::builder(NAME, Framing::delimiter(b"\n"), SchemaRegistry::single(Arc::clone(&request)))
        .policy(ErrorPolicy::Tolerant)
        .max_frame(MAX_REQUEST)
        .on(&request, move |msg, _| handle_request(&store, &reply, msg))?
        .build()
}

fn handle_request(store: &Store, reply: &Arc<MessageSchema>, msg: &Message) -> Response {
    let text = msg.get("text").and_then(Value::as_str).unwrap_or_default();

    match text.split_once('=') {
        Some((key, value)) => {
            if store.insert(key, value) == InsertResult::Rejected {
                debug!(key, "Ignoring write to immutable key");
            }
            Response::Empty
        }
        None => {
            let value = store.get(text).unwrap_or_default();
            trace!(key = text, "Retrieve");
            Message::new(reply).with("text", format!("{text}={value}")).into()
        }
    }
}
