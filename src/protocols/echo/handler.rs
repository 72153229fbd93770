use crate::runtime::{ErrorPolicy, Framing, Protocol, ProtocolError};
use crate::schema::{FieldDescriptor, FieldKind, MessageSchema, SchemaRegistry};
use std::sync::Arc;

pub const NAME: &str = "echo";

/// Build the echo protocol.
pub fn protocol() -> Result<Protocol<()>, ProtocolError> {
    let line = MessageSchema::builder("Line")
        .field(FieldDescriptor::new("text", FieldKind::Text))
        .build()?;

    Protocol::builder(NAME, Framing::delimiter(b"\n"), SchemaRegistry::single(Arc::clone(&line)))
        .policy(ErrorPolicy::Tolerant)
        .on(&line, |msg, _| msg.clone().into())?
        .build()
}
