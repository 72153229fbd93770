//! Binary codec driven by [`MessageSchema`] values.
//!
//! Wire format:
//! - Optional leading tag byte
//! - Fixed-width numbers big-endian, in declared width
//! - `bool` as one byte (`0`/`1`; any non-zero decodes as `true`)
//! - Strings and lists: one unsigned length/count byte, then the payload
//! - Text: raw UTF-8 running to the end of the frame
//!
//! Decoding must consume the frame exactly; leftover bytes are an error.

use crate::schema::{
    FieldDescriptor, FieldKind, Fields, MessageSchema, SchemaRegistry, Value, MAX_VARIABLE_LEN,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::Arc;

/// A message bound to its schema.
///
/// Produced by [`decode`] for handlers, and built by handlers as replies.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    schema: Arc<MessageSchema>,
    fields: Fields,
}

impl Message {
    pub fn new(schema: &Arc<MessageSchema>) -> Self {
        Self {
            schema: Arc::clone(schema),
            fields: Fields::new(),
        }
    }

    pub fn from_fields(schema: &Arc<MessageSchema>, fields: Fields) -> Self {
        Self {
            schema: Arc::clone(schema),
            fields,
        }
    }

    /// Set a field, builder style.
    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    pub fn schema(&self) -> &Arc<MessageSchema> {
        &self.schema
    }

    pub fn name(&self) -> &str {
        self.schema.name()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    /// Encode this message against its own schema.
    pub fn encode(&self) -> Result<Bytes, EncodeError> {
        encode(&self.schema, &self.fields)
    }
}

/// Encode `fields` according to `schema`.
pub fn encode(schema: &MessageSchema, fields: &Fields) -> Result<Bytes, EncodeError> {
    let mut buf = BytesMut::with_capacity(schema.fixed_size().unwrap_or(64));
    encode_into(schema, fields, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode into an existing buffer. On error, `buf` may hold a partial message
/// and should be truncated by the caller.
pub fn encode_into(
    schema: &MessageSchema,
    fields: &Fields,
    buf: &mut BytesMut,
) -> Result<(), EncodeError> {
    if let Some(name) = fields.keys().find(|name| schema.field(name).is_none()) {
        return Err(EncodeError::UnknownField {
            schema: schema.name().to_string(),
            field: name.clone(),
        });
    }

    if let Some(tag) = schema.tag() {
        buf.put_u8(tag);
    }

    for field in schema.fields() {
        let value = fields
            .get(&field.name)
            .or(field.default.as_ref())
            .ok_or_else(|| EncodeError::MissingField {
                schema: schema.name().to_string(),
                field: field.name.clone(),
            })?;
        encode_field(field, value, buf)?;
    }

    Ok(())
}

fn encode_field(field: &FieldDescriptor, value: &Value, buf: &mut BytesMut) -> Result<(), EncodeError> {
    match (&field.kind, value) {
        (FieldKind::Str, Value::Str(s)) => {
            let len = prefix_len(field, s.len())?;
            buf.put_u8(len);
            buf.put_slice(s.as_bytes());
        }
        (FieldKind::Text, Value::Str(s)) => buf.put_slice(s.as_bytes()),
        (FieldKind::List(elem), Value::List(items)) => {
            let count = prefix_len(field, items.len())?;
            buf.put_u8(count);
            for item in items {
                put_scalar(field, elem, item, buf)?;
            }
        }
        (kind, value) => put_scalar(field, kind, value, buf)?,
    }
    Ok(())
}

fn prefix_len(field: &FieldDescriptor, len: usize) -> Result<u8, EncodeError> {
    u8::try_from(len).map_err(|_| EncodeError::TooLong {
        field: field.name.clone(),
        len,
    })
}

fn put_scalar(
    field: &FieldDescriptor,
    kind: &FieldKind,
    value: &Value,
    buf: &mut BytesMut,
) -> Result<(), EncodeError> {
    match (kind, value) {
        (FieldKind::I8, Value::I8(v)) => buf.put_i8(*v),
        (FieldKind::I16, Value::I16(v)) => buf.put_i16(*v),
        (FieldKind::I32, Value::I32(v)) => buf.put_i32(*v),
        (FieldKind::I64, Value::I64(v)) => buf.put_i64(*v),
        (FieldKind::U8, Value::U8(v)) | (FieldKind::Byte, Value::Byte(v)) => buf.put_u8(*v),
        (FieldKind::U16, Value::U16(v)) => buf.put_u16(*v),
        (FieldKind::U32, Value::U32(v)) => buf.put_u32(*v),
        (FieldKind::U64, Value::U64(v)) => buf.put_u64(*v),
        (FieldKind::F32, Value::F32(v)) => buf.put_f32(*v),
        (FieldKind::F64, Value::F64(v)) => buf.put_f64(*v),
        (FieldKind::Bool, Value::Bool(v)) => buf.put_u8(u8::from(*v)),
        (FieldKind::Rune, Value::Rune(c)) => buf.put_u32(u32::from(*c)),
        (kind, value) => {
            return Err(EncodeError::KindMismatch {
                field: field.name.clone(),
                expected: kind.name(),
                found: value.kind_name(),
            })
        }
    }
    Ok(())
}

/// Decode one frame against a registry.
///
/// For a tagged registry the first byte selects the schema. A single schema
/// that declares a tag has that tag checked.
pub fn decode(registry: &SchemaRegistry, frame: &[u8]) -> Result<Message, DecodeError> {
    match registry {
        SchemaRegistry::Single(schema) => match schema.tag() {
            None => decode_body(schema, frame),
            Some(expected) => {
                let (tag, body) = split_tag(frame)?;
                if tag != expected {
                    return Err(DecodeError::UnknownTag(tag));
                }
                decode_body(schema, body)
            }
        },
        SchemaRegistry::Tagged(_) => {
            let (tag, body) = split_tag(frame)?;
            let schema = registry.resolve(tag).ok_or(DecodeError::UnknownTag(tag))?;
            decode_body(schema, body)
        }
    }
}

fn split_tag(frame: &[u8]) -> Result<(u8, &[u8]), DecodeError> {
    match frame.split_first() {
        Some((&tag, body)) => Ok((tag, body)),
        None => Err(DecodeError::Truncated {
            field: "tag".to_string(),
            needed: 1,
            remaining: 0,
        }),
    }
}

/// Decode the fields of `schema` from `body`, which excludes any tag byte.
pub fn decode_body(schema: &Arc<MessageSchema>, mut body: &[u8]) -> Result<Message, DecodeError> {
    let mut fields = Fields::with_capacity(schema.fields().len());

    for field in schema.fields() {
        let value = decode_field(field, &mut body)?;
        fields.insert(field.name.clone(), value);
    }

    if body.has_remaining() {
        return Err(DecodeError::TrailingBytes(body.remaining()));
    }

    Ok(Message::from_fields(schema, fields))
}

fn decode_field(field: &FieldDescriptor, body: &mut &[u8]) -> Result<Value, DecodeError> {
    match &field.kind {
        FieldKind::Str => {
            let len = take_len(field, body)?;
            if body.remaining() < len {
                return Err(DecodeError::LengthOverrun {
                    field: field.name.clone(),
                    claimed: len,
                    remaining: body.remaining(),
                });
            }
            let raw = body.copy_to_bytes(len);
            utf8(field, raw.to_vec())
        }
        FieldKind::Text => {
            let raw = body.copy_to_bytes(body.remaining());
            utf8(field, raw.to_vec())
        }
        FieldKind::List(elem) => {
            let count = take_len(field, body)?;
            // Element kinds are fixed-width; checked when the schema was built.
            let width = elem.width().unwrap_or(1);
            if body.remaining() < count * width {
                return Err(DecodeError::LengthOverrun {
                    field: field.name.clone(),
                    claimed: count,
                    remaining: body.remaining(),
                });
            }
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(take_scalar(field, elem, body)?);
            }
            Ok(Value::List(items))
        }
        kind => take_scalar(field, kind, body),
    }
}

fn take_len(field: &FieldDescriptor, body: &mut &[u8]) -> Result<usize, DecodeError> {
    if !body.has_remaining() {
        return Err(DecodeError::Truncated {
            field: field.name.clone(),
            needed: 1,
            remaining: 0,
        });
    }
    Ok(usize::from(body.get_u8()))
}

fn take_scalar(field: &FieldDescriptor, kind: &FieldKind, body: &mut &[u8]) -> Result<Value, DecodeError> {
    let needed = kind.width().unwrap_or(0);
    if body.remaining() < needed {
        return Err(DecodeError::Truncated {
            field: field.name.clone(),
            needed,
            remaining: body.remaining(),
        });
    }

    let value = match kind {
        FieldKind::I8 => Value::I8(body.get_i8()),
        FieldKind::I16 => Value::I16(body.get_i16()),
        FieldKind::I32 => Value::I32(body.get_i32()),
        FieldKind::I64 => Value::I64(body.get_i64()),
        FieldKind::U8 => Value::U8(body.get_u8()),
        FieldKind::U16 => Value::U16(body.get_u16()),
        FieldKind::U32 => Value::U32(body.get_u32()),
        FieldKind::U64 => Value::U64(body.get_u64()),
        FieldKind::F32 => Value::F32(body.get_f32()),
        FieldKind::F64 => Value::F64(body.get_f64()),
        FieldKind::Bool => Value::Bool(body.get_u8() != 0),
        FieldKind::Byte => Value::Byte(body.get_u8()),
        FieldKind::Rune => {
            let raw = body.get_u32();
            let c = char::from_u32(raw).ok_or_else(|| DecodeError::InvalidRune {
                field: field.name.clone(),
                value: raw,
            })?;
            Value::Rune(c)
        }
        FieldKind::Str | FieldKind::Text | FieldKind::List(_) => {
            unreachable!("variable-length kinds are decoded by decode_field")
        }
    };
    Ok(value)
}

fn utf8(field: &FieldDescriptor, raw: Vec<u8>) -> Result<Value, DecodeError> {
    String::from_utf8(raw)
        .map(Value::Str)
        .map_err(|_| DecodeError::InvalidUtf8 {
            field: field.name.clone(),
        })
}

/// Errors raised while encoding a message.
#[derive(Debug, Clone, PartialEq)]
pub enum EncodeError {
    MissingField { schema: String, field: String },
    UnknownField { schema: String, field: String },
    KindMismatch { field: String, expected: &'static str, found: &'static str },
    /// String or list longer than [`MAX_VARIABLE_LEN`].
    TooLong { field: String, len: usize },
}

impl std::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodeError::MissingField { schema, field } => {
                write!(f, "missing value for '{schema}.{field}'")
            }
            EncodeError::UnknownField { schema, field } => {
                write!(f, "schema '{schema}' has no field '{field}'")
            }
            EncodeError::KindMismatch {
                field,
                expected,
                found,
            } => write!(f, "field '{field}' expects {expected}, got {found}"),
            EncodeError::TooLong { field, len } => write!(
                f,
                "field '{field}' has length {len}, limit is {MAX_VARIABLE_LEN}"
            ),
        }
    }
}

impl std::error::Error for EncodeError {}

/// Errors raised while decoding a frame.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeError {
    Truncated { field: String, needed: usize, remaining: usize },
    LengthOverrun { field: String, claimed: usize, remaining: usize },
    UnknownTag(u8),
    InvalidUtf8 { field: String },
    /// Surrogate or out-of-range code point in a rune field.
    InvalidRune { field: String, value: u32 },
    TrailingBytes(usize),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Truncated {
                field,
                needed,
                remaining,
            } => write!(
                f,
                "field '{field}' needs {needed} bytes, {remaining} remaining"
            ),
            DecodeError::LengthOverrun {
                field,
                claimed,
                remaining,
            } => write!(
                f,
                "field '{field}' claims length {claimed}, {remaining} bytes remaining"
            ),
            DecodeError::UnknownTag(tag) => write!(f, "unknown message tag 0x{tag:02x}"),
            DecodeError::InvalidUtf8 { field } => write!(f, "field '{field}' is not valid UTF-8"),
            DecodeError::InvalidRune { field, value } => {
                write!(f, "field '{field}' holds 0x{value:08x}, not a Unicode scalar value")
            }
            DecodeError::TrailingBytes(n) => write!(f, "{n} bytes left over after last field"),
        }
    }
}

impl std::error::Error for DecodeError {}
