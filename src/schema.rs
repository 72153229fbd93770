//! Message schemas.
//!
//! A schema is an ordered list of typed fields, built once at startup with
//! [`MessageSchema::builder`] and shared behind an `Arc` afterwards. Schemas
//! that carry a leading tag byte are grouped into a [`SchemaRegistry`], which
//! the codec consults to pick the concrete schema for a frame.

use std::collections::HashMap;
use std::sync::Arc;

/// Maximum length of a length-prefixed string or list.
pub const MAX_VARIABLE_LEN: usize = u8::MAX as usize;

/// Wire type of a single field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    /// One byte, `0` or `1` on encode.
    Bool,
    /// A single raw byte.
    Byte,
    /// Unicode scalar value carried as a big-endian 32-bit integer.
    Rune,
    /// UTF-8 string with a one-byte length prefix.
    Str,
    /// UTF-8 string filling the rest of the frame, no prefix. Last field only.
    Text,
    /// Homogeneous list with a one-byte count prefix.
    List(Box<FieldKind>),
}

impl FieldKind {
    /// Encoded width in bytes, or `None` for variable-length kinds.
    pub fn width(&self) -> Option<usize> {
        match self {
            FieldKind::I8 | FieldKind::U8 | FieldKind::Bool | FieldKind::Byte => Some(1),
            FieldKind::I16 | FieldKind::U16 => Some(2),
            FieldKind::I32 | FieldKind::U32 | FieldKind::F32 | FieldKind::Rune => Some(4),
            FieldKind::I64 | FieldKind::U64 | FieldKind::F64 => Some(8),
            FieldKind::Str | FieldKind::Text | FieldKind::List(_) => None,
        }
    }

    pub fn is_variable(&self) -> bool {
        self.width().is_none()
    }

    /// Short name used in error messages.
    pub fn name(&self) -> &'static str {
        match self {
            FieldKind::I8 => "i8",
            FieldKind::I16 => "i16",
            FieldKind::I32 => "i32",
            FieldKind::I64 => "i64",
            FieldKind::U8 => "u8",
            FieldKind::U16 => "u16",
            FieldKind::U32 => "u32",
            FieldKind::U64 => "u64",
            FieldKind::F32 => "f32",
            FieldKind::F64 => "f64",
            FieldKind::Bool => "bool",
            FieldKind::Byte => "byte",
            FieldKind::Rune => "rune",
            FieldKind::Str => "str",
            FieldKind::Text => "text",
            FieldKind::List(_) => "list",
        }
    }

    /// Check whether `value` has the shape this kind encodes.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (FieldKind::I8, Value::I8(_))
            | (FieldKind::I16, Value::I16(_))
            | (FieldKind::I32, Value::I32(_))
            | (FieldKind::I64, Value::I64(_))
            | (FieldKind::U8, Value::U8(_))
            | (FieldKind::U16, Value::U16(_))
            | (FieldKind::U32, Value::U32(_))
            | (FieldKind::U64, Value::U64(_))
            | (FieldKind::F32, Value::F32(_))
            | (FieldKind::F64, Value::F64(_))
            | (FieldKind::Bool, Value::Bool(_))
            | (FieldKind::Byte, Value::Byte(_))
            | (FieldKind::Rune, Value::Rune(_))
            | (FieldKind::Str, Value::Str(_))
            | (FieldKind::Text, Value::Str(_)) => true,
            (FieldKind::List(elem), Value::List(items)) => items.iter().all(|v| elem.accepts(v)),
            _ => false,
        }
    }
}

/// A decoded or to-be-encoded field value.
///
/// Floats compare by bit pattern, so a NaN equals itself and `0.0 != -0.0`.
#[derive(Debug, Clone)]
pub enum Value {
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Bool(bool),
    Byte(u8),
    Rune(char),
    Str(String),
    List(Vec<Value>),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::I8(a), Value::I8(b)) => a == b,
            (Value::I16(a), Value::I16(b)) => a == b,
            (Value::I32(a), Value::I32(b)) => a == b,
            (Value::I64(a), Value::I64(b)) => a == b,
            (Value::U8(a), Value::U8(b)) => a == b,
            (Value::U16(a), Value::U16(b)) => a == b,
            (Value::U32(a), Value::U32(b)) => a == b,
            (Value::U64(a), Value::U64(b)) => a == b,
            (Value::F32(a), Value::F32(b)) => a.to_bits() == b.to_bits(),
            (Value::F64(a), Value::F64(b)) => a.to_bits() == b.to_bits(),
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Byte(a), Value::Byte(b)) => a == b,
            (Value::Rune(a), Value::Rune(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            _ => false,
        }
    }
}

impl Value {
    /// Short name of the variant, matching [`FieldKind::name`].
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::I8(_) => "i8",
            Value::I16(_) => "i16",
            Value::I32(_) => "i32",
            Value::I64(_) => "i64",
            Value::U8(_) => "u8",
            Value::U16(_) => "u16",
            Value::U32(_) => "u32",
            Value::U64(_) => "u64",
            Value::F32(_) => "f32",
            Value::F64(_) => "f64",
            Value::Bool(_) => "bool",
            Value::Byte(_) => "byte",
            Value::Rune(_) => "rune",
            Value::Str(_) => "str",
            Value::List(_) => "list",
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::I32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::U32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v)
                }
            }
        )*
    };
}

value_from! {
    i8 => I8,
    i16 => I16,
    i32 => I32,
    i64 => I64,
    u8 => U8,
    u16 => U16,
    u32 => U32,
    u64 => U64,
    f32 => F32,
    f64 => F64,
    bool => Bool,
    char => Rune,
    String => Str,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

/// Field name to value mapping of one message.
pub type Fields = HashMap<String, Value>;

/// Description of one field in a schema.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescriptor {
    pub name: String,
    pub kind: FieldKind,
    /// Used on encode when the caller leaves the field out.
    pub default: Option<Value>,
    /// True for kinds without a fixed width (strings, text, lists).
    pub variable: bool,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        let variable = kind.is_variable();
        Self {
            name: name.into(),
            kind,
            default: None,
            variable,
        }
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }
}

/// Ordered field layout of one message kind.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageSchema {
    name: String,
    tag: Option<u8>,
    fields: Vec<FieldDescriptor>,
}

impl MessageSchema {
    pub fn builder(name: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder {
            name: name.into(),
            tag: None,
            fields: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tag(&self) -> Option<u8> {
        self.tag
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Encoded size if every field has a fixed width, tag included.
    pub fn fixed_size(&self) -> Option<usize> {
        let tag = usize::from(self.tag.is_some());
        self.fields
            .iter()
            .try_fold(tag, |acc, f| f.kind.width().map(|w| acc + w))
    }
}

/// Builder for [`MessageSchema`]. Validation happens in [`SchemaBuilder::build`].
#[derive(Debug)]
pub struct SchemaBuilder {
    name: String,
    tag: Option<u8>,
    fields: Vec<FieldDescriptor>,
}

impl SchemaBuilder {
    pub fn tag(mut self, tag: u8) -> Self {
        self.tag = Some(tag);
        self
    }

    pub fn field(mut self, descriptor: FieldDescriptor) -> Self {
        self.fields.push(descriptor);
        self
    }

    pub fn build(self) -> Result<Arc<MessageSchema>, SchemaError> {
        let last = self.fields.len().saturating_sub(1);
        for (i, field) in self.fields.iter().enumerate() {
            if self.fields[..i].iter().any(|f| f.name == field.name) {
                return Err(SchemaError::DuplicateField {
                    schema: self.name,
                    field: field.name.clone(),
                });
            }
            if field.kind == FieldKind::Text && i != last {
                return Err(SchemaError::TextNotLast {
                    schema: self.name,
                    field: field.name.clone(),
                });
            }
            if let FieldKind::List(elem) = &field.kind {
                if elem.is_variable() {
                    return Err(SchemaError::UnsupportedListElement {
                        schema: self.name,
                        field: field.name.clone(),
                        element: elem.name(),
                    });
                }
            }
            if let Some(default) = &field.default {
                if !field.kind.accepts(default) {
                    return Err(SchemaError::DefaultMismatch {
                        schema: self.name,
                        field: field.name.clone(),
                    });
                }
            }
        }

        Ok(Arc::new(MessageSchema {
            name: self.name,
            tag: self.tag,
            fields: self.fields,
        }))
    }
}

/// The set of inbound schemas a protocol accepts.
#[derive(Debug, Clone)]
pub enum SchemaRegistry {
    /// Every frame decodes against one schema.
    Single(Arc<MessageSchema>),
    /// The first byte of a frame selects the schema.
    Tagged(HashMap<u8, Arc<MessageSchema>>),
}

impl SchemaRegistry {
    pub fn single(schema: Arc<MessageSchema>) -> Self {
        SchemaRegistry::Single(schema)
    }

    /// Build a tag table. Every schema must carry a distinct tag and name.
    pub fn tagged<I>(schemas: I) -> Result<Self, SchemaError>
    where
        I: IntoIterator<Item = Arc<MessageSchema>>,
    {
        let mut table: HashMap<u8, Arc<MessageSchema>> = HashMap::new();
        for schema in schemas {
            let tag = schema.tag().ok_or_else(|| SchemaError::MissingTag {
                schema: schema.name().to_string(),
            })?;
            if table.values().any(|s| s.name() == schema.name()) {
                return Err(SchemaError::DuplicateName {
                    schema: schema.name().to_string(),
                });
            }
            if let Some(existing) = table.get(&tag) {
                return Err(SchemaError::DuplicateTag {
                    tag,
                    first: existing.name().to_string(),
                    second: schema.name().to_string(),
                });
            }
            table.insert(tag, schema);
        }
        Ok(SchemaRegistry::Tagged(table))
    }

    /// Look up a schema by tag. Always `None` for single-schema registries.
    pub fn resolve(&self, tag: u8) -> Option<&Arc<MessageSchema>> {
        match self {
            SchemaRegistry::Single(_) => None,
            SchemaRegistry::Tagged(table) => table.get(&tag),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.iter().any(|s| s.name() == name)
    }

    pub fn iter(&self) -> Box<dyn Iterator<Item = &Arc<MessageSchema>> + '_> {
        match self {
            SchemaRegistry::Single(schema) => Box::new(std::iter::once(schema)),
            SchemaRegistry::Tagged(table) => Box::new(table.values()),
        }
    }
}

/// Schema construction errors. These are startup configuration mistakes.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaError {
    DuplicateField { schema: String, field: String },
    TextNotLast { schema: String, field: String },
    UnsupportedListElement { schema: String, field: String, element: &'static str },
    DefaultMismatch { schema: String, field: String },
    MissingTag { schema: String },
    DuplicateTag { tag: u8, first: String, second: String },
    DuplicateName { schema: String },
}

impl std::fmt::Display for SchemaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchemaError::DuplicateField { schema, field } => {
                write!(f, "schema '{schema}' declares field '{field}' twice")
            }
            SchemaError::TextNotLast { schema, field } => {
                write!(f, "text field '{field}' must be the last field of '{schema}'")
            }
            SchemaError::UnsupportedListElement {
                schema,
                field,
                element,
            } => write!(
                f,
                "list field '{field}' of '{schema}' has unsupported element kind {element}"
            ),
            SchemaError::DefaultMismatch { schema, field } => {
                write!(f, "default of '{schema}.{field}' does not match its kind")
            }
            SchemaError::MissingTag { schema } => {
                write!(f, "schema '{schema}' has no tag but is in a tagged registry")
            }
            SchemaError::DuplicateTag { tag, first, second } => write!(
                f,
                "tag 0x{tag:02x} is used by both '{first}' and '{second}'"
            ),
            SchemaError::DuplicateName { schema } => {
                write!(f, "schema name '{schema}' is registered twice")
            }
        }
    }
}

impl std::error::Error for SchemaError {}
