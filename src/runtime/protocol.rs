//! Protocol definitions.
//!
//! A [`Protocol`] bundles everything a connection needs: framing, the inbound
//! schema registry, an optional handshake schema, the error policy, handlers
//! and a factory for per-connection session data. It is validated once in
//! [`ProtocolBuilder::build`] and then shared read-only by all connections.

use crate::codec::Message;
use crate::runtime::dispatch::{DispatchError, Dispatcher, Response};
use crate::runtime::framer::{Framing, FramingError};
use crate::schema::{MessageSchema, SchemaError, SchemaRegistry};
use std::sync::Arc;

/// Default upper bound on buffered bytes that have not yet formed a frame.
pub const DEFAULT_MAX_FRAME: usize = 64 * 1024;

/// What to do with a frame that fails to decode, or a reply that fails to
/// encode, once the session is streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Log and skip the offending frame or reply.
    Tolerant,
    /// Close the connection.
    Strict,
}

/// A validated protocol over session data `S`.
pub struct Protocol<S> {
    name: &'static str,
    framing: Framing,
    schemas: SchemaRegistry,
    handshake: Option<Arc<MessageSchema>>,
    policy: ErrorPolicy,
    max_frame: usize,
    dispatcher: Dispatcher<S>,
    new_session: Box<dyn Fn() -> S + Send + Sync>,
}

impl<S: Default + 'static> Protocol<S> {
    /// Start a protocol whose session data starts from `S::default()`.
    pub fn builder(name: &'static str, framing: Framing, schemas: SchemaRegistry) -> ProtocolBuilder<S> {
        ProtocolBuilder::new(name, framing, schemas, S::default)
    }
}

impl<S> Protocol<S> {
    /// Start a protocol with a custom session factory, e.g. one that hands
    /// every connection a clone of a shared collaborator.
    pub fn builder_with<F>(
        name: &'static str,
        framing: Framing,
        schemas: SchemaRegistry,
        new_session: F,
    ) -> ProtocolBuilder<S>
    where
        F: Fn() -> S + Send + Sync + 'static,
    {
        ProtocolBuilder::new(name, framing, schemas, new_session)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn framing(&self) -> &Framing {
        &self.framing
    }

    pub fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    pub fn handshake(&self) -> Option<&Arc<MessageSchema>> {
        self.handshake.as_ref()
    }

    pub fn policy(&self) -> ErrorPolicy {
        self.policy
    }

    /// Largest number of unframed bytes a connection may buffer.
    pub fn max_frame(&self) -> usize {
        self.max_frame
    }

    pub fn new_session(&self) -> S {
        (self.new_session)()
    }

    pub fn dispatch(&self, msg: &Message, state: &mut S) -> Result<Response, DispatchError> {
        self.dispatcher.dispatch(msg, state)
    }
}

impl<S> std::fmt::Debug for Protocol<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Protocol")
            .field("name", &self.name)
            .field("framing", &self.framing)
            .field("handshake", &self.handshake.as_ref().map(|s| s.name()))
            .field("policy", &self.policy)
            .field("max_frame", &self.max_frame)
            .finish()
    }
}

/// Builder for [`Protocol`].
pub struct ProtocolBuilder<S> {
    protocol: Protocol<S>,
}

impl<S> ProtocolBuilder<S> {
    fn new<F>(name: &'static str, framing: Framing, schemas: SchemaRegistry, new_session: F) -> Self
    where
        F: Fn() -> S + Send + Sync + 'static,
    {
        Self {
            protocol: Protocol {
                name,
                framing,
                schemas,
                handshake: None,
                policy: ErrorPolicy::Tolerant,
                max_frame: DEFAULT_MAX_FRAME,
                dispatcher: Dispatcher::new(),
                new_session: Box::new(new_session),
            },
        }
    }

    /// Require the first frame of every connection to be `schema`.
    pub fn handshake(mut self, schema: &Arc<MessageSchema>) -> Self {
        self.protocol.handshake = Some(Arc::clone(schema));
        self
    }

    pub fn policy(mut self, policy: ErrorPolicy) -> Self {
        self.protocol.policy = policy;
        self
    }

    /// Close connections that buffer more than `limit` bytes without
    /// completing a frame.
    pub fn max_frame(mut self, limit: usize) -> Self {
        self.protocol.max_frame = limit;
        self
    }

    /// Register the handler for `schema`.
    pub fn on<F>(mut self, schema: &Arc<MessageSchema>, handler: F) -> Result<Self, ProtocolError>
    where
        F: Fn(&Message, &mut S) -> Response + Send + Sync + 'static,
    {
        if !self.protocol.schemas.contains(schema.name()) {
            return Err(ProtocolError::NotInbound(schema.name().to_string()));
        }
        self.protocol.dispatcher.register(schema, handler)?;
        Ok(self)
    }

    pub fn build(self) -> Result<Protocol<S>, ProtocolError> {
        self.protocol.framing.validate()?;

        if self.protocol.max_frame == 0 {
            return Err(ProtocolError::MaxFrameTooSmall {
                max_frame: 0,
                frame: 1,
            });
        }

        if let Some(handshake) = &self.protocol.handshake {
            if !self.protocol.schemas.contains(handshake.name()) {
                return Err(ProtocolError::NotInbound(handshake.name().to_string()));
            }
        }

        if let Framing::Fixed(frame) = self.protocol.framing {
            if self.protocol.max_frame < frame {
                return Err(ProtocolError::MaxFrameTooSmall {
                    max_frame: self.protocol.max_frame,
                    frame,
                });
            }
            for schema in self.protocol.schemas.iter() {
                match schema.fixed_size() {
                    Some(schema_size) if schema_size != frame => {
                        return Err(ProtocolError::FrameSizeMismatch {
                            schema: schema.name().to_string(),
                            frame,
                            schema_size,
                        });
                    }
                    _ => {}
                }
            }
        }

        Ok(self.protocol)
    }
}

/// Protocol configuration errors, raised at startup.
#[derive(Debug)]
pub enum ProtocolError {
    Framing(FramingError),
    Schema(SchemaError),
    Dispatch(DispatchError),
    /// A handler or handshake refers to a schema the protocol never decodes.
    NotInbound(String),
    /// A fixed-width schema can never fill a fixed-size frame exactly.
    FrameSizeMismatch {
        schema: String,
        frame: usize,
        schema_size: usize,
    },
    /// The buffer limit cannot hold a single frame.
    MaxFrameTooSmall { max_frame: usize, frame: usize },
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::Framing(e) => write!(f, "invalid framing: {}", e),
            ProtocolError::Schema(e) => write!(f, "invalid schema: {}", e),
            ProtocolError::Dispatch(e) => write!(f, "invalid handler registration: {}", e),
            ProtocolError::NotInbound(name) => {
                write!(f, "schema '{name}' is not in the protocol's inbound registry")
            }
            ProtocolError::FrameSizeMismatch {
                schema,
                frame,
                schema_size,
            } => write!(
                f,
                "schema '{schema}' encodes to {schema_size} bytes but frames are {frame} bytes"
            ),
            ProtocolError::MaxFrameTooSmall { max_frame, frame } => write!(
                f,
                "frame limit of {max_frame} bytes is below the {frame} byte frame size"
            ),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<FramingError> for ProtocolError {
    fn from(e: FramingError) -> Self {
        ProtocolError::Framing(e)
    }
}

impl From<SchemaError> for ProtocolError {
    fn from(e: SchemaError) -> Self {
        ProtocolError::Schema(e)
    }
}

impl From<DispatchError> for ProtocolError {
    fn from(e: DispatchError) -> Self {
        ProtocolError::Dispatch(e)
    }
}
