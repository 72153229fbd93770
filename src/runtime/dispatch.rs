//! Handler dispatch.
//!
//! A [`Dispatcher`] maps a message identity (its schema name, unique within a
//! protocol) to one handler. Handlers run synchronously with exclusive access
//! to the connection's session data and return a [`Response`].

use crate::codec::Message;
use crate::schema::MessageSchema;
use futures::stream::BoxStream;
use std::collections::HashMap;

/// Stream of replies produced by a background emitter.
pub type ReplyStream = BoxStream<'static, Message>;

/// What a handler wants written back.
pub enum Response {
    /// Nothing to send.
    Empty,
    Reply(Message),
    /// Several replies, written in order.
    Replies(Vec<Message>),
    /// Replies produced on the emitter's own schedule until the stream ends or
    /// the connection closes.
    Stream(ReplyStream),
    /// Send an optional last reply, then close the connection.
    Close(Option<Message>),
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Response::Empty => write!(f, "Empty"),
            Response::Reply(msg) => f.debug_tuple("Reply").field(msg).finish(),
            Response::Replies(msgs) => f.debug_tuple("Replies").field(msgs).finish(),
            Response::Stream(_) => write!(f, "Stream(..)"),
            Response::Close(msg) => f.debug_tuple("Close").field(msg).finish(),
        }
    }
}

impl From<Message> for Response {
    fn from(msg: Message) -> Self {
        Response::Reply(msg)
    }
}

impl From<Option<Message>> for Response {
    fn from(msg: Option<Message>) -> Self {
        msg.map_or(Response::Empty, Response::Reply)
    }
}

/// Handler function over session data `S`.
pub type Handler<S> = Box<dyn Fn(&Message, &mut S) -> Response + Send + Sync>;

/// Registry of handlers, owned by a protocol.
pub struct Dispatcher<S> {
    handlers: HashMap<String, Handler<S>>,
}

impl<S> Dispatcher<S> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Bind `handler` to messages of `schema`. A second binding for the same
    /// schema is rejected.
    pub fn register<F>(&mut self, schema: &MessageSchema, handler: F) -> Result<(), DispatchError>
    where
        F: Fn(&Message, &mut S) -> Response + Send + Sync + 'static,
    {
        if self.handlers.contains_key(schema.name()) {
            return Err(DispatchError::DuplicateHandler(schema.name().to_string()));
        }
        self.handlers
            .insert(schema.name().to_string(), Box::new(handler));
        Ok(())
    }

    pub fn handles(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Run the handler for `msg`.
    pub fn dispatch(&self, msg: &Message, state: &mut S) -> Result<Response, DispatchError> {
        let handler = self
            .handlers
            .get(msg.name())
            .ok_or_else(|| DispatchError::NoHandler(msg.name().to_string()))?;
        Ok(handler(msg, state))
    }
}

impl<S> Default for Dispatcher<S> {
    fn default() -> Self {
        Self::new()
    }
}

/// Dispatch errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// No handler for this message; the message is dropped.
    NoHandler(String),
    /// Registration-time conflict.
    DuplicateHandler(String),
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchError::NoHandler(name) => write!(f, "no handler registered for '{name}'"),
            DispatchError::DuplicateHandler(name) => {
                write!(f, "a handler for '{name}' is already registered")
            }
        }
    }
}

impl std::error::Error for DispatchError {}
