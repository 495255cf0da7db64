use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;

use super::worker::ShutdownCause;
use crate::directory::Node;
use crate::framebuffer::FramebufferError;
use crate::messages::{self, MessageError, Nack, Status, NACK};
use crate::session::{DatagramSink, SessionError};
use crate::wire::{encode_message, Endpoint, Header, WireError};

/// Per-endpoint message processor, one instance per connection.
///
/// Instances live on the connection's read thread and are dropped when the
/// connection ends; `Drop` is where outstanding observers are released.
pub trait MessageHandler: Send {
    fn endpoint(&self) -> Endpoint;

    fn handle(&mut self, header: &Header, payload: &[u8]) -> Result<(), HandlerError>;
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("malformed {endpoint} message: {reason}")]
    Malformed { endpoint: &'static str, reason: String },
    #[error("unknown message type {message_type:#04x} on {endpoint}")]
    UnknownMessageType { endpoint: &'static str, message_type: u8 },
    #[error("not authenticated")]
    NotAuthenticated,
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Framebuffer(#[from] FramebufferError),
}

impl HandlerError {
    /// Fatal errors end the connection; the rest drop one message.
    pub fn is_fatal(&self) -> bool {
        match self {
            HandlerError::ProtocolViolation(_) | HandlerError::AuthenticationFailed => true,
            HandlerError::Wire(err) => err.is_fatal(),
            _ => false,
        }
    }

    pub(crate) fn shutdown_cause(&self) -> ShutdownCause {
        match self {
            HandlerError::AuthenticationFailed => ShutdownCause::AuthenticationFailed,
            _ => ShutdownCause::ProtocolViolation,
        }
    }

    pub fn malformed(endpoint: Endpoint, err: impl std::fmt::Display) -> Self {
        HandlerError::Malformed {
            endpoint: endpoint.as_str(),
            reason: err.to_string(),
        }
    }

    pub fn unknown_type(endpoint: Endpoint, message_type: u8) -> Self {
        HandlerError::UnknownMessageType {
            endpoint: endpoint.as_str(),
            message_type,
        }
    }
}

/// Connection state shared by the worker, its handlers and the observer
/// callbacks that push to the node from other threads.
///
/// # Guarantees
/// - A node is present exactly when the connection is authenticated.
/// - Pushes carry tags from a per-connection counter; replies echo the request tag.
pub struct ConnectionContext {
    peer: SocketAddr,
    sink: Arc<dyn DatagramSink>,
    node: RwLock<Option<Node>>,
    next_tag: AtomicU8,
}

impl std::fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("peer", &self.peer)
            .field("node", &*self.node.read())
            .finish_non_exhaustive()
    }
}

impl ConnectionContext {
    pub fn new(peer: SocketAddr, sink: Arc<dyn DatagramSink>) -> Self {
        Self {
            peer,
            sink,
            node: RwLock::new(None),
            next_tag: AtomicU8::new(0),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_authenticated(&self) -> bool {
        self.node.read().is_some()
    }

    pub fn node(&self) -> Option<Node> {
        self.node.read().clone()
    }

    pub fn mark_authenticated(&self, node: Node) {
        *self.node.write() = Some(node);
    }

    /// Gate for every endpoint except authentication.
    pub fn require_auth(&self) -> Result<Node, HandlerError> {
        self.node().ok_or(HandlerError::NotAuthenticated)
    }

    pub fn send<T: Serialize>(&self, header: Header, body: &T) -> Result<(), HandlerError> {
        let payload = messages::encode(body)?;
        let datagram = encode_message(header, &payload)?;
        self.sink.send_datagram(&datagram)?;
        Ok(())
    }

    pub fn reply<T: Serialize>(&self, request: &Header, message_type: u8, body: &T) -> Result<(), HandlerError> {
        self.send(request.reply(message_type), body)
    }

    /// Answers `request` with a [`Nack`] on its own endpoint.
    pub fn nack(&self, request: &Header, status: Status) -> Result<(), HandlerError> {
        let body = Nack {
            message_type: request.message_type,
            status,
        };
        self.reply(request, NACK, &body)
    }

    /// Sends an unsolicited message with a fresh tag.
    pub fn push<T: Serialize>(&self, endpoint: Endpoint, message_type: u8, body: &T) -> Result<(), HandlerError> {
        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        self.send(Header::new(endpoint, message_type, tag), body)
    }
}
