//! Message transports
//!
//! A [`Transport`] moves [`Message`]s over one underlying I/O channel: the
//! pipes of a spawned child process ([`stdio`]) or a downstream SSE session
//! ([`sse`]). Inbound traffic is delivered to the [`MessageHandler`] passed to
//! [`Transport::start`]. [`tap`] decorates any transport with event observation.

pub mod framing;
pub mod sse;
pub mod stdio;
pub mod tap;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::TransportError;
use crate::mcp::message::Message;

/// Why a transport stopped delivering messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    Exited { code: i32 },
    Signalled { signal: i32 },
    SpawnFailed { reason: String },
    Closed,
}

/// Receives inbound traffic from a started transport.
///
/// Callbacks run on the transport's I/O task and must not block.
pub trait MessageHandler: Send + Sync {
    fn on_message(&self, message: Message);
    fn on_error(&self, error: TransportError);
    /// Fired exactly once per started transport.
    fn on_close(&self, reason: CloseReason);
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn start(&self, handler: Arc<dyn MessageHandler>) -> Result<(), TransportError>;
    async fn send(&self, message: Message) -> Result<(), TransportError>;
    /// Idempotent; only the first call releases the underlying resource.
    async fn close(&self) -> Result<(), TransportError>;
}

/// An inbound transport callback, as queued by [`inbound_channel`].
#[derive(Debug)]
pub enum Inbound {
    Message(Message),
    Error(TransportError),
    Closed(CloseReason),
}

struct ChannelHandler {
    tx: mpsc::UnboundedSender<Inbound>,
}

impl MessageHandler for ChannelHandler {
    fn on_message(&self, message: Message) {
        let _ = self.tx.send(Inbound::Message(message));
    }

    fn on_error(&self, error: TransportError) {
        let _ = self.tx.send(Inbound::Error(error));
    }

    fn on_close(&self, reason: CloseReason) {
        let _ = self.tx.send(Inbound::Closed(reason));
    }
}

/// A handler that queues every callback so an actor task can consume them in order.
pub fn inbound_channel() -> (Arc<dyn MessageHandler>, mpsc::UnboundedReceiver<Inbound>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(ChannelHandler { tx }), rx)
}
