//! Transport event tap
//!
//! [`tap`] wraps a transport in a decorator that reports every lifecycle event
//! to an observer before delegating. Outbound operations (`start`, `send`,
//! `close`) are observed on the decorator itself; inbound callbacks are
//! observed by wrapping the [`MessageHandler`] handed to the inner transport.
//! Return values, ordering and errors of the wrapped transport are unchanged.

use std::{
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use async_trait::async_trait;
use tracing::warn;

use crate::errors::TransportError;
use crate::mcp::message::Message;
use crate::transport::{CloseReason, MessageHandler, Transport};

#[derive(Debug)]
pub enum TransportEvent<'a> {
    Close,
    OnClose,
    OnError(&'a TransportError),
    OnMessage(&'a Message),
    Send(&'a Message),
    Start,
}

impl TransportEvent<'_> {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Close => "close",
            Self::OnClose => "onclose",
            Self::OnError(_) => "onerror",
            Self::OnMessage(_) => "onmessage",
            Self::Send(_) => "send",
            Self::Start => "start",
        }
    }
}

pub type TapHandler = Arc<dyn Fn(&TransportEvent<'_>) + Send + Sync>;

pub fn tap(transport: Arc<dyn Transport>, handler: TapHandler) -> Arc<dyn Transport> {
    Arc::new(TappedTransport {
        inner: transport,
        handler,
    })
}

/// A panicking observer must not keep the wrapped operation from running.
fn emit(handler: &TapHandler, event: TransportEvent<'_>) {
    if panic::catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
        warn!(event = event.kind(), "transport tap handler panicked");
    }
}

struct TappedTransport {
    inner: Arc<dyn Transport>,
    handler: TapHandler,
}

#[async_trait]
impl Transport for TappedTransport {
    async fn start(&self, handler: Arc<dyn MessageHandler>) -> Result<(), TransportError> {
        emit(&self.handler, TransportEvent::Start);
        let observed = Arc::new(TappedHandler {
            inner: handler,
            handler: self.handler.clone(),
        });
        self.inner.start(observed).await
    }

    async fn send(&self, message: Message) -> Result<(), TransportError> {
        emit(&self.handler, TransportEvent::Send(&message));
        self.inner.send(message).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        emit(&self.handler, TransportEvent::Close);
        self.inner.close().await
    }
}

struct TappedHandler {
    inner: Arc<dyn MessageHandler>,
    handler: TapHandler,
}

impl MessageHandler for TappedHandler {
    fn on_message(&self, message: Message) {
        emit(&self.handler, TransportEvent::OnMessage(&message));
        self.inner.on_message(message);
    }

    fn on_error(&self, error: TransportError) {
        emit(&self.handler, TransportEvent::OnError(&error));
        self.inner.on_error(error);
    }

    fn on_close(&self, reason: CloseReason) {
        emit(&self.handler, TransportEvent::OnClose);
        self.inner.on_close(reason);
    }
}
