//! Server-Sent-Events session transport
//!
//! The server-push half is a channel drained by the HTTP response body
//! ([`SseStream`]); the submission half is fed by the POST handler through
//! [`SseTransport::handle_post_message`]. The stream reports its own drop, so a
//! client disconnect can end the session.

use std::{
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, OnceLock,
    },
    task::{Context, Poll},
};

use async_trait::async_trait;
use futures::Stream;
use tokio::sync::mpsc;

use crate::errors::TransportError;
use crate::mcp::message::Message;
use crate::transport::{CloseReason, MessageHandler, Transport};

const OUTGOING_BUFFER: usize = 64;

/// One item pushed to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum SseFrame {
    /// Announces the submission URL for this session.
    Endpoint(String),
    Message(Message),
}

pub struct SseTransport {
    session_id: String,
    endpoint_url: String,
    outgoing: Mutex<Option<mpsc::Sender<SseFrame>>>,
    handler: OnceLock<Arc<dyn MessageHandler>>,
    closed: AtomicBool,
}

impl SseTransport {
    /// `messages_path` is the submission route; the session id is appended as
    /// the `sessionId` query parameter.
    pub fn new(session_id: impl Into<String>, messages_path: &str) -> (Arc<Self>, SseStream) {
        let session_id = session_id.into();
        let (tx, rx) = mpsc::channel(OUTGOING_BUFFER);
        let transport = Arc::new(Self {
            endpoint_url: format!("{messages_path}?sessionId={session_id}"),
            session_id,
            outgoing: Mutex::new(Some(tx)),
            handler: OnceLock::new(),
            closed: AtomicBool::new(false),
        });
        (
            transport,
            SseStream {
                rx,
                on_drop: None,
            },
        )
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn endpoint_url(&self) -> &str {
        &self.endpoint_url
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Delivers a client-submitted body. Bodies that are not a JSON-RPC message
    /// are reported through the handler's error callback and rejected.
    pub fn handle_post_message(&self, body: &[u8]) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::NotConnected);
        }
        let handler = self.handler.get().ok_or(TransportError::NotConnected)?;

        match Message::from_slice(body) {
            Ok(message) => {
                handler.on_message(message);
                Ok(())
            }
            Err(err) => {
                let reason = err.to_string();
                handler.on_error(TransportError::malformed(reason.clone()));
                Err(TransportError::malformed(reason))
            }
        }
    }

    /// Ends the push stream and fires `on_close`. Returns `false` when the
    /// transport was already closed.
    pub fn shutdown(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Ok(mut outgoing) = self.outgoing.lock() {
            outgoing.take();
        }
        if let Some(handler) = self.handler.get() {
            handler.on_close(CloseReason::Closed);
        }
        true
    }

    fn sender(&self) -> Result<mpsc::Sender<SseFrame>, TransportError> {
        self.outgoing
            .lock()
            .ok()
            .and_then(|outgoing| outgoing.clone())
            .ok_or(TransportError::NotConnected)
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn start(&self, handler: Arc<dyn MessageHandler>) -> Result<(), TransportError> {
        self.handler
            .set(handler)
            .map_err(|_| TransportError::AlreadyStarted)?;
        self.sender()?
            .send(SseFrame::Endpoint(self.endpoint_url.clone()))
            .await
            .map_err(|_| TransportError::NotConnected)
    }

    async fn send(&self, message: Message) -> Result<(), TransportError> {
        self.sender()?
            .send(SseFrame::Message(message))
            .await
            .map_err(|_| TransportError::NotConnected)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.shutdown();
        Ok(())
    }
}

/// The push half, consumed by the HTTP response body.
pub struct SseStream {
    rx: mpsc::Receiver<SseFrame>,
    on_drop: Option<Box<dyn FnOnce() + Send>>,
}

impl SseStream {
    /// Runs `callback` when the stream is dropped, i.e. when the client
    /// disconnects or the response finishes.
    pub fn on_disconnect(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.on_drop = Some(Box::new(callback));
        self
    }
}

impl Stream for SseStream {
    type Item = SseFrame;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl Drop for SseStream {
    fn drop(&mut self) {
        if let Some(callback) = self.on_drop.take() {
            callback();
        }
    }
}
