//! SSE session registry
//!
//! Each `GET` on the SSE route opens one session: a fresh [`ServerEndpoint`]
//! from the endpoint factory, served over an [`SseTransport`] and registered
//! under a UUID. Submissions are routed to it by `?sessionId=`. A session ends
//! when its event stream is dropped, when it is closed explicitly, or when the
//! whole server closes; the upstream connection is never touched.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use axum::Router;
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};
use tracing::{info, warn};

use crate::errors::{AppError, ProxyError};
use crate::mcp::server::{ConnectedServer, ServerEndpoint};
use crate::transport::{sse::SseTransport, tap::TapHandler};

pub type SessionHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Builds the endpoint for a newly accepted session.
pub type EndpointFactory = Arc<dyn Fn() -> Result<ServerEndpoint, AppError> + Send + Sync>;

#[derive(Clone)]
pub struct SseServerOptions {
    pub endpoint: String,
    pub messages_path: String,
    pub bind: SocketAddr,
    pub on_connect: Option<SessionHook>,
    pub on_close: Option<SessionHook>,
    /// Observes every session transport when set.
    pub transport_tap: Option<TapHandler>,
}

impl Default for SseServerOptions {
    fn default() -> Self {
        Self {
            endpoint: "/sse".to_string(),
            messages_path: "/messages".to_string(),
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            on_connect: None,
            on_close: None,
            transport_tap: None,
        }
    }
}

pub(crate) struct Session {
    pub(crate) transport: Arc<SseTransport>,
    _server: ConnectedServer,
}

struct Inner {
    options: SseServerOptions,
    factory: EndpointFactory,
    sessions: Mutex<HashMap<String, Session>>,
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(options: SseServerOptions, factory: EndpointFactory) -> Self {
        Self {
            inner: Arc::new(Inner {
                options,
                factory,
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Binds the listener and serves the session routes until
    /// [`ProxyServer::close`].
    pub async fn bind(
        options: SseServerOptions,
        factory: EndpointFactory,
    ) -> Result<ProxyServer, ProxyError> {
        let manager = Self::new(options, factory);
        let listener = TcpListener::bind(manager.options().bind)
            .await
            .map_err(ProxyError::Bind)?;
        let local_addr = listener.local_addr().map_err(ProxyError::Bind)?;

        let app = manager.router();
        let (shutdown, signal) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(async move {
                    let _ = signal.await;
                })
                .await
        });

        info!(
            local_addr = %local_addr,
            endpoint = %manager.options().endpoint,
            messages_path = %manager.options().messages_path,
            "sse server listening"
        );

        Ok(ProxyServer {
            manager,
            local_addr,
            shutdown: Some(shutdown),
            task,
        })
    }

    pub fn router(&self) -> Router {
        crate::build_app(self.clone())
    }

    pub fn options(&self) -> &SseServerOptions {
        &self.inner.options
    }

    pub(crate) fn new_endpoint(&self) -> Result<ServerEndpoint, AppError> {
        (self.inner.factory)()
    }

    pub(crate) fn register(&self, session_id: &str, transport: Arc<SseTransport>, server: ConnectedServer) {
        if let Ok(mut sessions) = self.inner.sessions.lock() {
            sessions.insert(
                session_id.to_string(),
                Session {
                    transport,
                    _server: server,
                },
            );
        }
        info!(session_id = %session_id, "sse session established");
        if let Some(hook) = &self.inner.options.on_connect {
            hook(session_id);
        }
    }

    pub fn transport(&self, session_id: &str) -> Option<Arc<SseTransport>> {
        self.inner
            .sessions
            .lock()
            .ok()
            .and_then(|sessions| sessions.get(session_id).map(|session| session.transport.clone()))
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.inner
            .sessions
            .lock()
            .map(|sessions| sessions.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn session_count(&self) -> usize {
        self.inner
            .sessions
            .lock()
            .map(|sessions| sessions.len())
            .unwrap_or_default()
    }

    /// Ends one session. Returns `false` when no such session is registered.
    pub fn close_session(&self, session_id: &str) -> bool {
        let session = self
            .inner
            .sessions
            .lock()
            .ok()
            .and_then(|mut sessions| sessions.remove(session_id));
        let Some(session) = session else {
            return false;
        };

        session.transport.shutdown();
        info!(session_id = %session_id, "sse session closed");
        if let Some(hook) = &self.inner.options.on_close {
            hook(session_id);
        }
        true
    }

    pub fn close_all(&self) {
        for session_id in self.session_ids() {
            self.close_session(&session_id);
        }
    }
}

/// A bound SSE server.
pub struct ProxyServer {
    manager: SessionManager,
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<std::io::Result<()>>,
}

impl ProxyServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn manager(&self) -> &SessionManager {
        &self.manager
    }

    /// Closes every session, then stops accepting connections and waits for
    /// in-flight requests to finish.
    pub async fn close(mut self) {
        self.manager.close_all();
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        match self.task.await {
            Ok(Ok(())) => info!(local_addr = %self.local_addr, "sse server stopped"),
            Ok(Err(err)) => warn!(error = %err, "sse server stopped with error"),
            Err(err) => warn!(error = %err, "sse server task failed"),
        }
    }
}
