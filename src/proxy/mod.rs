//! Proxy wiring
//!
//! Connects the single upstream child process, derives the capability router
//! from its handshake and serves downstream SSE sessions against it.

pub mod router;

use std::{net::SocketAddr, sync::Arc};

use tracing::{info, warn};

use crate::config::{Config, ConfigError, MESSAGES_PATH};
use crate::errors::{AppError, ProxyError, UpstreamError};
use crate::http::{EndpointFactory, ProxyServer, SessionManager, SseServerOptions};
use crate::logging::{log_upstream_stderr, transport_event_logger};
use crate::mcp::client::{ClientOptions, UpstreamClient, UpstreamHandle, UpstreamInfo};
use crate::mcp::server::ServerEndpoint;
use crate::transport::{
    stdio::{DiagnosticSink, StderrMode, StdioClientTransport, StdioParams},
    tap::{tap, TapHandler},
    Transport,
};

use self::router::CapabilityRouter;

/// The connected upstream peer. Owns the upstream transport.
pub struct Upstream {
    transport: Arc<dyn Transport>,
    handle: UpstreamHandle,
    info: Arc<UpstreamInfo>,
    router: Arc<CapabilityRouter>,
}

impl Upstream {
    pub async fn connect(
        params: StdioParams,
        options: ClientOptions,
        transport_tap: Option<TapHandler>,
    ) -> Result<Self, UpstreamError> {
        let command = params.command.clone();
        let stdio: Arc<dyn Transport> = Arc::new(StdioClientTransport::new(params));
        let transport = match transport_tap {
            Some(handler) => tap(stdio, handler),
            None => stdio,
        };

        let (handle, info) = match UpstreamClient::connect(transport.clone(), options).await {
            Ok(connected) => connected,
            Err(err) => {
                if let Err(close_err) = transport.close().await {
                    warn!(error = %close_err, "could not release upstream after failed handshake");
                }
                return Err(err);
            }
        };

        info!(
            command = %command,
            server = %info.server_info,
            "connected to upstream"
        );

        let info = Arc::new(info);
        let router = Arc::new(CapabilityRouter::new(&info.capability_set, handle.clone()));
        info!(
            forwarded = ?router.forwarded_requests(),
            relayed = ?router.relayed_notifications(),
            "capability routes computed"
        );
        Ok(Self {
            transport,
            handle,
            info,
            router,
        })
    }

    /// Every endpoint shares the router computed at connect time.
    pub fn endpoint_factory(&self) -> EndpointFactory {
        let info = self.info.clone();
        let router = self.router.clone();
        Arc::new(move || -> Result<ServerEndpoint, AppError> {
            let mut endpoint = ServerEndpoint::new(info.clone());
            router.install(&mut endpoint);
            Ok(endpoint)
        })
    }

    pub fn handle(&self) -> &UpstreamHandle {
        &self.handle
    }

    pub fn info(&self) -> &UpstreamInfo {
        &self.info
    }

    pub async fn close(&self) {
        if let Err(err) = self.transport.close().await {
            warn!(error = %err, "could not close upstream transport");
        }
    }
}

pub struct ProxyOptions {
    pub upstream: StdioParams,
    pub client: ClientOptions,
    pub server: SseServerOptions,
    pub upstream_tap: Option<TapHandler>,
}

impl ProxyOptions {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let sink: DiagnosticSink = Arc::new(log_upstream_stderr);
        let upstream = StdioParams::new(config.command.clone(), config.args.clone())
            .with_stderr(StderrMode::Pipe(sink));

        let server = SseServerOptions {
            endpoint: config.endpoint.clone(),
            messages_path: MESSAGES_PATH.to_string(),
            bind: config.bind_socket()?,
            transport_tap: config.debug.then(|| transport_event_logger("downstream")),
            ..SseServerOptions::default()
        };

        Ok(Self {
            upstream,
            client: ClientOptions::default(),
            server,
            upstream_tap: config.debug.then(|| transport_event_logger("upstream")),
        })
    }
}

pub struct Proxy {
    upstream: Upstream,
    server: ProxyServer,
}

impl Proxy {
    pub async fn start(options: ProxyOptions) -> Result<Self, ProxyError> {
        let upstream =
            Upstream::connect(options.upstream, options.client, options.upstream_tap).await?;

        let server = match SessionManager::bind(options.server, upstream.endpoint_factory()).await
        {
            Ok(server) => server,
            Err(err) => {
                upstream.close().await;
                return Err(err);
            }
        };

        Ok(Self { upstream, server })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn sessions(&self) -> &SessionManager {
        self.server.manager()
    }

    pub fn upstream(&self) -> &Upstream {
        &self.upstream
    }

    /// Closes every session, stops the listener and then the upstream.
    pub async fn shutdown(self) {
        self.server.close().await;
        self.upstream.close().await;
        info!("proxy stopped");
    }
}
