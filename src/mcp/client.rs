//! Upstream MCP client
//!
//! One actor task owns the upstream transport's pending-request table. Callers
//! hold a cloneable [`UpstreamHandle`] that submits commands over a channel and
//! awaits a oneshot reply, so no lock is shared between sessions. Notifications
//! sent by the upstream are fanned out to every subscriber.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};

use rust_mcp_sdk::schema::{Implementation, ProtocolVersion};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::errors::{TransportError, UpstreamError};
use crate::mcp::capabilities::CapabilitySet;
use crate::mcp::message::{Message, MessageId};
use crate::mcp::rpc::{error_reply, method_not_found};
use crate::transport::{inbound_channel, CloseReason, Inbound, Transport};

pub const CLIENT_NAME: &str = "mcp-sse-proxy";

/// Upstream notifications buffered per subscriber before it starts lagging.
const NOTIFICATION_BACKLOG: usize = 256;

#[derive(Debug, Clone, Copy)]
pub struct ClientOptions {
    pub handshake_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(60),
        }
    }
}

/// What the upstream peer declared in its `initialize` result.
#[derive(Debug, Clone)]
pub struct UpstreamInfo {
    pub server_info: Value,
    /// The `capabilities` object exactly as received.
    pub capabilities: Value,
    pub capability_set: CapabilitySet,
    pub protocol_version: String,
    pub instructions: Option<String>,
}

impl UpstreamInfo {
    pub fn from_initialize_result(result: Value) -> Result<Self, UpstreamError> {
        let Value::Object(mut result) = result else {
            return Err(UpstreamError::Handshake(
                "initialize result is not an object".to_string(),
            ));
        };

        let protocol_version = result
            .get("protocolVersion")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                UpstreamError::Handshake("initialize result has no protocolVersion".to_string())
            })?;
        let capabilities = result
            .remove("capabilities")
            .filter(Value::is_object)
            .unwrap_or_else(|| json!({}));

        Ok(Self {
            server_info: result.remove("serverInfo").unwrap_or_else(|| json!({})),
            capability_set: CapabilitySet::from_value(&capabilities),
            capabilities,
            protocol_version,
            instructions: result
                .get("instructions")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }
}

type Reply<T> = oneshot::Sender<Result<T, UpstreamError>>;

enum Command {
    Request {
        id: i64,
        method: String,
        params: Option<Value>,
        reply: Reply<Value>,
    },
    Notify {
        method: String,
        params: Option<Value>,
        reply: Reply<()>,
    },
    Cancel {
        id: i64,
        reason: &'static str,
    },
}

/// Non-owning access to the upstream connection.
#[derive(Clone)]
pub struct UpstreamHandle {
    commands: mpsc::UnboundedSender<Command>,
    next_id: Arc<AtomicI64>,
    request_timeout: Duration,
    connected: Arc<AtomicBool>,
    notifications: broadcast::WeakSender<Message>,
}

impl UpstreamHandle {
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, UpstreamError> {
        self.request_within(method, params, self.request_timeout)
            .await
    }

    async fn request_within(
        &self,
        method: &str,
        params: Option<Value>,
        limit: Duration,
    ) -> Result<Value, UpstreamError> {
        if !self.is_connected() {
            return Err(UpstreamError::Disconnected);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Request {
                id,
                method: method.to_string(),
                params,
                reply,
            })
            .map_err(|_| UpstreamError::Disconnected)?;

        match tokio::time::timeout(limit, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(UpstreamError::Disconnected),
            Err(_) => {
                let _ = self.commands.send(Command::Cancel {
                    id,
                    reason: "request timed out",
                });
                Err(UpstreamError::Timeout)
            }
        }
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), UpstreamError> {
        if !self.is_connected() {
            return Err(UpstreamError::Disconnected);
        }

        let (reply, sent) = oneshot::channel();
        self.commands
            .send(Command::Notify {
                method: method.to_string(),
                params,
                reply,
            })
            .map_err(|_| UpstreamError::Disconnected)?;
        sent.await.map_err(|_| UpstreamError::Disconnected)?
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Receives every notification the upstream sends from now on. The
    /// receiver ends once the upstream connection closes.
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<Message> {
        match self.notifications.upgrade() {
            Some(sender) => sender.subscribe(),
            None => broadcast::channel(1).1,
        }
    }
}

pub struct UpstreamClient;

impl UpstreamClient {
    /// Starts `transport`, performs the `initialize` handshake and announces
    /// `notifications/initialized`. The transport stays owned by the caller.
    pub async fn connect(
        transport: Arc<dyn Transport>,
        options: ClientOptions,
    ) -> Result<(UpstreamHandle, UpstreamInfo), UpstreamError> {
        let (handler, inbound) = inbound_channel();
        transport.start(handler).await?;

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (notifications, _) = broadcast::channel(NOTIFICATION_BACKLOG);
        let connected = Arc::new(AtomicBool::new(true));
        let subscriptions = notifications.downgrade();
        let actor = ClientActor {
            transport,
            pending: HashMap::new(),
            connected: connected.clone(),
            notifications,
        };
        tokio::spawn(actor.run(commands_rx, inbound));

        let handle = UpstreamHandle {
            commands,
            next_id: Arc::new(AtomicI64::new(0)),
            request_timeout: options.request_timeout,
            connected,
            notifications: subscriptions,
        };

        let result = handle
            .request_within(
                "initialize",
                Some(initialize_params()?),
                options.handshake_timeout,
            )
            .await
            .map_err(|err| match err {
                UpstreamError::Transport(err) => UpstreamError::Transport(err),
                other => UpstreamError::Handshake(other.to_string()),
            })?;
        let info = UpstreamInfo::from_initialize_result(result)?;

        handle.notify("notifications/initialized", None).await?;

        info!(
            protocol_version = %info.protocol_version,
            capabilities = ?info.capability_set.names().collect::<Vec<_>>(),
            "upstream handshake completed"
        );
        Ok((handle, info))
    }
}

fn initialize_params() -> Result<Value, UpstreamError> {
    let client_info = Implementation {
        name: CLIENT_NAME.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        title: None,
        description: None,
        icons: vec![],
        website_url: None,
    };
    let client_info = serde_json::to_value(client_info).map_err(TransportError::from)?;
    let protocol_version: String = ProtocolVersion::V2024_11_05.into();

    Ok(json!({
        "protocolVersion": protocol_version,
        "capabilities": {},
        "clientInfo": client_info,
    }))
}

struct ClientActor {
    transport: Arc<dyn Transport>,
    pending: HashMap<MessageId, Reply<Value>>,
    connected: Arc<AtomicBool>,
    notifications: broadcast::Sender<Message>,
}

impl ClientActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut inbound: mpsc::UnboundedReceiver<Inbound>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                event = inbound.recv() => match event {
                    Some(Inbound::Message(message)) => self.handle_message(message).await,
                    Some(Inbound::Error(err)) => {
                        warn!(error = %err, "upstream transport error");
                    }
                    Some(Inbound::Closed(reason)) => {
                        self.disconnect(reason);
                        break;
                    }
                    None => {
                        self.disconnect(CloseReason::Closed);
                        break;
                    }
                },
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        self.pending.retain(|_, reply| !reply.is_closed());

        match command {
            Command::Request {
                id,
                method,
                params,
                reply,
            } => {
                let id = MessageId::Number(id);
                self.pending.insert(id.clone(), reply);
                let message = Message::request(id.clone(), method, params);
                if let Err(err) = self.transport.send(message).await {
                    if let Some(reply) = self.pending.remove(&id) {
                        let _ = reply.send(Err(err.into()));
                    }
                }
            }
            Command::Notify {
                method,
                params,
                reply,
            } => {
                let result = self
                    .transport
                    .send(Message::notification(method, params))
                    .await
                    .map_err(UpstreamError::from);
                let _ = reply.send(result);
            }
            Command::Cancel { id, reason } => {
                let id = MessageId::Number(id);
                if self.pending.remove(&id).is_some() {
                    let cancelled = Message::notification(
                        "notifications/cancelled",
                        Some(json!({ "requestId": id, "reason": reason })),
                    );
                    if let Err(err) = self.transport.send(cancelled).await {
                        debug!(error = %err, "could not send cancellation upstream");
                    }
                }
            }
        }
    }

    async fn handle_message(&mut self, message: Message) {
        match message {
            Message::Response { id, result } => match self.pending.remove(&id) {
                Some(reply) => {
                    let _ = reply.send(Ok(result));
                }
                None => warn!(id = %id, "dropping upstream response with unknown id"),
            },
            Message::ErrorResponse { id, error } => {
                match id.and_then(|id| self.pending.remove(&id)) {
                    Some(reply) => {
                        let _ = reply.send(Err(UpstreamError::Rpc {
                            code: error.code,
                            message: error.message,
                            data: error.data,
                        }));
                    }
                    None => warn!(
                        code = error.code,
                        message = %error.message,
                        "dropping upstream error response with unknown id"
                    ),
                }
            }
            Message::Request { id, method, .. } => {
                let reply = if method == "ping" {
                    Message::response(id, json!({}))
                } else {
                    debug!(method = %method, "rejecting upstream-initiated request");
                    error_reply(id, method_not_found())
                };
                if let Err(err) = self.transport.send(reply).await {
                    warn!(error = %err, "could not answer upstream request");
                }
            }
            Message::Notification { method, params } => {
                debug!(method = %method, "upstream notification");
                let receivers = self
                    .notifications
                    .send(Message::notification(method, params))
                    .unwrap_or(0);
                if receivers == 0 {
                    debug!("no session subscribed to upstream notifications");
                }
            }
        }
    }

    fn disconnect(&mut self, reason: CloseReason) {
        self.connected.store(false, Ordering::SeqCst);
        warn!(
            reason = ?reason,
            pending = self.pending.len(),
            "upstream connection closed"
        );
        for (_, reply) in self.pending.drain() {
            let _ = reply.send(Err(UpstreamError::Disconnected));
        }
    }
}
