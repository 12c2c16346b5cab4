//! Downstream MCP server endpoint
//!
//! One [`ServerEndpoint`] serves one downstream session: it answers the
//! protocol built-ins (`initialize`, `ping`) from the upstream's handshake
//! and dispatches every other method to the handlers installed on it. An
//! optional [`NotificationRelay`] pushes upstream notifications to the client.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use rust_mcp_sdk::schema::{
    CallToolRequest, CompleteRequest, GetPromptRequest, InitializeRequest, ListPromptsRequest,
    ListResourceTemplatesRequest, ListResourcesRequest, ListToolsRequest, PingRequest,
    ReadResourceRequest,
};
use serde_json::{json, Value};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::errors::TransportError;
use crate::mcp::client::UpstreamInfo;
use crate::mcp::message::{ErrorObject, Message, MessageId};
use crate::mcp::rpc::{error_reply, invalid_params, is_error, method_not_found};
use crate::transport::{inbound_channel, Inbound, Transport};

pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-06-18", "2025-03-26", "2024-11-05"];

#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, params: Option<Value>) -> Result<Value, ErrorObject>;
}

#[async_trait]
pub trait NotificationHandler: Send + Sync {
    async fn handle(&self, params: Option<Value>);
}

/// Upstream notifications with one of `methods` are sent to the session.
pub struct NotificationRelay {
    methods: Vec<&'static str>,
    source: broadcast::Receiver<Message>,
}

impl NotificationRelay {
    pub fn new(methods: Vec<&'static str>, source: broadcast::Receiver<Message>) -> Self {
        Self { methods, source }
    }

    /// `None` once the upstream connection is gone.
    async fn next(&mut self) -> Option<Message> {
        loop {
            match self.source.recv().await {
                Ok(message) => {
                    let relayed = message
                        .method()
                        .is_some_and(|method| self.methods.iter().any(|m| *m == method));
                    if relayed {
                        return Some(message);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "session missed upstream notifications");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

pub struct ServerEndpoint {
    upstream: Arc<UpstreamInfo>,
    requests: HashMap<String, Arc<dyn RequestHandler>>,
    notifications: HashMap<String, Arc<dyn NotificationHandler>>,
    relay: Option<NotificationRelay>,
}

impl ServerEndpoint {
    pub fn new(upstream: Arc<UpstreamInfo>) -> Self {
        Self {
            upstream,
            requests: HashMap::new(),
            notifications: HashMap::new(),
            relay: None,
        }
    }

    pub fn set_request_handler(
        &mut self,
        method: impl Into<String>,
        handler: Arc<dyn RequestHandler>,
    ) {
        self.requests.insert(method.into(), handler);
    }

    pub fn set_notification_handler(
        &mut self,
        method: impl Into<String>,
        handler: Arc<dyn NotificationHandler>,
    ) {
        self.notifications.insert(method.into(), handler);
    }

    pub fn set_notification_relay(&mut self, relay: NotificationRelay) {
        self.relay = Some(relay);
    }

    pub fn relays_notifications(&self) -> bool {
        self.relay.is_some()
    }

    pub fn has_request_handler(&self, method: &str) -> bool {
        self.requests.contains_key(method)
    }

    pub fn has_notification_handler(&self, method: &str) -> bool {
        self.notifications.contains_key(method)
    }

    /// Installed request methods, sorted.
    pub fn registered_requests(&self) -> Vec<&str> {
        let mut methods: Vec<&str> = self.requests.keys().map(String::as_str).collect();
        methods.sort_unstable();
        methods
    }

    /// Starts `transport` and serves it until the transport closes.
    pub async fn connect(
        mut self,
        transport: Arc<dyn Transport>,
    ) -> Result<ConnectedServer, TransportError> {
        let (handler, inbound) = inbound_channel();
        transport.start(handler).await?;

        let relay = self.relay.take();
        let task = tokio::spawn(serve(Arc::new(self), relay, transport.clone(), inbound));
        Ok(ConnectedServer { transport, task })
    }

    pub async fn handle_request(
        &self,
        id: MessageId,
        method: &str,
        params: Option<Value>,
    ) -> Message {
        let audit_params = redact_audit_params(params.as_ref());

        let outcome = match self.dispatch(&id, method, params).await {
            Ok(result) => Message::response(id, result),
            Err(error) => error_reply(id, error),
        };

        info!(
            method = %method,
            params = %audit_params,
            outcome = if is_error(&outcome) { "failure" } else { "success" },
            "mcp action audited"
        );

        outcome
    }

    async fn dispatch(
        &self,
        id: &MessageId,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, ErrorObject> {
        let handler = match method {
            "initialize" | "ping" => None,
            _ => Some(self.requests.get(method).ok_or_else(method_not_found)?),
        };

        validate_request_shape(id, method, params.as_ref())?;

        match (method, handler) {
            (_, Some(handler)) => handler.handle(params).await,
            ("initialize", None) => Ok(self.initialize_result(params.as_ref())),
            _ => Ok(json!({})),
        }
    }

    pub async fn handle_notification(&self, method: &str, params: Option<Value>) {
        match self.notifications.get(method) {
            Some(handler) => handler.handle(params).await,
            None if matches!(
                method,
                "notifications/initialized" | "notifications/cancelled"
            ) => {}
            None => debug!(method = %method, "ignoring unhandled notification"),
        }
    }

    fn initialize_result(&self, params: Option<&Value>) -> Value {
        let requested = params
            .and_then(|params| params.get("protocolVersion"))
            .and_then(Value::as_str);

        let mut result = json!({
            "protocolVersion": negotiate_protocol_version(requested, &self.upstream.protocol_version),
            "capabilities": self.upstream.capabilities,
            "serverInfo": self.upstream.server_info,
        });
        if let Some(instructions) = &self.upstream.instructions {
            result["instructions"] = Value::String(instructions.clone());
        }
        result
    }
}

async fn serve(
    endpoint: Arc<ServerEndpoint>,
    mut relay: Option<NotificationRelay>,
    transport: Arc<dyn Transport>,
    mut inbound: mpsc::UnboundedReceiver<Inbound>,
) {
    loop {
        tokio::select! {
            event = inbound.recv() => match event {
                Some(Inbound::Message(Message::Request { id, method, params })) => {
                    let endpoint = endpoint.clone();
                    let transport = transport.clone();
                    tokio::spawn(async move {
                        let reply = endpoint.handle_request(id, &method, params).await;
                        if let Err(err) = transport.send(reply).await {
                            debug!(method = %method, error = %err, "discarding reply for closed session");
                        }
                    });
                }
                Some(Inbound::Message(Message::Notification { method, params })) => {
                    endpoint.handle_notification(&method, params).await;
                }
                Some(Inbound::Message(_)) => {
                    debug!("ignoring response sent by downstream client");
                }
                Some(Inbound::Error(err)) => {
                    warn!(error = %err, "downstream transport error");
                }
                Some(Inbound::Closed(reason)) => {
                    debug!(reason = ?reason, "downstream transport closed");
                    break;
                }
                None => break,
            },
            relayed = next_relayed(&mut relay) => match relayed {
                Some(notification) => {
                    if let Err(err) = transport.send(notification).await {
                        debug!(error = %err, "discarding upstream notification for closed session");
                    }
                }
                None => relay = None,
            },
        }
    }
}

async fn next_relayed(relay: &mut Option<NotificationRelay>) -> Option<Message> {
    match relay {
        Some(relay) => relay.next().await,
        None => std::future::pending().await,
    }
}

/// A served endpoint. Dropping it leaves the serve task running until its
/// transport closes.
pub struct ConnectedServer {
    transport: Arc<dyn Transport>,
    task: JoinHandle<()>,
}

impl ConnectedServer {
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub async fn close(self) -> Result<(), TransportError> {
        self.transport.close().await?;
        let _ = self.task.await;
        Ok(())
    }
}

/// The client's requested version when supported, otherwise the upstream's.
pub fn negotiate_protocol_version(requested: Option<&str>, upstream: &str) -> String {
    requested
        .map(str::trim)
        .filter(|version| SUPPORTED_PROTOCOL_VERSIONS.contains(version))
        .unwrap_or(upstream)
        .to_string()
}

pub fn validate_request_shape(
    id: &MessageId,
    method: &str,
    params: Option<&Value>,
) -> Result<(), ErrorObject> {
    let payload = Message::request(id.clone(), method, params.cloned()).to_value();

    let valid = match method {
        "tools/call" => serde_json::from_value::<CallToolRequest>(payload).is_ok(),
        "tools/list" => serde_json::from_value::<ListToolsRequest>(payload).is_ok(),
        "resources/read" => serde_json::from_value::<ReadResourceRequest>(payload).is_ok(),
        "resources/list" => serde_json::from_value::<ListResourcesRequest>(payload).is_ok(),
        "resources/templates/list" => {
            serde_json::from_value::<ListResourceTemplatesRequest>(payload).is_ok()
        }
        "prompts/get" => serde_json::from_value::<GetPromptRequest>(payload).is_ok(),
        "prompts/list" => serde_json::from_value::<ListPromptsRequest>(payload).is_ok(),
        "completion/complete" => serde_json::from_value::<CompleteRequest>(payload).is_ok(),
        "ping" => serde_json::from_value::<PingRequest>(payload).is_ok(),
        "initialize" => serde_json::from_value::<InitializeRequest>(payload).is_ok(),
        _ => true,
    };

    if valid {
        Ok(())
    } else {
        Err(invalid_params())
    }
}

pub fn redact_audit_params(params: Option<&Value>) -> Value {
    params.map(redact_audit_value).unwrap_or(Value::Null)
}

pub fn redact_audit_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| {
                    if is_sensitive_key(key) {
                        (key.clone(), Value::String("[REDACTED]".to_string()))
                    } else {
                        (key.clone(), redact_audit_value(item))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact_audit_value).collect()),
        _ => value.clone(),
    }
}

pub fn is_sensitive_key(key: &str) -> bool {
    let normalized = key.trim().to_ascii_lowercase();
    matches!(
        normalized.as_str(),
        "authorization" | "bearer" | "api_key" | "apikey"
    ) || normalized.contains("token")
        || normalized.contains("secret")
        || normalized.contains("password")
        || normalized.contains("credential")
}
