//! Capability-gated forwarding table
//!
//! Which downstream methods reach the upstream peer is decided once, from the
//! capabilities the peer declared during the handshake. Every session endpoint
//! then receives the same precomputed forwarders, plus a relay for the
//! upstream notifications its client should see.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::mcp::capabilities::{Capability, CapabilitySet};
use crate::mcp::client::UpstreamHandle;
use crate::mcp::message::ErrorObject;
use crate::mcp::server::{
    NotificationHandler, NotificationRelay, RequestHandler, ServerEndpoint,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RouteKind {
    Request,
    /// Forwarded from the downstream client to the upstream peer.
    Notification,
    /// Relayed from the upstream peer to every downstream session.
    Relay,
}

struct Route {
    /// `None` routes are installed regardless of capabilities.
    capability: Option<Capability>,
    method: &'static str,
    kind: RouteKind,
}

const ROUTES: &[Route] = &[
    Route {
        capability: Some(Capability::Logging),
        method: "notifications/message",
        kind: RouteKind::Notification,
    },
    Route {
        capability: Some(Capability::Logging),
        method: "notifications/message",
        kind: RouteKind::Relay,
    },
    Route {
        capability: Some(Capability::Prompts),
        method: "prompts/get",
        kind: RouteKind::Request,
    },
    Route {
        capability: Some(Capability::Prompts),
        method: "prompts/list",
        kind: RouteKind::Request,
    },
    Route {
        capability: Some(Capability::Resources),
        method: "resources/list",
        kind: RouteKind::Request,
    },
    Route {
        capability: Some(Capability::Resources),
        method: "resources/templates/list",
        kind: RouteKind::Request,
    },
    Route {
        capability: Some(Capability::Resources),
        method: "resources/read",
        kind: RouteKind::Request,
    },
    Route {
        capability: Some(Capability::Tools),
        method: "tools/call",
        kind: RouteKind::Request,
    },
    Route {
        capability: Some(Capability::Tools),
        method: "tools/list",
        kind: RouteKind::Request,
    },
    Route {
        capability: None,
        method: "completion/complete",
        kind: RouteKind::Request,
    },
];

pub struct CapabilityRouter {
    upstream: UpstreamHandle,
    requests: Vec<(&'static str, Arc<dyn RequestHandler>)>,
    notifications: Vec<(&'static str, Arc<dyn NotificationHandler>)>,
    relayed: Vec<&'static str>,
}

impl CapabilityRouter {
    pub fn new(capabilities: &CapabilitySet, upstream: UpstreamHandle) -> Self {
        let mut requests: Vec<(&'static str, Arc<dyn RequestHandler>)> = Vec::new();
        let mut notifications: Vec<(&'static str, Arc<dyn NotificationHandler>)> = Vec::new();
        let mut relayed = Vec::new();

        for route in ROUTES {
            let enabled = route
                .capability
                .map_or(true, |capability| capabilities.contains(capability));
            if !enabled {
                continue;
            }

            match route.kind {
                RouteKind::Request => requests.push((
                    route.method,
                    Arc::new(ForwardRequest {
                        method: route.method,
                        upstream: upstream.clone(),
                    }),
                )),
                RouteKind::Notification => notifications.push((
                    route.method,
                    Arc::new(ForwardNotification {
                        method: route.method,
                        upstream: upstream.clone(),
                    }),
                )),
                RouteKind::Relay => relayed.push(route.method),
            }
        }

        Self {
            upstream,
            requests,
            notifications,
            relayed,
        }
    }

    pub fn install(&self, endpoint: &mut ServerEndpoint) {
        for (method, handler) in &self.requests {
            endpoint.set_request_handler(*method, handler.clone());
        }
        for (method, handler) in &self.notifications {
            endpoint.set_notification_handler(*method, handler.clone());
        }
        if !self.relayed.is_empty() {
            endpoint.set_notification_relay(NotificationRelay::new(
                self.relayed.clone(),
                self.upstream.subscribe_notifications(),
            ));
        }
    }

    pub fn forwarded_requests(&self) -> Vec<&'static str> {
        self.requests.iter().map(|(method, _)| *method).collect()
    }

    pub fn forwarded_notifications(&self) -> Vec<&'static str> {
        self.notifications.iter().map(|(method, _)| *method).collect()
    }

    pub fn relayed_notifications(&self) -> Vec<&'static str> {
        self.relayed.clone()
    }
}

struct ForwardRequest {
    method: &'static str,
    upstream: UpstreamHandle,
}

#[async_trait]
impl RequestHandler for ForwardRequest {
    async fn handle(&self, params: Option<Value>) -> Result<Value, ErrorObject> {
        self.upstream
            .request(self.method, params)
            .await
            .map_err(ErrorObject::from)
    }
}

struct ForwardNotification {
    method: &'static str,
    upstream: UpstreamHandle,
}

#[async_trait]
impl NotificationHandler for ForwardNotification {
    async fn handle(&self, params: Option<Value>) {
        if let Err(err) = self.upstream.notify(self.method, params).await {
            debug!(method = self.method, error = %err, "could not forward notification upstream");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::mcp::client::{ClientOptions, UpstreamClient, UpstreamInfo};
    use crate::mcp::message::{Message, MessageId};
    use crate::mcp::rpc::{error_reply, CONNECTION_CLOSED};
    use crate::transport::{testing::LoopbackTransport, CloseReason};

    fn upstream_peer() -> Arc<LoopbackTransport> {
        LoopbackTransport::new(|message| match message {
            Message::Request { id, method, .. } if method == "initialize" => Some(
                Message::response(
                    id.clone(),
                    json!({
                        "protocolVersion": "2024-11-05",
                        "capabilities": {"resources": {}, "logging": {}},
                        "serverInfo": {"name": "mock", "version": "1.0.0"}
                    }),
                ),
            ),
            Message::Request { id, method, .. } if method == "resources/read" => Some(error_reply(
                id.clone(),
                ErrorObject {
                    code: -32002,
                    message: "Resource not found".to_string(),
                    data: Some(json!({"uri": "file:///missing"})),
                },
            )),
            Message::Request { id, method, params } => Some(Message::response(
                id.clone(),
                json!({"method": method, "params": params}),
            )),
            _ => None,
        })
    }

    async fn connect(peer: Arc<LoopbackTransport>) -> (UpstreamHandle, UpstreamInfo) {
        let options = ClientOptions {
            handshake_timeout: Duration::from_millis(500),
            request_timeout: Duration::from_millis(500),
        };
        UpstreamClient::connect(peer, options)
            .await
            .expect("handshake")
    }

    #[tokio::test]
    async fn routes_follow_declared_capabilities() {
        let (upstream, _) = connect(upstream_peer()).await;

        let tools_only = CapabilityRouter::new(&CapabilitySet::from_names(["tools"]), upstream.clone());
        assert_eq!(
            tools_only.forwarded_requests(),
            vec!["tools/call", "tools/list", "completion/complete"]
        );
        assert!(tools_only.forwarded_notifications().is_empty());
        assert!(tools_only.relayed_notifications().is_empty());

        let empty = CapabilityRouter::new(&CapabilitySet::default(), upstream.clone());
        assert_eq!(empty.forwarded_requests(), vec!["completion/complete"]);

        let everything = CapabilityRouter::new(
            &CapabilitySet::from_names(["prompts", "resources", "tools", "logging", "experimental"]),
            upstream,
        );
        assert_eq!(everything.forwarded_requests().len(), 8);
        assert_eq!(
            everything.forwarded_notifications(),
            vec!["notifications/message"]
        );
        assert_eq!(
            everything.relayed_notifications(),
            vec!["notifications/message"]
        );
    }

    #[tokio::test]
    async fn installs_forwarders_on_each_endpoint() {
        let (upstream, info) = connect(upstream_peer()).await;
        let info = Arc::new(info);
        let router = CapabilityRouter::new(&info.capability_set, upstream);

        for _ in 0..2 {
            let mut endpoint = ServerEndpoint::new(info.clone());
            router.install(&mut endpoint);
            assert_eq!(
                endpoint.registered_requests(),
                vec![
                    "completion/complete",
                    "resources/list",
                    "resources/read",
                    "resources/templates/list"
                ]
            );
            assert!(endpoint.has_notification_handler("notifications/message"));
            assert!(endpoint.relays_notifications());
            assert!(!endpoint.has_request_handler("tools/call"));
        }

        let mut without_logging = ServerEndpoint::new(info.clone());
        CapabilityRouter::new(
            &CapabilitySet::from_names(["resources"]),
            router.upstream.clone(),
        )
        .install(&mut without_logging);
        assert!(!without_logging.relays_notifications());
    }

    #[tokio::test]
    async fn upstream_log_messages_reach_connected_session() {
        let peer = upstream_peer();
        let (upstream, info) = connect(peer.clone()).await;
        let mut endpoint = ServerEndpoint::new(Arc::new(info.clone()));
        CapabilityRouter::new(&info.capability_set, upstream).install(&mut endpoint);

        let session = LoopbackTransport::silent();
        let server = endpoint.connect(session.clone()).await.expect("connect");

        let logged = Message::notification(
            "notifications/message",
            Some(json!({"level": "error", "data": "disk full"})),
        );
        peer.deliver(Message::notification(
            "notifications/resources/list_changed",
            None,
        ));
        peer.deliver(logged.clone());

        for _ in 0..100 {
            if !session.sent().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(session.sent(), vec![logged]);

        server.close().await.expect("close");
    }

    #[tokio::test]
    async fn forwards_params_and_relays_results_verbatim() {
        let peer = upstream_peer();
        let (upstream, info) = connect(peer.clone()).await;
        let mut endpoint = ServerEndpoint::new(Arc::new(info.clone()));
        CapabilityRouter::new(&info.capability_set, upstream).install(&mut endpoint);

        let listed = endpoint
            .handle_request(
                MessageId::Number(10),
                "resources/list",
                Some(json!({"cursor": "next"})),
            )
            .await;
        let Message::Response { id, result } = listed else {
            panic!("resources/list must succeed: {listed:?}");
        };
        assert_eq!(id, MessageId::Number(10));
        assert_eq!(
            result,
            json!({"method": "resources/list", "params": {"cursor": "next"}})
        );

        let missing = endpoint
            .handle_request(
                MessageId::Number(11),
                "resources/read",
                Some(json!({"uri": "file:///missing"})),
            )
            .await;
        assert_eq!(
            missing,
            error_reply(
                MessageId::Number(11),
                ErrorObject {
                    code: -32002,
                    message: "Resource not found".to_string(),
                    data: Some(json!({"uri": "file:///missing"})),
                }
            )
        );

        endpoint
            .handle_notification(
                "notifications/message",
                Some(json!({"level": "info", "data": "from client"})),
            )
            .await;
        assert!(peer
            .sent()
            .iter()
            .any(|message| message.method() == Some("notifications/message")));
    }

    #[tokio::test]
    async fn upstream_disconnect_becomes_request_scoped_error() {
        let peer = upstream_peer();
        let (upstream, info) = connect(peer.clone()).await;
        let mut endpoint = ServerEndpoint::new(Arc::new(info.clone()));
        CapabilityRouter::new(&info.capability_set, upstream.clone()).install(&mut endpoint);

        peer.drop_connection(CloseReason::Exited { code: 1 });
        for _ in 0..100 {
            if !upstream.is_connected() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let reply = endpoint
            .handle_request(MessageId::Number(12), "resources/list", None)
            .await;
        assert!(matches!(
            reply,
            Message::ErrorResponse { error: ErrorObject { code: CONNECTION_CLOSED, .. }, .. }
        ));
    }
}
