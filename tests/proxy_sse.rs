//! End-to-end tests: the proxy in front of the `mock_stdio_server` binary.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use mcp_sse_proxy::{
    errors::ProxyError,
    http::SseServerOptions,
    mcp::client::ClientOptions,
    proxy::{Proxy, ProxyOptions},
    transport::{
        stdio::StdioParams,
        tap::{TapHandler, TransportEvent},
    },
};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tower::ServiceExt;

const MOCK_SERVER: &str = env!("CARGO_BIN_EXE_mock_stdio_server");

fn options(vars: &[(&str, &str)]) -> ProxyOptions {
    let env: HashMap<String, String> = vars
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();

    ProxyOptions {
        upstream: StdioParams::new(MOCK_SERVER, Vec::new()).with_env(env),
        client: ClientOptions {
            handshake_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(5),
        },
        server: SseServerOptions {
            bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..SseServerOptions::default()
        },
        upstream_tap: None,
    }
}

async fn start(capabilities: &str) -> Proxy {
    Proxy::start(options(&[("MOCK_CAPABILITIES", capabilities)]))
        .await
        .expect("proxy starts")
}

struct Session {
    body: Body,
    buffer: String,
    url: String,
}

impl Session {
    async fn open(app: &Router) -> Self {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/sse")
                    .method("GET")
                    .body(Body::empty())
                    .expect("request build"),
            )
            .await
            .expect("request execution");
        assert_eq!(response.status(), StatusCode::OK);

        let mut session = Self {
            body: response.into_body(),
            buffer: String::new(),
            url: String::new(),
        };
        let (event, url) = session.next_event().await;
        assert_eq!(event, "endpoint");
        session.url = url;
        session
    }

    async fn next_event(&mut self) -> (String, String) {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let Some(end) = self.buffer.find("\n\n") {
                    let block: String = self.buffer.drain(..end + 2).collect();
                    let mut event = String::new();
                    let mut data = String::new();
                    for line in block.lines() {
                        if let Some(value) = line.strip_prefix("event:") {
                            event = value.trim_start().to_string();
                        } else if let Some(value) = line.strip_prefix("data:") {
                            data = value.trim_start().to_string();
                        }
                    }
                    if !event.is_empty() || !data.is_empty() {
                        return (event, data);
                    }
                    continue;
                }

                let frame = self
                    .body
                    .frame()
                    .await
                    .expect("stream ended")
                    .expect("body frame");
                if let Ok(bytes) = frame.into_data() {
                    self.buffer.push_str(&String::from_utf8_lossy(&bytes));
                }
            }
        })
        .await
        .expect("sse event within timeout")
    }

    /// Skips notifications until the reply to `id` arrives.
    async fn reply_to(&mut self, id: i64) -> Value {
        loop {
            let (event, data) = self.next_event().await;
            if event != "message" {
                continue;
            }
            let message: Value = serde_json::from_str(&data).expect("json message");
            if message["id"] == json!(id) {
                return message;
            }
        }
    }

    async fn post(&self, app: &Router, message: Value) -> StatusCode {
        post_to(app, &self.url, message).await
    }
}

async fn post_to(app: &Router, url: &str, message: Value) -> StatusCode {
    app.clone()
        .oneshot(
            Request::builder()
                .uri(url)
                .method("POST")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(message.to_string()))
                .expect("request build"),
        )
        .await
        .expect("request execution")
        .status()
}

fn request(id: i64, method: &str, params: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params})
}

#[tokio::test]
async fn resources_only_upstream_forwards_resources_and_rejects_tools() {
    let proxy = start("resources").await;
    let app = proxy.sessions().router();
    let mut session = Session::open(&app).await;

    let initialize = request(
        1,
        "initialize",
        json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {},
            "clientInfo": {"name": "it", "version": "0.0.1"}
        }),
    );
    assert_eq!(session.post(&app, initialize).await, StatusCode::ACCEPTED);
    let initialized = session.reply_to(1).await;
    assert_eq!(
        initialized["result"]["serverInfo"]["name"],
        json!("mock-stdio-server")
    );
    assert_eq!(initialized["result"]["capabilities"], json!({"resources": {}}));

    session
        .post(&app, request(2, "resources/list", json!({})))
        .await;
    let listed = session.reply_to(2).await;
    assert_eq!(
        listed["result"]["resources"][0]["uri"],
        json!("file:///example.txt")
    );

    session
        .post(
            &app,
            request(3, "resources/read", json!({"uri": "file:///missing.txt"})),
        )
        .await;
    let missing = session.reply_to(3).await;
    assert_eq!(missing["error"]["code"], json!(-32002));

    session
        .post(
            &app,
            request(4, "tools/call", json!({"name": "echo", "arguments": {}})),
        )
        .await;
    let rejected = session.reply_to(4).await;
    assert_eq!(rejected["error"]["code"], json!(-32601));

    session
        .post(
            &app,
            request(
                5,
                "completion/complete",
                json!({
                    "ref": {"type": "ref/prompt", "name": "greeting"},
                    "argument": {"name": "who", "value": "wor"}
                }),
            ),
        )
        .await;
    let completed = session.reply_to(5).await;
    assert_eq!(
        completed["result"]["completion"]["values"],
        json!(["example"])
    );

    proxy.shutdown().await;
}

#[tokio::test]
async fn upstream_exit_fails_pending_and_later_requests() {
    let proxy = start("tools").await;
    let app = proxy.sessions().router();
    let mut first = Session::open(&app).await;
    let mut second = Session::open(&app).await;

    first
        .post(&app, request(1, "tools/call", json!({"name": "exit"})))
        .await;
    let pending = first.reply_to(1).await;
    assert_eq!(pending["error"]["code"], json!(-32000));

    let status = second
        .post(&app, request(2, "tools/list", json!({})))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let later = second.reply_to(2).await;
    assert_eq!(later["error"]["code"], json!(-32000));
    assert!(!proxy.upstream().handle().is_connected());

    let ping = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/ping")
                .body(Body::empty())
                .expect("request build"),
        )
        .await
        .expect("request execution");
    assert_eq!(ping.status(), StatusCode::OK);

    proxy.shutdown().await;
}

#[tokio::test]
async fn disconnected_session_is_rejected_while_other_is_served() {
    let proxy = start("tools").await;
    let app = proxy.sessions().router();
    let gone = Session::open(&app).await;
    let mut kept = Session::open(&app).await;
    assert_eq!(proxy.sessions().session_count(), 2);

    let gone_url = gone.url.clone();
    drop(gone);
    assert_eq!(proxy.sessions().session_count(), 1);

    let status = post_to(&app, &gone_url, request(1, "tools/list", json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let status = kept
        .post(
            &app,
            request(2, "tools/call", json!({"name": "echo", "arguments": {"text": "hi"}})),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let echoed = kept.reply_to(2).await;
    assert_eq!(echoed["result"]["content"][0]["text"], json!("hi"));
    assert!(proxy.upstream().handle().is_connected());

    proxy.shutdown().await;
}

#[tokio::test]
async fn in_flight_request_outlives_its_closed_session() {
    let proxy = start("tools").await;
    let app = proxy.sessions().router();
    let closing = Session::open(&app).await;
    let mut kept = Session::open(&app).await;

    let status = closing
        .post(&app, request(1, "tools/call", json!({"name": "slow"})))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let closing_url = closing.url.clone();
    drop(closing);
    let status = post_to(&app, &closing_url, request(2, "tools/list", json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let status = kept
        .post(&app, request(3, "tools/list", json!({})))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let listed = kept.reply_to(3).await;
    assert_eq!(listed["result"]["tools"][0]["name"], json!("echo"));
    assert!(proxy.upstream().handle().is_connected());
    assert_eq!(proxy.sessions().session_count(), 1);

    proxy.shutdown().await;
}

#[tokio::test]
async fn upstream_log_messages_are_pushed_to_sessions() {
    let proxy = start("logging,tools").await;
    let app = proxy.sessions().router();
    let mut caller = Session::open(&app).await;
    let mut watcher = Session::open(&app).await;

    caller
        .post(&app, request(1, "tools/call", json!({"name": "log"})))
        .await;
    let replied = caller.reply_to(1).await;
    assert_eq!(replied["result"]["content"][0]["text"], json!("logged"));

    loop {
        let (event, data) = watcher.next_event().await;
        if event != "message" {
            continue;
        }
        let message: Value = serde_json::from_str(&data).expect("json message");
        if message["method"] == json!("notifications/message") {
            assert_eq!(message["params"]["level"], json!("error"));
            assert_eq!(message["params"]["data"], json!("disk full"));
            break;
        }
    }

    proxy.shutdown().await;
}

#[tokio::test]
async fn serves_on_os_assigned_port() {
    let proxy = start("resources").await;
    let addr = proxy.local_addr();
    assert_ne!(addr.port(), 0);

    let mut stream = tokio::net::TcpStream::connect(addr)
        .await
        .expect("connect to proxy");
    stream
        .write_all(b"GET /ping HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .expect("write request");
    let mut response = String::new();
    stream
        .read_to_string(&mut response)
        .await
        .expect("read response");

    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.ends_with("pong"));

    tokio::time::timeout(Duration::from_secs(10), proxy.shutdown())
        .await
        .expect("shutdown completes");
}

#[tokio::test]
async fn malformed_upstream_line_is_skipped() {
    let proxy = Proxy::start(options(&[
        ("MOCK_CAPABILITIES", "resources"),
        ("MOCK_GARBAGE_FIRST", "1"),
    ]))
    .await
    .expect("proxy starts despite a malformed line");

    assert!(proxy.upstream().info().capability_set.has("resources"));
    proxy.shutdown().await;
}

#[tokio::test]
async fn missing_upstream_command_fails_startup() {
    let mut options = options(&[]);
    options.upstream = StdioParams::new("/nonexistent/mcp-server", Vec::new());

    let err = Proxy::start(options)
        .await
        .err()
        .expect("startup must fail");

    assert!(matches!(err, ProxyError::Upstream(_)));
}

#[tokio::test]
async fn upstream_tap_observes_handshake() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let tap: TapHandler = Arc::new(move |event: &TransportEvent<'_>| {
        sink.lock().expect("events lock").push(event.kind());
    });

    let mut options = options(&[("MOCK_CAPABILITIES", "resources")]);
    options.upstream_tap = Some(tap);
    let proxy = Proxy::start(options).await.expect("proxy starts");
    proxy.shutdown().await;

    let events = events.lock().expect("events lock").clone();
    assert_eq!(&events[..4], &["start", "send", "onmessage", "send"]);
    assert_eq!(&events[events.len() - 2..], &["close", "onclose"]);
}
