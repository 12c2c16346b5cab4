use std::time::Instant;

use axum::{extract::Request, middleware::Next, response::Response};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use crate::transport::tap::{TapHandler, TransportEvent};

/// `RUST_LOG` wins; otherwise `info`, or `debug` when `debug` is set.
pub fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

pub async fn request_logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started_at = Instant::now();

    let response = next.run(request).await;
    let status = response.status();
    let elapsed_ms = started_at.elapsed().as_millis();

    info!(
        method = %method,
        path = %path,
        status = status.as_u16(),
        duration_ms = elapsed_ms,
        "request summary"
    );

    if status.is_client_error() {
        warn!(method = %method, path = %path, status = status.as_u16(), "request rejected");
    }

    response
}

/// Tap handler that records every transport event at `debug`, labelled with
/// the side of the proxy it was observed on.
pub fn transport_event_logger(side: &'static str) -> TapHandler {
    std::sync::Arc::new(move |event: &TransportEvent<'_>| match event {
        TransportEvent::Send(message) | TransportEvent::OnMessage(message) => debug!(
            side,
            event = event.kind(),
            message = %message.to_value(),
            "transport event"
        ),
        TransportEvent::OnError(err) => debug!(
            side,
            event = event.kind(),
            error = %err,
            "transport event"
        ),
        _ => debug!(side, event = event.kind(), "transport event"),
    })
}

/// Diagnostic sink for the upstream's stderr.
pub fn log_upstream_stderr(chunk: &[u8]) {
    let text = String::from_utf8_lossy(chunk);
    let text = text.trim_end();
    if !text.is_empty() {
        info!(stream = "stderr", "{text}");
    }
}
