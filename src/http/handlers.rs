//! Axum HTTP handlers for the SSE front end
//!
//! The event stream route opens a session, the submission route feeds it, and
//! `/ping` and `/health` report liveness.

use std::{convert::Infallible, sync::Arc, time::Duration};

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use crate::errors::AppError;
use crate::http::session::SessionManager;
use crate::mcp::message::Message;
use crate::transport::{
    sse::{SseFrame, SseTransport},
    tap::tap,
    Transport,
};

pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

pub async fn ping() -> &'static str {
    "pong"
}

pub async fn open_session(
    State(manager): State<SessionManager>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let session_id = Uuid::new_v4().to_string();
    let (sse, stream) = SseTransport::new(session_id.clone(), &manager.options().messages_path);

    let endpoint = manager.new_endpoint()?;
    let transport: Arc<dyn Transport> = match &manager.options().transport_tap {
        Some(handler) => tap(sse.clone(), handler.clone()),
        None => sse.clone(),
    };
    let server = endpoint
        .connect(transport.clone())
        .await
        .map_err(|err| AppError::internal(format!("could not start session transport: {err}")))?;

    let stream = stream.on_disconnect({
        let manager = manager.clone();
        let session_id = session_id.clone();
        move || {
            manager.close_session(&session_id);
        }
    });
    manager.register(&session_id, sse, server);

    let greeting = Message::notification(
        "sse/connection",
        Some(json!({ "message": "SSE Connection established" })),
    );
    if let Err(err) = transport.send(greeting).await {
        debug!(session_id = %session_id, error = %err, "could not greet sse session");
    }

    let events = stream.map(|frame| Ok::<_, Infallible>(frame_to_event(frame)));
    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL)))
}

pub async fn post_message(
    State(manager): State<SessionManager>,
    Query(query): Query<MessageQuery>,
    body: Bytes,
) -> Result<(StatusCode, &'static str), AppError> {
    let session_id = query
        .session_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| AppError::bad_request("missing_session_id", "No sessionId"))?;
    let transport = manager.transport(&session_id).ok_or_else(|| {
        AppError::bad_request("unknown_session", "No transport found for sessionId")
    })?;

    transport
        .handle_post_message(&body)
        .map_err(|err| AppError::bad_request("invalid_message", err.to_string()))?;

    Ok((StatusCode::ACCEPTED, "Accepted"))
}

fn frame_to_event(frame: SseFrame) -> Event {
    match frame {
        SseFrame::Endpoint(url) => Event::default().event("endpoint").data(url),
        SseFrame::Message(message) => Event::default()
            .event("message")
            .data(message.to_value().to_string()),
    }
}
