use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::config::ConfigError;

/// Failures surfaced by a [`crate::transport::Transport`] implementation.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to spawn `{command}`: {reason}")]
    Spawn { command: String, reason: String },
    #[error("transport io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed frame: {reason}")]
    MalformedFrame { reason: String },
    #[error("transport is not connected")]
    NotConnected,
    #[error("transport already started")]
    AlreadyStarted,
    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl TransportError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedFrame {
            reason: reason.into(),
        }
    }
}

/// Failures of a call made against the upstream peer.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream returned error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<Value>,
    },
    #[error("upstream connection closed")]
    Disconnected,
    #[error("upstream request timed out")]
    Timeout,
    #[error("upstream handshake failed: {0}")]
    Handshake(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Startup failures of the whole proxy.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("could not connect to upstream: {0}")]
    Upstream(#[from] UpstreamError),
    #[error("could not bind listener: {0}")]
    Bind(#[source] std::io::Error),
}

/// Errors returned by the HTTP surface.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("bad request: {message}")]
    BadRequest { code: &'static str, message: String },
    #[error("internal error")]
    Internal { code: &'static str, message: String },
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    pub details: Value,
}

impl AppError {
    pub fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::BadRequest {
            code,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            code: "internal_error",
            message: message.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            Self::BadRequest { code, message } => (StatusCode::BAD_REQUEST, code, message),
            Self::Internal { code, message } => {
                tracing::error!(error = %message, "request failed with internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    code,
                    "internal server error".to_string(),
                )
            }
        };

        (
            status,
            Json(ErrorResponse {
                code: code.to_string(),
                message,
                details: json!({}),
            }),
        )
            .into_response()
    }
}
