//! JSON-RPC error codes and error-object helpers
//!
//! Maps proxy-side failures onto the error objects relayed to downstream callers.

use rust_mcp_sdk::schema::RpcError;

use crate::errors::UpstreamError;
use crate::mcp::message::{ErrorObject, Message, MessageId};

pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
pub const CONNECTION_CLOSED: i64 = -32000;
pub const REQUEST_TIMEOUT: i64 = -32001;

pub fn method_not_found() -> ErrorObject {
    ErrorObject::new(METHOD_NOT_FOUND, "Method not found")
}

pub fn invalid_params() -> ErrorObject {
    ErrorObject::new(INVALID_PARAMS, "Invalid params")
}

/// Upstream JSON-RPC errors are relayed untouched; everything else becomes a
/// request-scoped error with a standard code.
pub fn upstream_error_to_rpc(err: UpstreamError) -> ErrorObject {
    match err {
        UpstreamError::Rpc {
            code,
            message,
            data,
        } => ErrorObject {
            code,
            message,
            data,
        },
        UpstreamError::Disconnected => ErrorObject::new(CONNECTION_CLOSED, "Connection closed"),
        UpstreamError::Timeout => ErrorObject::new(REQUEST_TIMEOUT, "Request timed out"),
        UpstreamError::Handshake(_) | UpstreamError::Transport(_) => {
            ErrorObject::new(INTERNAL_ERROR, "Internal error")
        }
    }
}

impl From<UpstreamError> for ErrorObject {
    fn from(err: UpstreamError) -> Self {
        upstream_error_to_rpc(err)
    }
}

impl From<RpcError> for ErrorObject {
    fn from(error: RpcError) -> Self {
        Self {
            code: error.code,
            message: error.message,
            data: error.data,
        }
    }
}

impl From<ErrorObject> for RpcError {
    fn from(error: ErrorObject) -> Self {
        RpcError {
            code: error.code,
            data: error.data,
            message: error.message,
        }
    }
}

pub fn error_reply(id: MessageId, error: ErrorObject) -> Message {
    Message::error(Some(id), error)
}

pub fn is_error(message: &Message) -> bool {
    matches!(message, Message::ErrorResponse { .. })
}
