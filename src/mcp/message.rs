//! JSON-RPC 2.0 message envelope
//!
//! Every frame exchanged with the upstream peer or a downstream session is one
//! [`Message`]. Parsing classifies a raw JSON object into exactly one variant and
//! rejects batches, wrong protocol versions and malformed ids.

use std::fmt;

use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};
use rust_mcp_sdk::schema::RpcError;
use serde_json::{Map, Value};
use thiserror::Error;

pub const JSONRPC_VERSION: &str = "2.0";

/// A request id. JSON-RPC allows integers and strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageId {
    Number(i64),
    String(String),
}

impl MessageId {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(id) => Some(Self::String(id.clone())),
            Value::Number(number) => number.as_i64().map(Self::Number),
            _ => None,
        }
    }

    fn to_value(&self) -> Value {
        match self {
            Self::Number(id) => Value::from(*id),
            Self::String(id) => Value::String(id.clone()),
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(id) => write!(f, "{id}"),
            Self::String(id) => f.write_str(id),
        }
    }
}

impl From<i64> for MessageId {
    fn from(id: i64) -> Self {
        Self::Number(id)
    }
}

/// The `error` member of an error response.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    pub data: Option<Value>,
}

impl ErrorObject {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request {
        id: MessageId,
        method: String,
        params: Option<Value>,
    },
    Response {
        id: MessageId,
        result: Value,
    },
    /// `id` is `None` only when the peer could not determine the request id,
    /// e.g. for parse errors.
    ErrorResponse {
        id: Option<MessageId>,
        error: ErrorObject,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("invalid json: {0}")]
    Json(String),
    #[error("batch messages are not supported")]
    UnsupportedBatch,
    #[error("message is not a json object")]
    NotAnObject,
    #[error("missing or unsupported jsonrpc version")]
    InvalidVersion,
    #[error("invalid id field")]
    InvalidId,
    #[error("invalid error object")]
    InvalidError,
    #[error("message has neither method, result nor error")]
    Unclassifiable,
}

impl Message {
    pub fn request(id: MessageId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Request {
            id,
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Notification {
            method: method.into(),
            params,
        }
    }

    pub fn response(id: MessageId, result: Value) -> Self {
        Self::Response { id, result }
    }

    pub fn error(id: Option<MessageId>, error: ErrorObject) -> Self {
        Self::ErrorResponse { id, error }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request { method, .. } | Self::Notification { method, .. } => Some(method),
            Self::Response { .. } | Self::ErrorResponse { .. } => None,
        }
    }

    pub fn id(&self) -> Option<&MessageId> {
        match self {
            Self::Request { id, .. } | Self::Response { id, .. } => Some(id),
            Self::ErrorResponse { id, .. } => id.as_ref(),
            Self::Notification { .. } => None,
        }
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, MessageError> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|err| MessageError::Json(err.to_string()))?;
        Self::try_from(value)
    }

    pub fn from_line(line: &str) -> Result<Self, MessageError> {
        Self::from_slice(line.as_bytes())
    }

    pub fn to_value(&self) -> Value {
        let mut object = Map::new();
        object.insert("jsonrpc".to_string(), Value::from(JSONRPC_VERSION));
        match self {
            Self::Request { id, method, params } => {
                object.insert("id".to_string(), id.to_value());
                object.insert("method".to_string(), Value::from(method.as_str()));
                if let Some(params) = params {
                    object.insert("params".to_string(), params.clone());
                }
            }
            Self::Response { id, result } => {
                object.insert("id".to_string(), id.to_value());
                object.insert("result".to_string(), result.clone());
            }
            Self::ErrorResponse { id, error } => {
                object.insert(
                    "id".to_string(),
                    id.as_ref().map(MessageId::to_value).unwrap_or(Value::Null),
                );
                let body = serde_json::to_value(RpcError::from(error.clone()))
                    .unwrap_or_else(|_| Value::Object(Map::new()));
                object.insert("error".to_string(), body);
            }
            Self::Notification { method, params } => {
                object.insert("method".to_string(), Value::from(method.as_str()));
                if let Some(params) = params {
                    object.insert("params".to_string(), params.clone());
                }
            }
        }
        Value::Object(object)
    }
}

impl TryFrom<Value> for Message {
    type Error = MessageError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let mut object = match value {
            Value::Object(object) => object,
            Value::Array(_) => return Err(MessageError::UnsupportedBatch),
            _ => return Err(MessageError::NotAnObject),
        };

        if object.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
            return Err(MessageError::InvalidVersion);
        }

        let id = match object.remove("id") {
            None | Some(Value::Null) => None,
            Some(raw) => Some(MessageId::from_value(&raw).ok_or(MessageError::InvalidId)?),
        };
        let params = object.remove("params");

        if let Some(method) = object.remove("method") {
            let method = method
                .as_str()
                .map(str::to_string)
                .ok_or(MessageError::Unclassifiable)?;
            return Ok(match id {
                Some(id) => Self::Request { id, method, params },
                None => Self::Notification { method, params },
            });
        }

        if let Some(result) = object.remove("result") {
            let id = id.ok_or(MessageError::InvalidId)?;
            return Ok(Self::Response { id, result });
        }

        if let Some(error) = object.remove("error") {
            let error: RpcError =
                serde_json::from_value(error).map_err(|_| MessageError::InvalidError)?;
            return Ok(Self::ErrorResponse {
                id,
                error: ErrorObject::from(error),
            });
        }

        Err(MessageError::Unclassifiable)
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::try_from(value).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn classifies_request_and_notification() {
        let request =
            Message::from_line(r#"{"jsonrpc":"2.0","id":7,"method":"tools/list","params":{}}"#)
                .expect("request parses");
        assert_eq!(
            request,
            Message::request(MessageId::Number(7), "tools/list", Some(json!({})))
        );

        let notification =
            Message::from_line(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
                .expect("notification parses");
        assert_eq!(
            notification,
            Message::notification("notifications/initialized", None)
        );
    }

    #[test]
    fn string_ids_are_preserved() {
        let message = Message::from_line(r#"{"jsonrpc":"2.0","id":"abc","result":{"ok":true}}"#)
            .expect("response parses");
        assert_eq!(message.id(), Some(&MessageId::String("abc".to_string())));
        assert_eq!(message.to_value()["id"], json!("abc"));
    }

    #[test]
    fn error_response_keeps_data_and_null_id() {
        let message = Message::from_line(
            r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32700,"message":"Parse error","data":{"line":1}}}"#,
        )
        .expect("error parses");

        match &message {
            Message::ErrorResponse { id, error } => {
                assert!(id.is_none());
                assert_eq!(error.code, -32700);
                assert_eq!(error.data, Some(json!({"line": 1})));
            }
            other => panic!("unexpected message {other:?}"),
        }

        let value = message.to_value();
        assert!(value["id"].is_null());
        assert_eq!(value["error"]["data"]["line"], 1);
    }

    #[test]
    fn rejects_batches_and_wrong_versions() {
        assert_eq!(
            Message::from_line(r#"[{"jsonrpc":"2.0","method":"ping"}]"#),
            Err(MessageError::UnsupportedBatch)
        );
        assert_eq!(
            Message::from_line(r#"{"jsonrpc":"1.0","id":1,"method":"ping"}"#),
            Err(MessageError::InvalidVersion)
        );
        assert_eq!(
            Message::from_line(r#"{"id":1,"method":"ping"}"#),
            Err(MessageError::InvalidVersion)
        );
    }

    #[test]
    fn rejects_invalid_ids_and_empty_objects() {
        assert_eq!(
            Message::from_line(r#"{"jsonrpc":"2.0","id":{"x":1},"method":"ping"}"#),
            Err(MessageError::InvalidId)
        );
        assert_eq!(
            Message::from_line(r#"{"jsonrpc":"2.0","id":1}"#),
            Err(MessageError::Unclassifiable)
        );
        assert_eq!(
            Message::from_line(r#"{"jsonrpc":"2.0","id":1,"error":{"code":"bad"}}"#),
            Err(MessageError::InvalidError)
        );
        assert!(matches!(
            Message::from_line("not json"),
            Err(MessageError::Json(_))
        ));
    }

    #[test]
    fn serialization_always_tags_version() {
        let line = serde_json::to_string(&Message::notification("ping", None))
            .expect("serializes");
        assert_eq!(line, r#"{"jsonrpc":"2.0","method":"ping"}"#);
    }
}
