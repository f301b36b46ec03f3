//! JSON-RPC 2.0 message types and the structural decoder.
//!
//! Messages are classified purely by which fields are present:
//!
//! | fields present              | message        |
//! |-----------------------------|----------------|
//! | `id` + (`result` or `error`) | response       |
//! | `id` + `method`             | request        |
//! | `method` only               | notification   |

use fastacp_core::AcpError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// JSON-RPC protocol version carried by every message.
pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC request ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Integer ID.
    Number(i64),
    /// String ID.
    String(String),
}

impl From<i64> for RequestId {
    fn from(id: i64) -> Self {
        RequestId::Number(id)
    }
}

impl From<String> for RequestId {
    fn from(id: String) -> Self {
        RequestId::String(id)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        RequestId::String(id.to_owned())
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "{s}"),
        }
    }
}

/// JSON-RPC 2.0 request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonRpcRequest {
    /// Protocol version (always "2.0").
    pub jsonrpc: String,
    /// Request ID.
    pub id: RequestId,
    /// Method name.
    pub method: String,
    /// Request parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Creates a new request with the given method and parameters.
    #[must_use]
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC 2.0 notification (a request without an ID).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonRpcNotification {
    /// Protocol version (always "2.0").
    pub jsonrpc: String,
    /// Method name.
    pub method: String,
    /// Notification parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    /// Creates a new notification.
    #[must_use]
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            method: method.into(),
            params,
        }
    }
}

/// Outcome carried by a response: exactly one of `result` or `error`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponsePayload {
    /// Success value (may be `null`).
    Result(Value),
    /// Error object.
    Error(AcpError),
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonRpcResponse {
    /// Protocol version (always "2.0").
    pub jsonrpc: String,
    /// Request ID this is responding to (`null` when the request was unreadable).
    pub id: Option<RequestId>,
    /// Result or error.
    #[serde(flatten)]
    pub payload: ResponsePayload,
}

impl JsonRpcResponse {
    /// Creates a success response.
    #[must_use]
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id: Some(id),
            payload: ResponsePayload::Result(result),
        }
    }

    /// Creates an error response.
    #[must_use]
    pub fn error(id: Option<RequestId>, error: AcpError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id,
            payload: ResponsePayload::Error(error),
        }
    }

    /// Returns true if this is an error response.
    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self.payload, ResponsePayload::Error(_))
    }

    /// Converts the payload into a `Result`.
    pub fn into_result(self) -> Result<Value, AcpError> {
        match self.payload {
            ResponsePayload::Result(value) => Ok(value),
            ResponsePayload::Error(error) => Err(error),
        }
    }
}

/// A JSON-RPC message (request, notification, or response).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    /// A request expecting a response.
    Request(JsonRpcRequest),
    /// A fire-and-forget notification.
    Notification(JsonRpcNotification),
    /// A response to an earlier request.
    Response(JsonRpcResponse),
}

impl JsonRpcMessage {
    /// Returns the method name for requests and notifications.
    #[must_use]
    pub fn method(&self) -> Option<&str> {
        match self {
            JsonRpcMessage::Request(req) => Some(&req.method),
            JsonRpcMessage::Notification(notif) => Some(&notif.method),
            JsonRpcMessage::Response(_) => None,
        }
    }

    /// Classifies a parsed JSON value by field presence.
    ///
    /// # Errors
    ///
    /// Fails if the value is not an object, matches no message shape, or a
    /// recognised field has the wrong type.
    pub fn from_value(value: Value) -> Result<Self, DecodeError> {
        let Value::Object(mut map) = value else {
            return Err(DecodeError::NotAnObject);
        };

        let jsonrpc = match map.remove("jsonrpc") {
            Some(Value::String(version)) => version,
            _ => JSONRPC_VERSION.to_owned(),
        };
        let has_id = map.contains_key("id");

        if has_id && (map.contains_key("result") || map.contains_key("error")) {
            let id = match map.remove("id") {
                Some(Value::Null) | None => None,
                Some(raw) => Some(parse_field::<RequestId>("id", raw)?),
            };
            let payload = match map.remove("error") {
                Some(raw) if !raw.is_null() => {
                    ResponsePayload::Error(parse_field::<AcpError>("error", raw)?)
                }
                _ => ResponsePayload::Result(map.remove("result").unwrap_or(Value::Null)),
            };
            return Ok(JsonRpcMessage::Response(JsonRpcResponse {
                jsonrpc,
                id,
                payload,
            }));
        }

        let Some(method) = map.remove("method") else {
            return Err(DecodeError::UnrecognizedShape);
        };
        let Value::String(method) = method else {
            return Err(DecodeError::InvalidField {
                field: "method",
                reason: "expected a string".to_owned(),
            });
        };
        let params = map.remove("params");

        match map.remove("id") {
            Some(raw) if !raw.is_null() => Ok(JsonRpcMessage::Request(JsonRpcRequest {
                jsonrpc,
                id: parse_field::<RequestId>("id", raw)?,
                method,
                params,
            })),
            _ => Ok(JsonRpcMessage::Notification(JsonRpcNotification {
                jsonrpc,
                method,
                params,
            })),
        }
    }
}

impl From<JsonRpcRequest> for JsonRpcMessage {
    fn from(req: JsonRpcRequest) -> Self {
        JsonRpcMessage::Request(req)
    }
}

impl From<JsonRpcNotification> for JsonRpcMessage {
    fn from(notif: JsonRpcNotification) -> Self {
        JsonRpcMessage::Notification(notif)
    }
}

impl From<JsonRpcResponse> for JsonRpcMessage {
    fn from(resp: JsonRpcResponse) -> Self {
        JsonRpcMessage::Response(resp)
    }
}

impl<'de> Deserialize<'de> for JsonRpcMessage {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        JsonRpcMessage::from_value(value).map_err(serde::de::Error::custom)
    }
}

fn parse_field<T: serde::de::DeserializeOwned>(
    field: &'static str,
    raw: Value,
) -> Result<T, DecodeError> {
    serde_json::from_value(raw).map_err(|e| DecodeError::InvalidField {
        field,
        reason: e.to_string(),
    })
}

/// Decodes one raw message.
///
/// If the payload does not parse, decoding is retried once from the first
/// `{`, so log or banner noise written ahead of the JSON on a shared output
/// stream is tolerated.
///
/// # Errors
///
/// Returns [`DecodeError`] if the payload is not a JSON object or matches
/// none of the three message shapes.
pub fn decode(raw: &str) -> Result<JsonRpcMessage, DecodeError> {
    let value: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(err) => match raw.find('{') {
            Some(offset) if offset > 0 => serde_json::from_str(&raw[offset..])?,
            _ => return Err(DecodeError::Json(err)),
        },
    };
    JsonRpcMessage::from_value(value)
}

/// Encodes a message as a single line of JSON (no trailing newline).
///
/// # Errors
///
/// Returns an error if a payload value fails to serialize.
pub fn encode(message: &JsonRpcMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}

/// Builds the `params` object of a message from a serializable value.
///
/// # Errors
///
/// Returns an error if the value fails to serialize.
pub fn to_params<P: Serialize + ?Sized>(params: &P) -> Result<Option<Value>, serde_json::Error> {
    match serde_json::to_value(params)? {
        Value::Null => Ok(None),
        value => Ok(Some(value)),
    }
}

/// Returns an empty params object.
#[must_use]
pub fn empty_params() -> Value {
    Value::Object(Map::new())
}

/// Message decoding failure.
#[derive(Debug)]
pub enum DecodeError {
    /// The payload is not valid JSON.
    Json(serde_json::Error),
    /// The payload is JSON but not an object.
    NotAnObject,
    /// The object matches none of request / notification / response.
    UnrecognizedShape,
    /// A recognised field has an unusable value.
    InvalidField {
        /// Field name.
        field: &'static str,
        /// What was wrong with it.
        reason: String,
    },
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Json(e) => write!(f, "JSON error: {e}"),
            DecodeError::NotAnObject => write!(f, "message is not a JSON object"),
            DecodeError::UnrecognizedShape => {
                write!(f, "message is not a request, notification or response")
            }
            DecodeError::InvalidField { field, reason } => {
                write!(f, "invalid `{field}` field: {reason}")
            }
        }
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DecodeError::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for DecodeError {
    fn from(err: serde_json::Error) -> Self {
        DecodeError::Json(err)
    }
}
