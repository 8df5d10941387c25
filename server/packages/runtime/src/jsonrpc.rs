use std::fmt;

use mcpadre_error::{ErrorKind, McpadreError, RpcErrorObject};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// A JSON-RPC id. `Null` is a legal value and is distinct from an absent id.
/// Numbers are kept as written, so `1.5` and ids past `i64::MAX` still
/// correlate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(serde_json::Number),
    String(String),
    Null,
}

impl RequestId {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Key used to correlate responses with pending requests. Numbers and
    /// strings never collide (`1` vs `"1"`).
    pub fn correlation_key(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "null".to_string())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(value) => write!(f, "{value}"),
            Self::String(value) => write!(f, "\"{value}\""),
            Self::Null => f.write_str("null"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        Self::Number(value.into())
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_present_id"
    )]
    pub id: Option<RequestId>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

// Without this, `"id": null` would collapse into `None` and the request
// would be mistaken for a notification.
fn deserialize_present_id<'de, D>(deserializer: D) -> Result<Option<RequestId>, D::Error>
where
    D: Deserializer<'de>,
{
    RequestId::deserialize(deserializer).map(Some)
}

impl JsonRpcRequest {
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id.into()),
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: method.into(),
            params,
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// Id that any response to this request must carry.
    pub fn response_id(&self) -> RequestId {
        self.id.clone().unwrap_or(RequestId::Null)
    }

    /// True when a response can be correlated back to this request.
    pub fn expects_response(&self) -> bool {
        matches!(&self.id, Some(id) if !id.is_null())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponsePayload {
    Result(Value),
    Error(RpcErrorObject),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: RequestId,
    #[serde(flatten)]
    pub payload: ResponsePayload,
}

impl JsonRpcResponse {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            payload: ResponsePayload::Result(result),
        }
    }

    pub fn failure(id: RequestId, error: RpcErrorObject) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            payload: ResponsePayload::Error(error),
        }
    }

    pub fn from_error(id: RequestId, error: &McpadreError) -> Self {
        Self::failure(id, error.to_rpc_error())
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::failure(
            RequestId::Null,
            RpcErrorObject::from_kind(ErrorKind::ParseError, message),
        )
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::failure(
            RequestId::Null,
            RpcErrorObject::from_kind(ErrorKind::InvalidRequest, message),
        )
    }

    pub fn result(&self) -> Option<&Value> {
        match &self.payload {
            ResponsePayload::Result(value) => Some(value),
            ResponsePayload::Error(_) => None,
        }
    }

    pub fn error(&self) -> Option<&RpcErrorObject> {
        match &self.payload {
            ResponsePayload::Result(_) => None,
            ResponsePayload::Error(error) => Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.payload, ResponsePayload::Error(_))
    }
}

/// Shape of a decoded line, decided by which keys it carries.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Not valid JSON.
    Parse(String),
    /// Valid JSON, but not a JSON-RPC message.
    Invalid(String),
}

impl FrameError {
    pub fn to_response(&self) -> JsonRpcResponse {
        match self {
            Self::Parse(message) => JsonRpcResponse::parse_error(message.clone()),
            Self::Invalid(message) => JsonRpcResponse::invalid_request(message.clone()),
        }
    }
}

pub fn decode_frame(line: &str) -> Result<Frame, FrameError> {
    let value: Value =
        serde_json::from_str(line).map_err(|err| FrameError::Parse(err.to_string()))?;
    classify_value(value)
}

pub fn classify_value(value: Value) -> Result<Frame, FrameError> {
    let Some(object) = value.as_object() else {
        return Err(FrameError::Invalid(
            "JSON-RPC message must be an object".to_string(),
        ));
    };

    if object.contains_key("result") || object.contains_key("error") {
        return serde_json::from_value::<JsonRpcResponse>(value)
            .map(Frame::Response)
            .map_err(|err| FrameError::Invalid(format!("malformed response: {err}")));
    }

    if object.contains_key("method") {
        return serde_json::from_value::<JsonRpcRequest>(value)
            .map(Frame::Request)
            .map_err(|err| FrameError::Invalid(format!("malformed request: {err}")));
    }

    Err(FrameError::Invalid(
        "message has neither `method` nor `result`/`error`".to_string(),
    ))
}
