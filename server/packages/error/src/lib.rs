use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Standard JSON-RPC 2.0 error classes used by the runtime.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
}

impl ErrorKind {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;

    pub fn code(&self) -> i64 {
        match self {
            Self::ParseError => Self::PARSE_ERROR,
            Self::InvalidRequest => Self::INVALID_REQUEST,
            Self::MethodNotFound => Self::METHOD_NOT_FOUND,
            Self::InvalidParams => Self::INVALID_PARAMS,
            Self::InternalError => Self::INTERNAL_ERROR,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            Self::PARSE_ERROR => Some(Self::ParseError),
            Self::INVALID_REQUEST => Some(Self::InvalidRequest),
            Self::METHOD_NOT_FOUND => Some(Self::MethodNotFound),
            Self::INVALID_PARAMS => Some(Self::InvalidParams),
            Self::INTERNAL_ERROR => Some(Self::InternalError),
            _ => None,
        }
    }
}

/// The `error` member of a JSON-RPC response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcErrorObject {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn from_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::new(kind.code(), message)
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

#[derive(Debug, Error)]
pub enum McpadreError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("method not found: {method}")]
    MethodNotFound { method: String },
    /// Raised by interceptors that want a specific JSON-RPC code on the wire.
    #[error("{message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<Value>,
    },
    #[error("failed to start server `{server}`: {message}")]
    ProcessSpawn { server: String, message: String },
    #[error("server `{server}` exited")]
    ProcessExited {
        server: String,
        exit_code: Option<i32>,
        stderr: Option<String>,
        /// Exited within moments of spawning, which usually means the
        /// sandbox refused it.
        early_exit: bool,
    },
    #[error("session terminated")]
    SessionTerminated,
    #[error("stream error: {message}")]
    StreamError { message: String },
    #[error("{message}")]
    Internal { message: String },
}

impl McpadreError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn rpc(code: i64, message: impl Into<String>) -> Self {
        Self::Rpc {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidRequest { .. } => ErrorKind::InvalidRequest,
            Self::MethodNotFound { .. } => ErrorKind::MethodNotFound,
            Self::Rpc { code, .. } => ErrorKind::from_code(*code).unwrap_or(ErrorKind::InternalError),
            Self::ProcessSpawn { .. }
            | Self::ProcessExited { .. }
            | Self::SessionTerminated
            | Self::StreamError { .. }
            | Self::Internal { .. } => ErrorKind::InternalError,
        }
    }

    /// JSON-RPC code placed on the wire. Typed `Rpc` errors keep their own
    /// code even when it is outside the standard range.
    pub fn code(&self) -> i64 {
        match self {
            Self::Rpc { code, .. } => *code,
            other => other.kind().code(),
        }
    }

    pub fn to_rpc_error(&self) -> RpcErrorObject {
        let data = match self {
            Self::MethodNotFound { method } => {
                let mut map = Map::new();
                map.insert("method".to_string(), Value::String(method.clone()));
                Some(Value::Object(map))
            }
            Self::Rpc { data, .. } => data.clone(),
            Self::ProcessSpawn { server, .. } => {
                let mut map = Map::new();
                map.insert("server".to_string(), Value::String(server.clone()));
                Some(Value::Object(map))
            }
            Self::ProcessExited {
                server,
                exit_code,
                stderr,
                early_exit,
            } => {
                let mut map = Map::new();
                map.insert("server".to_string(), Value::String(server.clone()));
                map.insert("earlyExit".to_string(), Value::Bool(*early_exit));
                if let Some(code) = exit_code {
                    map.insert(
                        "exitCode".to_string(),
                        Value::Number(serde_json::Number::from(*code as i64)),
                    );
                }
                if let Some(stderr) = stderr {
                    map.insert("stderr".to_string(), Value::String(stderr.clone()));
                }
                Some(Value::Object(map))
            }
            _ => None,
        };

        RpcErrorObject {
            code: self.code(),
            message: self.to_string(),
            data,
        }
    }
}

impl From<McpadreError> for RpcErrorObject {
    fn from(value: McpadreError) -> Self {
        value.to_rpc_error()
    }
}

impl From<&McpadreError> for RpcErrorObject {
    fn from(value: &McpadreError) -> Self {
        value.to_rpc_error()
    }
}
