//! JSON-RPC 2.0 envelope types, error taxonomy and the method router.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::http_buffer_runtime::BufferError;
use crate::native_engine::EngineError;

mod dispatch;
mod parsing;
mod transport;

pub use dispatch::{
    classify_rpc_method, rpc_capabilities_payload, DeliveryMode, Invocation, RpcMethodKind,
    RpcRouter, RPC_METHOD_POLL, RPC_METHOD_TABLE,
};
pub use parsing::{best_effort_request_id, parse_rpc_request, parse_rpc_request_value};
pub use transport::{
    dispatch_rpc_http_body, serve_rpc_duplex_connection, spawn_push_dispatch, RpcConnectionReport,
};

pub const JSONRPC_VERSION: &str = "2.0";
pub const RPC_PROTOCOL_VERSION: &str = "0.1.0";

pub const RPC_ERROR_CODE_PARSE_ERROR: i64 = -32700;
pub const RPC_ERROR_CODE_INVALID_REQUEST: i64 = -32600;
pub const RPC_ERROR_CODE_METHOD_NOT_FOUND: i64 = -32601;
pub const RPC_ERROR_CODE_INVALID_PARAMS: i64 = -32602;
pub const RPC_ERROR_CODE_INTERNAL: i64 = -32603;
pub const RPC_ERROR_CODE_SESSION_BUSY: i64 = -32001;
pub const RPC_ERROR_CODE_ENGINE_ERROR: i64 = -32002;
pub const RPC_ERROR_CODE_NOT_FOUND: i64 = -32004;

/// Caller-chosen request id, echoed verbatim. `1` and `"1"` are distinct.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(value) => write!(f, "{value}"),
            Self::String(value) => write!(f, "{value:?}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RpcRequest {
    pub id: RequestId,
    pub method: String,
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// One response line. Exactly one of `result`/`error` is set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
}

impl RpcResponse {
    pub fn result(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<RequestId>, error: &RpcError) -> Self {
        Self::error_object(id, error.to_error_object())
    }

    pub fn error_object(id: Option<RequestId>, error: RpcErrorObject) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("method not found: '{0}'")]
    MethodNotFound(String),
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error("request id {0} already has an active stream")]
    SessionBusy(String),
    #[error("engine error: {0}")]
    Engine(String),
    #[error("no buffered stream for request id {0}")]
    NotFound(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl RpcError {
    pub fn code(&self) -> i64 {
        match self {
            Self::Parse(_) => RPC_ERROR_CODE_PARSE_ERROR,
            Self::InvalidRequest(_) => RPC_ERROR_CODE_INVALID_REQUEST,
            Self::MethodNotFound(_) => RPC_ERROR_CODE_METHOD_NOT_FOUND,
            Self::InvalidParams(_) => RPC_ERROR_CODE_INVALID_PARAMS,
            Self::SessionBusy(_) => RPC_ERROR_CODE_SESSION_BUSY,
            Self::Engine(_) => RPC_ERROR_CODE_ENGINE_ERROR,
            Self::NotFound(_) => RPC_ERROR_CODE_NOT_FOUND,
            Self::Internal(_) => RPC_ERROR_CODE_INTERNAL,
        }
    }

    pub fn to_error_object(&self) -> RpcErrorObject {
        RpcErrorObject {
            code: self.code(),
            message: self.to_string(),
            data: None,
        }
    }
}

impl From<EngineError> for RpcError {
    fn from(error: EngineError) -> Self {
        match error {
            EngineError::InvalidParams(message) => Self::InvalidParams(message),
            other => Self::Engine(other.to_string()),
        }
    }
}

impl From<BufferError> for RpcError {
    fn from(error: BufferError) -> Self {
        match error {
            BufferError::NotFound(request_id) => Self::NotFound(request_id.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

pub fn rpc_error_codes_payload() -> Value {
    json!({
        "PARSE_ERROR": RPC_ERROR_CODE_PARSE_ERROR,
        "INVALID_REQUEST": RPC_ERROR_CODE_INVALID_REQUEST,
        "METHOD_NOT_FOUND": RPC_ERROR_CODE_METHOD_NOT_FOUND,
        "INVALID_PARAMS": RPC_ERROR_CODE_INVALID_PARAMS,
        "INTERNAL": RPC_ERROR_CODE_INTERNAL,
        "SESSION_BUSY": RPC_ERROR_CODE_SESSION_BUSY,
        "ENGINE_ERROR": RPC_ERROR_CODE_ENGINE_ERROR,
        "NOT_FOUND": RPC_ERROR_CODE_NOT_FOUND,
    })
}
