use serde_json::Value;

use super::{RequestId, RpcError, RpcRequest, JSONRPC_VERSION};

pub fn parse_rpc_request(raw: &str) -> Result<RpcRequest, RpcError> {
    let value = serde_json::from_str::<Value>(raw.trim())
        .map_err(|error| RpcError::Parse(format!("failed to parse rpc request JSON: {error}")))?;
    parse_rpc_request_value(&value)
}

/// Validates the envelope shape. `params` is forwarded untouched.
pub fn parse_rpc_request_value(value: &Value) -> Result<RpcRequest, RpcError> {
    let object = value
        .as_object()
        .ok_or_else(|| RpcError::InvalidRequest("rpc request must be a JSON object".to_string()))?;

    match object.get("jsonrpc").and_then(Value::as_str) {
        Some(JSONRPC_VERSION) => {}
        Some(other) => {
            return Err(RpcError::InvalidRequest(format!(
                "unsupported jsonrpc version '{other}', expected '{JSONRPC_VERSION}'"
            )))
        }
        None => {
            return Err(RpcError::InvalidRequest(
                "rpc request is missing 'jsonrpc'".to_string(),
            ))
        }
    }

    let id = match object.get("id") {
        None | Some(Value::Null) => {
            return Err(RpcError::InvalidRequest(
                "rpc request is missing 'id'".to_string(),
            ))
        }
        Some(raw_id) => serde_json::from_value::<RequestId>(raw_id.clone()).map_err(|_| {
            RpcError::InvalidRequest("rpc request 'id' must be an integer or a string".to_string())
        })?,
    };

    let method = object
        .get("method")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|method| !method.is_empty())
        .ok_or_else(|| {
            RpcError::InvalidRequest("rpc request 'method' must be a non-empty string".to_string())
        })?;

    let params = object.get("params").cloned().unwrap_or(Value::Null);
    if !matches!(params, Value::Null | Value::Array(_) | Value::Object(_)) {
        return Err(RpcError::InvalidRequest(
            "rpc request 'params' must be an array or an object".to_string(),
        ));
    }

    Ok(RpcRequest {
        id,
        method: method.to_string(),
        params,
    })
}

/// Recovers the id of a request that failed validation so the error can
/// still be correlated.
pub fn best_effort_request_id(value: &Value) -> Option<RequestId> {
    let raw = value.as_object()?.get("id")?;
    serde_json::from_value::<RequestId>(raw.clone()).ok()
}
