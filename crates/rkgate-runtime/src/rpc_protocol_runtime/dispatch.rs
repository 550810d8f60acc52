use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Semaphore;

use super::{
    best_effort_request_id, parse_rpc_request_value, rpc_error_codes_payload, RequestId, RpcError,
    RpcRequest, RpcResponse, JSONRPC_VERSION, RPC_PROTOCOL_VERSION,
};
use crate::http_buffer_runtime::HttpBufferManager;
use crate::native_engine::NativeEngine;
use crate::rpc_diagnostics_runtime::{
    http_buffer_manager_status_payload, run_buffer_cleanup_self_test,
    run_http_buffer_manager_self_test,
};
use crate::stream_session_runtime::{ChunkDelivery, PushSink, StreamSessionManager};

pub const RPC_METHOD_POLL: &str = "poll";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcMethodKind {
    /// One native call, one result.
    Unary,
    /// Native call producing a callback-state chunk sequence.
    Streaming,
    /// Served by the runtime itself.
    Builtin,
}

pub const RPC_METHOD_TABLE: &[(&str, RpcMethodKind)] = &[
    ("rkllm.init", RpcMethodKind::Unary),
    ("rkllm.run", RpcMethodKind::Streaming),
    ("rkllm.run_async", RpcMethodKind::Streaming),
    ("rkllm.abort", RpcMethodKind::Unary),
    ("rkllm.destroy", RpcMethodKind::Unary),
    ("rknn.init", RpcMethodKind::Unary),
    ("rknn.inputs_set", RpcMethodKind::Unary),
    ("rknn.run", RpcMethodKind::Unary),
    ("rknn.outputs_get", RpcMethodKind::Unary),
    ("rknn.destroy", RpcMethodKind::Unary),
    ("vision.encode", RpcMethodKind::Unary),
    ("rpc.capabilities", RpcMethodKind::Builtin),
    (RPC_METHOD_POLL, RpcMethodKind::Builtin),
    ("http_buffer_manager_status", RpcMethodKind::Builtin),
    ("test_http_buffer_manager", RpcMethodKind::Builtin),
    ("test_buffer_cleanup", RpcMethodKind::Builtin),
];

/// Case-sensitive lookup in the static method table.
pub fn classify_rpc_method(method: &str) -> Option<RpcMethodKind> {
    RPC_METHOD_TABLE
        .iter()
        .find(|(name, _)| *name == method)
        .map(|(_, kind)| *kind)
}

pub fn rpc_capabilities_payload() -> Value {
    let methods = RPC_METHOD_TABLE
        .iter()
        .map(|(name, kind)| json!({ "method": name, "kind": kind }))
        .collect::<Vec<_>>();
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "protocol_version": RPC_PROTOCOL_VERSION,
        "methods": methods,
        "callback_states": { "BEGIN": 0, "RUNNING": 1, "DONE": 2, "ERROR": 3 },
        "error_codes": rpc_error_codes_payload(),
    })
}

/// How the caller's transport receives streaming chunks.
#[derive(Debug, Clone)]
pub enum DeliveryMode {
    /// Persistent connection; chunks are written as they arrive.
    Push(PushSink),
    /// Request/response transport; chunks are buffered for `poll`.
    Pull,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Invocation {
    /// A single response: unary result, builtin result or any error.
    Reply(RpcResponse),
    /// A stream was opened. Pull transports get an acknowledgement to return.
    Streaming {
        request_id: RequestId,
        ack: Option<RpcResponse>,
    },
}

pub struct RpcRouter {
    engine: Arc<dyn NativeEngine>,
    sessions: Arc<StreamSessionManager>,
    buffers: Arc<HttpBufferManager>,
    unary_permits: Arc<Semaphore>,
}

impl RpcRouter {
    pub fn new(
        engine: Arc<dyn NativeEngine>,
        sessions: Arc<StreamSessionManager>,
        unary_workers: usize,
    ) -> Self {
        let buffers = sessions.buffers().clone();
        Self {
            engine,
            sessions,
            buffers,
            unary_permits: Arc::new(Semaphore::new(unary_workers.max(1))),
        }
    }

    pub fn sessions(&self) -> &Arc<StreamSessionManager> {
        &self.sessions
    }

    pub fn buffers(&self) -> &Arc<HttpBufferManager> {
        &self.buffers
    }

    /// Validates a decoded frame and dispatches it.
    pub async fn dispatch_value(&self, value: &Value, mode: DeliveryMode) -> Invocation {
        match parse_rpc_request_value(value) {
            Ok(request) => self.dispatch(request, mode).await,
            Err(error) => {
                tracing::debug!(%error, "rejected rpc envelope");
                Invocation::Reply(RpcResponse::error(best_effort_request_id(value), &error))
            }
        }
    }

    pub async fn dispatch(&self, request: RpcRequest, mode: DeliveryMode) -> Invocation {
        tracing::debug!(id = %request.id, method = %request.method, "dispatching rpc request");
        match classify_rpc_method(&request.method) {
            None => Invocation::Reply(RpcResponse::error(
                Some(request.id),
                &RpcError::MethodNotFound(request.method),
            )),
            Some(RpcMethodKind::Builtin) => {
                let id = request.id.clone();
                Invocation::Reply(match self.dispatch_builtin(&request) {
                    Ok(result) => RpcResponse::result(id, result),
                    Err(error) => RpcResponse::error(Some(id), &error),
                })
            }
            Some(RpcMethodKind::Unary) => Invocation::Reply(self.invoke_unary(request).await),
            Some(RpcMethodKind::Streaming) => self.start_streaming(request, mode),
        }
    }

    fn dispatch_builtin(&self, request: &RpcRequest) -> Result<Value, RpcError> {
        match request.method.as_str() {
            "rpc.capabilities" => Ok(rpc_capabilities_payload()),
            RPC_METHOD_POLL => self.poll(&request.params),
            "http_buffer_manager_status" => Ok(http_buffer_manager_status_payload(
                &self.buffers,
                &self.sessions,
            )),
            "test_http_buffer_manager" => run_http_buffer_manager_self_test(&request.params),
            "test_buffer_cleanup" => run_buffer_cleanup_self_test(&request.params),
            other => Err(RpcError::MethodNotFound(other.to_string())),
        }
    }

    fn poll(&self, params: &Value) -> Result<Value, RpcError> {
        let (raw_request_id, raw_since_seq) = match params {
            Value::Object(object) => (object.get("request_id"), object.get("since_seq")),
            Value::Array(items) => (items.first(), items.get(1)),
            _ => (None, None),
        };
        let request_id = raw_request_id
            .cloned()
            .and_then(|raw| serde_json::from_value::<RequestId>(raw).ok())
            .ok_or_else(|| {
                RpcError::InvalidParams(
                    "poll requires 'request_id' as an integer or a string".to_string(),
                )
            })?;
        let since_seq = match raw_since_seq {
            None | Some(Value::Null) => -1,
            Some(raw) => raw.as_i64().ok_or_else(|| {
                RpcError::InvalidParams("poll 'since_seq' must be an integer".to_string())
            })?,
        };

        let drained = self.buffers.drain(&request_id, since_seq)?;
        Ok(json!({
            "request_id": request_id,
            "chunk": drained.chunks,
            "end": drained.end,
            "next_since_seq": drained.next_since_seq,
        }))
    }

    async fn invoke_unary(&self, request: RpcRequest) -> RpcResponse {
        let RpcRequest { id, method, params } = request;
        let permit = match self.unary_permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                return RpcResponse::error(
                    Some(id),
                    &RpcError::Internal("unary worker pool is closed".to_string()),
                )
            }
        };
        let engine = self.engine.clone();
        let call_method = method.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            engine.call(&call_method, &params)
        })
        .await;

        match outcome {
            Ok(Ok(result)) => RpcResponse::result(id, result),
            Ok(Err(error)) => {
                tracing::debug!(id = %id, method = %method, %error, "engine call failed");
                RpcResponse::error(Some(id), &RpcError::from(error))
            }
            Err(join_error) => {
                tracing::error!(id = %id, method = %method, error = %join_error, "engine call panicked");
                RpcResponse::error(
                    Some(id),
                    &RpcError::Engine(format!("engine call for '{method}' aborted")),
                )
            }
        }
    }

    fn start_streaming(&self, request: RpcRequest, mode: DeliveryMode) -> Invocation {
        let RpcRequest { id, method, params } = request;
        let (delivery, ack) = match mode {
            DeliveryMode::Push(sink) => (ChunkDelivery::Push(sink), None),
            DeliveryMode::Pull => (
                ChunkDelivery::Buffered,
                Some(RpcResponse::result(
                    id.clone(),
                    json!({
                        "status": "streaming",
                        "request_id": id,
                        "poll_method": RPC_METHOD_POLL,
                    }),
                )),
            ),
        };

        let handle = match self.sessions.open(id.clone(), delivery) {
            Ok(handle) => handle,
            Err(error) => return Invocation::Reply(RpcResponse::error(Some(id), &error)),
        };

        let engine = self.engine.clone();
        let sink = handle.sink();
        // The pump keeps running after the handle is dropped.
        drop(handle);
        tokio::task::spawn_blocking(move || {
            let outcome = engine.run_streaming(&method, &params, &sink);
            sink.finish(outcome);
        });

        Invocation::Streaming {
            request_id: id,
            ack,
        }
    }
}
