//! Streaming session manager.
//!
//! Each streaming request gets one pump task that owns its `StreamSession`,
//! stamps sequence numbers and delivers chunks either straight to the
//! requesting connection (push) or into the HTTP buffer manager (pull). The
//! pump is the only writer for its request id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use rkgate_core::SharedClock;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::http_buffer_runtime::{BufferError, BufferedChunk, HttpBufferManager};
use crate::native_engine::{CallbackState, ChunkSink, EngineChunk, SinkEvent};
use crate::rpc_protocol_runtime::{RequestId, RpcError, RpcErrorObject, RpcResponse};

/// Outbound half of a persistent connection.
#[derive(Debug, Clone)]
pub struct PushSink {
    tx: mpsc::UnboundedSender<RpcResponse>,
}

impl PushSink {
    pub fn new(tx: mpsc::UnboundedSender<RpcResponse>) -> Self {
        Self { tx }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RpcResponse>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Returns false once the connection's writer is gone.
    pub fn send(&self, response: RpcResponse) -> bool {
        self.tx.send(response).is_ok()
    }
}

#[derive(Debug, Clone)]
pub enum ChunkDelivery {
    Push(PushSink),
    Buffered,
}

impl ChunkDelivery {
    fn label(&self) -> &'static str {
        match self {
            Self::Push(_) => "push",
            Self::Buffered => "buffered",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamSessionState {
    Created,
    Running,
    Done,
    Failed,
}

impl StreamSessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveStreamSession {
    pub request_id: RequestId,
    pub state: StreamSessionState,
    pub delivery: &'static str,
    pub created_at_ms: u64,
}

#[derive(Debug)]
struct StreamSession {
    request_id: RequestId,
    created_at_ms: u64,
    last_activity_at_ms: u64,
    sequence_counter: u64,
    state: StreamSessionState,
}

impl StreamSession {
    fn next_seq(&mut self) -> u64 {
        let seq = self.sequence_counter;
        self.sequence_counter = self.sequence_counter.saturating_add(1);
        seq
    }
}

/// Returned by `open`: the sink to hand to the engine and the pump's join handle.
pub struct StreamSessionHandle {
    request_id: RequestId,
    sink: ChunkSink,
    pump: JoinHandle<StreamSessionState>,
}

impl StreamSessionHandle {
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub fn sink(&self) -> ChunkSink {
        self.sink.clone()
    }

    /// Waits for the pump to reach a terminal state.
    pub async fn wait(self) -> StreamSessionState {
        drop(self.sink);
        self.pump.await.unwrap_or(StreamSessionState::Failed)
    }
}

pub struct StreamSessionManager {
    sessions: Mutex<HashMap<RequestId, ActiveStreamSession>>,
    buffers: Arc<HttpBufferManager>,
    clock: SharedClock,
}

impl StreamSessionManager {
    pub fn new(buffers: Arc<HttpBufferManager>, clock: SharedClock) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            buffers,
            clock,
        }
    }

    pub fn buffers(&self) -> &Arc<HttpBufferManager> {
        &self.buffers
    }

    /// Registers a session for `request_id` and spawns its pump. Fails with
    /// `SessionBusy` while another session for the same id is live.
    pub fn open(
        self: &Arc<Self>,
        request_id: RequestId,
        delivery: ChunkDelivery,
    ) -> Result<StreamSessionHandle, RpcError> {
        let now_ms = self.clock.now_unix_ms();
        {
            let mut sessions = self.lock_sessions();
            if sessions.contains_key(&request_id) {
                return Err(RpcError::SessionBusy(request_id.to_string()));
            }
            sessions.insert(
                request_id.clone(),
                ActiveStreamSession {
                    request_id: request_id.clone(),
                    state: StreamSessionState::Created,
                    delivery: delivery.label(),
                    created_at_ms: now_ms,
                },
            );
        }

        if matches!(delivery, ChunkDelivery::Buffered) {
            match self.buffers.reset_entry(&request_id) {
                Ok(true) => {
                    tracing::debug!(request_id = %request_id, "replaced retained buffer for reused request id");
                }
                Ok(false) => {}
                Err(error) => {
                    self.release(&request_id);
                    return Err(RpcError::from(error));
                }
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let sink = ChunkSink::new(tx);
        let session = StreamSession {
            request_id: request_id.clone(),
            created_at_ms: now_ms,
            last_activity_at_ms: now_ms,
            sequence_counter: 0,
            state: StreamSessionState::Created,
        };
        let pump = tokio::spawn(run_stream_session_pump(
            self.clone(),
            session,
            delivery,
            rx,
        ));
        tracing::debug!(request_id = %request_id, "stream session opened");
        Ok(StreamSessionHandle {
            request_id,
            sink,
            pump,
        })
    }

    pub fn active_session_count(&self) -> usize {
        self.lock_sessions().len()
    }

    pub fn session_state(&self, request_id: &RequestId) -> Option<StreamSessionState> {
        self.lock_sessions()
            .get(request_id)
            .map(|session| session.state)
    }

    pub fn active_sessions(&self) -> Vec<ActiveStreamSession> {
        self.lock_sessions().values().cloned().collect()
    }

    /// Registry entries are independent, so a panic elsewhere never leaves
    /// the map half-updated; a poisoned lock is logged and recovered so that
    /// `release` always frees the id.
    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<RequestId, ActiveStreamSession>> {
        self.sessions.lock().unwrap_or_else(|poisoned| {
            tracing::error!("stream session registry lock poisoned; recovering registry");
            poisoned.into_inner()
        })
    }

    fn mark_running(&self, request_id: &RequestId) {
        if let Some(session) = self.lock_sessions().get_mut(request_id) {
            session.state = StreamSessionState::Running;
        }
    }

    fn release(&self, request_id: &RequestId) {
        self.lock_sessions().remove(request_id);
    }
}

struct ChunkEmitter {
    delivery: ChunkDelivery,
    push_open: bool,
}

impl ChunkEmitter {
    fn emit(
        &mut self,
        buffers: &HttpBufferManager,
        request_id: &RequestId,
        seq: u64,
        outcome: Result<Value, RpcErrorObject>,
        end: bool,
    ) {
        match &self.delivery {
            ChunkDelivery::Push(sink) => {
                if !self.push_open {
                    return;
                }
                let response = match outcome {
                    Ok(result) => RpcResponse::result(request_id.clone(), result),
                    Err(error) => RpcResponse::error_object(Some(request_id.clone()), error),
                };
                if !sink.send(response) {
                    self.push_open = false;
                    tracing::debug!(
                        request_id = %request_id,
                        seq,
                        "connection closed mid-stream; engine output will be discarded"
                    );
                }
            }
            ChunkDelivery::Buffered => {
                let payload = match outcome {
                    Ok(result) => result,
                    Err(error) => json!({ "error": error }),
                };
                match buffers.append(request_id, BufferedChunk { seq, payload, end }) {
                    Ok(()) => {}
                    Err(BufferError::NotFound(_)) => {
                        tracing::warn!(
                            request_id = %request_id,
                            seq,
                            "stream buffer was evicted; dropping chunk"
                        );
                    }
                    Err(error) => {
                        tracing::error!(request_id = %request_id, seq, %error, "failed to buffer stream chunk");
                    }
                }
            }
        }
    }
}

async fn run_stream_session_pump(
    manager: Arc<StreamSessionManager>,
    mut session: StreamSession,
    delivery: ChunkDelivery,
    mut events: mpsc::UnboundedReceiver<SinkEvent>,
) -> StreamSessionState {
    let mut emitter = ChunkEmitter {
        delivery,
        push_open: true,
    };

    while let Some(event) = events.recv().await {
        match event {
            SinkEvent::Chunk(chunk) => {
                if session.state.is_terminal() {
                    tracing::warn!(
                        request_id = %session.request_id,
                        "dropping engine chunk received after the stream ended"
                    );
                    continue;
                }
                if chunk.state == CallbackState::Error {
                    let error = RpcError::Engine(chunk.text.clone());
                    fail_session(&manager, &mut session, &mut emitter, &error, chunk.data);
                    continue;
                }
                emit_engine_chunk(&manager, &mut session, &mut emitter, &chunk);
            }
            SinkEvent::Finished(outcome) => {
                if !session.state.is_terminal() {
                    let error = match outcome {
                        Err(error) => RpcError::from(error),
                        Ok(()) => RpcError::Engine(
                            "engine stream returned without a terminal chunk".to_string(),
                        ),
                    };
                    fail_session(&manager, &mut session, &mut emitter, &error, None);
                } else if let Err(error) = outcome {
                    tracing::warn!(
                        request_id = %session.request_id,
                        %error,
                        "engine reported a failure after the stream ended"
                    );
                }
                break;
            }
        }
    }

    if !session.state.is_terminal() {
        let error = RpcError::Engine("engine released the chunk sink without finishing".to_string());
        fail_session(&manager, &mut session, &mut emitter, &error, None);
    }
    tracing::debug!(
        request_id = %session.request_id,
        state = ?session.state,
        chunks = session.sequence_counter,
        duration_ms = session.last_activity_at_ms.saturating_sub(session.created_at_ms),
        "stream session finished"
    );
    session.state
}

fn emit_engine_chunk(
    manager: &StreamSessionManager,
    session: &mut StreamSession,
    emitter: &mut ChunkEmitter,
    chunk: &EngineChunk,
) {
    if session.state == StreamSessionState::Created {
        session.state = StreamSessionState::Running;
        manager.mark_running(&session.request_id);
    }
    session.last_activity_at_ms = manager.clock.now_unix_ms();
    let seq = session.next_seq();
    let end = chunk.state == CallbackState::Done;
    emitter.emit(
        &manager.buffers,
        &session.request_id,
        seq,
        Ok(chunk.to_result_payload(seq)),
        end,
    );
    if end {
        session.state = StreamSessionState::Done;
        manager.release(&session.request_id);
    }
}

fn fail_session(
    manager: &StreamSessionManager,
    session: &mut StreamSession,
    emitter: &mut ChunkEmitter,
    error: &RpcError,
    engine_data: Option<Value>,
) {
    session.last_activity_at_ms = manager.clock.now_unix_ms();
    let seq = session.next_seq();
    let mut data = json!({
        "seq": seq,
        "_callback_state": CallbackState::Error.code(),
    });
    if let (Some(engine_data), Some(object)) = (engine_data, data.as_object_mut()) {
        object.insert("engine".to_string(), engine_data);
    }
    let mut error_object = error.to_error_object();
    error_object.data = Some(data);
    tracing::warn!(request_id = %session.request_id, seq, %error, "stream session failed");
    emitter.emit(
        &manager.buffers,
        &session.request_id,
        seq,
        Err(error_object),
        true,
    );
    session.state = StreamSessionState::Failed;
    manager.release(&session.request_id);
}
