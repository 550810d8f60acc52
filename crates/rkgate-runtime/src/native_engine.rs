//! Capability interface toward the native model engines.
//!
//! Engines are opaque, stateful and blocking. The runtime calls them from
//! blocking worker threads and never interprets their params or results.

use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;

/// Progress tag carried by every streaming chunk as `_callback_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackState {
    Begin,
    Running,
    Done,
    Error,
}

impl CallbackState {
    pub fn code(self) -> u8 {
        match self {
            Self::Begin => 0,
            Self::Running => 1,
            Self::Done => 2,
            Self::Error => 3,
        }
    }

    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(Self::Begin),
            1 => Some(Self::Running),
            2 => Some(Self::Done),
            3 => Some(Self::Error),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

#[derive(Debug, Clone, PartialEq)]
/// One unit of output handed to the chunk sink by a streaming engine call.
pub struct EngineChunk {
    pub state: CallbackState,
    pub text: String,
    pub token_id: Option<i64>,
    pub data: Option<Value>,
}

impl EngineChunk {
    pub fn begin(text: impl Into<String>, token_id: i64) -> Self {
        Self {
            state: CallbackState::Begin,
            text: text.into(),
            token_id: Some(token_id),
            data: None,
        }
    }

    pub fn running(text: impl Into<String>, token_id: i64) -> Self {
        Self {
            state: CallbackState::Running,
            text: text.into(),
            token_id: Some(token_id),
            data: None,
        }
    }

    pub fn done() -> Self {
        Self {
            state: CallbackState::Done,
            text: String::new(),
            token_id: None,
            data: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            state: CallbackState::Error,
            text: message.into(),
            token_id: None,
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Wire form of a non-error chunk, stamped with its sequence number.
    pub fn to_result_payload(&self, seq: u64) -> Value {
        let mut payload = json!({
            "text": self.text,
            "token_id": self.token_id,
            "_callback_state": self.state.code(),
            "seq": seq,
        });
        if let (Some(data), Some(object)) = (&self.data, payload.as_object_mut()) {
            object.insert("data".to_string(), data.clone());
        }
        payload
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
/// Failures reported by a native engine call.
pub enum EngineError {
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error("unknown model handle '{0}'")]
    UnknownHandle(String),
    #[error("engine does not implement method '{0}'")]
    UnsupportedMethod(String),
    #[error("{0}")]
    Failed(String),
}

#[derive(Debug)]
pub(crate) enum SinkEvent {
    Chunk(EngineChunk),
    Finished(Result<(), EngineError>),
}

/// Write side handed to a streaming engine call.
///
/// Backed by an unbounded queue so the engine never blocks on a slow
/// consumer; a single pump task per request drains it in order.
#[derive(Debug, Clone)]
pub struct ChunkSink {
    tx: mpsc::UnboundedSender<SinkEvent>,
}

impl ChunkSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<SinkEvent>) -> Self {
        Self { tx }
    }

    /// Returns false once the owning session pump has gone away.
    pub fn emit(&self, chunk: EngineChunk) -> bool {
        self.tx.send(SinkEvent::Chunk(chunk)).is_ok()
    }

    pub(crate) fn finish(&self, outcome: Result<(), EngineError>) {
        let _ = self.tx.send(SinkEvent::Finished(outcome));
    }
}

/// Blocking native engine reached by method name.
pub trait NativeEngine: Send + Sync + 'static {
    /// Unary invocation returning one opaque result.
    fn call(&self, method: &str, params: &Value) -> Result<Value, EngineError>;

    /// Streaming invocation. Chunks go to `sink` in generation order and the
    /// final chunk must carry `CallbackState::Done`.
    fn run_streaming(
        &self,
        method: &str,
        params: &Value,
        sink: &ChunkSink,
    ) -> Result<(), EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_callback_state_codes_match_wire_values() {
        assert_eq!(CallbackState::Begin.code(), 0);
        assert_eq!(CallbackState::Running.code(), 1);
        assert_eq!(CallbackState::Done.code(), 2);
        assert_eq!(CallbackState::from_code(3), Some(CallbackState::Error));
        assert_eq!(CallbackState::from_code(9), None);
        assert!(CallbackState::Done.is_terminal());
        assert!(!CallbackState::Running.is_terminal());
    }

    #[test]
    fn unit_engine_chunk_result_payload_carries_seq_and_state() {
        let payload = EngineChunk::running(" world", 42)
            .with_data(json!({"logits": 1}))
            .to_result_payload(7);
        assert_eq!(payload["text"], " world");
        assert_eq!(payload["token_id"], 42);
        assert_eq!(payload["_callback_state"], 1);
        assert_eq!(payload["seq"], 7);
        assert_eq!(payload["data"]["logits"], 1);

        let done = EngineChunk::done().to_result_payload(8);
        assert_eq!(done["_callback_state"], 2);
        assert!(done["token_id"].is_null());
    }

    #[test]
    fn unit_chunk_sink_reports_closed_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = ChunkSink::new(tx);
        assert!(sink.emit(EngineChunk::begin("a", 1)));
        drop(rx);
        assert!(!sink.emit(EngineChunk::running("b", 2)));
    }
}
