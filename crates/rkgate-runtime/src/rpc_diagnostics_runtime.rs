//! Diagnostic RPC methods exposing buffer manager internals to test harnesses.
//!
//! The self-test methods run against a scratch manager driven by a
//! `ManualClock`, so they never touch live buffers and never wait on real time.

use std::sync::Arc;
use std::time::Duration;

use rkgate_core::ManualClock;
use serde_json::{json, Value};

use crate::http_buffer_runtime::{BufferedChunk, HttpBufferConfig, HttpBufferManager};
use crate::rpc_protocol_runtime::{RequestId, RpcError};
use crate::stream_session_runtime::StreamSessionManager;

const SELF_TEST_DEFAULT_REQUEST_ID: &str = "test_123";
const CLEANUP_TEST_DEFAULT_BUFFERS: u64 = 3;
const CLEANUP_TEST_DEFAULT_TTL_MS: u64 = 1_000;
const CLEANUP_TEST_MAX_BUFFERS: u64 = 1_024;

pub fn http_buffer_manager_status_payload(
    buffers: &HttpBufferManager,
    sessions: &StreamSessionManager,
) -> Value {
    let status = buffers.status();
    json!({
        "initialized": status.initialized,
        "active_buffers": status.active_buffers,
        "buffered_chunks": status.buffered_chunks,
        "ttl_ms": status.ttl_ms,
        "sweep_interval_ms": status.sweep_interval_ms,
        "drop_acknowledged": buffers.config().drop_acknowledged,
        "active_sessions": sessions.active_session_count(),
    })
}

/// Appends a three-chunk stream, drains it from the start and again past the
/// terminal chunk, and reports whether ordering and replay held.
pub fn run_http_buffer_manager_self_test(params: &Value) -> Result<Value, RpcError> {
    let request_id = optional_request_id(params)?
        .unwrap_or_else(|| RequestId::from(SELF_TEST_DEFAULT_REQUEST_ID));
    let manager = HttpBufferManager::initialized(
        HttpBufferConfig::default(),
        Arc::new(ManualClock::new(0)),
    );

    manager.reset_entry(&request_id)?;
    let script = [("Hello", false), (" world", false), ("!", true)];
    for (seq, (text, end)) in script.iter().enumerate() {
        manager.append(
            &request_id,
            BufferedChunk {
                seq: seq as u64,
                payload: json!({ "text": text }),
                end: *end,
            },
        )?;
    }

    let full = manager.drain(&request_id, -1)?;
    let replay = manager.drain(&request_id, -1)?;
    let tail = manager.drain(&request_id, full.next_since_seq)?;

    let ordered = full
        .chunks
        .iter()
        .enumerate()
        .all(|(index, chunk)| chunk.seq == index as u64);
    let end_on_last = full.chunks.last().map(|chunk| chunk.end).unwrap_or(false)
        && full.chunks.iter().filter(|chunk| chunk.end).count() == 1;
    let passed = full.chunks.len() == script.len()
        && ordered
        && end_on_last
        && replay == full
        && tail.chunks.is_empty()
        && tail.end;

    Ok(json!({
        "request_id": request_id,
        "appended": script.len(),
        "chunks": full.chunks,
        "end": full.end,
        "replay_identical": replay == full,
        "after_end": tail.chunks,
        "status": manager.status(),
        "passed": passed,
    }))
}

/// Creates N buffers, advances a manual clock past the TTL and runs one sweep.
pub fn run_buffer_cleanup_self_test(params: &Value) -> Result<Value, RpcError> {
    let buffer_count = optional_u64(params, "buffer_count")?.unwrap_or(CLEANUP_TEST_DEFAULT_BUFFERS);
    if buffer_count == 0 || buffer_count > CLEANUP_TEST_MAX_BUFFERS {
        return Err(RpcError::InvalidParams(format!(
            "'buffer_count' must be between 1 and {CLEANUP_TEST_MAX_BUFFERS}"
        )));
    }
    let ttl_ms = optional_u64(params, "ttl_ms")?.unwrap_or(CLEANUP_TEST_DEFAULT_TTL_MS);
    if ttl_ms == 0 {
        return Err(RpcError::InvalidParams("'ttl_ms' must be greater than zero".to_string()));
    }

    let clock = Arc::new(ManualClock::new(0));
    let manager = HttpBufferManager::initialized(
        HttpBufferConfig {
            ttl: Duration::from_millis(ttl_ms),
            ..HttpBufferConfig::default()
        },
        clock.clone(),
    );
    for index in 0..buffer_count {
        let request_id = RequestId::from(format!("cleanup_test_{index}"));
        manager.reset_entry(&request_id)?;
        manager.append(
            &request_id,
            BufferedChunk {
                seq: 0,
                payload: json!({ "text": "pending" }),
                end: false,
            },
        )?;
    }
    let before = manager.status().active_buffers;

    clock.advance(Duration::from_millis(ttl_ms.saturating_add(1)));
    let report = manager.evict_expired()?;
    let after = manager.status().active_buffers;
    let all_gone = (0..buffer_count).all(|index| {
        !manager.contains(&RequestId::from(format!("cleanup_test_{index}")))
    });

    Ok(json!({
        "created": buffer_count,
        "ttl_ms": ttl_ms,
        "active_buffers_before": before,
        "active_buffers_after": after,
        "evicted": report.evicted.len(),
        "evicted_unterminated": report.evicted_unterminated,
        "passed": before as u64 == buffer_count && after == 0 && all_gone,
    }))
}

fn optional_request_id(params: &Value) -> Result<Option<RequestId>, RpcError> {
    let Some(raw) = params.as_object().and_then(|object| object.get("request_id")) else {
        return Ok(None);
    };
    serde_json::from_value::<RequestId>(raw.clone())
        .map(Some)
        .map_err(|_| RpcError::InvalidParams("'request_id' must be an integer or a string".to_string()))
}

fn optional_u64(params: &Value, name: &str) -> Result<Option<u64>, RpcError> {
    let Some(raw) = params.as_object().and_then(|object| object.get(name)) else {
        return Ok(None);
    };
    raw.as_u64()
        .map(Some)
        .ok_or_else(|| RpcError::InvalidParams(format!("'{name}' must be a non-negative integer")))
}
