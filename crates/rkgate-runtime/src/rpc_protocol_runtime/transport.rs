use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use super::{DeliveryMode, Invocation, RpcError, RpcResponse, RpcRouter};
use crate::ndjson_framer::{FrameError, NdjsonFramer};
use crate::stream_session_runtime::PushSink;

const READ_CHUNK_BYTES: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RpcConnectionReport {
    pub frames: usize,
    pub dropped_frames: usize,
    pub responses_written: usize,
}

/// Dispatch one HTTP request body and return the single response for it.
///
/// Streaming methods answer with the polling acknowledgement; chunks land in
/// the buffer manager.
pub async fn dispatch_rpc_http_body(router: &RpcRouter, body: &[u8]) -> RpcResponse {
    let value = match serde_json::from_slice::<Value>(body) {
        Ok(value) => value,
        Err(error) => {
            tracing::debug!(%error, "rejected http rpc body");
            return RpcResponse::error(None, &RpcError::Parse(error.to_string()));
        }
    };
    match router.dispatch_value(&value, DeliveryMode::Pull).await {
        Invocation::Reply(response) => response,
        Invocation::Streaming {
            ack: Some(ack), ..
        } => ack,
        Invocation::Streaming {
            request_id,
            ack: None,
        } => RpcResponse::error(
            Some(request_id),
            &RpcError::Internal("pull dispatch produced no acknowledgement".to_string()),
        ),
    }
}

/// Serve NDJSON RPC frames from a persistent byte stream.
///
/// Each frame is dispatched on its own task so a long stream never blocks the
/// requests behind it. All responses for the connection go through one writer
/// task, one JSON document per line. Malformed frames are logged and skipped.
/// Returns once the reader hits EOF and every response routed to this
/// connection has been written.
pub async fn serve_rpc_duplex_connection<R, W>(
    router: Arc<RpcRouter>,
    mut reader: R,
    writer: W,
    max_frame_bytes: usize,
) -> Result<RpcConnectionReport>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (push, outbound) = PushSink::channel();
    let writer_task = tokio::spawn(write_rpc_responses(writer, outbound));

    let mut framer = NdjsonFramer::new(max_frame_bytes);
    let mut report = RpcConnectionReport::default();
    let mut buffer = vec![0_u8; READ_CHUNK_BYTES];

    loop {
        let bytes_read = reader
            .read(&mut buffer)
            .await
            .context("failed to read rpc ndjson input")?;
        if bytes_read == 0 {
            framer.finish();
        } else {
            framer.push(&buffer[..bytes_read]);
        }
        while let Some(frame) = framer.next_frame() {
            dispatch_frame(&router, &push, frame, &mut report);
        }
        if bytes_read == 0 {
            break;
        }
    }

    drop(push);
    report.responses_written = writer_task
        .await
        .context("rpc response writer task failed")?
        .unwrap_or_else(|error| {
            tracing::debug!(error = %format!("{error:#}"), "rpc response writer stopped early");
            0
        });
    tracing::debug!(
        frames = report.frames,
        dropped_frames = report.dropped_frames,
        responses_written = report.responses_written,
        "rpc connection closed"
    );
    Ok(report)
}

fn dispatch_frame(
    router: &Arc<RpcRouter>,
    push: &PushSink,
    frame: Result<Value, FrameError>,
    report: &mut RpcConnectionReport,
) {
    let value = match frame {
        Ok(value) => value,
        Err(error) => {
            report.dropped_frames = report.dropped_frames.saturating_add(1);
            tracing::warn!(%error, "skipping malformed rpc frame");
            return;
        }
    };
    report.frames = report.frames.saturating_add(1);
    spawn_push_dispatch(router.clone(), push.clone(), value);
}

/// Dispatches one decoded frame on its own task for a push transport. A
/// unary reply goes through `push`; streaming chunks are delivered by the
/// session pump through the same sink.
pub fn spawn_push_dispatch(router: Arc<RpcRouter>, push: PushSink, value: Value) {
    tokio::spawn(async move {
        if let Invocation::Reply(response) = router
            .dispatch_value(&value, DeliveryMode::Push(push.clone()))
            .await
        {
            push.send(response);
        }
    });
}

async fn write_rpc_responses<W>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<RpcResponse>,
) -> Result<usize>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0_usize;
    while let Some(response) = outbound.recv().await {
        let mut line =
            serde_json::to_vec(&response).context("failed to serialize rpc response frame")?;
        line.push(b'\n');
        writer
            .write_all(&line)
            .await
            .context("failed to write rpc response line")?;
        writer
            .flush()
            .await
            .context("failed to flush rpc response line")?;
        written = written.saturating_add(1);
    }
    let _ = writer.shutdown().await;
    Ok(written)
}
