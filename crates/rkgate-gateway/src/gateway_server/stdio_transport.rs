//! NDJSON over the process's stdin and stdout.
use super::*;

pub(super) async fn run_stdio_transport(router: Arc<RpcRouter>, max_frame_bytes: usize) {
    match serve_rpc_duplex_connection(
        router,
        tokio::io::stdin(),
        tokio::io::stdout(),
        max_frame_bytes,
    )
    .await
    {
        Ok(report) => tracing::info!(
            frames = report.frames,
            dropped_frames = report.dropped_frames,
            responses_written = report.responses_written,
            "rpc stdio transport reached eof"
        ),
        Err(error) => {
            tracing::error!(error = %format!("{error:#}"), "rpc stdio transport failed")
        }
    }
}
