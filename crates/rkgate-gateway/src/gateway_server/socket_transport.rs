//! Stream socket listeners (TCP and Unix domain). One NDJSON connection per accept.
use super::*;

#[cfg(unix)]
use std::path::Path;
#[cfg(unix)]
use tokio::net::UnixListener;

pub(super) async fn run_tcp_accept_loop(
    listener: TcpListener,
    router: Arc<RpcRouter>,
    max_frame_bytes: usize,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(error) => {
                        tracing::warn!(%error, "rpc tcp accept failed");
                        continue;
                    }
                };
                let _ = stream.set_nodelay(true);
                let (reader, writer) = stream.into_split();
                let router = router.clone();
                tokio::spawn(async move {
                    tracing::debug!(%peer, "rpc tcp connection opened");
                    if let Err(error) =
                        serve_rpc_duplex_connection(router, reader, writer, max_frame_bytes).await
                    {
                        tracing::warn!(%peer, error = %format!("{error:#}"), "rpc tcp connection failed");
                    }
                });
            }
            _ = shutdown_rx.changed() => break,
        }
    }
}

/// Binds the listener, replacing a stale socket file left by an earlier run.
#[cfg(unix)]
pub(super) fn bind_unix_socket(path: &Path) -> Result<UnixListener> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "removed stale unix socket"),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
        Err(error) => {
            return Err(error)
                .with_context(|| format!("failed to remove stale socket {}", path.display()))
        }
    }
    UnixListener::bind(path)
        .with_context(|| format!("failed to bind rpc unix socket {}", path.display()))
}

#[cfg(unix)]
pub(super) async fn run_unix_accept_loop(
    listener: UnixListener,
    router: Arc<RpcRouter>,
    max_frame_bytes: usize,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let stream = match accepted {
                    Ok((stream, _)) => stream,
                    Err(error) => {
                        tracing::warn!(%error, "rpc unix accept failed");
                        continue;
                    }
                };
                let (reader, writer) = stream.into_split();
                let router = router.clone();
                tokio::spawn(async move {
                    if let Err(error) =
                        serve_rpc_duplex_connection(router, reader, writer, max_frame_bytes).await
                    {
                        tracing::warn!(error = %format!("{error:#}"), "rpc unix connection failed");
                    }
                });
            }
            _ = shutdown_rx.changed() => break,
        }
    }
}
