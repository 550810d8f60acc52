//! Gateway server bootstrap: binds every configured transport against one router.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use rkgate_runtime::{
    dispatch_rpc_http_body, http_buffer_manager_status_payload, serve_rpc_duplex_connection,
    spawn_push_dispatch, NdjsonFramer, PushSink, RpcResponse, RpcRouter, RpcRuntime,
    DEFAULT_MAX_FRAME_BYTES,
};
use serde_json::{json, Value};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;
use tokio::task::JoinHandle;

mod http_transport;
mod socket_transport;
mod stdio_transport;
#[cfg(test)]
mod tests;
mod udp_transport;
mod websocket;

use http_transport::{build_gateway_http_router, GatewayHttpState};
use socket_transport::run_tcp_accept_loop;
#[cfg(unix)]
use socket_transport::{bind_unix_socket, run_unix_accept_loop};
use stdio_transport::run_stdio_transport;
use udp_transport::run_udp_receive_loop;

pub const RPC_HTTP_ENDPOINT: &str = "/rpc";
pub const GATEWAY_WS_ENDPOINT: &str = "/ws";
pub const GATEWAY_STATUS_ENDPOINT: &str = "/status";
pub const GATEWAY_WS_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayServerConfig {
    pub unix_socket: Option<PathBuf>,
    pub tcp_bind: Option<String>,
    pub udp_bind: Option<String>,
    pub http_bind: Option<String>,
    pub stdio: bool,
    pub max_frame_bytes: usize,
}

impl Default for GatewayServerConfig {
    fn default() -> Self {
        Self {
            unix_socket: None,
            tcp_bind: None,
            udp_bind: None,
            http_bind: None,
            stdio: false,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl GatewayServerConfig {
    pub fn has_transport(&self) -> bool {
        self.unix_socket.is_some()
            || self.tcp_bind.is_some()
            || self.udp_bind.is_some()
            || self.http_bind.is_some()
            || self.stdio
    }

    /// Stdio is the only transport, so stdin EOF ends the server.
    pub fn is_stdio_only(&self) -> bool {
        self.stdio
            && self.unix_socket.is_none()
            && self.tcp_bind.is_none()
            && self.udp_bind.is_none()
            && self.http_bind.is_none()
    }

    pub fn transport_labels(&self) -> Vec<String> {
        let mut labels = Vec::new();
        if let Some(path) = &self.unix_socket {
            labels.push(format!("unix:{}", path.display()));
        }
        if let Some(bind) = &self.tcp_bind {
            labels.push(format!("tcp:{bind}"));
        }
        if let Some(bind) = &self.udp_bind {
            labels.push(format!("udp:{bind}"));
        }
        if let Some(bind) = &self.http_bind {
            labels.push(format!("http:{bind}"));
        }
        if self.stdio {
            labels.push("stdio".to_string());
        }
        labels
    }
}

/// Bound addresses and lifecycle control for a running gateway.
pub struct GatewayServerHandle {
    tcp_addr: Option<SocketAddr>,
    udp_addr: Option<SocketAddr>,
    http_addr: Option<SocketAddr>,
    unix_socket: Option<PathBuf>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    stdio_task: Option<JoinHandle<()>>,
}

impl GatewayServerHandle {
    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp_addr
    }

    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.udp_addr
    }

    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http_addr
    }

    pub fn unix_socket(&self) -> Option<&PathBuf> {
        self.unix_socket.as_ref()
    }

    /// Resolves when the stdio transport reaches EOF; never resolves without one.
    pub async fn stdio_closed(&mut self) {
        match self.stdio_task.as_mut() {
            Some(task) => {
                let _ = task.await;
                self.stdio_task = None;
            }
            None => std::future::pending::<()>().await,
        }
    }

    /// Stops accepting on every transport and removes the unix socket file.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        if let Some(task) = self.stdio_task.take() {
            task.abort();
        }
        if let Some(path) = self.unix_socket.take() {
            match std::fs::remove_file(&path) {
                Ok(()) => tracing::debug!(path = %path.display(), "removed unix socket"),
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
                Err(error) => {
                    tracing::warn!(path = %path.display(), %error, "failed to remove unix socket")
                }
            }
        }
        tracing::info!("gateway transports stopped");
    }
}

/// Binds every configured transport and spawns its serving task.
pub async fn start_gateway_server(
    config: GatewayServerConfig,
    router: Arc<RpcRouter>,
) -> Result<GatewayServerHandle> {
    if !config.has_transport() {
        anyhow::bail!("at least one transport must be enabled");
    }
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handle = GatewayServerHandle {
        tcp_addr: None,
        udp_addr: None,
        http_addr: None,
        unix_socket: None,
        shutdown_tx,
        tasks: Vec::new(),
        stdio_task: None,
    };

    #[cfg(unix)]
    {
        if let Some(path) = &config.unix_socket {
            let listener = bind_unix_socket(path)?;
            tracing::info!(path = %path.display(), "rpc unix socket listening");
            handle.unix_socket = Some(path.clone());
            handle.tasks.push(tokio::spawn(run_unix_accept_loop(
                listener,
                router.clone(),
                config.max_frame_bytes,
                shutdown_rx.clone(),
            )));
        }
    }
    #[cfg(not(unix))]
    {
        if config.unix_socket.is_some() {
            anyhow::bail!("unix socket transport is not supported on this platform");
        }
    }

    if let Some(bind) = &config.tcp_bind {
        let addr = parse_bind_addr(bind, "--tcp-bind")?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind rpc tcp listener on {addr}"))?;
        let local_addr = listener
            .local_addr()
            .context("failed to resolve bound rpc tcp address")?;
        tracing::info!(addr = %local_addr, "rpc tcp listening");
        handle.tcp_addr = Some(local_addr);
        handle.tasks.push(tokio::spawn(run_tcp_accept_loop(
            listener,
            router.clone(),
            config.max_frame_bytes,
            shutdown_rx.clone(),
        )));
    }

    if let Some(bind) = &config.udp_bind {
        let addr = parse_bind_addr(bind, "--udp-bind")?;
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("failed to bind rpc udp socket on {addr}"))?;
        let local_addr = socket
            .local_addr()
            .context("failed to resolve bound rpc udp address")?;
        tracing::info!(addr = %local_addr, "rpc udp listening");
        handle.udp_addr = Some(local_addr);
        handle.tasks.push(tokio::spawn(run_udp_receive_loop(
            Arc::new(socket),
            router.clone(),
            config.max_frame_bytes,
            shutdown_rx.clone(),
        )));
    }

    if let Some(bind) = &config.http_bind {
        let addr = parse_bind_addr(bind, "--http-bind")?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind rpc http server on {addr}"))?;
        let local_addr = listener
            .local_addr()
            .context("failed to resolve bound rpc http address")?;
        tracing::info!(
            addr = %local_addr,
            rpc_endpoint = RPC_HTTP_ENDPOINT,
            ws_endpoint = GATEWAY_WS_ENDPOINT,
            "rpc http listening"
        );
        handle.http_addr = Some(local_addr);
        let state = Arc::new(GatewayHttpState {
            router: router.clone(),
            max_frame_bytes: config.max_frame_bytes,
            transports: config.transport_labels(),
        });
        let app = build_gateway_http_router(state);
        let mut http_shutdown = shutdown_rx.clone();
        handle.tasks.push(tokio::spawn(async move {
            let serve_result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = http_shutdown.changed().await;
                })
                .await;
            if let Err(error) = serve_result {
                tracing::error!(%error, "rpc http server exited unexpectedly");
            }
        }));
    }

    if config.stdio {
        tracing::info!("rpc stdio transport enabled");
        handle.stdio_task = Some(tokio::spawn(run_stdio_transport(
            router.clone(),
            config.max_frame_bytes,
        )));
    }

    Ok(handle)
}

/// Runs the gateway until Ctrl-C, or until stdin closes when stdio is the
/// only transport, then tears the runtime down.
pub async fn run_gateway_server(config: GatewayServerConfig, runtime: RpcRuntime) -> Result<()> {
    let stdio_only = config.is_stdio_only();
    let mut handle = start_gateway_server(config, runtime.router()).await?;

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for shutdown signal")?;
            tracing::info!("shutdown signal received");
        }
        _ = handle.stdio_closed(), if stdio_only => {
            tracing::info!("stdin closed");
        }
    }

    handle.shutdown().await;
    runtime.shutdown().await;
    Ok(())
}

fn parse_bind_addr(bind: &str, flag: &str) -> Result<SocketAddr> {
    bind.parse::<SocketAddr>()
        .with_context(|| format!("invalid {flag} '{bind}'"))
}

pub(crate) fn encode_rpc_response(response: &RpcResponse) -> Option<String> {
    match serde_json::to_string(response) {
        Ok(raw) => Some(raw),
        Err(error) => {
            tracing::error!(%error, "failed to serialize rpc response");
            None
        }
    }
}
