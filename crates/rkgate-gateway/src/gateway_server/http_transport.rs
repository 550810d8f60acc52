//! HTTP surface: JSON-RPC over POST, the WebSocket upgrade and a status probe.
use super::websocket::run_gateway_ws_connection;
use super::*;

pub(super) struct GatewayHttpState {
    pub(super) router: Arc<RpcRouter>,
    pub(super) max_frame_bytes: usize,
    pub(super) transports: Vec<String>,
}

pub(super) fn build_gateway_http_router(state: Arc<GatewayHttpState>) -> Router {
    let body_limit = state.max_frame_bytes;
    Router::new()
        .route(RPC_HTTP_ENDPOINT, post(handle_rpc_http))
        .route(GATEWAY_WS_ENDPOINT, get(handle_gateway_ws_upgrade))
        .route(GATEWAY_STATUS_ENDPOINT, get(handle_gateway_status))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

async fn handle_rpc_http(State(state): State<Arc<GatewayHttpState>>, body: Bytes) -> Response {
    let response = dispatch_rpc_http_body(&state.router, &body).await;
    (StatusCode::OK, Json(response)).into_response()
}

async fn handle_gateway_ws_upgrade(
    State(state): State<Arc<GatewayHttpState>>,
    websocket: WebSocketUpgrade,
) -> Response {
    let router = state.router.clone();
    let max_frame_bytes = state.max_frame_bytes;
    websocket
        .max_message_size(max_frame_bytes)
        .on_upgrade(move |socket| run_gateway_ws_connection(router, socket, max_frame_bytes))
        .into_response()
}

async fn handle_gateway_status(State(state): State<Arc<GatewayHttpState>>) -> Response {
    let router = &state.router;
    let payload: Value = json!({
        "status": "ok",
        "transports": state.transports,
        "buffers": http_buffer_manager_status_payload(router.buffers(), router.sessions()),
        "sessions": router.sessions().active_sessions(),
    });
    (StatusCode::OK, Json(payload)).into_response()
}
