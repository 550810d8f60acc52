//! WebSocket transport. Text or binary messages carry NDJSON frames; every
//! response, including each streaming chunk, goes out as one text message.
use super::*;

fn ws_message_from_response(response: &RpcResponse) -> Option<WsMessage> {
    encode_rpc_response(response).map(|raw| WsMessage::Text(raw.into()))
}

pub(super) async fn run_gateway_ws_connection(
    router: Arc<RpcRouter>,
    socket: WebSocket,
    max_frame_bytes: usize,
) {
    let (mut sender, mut receiver) = socket.split();
    let (push, mut outbound) = PushSink::channel();
    let mut heartbeat = tokio::time::interval(GATEWAY_WS_HEARTBEAT_INTERVAL);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            inbound = receiver.next() => {
                let Some(inbound) = inbound else {
                    break;
                };
                let message = match inbound {
                    Ok(message) => message,
                    Err(error) => {
                        tracing::debug!(%error, "rpc websocket receive failed");
                        break;
                    }
                };
                match message {
                    WsMessage::Text(text) => {
                        dispatch_ws_payload(&router, &push, text.as_str().as_bytes(), max_frame_bytes);
                    }
                    WsMessage::Binary(bytes) => {
                        dispatch_ws_payload(&router, &push, &bytes, max_frame_bytes);
                    }
                    WsMessage::Ping(payload) => {
                        if sender.send(WsMessage::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    WsMessage::Pong(_) => {}
                    WsMessage::Close(_) => break,
                }
            }
            Some(response) = outbound.recv() => {
                let Some(message) = ws_message_from_response(&response) else {
                    continue;
                };
                if sender.send(message).await.is_err() {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                if sender.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }
    tracing::debug!("rpc websocket connection closed");
}

fn dispatch_ws_payload(
    router: &Arc<RpcRouter>,
    push: &PushSink,
    payload: &[u8],
    max_frame_bytes: usize,
) {
    let mut framer = NdjsonFramer::new(max_frame_bytes);
    framer.push(payload);
    framer.finish();
    while let Some(frame) = framer.next_frame() {
        match frame {
            Ok(value) => spawn_push_dispatch(router.clone(), push.clone(), value),
            Err(error) => tracing::warn!(%error, "skipping malformed rpc websocket frame"),
        }
    }
}
