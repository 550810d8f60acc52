//! Datagram transport. Each datagram carries one or more NDJSON frames; every
//! response line goes back to the sender as its own datagram.
use super::*;

const MAX_DATAGRAM_BYTES: usize = 64 * 1024;

pub(super) async fn run_udp_receive_loop(
    socket: Arc<UdpSocket>,
    router: Arc<RpcRouter>,
    max_frame_bytes: usize,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut buffer = vec![0_u8; MAX_DATAGRAM_BYTES];

    loop {
        tokio::select! {
            received = socket.recv_from(&mut buffer) => {
                let (len, peer) = match received {
                    Ok(received) => received,
                    Err(error) => {
                        tracing::warn!(%error, "rpc udp receive failed");
                        continue;
                    }
                };
                let push = spawn_udp_peer_writer(socket.clone(), peer);
                dispatch_datagram(&router, &push, &buffer[..len], max_frame_bytes, peer);
            }
            _ = shutdown_rx.changed() => break,
        }
    }
}

fn dispatch_datagram(
    router: &Arc<RpcRouter>,
    push: &PushSink,
    datagram: &[u8],
    max_frame_bytes: usize,
    peer: SocketAddr,
) {
    let mut framer = NdjsonFramer::new(max_frame_bytes);
    framer.push(datagram);
    framer.finish();
    while let Some(frame) = framer.next_frame() {
        match frame {
            Ok(value) => spawn_push_dispatch(router.clone(), push.clone(), value),
            Err(error) => {
                tracing::warn!(%peer, %error, "skipping malformed rpc datagram frame");
            }
        }
    }
}

/// The writer ends once every dispatch and stream fed by this datagram is done.
fn spawn_udp_peer_writer(socket: Arc<UdpSocket>, peer: SocketAddr) -> PushSink {
    let (push, mut outbound) = PushSink::channel();
    tokio::spawn(async move {
        while let Some(response) = outbound.recv().await {
            let Some(raw) = encode_rpc_response(&response) else {
                continue;
            };
            if let Err(error) = socket.send_to(format!("{raw}\n").as_bytes(), peer).await {
                tracing::debug!(%peer, %error, "rpc udp send failed");
            }
        }
    });
    push
}
