//! Gateway transport tests grouped by transport.
use super::*;
use reqwest::Client;
use rkgate_runtime::{RpcRuntimeConfig, SimulatedEngine, SimulatedEngineConfig};
use tempfile::tempdir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_tungstenite::{connect_async, tungstenite::Message as ClientWsMessage};

async fn start_test_gateway(config: GatewayServerConfig) -> (RpcRuntime, GatewayServerHandle) {
    let runtime = RpcRuntime::start(
        RpcRuntimeConfig::default(),
        Arc::new(SimulatedEngine::new(SimulatedEngineConfig::default())),
    )
    .expect("start runtime");
    let handle = start_gateway_server(config, runtime.router())
        .await
        .expect("start gateway");
    (runtime, handle)
}

fn loopback() -> Option<String> {
    Some("127.0.0.1:0".to_string())
}

fn rpc(id: Value, method: &str, params: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params})
}

async fn post_rpc(client: &Client, addr: SocketAddr, body: &Value) -> Value {
    client
        .post(format!("http://{addr}{RPC_HTTP_ENDPOINT}"))
        .json(body)
        .send()
        .await
        .expect("send rpc")
        .json::<Value>()
        .await
        .expect("rpc json")
}

async fn read_until_terminal<R>(lines: &mut tokio::io::Lines<BufReader<R>>) -> Vec<Value>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut frames = Vec::new();
    loop {
        let line = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
            .await
            .expect("timely frame")
            .expect("read line")
            .expect("connection open");
        let frame = serde_json::from_str::<Value>(&line).expect("frame json");
        let terminal = frame["error"].is_object() || frame["result"]["_callback_state"] == 2;
        frames.push(frame);
        if terminal {
            return frames;
        }
    }
}

#[tokio::test]
async fn unit_gateway_requires_at_least_one_transport() {
    let runtime = RpcRuntime::start(
        RpcRuntimeConfig::default(),
        Arc::new(SimulatedEngine::default()),
    )
    .expect("start runtime");
    let result = start_gateway_server(GatewayServerConfig::default(), runtime.router()).await;
    assert!(result.is_err());
    runtime.shutdown().await;
}

#[test]
fn unit_transport_labels_and_stdio_only_detection() {
    let config = GatewayServerConfig {
        stdio: true,
        ..GatewayServerConfig::default()
    };
    assert!(config.is_stdio_only());
    assert_eq!(config.transport_labels(), vec!["stdio".to_string()]);

    let mixed = GatewayServerConfig {
        stdio: true,
        tcp_bind: Some("127.0.0.1:7000".to_string()),
        ..GatewayServerConfig::default()
    };
    assert!(!mixed.is_stdio_only());
    assert_eq!(mixed.transport_labels().len(), 2);
}

#[tokio::test]
async fn functional_tcp_connection_streams_run_chunks_in_order() {
    let (runtime, handle) = start_test_gateway(GatewayServerConfig {
        tcp_bind: loopback(),
        ..GatewayServerConfig::default()
    })
    .await;
    let addr = handle.tcp_addr().expect("tcp addr");
    let stream = tokio::net::TcpStream::connect(addr).await.expect("connect");
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    let init = rpc(json!(1), "rkllm.init", json!({"model_path": "/models/qwen.rkllm"}));
    writer
        .write_all(format!("{init}\n").as_bytes())
        .await
        .expect("write init");
    let init_reply = serde_json::from_str::<Value>(
        &lines.next_line().await.expect("read").expect("init reply"),
    )
    .expect("json");
    let model = init_reply["result"]["handle"].clone();
    assert!(model.is_string());

    let run = rpc(json!("gen-1"), "rkllm.run", json!({"handle": model, "prompt": "a b c"}));
    writer
        .write_all(format!("{run}\n").as_bytes())
        .await
        .expect("write run");
    let frames = read_until_terminal(&mut lines).await;
    let seqs = frames
        .iter()
        .map(|frame| frame["result"]["seq"].clone())
        .collect::<Vec<_>>();
    assert_eq!(seqs, vec![json!(0), json!(1), json!(2), json!(3)]);
    assert!(frames.iter().all(|frame| frame["id"] == "gen-1"));

    handle.shutdown().await;
    runtime.shutdown().await;
}

#[tokio::test]
async fn functional_http_post_stream_then_poll_until_end() {
    let (runtime, handle) = start_test_gateway(GatewayServerConfig {
        http_bind: loopback(),
        ..GatewayServerConfig::default()
    })
    .await;
    let addr = handle.http_addr().expect("http addr");
    let client = Client::new();

    let init = post_rpc(
        &client,
        addr,
        &rpc(json!(1), "rkllm.init", json!(["/models/qwen.rkllm"])),
    )
    .await;
    let model = init["result"]["handle"].clone();

    let ack = post_rpc(
        &client,
        addr,
        &rpc(json!(2), "rkllm.run", json!({"handle": model, "prompt": "hello there"})),
    )
    .await;
    assert_eq!(ack["result"]["status"], "streaming");
    assert_eq!(ack["result"]["request_id"], 2);

    let mut texts = Vec::new();
    let mut since_seq = -1_i64;
    let mut ended = false;
    for _ in 0..100 {
        let polled = post_rpc(
            &client,
            addr,
            &rpc(json!(3), "poll", json!({"request_id": 2, "since_seq": since_seq})),
        )
        .await;
        let result = &polled["result"];
        for chunk in result["chunk"].as_array().cloned().unwrap_or_default() {
            texts.push(chunk["payload"]["text"].as_str().unwrap_or_default().to_string());
        }
        since_seq = result["next_since_seq"].as_i64().unwrap_or(since_seq);
        if result["end"] == true {
            ended = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(ended);
    assert_eq!(texts.concat(), "hello there");

    handle.shutdown().await;
    runtime.shutdown().await;
}

#[tokio::test]
async fn regression_http_invalid_json_body_returns_parse_error_with_null_id() {
    let (runtime, handle) = start_test_gateway(GatewayServerConfig {
        http_bind: loopback(),
        ..GatewayServerConfig::default()
    })
    .await;
    let addr = handle.http_addr().expect("http addr");
    let response = Client::new()
        .post(format!("http://{addr}{RPC_HTTP_ENDPOINT}"))
        .header("content-type", "application/json")
        .body("{\"jsonrpc\":")
        .send()
        .await
        .expect("send");
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body = response.json::<Value>().await.expect("json");
    assert!(body["id"].is_null());
    assert_eq!(body["error"]["code"], -32700);

    handle.shutdown().await;
    runtime.shutdown().await;
}

#[tokio::test]
async fn functional_status_endpoint_reports_buffers_and_transports() {
    let (runtime, handle) = start_test_gateway(GatewayServerConfig {
        http_bind: loopback(),
        tcp_bind: loopback(),
        ..GatewayServerConfig::default()
    })
    .await;
    let addr = handle.http_addr().expect("http addr");
    let status = Client::new()
        .get(format!("http://{addr}{GATEWAY_STATUS_ENDPOINT}"))
        .send()
        .await
        .expect("send")
        .json::<Value>()
        .await
        .expect("json");
    assert_eq!(status["status"], "ok");
    assert_eq!(status["buffers"]["initialized"], true);
    assert_eq!(status["transports"].as_array().map(Vec::len), Some(2));

    handle.shutdown().await;
    runtime.shutdown().await;
}

#[tokio::test]
async fn functional_websocket_pushes_each_chunk_as_a_text_message() {
    let (runtime, handle) = start_test_gateway(GatewayServerConfig {
        http_bind: loopback(),
        ..GatewayServerConfig::default()
    })
    .await;
    let addr = handle.http_addr().expect("http addr");
    let (mut socket, _) = connect_async(format!("ws://{addr}{GATEWAY_WS_ENDPOINT}"))
        .await
        .expect("connect websocket");

    async fn next_json(
        socket: &mut tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    ) -> Value {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let message = socket
                    .next()
                    .await
                    .expect("websocket open")
                    .expect("websocket frame");
                if let ClientWsMessage::Text(text) = message {
                    return serde_json::from_str::<Value>(text.as_str()).expect("json");
                }
            }
        })
        .await
        .expect("timely websocket frame")
    }

    socket
        .send(ClientWsMessage::Text(
            rpc(json!(1), "rkllm.init", json!({"model_path": "/m"})).to_string().into(),
        ))
        .await
        .expect("send init");
    let init = next_json(&mut socket).await;
    let model = init["result"]["handle"].clone();

    socket
        .send(ClientWsMessage::Text(
            rpc(json!(2), "rkllm.run_async", json!({"handle": model, "prompt": "x y"}))
                .to_string()
                .into(),
        ))
        .await
        .expect("send run");
    let mut states = Vec::new();
    loop {
        let frame = next_json(&mut socket).await;
        let state = frame["result"]["_callback_state"].clone();
        states.push(state.clone());
        if state == 2 {
            break;
        }
    }
    assert_eq!(states, vec![json!(0), json!(1), json!(2)]);

    let _ = socket.close(None).await;
    handle.shutdown().await;
    runtime.shutdown().await;
}

#[tokio::test]
async fn functional_udp_datagram_gets_one_datagram_per_response() {
    let (runtime, handle) = start_test_gateway(GatewayServerConfig {
        udp_bind: loopback(),
        ..GatewayServerConfig::default()
    })
    .await;
    let server = handle.udp_addr().expect("udp addr");
    let client = UdpSocket::bind("127.0.0.1:0").await.expect("bind client");
    client
        .send_to(
            format!("{}\n", rpc(json!(5), "rpc.capabilities", Value::Null)).as_bytes(),
            server,
        )
        .await
        .expect("send datagram");

    let mut buffer = vec![0_u8; 64 * 1024];
    let (len, from) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buffer))
        .await
        .expect("timely datagram")
        .expect("recv");
    assert_eq!(from, server);
    let response = serde_json::from_slice::<Value>(&buffer[..len]).expect("json");
    assert_eq!(response["id"], 5);
    assert_eq!(response["result"]["jsonrpc"], "2.0");

    handle.shutdown().await;
    runtime.shutdown().await;
}

#[cfg(unix)]
#[tokio::test]
async fn integration_unix_socket_serves_requests_and_is_removed_on_shutdown() {
    let temp = tempdir().expect("tempdir");
    let path = temp.path().join("run").join("rkgate.sock");
    std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
    std::fs::write(&path, b"stale").expect("stale socket file");

    let (runtime, handle) = start_test_gateway(GatewayServerConfig {
        unix_socket: Some(path.clone()),
        ..GatewayServerConfig::default()
    })
    .await;
    let stream = tokio::net::UnixStream::connect(&path).await.expect("connect");
    let (reader, mut writer) = stream.into_split();
    writer
        .write_all(format!("{}\n", rpc(json!(1), "no.such.method", json!({}))).as_bytes())
        .await
        .expect("write");
    let mut lines = BufReader::new(reader).lines();
    let reply = serde_json::from_str::<Value>(
        &tokio::time::timeout(Duration::from_secs(5), lines.next_line())
            .await
            .expect("timely")
            .expect("read")
            .expect("reply"),
    )
    .expect("json");
    assert_eq!(reply["error"]["code"], -32601);

    handle.shutdown().await;
    assert!(!path.exists());
    runtime.shutdown().await;
}
