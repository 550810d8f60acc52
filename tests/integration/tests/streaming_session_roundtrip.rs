use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use rkgate_core::ManualClock;
use rkgate_gateway::{start_gateway_server, GatewayServerConfig, RPC_HTTP_ENDPOINT};
use rkgate_runtime::{
    ChunkSink, EngineChunk, EngineError, HttpBufferConfig, NativeEngine, RpcRuntime,
    RpcRuntimeConfig, SimulatedEngine, SimulatedEngineConfig,
};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

/// Emits `tokens` chunks per run, failing after `fail_after` when set.
struct ScriptedEngine {
    tokens: usize,
    fail_after: Option<usize>,
    token_delay: Duration,
    completed_runs: AtomicUsize,
}

impl ScriptedEngine {
    fn new(tokens: usize) -> Self {
        Self {
            tokens,
            fail_after: None,
            token_delay: Duration::ZERO,
            completed_runs: AtomicUsize::new(0),
        }
    }
}

impl NativeEngine for ScriptedEngine {
    fn call(&self, method: &str, _params: &Value) -> Result<Value, EngineError> {
        match method {
            "rkllm.abort" => Ok(json!({"aborted": true})),
            other => Err(EngineError::UnsupportedMethod(other.to_string())),
        }
    }

    fn run_streaming(
        &self,
        _method: &str,
        params: &Value,
        sink: &ChunkSink,
    ) -> Result<(), EngineError> {
        let tag = params["tag"].as_str().unwrap_or("t").to_string();
        for index in 0..self.tokens {
            if self.fail_after == Some(index) {
                return Err(EngineError::Failed(format!("npu fault at token {index}")));
            }
            if !self.token_delay.is_zero() {
                std::thread::sleep(self.token_delay);
            }
            let text = format!("{tag}{index}");
            let chunk = if index == 0 {
                EngineChunk::begin(text, index as i64)
            } else {
                EngineChunk::running(text, index as i64)
            };
            sink.emit(chunk);
        }
        sink.emit(EngineChunk::done());
        self.completed_runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn rpc(id: Value, method: &str, params: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params})
}

async fn post_rpc(client: &reqwest::Client, addr: SocketAddr, body: &Value) -> Value {
    client
        .post(format!("http://{addr}{RPC_HTTP_ENDPOINT}"))
        .json(body)
        .send()
        .await
        .expect("send rpc")
        .json::<Value>()
        .await
        .expect("decode rpc")
}

async fn poll_until_end(
    client: &reqwest::Client,
    addr: SocketAddr,
    request_id: Value,
) -> Vec<Value> {
    let mut chunks = Vec::new();
    let mut since_seq = -1_i64;
    for _ in 0..200 {
        let polled = post_rpc(
            client,
            addr,
            &rpc(
                json!("poller"),
                "poll",
                json!({"request_id": request_id, "since_seq": since_seq}),
            ),
        )
        .await;
        let result = &polled["result"];
        chunks.extend(result["chunk"].as_array().cloned().unwrap_or_default());
        since_seq = result["next_since_seq"].as_i64().unwrap_or(since_seq);
        if result["end"] == true {
            return chunks;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("stream {request_id} did not end");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn integration_concurrent_streams_on_one_connection_stay_ordered_per_id() {
    let mut engine = ScriptedEngine::new(6);
    engine.token_delay = Duration::from_millis(5);
    let runtime = RpcRuntime::start(RpcRuntimeConfig::default(), Arc::new(engine))
        .expect("start runtime");
    let handle = start_gateway_server(
        GatewayServerConfig {
            tcp_bind: Some("127.0.0.1:0".to_string()),
            ..GatewayServerConfig::default()
        },
        runtime.router(),
    )
    .await
    .expect("start gateway");

    let stream = TcpStream::connect(handle.tcp_addr().expect("tcp addr"))
        .await
        .expect("connect");
    let (reader, mut writer) = stream.into_split();
    let mut batch = String::new();
    for (id, tag) in [(1, "a"), (2, "b"), (3, "c")] {
        batch.push_str(&rpc(json!(id), "rkllm.run", json!({"tag": tag})).to_string());
        batch.push('\n');
    }
    batch.push_str(&rpc(json!("abort"), "rkllm.abort", json!({})).to_string());
    batch.push('\n');
    writer.write_all(batch.as_bytes()).await.expect("write batch");

    let mut lines = BufReader::new(reader).lines();
    let mut per_id: std::collections::HashMap<String, Vec<Value>> = Default::default();
    let mut finished = 0;
    let mut unary_seen_before_all_done = false;
    while finished < 3 {
        let line = tokio::time::timeout(Duration::from_secs(10), lines.next_line())
            .await
            .expect("timely frame")
            .expect("read")
            .expect("open");
        let frame = serde_json::from_str::<Value>(&line).expect("frame json");
        let id = frame["id"].to_string();
        if frame["id"] == "abort" {
            assert_eq!(frame["result"]["aborted"], true);
            unary_seen_before_all_done = true;
            continue;
        }
        if frame["result"]["_callback_state"] == 2 {
            finished += 1;
        }
        per_id.entry(id).or_default().push(frame["result"].clone());
    }
    assert!(unary_seen_before_all_done, "unary call waited for streams");

    for (id, chunks) in &per_id {
        let seqs = chunks.iter().map(|chunk| chunk["seq"].clone()).collect::<Vec<_>>();
        let expected = (0..=6).map(|seq| json!(seq)).collect::<Vec<_>>();
        assert_eq!(seqs, expected, "stream {id}");
        assert_eq!(
            chunks
                .iter()
                .filter(|chunk| chunk["_callback_state"] == 2)
                .count(),
            1
        );
    }

    handle.shutdown().await;
    runtime.shutdown().await;
}

#[tokio::test]
async fn integration_http_poll_with_drop_acknowledged_frees_buffer_after_terminal_poll() {
    let runtime = RpcRuntime::start(
        RpcRuntimeConfig {
            buffer: HttpBufferConfig {
                drop_acknowledged: true,
                ..HttpBufferConfig::default()
            },
            ..RpcRuntimeConfig::default()
        },
        Arc::new(ScriptedEngine::new(3)),
    )
    .expect("start runtime");
    let handle = start_gateway_server(
        GatewayServerConfig {
            http_bind: Some("127.0.0.1:0".to_string()),
            ..GatewayServerConfig::default()
        },
        runtime.router(),
    )
    .await
    .expect("start gateway");
    let addr = handle.http_addr().expect("http addr");
    let client = reqwest::Client::new();

    let ack = post_rpc(&client, addr, &rpc(json!("s-1"), "rkllm.run", json!({}))).await;
    assert_eq!(ack["result"]["status"], "streaming");
    let chunks = poll_until_end(&client, addr, json!("s-1")).await;
    assert_eq!(chunks.len(), 4);
    assert_eq!(chunks.iter().filter(|chunk| chunk["end"] == true).count(), 1);

    let after = post_rpc(
        &client,
        addr,
        &rpc(json!(9), "poll", json!({"request_id": "s-1"})),
    )
    .await;
    assert_eq!(after["error"]["code"], -32004);

    handle.shutdown().await;
    runtime.shutdown().await;
}

#[tokio::test]
async fn integration_idle_buffer_is_evicted_after_ttl_and_poll_reports_not_found() {
    let clock = Arc::new(ManualClock::new(1_000_000));
    let runtime = RpcRuntime::start_with_clock(
        RpcRuntimeConfig {
            buffer: HttpBufferConfig {
                ttl: Duration::from_secs(60),
                sweep_interval: Duration::from_secs(3_600),
                drop_acknowledged: false,
            },
            ..RpcRuntimeConfig::default()
        },
        Arc::new(ScriptedEngine::new(2)),
        clock.clone(),
    )
    .expect("start runtime");
    let handle = start_gateway_server(
        GatewayServerConfig {
            http_bind: Some("127.0.0.1:0".to_string()),
            ..GatewayServerConfig::default()
        },
        runtime.router(),
    )
    .await
    .expect("start gateway");
    let addr = handle.http_addr().expect("http addr");
    let client = reqwest::Client::new();

    post_rpc(&client, addr, &rpc(json!(41), "rkllm.run", json!({}))).await;
    let chunks = poll_until_end(&client, addr, json!(41)).await;
    assert_eq!(chunks.len(), 3);

    clock.advance(Duration::from_secs(30));
    let report = runtime.sweeper().evict_now().expect("sweep");
    assert!(report.evicted.is_empty(), "entry is still within its ttl");

    clock.advance(Duration::from_secs(31));
    let report = runtime.sweeper().evict_now().expect("sweep");
    assert_eq!(report.evicted.len(), 1);

    let polled = post_rpc(&client, addr, &rpc(json!(42), "poll", json!([41]))).await;
    assert_eq!(polled["error"]["code"], -32004);

    handle.shutdown().await;
    runtime.shutdown().await;
}

#[tokio::test]
async fn integration_engine_failure_mid_stream_ends_polled_stream_with_error_chunk() {
    let mut engine = ScriptedEngine::new(5);
    engine.fail_after = Some(2);
    let runtime = RpcRuntime::start(RpcRuntimeConfig::default(), Arc::new(engine))
        .expect("start runtime");
    let handle = start_gateway_server(
        GatewayServerConfig {
            http_bind: Some("127.0.0.1:0".to_string()),
            ..GatewayServerConfig::default()
        },
        runtime.router(),
    )
    .await
    .expect("start gateway");
    let addr = handle.http_addr().expect("http addr");
    let client = reqwest::Client::new();

    post_rpc(&client, addr, &rpc(json!("f"), "rkllm.run", json!({}))).await;
    let chunks = poll_until_end(&client, addr, json!("f")).await;
    assert_eq!(chunks.len(), 3);
    let last = chunks.last().expect("terminal chunk");
    assert_eq!(last["end"], true);
    assert_eq!(last["payload"]["error"]["code"], -32002);
    assert_eq!(last["payload"]["error"]["data"]["_callback_state"], 3);
    assert_eq!(last["payload"]["error"]["data"]["seq"], 2);

    handle.shutdown().await;
    runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn integration_client_disconnect_mid_stream_lets_engine_finish_and_releases_session() {
    let engine = Arc::new(ScriptedEngine {
        tokens: 20,
        fail_after: None,
        token_delay: Duration::from_millis(5),
        completed_runs: AtomicUsize::new(0),
    });
    let runtime =
        RpcRuntime::start(RpcRuntimeConfig::default(), engine.clone()).expect("start runtime");
    let router = runtime.router();
    let handle = start_gateway_server(
        GatewayServerConfig {
            tcp_bind: Some("127.0.0.1:0".to_string()),
            ..GatewayServerConfig::default()
        },
        router.clone(),
    )
    .await
    .expect("start gateway");

    let mut stream = TcpStream::connect(handle.tcp_addr().expect("tcp addr"))
        .await
        .expect("connect");
    stream
        .write_all(format!("{}\n", rpc(json!(1), "rkllm.run", json!({}))).as_bytes())
        .await
        .expect("write run");
    let mut first = String::new();
    let mut reader = BufReader::new(&mut stream);
    reader.read_line(&mut first).await.expect("first chunk");
    assert!(first.contains("\"_callback_state\":0"));
    drop(reader);
    drop(stream);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while (engine.completed_runs.load(Ordering::SeqCst) == 0
        || router.sessions().active_session_count() > 0)
        && tokio::time::Instant::now() < deadline
    {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(engine.completed_runs.load(Ordering::SeqCst), 1);
    assert_eq!(router.sessions().active_session_count(), 0);

    handle.shutdown().await;
    runtime.shutdown().await;
}

#[tokio::test]
async fn integration_simulated_engine_rknn_pipeline_over_http() {
    let runtime = RpcRuntime::start(
        RpcRuntimeConfig::default(),
        Arc::new(SimulatedEngine::new(SimulatedEngineConfig::default())),
    )
    .expect("start runtime");
    let handle = start_gateway_server(
        GatewayServerConfig {
            http_bind: Some("127.0.0.1:0".to_string()),
            ..GatewayServerConfig::default()
        },
        runtime.router(),
    )
    .await
    .expect("start gateway");
    let addr = handle.http_addr().expect("http addr");
    let client = reqwest::Client::new();

    let init = post_rpc(
        &client,
        addr,
        &rpc(json!(1), "rknn.init", json!({"model_path": "/models/yolo.rknn"})),
    )
    .await;
    let model = init["result"]["handle"].clone();
    let set = post_rpc(
        &client,
        addr,
        &rpc(json!(2), "rknn.inputs_set", json!({"handle": model, "inputs": [[1, 2, 3]]})),
    )
    .await;
    assert_eq!(set["result"]["inputs"], 1);
    let run = post_rpc(&client, addr, &rpc(json!(3), "rknn.run", json!({"handle": model}))).await;
    assert_eq!(run["result"]["outputs"], 1);
    let outputs = post_rpc(
        &client,
        addr,
        &rpc(json!(4), "rknn.outputs_get", json!({"handle": model})),
    )
    .await;
    assert_eq!(outputs["result"]["outputs"].as_array().map(Vec::len), Some(1));
    let destroyed = post_rpc(
        &client,
        addr,
        &rpc(json!(5), "rknn.destroy", json!({"handle": model})),
    )
    .await;
    assert_eq!(destroyed["result"]["destroyed"], true);
    let again = post_rpc(&client, addr, &rpc(json!(6), "rknn.run", json!({"handle": model}))).await;
    assert_eq!(again["error"]["code"], -32002);

    handle.shutdown().await;
    runtime.shutdown().await;
}
