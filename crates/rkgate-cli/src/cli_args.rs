use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, ArgGroup, Parser};
use rkgate_gateway::GatewayServerConfig;
use rkgate_runtime::{HttpBufferConfig, RpcRuntimeConfig, SimulatedEngineConfig};

fn parse_positive_usize(value: &str) -> Result<usize, String> {
    let parsed = value
        .parse::<usize>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Parser)]
#[command(
    name = "rkgate",
    about = "JSON-RPC 2.0 streaming server for RKLLM and RKNN model engines",
    version
)]
#[command(group(
    ArgGroup::new("transport")
        .required(true)
        .multiple(true)
        .args(["unix_socket", "tcp_bind", "udp_bind", "http_bind", "stdio"])
))]
pub struct Cli {
    #[arg(
        long = "unix-socket",
        env = "RKGATE_UNIX_SOCKET",
        help = "Serve NDJSON RPC on a Unix domain socket at this path. A stale socket file is replaced."
    )]
    pub unix_socket: Option<PathBuf>,

    #[arg(
        long = "tcp-bind",
        env = "RKGATE_TCP_BIND",
        help = "Serve NDJSON RPC on a TCP listener, e.g. 127.0.0.1:8080."
    )]
    pub tcp_bind: Option<String>,

    #[arg(
        long = "udp-bind",
        env = "RKGATE_UDP_BIND",
        help = "Serve NDJSON RPC over UDP datagrams. Responses go back to the sender, one datagram per line."
    )]
    pub udp_bind: Option<String>,

    #[arg(
        long = "http-bind",
        env = "RKGATE_HTTP_BIND",
        help = "Serve POST /rpc (polling for streams), GET /ws and GET /status on this address."
    )]
    pub http_bind: Option<String>,

    #[arg(
        long,
        env = "RKGATE_STDIO",
        action = ArgAction::SetTrue,
        help = "Serve NDJSON RPC on stdin/stdout. When it is the only transport, stdin EOF stops the server."
    )]
    pub stdio: bool,

    #[arg(
        long = "buffer-ttl-ms",
        env = "RKGATE_BUFFER_TTL_MS",
        default_value_t = 300_000,
        value_parser = parse_positive_u64,
        help = "Idle time after which a polling buffer is evicted."
    )]
    pub buffer_ttl_ms: u64,

    #[arg(
        long = "sweep-interval-ms",
        env = "RKGATE_SWEEP_INTERVAL_MS",
        default_value_t = 30_000,
        value_parser = parse_positive_u64,
        help = "Interval between polling buffer eviction sweeps."
    )]
    pub sweep_interval_ms: u64,

    #[arg(
        long = "max-frame-bytes",
        env = "RKGATE_MAX_FRAME_BYTES",
        default_value_t = 1024 * 1024,
        value_parser = parse_positive_usize,
        help = "Largest accepted request frame or HTTP body."
    )]
    pub max_frame_bytes: usize,

    #[arg(
        long = "unary-workers",
        env = "RKGATE_UNARY_WORKERS",
        default_value_t = 4,
        value_parser = parse_positive_usize,
        help = "Maximum number of unary engine calls running at once."
    )]
    pub unary_workers: usize,

    #[arg(
        long = "drop-acknowledged-buffers",
        env = "RKGATE_DROP_ACKNOWLEDGED_BUFFERS",
        action = ArgAction::SetTrue,
        help = "Free a polling buffer as soon as a poll has returned its terminal chunk."
    )]
    pub drop_acknowledged_buffers: bool,

    #[arg(
        long = "engine-token-delay-ms",
        env = "RKGATE_ENGINE_TOKEN_DELAY_MS",
        default_value_t = 0,
        help = "Artificial delay between tokens produced by the simulated engine."
    )]
    pub engine_token_delay_ms: u64,

    #[arg(
        long = "log-level",
        env = "RKGATE_LOG_LEVEL",
        default_value = "info",
        help = "Default tracing filter when RUST_LOG is unset."
    )]
    pub log_level: String,
}

impl Cli {
    pub fn gateway_config(&self) -> GatewayServerConfig {
        GatewayServerConfig {
            unix_socket: self.unix_socket.clone(),
            tcp_bind: self.tcp_bind.clone(),
            udp_bind: self.udp_bind.clone(),
            http_bind: self.http_bind.clone(),
            stdio: self.stdio,
            max_frame_bytes: self.max_frame_bytes,
        }
    }

    pub fn runtime_config(&self) -> RpcRuntimeConfig {
        RpcRuntimeConfig {
            buffer: HttpBufferConfig {
                ttl: Duration::from_millis(self.buffer_ttl_ms),
                sweep_interval: Duration::from_millis(self.sweep_interval_ms),
                drop_acknowledged: self.drop_acknowledged_buffers,
            },
            unary_workers: self.unary_workers,
            max_frame_bytes: self.max_frame_bytes,
        }
    }

    pub fn engine_config(&self) -> SimulatedEngineConfig {
        SimulatedEngineConfig {
            token_delay: Duration::from_millis(self.engine_token_delay_ms),
        }
    }
}
