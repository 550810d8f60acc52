//! Wires the buffer manager, sweeper, session manager and router together.

use std::sync::Arc;

use anyhow::Result;
use rkgate_core::{SharedClock, SystemClock};

use crate::buffer_sweeper_runtime::{start_buffer_sweeper, BufferSweeperHandle};
use crate::http_buffer_runtime::{HttpBufferConfig, HttpBufferManager};
use crate::native_engine::NativeEngine;
use crate::ndjson_framer::DEFAULT_MAX_FRAME_BYTES;
use crate::rpc_protocol_runtime::RpcRouter;
use crate::stream_session_runtime::StreamSessionManager;

pub const DEFAULT_UNARY_WORKERS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcRuntimeConfig {
    pub buffer: HttpBufferConfig,
    pub unary_workers: usize,
    pub max_frame_bytes: usize,
}

impl Default for RpcRuntimeConfig {
    fn default() -> Self {
        Self {
            buffer: HttpBufferConfig::default(),
            unary_workers: DEFAULT_UNARY_WORKERS,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

pub struct RpcRuntime {
    config: RpcRuntimeConfig,
    router: Arc<RpcRouter>,
    sweeper: BufferSweeperHandle,
}

impl RpcRuntime {
    /// Starts the runtime on the wall clock. Must be called inside a Tokio runtime.
    pub fn start(config: RpcRuntimeConfig, engine: Arc<dyn NativeEngine>) -> Result<Self> {
        Self::start_with_clock(config, engine, SystemClock::shared())
    }

    pub fn start_with_clock(
        config: RpcRuntimeConfig,
        engine: Arc<dyn NativeEngine>,
        clock: SharedClock,
    ) -> Result<Self> {
        if config.unary_workers == 0 {
            anyhow::bail!("unary worker count must be greater than zero");
        }
        if config.max_frame_bytes == 0 {
            anyhow::bail!("max frame size must be greater than zero");
        }
        let buffers = Arc::new(HttpBufferManager::new(config.buffer, clock.clone()));
        buffers.initialize();
        let sweeper = start_buffer_sweeper(buffers.clone(), config.buffer.sweep_interval)?;
        let sessions = Arc::new(StreamSessionManager::new(buffers, clock));
        let router = Arc::new(RpcRouter::new(engine, sessions, config.unary_workers));
        tracing::info!(
            unary_workers = config.unary_workers,
            max_frame_bytes = config.max_frame_bytes,
            buffer_ttl_ms = u64::try_from(config.buffer.ttl.as_millis()).unwrap_or(u64::MAX),
            drop_acknowledged = config.buffer.drop_acknowledged,
            "rpc runtime started"
        );
        Ok(Self {
            config,
            router,
            sweeper,
        })
    }

    pub fn config(&self) -> RpcRuntimeConfig {
        self.config
    }

    pub fn router(&self) -> Arc<RpcRouter> {
        self.router.clone()
    }

    pub fn sweeper(&self) -> &BufferSweeperHandle {
        &self.sweeper
    }

    /// Stops the sweeper and releases all buffered output.
    pub async fn shutdown(mut self) {
        self.sweeper.shutdown().await;
        let released = self.router.buffers().shutdown();
        tracing::info!(
            released_buffers = released,
            active_sessions = self.router.sessions().active_session_count(),
            "rpc runtime stopped"
        );
    }
}
