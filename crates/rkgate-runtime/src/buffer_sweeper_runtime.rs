//! Periodic TTL eviction over the HTTP buffer manager.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::http_buffer_runtime::{BufferError, EvictionReport, HttpBufferManager};

/// Lifecycle handle for a running sweeper.
pub struct BufferSweeperHandle {
    manager: Arc<HttpBufferManager>,
    sweep_count: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl BufferSweeperHandle {
    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    pub fn sweep_count(&self) -> u64 {
        self.sweep_count.load(Ordering::SeqCst)
    }

    /// Runs one eviction pass immediately on the caller's thread.
    pub fn evict_now(&self) -> Result<EvictionReport, BufferError> {
        let report = self.manager.evict_expired()?;
        self.sweep_count.fetch_add(1, Ordering::SeqCst);
        Ok(report)
    }

    pub async fn shutdown(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

pub fn start_buffer_sweeper(
    manager: Arc<HttpBufferManager>,
    interval: Duration,
) -> Result<BufferSweeperHandle> {
    if interval.is_zero() {
        anyhow::bail!("buffer sweep interval must be greater than zero");
    }
    let handle = tokio::runtime::Handle::try_current()
        .context("buffer sweeper requires an active Tokio runtime")?;

    let sweep_count = Arc::new(AtomicU64::new(0));
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = handle.spawn(run_buffer_sweeper_loop(
        manager.clone(),
        interval,
        sweep_count.clone(),
        shutdown_rx,
    ));
    tracing::info!(
        interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
        "buffer sweeper started"
    );
    Ok(BufferSweeperHandle {
        manager,
        sweep_count,
        shutdown_tx: Some(shutdown_tx),
        task: Some(task),
    })
}

async fn run_buffer_sweeper_loop(
    manager: Arc<HttpBufferManager>,
    interval: Duration,
    sweep_count: Arc<AtomicU64>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick completes immediately; nothing can be stale yet.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match manager.evict_expired() {
                    Ok(report) => {
                        sweep_count.fetch_add(1, Ordering::SeqCst);
                        if !report.evicted.is_empty() {
                            tracing::info!(
                                evicted = report.evicted.len(),
                                evicted_unterminated = report.evicted_unterminated,
                                remaining = report.remaining,
                                "buffer sweep evicted idle entries"
                            );
                        }
                    }
                    Err(error) => {
                        tracing::error!(%error, "buffer sweep failed");
                    }
                }
            }
            _ = &mut shutdown_rx => {
                tracing::info!(sweeps = sweep_count.load(Ordering::SeqCst), "buffer sweeper stopped");
                break;
            }
        }
    }
}
