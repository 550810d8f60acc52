//! Time-bounded chunk store backing the HTTP `poll` façade.
//!
//! Entries are keyed by request id and partitioned across independently
//! locked shards. Every operation on one entry happens under its shard lock,
//! so a poll racing an eviction sees either the whole entry or `NotFound`.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rkgate_core::{is_idle_past_ttl, SharedClock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::rpc_protocol_runtime::RequestId;

pub const DEFAULT_BUFFER_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const BUFFER_SHARD_COUNT: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpBufferConfig {
    pub ttl: Duration,
    pub sweep_interval: Duration,
    /// Remove an entry once a poll acknowledges its terminal chunk instead
    /// of waiting for TTL eviction.
    pub drop_acknowledged: bool,
}

impl Default for HttpBufferConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_BUFFER_TTL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            drop_acknowledged: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BufferedChunk {
    pub seq: u64,
    pub payload: Value,
    pub end: bool,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BufferError {
    #[error("http buffer manager is not initialized")]
    NotInitialized,
    #[error("no buffer for request id {0}")]
    NotFound(RequestId),
    #[error("chunk seq {seq} for request id {request_id} does not follow seq {last_seq}")]
    OutOfOrder {
        request_id: RequestId,
        last_seq: u64,
        seq: u64,
    },
    #[error("chunk seq {seq} for request id {request_id} arrived after the terminal chunk")]
    AppendAfterEnd { request_id: RequestId, seq: u64 },
    #[error("http buffer shard lock poisoned")]
    LockPoisoned,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BufferDrain {
    pub chunks: Vec<BufferedChunk>,
    /// True once the terminal chunk has been appended.
    pub end: bool,
    /// Cursor for the next poll: the last returned seq, or the input cursor.
    pub next_since_seq: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BufferManagerStatus {
    pub initialized: bool,
    pub active_buffers: usize,
    pub buffered_chunks: usize,
    pub ttl_ms: u64,
    pub sweep_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EvictionReport {
    pub evicted: Vec<RequestId>,
    pub evicted_unterminated: usize,
    pub remaining: usize,
}

#[derive(Debug)]
struct BufferEntry {
    chunks: Vec<BufferedChunk>,
    created_at_ms: u64,
    last_activity_at_ms: u64,
    ended: bool,
}

impl BufferEntry {
    fn last_seq(&self) -> Option<u64> {
        self.chunks.last().map(|chunk| chunk.seq)
    }
}

#[derive(Debug)]
pub struct HttpBufferManager {
    config: HttpBufferConfig,
    clock: SharedClock,
    initialized: AtomicBool,
    shards: Vec<BufferShard>,
}

impl HttpBufferManager {
    pub fn new(config: HttpBufferConfig, clock: SharedClock) -> Self {
        let shards = (0..BUFFER_SHARD_COUNT)
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        Self {
            config,
            clock,
            initialized: AtomicBool::new(false),
            shards,
        }
    }

    /// Convenience for callers that do not need a separate init step.
    pub fn initialized(config: HttpBufferConfig, clock: SharedClock) -> Self {
        let manager = Self::new(config, clock);
        manager.initialize();
        manager
    }

    pub fn initialize(&self) {
        self.initialized.store(true, Ordering::SeqCst);
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Marks the manager uninitialized and drops every entry. Returns how
    /// many entries were dropped.
    pub fn shutdown(&self) -> usize {
        self.initialized.store(false, Ordering::SeqCst);
        let mut dropped = 0_usize;
        for shard in &self.shards {
            let mut entries = lock_shard_recovering(shard);
            dropped = dropped.saturating_add(entries.len());
            entries.clear();
        }
        dropped
    }

    pub fn config(&self) -> HttpBufferConfig {
        self.config
    }

    /// Appends the next chunk for `request_id`. A seq 0 chunk creates the
    /// entry if absent; any later chunk fails with `NotFound` once the entry
    /// has been evicted.
    pub fn append(&self, request_id: &RequestId, chunk: BufferedChunk) -> Result<(), BufferError> {
        self.ensure_initialized()?;
        let now_ms = self.clock.now_unix_ms();
        let mut entries = self.shard_for(request_id)?;
        // Only a stream's first chunk may create its entry. A later chunk with
        // no entry belongs to an evicted stream and must not restart it mid-way.
        if chunk.seq != 0 && !entries.contains_key(request_id) {
            return Err(BufferError::NotFound(request_id.clone()));
        }
        let entry = entries
            .entry(request_id.clone())
            .or_insert_with(|| BufferEntry {
                chunks: Vec::new(),
                created_at_ms: now_ms,
                last_activity_at_ms: now_ms,
                ended: false,
            });
        if entry.ended {
            return Err(BufferError::AppendAfterEnd {
                request_id: request_id.clone(),
                seq: chunk.seq,
            });
        }
        if let Some(last_seq) = entry.last_seq() {
            if chunk.seq <= last_seq {
                return Err(BufferError::OutOfOrder {
                    request_id: request_id.clone(),
                    last_seq,
                    seq: chunk.seq,
                });
            }
        }
        entry.ended = chunk.end;
        entry.last_activity_at_ms = now_ms;
        entry.chunks.push(chunk);
        Ok(())
    }

    /// Returns every chunk with `seq > since_seq` without removing anything,
    /// so repeating a poll with the same cursor replays the same chunks.
    pub fn drain(&self, request_id: &RequestId, since_seq: i64) -> Result<BufferDrain, BufferError> {
        self.ensure_initialized()?;
        let now_ms = self.clock.now_unix_ms();
        let mut entries = self.shard_for(request_id)?;
        let entry = entries
            .get_mut(request_id)
            .ok_or_else(|| BufferError::NotFound(request_id.clone()))?;
        entry.last_activity_at_ms = now_ms;

        // Chunks are stored in seq order, so the suffix after the cursor is
        // exactly the unseen part.
        let start = entry
            .chunks
            .partition_point(|chunk| i128::from(chunk.seq) <= i128::from(since_seq));
        let chunks = entry.chunks[start..].to_vec();
        let next_since_seq = chunks
            .last()
            .and_then(|chunk| i64::try_from(chunk.seq).ok())
            .unwrap_or(since_seq);
        let end = entry.ended;

        let acknowledged = end
            && chunks.is_empty()
            && entry
                .last_seq()
                .map(|last| i128::from(since_seq) >= i128::from(last))
                .unwrap_or(false);
        if acknowledged && self.config.drop_acknowledged {
            entries.remove(request_id);
        }

        Ok(BufferDrain {
            chunks,
            end,
            next_since_seq,
        })
    }

    /// Starts an empty entry for `request_id`, replacing any entry retained
    /// from an earlier stream with the same id. Returns whether one was replaced.
    pub fn reset_entry(&self, request_id: &RequestId) -> Result<bool, BufferError> {
        self.ensure_initialized()?;
        let now_ms = self.clock.now_unix_ms();
        let mut entries = self.shard_for(request_id)?;
        let replaced = entries.insert(
            request_id.clone(),
            BufferEntry {
                chunks: Vec::new(),
                created_at_ms: now_ms,
                last_activity_at_ms: now_ms,
                ended: false,
            },
        );
        Ok(replaced.is_some())
    }

    pub fn contains(&self, request_id: &RequestId) -> bool {
        self.shard_for(request_id)
            .map(|entries| entries.contains_key(request_id))
            .unwrap_or(false)
    }

    pub fn status(&self) -> BufferManagerStatus {
        let mut active_buffers = 0_usize;
        let mut buffered_chunks = 0_usize;
        for shard in &self.shards {
            let entries = lock_shard_recovering(shard);
            active_buffers = active_buffers.saturating_add(entries.len());
            buffered_chunks = buffered_chunks.saturating_add(
                entries.values().map(|entry| entry.chunks.len()).sum::<usize>(),
            );
        }
        BufferManagerStatus {
            initialized: self.is_initialized(),
            active_buffers,
            buffered_chunks,
            ttl_ms: duration_ms(self.config.ttl),
            sweep_interval_ms: duration_ms(self.config.sweep_interval),
        }
    }

    /// Removes every entry idle for longer than the TTL, finished or not.
    pub fn evict_expired(&self) -> Result<EvictionReport, BufferError> {
        let now_ms = self.clock.now_unix_ms();
        let mut evicted = Vec::new();
        let mut evicted_unterminated = 0_usize;
        let mut remaining = 0_usize;
        for shard in &self.shards {
            let mut entries = shard.lock().map_err(|_| BufferError::LockPoisoned)?;
            entries.retain(|request_id, entry| {
                if is_idle_past_ttl(entry.last_activity_at_ms, now_ms, self.config.ttl) {
                    if !entry.ended {
                        evicted_unterminated = evicted_unterminated.saturating_add(1);
                        tracing::warn!(
                            request_id = %request_id,
                            buffered = entry.chunks.len(),
                            age_ms = now_ms.saturating_sub(entry.created_at_ms),
                            "evicting unterminated stream buffer"
                        );
                    }
                    evicted.push(request_id.clone());
                    false
                } else {
                    true
                }
            });
            remaining = remaining.saturating_add(entries.len());
        }
        Ok(EvictionReport {
            evicted,
            evicted_unterminated,
            remaining,
        })
    }

    fn ensure_initialized(&self) -> Result<(), BufferError> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(BufferError::NotInitialized)
        }
    }

    fn shard_for(
        &self,
        request_id: &RequestId,
    ) -> Result<MutexGuard<'_, HashMap<RequestId, BufferEntry>>, BufferError> {
        let mut hasher = DefaultHasher::new();
        request_id.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.shards.len();
        self.shards[index]
            .lock()
            .map_err(|_| BufferError::LockPoisoned)
    }
}

type BufferShard = Mutex<HashMap<RequestId, BufferEntry>>;

/// Used by whole-manager operations that must account for every shard. Shard
/// maps hold no cross-entry invariants, so the data behind a poisoned lock is
/// still usable.
fn lock_shard_recovering(shard: &BufferShard) -> MutexGuard<'_, HashMap<RequestId, BufferEntry>> {
    shard.lock().unwrap_or_else(|poisoned| {
        tracing::error!("http buffer shard lock poisoned; recovering shard contents");
        poisoned.into_inner()
    })
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
