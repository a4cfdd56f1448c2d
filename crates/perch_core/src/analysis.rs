//! Sliding Analysis Buffers
//!
//! One window per source. Incoming PCM accumulates until a full analysis
//! chunk (default 3 s) is available, which is then copied into a pool-backed
//! buffer and handed to the analysis consumer. The last 2 s of every emitted
//! chunk are retained as the head of the next one, so consecutive chunks
//! overlap and a call is never split across chunk boundaries.
//!
//! The writer is the supervisor's reader thread; the per-source window has a
//! dedicated lock so writers for different sources never contend. The outer
//! map lock is held only for insert/remove/lookup.

use std::collections::HashMap;
use std::sync::OnceLock;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use tracing::warn;

use crate::config::PcmFormat;
use crate::error::{CoreError, CoreResult};
use crate::pool::{BufferPool, PoolStats};
use crate::source::SourceId;

/// Seconds of audio per analysis chunk
pub const CHUNK_SECONDS: u64 = 3;

/// Seconds of overlap carried between consecutive chunks
pub const OVERLAP_SECONDS: u64 = 2;

/// Chunks queued to the consumer before writers start dropping
const CONSUMER_QUEUE_DEPTH: usize = 8;

/// One warning per this many dropped writes, per source
const DROP_WARN_EVERY: u64 = 32;

/// A complete analysis chunk
///
/// `data` is a pool-backed buffer of exactly one chunk. Return it through
/// [`AnalysisBuffers::recycle`] once the consumer is done with it.
#[derive(Debug)]
pub struct AnalysisChunk {
    pub source_id: SourceId,
    pub data: Vec<u8>,
}

struct AnalysisParams {
    chunk_bytes: usize,
    overlap_bytes: usize,
    capacity: usize,
    pool: BufferPool,
}

struct SlidingWindow {
    buf: Vec<u8>,
    drops: u64,
}

impl SlidingWindow {
    fn new() -> Self {
        Self {
            buf: Vec::new(),
            drops: 0,
        }
    }
}

/// Per-source sliding windows feeding the analysis consumer
pub struct AnalysisBuffers {
    format: PcmFormat,
    params: OnceLock<AnalysisParams>,
    windows: RwLock<HashMap<SourceId, Mutex<SlidingWindow>>>,
    consumer: Sender<AnalysisChunk>,
}

impl AnalysisBuffers {
    /// Create the buffer set and the consumer end of the chunk channel.
    pub fn new(format: PcmFormat) -> (Self, Receiver<AnalysisChunk>) {
        let (tx, rx) = crossbeam_channel::bounded(CONSUMER_QUEUE_DEPTH);
        (
            Self {
                format,
                params: OnceLock::new(),
                windows: RwLock::new(HashMap::new()),
                consumer: tx,
            },
            rx,
        )
    }

    // Chunk parameters and the pool initialize exactly once, on the first
    // allocate, no matter how many sources race to be first.
    fn params(&self) -> &AnalysisParams {
        self.params.get_or_init(|| {
            let chunk_bytes = self.format.bytes_for(CHUNK_SECONDS);
            let overlap_bytes = self.format.bytes_for(OVERLAP_SECONDS);
            AnalysisParams {
                chunk_bytes,
                overlap_bytes,
                capacity: chunk_bytes * 3,
                // Pool size is valid by construction: chunk_bytes > 0 for
                // any non-degenerate format.
                pool: BufferPool::new(chunk_bytes).unwrap_or_else(|_| {
                    unreachable!("chunk size is nonzero for a valid PcmFormat")
                }),
            }
        })
    }

    /// Allocate the sliding window for a source.
    ///
    /// Idempotent: allocating an existing source is an error the caller can
    /// treat as already-done; exactly one window exists per source.
    pub fn allocate(&self, source_id: &SourceId) -> CoreResult<()> {
        let _ = self.params();
        let mut windows = self.windows.write();
        if windows.contains_key(source_id) {
            return Err(CoreError::BufferExists(source_id.to_string()));
        }
        windows.insert(source_id.clone(), Mutex::new(SlidingWindow::new()));
        Ok(())
    }

    /// Remove a source's window, discarding unconsumed bytes.
    pub fn remove(&self, source_id: &SourceId) -> CoreResult<()> {
        self.windows
            .write()
            .remove(source_id)
            .map(|_| ())
            .ok_or_else(|| CoreError::BufferNotFound(source_id.to_string()))
    }

    pub fn has_buffer(&self, source_id: &SourceId) -> bool {
        self.windows.read().contains_key(source_id)
    }

    /// Write PCM into a source's window, emitting any completed chunks.
    ///
    /// Returns the number of bytes dropped (0 for a clean write). Oldest
    /// data is dropped first when the consumer stalls and the window fills.
    pub fn write(&self, source_id: &SourceId, data: &[u8]) -> CoreResult<usize> {
        let params = self.params();
        let windows = self.windows.read();
        let window = windows
            .get(source_id)
            .ok_or_else(|| CoreError::BufferNotFound(source_id.to_string()))?;

        let mut w = window.lock();
        let mut dropped = 0usize;

        // Drop oldest first if this write would overflow the window.
        let incoming = data.len().min(params.capacity);
        let overflow = (w.buf.len() + incoming).saturating_sub(params.capacity);
        if overflow > 0 {
            w.buf.drain(..overflow);
            dropped += overflow;
        }
        // A single write larger than the whole window keeps only its tail.
        dropped += data.len() - incoming;
        w.buf.extend_from_slice(&data[data.len() - incoming..]);

        // Emit every complete chunk, keeping the overlap tail in place.
        while w.buf.len() >= params.chunk_bytes {
            let mut chunk = params.pool.get();
            chunk.copy_from_slice(&w.buf[..params.chunk_bytes]);

            match self.consumer.try_send(AnalysisChunk {
                source_id: source_id.clone(),
                data: chunk,
            }) {
                Ok(()) => {
                    w.buf.drain(..params.chunk_bytes - params.overlap_bytes);
                }
                Err(TrySendError::Full(stalled)) => {
                    // Consumer stalled: recycle the copy and shed the oldest
                    // non-overlap span so the window keeps moving.
                    params.pool.put(stalled.data);
                    let shed = params.chunk_bytes - params.overlap_bytes;
                    w.buf.drain(..shed);
                    dropped += shed;
                }
                Err(TrySendError::Disconnected(gone)) => {
                    params.pool.put(gone.data);
                    return Err(CoreError::ChannelSendError);
                }
            }
        }

        if dropped > 0 {
            w.drops += 1;
            if w.drops % DROP_WARN_EVERY == 1 {
                warn!(
                    source = %source_id,
                    dropped_bytes = dropped,
                    total_dropped_writes = w.drops,
                    "analysis window overflow, dropping oldest audio"
                );
            }
        }

        Ok(dropped)
    }

    /// Return a consumed chunk's backing buffer to the pool.
    pub fn recycle(&self, buf: Vec<u8>) {
        if let Some(params) = self.params.get() {
            params.pool.put(buf);
        }
    }

    pub fn pool_stats(&self) -> Option<PoolStats> {
        self.params.get().map(|p| p.pool.stats())
    }

    /// Chunk size in bytes once parameters are initialized
    pub fn chunk_bytes(&self) -> usize {
        self.params().chunk_bytes
    }

    /// Overlap size in bytes once parameters are initialized
    pub fn overlap_bytes(&self) -> usize {
        self.params().overlap_bytes
    }
}
