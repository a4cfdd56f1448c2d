//! Audio Fan-Out
//!
//! The single entry point for every PCM chunk, remote or local. Each frame
//! runs through the optional equalizer chain, lands in the source's sliding
//! analysis window and capture ring, produces a level sample, and reaches
//! any registered live-broadcast tap.
//!
//! ```text
//! supervisor reader ──┐
//!                     ├── sink channel ──▶ fan-out thread ──▶ analysis window
//! local capture ──────┘                        │              capture ring
//!                                              │              level channel
//!                                              └─────────────▶ broadcast tap
//! ```
//!
//! Write failures are tracked per source over a sliding window; a source
//! exceeding the threshold is flagged degraded, which its supervisor picks
//! up on the next health pass.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use perch_dsp::FilterChain;

use crate::analysis::{AnalysisBuffers, AnalysisChunk};
use crate::cancel::CancelToken;
use crate::capture::{CaptureBuffers, DEFAULT_CAPTURE_SECONDS};
use crate::config::{EqualizerConfig, PcmFormat};
use crate::error::CoreResult;
use crate::level::{level_sample, AudioLevel, LevelChannel, LevelSender};
use crate::source::SourceId;

/// Write failures within the window before a source counts as degraded
const DEGRADED_THRESHOLD: u32 = 10;

/// Sliding window for failure counting
const DEGRADED_WINDOW: Duration = Duration::from_secs(60);

/// One PCM chunk travelling from a reader to the fan-out
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub source_id: SourceId,
    pub display_name: String,
    pub pcm: Vec<u8>,
}

/// The channel type every reader sends into.
///
/// Owned by the host; readers only ever hold the sending half and never
/// close it.
pub type AudioSink = Sender<AudioFrame>;

/// Live-audio tap invoked with every ingested chunk for a source
pub type BroadcastFn = Box<dyn Fn(&SourceId, &[u8]) + Send + Sync>;

struct FailureWindow {
    count: u32,
    window_start: Instant,
}

/// Routes every ingested frame into the analysis, capture, and level paths
pub struct AudioFanout {
    format: PcmFormat,
    analysis: AnalysisBuffers,
    capture: CaptureBuffers,
    levels: LevelSender,
    eq: Option<EqualizerConfig>,
    filters: Mutex<HashMap<SourceId, FilterChain>>,
    broadcast: RwLock<HashMap<SourceId, BroadcastFn>>,
    failures: Mutex<HashMap<SourceId, FailureWindow>>,
}

impl AudioFanout {
    /// Build the fan-out plus the consumer ends of the analysis chunk and
    /// level channels.
    pub fn new(
        format: PcmFormat,
        equalizer: Option<EqualizerConfig>,
    ) -> (Self, Receiver<AnalysisChunk>, Receiver<AudioLevel>) {
        let (analysis, analysis_rx) = AnalysisBuffers::new(format);
        let capture = CaptureBuffers::new(format);
        let (levels, level_rx) = LevelChannel::new();

        let eq = equalizer.filter(|c| c.enabled && !c.filters.is_empty());

        (
            Self {
                format,
                analysis,
                capture,
                levels,
                eq,
                filters: Mutex::new(HashMap::new()),
                broadcast: RwLock::new(HashMap::new()),
                failures: Mutex::new(HashMap::new()),
            },
            analysis_rx,
            level_rx,
        )
    }

    /// Allocate the analysis window and capture ring for a source.
    ///
    /// All-or-nothing: a capture allocation failure rolls back the analysis
    /// window so re-adding the stream starts clean.
    pub fn allocate_buffers(&self, source_id: &SourceId) -> CoreResult<()> {
        self.analysis.allocate(source_id)?;
        if let Err(e) = self.capture.allocate(source_id, DEFAULT_CAPTURE_SECONDS) {
            let _ = self.analysis.remove(source_id);
            return Err(e);
        }
        debug!(source = %source_id, "allocated analysis and capture buffers");
        Ok(())
    }

    /// Remove both buffers, the filter state, and the failure bookkeeping.
    pub fn remove_buffers(&self, source_id: &SourceId) -> CoreResult<()> {
        let analysis = self.analysis.remove(source_id);
        let capture = self.capture.remove(source_id);
        self.filters.lock().remove(source_id);
        self.failures.lock().remove(source_id);
        self.broadcast.write().remove(source_id);
        // Either half missing means the allocation invariant was already
        // broken; surface the first error.
        analysis.and(capture)
    }

    pub fn has_buffers(&self, source_id: &SourceId) -> bool {
        self.analysis.has_buffer(source_id) && self.capture.has_buffer(source_id)
    }

    /// Register the live-broadcast tap for a source.
    pub fn register_broadcast(&self, source_id: &SourceId, tap: BroadcastFn) {
        self.broadcast.write().insert(source_id.clone(), tap);
    }

    pub fn unregister_broadcast(&self, source_id: &SourceId) {
        self.broadcast.write().remove(source_id);
    }

    /// Ingest one frame: equalize, buffer, meter, broadcast.
    pub fn ingest(&self, mut frame: AudioFrame) {
        if self.eq.is_some() {
            self.apply_filters(&frame.source_id, &mut frame.pcm);
        }

        let mut failed = false;

        match self.analysis.write(&frame.source_id, &frame.pcm) {
            Ok(0) => {}
            Ok(_dropped) => failed = true,
            Err(e) => {
                debug!(source = %frame.source_id, error = %e, "analysis write failed");
                failed = true;
            }
        }

        if let Err(e) = self.capture.write(&frame.source_id, &frame.pcm) {
            debug!(source = %frame.source_id, error = %e, "capture write failed");
            failed = true;
        }

        if failed {
            self.record_failure(&frame.source_id);
        }

        self.levels.send(level_sample(
            &frame.source_id,
            &frame.display_name,
            &frame.pcm,
        ));

        let broadcast = self.broadcast.read();
        if let Some(tap) = broadcast.get(&frame.source_id) {
            tap(&frame.source_id, &frame.pcm);
        }
    }

    fn apply_filters(&self, source_id: &SourceId, pcm: &mut [u8]) {
        let eq = match &self.eq {
            Some(eq) => eq,
            None => return,
        };

        let mut filters = self.filters.lock();
        if !filters.contains_key(source_id) {
            match FilterChain::from_specs(&eq.filters, self.format.sample_rate as f32) {
                Ok(chain) => {
                    filters.insert(source_id.clone(), chain);
                }
                Err(e) => {
                    warn!(source = %source_id, error = %e, "equalizer chain unavailable");
                    return;
                }
            }
        }
        if let Some(chain) = filters.get_mut(source_id) {
            chain.process_s16le(pcm);
        }
    }

    fn record_failure(&self, source_id: &SourceId) {
        let mut failures = self.failures.lock();
        let entry = failures.entry(source_id.clone()).or_insert(FailureWindow {
            count: 0,
            window_start: Instant::now(),
        });
        if entry.window_start.elapsed() > DEGRADED_WINDOW {
            entry.count = 0;
            entry.window_start = Instant::now();
        }
        entry.count += 1;
        if entry.count == DEGRADED_THRESHOLD {
            warn!(source = %source_id, failures = entry.count, "source marked degraded");
        }
    }

    /// Whether a source crossed the failure threshold inside the current
    /// window. Observed by the owning supervisor.
    pub fn is_degraded(&self, source_id: &SourceId) -> bool {
        let failures = self.failures.lock();
        failures
            .get(source_id)
            .map(|f| f.window_start.elapsed() <= DEGRADED_WINDOW && f.count >= DEGRADED_THRESHOLD)
            .unwrap_or(false)
    }

    /// Read a window of captured PCM (extraction API passthrough).
    pub fn read_capture_window(
        &self,
        source_id: &SourceId,
        end: chrono::DateTime<chrono::Utc>,
        width: Duration,
    ) -> CoreResult<Vec<u8>> {
        self.capture.read_window(source_id, end, width)
    }

    /// Return an analysis chunk's backing buffer to the pool.
    pub fn recycle_chunk(&self, buf: Vec<u8>) {
        self.analysis.recycle(buf)
    }

    /// Drain the sink channel on a named thread, ingesting every frame.
    ///
    /// Exits when the token is cancelled or every sender is gone.
    pub fn spawn_consumer(
        self: &Arc<Self>,
        rx: Receiver<AudioFrame>,
        token: CancelToken,
    ) -> std::io::Result<JoinHandle<()>> {
        let fanout = Arc::clone(self);
        thread::Builder::new()
            .name("perch-fanout".into())
            .spawn(move || {
                info!("fan-out consumer started");
                loop {
                    match rx.recv_timeout(Duration::from_millis(250)) {
                        Ok(frame) => fanout.ingest(frame),
                        Err(RecvTimeoutError::Timeout) => {
                            if token.is_cancelled() {
                                break;
                            }
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                info!(cause = ?token.cause(), "fan-out consumer exiting");
            })
    }
}
