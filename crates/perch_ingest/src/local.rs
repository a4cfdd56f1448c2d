//! Local Sound-Card Capture
//!
//! Drives one OS audio input device through CPAL and feeds captured PCM
//! into the same audio sink the remote supervisors use, under the same
//! atomic send gate. The CPAL callback must not allocate or block, so it
//! pushes raw bytes into an rtrb ring; the drain loop on the capture
//! thread batches them into frames.
//!
//! CPAL streams are not `Send`, so everything device-facing lives on the
//! thread that calls `run`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, SampleRate, StreamConfig};
use crossbeam_channel::Receiver;
use rtrb::RingBuffer;
use tracing::{info, warn};

use perch_core::{AudioFrame, AudioSink, CancelToken, PcmFormat, SourceId};

use crate::error::{IngestError, IngestResult};

/// Well-known source ID for the local capture
pub const LOCAL_SOURCE_ID: &str = "local";

/// Drain cadence for the callback ring
const DRAIN_INTERVAL: Duration = Duration::from_millis(50);

/// In-place stream rebuilds before failure escalates to the owner
const MAX_DEVICE_RESTARTS: u32 = 3;

/// Events out of the CPAL callbacks
enum CaptureEvent {
    Error(String),
}

/// Local capture configuration
#[derive(Debug, Clone)]
pub struct LocalCaptureConfig {
    /// Device selector from `realtime.audio.source`; empty means default
    pub device: String,

    /// Target PCM format (capture is converted to this)
    pub format: PcmFormat,
}

/// Captures from one local audio device into the audio sink
pub struct LocalCapture {
    config: LocalCaptureConfig,
    source_id: SourceId,
    sink: AudioSink,

    /// Fast-path send gate, same discipline as the stream supervisor
    running: AtomicBool,
    token: CancelToken,

    /// Raised when the device fails past the in-place restart budget
    on_failure: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl LocalCapture {
    pub fn new(
        config: LocalCaptureConfig,
        sink: AudioSink,
        on_failure: Option<Arc<dyn Fn() + Send + Sync>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            source_id: SourceId::new(LOCAL_SOURCE_ID),
            sink,
            running: AtomicBool::new(true),
            token: CancelToken::new(),
            on_failure,
        })
    }

    pub fn source_id(&self) -> &SourceId {
        &self.source_id
    }

    /// Resolve the configured selector to a CPAL input device.
    ///
    /// Empty and `default` select the platform default. `sysdefault` is an
    /// ALSA name; off Linux it maps to the platform default as well.
    fn select_device(selector: &str) -> IngestResult<Device> {
        let host = cpal::default_host();

        let wants_default = selector.is_empty()
            || selector == "default"
            || (selector == "sysdefault" && !cfg!(target_os = "linux"));
        if wants_default {
            return host
                .default_input_device()
                .ok_or_else(|| IngestError::DeviceNotFound("default".into()));
        }

        let devices = host
            .input_devices()
            .map_err(|e| IngestError::DeviceError {
                device: selector.into(),
                reason: e.to_string(),
            })?;

        for device in devices {
            if let Ok(name) = device.name() {
                if name == selector || name.contains(selector) {
                    return Ok(device);
                }
            }
        }
        Err(IngestError::DeviceNotFound(selector.into()))
    }

    /// Validate a selector by briefly opening and starting the device.
    pub fn validate_device(selector: &str, format: PcmFormat) -> IngestResult<()> {
        let device = Self::select_device(selector)?;
        let (stream, _rx) = Self::build_stream(&device, format)?;
        stream.play().map_err(|e| IngestError::DeviceError {
            device: selector.into(),
            reason: e.to_string(),
        })?;
        drop(stream);
        Ok(())
    }

    /// Build the input stream and the ring consumer feeding the drain loop.
    fn build_stream(
        device: &Device,
        format: PcmFormat,
    ) -> IngestResult<(cpal::Stream, CaptureStreams)> {
        let device_name = device.name().unwrap_or_else(|_| "unknown".into());

        let supported = device
            .default_input_config()
            .map_err(|e| IngestError::DeviceError {
                device: device_name.clone(),
                reason: e.to_string(),
            })?;

        let config = StreamConfig {
            channels: format.channels,
            sample_rate: SampleRate(format.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        // Two seconds of headroom between the callback and the drain loop.
        let ring_bytes = format.byte_rate() * 2;
        let (producer, consumer) = RingBuffer::<u8>::new(ring_bytes);
        let (event_tx, event_rx) = crossbeam_channel::bounded::<CaptureEvent>(8);
        let err_tx = event_tx.clone();

        let err_fn = move |err: cpal::StreamError| {
            let _ = err_tx.try_send(CaptureEvent::Error(err.to_string()));
        };

        let stream = match supported.sample_format() {
            SampleFormat::I16 => {
                let mut producer = producer;
                device.build_input_stream(
                    &config,
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        push_bytes(&mut producer, data.iter().map(|s| s.to_le_bytes()));
                    },
                    err_fn,
                    None,
                )
            }
            SampleFormat::F32 => {
                let mut producer = producer;
                device.build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        push_bytes(
                            &mut producer,
                            data.iter()
                                .map(|s| ((s.clamp(-1.0, 1.0) * 32767.0) as i16).to_le_bytes()),
                        );
                    },
                    err_fn,
                    None,
                )
            }
            other => {
                return Err(IngestError::DeviceError {
                    device: device_name,
                    reason: format!("unsupported sample format {:?}", other),
                })
            }
        }
        .map_err(|e| IngestError::DeviceError {
            device: device_name,
            reason: e.to_string(),
        })?;

        Ok((
            stream,
            CaptureStreams {
                consumer,
                events: event_rx,
            },
        ))
    }

    /// Run the capture until the parent is cancelled or `stop()` is called.
    ///
    /// Must be called on a thread that can own the CPAL stream for its
    /// whole life. On device failure the stream is rebuilt in place up to
    /// a small budget; past that the failure callback is raised and run
    /// returns.
    pub fn run(self: &Arc<Self>, parent: &CancelToken) -> IngestResult<()> {
        parent.adopt_child(&self.token);

        let device = Self::select_device(&self.config.device)?;
        let device_name = device.name().unwrap_or_else(|_| "unknown".into());
        info!(device = %device_name, "local capture starting");

        let mut restarts: u32 = 0;
        let mut active = self.open(&device)?;

        loop {
            if self.token.wait_timeout(DRAIN_INTERVAL) {
                break;
            }

            self.drain(&mut active.streams.consumer);

            let event = active.streams.events.try_recv();
            match event {
                Ok(CaptureEvent::Error(reason)) => {
                    warn!(device = %device_name, error = %reason, "capture stream error");
                    drop(active);

                    restarts += 1;
                    if restarts > MAX_DEVICE_RESTARTS {
                        warn!(
                            device = %device_name,
                            restarts,
                            "capture failing repeatedly, escalating"
                        );
                        if let Some(escalate) = &self.on_failure {
                            escalate();
                        }
                        self.running.store(false, Ordering::SeqCst);
                        self.token
                            .cancel("LocalCapture: device failed past restart budget");
                        return Err(IngestError::DeviceError {
                            device: device_name,
                            reason: "restart budget exhausted".into(),
                        });
                    }

                    info!(device = %device_name, attempt = restarts, "restarting capture in place");
                    active = self.open(&device)?;
                }
                Err(_) => {}
            }
        }

        // Final drain so a clean stop loses nothing already captured.
        self.drain(&mut active.streams.consumer);

        self.running.store(false, Ordering::SeqCst);
        info!(device = %device_name, cause = ?self.token.cause(), "local capture exiting");
        Ok(())
    }

    fn open(&self, device: &Device) -> IngestResult<ActiveCapture> {
        let (stream, streams) = Self::build_stream(device, self.config.format)?;
        stream.play().map_err(|e| IngestError::DeviceError {
            device: device.name().unwrap_or_else(|_| "unknown".into()),
            reason: e.to_string(),
        })?;
        Ok(ActiveCapture { stream, streams })
    }

    /// Move everything the callback buffered into the sink, gated.
    fn drain(&self, consumer: &mut rtrb::Consumer<u8>) {
        let available = consumer.slots();
        if available == 0 {
            return;
        }

        let mut pcm = vec![0u8; available];
        let mut filled = 0usize;
        if let Ok(chunk) = consumer.read_chunk(available) {
            let (first, second) = chunk.as_slices();
            pcm[..first.len()].copy_from_slice(first);
            pcm[first.len()..first.len() + second.len()].copy_from_slice(second);
            filled = first.len() + second.len();
            chunk.commit_all();
        }
        pcm.truncate(filled);

        if pcm.is_empty() {
            return;
        }

        if self.running.load(Ordering::SeqCst) {
            let frame = AudioFrame {
                source_id: self.source_id.clone(),
                display_name: LOCAL_SOURCE_ID.to_string(),
                pcm,
            };
            let _ = self.sink.send(frame);
        }
    }

    /// Stop the capture. Idempotent; the send gate clears first.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.token.cancel("LocalCapture: Stop() called");
    }
}

struct CaptureStreams {
    consumer: rtrb::Consumer<u8>,
    events: Receiver<CaptureEvent>,
}

struct ActiveCapture {
    // Held for its side effect: dropping the stream stops capture.
    #[allow(dead_code)]
    stream: cpal::Stream,
    streams: CaptureStreams,
}

/// Push an iterator of sample byte pairs into the ring, dropping what
/// doesn't fit. No allocation; runs inside the audio callback.
fn push_bytes<I: Iterator<Item = [u8; 2]>>(producer: &mut rtrb::Producer<u8>, samples: I) {
    for pair in samples {
        for b in pair {
            if producer.push(b).is_err() {
                // Ring full: the drain loop fell behind; shed the rest.
                return;
            }
        }
    }
}
