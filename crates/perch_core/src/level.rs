//! Audio Level Telemetry
//!
//! Per-chunk RMS levels scaled to 0-100, with clip detection, delivered
//! through a bounded best-effort channel. Consumers are advisory (UI,
//! metrics); when nobody keeps up, old samples are shed and only the newest
//! survives.

use crossbeam_channel::{Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};

use crate::source::SourceId;

/// Queue depth of the level channel
const LEVEL_QUEUE_DEPTH: usize = 64;

/// One level sample. The field names are wire-stable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioLevel {
    /// Scaled level 0-100
    pub level: u8,

    /// True when any sample in the chunk hit full scale
    pub clipping: bool,

    /// Stable source ID
    pub source: String,

    /// Sanitized display name
    pub name: String,
}

/// Compute the scaled level and clip flag for a chunk of s16le PCM.
///
/// `rms = sqrt(sum(s^2)/N)`, `db = 20*log10(rms/32768)`, scaled as
/// `(db + 60) * 2` and clamped to 0-100. Full-scale samples force the level
/// to at least 95 and set the clip flag.
pub fn compute_level(pcm: &[u8]) -> (u8, bool) {
    let samples = pcm.len() / 2;
    if samples == 0 {
        return (0, false);
    }

    let mut sum_squares = 0.0f64;
    let mut clipping = false;
    for frame in pcm.chunks_exact(2) {
        let s = i16::from_le_bytes([frame[0], frame[1]]);
        if s == i16::MAX || s == i16::MIN {
            clipping = true;
        }
        let v = s as f64;
        sum_squares += v * v;
    }

    let rms = (sum_squares / samples as f64).sqrt();
    let mut scaled = if rms > 0.0 {
        let db = 20.0 * (rms / 32768.0).log10();
        ((db + 60.0) * 2.0).clamp(0.0, 100.0)
    } else {
        0.0
    };

    if clipping && scaled < 95.0 {
        scaled = 95.0;
    }

    (scaled.round() as u8, clipping)
}

/// Sending half of the level channel
///
/// Holds a receiver clone of its own channel so a stalled queue can be shed
/// from the producer side (crossbeam channels are MPMC).
#[derive(Clone)]
pub struct LevelSender {
    tx: Sender<AudioLevel>,
    drain: Receiver<AudioLevel>,
}

impl LevelSender {
    /// Non-blocking send. When the queue is full, drain it and post the
    /// newest sample; stale levels are worthless.
    pub fn send(&self, level: AudioLevel) {
        match self.tx.try_send(level) {
            Ok(()) => {}
            Err(TrySendError::Full(newest)) => {
                while self.drain.try_recv().is_ok() {}
                let _ = self.tx.try_send(newest);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

/// Bounded best-effort channel for level samples
pub struct LevelChannel;

impl LevelChannel {
    /// Create the channel pair.
    pub fn new() -> (LevelSender, Receiver<AudioLevel>) {
        Self::with_depth(LEVEL_QUEUE_DEPTH)
    }

    /// Channel pair with an explicit depth (tests use small queues).
    pub fn with_depth(depth: usize) -> (LevelSender, Receiver<AudioLevel>) {
        let (tx, rx) = crossbeam_channel::bounded(depth);
        (
            LevelSender {
                tx,
                drain: rx.clone(),
            },
            rx,
        )
    }
}

/// Build the level sample for a chunk.
pub fn level_sample(source_id: &SourceId, name: &str, pcm: &[u8]) -> AudioLevel {
    let (level, clipping) = compute_level(pcm);
    AudioLevel {
        level,
        clipping,
        source: source_id.to_string(),
        name: name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm_of(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn test_silence_is_zero() {
        let pcm = pcm_of(&[0i16; 480]);
        let (level, clipping) = compute_level(&pcm);
        assert_eq!(level, 0);
        assert!(!clipping);
    }

    #[test]
    fn test_empty_chunk_is_zero() {
        assert_eq!(compute_level(&[]), (0, false));
    }

    #[test]
    fn test_full_scale_sine_is_loud() {
        // Constant near-full-scale magnitude: rms = 30000,
        // db = 20*log10(30000/32768) = -0.766, scaled = 118.5 -> 100.
        let pcm = pcm_of(&[30000i16; 480]);
        let (level, clipping) = compute_level(&pcm);
        assert_eq!(level, 100);
        assert!(!clipping);
    }

    #[test]
    fn test_quiet_signal_scales_down() {
        // rms = 328 -> db = -40, scaled = 40.
        let pcm = pcm_of(&[328i16; 480]);
        let (level, clipping) = compute_level(&pcm);
        assert!((39..=41).contains(&level), "level {}", level);
        assert!(!clipping);
    }

    #[test]
    fn test_clipping_forces_floor() {
        // One clipped sample in otherwise quiet audio.
        let mut samples = vec![100i16; 479];
        samples.push(i16::MAX);
        let (level, clipping) = compute_level(&pcm_of(&samples));
        assert!(clipping);
        assert!(level >= 95);

        let mut samples = vec![100i16; 479];
        samples.push(i16::MIN);
        let (_, clipping) = compute_level(&pcm_of(&samples));
        assert!(clipping);
    }

    #[test]
    fn test_wire_format_field_names() {
        let level = AudioLevel {
            level: 42,
            clipping: false,
            source: "src_0001".into(),
            name: "rtsp://cam/live".into(),
        };
        let json = serde_json::to_string(&level).unwrap();
        assert_eq!(
            json,
            r#"{"level":42,"clipping":false,"source":"src_0001","name":"rtsp://cam/live"}"#
        );
    }

    #[test]
    fn test_send_never_blocks_when_full() {
        let (tx, rx) = LevelChannel::with_depth(2);
        for i in 0..10u8 {
            tx.send(AudioLevel {
                level: i,
                clipping: false,
                source: "s".into(),
                name: "n".into(),
            });
        }
        // The queue holds at most 2; whatever is there is recent.
        let drained: Vec<AudioLevel> = rx.try_iter().collect();
        assert!(drained.len() <= 2);
        assert!(!drained.is_empty());
    }

    #[test]
    fn test_send_to_disconnected_is_silent() {
        let (tx, rx) = LevelChannel::new();
        drop(rx);
        tx.send(AudioLevel {
            level: 1,
            clipping: false,
            source: "s".into(),
            name: "n".into(),
        });
    }
}
