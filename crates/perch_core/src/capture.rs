//! Time-Addressable Capture Rings
//!
//! One ring per source, holding the most recent `D` seconds of PCM (default
//! 60). The ring is stamped with the wall-clock time of its newest byte, so
//! "the window ending at T lasting W seconds" is answerable for as long as
//! that window stays inside the retained range. Extraction (WAV export,
//! on-demand clips) reads under a shared lock; the single writer is the
//! owning supervisor's reader thread.

use std::collections::HashMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;

use crate::config::PcmFormat;
use crate::error::{CoreError, CoreResult};
use crate::source::SourceId;

/// Seconds of audio a capture ring retains by default
pub const DEFAULT_CAPTURE_SECONDS: u64 = 60;

struct CaptureRing {
    data: Vec<u8>,
    /// Next write position
    write_pos: usize,
    /// Bytes written so far, saturating at capacity
    filled: usize,
    /// Bytes of PCM per second
    byte_rate: usize,
    /// Wall-clock time of the newest byte, None until first write
    newest: Option<DateTime<Utc>>,
}

impl CaptureRing {
    fn new(seconds: u64, byte_rate: usize) -> Self {
        Self {
            data: vec![0u8; byte_rate * seconds as usize],
            write_pos: 0,
            filled: 0,
            byte_rate,
            newest: None,
        }
    }

    fn write(&mut self, pcm: &[u8], now: DateTime<Utc>) {
        let cap = self.data.len();
        // A write larger than the ring keeps only its tail.
        let src = if pcm.len() > cap {
            &pcm[pcm.len() - cap..]
        } else {
            pcm
        };

        let first = (cap - self.write_pos).min(src.len());
        self.data[self.write_pos..self.write_pos + first].copy_from_slice(&src[..first]);
        let rest = &src[first..];
        if !rest.is_empty() {
            self.data[..rest.len()].copy_from_slice(rest);
        }

        self.write_pos = (self.write_pos + src.len()) % cap;
        self.filled = (self.filled + src.len()).min(cap);
        self.newest = Some(now);
    }

    /// Copy out the window of `width_bytes` ending `end_offset_bytes` before
    /// the newest byte. Offsets are validated by the caller.
    fn read_back(&self, end_offset_bytes: usize, width_bytes: usize) -> Vec<u8> {
        let cap = self.data.len();
        let mut out = vec![0u8; width_bytes];
        // Position of the first requested byte, counted back from write_pos.
        let back = end_offset_bytes + width_bytes;
        let start = (self.write_pos + cap - (back % cap)) % cap;

        let first = (cap - start).min(width_bytes);
        out[..first].copy_from_slice(&self.data[start..start + first]);
        if first < width_bytes {
            out[first..].copy_from_slice(&self.data[..width_bytes - first]);
        }
        out
    }
}

/// Per-source capture rings
pub struct CaptureBuffers {
    format: PcmFormat,
    rings: RwLock<HashMap<SourceId, RwLock<CaptureRing>>>,
}

impl CaptureBuffers {
    pub fn new(format: PcmFormat) -> Self {
        Self {
            format,
            rings: RwLock::new(HashMap::new()),
        }
    }

    /// Allocate a ring covering `seconds` of audio for a source.
    pub fn allocate(&self, source_id: &SourceId, seconds: u64) -> CoreResult<()> {
        if seconds == 0 {
            return Err(CoreError::InvalidBufferParams(
                "capture ring must cover at least one second".into(),
            ));
        }
        let mut rings = self.rings.write();
        if rings.contains_key(source_id) {
            return Err(CoreError::BufferExists(source_id.to_string()));
        }
        rings.insert(
            source_id.clone(),
            RwLock::new(CaptureRing::new(seconds, self.format.byte_rate())),
        );
        Ok(())
    }

    pub fn remove(&self, source_id: &SourceId) -> CoreResult<()> {
        self.rings
            .write()
            .remove(source_id)
            .map(|_| ())
            .ok_or_else(|| CoreError::BufferNotFound(source_id.to_string()))
    }

    pub fn has_buffer(&self, source_id: &SourceId) -> bool {
        self.rings.read().contains_key(source_id)
    }

    /// Append PCM, overwriting the oldest bytes when the ring is full.
    pub fn write(&self, source_id: &SourceId, pcm: &[u8]) -> CoreResult<()> {
        self.write_at(source_id, pcm, Utc::now())
    }

    /// Write with an explicit timestamp for the newest byte.
    pub fn write_at(
        &self,
        source_id: &SourceId,
        pcm: &[u8],
        now: DateTime<Utc>,
    ) -> CoreResult<()> {
        let rings = self.rings.read();
        let ring = rings
            .get(source_id)
            .ok_or_else(|| CoreError::BufferNotFound(source_id.to_string()))?;
        ring.write().write(pcm, now);
        Ok(())
    }

    /// Read the PCM window ending at `end` and lasting `width`.
    ///
    /// Fails with `NotAvailable` when any part of the window falls outside
    /// the retained range.
    pub fn read_window(
        &self,
        source_id: &SourceId,
        end: DateTime<Utc>,
        width: std::time::Duration,
    ) -> CoreResult<Vec<u8>> {
        let rings = self.rings.read();
        let ring = rings
            .get(source_id)
            .ok_or_else(|| CoreError::BufferNotFound(source_id.to_string()))?;
        let ring = ring.read();

        let newest = ring
            .newest
            .ok_or_else(|| CoreError::NotAvailable("no audio captured yet".into()))?;

        // A caller asking for "the window ending now" is always a hair ahead
        // of the newest write stamp; clamp small skews, reject real gaps.
        let end = if end > newest {
            if end - newest > ChronoDuration::seconds(1) {
                return Err(CoreError::NotAvailable(format!(
                    "window end {} is after newest audio {}",
                    end, newest
                )));
            }
            newest
        } else {
            end
        };

        let width_chrono = ChronoDuration::from_std(width)
            .map_err(|_| CoreError::InvalidBufferParams("window width out of range".into()))?;
        let start = end - width_chrono;

        // Oldest retained instant, derived from how much of the ring is full.
        let retained = ChronoDuration::milliseconds(
            (ring.filled as i64 * 1000) / ring.byte_rate as i64,
        );
        let oldest = newest - retained;
        if start < oldest {
            return Err(CoreError::NotAvailable(format!(
                "window start {} predates retained audio {}",
                start, oldest
            )));
        }

        let sample_bytes = self.format.bytes_per_sample as usize * self.format.channels as usize;
        let to_bytes = |d: ChronoDuration| -> usize {
            let raw = (d.num_milliseconds().max(0) as usize * ring.byte_rate) / 1000;
            // Align down to a whole sample frame.
            raw - raw % sample_bytes
        };

        let end_offset = to_bytes(newest - end);
        let width_bytes = to_bytes(width_chrono);
        if end_offset + width_bytes > ring.filled {
            return Err(CoreError::NotAvailable(
                "window exceeds retained audio".into(),
            ));
        }

        Ok(ring.read_back(end_offset, width_bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn small_format() -> PcmFormat {
        // byte_rate = 1000 bytes/s keeps the time math obvious.
        PcmFormat {
            sample_rate: 500,
            channels: 1,
            bytes_per_sample: 2,
        }
    }

    fn source(n: u32) -> SourceId {
        SourceId::new(format!("src_{:04x}", n))
    }

    #[test]
    fn test_allocate_rejects_zero_seconds() {
        let buffers = CaptureBuffers::new(small_format());
        assert!(buffers.allocate(&source(1), 0).is_err());
    }

    #[test]
    fn test_allocate_is_exclusive() {
        let buffers = CaptureBuffers::new(small_format());
        let id = source(1);
        buffers.allocate(&id, 10).unwrap();
        assert!(matches!(
            buffers.allocate(&id, 10),
            Err(CoreError::BufferExists(_))
        ));
    }

    #[test]
    fn test_read_window_returns_exact_tail() {
        let buffers = CaptureBuffers::new(small_format());
        let id = source(1);
        buffers.allocate(&id, 10).unwrap();

        // Write 4 seconds of recognizable data ending at a known instant.
        let now = Utc::now();
        let data: Vec<u8> = (0..4000u32).map(|i| (i % 251) as u8).collect();
        buffers.write_at(&id, &data, now).unwrap();

        // Last 2 seconds = last 2000 bytes.
        let window = buffers
            .read_window(&id, now, Duration::from_secs(2))
            .unwrap();
        assert_eq!(window.len(), 2000);
        assert_eq!(window[..], data[2000..]);
    }

    #[test]
    fn test_read_window_inside_history() {
        let buffers = CaptureBuffers::new(small_format());
        let id = source(1);
        buffers.allocate(&id, 10).unwrap();

        let now = Utc::now();
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        buffers.write_at(&id, &data, now).unwrap();

        // Window ending 1 s ago, 2 s wide: bytes 2000..4000.
        let end = now - ChronoDuration::seconds(1);
        let window = buffers.read_window(&id, end, Duration::from_secs(2)).unwrap();
        assert_eq!(window[..], data[2000..4000]);
    }

    #[test]
    fn test_ring_overwrites_oldest() {
        let buffers = CaptureBuffers::new(small_format());
        let id = source(1);
        // 2 second ring = 2000 bytes.
        buffers.allocate(&id, 2).unwrap();

        let now = Utc::now();
        let first: Vec<u8> = vec![1u8; 1500];
        let second: Vec<u8> = vec![2u8; 1500];
        buffers.write_at(&id, &first, now - ChronoDuration::milliseconds(1500)).unwrap();
        buffers.write_at(&id, &second, now).unwrap();

        // The newest 1500 bytes are all from the second write.
        let window = buffers
            .read_window(&id, now, Duration::from_millis(1500))
            .unwrap();
        assert!(window.iter().all(|&b| b == 2));

        // The full 2 s window mixes the surviving tail of the first write.
        let window = buffers.read_window(&id, now, Duration::from_secs(2)).unwrap();
        assert_eq!(window.len(), 2000);
        assert!(window[..500].iter().all(|&b| b == 1));
        assert!(window[500..].iter().all(|&b| b == 2));
    }

    #[test]
    fn test_window_outside_retention_not_available() {
        let buffers = CaptureBuffers::new(small_format());
        let id = source(1);
        buffers.allocate(&id, 2).unwrap();

        let now = Utc::now();
        buffers.write_at(&id, &vec![0u8; 1000], now).unwrap();

        // Only 1 s retained; a 2 s window cannot be served.
        assert!(matches!(
            buffers.read_window(&id, now, Duration::from_secs(2)),
            Err(CoreError::NotAvailable(_))
        ));

        // A window ending in the future cannot be served either.
        assert!(matches!(
            buffers.read_window(
                &id,
                now + ChronoDuration::seconds(5),
                Duration::from_millis(500)
            ),
            Err(CoreError::NotAvailable(_))
        ));
    }

    #[test]
    fn test_read_before_any_write_not_available() {
        let buffers = CaptureBuffers::new(small_format());
        let id = source(1);
        buffers.allocate(&id, 2).unwrap();
        assert!(matches!(
            buffers.read_window(&id, Utc::now(), Duration::from_millis(100)),
            Err(CoreError::NotAvailable(_))
        ));
    }

    #[test]
    fn test_remove_frees_ring() {
        let buffers = CaptureBuffers::new(small_format());
        let id = source(1);
        buffers.allocate(&id, 2).unwrap();
        buffers.remove(&id).unwrap();
        assert!(!buffers.has_buffer(&id));
        assert!(buffers.write(&id, &[0u8; 4]).is_err());
        assert!(matches!(
            buffers.remove(&id),
            Err(CoreError::BufferNotFound(_))
        ));
    }

    #[test]
    fn test_oversized_write_keeps_tail() {
        let buffers = CaptureBuffers::new(small_format());
        let id = source(1);
        // 1 second ring = 1000 bytes.
        buffers.allocate(&id, 1).unwrap();

        let now = Utc::now();
        let data: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        buffers.write_at(&id, &data, now).unwrap();

        let window = buffers.read_window(&id, now, Duration::from_secs(1)).unwrap();
        assert_eq!(window[..], data[2000..]);
    }
}
