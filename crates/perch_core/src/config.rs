//! Realtime Ingestion Configuration
//!
//! Only the keys the ingestion core reads. Loading and reload semantics
//! belong to the host program; the core receives these structs fully formed.

use serde::{Deserialize, Serialize};

use perch_dsp::FilterSpec;

/// PCM sample format shared by every ingestion path
///
/// The transcoder contract is fixed: little-endian signed 16-bit, 48 kHz,
/// mono. Local capture is converted to the same format before fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcmFormat {
    /// Samples per second
    pub sample_rate: u32,

    /// Interleaved channel count
    pub channels: u16,

    /// Bytes per single sample (2 for s16le)
    pub bytes_per_sample: u16,
}

impl Default for PcmFormat {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 1,
            bytes_per_sample: 2,
        }
    }
}

impl PcmFormat {
    /// Bytes of PCM per second of audio
    pub fn byte_rate(&self) -> usize {
        self.sample_rate as usize * self.channels as usize * self.bytes_per_sample as usize
    }

    /// Bytes for `seconds` of audio
    pub fn bytes_for(&self, seconds: u64) -> usize {
        self.byte_rate() * seconds as usize
    }
}

/// RTSP transport protocol for a remote stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    /// The value passed to the transcoder's `-rtsp_transport` flag
    pub fn as_flag(&self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
        }
    }
}

impl Default for Transport {
    fn default() -> Self {
        Transport::Tcp
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_flag())
    }
}

/// One configured remote stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSpec {
    /// RTSP URL (may carry credentials; never logged raw)
    pub url: String,

    /// Transport protocol
    #[serde(default)]
    pub transport: Transport,
}

/// Health monitoring settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Health check interval in seconds (0 means the 30 s default)
    #[serde(default)]
    pub monitoring_interval: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            monitoring_interval: 0,
        }
    }
}

impl HealthConfig {
    /// Effective interval, applying the default for 0
    pub fn effective_interval(&self) -> std::time::Duration {
        let secs = if self.monitoring_interval == 0 {
            30
        } else {
            self.monitoring_interval
        };
        std::time::Duration::from_secs(secs)
    }
}

/// Remote stream configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RtspConfig {
    /// Configured remote streams
    #[serde(default)]
    pub streams: Vec<StreamSpec>,

    /// Health monitoring
    #[serde(default)]
    pub health: HealthConfig,
}

/// Equalizer configuration for the ingest filter chain
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EqualizerConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Filters applied in order to every ingested chunk
    #[serde(default)]
    pub filters: Vec<FilterSpec>,
}

/// Sound-level spectral processor registration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SoundLevelConfig {
    #[serde(default)]
    pub enabled: bool,
}

/// Local audio device configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Local device identifier; empty disables local capture
    #[serde(default)]
    pub source: String,

    #[serde(default)]
    pub equalizer: EqualizerConfig,

    #[serde(default)]
    pub sound_level: SoundLevelConfig,
}

/// Top-level realtime configuration surface
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RealtimeConfig {
    #[serde(default)]
    pub rtsp: RtspConfig,

    #[serde(default)]
    pub audio: AudioConfig,
}

impl RealtimeConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        for spec in &self.rtsp.streams {
            if spec.url.trim().is_empty() {
                return Err("empty stream url".to_string());
            }
        }
        if self.audio.equalizer.enabled {
            for filter in &self.audio.equalizer.filters {
                filter
                    .validate(48_000.0)
                    .map_err(|e| format!("equalizer filter: {}", e))?;
            }
        }
        Ok(())
    }
}
