//! Equalizer Filter Chain
//!
//! A cascade of BiQuad filters (RBJ Audio EQ Cookbook coefficients via the
//! `biquad` crate) applied in place to little-endian signed 16-bit PCM.
//! The ingest path calls `process_s16le` on every chunk, so the process
//! path performs no allocation; all validation happens at construction.

use biquad::{Biquad, Coefficients, DirectForm2Transposed, ToHertz, Type, Q_BUTTERWORTH_F32};
use serde::{Deserialize, Serialize};

use crate::error::{DspError, DspResult};

/// Filter shape for one chain stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterType {
    LowPass,
    HighPass,
    BandPass,
    Notch,
}

/// One configured filter stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterSpec {
    #[serde(rename = "type")]
    pub filter_type: FilterType,

    /// Center/corner frequency in Hz
    pub frequency: f32,

    /// Q factor; 0 selects the Butterworth default (~0.707)
    #[serde(default)]
    pub q: f32,

    /// Cascade passes (steeper slope); 1-4
    #[serde(default = "default_passes")]
    pub passes: u8,
}

fn default_passes() -> u8 {
    1
}

impl FilterSpec {
    /// Validate against a sample rate without building the filter.
    pub fn validate(&self, sample_rate: f32) -> DspResult<()> {
        if !(self.frequency > 0.0 && self.frequency < sample_rate / 2.0) {
            return Err(DspError::InvalidFrequency {
                frequency: self.frequency,
                sample_rate,
            });
        }
        if self.q < 0.0 || !self.q.is_finite() {
            return Err(DspError::InvalidQ(self.q));
        }
        if self.passes == 0 || self.passes > 4 {
            return Err(DspError::InvalidPasses(self.passes));
        }
        Ok(())
    }

    fn effective_q(&self) -> f32 {
        if self.q > 0.0 {
            self.q
        } else {
            Q_BUTTERWORTH_F32
        }
    }

    fn to_coefficients(&self, sample_rate: f32) -> DspResult<Coefficients<f32>> {
        let kind = match self.filter_type {
            FilterType::LowPass => Type::LowPass,
            FilterType::HighPass => Type::HighPass,
            FilterType::BandPass => Type::BandPass,
            FilterType::Notch => Type::Notch,
        };

        Coefficients::<f32>::from_params(
            kind,
            sample_rate.hz(),
            self.frequency.hz(),
            self.effective_q(),
        )
        .map_err(|_| DspError::InvalidCoefficients {
            frequency: self.frequency,
            sample_rate,
        })
    }
}

/// Stateful cascade of biquad stages
pub struct FilterChain {
    stages: Vec<DirectForm2Transposed<f32>>,
}

impl FilterChain {
    /// Build a chain from specs. Each spec contributes `passes` identical
    /// stages; an empty spec list yields a passthrough chain.
    pub fn from_specs(specs: &[FilterSpec], sample_rate: f32) -> DspResult<Self> {
        let mut stages = Vec::new();
        for spec in specs {
            spec.validate(sample_rate)?;
            let coeffs = spec.to_coefficients(sample_rate)?;
            for _ in 0..spec.passes {
                stages.push(DirectForm2Transposed::<f32>::new(coeffs));
            }
        }
        Ok(Self { stages })
    }

    pub fn is_passthrough(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run one f32 sample through every stage.
    #[inline]
    pub fn run(&mut self, sample: f32) -> f32 {
        let mut s = sample;
        for stage in &mut self.stages {
            s = stage.run(s);
        }
        s
    }

    /// Filter a buffer of little-endian signed 16-bit PCM in place.
    ///
    /// A trailing odd byte is left untouched.
    pub fn process_s16le(&mut self, pcm: &mut [u8]) {
        if self.stages.is_empty() {
            return;
        }
        for frame in pcm.chunks_exact_mut(2) {
            let sample = i16::from_le_bytes([frame[0], frame[1]]) as f32 / 32768.0;
            let filtered = self.run(sample).clamp(-1.0, 1.0);
            let out = (filtered * 32767.0) as i16;
            frame.copy_from_slice(&out.to_le_bytes());
        }
    }

    /// Reset all filter state (e.g. across a stream discontinuity).
    pub fn reset(&mut self) {
        for stage in &mut self.stages {
            stage.reset_state();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm_of(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    fn to_samples(pcm: &[u8]) -> Vec<i16> {
        pcm.chunks_exact(2)
            .map(|f| i16::from_le_bytes([f[0], f[1]]))
            .collect()
    }

    #[test]
    fn test_validate_rejects_bad_frequency() {
        let spec = FilterSpec {
            filter_type: FilterType::HighPass,
            frequency: 0.0,
            q: 0.0,
            passes: 1,
        };
        assert!(spec.validate(48000.0).is_err());

        let spec = FilterSpec {
            filter_type: FilterType::LowPass,
            frequency: 30000.0, // above Nyquist
            q: 0.0,
            passes: 1,
        };
        assert!(spec.validate(48000.0).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_passes() {
        for passes in [0u8, 5] {
            let spec = FilterSpec {
                filter_type: FilterType::LowPass,
                frequency: 1000.0,
                q: 0.0,
                passes,
            };
            assert!(spec.validate(48000.0).is_err());
        }
    }

    #[test]
    fn test_empty_chain_is_passthrough() {
        let mut chain = FilterChain::from_specs(&[], 48000.0).unwrap();
        assert!(chain.is_passthrough());

        let original = pcm_of(&[100, -100, 5000, -5000]);
        let mut pcm = original.clone();
        chain.process_s16le(&mut pcm);
        assert_eq!(pcm, original);
    }

    #[test]
    fn test_lowpass_attenuates_high_frequency() {
        // 12 kHz tone at 48 kHz, low-passed at 500 Hz, should collapse.
        let spec = FilterSpec {
            filter_type: FilterType::LowPass,
            frequency: 500.0,
            q: 0.0,
            passes: 2,
        };
        let mut chain = FilterChain::from_specs(&[spec], 48000.0).unwrap();

        let tone: Vec<i16> = (0..480)
            .map(|i| {
                let phase = i as f32 * 12000.0 / 48000.0 * std::f32::consts::TAU;
                (phase.sin() * 20000.0) as i16
            })
            .collect();
        let mut pcm = pcm_of(&tone);
        chain.process_s16le(&mut pcm);

        let out = to_samples(&pcm);
        // Skip the transient head; steady state should be heavily attenuated.
        let peak = out[240..].iter().map(|s| s.abs()).max().unwrap();
        assert!(peak < 2000, "peak {}", peak);
    }

    #[test]
    fn test_highpass_passes_high_frequency() {
        let spec = FilterSpec {
            filter_type: FilterType::HighPass,
            frequency: 500.0,
            q: 0.0,
            passes: 1,
        };
        let mut chain = FilterChain::from_specs(&[spec], 48000.0).unwrap();

        let tone: Vec<i16> = (0..480)
            .map(|i| {
                let phase = i as f32 * 12000.0 / 48000.0 * std::f32::consts::TAU;
                (phase.sin() * 20000.0) as i16
            })
            .collect();
        let mut pcm = pcm_of(&tone);
        chain.process_s16le(&mut pcm);

        let out = to_samples(&pcm);
        let peak = out[240..].iter().map(|s| s.abs()).max().unwrap();
        assert!(peak > 15000, "peak {}", peak);
    }

    #[test]
    fn test_passes_add_stages() {
        let spec = FilterSpec {
            filter_type: FilterType::LowPass,
            frequency: 1000.0,
            q: 0.0,
            passes: 3,
        };
        let chain = FilterChain::from_specs(&[spec], 48000.0).unwrap();
        assert_eq!(chain.stages.len(), 3);
    }

    #[test]
    fn test_spec_deserializes_from_config_shape() {
        let json = r#"{"type": "highpass", "frequency": 100.0, "passes": 2}"#;
        let spec: FilterSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.filter_type, FilterType::HighPass);
        assert_eq!(spec.passes, 2);
        assert_eq!(spec.q, 0.0);
        assert!(spec.validate(48000.0).is_ok());
    }

    #[test]
    fn test_reset_clears_state() {
        let spec = FilterSpec {
            filter_type: FilterType::LowPass,
            frequency: 1000.0,
            q: 0.0,
            passes: 1,
        };
        let mut chain = FilterChain::from_specs(&[spec], 48000.0).unwrap();

        let mut first = pcm_of(&[20000i16; 64]);
        chain.process_s16le(&mut first);
        chain.reset();

        let mut second = pcm_of(&[20000i16; 64]);
        chain.process_s16le(&mut second);
        // Identical input after reset produces identical output.
        let spec2 = FilterSpec {
            filter_type: FilterType::LowPass,
            frequency: 1000.0,
            q: 0.0,
            passes: 1,
        };
        let mut fresh = FilterChain::from_specs(&[spec2], 48000.0).unwrap();
        let mut third = pcm_of(&[20000i16; 64]);
        fresh.process_s16le(&mut third);
        assert_eq!(second, third);
    }
}
