//! DSP Error Types

use thiserror::Error;

/// Errors that can occur building or updating a filter chain
#[derive(Error, Debug)]
pub enum DspError {
    #[error("Invalid filter frequency {frequency} Hz for sample rate {sample_rate} Hz")]
    InvalidFrequency { frequency: f32, sample_rate: f32 },

    #[error("Invalid Q factor: {0}")]
    InvalidQ(f32),

    #[error("Invalid pass count: {0} (must be 1-4)")]
    InvalidPasses(u8),

    #[error("Failed to compute filter coefficients for {frequency} Hz at {sample_rate} Hz")]
    InvalidCoefficients { frequency: f32, sample_rate: f32 },
}

/// Result type alias for DSP operations
pub type DspResult<T> = Result<T, DspError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DspError::InvalidFrequency {
            frequency: -5.0,
            sample_rate: 48000.0,
        };
        assert!(err.to_string().contains("-5"));

        let err = DspError::InvalidPasses(9);
        assert!(err.to_string().contains('9'));
    }
}
