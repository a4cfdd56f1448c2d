//! Core Error Types

use thiserror::Error;

/// Errors that can occur in the ingestion core
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid connection string: {0}")]
    Validation(String),

    #[error("Source already registered: {0}")]
    AlreadyExists(String),

    #[error("Source not found: {0}")]
    SourceNotFound(String),

    #[error("No buffer allocated for source: {0}")]
    BufferNotFound(String),

    #[error("Buffer already allocated for source: {0}")]
    BufferExists(String),

    #[error("Invalid buffer pool size: {0}")]
    InvalidPoolSize(usize),

    #[error("Invalid buffer parameters: {0}")]
    InvalidBufferParams(String),

    #[error("Requested window not available: {0}")]
    NotAvailable(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("DSP error: {0}")]
    DspError(#[from] perch_dsp::DspError),

    #[error("Channel send error - receiver dropped")]
    ChannelSendError,
}

/// Result type alias for core operations
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::Validation("rtsp://bad;host".into());
        assert!(err.to_string().contains("rtsp://bad;host"));

        let err = CoreError::InvalidPoolSize(0);
        assert!(err.to_string().contains('0'));
    }

    #[test]
    fn test_error_from_dsp() {
        let dsp_err = perch_dsp::DspError::InvalidFrequency {
            frequency: -10.0,
            sample_rate: 48000.0,
        };
        let core_err: CoreError = dsp_err.into();
        assert!(matches!(core_err, CoreError::DspError(_)));
    }
}
