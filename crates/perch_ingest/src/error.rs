//! Ingest Error Types

use thiserror::Error;

/// Errors surfaced by the fleet and supervisor start paths.
///
/// Runtime faults (transcoder exits, read errors, stalls) are handled
/// inside the supervisor and never cross this boundary.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Stream already exists: {0}")]
    AlreadyExists(String),

    #[error("Stream not found: {0}")]
    NotFound(String),

    #[error("Invalid stream: {0}")]
    Invalid(#[from] perch_core::CoreError),

    #[error("Buffer initialization failed for {src}: {reason}")]
    BufferInit { src: String, reason: String },

    #[error("Failed to spawn transcoder: {0}")]
    SpawnError(String),

    #[error("Audio device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open audio device {device}: {reason}")]
    DeviceError { device: String, reason: String },

    #[error("Fleet is shutting down")]
    ShuttingDown,
}

/// Result type alias for ingest operations
pub type IngestResult<T> = Result<T, IngestError>;
