//! Stream Health Model
//!
//! Snapshot types reported by `HealthCheck()` and the failure taxonomy the
//! restart policy keys on. A transcoder that dies one second after spawn is
//! a very different signal from one that dies after an hour; the failure
//! class picks the circuit-breaker threshold accordingly.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Idle time after which a running stream counts as unhealthy
pub const IDLE_THRESHOLD: Duration = Duration::from_secs(60);

/// Lifecycle state of the transcoder subprocess
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    None,
    Running,
    Stopping,
    Stopped,
}

/// How quickly a session failed, measured from process start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureClass {
    /// Died in under a second (bad URL, immediate refusal)
    Immediate,
    /// Died in under five seconds (auth failure, handshake rejection)
    Rapid,
    /// Died in under thirty seconds (unstable transport)
    Quick,
    /// Ran at least thirty seconds before failing
    Normal,
}

impl FailureClass {
    /// Classify a session by how long the process ran.
    pub fn from_runtime(runtime: Duration) -> Self {
        if runtime < Duration::from_secs(1) {
            FailureClass::Immediate
        } else if runtime < Duration::from_secs(5) {
            FailureClass::Rapid
        } else if runtime < Duration::from_secs(30) {
            FailureClass::Quick
        } else {
            FailureClass::Normal
        }
    }

    /// Consecutive failures of this class that open the circuit breaker
    pub fn circuit_threshold(&self) -> u32 {
        match self {
            FailureClass::Immediate => 3,
            FailureClass::Rapid => 5,
            FailureClass::Quick => 8,
            FailureClass::Normal => 10,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::Immediate => "immediate",
            FailureClass::Rapid => "rapid",
            FailureClass::Quick => "quick",
            FailureClass::Normal => "normal",
        }
    }
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time health snapshot for one stream
#[derive(Debug, Clone, Serialize)]
pub struct StreamHealth {
    pub is_healthy: bool,

    /// Wall-clock time of the last stdout read, None before first data
    pub last_data_received: Option<DateTime<Utc>>,

    /// Total bytes read over the stream's lifetime (monotonic)
    pub bytes_received: u64,

    /// Recent throughput estimate
    pub bytes_per_second: u64,

    pub restart_count: u32,
    pub consecutive_failures: u32,

    /// Start of the current process, None when no process is running
    pub process_start_time: Option<DateTime<Utc>>,

    pub circuit_open: bool,
    pub circuit_opened_at: Option<DateTime<Utc>>,

    pub stream_created_at: DateTime<Utc>,
    pub process_state: ProcessState,
}
