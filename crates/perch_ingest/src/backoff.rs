//! Restart Policy
//!
//! Three cooperating mechanisms decide when a failed stream may come back:
//!
//! - **Exponential backoff**: each consecutive failure doubles the delay,
//!   capped at a maximum.
//! - **Restart storm guard**: too many restarts inside a rolling window adds
//!   a flat penalty on top of backoff, whatever the failure classes were.
//! - **Circuit breaker**: enough consecutive failures of one class stops
//!   restarts entirely until a cooldown expires, after which exactly one
//!   probe attempt is allowed.
//!
//! Counters reset only on a stability proof: the session ran at least
//! `stability_runtime` AND delivered at least `stability_bytes`. A process
//! merely starting proves nothing.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::health::FailureClass;

/// Tunable policy constants. Defaults match production; tests shrink them.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// First backoff delay
    pub base_delay: Duration,

    /// Backoff ceiling
    pub max_delay: Duration,

    /// Rolling window for the storm guard
    pub storm_window: Duration,

    /// Restarts within the window that trigger the storm penalty
    pub storm_threshold: usize,

    /// Extra delay once the storm guard trips
    pub storm_penalty: Duration,

    /// How long an open circuit stays closed to restarts
    pub circuit_cooldown: Duration,

    /// Minimum session runtime for a stability proof
    pub stability_runtime: Duration,

    /// Minimum bytes received for a stability proof
    pub stability_bytes: u64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(120),
            storm_window: Duration::from_secs(60),
            storm_threshold: 6,
            storm_penalty: Duration::from_secs(300),
            circuit_cooldown: Duration::from_secs(300),
            stability_runtime: Duration::from_secs(30),
            stability_bytes: 100 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CircuitState {
    Closed,
    Open { since: Instant },
    /// Cooldown expired; one probe attempt is in flight
    HalfOpen,
}

/// Decision for the next restart attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartGate {
    /// Restart after this delay (may be zero)
    After(Duration),
    /// Circuit is open; retry the gate after this long
    CircuitOpen(Duration),
}

/// Per-stream restart bookkeeping. Owned by one supervisor; not shared.
#[derive(Debug)]
pub struct RestartTracker {
    policy: RestartPolicy,
    consecutive_failures: u32,
    restart_count: u32,
    /// Backoff exponent; tracks consecutive failures but is the only input
    /// to the delay computation
    attempt: u32,
    restarts: VecDeque<Instant>,
    circuit: CircuitState,
    last_class: Option<FailureClass>,
}

impl RestartTracker {
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            consecutive_failures: 0,
            restart_count: 0,
            attempt: 0,
            restarts: VecDeque::new(),
            circuit: CircuitState::Closed,
            last_class: None,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }

    pub fn circuit_open(&self) -> bool {
        matches!(self.circuit, CircuitState::Open { .. })
    }

    pub fn circuit_opened_at(&self) -> Option<Instant> {
        match self.circuit {
            CircuitState::Open { since } => Some(since),
            _ => None,
        }
    }

    pub fn last_class(&self) -> Option<FailureClass> {
        self.last_class
    }

    /// Record a failed session.
    ///
    /// Opens the circuit when the consecutive-failure count reaches the
    /// class threshold; a failed half-open probe reopens it immediately.
    pub fn record_failure(&mut self, class: FailureClass) {
        self.consecutive_failures += 1;
        self.attempt = self.attempt.saturating_add(1);
        self.last_class = Some(class);

        match self.circuit {
            CircuitState::HalfOpen => {
                self.circuit = CircuitState::Open {
                    since: Instant::now(),
                };
            }
            CircuitState::Closed => {
                if self.consecutive_failures >= class.circuit_threshold() {
                    self.circuit = CircuitState::Open {
                        since: Instant::now(),
                    };
                }
            }
            CircuitState::Open { .. } => {}
        }
    }

    /// Record a stability proof, resetting all failure accounting.
    ///
    /// Returns true when the proof is accepted (thresholds met).
    pub fn record_stability(&mut self, runtime: Duration, bytes: u64) -> bool {
        if runtime < self.policy.stability_runtime || bytes < self.policy.stability_bytes {
            return false;
        }
        self.consecutive_failures = 0;
        self.restart_count = 0;
        self.attempt = 0;
        self.circuit = CircuitState::Closed;
        self.last_class = None;
        true
    }

    /// Record that a restart is being attempted (feeds the storm guard).
    pub fn record_restart(&mut self) {
        self.restart_count = self.restart_count.saturating_add(1);
        let now = Instant::now();
        self.restarts.push_back(now);
        while let Some(&front) = self.restarts.front() {
            if now.duration_since(front) > self.policy.storm_window {
                self.restarts.pop_front();
            } else {
                break;
            }
        }
    }

    /// Whether the storm guard is currently tripped
    pub fn storm_active(&self) -> bool {
        let now = Instant::now();
        self.restarts
            .iter()
            .filter(|t| now.duration_since(**t) <= self.policy.storm_window)
            .count()
            >= self.policy.storm_threshold
    }

    fn backoff_delay(&self) -> Duration {
        if self.attempt == 0 {
            return Duration::ZERO;
        }
        // min(base * 2^(attempt-1), max)
        let exp = (self.attempt - 1).min(30);
        let delay = self
            .policy
            .base_delay
            .saturating_mul(1u32.checked_shl(exp).unwrap_or(u32::MAX));
        delay.min(self.policy.max_delay)
    }

    /// Gate the next restart attempt.
    ///
    /// Transitions an expired open circuit to half-open, allowing exactly
    /// one probe. Callers wait the returned delay (cancellably) and retry
    /// the gate when the circuit is open.
    pub fn gate(&mut self) -> RestartGate {
        if let CircuitState::Open { since } = self.circuit {
            let elapsed = since.elapsed();
            if elapsed < self.policy.circuit_cooldown {
                return RestartGate::CircuitOpen(self.policy.circuit_cooldown - elapsed);
            }
            self.circuit = CircuitState::HalfOpen;
        }

        let mut delay = self.backoff_delay();
        if self.storm_active() {
            delay += self.policy.storm_penalty;
        }
        RestartGate::After(delay)
    }
}
