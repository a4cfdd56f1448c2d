//! Per-Stream Supervisor
//!
//! One supervisor per remote source. It owns the transcoder subprocess and
//! its whole lifecycle: spawn, read stdout into the audio sink, detect
//! stalls, tear down, and come back with backoff under circuit-breaker
//! control.
//!
//! # The send gate
//!
//! A single atomic `running` flag guards every send into the audio sink.
//! `stop()` clears the flag before cancelling anything, so once it returns
//! no frame can reach the sink, under any interleaving of stop, restart,
//! and the reader. The sink channel belongs to the caller and is never
//! closed from here.

use std::io::Read;
use std::process::ChildStdout;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use perch_core::{AudioFrame, AudioSink, AudioSource, CancelToken, Transport};

use crate::backoff::{RestartGate, RestartPolicy, RestartTracker};
use crate::health::{FailureClass, ProcessState, StreamHealth, IDLE_THRESHOLD};
use crate::transcoder::{TranscoderConfig, TranscoderProcess};

/// How long `stop()` waits for the run loop to wind down
const STOP_WAIT: Duration = Duration::from_secs(10);

/// Supervise-loop tick; stall and restart checks happen at this cadence
const SUPERVISE_TICK: Duration = Duration::from_secs(1);

/// Tunables for one supervisor
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub transcoder: TranscoderConfig,
    pub policy: RestartPolicy,

    /// Idle time before the in-supervisor watchdog restarts the session
    pub idle_threshold: Duration,

    /// Idle time past which the stream reports unhealthy. Same value as
    /// `idle_threshold` in production, but a distinct knob.
    pub healthy_data_threshold: Duration,

    /// Bounded wait for process exit before the group is killed
    pub exit_wait: Duration,

    /// Reader buffer size per stdout read
    pub read_chunk_bytes: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            transcoder: TranscoderConfig::default(),
            policy: RestartPolicy::default(),
            idle_threshold: IDLE_THRESHOLD,
            healthy_data_threshold: IDLE_THRESHOLD,
            exit_wait: Duration::from_secs(5),
            read_chunk_bytes: 32 * 1024,
        }
    }
}

/// Why a session ended
enum SessionEnd {
    /// Parent cancel or stop()
    Cancelled,
    /// Reader saw EOF or a read error (process exit)
    ReaderDone,
    /// In-supervisor watchdog: no data past the idle threshold
    Stalled,
    /// restart() was requested
    Restart { manual: bool },
    /// The transcoder never came up (already recorded as a failure)
    SpawnFailed,
}

struct HealthState {
    last_data_wall: Option<DateTime<Utc>>,
    last_data_mono: Option<Instant>,
    bytes_received: u64,
    bytes_per_second: u64,
    window_start: Instant,
    window_bytes: u64,
    process_state: ProcessState,
    process_start_wall: Option<DateTime<Utc>>,
    process_start_mono: Option<Instant>,
}

impl HealthState {
    fn new() -> Self {
        Self {
            last_data_wall: None,
            last_data_mono: None,
            bytes_received: 0,
            bytes_per_second: 0,
            window_start: Instant::now(),
            window_bytes: 0,
            process_state: ProcessState::None,
            process_start_wall: None,
            process_start_mono: None,
        }
    }
}

/// Supervises one transcoder subprocess for one remote source
pub struct StreamSupervisor {
    source: AudioSource,
    transport: Transport,
    sink: AudioSink,
    config: SupervisorConfig,

    /// The fast-path send gate. True from construction until stop().
    running: AtomicBool,

    restart_requested: AtomicBool,
    manual_restart: AtomicBool,
    restarting: AtomicBool,

    token: CancelToken,
    health: Mutex<HealthState>,
    tracker: Mutex<RestartTracker>,

    done_tx: Mutex<Option<Sender<()>>>,
    done_rx: Receiver<()>,

    created_at: DateTime<Utc>,
    created_mono: Instant,
}

impl StreamSupervisor {
    pub fn new(
        source: AudioSource,
        transport: Transport,
        sink: AudioSink,
        config: SupervisorConfig,
    ) -> Arc<Self> {
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        let policy = config.policy.clone();
        Arc::new(Self {
            source,
            transport,
            sink,
            config,
            running: AtomicBool::new(true),
            restart_requested: AtomicBool::new(false),
            manual_restart: AtomicBool::new(false),
            restarting: AtomicBool::new(false),
            token: CancelToken::new(),
            health: Mutex::new(HealthState::new()),
            tracker: Mutex::new(RestartTracker::new(policy)),
            done_tx: Mutex::new(Some(done_tx)),
            done_rx,
            created_at: Utc::now(),
            created_mono: Instant::now(),
        })
    }

    pub fn display_name(&self) -> &str {
        self.source.display_name()
    }

    pub fn source(&self) -> &AudioSource {
        &self.source
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    /// Whether a restart is currently in flight
    pub fn is_restarting(&self) -> bool {
        self.restarting.load(Ordering::SeqCst)
    }

    /// Run until the parent is cancelled or `stop()` is called.
    ///
    /// On exit: the subprocess and its descendants are reaped, the done
    /// signal is closed exactly once, and this supervisor's token carries a
    /// cause naming the reason.
    pub fn run(self: &Arc<Self>, parent: &CancelToken) {
        parent.adopt_child(&self.token);

        // Dropping this sender at the end of run() is the done signal.
        let _done = self.done_tx.lock().take();

        info!(
            source = self.display_name(),
            transport = %self.transport,
            "stream supervisor starting"
        );

        while !self.token.is_cancelled() {
            match self.gate() {
                Ok(()) => {}
                Err(()) => break,
            }
            if self.token.is_cancelled() {
                break;
            }

            let (end, runtime) = self.run_session();

            match end {
                SessionEnd::Cancelled => break,
                SessionEnd::SpawnFailed => {}
                SessionEnd::Restart { manual } => {
                    let mut tracker = self.tracker.lock();
                    tracker.record_restart();
                    info!(
                        source = self.display_name(),
                        transport = %self.transport,
                        manual,
                        restart_count = tracker.restart_count(),
                        "stream restart requested"
                    );
                }
                SessionEnd::ReaderDone | SessionEnd::Stalled => {
                    self.record_session_failure(runtime, matches!(end, SessionEnd::Stalled));
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        self.set_process_state(ProcessState::None);
        self.token.cancel(format!(
            "StreamSupervisor: run loop exiting {}",
            self.display_name()
        ));
        info!(
            source = self.display_name(),
            cause = ?self.token.cause(),
            "stream supervisor exited"
        );
    }

    /// Wait out the circuit breaker and backoff. Err means cancelled.
    fn gate(&self) -> Result<(), ()> {
        loop {
            let decision = self.tracker.lock().gate();
            match decision {
                RestartGate::CircuitOpen(remaining) => {
                    info!(
                        source = self.display_name(),
                        remaining_secs = remaining.as_secs(),
                        "circuit open, holding restarts"
                    );
                    if self.token.wait_timeout(remaining) {
                        return Err(());
                    }
                }
                RestartGate::After(delay) => {
                    if !delay.is_zero() {
                        debug!(
                            source = self.display_name(),
                            delay_ms = delay.as_millis() as u64,
                            "waiting before restart"
                        );
                        if self.token.wait_timeout(delay) {
                            return Err(());
                        }
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Spawn one transcoder session and supervise it to completion.
    ///
    /// Returns the session end reason and how long the process ran.
    fn run_session(self: &Arc<Self>) -> (SessionEnd, Duration) {
        self.set_process_state(ProcessState::Running);

        let mut process = match TranscoderProcess::spawn(
            &self.config.transcoder,
            self.source.connection_string(),
            self.transport,
            self.display_name(),
        ) {
            Ok(p) => p,
            Err(e) => {
                warn!(source = self.display_name(), error = %e, "transcoder spawn failed");
                self.set_process_state(ProcessState::None);
                let mut tracker = self.tracker.lock();
                tracker.record_failure(FailureClass::Immediate);
                tracker.record_restart();
                return (SessionEnd::SpawnFailed, Duration::ZERO);
            }
        };

        let stdout = match process.take_stdout() {
            Some(s) => s,
            None => {
                warn!(source = self.display_name(), "transcoder has no stdout pipe");
                process.kill_group();
                self.set_process_state(ProcessState::None);
                let mut tracker = self.tracker.lock();
                tracker.record_failure(FailureClass::Immediate);
                tracker.record_restart();
                return (SessionEnd::SpawnFailed, Duration::ZERO);
            }
        };

        {
            let mut health = self.health.lock();
            health.process_start_wall = Some(Utc::now());
            health.process_start_mono = Some(process.started());
        }
        // A fresh process is live; any pending restart has happened.
        self.restarting.store(false, Ordering::SeqCst);

        info!(
            source = self.display_name(),
            transport = %self.transport,
            pid = process.pid(),
            "transcoder session started"
        );

        let (session_tx, session_rx) = crossbeam_channel::bounded::<()>(1);
        let reader = self.spawn_reader(stdout, session_tx, process.started());

        let end = self.supervise(&process, &session_rx);

        // Teardown: bounded wait, then kill the group; always reap.
        self.set_process_state(ProcessState::Stopping);
        let runtime = process.runtime();
        let status = process.shutdown(self.config.exit_wait);
        if status.is_none() {
            warn!(
                source = self.display_name(),
                runtime_secs = runtime.as_secs(),
                "transcoder force-killed"
            );
        }
        if let Some(handle) = reader {
            let _ = handle.join();
        }

        {
            let mut health = self.health.lock();
            health.process_state = ProcessState::Stopped;
            health.process_start_wall = None;
            health.process_start_mono = None;
        }

        debug!(
            source = self.display_name(),
            runtime_secs = runtime.as_secs(),
            exit_status = ?status,
            stderr_tail = %process.stderr_tail(),
            "transcoder session ended"
        );

        (end, runtime)
    }

    /// Tick until the session ends for any reason.
    fn supervise(&self, process: &TranscoderProcess, session_rx: &Receiver<()>) -> SessionEnd {
        loop {
            match session_rx.recv_timeout(SUPERVISE_TICK) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return SessionEnd::ReaderDone,
                Err(RecvTimeoutError::Timeout) => {
                    if self.token.is_cancelled() {
                        return SessionEnd::Cancelled;
                    }
                    if self.restart_requested.swap(false, Ordering::SeqCst) {
                        return SessionEnd::Restart {
                            manual: self.manual_restart.swap(false, Ordering::SeqCst),
                        };
                    }
                    if self.stalled(process.started()) {
                        warn!(
                            source = self.display_name(),
                            idle_secs = self.time_since_last_data().as_secs(),
                            "no data past idle threshold, restarting session"
                        );
                        return SessionEnd::Stalled;
                    }
                }
            }
        }
    }

    fn stalled(&self, session_start: Instant) -> bool {
        let health = self.health.lock();
        let reference = health.last_data_mono.unwrap_or(session_start);
        reference.elapsed() > self.config.idle_threshold
    }

    fn spawn_reader(
        self: &Arc<Self>,
        mut stdout: ChildStdout,
        session_tx: Sender<()>,
        session_start: Instant,
    ) -> Option<JoinHandle<()>> {
        let supervisor = Arc::clone(self);
        let chunk = self.config.read_chunk_bytes;

        thread::Builder::new()
            .name(format!("perch-read-{}", self.source.id()))
            .spawn(move || {
                let mut buf = vec![0u8; chunk];
                let mut session_bytes: u64 = 0;
                let mut stability_proven = false;

                loop {
                    match stdout.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            session_bytes += n as u64;
                            supervisor.note_data(n as u64);

                            if !stability_proven {
                                let runtime = session_start.elapsed();
                                if supervisor
                                    .tracker
                                    .lock()
                                    .record_stability(runtime, session_bytes)
                                {
                                    stability_proven = true;
                                    info!(
                                        source = supervisor.display_name(),
                                        runtime_secs = runtime.as_secs(),
                                        session_bytes,
                                        "stream proven stable, failure counters reset"
                                    );
                                }
                            }

                            // The one gate between the reader and the sink.
                            if supervisor.running.load(Ordering::SeqCst) {
                                let frame = AudioFrame {
                                    source_id: supervisor.source.id().clone(),
                                    display_name: supervisor.display_name().to_string(),
                                    pcm: buf[..n].to_vec(),
                                };
                                if supervisor.sink.send(frame).is_err() {
                                    // Receiver gone; nothing left to feed.
                                    break;
                                }
                            }
                        }
                        Err(e) => {
                            debug!(
                                source = supervisor.display_name(),
                                error = %e,
                                "stdout read error"
                            );
                            break;
                        }
                    }
                }
                drop(session_tx);
            })
            .ok()
    }

    fn note_data(&self, n: u64) {
        let mut health = self.health.lock();
        health.last_data_wall = Some(Utc::now());
        health.last_data_mono = Some(Instant::now());
        health.bytes_received += n;
        health.window_bytes += n;

        let elapsed = health.window_start.elapsed();
        if elapsed >= Duration::from_secs(1) {
            health.bytes_per_second =
                (health.window_bytes as f64 / elapsed.as_secs_f64()) as u64;
            health.window_bytes = 0;
            health.window_start = Instant::now();
        }
    }

    fn record_session_failure(&self, runtime: Duration, stalled: bool) {
        let (bytes, idle) = {
            let health = self.health.lock();
            (health.bytes_received, self.idle_from(&health))
        };

        let class = FailureClass::from_runtime(runtime);
        let mut tracker = self.tracker.lock();
        tracker.record_failure(class);
        tracker.record_restart();
        self.restarting.store(true, Ordering::SeqCst);

        warn!(
            source = self.display_name(),
            transport = %self.transport,
            class = %class,
            stalled,
            consecutive_failures = tracker.consecutive_failures(),
            restart_count = tracker.restart_count(),
            bytes_received = bytes,
            idle_secs = idle.as_secs(),
            circuit_open = tracker.circuit_open(),
            "transcoder session failed"
        );
    }

    fn idle_from(&self, health: &HealthState) -> Duration {
        health
            .last_data_mono
            .map(|t| t.elapsed())
            .unwrap_or_else(|| self.created_mono.elapsed())
    }

    fn time_since_last_data(&self) -> Duration {
        let health = self.health.lock();
        self.idle_from(&health)
    }

    fn set_process_state(&self, state: ProcessState) {
        self.health.lock().process_state = state;
    }

    /// Stop the supervisor. Idempotent; safe from any number of callers.
    ///
    /// Clears the send gate first, then cancels, then waits (bounded) for
    /// the run loop to wind down. After this returns, no frame reaches the
    /// audio sink.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.token.cancel(format!(
            "StreamSupervisor: Stop() called {}",
            self.display_name()
        ));

        // If run() never started, drop the done sender ourselves so waiters
        // aren't stranded; a later run() exits immediately on the cancelled
        // token.
        {
            let mut slot = self.done_tx.lock();
            if let Some(tx) = slot.take() {
                drop(tx);
            }
        }

        if !self.wait_done(STOP_WAIT) {
            warn!(
                source = self.display_name(),
                "supervisor did not stop within {:?}", STOP_WAIT
            );
        }

        info!(
            source = self.display_name(),
            transport = %self.transport,
            cause = ?self.token.cause(),
            bytes_received = self.health.lock().bytes_received,
            "stream stopped"
        );
    }

    /// Request a session restart. Idempotent while one is in flight.
    pub fn restart(&self, manual: bool) {
        if self
            .restarting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(source = self.display_name(), "restart already in flight");
            return;
        }
        if manual {
            self.manual_restart.store(true, Ordering::SeqCst);
        }
        self.restart_requested.store(true, Ordering::SeqCst);
        info!(
            source = self.display_name(),
            transport = %self.transport,
            manual,
            "restart requested"
        );
    }

    /// Wait for the run loop to exit. Returns false on timeout.
    pub fn wait_done(&self, timeout: Duration) -> bool {
        match self.done_rx.recv_timeout(timeout) {
            Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => false,
            // No value is ever sent on the done channel.
            Ok(()) => true,
        }
    }

    /// The cancellation cause, retrievable after shutdown
    pub fn cause(&self) -> Option<String> {
        self.token.cause()
    }

    /// Point-in-time health snapshot
    pub fn health(&self) -> StreamHealth {
        let health = self.health.lock();
        let tracker = self.tracker.lock();

        let reference = health.last_data_mono.or(health.process_start_mono);
        let is_healthy = health.process_state == ProcessState::Running
            && reference
                .map(|t| t.elapsed() <= self.config.healthy_data_threshold)
                .unwrap_or(false);

        StreamHealth {
            is_healthy,
            last_data_received: health.last_data_wall,
            bytes_received: health.bytes_received,
            bytes_per_second: health.bytes_per_second,
            restart_count: tracker.restart_count(),
            consecutive_failures: tracker.consecutive_failures(),
            process_start_time: health.process_start_wall,
            circuit_open: tracker.circuit_open(),
            circuit_opened_at: tracker.circuit_opened_at().map(|opened| {
                Utc::now()
                    - chrono::Duration::from_std(opened.elapsed())
                        .unwrap_or_else(|_| chrono::Duration::zero())
            }),
            stream_created_at: self.created_at,
            process_state: health.process_state,
        }
    }
}

// Supervisor tests drive scripted stub transcoders through /bin/sh.
#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use perch_core::{SourceRegistry, SourceType};
    use std::os::unix::fs::PermissionsExt;

    fn stub_config(script_body: &str, dir: &tempfile::TempDir) -> SupervisorConfig {
        let path = dir.path().join("transcoder");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", script_body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

        SupervisorConfig {
            transcoder: TranscoderConfig {
                binary: path.to_string_lossy().into_owned(),
                ..Default::default()
            },
            policy: RestartPolicy {
                base_delay: Duration::from_millis(20),
                max_delay: Duration::from_millis(100),
                // Long enough that no half-open probe runs mid-test.
                circuit_cooldown: Duration::from_secs(30),
                ..Default::default()
            },
            idle_threshold: Duration::from_secs(60),
            healthy_data_threshold: Duration::from_secs(60),
            exit_wait: Duration::from_secs(2),
            read_chunk_bytes: 4096,
        }
    }

    fn make_source(conn: &str) -> AudioSource {
        SourceRegistry::new()
            .get_or_create(conn, SourceType::Rtsp)
            .unwrap()
    }

    fn spawn_run(
        supervisor: &Arc<StreamSupervisor>,
        parent: &CancelToken,
    ) -> thread::JoinHandle<()> {
        let sup = Arc::clone(supervisor);
        let parent = parent.clone();
        thread::spawn(move || sup.run(&parent))
    }

    #[test]
    fn test_reader_delivers_frames_to_sink() {
        let dir = tempfile::tempdir().unwrap();
        // Emit 8 KiB of zeros then hold the pipe open.
        let config = stub_config("head -c 8192 /dev/zero; sleep 60", &dir);
        let (sink, frames) = crossbeam_channel::unbounded();
        let supervisor = StreamSupervisor::new(
            make_source("test://frames"),
            Transport::Tcp,
            sink,
            config,
        );

        let parent = CancelToken::new();
        let handle = spawn_run(&supervisor, &parent);

        let mut received = 0usize;
        let deadline = Instant::now() + Duration::from_secs(5);
        while received < 8192 && Instant::now() < deadline {
            if let Ok(frame) = frames.recv_timeout(Duration::from_millis(200)) {
                received += frame.pcm.len();
                assert_eq!(frame.source_id, *supervisor.source().id());
            }
        }
        assert_eq!(received, 8192);

        let health = supervisor.health();
        assert!(health.is_healthy);
        assert_eq!(health.bytes_received, 8192);
        assert_eq!(health.process_state, ProcessState::Running);

        supervisor.stop();
        handle.join().unwrap();
    }

    #[test]
    fn test_stop_is_idempotent_and_concurrent_safe() {
        let dir = tempfile::tempdir().unwrap();
        let config = stub_config("sleep 60", &dir);
        let (sink, _frames) = crossbeam_channel::unbounded();
        let supervisor = StreamSupervisor::new(
            make_source("test://stopstorm"),
            Transport::Tcp,
            sink,
            config,
        );

        let parent = CancelToken::new();
        let handle = spawn_run(&supervisor, &parent);
        thread::sleep(Duration::from_millis(300));

        let mut stoppers = Vec::new();
        for _ in 0..10 {
            let sup = Arc::clone(&supervisor);
            stoppers.push(thread::spawn(move || sup.stop()));
        }
        for s in stoppers {
            s.join().unwrap();
        }
        handle.join().unwrap();

        // The cause belongs to whichever caller won; only one is recorded.
        let cause = supervisor.cause().unwrap();
        assert!(cause.starts_with("StreamSupervisor: Stop() called"));
    }

    #[test]
    fn test_no_sink_sends_after_stop() {
        let dir = tempfile::tempdir().unwrap();
        // Keep emitting forever so the race window is real.
        let config = stub_config(
            "while true; do head -c 1024 /dev/zero; sleep 0.01; done",
            &dir,
        );
        let (sink, frames) = crossbeam_channel::unbounded();
        let supervisor = StreamSupervisor::new(
            make_source("test://gate"),
            Transport::Tcp,
            sink,
            config,
        );

        let parent = CancelToken::new();
        let handle = spawn_run(&supervisor, &parent);

        // Wait until frames flow.
        frames.recv_timeout(Duration::from_secs(5)).unwrap();

        supervisor.stop();
        handle.join().unwrap();

        // Drain whatever was queued before stop() returned, then verify
        // silence.
        while frames.try_recv().is_ok() {}
        thread::sleep(Duration::from_millis(200));
        assert!(frames.try_recv().is_err(), "frame sent after stop()");
    }

    #[test]
    fn test_immediate_failures_open_circuit() {
        let dir = tempfile::tempdir().unwrap();
        let config = stub_config("exit 1", &dir);
        let (sink, _frames) = crossbeam_channel::unbounded();
        let supervisor = StreamSupervisor::new(
            make_source("test://flappy"),
            Transport::Tcp,
            sink,
            config,
        );

        let parent = CancelToken::new();
        let handle = spawn_run(&supervisor, &parent);

        // Three immediate failures open the circuit.
        let deadline = Instant::now() + Duration::from_secs(10);
        while !supervisor.health().circuit_open && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(50));
        }

        let health = supervisor.health();
        assert!(health.circuit_open);
        assert_eq!(health.consecutive_failures, 3);
        assert!(health.restart_count >= 3);
        assert!(!health.is_healthy);
        assert!(health.circuit_opened_at.is_some());

        supervisor.stop();
        handle.join().unwrap();
    }

    #[test]
    fn test_parent_cancel_winds_down_with_cause() {
        let dir = tempfile::tempdir().unwrap();
        let config = stub_config("sleep 60", &dir);
        let (sink, _frames) = crossbeam_channel::unbounded();
        let supervisor = StreamSupervisor::new(
            make_source("test://parent"),
            Transport::Tcp,
            sink,
            config,
        );

        let parent = CancelToken::new();
        let handle = spawn_run(&supervisor, &parent);
        thread::sleep(Duration::from_millis(300));

        parent.cancel("StreamFleet: shutdown initiated");
        assert!(supervisor.wait_done(Duration::from_secs(5)));
        handle.join().unwrap();

        assert_eq!(
            supervisor.cause().as_deref(),
            Some("StreamFleet: shutdown initiated")
        );
    }

    #[test]
    fn test_restart_is_idempotent_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let config = stub_config("sleep 60", &dir);
        let (sink, _frames) = crossbeam_channel::unbounded();
        let supervisor = StreamSupervisor::new(
            make_source("test://restart"),
            Transport::Tcp,
            sink,
            config,
        );

        let parent = CancelToken::new();
        let handle = spawn_run(&supervisor, &parent);
        thread::sleep(Duration::from_millis(300));

        supervisor.restart(true);
        assert!(supervisor.is_restarting());
        // A second request while in flight is a no-op.
        supervisor.restart(true);

        // The session comes back; restarting clears once a process is live.
        let deadline = Instant::now() + Duration::from_secs(10);
        while supervisor.is_restarting() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(50));
        }
        assert!(!supervisor.is_restarting());
        assert!(supervisor.health().restart_count >= 1);

        supervisor.stop();
        handle.join().unwrap();
    }

    #[test]
    fn test_stop_before_run_does_not_strand() {
        let dir = tempfile::tempdir().unwrap();
        let config = stub_config("sleep 60", &dir);
        let (sink, _frames) = crossbeam_channel::unbounded();
        let supervisor = StreamSupervisor::new(
            make_source("test://never"),
            Transport::Tcp,
            sink,
            config,
        );

        // stop() without run(): returns promptly, no hang.
        let start = Instant::now();
        supervisor.stop();
        assert!(start.elapsed() < Duration::from_secs(2));

        // A late run() exits immediately on the cancelled token.
        let parent = CancelToken::new();
        let handle = spawn_run(&supervisor, &parent);
        handle.join().unwrap();
    }

    #[test]
    fn test_stall_watchdog_restarts_session() {
        let dir = tempfile::tempdir().unwrap();
        // Spawns but never emits: the stall watchdog should cycle it.
        let mut config = stub_config("sleep 60", &dir);
        config.idle_threshold = Duration::from_millis(500);
        let (sink, _frames) = crossbeam_channel::unbounded();
        let supervisor = StreamSupervisor::new(
            make_source("test://stall"),
            Transport::Tcp,
            sink,
            config,
        );

        let parent = CancelToken::new();
        let handle = spawn_run(&supervisor, &parent);

        let deadline = Instant::now() + Duration::from_secs(15);
        while supervisor.health().restart_count == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(100));
        }
        assert!(supervisor.health().restart_count >= 1);
        assert_eq!(supervisor.health().bytes_received, 0);

        supervisor.stop();
        handle.join().unwrap();
    }
}
