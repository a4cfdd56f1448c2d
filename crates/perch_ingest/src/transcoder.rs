//! Transcoder Subprocess Plumbing
//!
//! Spawns the external transcoder (ffmpeg by default) that turns a remote
//! stream into raw s16le PCM on stdout. The child goes into its own process
//! group so a kill reaches the whole subtree; stderr is tailed into a small
//! ring for postmortem log context.

use std::io::Read;
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use perch_core::Transport;

use crate::error::{IngestError, IngestResult};

/// Bytes of stderr retained for postmortems
const STDERR_TAIL_BYTES: usize = 4096;

/// How the transcoder binary is invoked
#[derive(Debug, Clone)]
pub struct TranscoderConfig {
    /// Binary name or path
    pub binary: String,

    /// Output sample rate passed to `-ar`
    pub sample_rate: u32,

    /// Output channel count passed to `-ac`
    pub channels: u16,
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            binary: "ffmpeg".into(),
            sample_rate: 48_000,
            channels: 1,
        }
    }
}

impl TranscoderConfig {
    /// Build the ordered argument list for one RTSP source.
    ///
    /// The order is part of the external contract: transport flag, input,
    /// then the raw-PCM output description ending in `-` for stdout.
    pub fn build_args(&self, conn: &str, transport: Transport) -> Vec<String> {
        vec![
            "-rtsp_transport".into(),
            transport.as_flag().into(),
            "-i".into(),
            conn.into(),
            "-f".into(),
            "s16le".into(),
            "-ar".into(),
            self.sample_rate.to_string(),
            "-ac".into(),
            self.channels.to_string(),
            "-".into(),
        ]
    }
}

/// Bounded tail of the child's stderr
#[derive(Debug, Default)]
struct StderrTail {
    buf: Vec<u8>,
}

impl StderrTail {
    fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        if self.buf.len() > STDERR_TAIL_BYTES {
            let excess = self.buf.len() - STDERR_TAIL_BYTES;
            self.buf.drain(..excess);
        }
    }

    fn snapshot(&self) -> String {
        String::from_utf8_lossy(&self.buf).into_owned()
    }
}

/// A live transcoder subprocess
pub struct TranscoderProcess {
    child: Child,
    started: Instant,
    stderr_tail: Arc<Mutex<StderrTail>>,
    stderr_thread: Option<JoinHandle<()>>,
}

impl TranscoderProcess {
    /// Spawn the transcoder for one source.
    ///
    /// stdout is piped for the reader loop; stderr feeds the tail ring on
    /// its own thread. On Unix the child becomes its own process group
    /// leader so `kill_group` can reach any children it forks.
    pub fn spawn(
        config: &TranscoderConfig,
        conn: &str,
        transport: Transport,
        display_name: &str,
    ) -> IngestResult<Self> {
        let args = config.build_args(conn, transport);

        let mut command = Command::new(&config.binary);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let mut child = command
            .spawn()
            .map_err(|e| IngestError::SpawnError(format!("{}: {}", display_name, e)))?;

        let stderr_tail = Arc::new(Mutex::new(StderrTail::default()));
        let stderr_thread = match child.stderr.take() {
            Some(mut stderr) => {
                let tail = Arc::clone(&stderr_tail);
                let thread = thread::Builder::new()
                    .name("perch-stderr".into())
                    .spawn(move || {
                        let mut buf = [0u8; 1024];
                        loop {
                            match stderr.read(&mut buf) {
                                Ok(0) | Err(_) => break,
                                Ok(n) => tail.lock().push(&buf[..n]),
                            }
                        }
                    })
                    .map_err(|e| IngestError::SpawnError(e.to_string()))?;
                Some(thread)
            }
            None => None,
        };

        debug!(source = display_name, pid = child.id(), "transcoder spawned");

        Ok(Self {
            child,
            started: Instant::now(),
            stderr_tail,
            stderr_thread,
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    /// How long the process has been alive
    pub fn runtime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Take the stdout pipe for the reader loop. Yields once.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    /// The retained stderr tail, for failure log context
    pub fn stderr_tail(&self) -> String {
        self.stderr_tail.lock().snapshot()
    }

    /// Non-blocking exit check
    pub fn try_wait(&mut self) -> Option<ExitStatus> {
        self.child.try_wait().ok().flatten()
    }

    /// Wait up to `timeout` for the process to exit on its own.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Option<ExitStatus> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.try_wait() {
                return Some(status);
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(Duration::from_millis(50));
        }
    }

    /// Kill the whole process group (Unix) or the child itself, then reap.
    pub fn kill_group(&mut self) {
        #[cfg(unix)]
        {
            // The child is its own group leader; negative pid addresses the
            // group. Ignore errors: the group may already be gone.
            let pid = self.child.id() as libc::pid_t;
            unsafe {
                libc::killpg(pid, libc::SIGKILL);
            }
        }
        #[cfg(not(unix))]
        {
            let _ = self.child.kill();
        }

        if let Err(e) = self.child.wait() {
            warn!(error = %e, "failed to reap transcoder");
        }
    }

    /// Tear down: bounded wait, then group kill if still alive. Returns the
    /// exit status when the process exited on its own.
    pub fn shutdown(&mut self, wait: Duration) -> Option<ExitStatus> {
        if let Some(status) = self.wait_timeout(wait) {
            self.join_stderr();
            return Some(status);
        }
        warn!(pid = self.child.id(), "transcoder did not exit in time, killing group");
        self.kill_group();
        self.join_stderr();
        None
    }

    fn join_stderr(&mut self) {
        if let Some(thread) = self.stderr_thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for TranscoderProcess {
    fn drop(&mut self) {
        // Never leak a subtree; reap even on panic-unwind paths.
        if self.try_wait().is_none() {
            self.kill_group();
        }
        self.join_stderr();
    }
}
