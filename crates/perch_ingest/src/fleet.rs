//! Stream Fleet
//!
//! Owns every stream supervisor, reconciles the running set against
//! declarative configuration, and drives the two periodic control loops:
//!
//! - **Health check** (default every 30 s): restarts unhealthy streams,
//!   skipping ones already restarting or whose process is younger than the
//!   stabilization grace.
//! - **Stuck-stream watchdog** (every 5 min): a stream unhealthy past the
//!   stuck threshold gets a force-reset - full stop, wait, start - with a
//!   per-stream cooldown claimed before the reset so two passes can never
//!   double-reset.
//!
//! Lock discipline: the fleet lock guards only the stream map and is never
//! held across sleeps, supervisor stops, or collaborator callbacks. The
//! force-reset cooldown map has its own lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use perch_core::{
    AudioFanout, AudioSink, CancelToken, SourceId, SourceRegistry, SourceType, StreamSpec,
    Transport,
};

use crate::error::{IngestError, IngestResult};
use crate::health::StreamHealth;
use crate::supervisor::{StreamSupervisor, SupervisorConfig};

/// Fleet-level tunables. Defaults match production; tests shrink them.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub supervisor: SupervisorConfig,

    /// Stuck-stream watchdog cadence
    pub watchdog_interval: Duration,

    /// Unhealthy this long means stuck
    pub stuck_threshold: Duration,

    /// Per-stream cooldown between force-resets. Deliberately equal to the
    /// stuck threshold; kept as its own constant so they can diverge.
    pub force_reset_cooldown: Duration,

    /// Pause between the stop and start halves of a force-reset
    pub force_reset_wait: Duration,

    /// Bounded wait for all streams to stop during shutdown
    pub shutdown_timeout: Duration,

    /// Young processes get this long to stabilize before the health loop
    /// will restart them
    pub restart_grace: Duration,

    /// Inactive sources older than this are pruned by the cleanup sweep
    pub source_ttl: Duration,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            supervisor: SupervisorConfig::default(),
            watchdog_interval: Duration::from_secs(300),
            stuck_threshold: Duration::from_secs(15 * 60),
            force_reset_cooldown: Duration::from_secs(15 * 60),
            force_reset_wait: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
            restart_grace: Duration::from_secs(120),
            source_ttl: Duration::from_secs(3600),
        }
    }
}

/// Collaborator callbacks the fleet invokes on stream lifecycle edges.
///
/// Registrations are keyed on the stable source ID; the display name rides
/// along so downstream consumers can label things without a registry round
/// trip.
#[derive(Clone, Default)]
pub struct FleetHooks {
    pub register_sound_level: Option<Arc<dyn Fn(&SourceId, &str) + Send + Sync>>,
    pub unregister_sound_level: Option<Arc<dyn Fn(&SourceId) + Send + Sync>>,
}

/// Owns all stream supervisors plus the periodic control loops
pub struct StreamFleet {
    registry: Arc<SourceRegistry>,
    fanout: Arc<AudioFanout>,
    config: FleetConfig,
    hooks: FleetHooks,

    /// conn -> supervisor. The fleet lock; never held across blocking calls.
    streams: Mutex<HashMap<String, Arc<StreamSupervisor>>>,

    /// conn -> last force-reset. Independent of the fleet lock.
    force_resets: Mutex<HashMap<String, Instant>>,

    token: CancelToken,
    monitor_threads: Mutex<Vec<JoinHandle<()>>>,
    monitor_sink: Mutex<Option<AudioSink>>,
}

impl StreamFleet {
    pub fn new(
        registry: Arc<SourceRegistry>,
        fanout: Arc<AudioFanout>,
        config: FleetConfig,
        hooks: FleetHooks,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            fanout,
            config,
            hooks,
            streams: Mutex::new(HashMap::new()),
            force_resets: Mutex::new(HashMap::new()),
            token: CancelToken::new(),
            monitor_threads: Mutex::new(Vec::new()),
            monitor_sink: Mutex::new(None),
        })
    }

    /// The fleet's cancellation token (parent of every supervisor)
    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Start a stream for `conn`, allocating its buffers and spawning the
    /// supervisor.
    pub fn start_stream(
        &self,
        conn: &str,
        transport: Transport,
        sink: AudioSink,
    ) -> IngestResult<()> {
        if self.token.is_cancelled() {
            return Err(IngestError::ShuttingDown);
        }

        // Validation and identity come first; Invalid surfaces to the caller.
        let source = self.registry.get_or_create(conn, SourceType::Rtsp)?;

        let supervisor = {
            let mut streams = self.streams.lock();
            if streams.contains_key(conn) {
                return Err(IngestError::AlreadyExists(source.display_name().into()));
            }

            self.fanout
                .allocate_buffers(source.id())
                .map_err(|e| IngestError::BufferInit {
                    src: source.display_name().into(),
                    reason: e.to_string(),
                })?;

            let supervisor = StreamSupervisor::new(
                source.clone(),
                transport,
                sink,
                self.config.supervisor.clone(),
            );

            let runner = Arc::clone(&supervisor);
            let parent = self.token.clone();
            let spawned = thread::Builder::new()
                .name(format!("perch-stream-{}", source.id()))
                .spawn(move || runner.run(&parent));

            if let Err(e) = spawned {
                let _ = self.fanout.remove_buffers(source.id());
                return Err(IngestError::SpawnError(e.to_string()));
            }

            streams.insert(conn.to_string(), Arc::clone(&supervisor));
            supervisor
        };

        // Collaborator callbacks run outside the fleet lock.
        if let Some(register) = &self.hooks.register_sound_level {
            register(supervisor.source().id(), supervisor.display_name());
        }

        info!(
            source = supervisor.display_name(),
            transport = %transport,
            "stream started"
        );
        Ok(())
    }

    /// Stop a stream and release everything it owned.
    pub fn stop_stream(&self, conn: &str) -> IngestResult<()> {
        // Remove under the lock, tear down after releasing it.
        let supervisor = self
            .streams
            .lock()
            .remove(conn)
            .ok_or_else(|| IngestError::NotFound(perch_core::sanitize_connection_string(conn)))?;

        supervisor.stop();

        let source_id = supervisor.source().id().clone();
        if let Err(e) = self.fanout.remove_buffers(&source_id) {
            debug!(source = supervisor.display_name(), error = %e, "buffer cleanup");
        }
        if let Some(unregister) = &self.hooks.unregister_sound_level {
            unregister(&source_id);
        }
        self.registry.deactivate(&source_id);
        self.force_resets.lock().remove(conn);

        info!(source = supervisor.display_name(), "stream stopped and released");
        Ok(())
    }

    /// Delegate a restart to the stream's supervisor.
    pub fn restart_stream(&self, conn: &str) -> IngestResult<()> {
        let supervisor = self
            .streams
            .lock()
            .get(conn)
            .cloned()
            .ok_or_else(|| IngestError::NotFound(perch_core::sanitize_connection_string(conn)))?;
        supervisor.restart(true);
        Ok(())
    }

    /// Three-phase reconciliation against the desired stream list.
    ///
    /// 1. Streams whose configured transport changed are stopped and
    ///    restarted with the new transport.
    /// 2. Running streams absent from the desired list are stopped.
    /// 3. Desired streams not running are started.
    pub fn sync_with_config(&self, desired: &[StreamSpec], sink: &AudioSink) {
        // Phase 1: transport changes.
        for spec in desired {
            let current = self.streams.lock().get(&spec.url).cloned();
            if let Some(supervisor) = current {
                if supervisor.transport() != spec.transport {
                    info!(
                        source = supervisor.display_name(),
                        old_transport = %supervisor.transport(),
                        new_transport = %spec.transport,
                        "transport changed, recycling stream"
                    );
                    if let Err(e) = self.stop_stream(&spec.url) {
                        warn!(source = supervisor.display_name(), error = %e, "transport-change stop failed");
                        continue;
                    }
                    if let Err(e) = self.start_stream(&spec.url, spec.transport, sink.clone()) {
                        warn!(source = supervisor.display_name(), error = %e, "transport-change start failed");
                    }
                }
            }
        }

        // Phase 2: stop streams no longer configured.
        let running: Vec<String> = self.streams.lock().keys().cloned().collect();
        for conn in running {
            if !desired.iter().any(|s| s.url == conn) {
                info!(
                    source = %perch_core::sanitize_connection_string(&conn),
                    "stream removed from configuration, stopping"
                );
                if let Err(e) = self.stop_stream(&conn) {
                    warn!(error = %e, "config-removal stop failed");
                }
            }
        }

        // Phase 3: start newly configured streams.
        for spec in desired {
            let exists = self.streams.lock().contains_key(&spec.url);
            if !exists {
                if let Err(e) = self.start_stream(&spec.url, spec.transport, sink.clone()) {
                    warn!(
                        source = %perch_core::sanitize_connection_string(&spec.url),
                        error = %e,
                        "config-sync start failed"
                    );
                }
            }
        }
    }

    /// Health snapshots for every running stream, keyed by connection string.
    pub fn health_check(&self) -> HashMap<String, StreamHealth> {
        // Snapshot the map first; supervisor locks are never taken while
        // the fleet lock is held.
        let snapshot: Vec<(String, Arc<StreamSupervisor>)> = self
            .streams
            .lock()
            .iter()
            .map(|(conn, sup)| (conn.clone(), Arc::clone(sup)))
            .collect();

        snapshot
            .into_iter()
            .map(|(conn, sup)| (conn, sup.health()))
            .collect()
    }

    /// The transport a running stream is currently using
    pub fn transport_of(&self, conn: &str) -> Option<Transport> {
        self.streams.lock().get(conn).map(|s| s.transport())
    }

    /// Number of running streams
    pub fn len(&self) -> usize {
        self.streams.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start the health-check and stuck-stream watchdog loops.
    ///
    /// `interval` is the health-check cadence; the sink is handed to
    /// streams the watchdog force-resets. Idempotent: a second call is a
    /// no-op.
    pub fn start_monitoring(self: &Arc<Self>, interval: Duration, sink: AudioSink) {
        {
            let mut slot = self.monitor_sink.lock();
            if slot.is_some() {
                warn!("monitoring already started");
                return;
            }
            *slot = Some(sink);
        }

        let mut threads = self.monitor_threads.lock();

        let fleet = Arc::clone(self);
        if let Ok(handle) = thread::Builder::new()
            .name("perch-health".into())
            .spawn(move || {
                info!(interval_secs = interval.as_secs(), "health-check loop started");
                while !fleet.token.wait_timeout(interval) {
                    fleet.health_pass();
                }
                info!("health-check loop exiting");
            })
        {
            threads.push(handle);
        }

        let fleet = Arc::clone(self);
        let watchdog_interval = self.config.watchdog_interval;
        if let Ok(handle) = thread::Builder::new()
            .name("perch-watchdog".into())
            .spawn(move || {
                info!(
                    interval_secs = watchdog_interval.as_secs(),
                    "stuck-stream watchdog started"
                );
                while !fleet.token.wait_timeout(watchdog_interval) {
                    fleet.watchdog_pass();
                    let pruned = fleet.registry.cleanup_inactive(fleet.config.source_ttl);
                    if pruned > 0 {
                        debug!(pruned, "inactive sources pruned");
                    }
                }
                info!("stuck-stream watchdog exiting");
            })
        {
            threads.push(handle);
        }
    }

    /// One health-check sweep: restart unhealthy streams that are neither
    /// mid-restart nor inside the stabilization grace.
    fn health_pass(&self) {
        let snapshot: Vec<Arc<StreamSupervisor>> =
            self.streams.lock().values().map(Arc::clone).collect();

        for supervisor in snapshot {
            let health = supervisor.health();
            let degraded = self.fanout.is_degraded(supervisor.source().id());
            if health.is_healthy && !degraded {
                continue;
            }
            if supervisor.is_restarting() {
                debug!(source = supervisor.display_name(), "unhealthy but already restarting");
                continue;
            }
            if let Some(start) = health.process_start_time {
                let age = Utc::now() - start;
                if age
                    < chrono::Duration::from_std(self.config.restart_grace)
                        .unwrap_or_else(|_| chrono::Duration::seconds(120))
                {
                    debug!(
                        source = supervisor.display_name(),
                        "unhealthy but still stabilizing"
                    );
                    continue;
                }
            }

            info!(
                source = supervisor.display_name(),
                degraded,
                bytes_received = health.bytes_received,
                consecutive_failures = health.consecutive_failures,
                "health check restarting unhealthy stream"
            );
            supervisor.restart(false);
        }
    }

    /// One watchdog sweep: force-reset streams stuck unhealthy past the
    /// threshold, at most once per cooldown.
    fn watchdog_pass(&self) {
        let snapshot: Vec<(String, Arc<StreamSupervisor>)> = self
            .streams
            .lock()
            .iter()
            .map(|(conn, sup)| (conn.clone(), Arc::clone(sup)))
            .collect();

        for (conn, supervisor) in snapshot {
            let health = supervisor.health();
            if health.is_healthy {
                continue;
            }
            if supervisor.is_restarting() {
                continue;
            }

            // If the stream never received data, measure from its creation.
            let unhealthy_since = health
                .last_data_received
                .unwrap_or(health.stream_created_at);
            let stuck_for = (Utc::now() - unhealthy_since)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if stuck_for < self.config.stuck_threshold {
                continue;
            }

            // Claim the cooldown slot before resetting anything; a claim
            // inside the window means another reset already happened.
            {
                let mut cooldowns = self.force_resets.lock();
                if let Some(last) = cooldowns.get(&conn) {
                    if last.elapsed() < self.config.force_reset_cooldown {
                        debug!(
                            source = supervisor.display_name(),
                            "stuck but inside force-reset cooldown"
                        );
                        continue;
                    }
                }
                cooldowns.insert(conn.clone(), Instant::now());
            }

            warn!(
                source = supervisor.display_name(),
                stuck_secs = stuck_for.as_secs(),
                bytes_received = health.bytes_received,
                restart_count = health.restart_count,
                "stream stuck, force-resetting"
            );
            self.force_reset(&conn);
        }
    }

    /// Full stop-wait-start cycle for one stuck stream.
    fn force_reset(&self, conn: &str) {
        let transport = match self.streams.lock().get(conn) {
            Some(sup) => sup.transport(),
            None => return,
        };
        let sink = match self.monitor_sink.lock().clone() {
            Some(sink) => sink,
            None => return,
        };

        if let Err(e) = self.stop_stream(conn) {
            warn!(error = %e, "force-reset stop failed");
            return;
        }

        // No locks are held across this pause.
        if self.token.wait_timeout(self.config.force_reset_wait) {
            return;
        }

        match self.start_stream(conn, transport, sink) {
            Ok(()) => info!(
                source = %perch_core::sanitize_connection_string(conn),
                "force-reset complete"
            ),
            Err(e) => warn!(error = %e, "force-reset start failed"),
        }

        // stop_stream scrubbed the slot; restore it so the next watchdog
        // pass honors the cooldown.
        self.force_resets
            .lock()
            .insert(conn.to_string(), Instant::now());
    }

    /// When the last force-reset for `conn` happened, if any
    pub fn last_force_reset(&self, conn: &str) -> Option<Instant> {
        self.force_resets.lock().get(conn).copied()
    }

    /// Cancel everything, stop all streams concurrently, wait bounded.
    pub fn shutdown(&self) {
        self.token.cancel("StreamFleet: shutdown initiated");
        info!("fleet shutdown initiated");

        let entries: Vec<(String, Arc<StreamSupervisor>)> =
            self.streams.lock().drain().collect();
        let total = entries.len();

        let (done_tx, done_rx) = crossbeam_channel::bounded::<String>(total.max(1));
        for (conn, supervisor) in entries {
            let fanout = Arc::clone(&self.fanout);
            let registry = Arc::clone(&self.registry);
            let hooks = self.hooks.clone();
            let done = done_tx.clone();
            let spawn = thread::Builder::new()
                .name("perch-stop".into())
                .spawn(move || {
                    supervisor.stop();
                    let source_id = supervisor.source().id().clone();
                    let _ = fanout.remove_buffers(&source_id);
                    if let Some(unregister) = &hooks.unregister_sound_level {
                        unregister(&source_id);
                    }
                    registry.deactivate(&source_id);
                    let _ = done.send(conn);
                });
            if spawn.is_err() {
                warn!("failed to spawn stop worker");
            }
        }
        drop(done_tx);

        let deadline = Instant::now() + self.config.shutdown_timeout;
        let mut stopped = 0usize;
        while stopped < total {
            let now = Instant::now();
            if now >= deadline {
                warn!(
                    stopped,
                    total,
                    "shutdown timed out with streams still active"
                );
                break;
            }
            match done_rx.recv_timeout(deadline - now) {
                Ok(_) => stopped += 1,
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                // A worker died without reporting; nothing more will arrive.
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            }
        }

        let threads: Vec<JoinHandle<()>> = self.monitor_threads.lock().drain(..).collect();
        for handle in threads {
            let _ = handle.join();
        }

        self.force_resets.lock().clear();
        info!(stopped, total, "fleet shutdown complete");
    }
}
