//! Supervisory session runtime.
//!
//! A session owns two tokio tasks sharing the bus:
//! - the motion task runs [`MotionSupervisor::tick`] at the motion period, sleeping through
//!   the supervisor's dwells on its own;
//! - the monitor task runs the heartbeat check and the telemetry report at the monitor
//!   period, reading the supervisor state through a watch channel.
//!
//! The bus layer's cyclic tick is the third unit and belongs to the [`FieldBus`]
//! implementation. Shutdown and reset requests are observed between cycles; a dwell in
//! progress is never cut short.

use crate::bus::FieldBus;
use crate::config::SupervisorConfig;
use crate::error::SupervisorError;
use crate::heartbeat::{HeartbeatMonitor, HeartbeatStats, LivenessTracker};
use crate::status::DeviceSnapshot;
use crate::supervisor::{MotionSupervisor, SupervisorState, SupervisorStats, TickOutcome};
use crate::telemetry::{ReporterStats, TelemetryReporter, TelemetrySink};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Counters collected from both tasks once the session has stopped.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SessionSummary {
    pub final_state: SupervisorState,
    pub supervisor: SupervisorStats,
    pub heartbeat: HeartbeatStats,
    pub telemetry: ReporterStats,
}

pub struct Session<B: FieldBus + 'static> {
    bus: Arc<B>,
    config: SupervisorConfig,
    tracker: Arc<LivenessTracker>,
}

impl<B: FieldBus + 'static> Session<B> {
    /// `tracker` must be the one the bus layer resets on every status frame.
    pub fn new(bus: Arc<B>, config: SupervisorConfig, tracker: Arc<LivenessTracker>) -> Self {
        Self { bus, config, tracker }
    }

    pub fn tracker(&self) -> &Arc<LivenessTracker> {
        &self.tracker
    }

    pub fn spawn<S: TelemetrySink + 'static>(self, sink: S) -> SessionHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let reset_requested = Arc::new(AtomicBool::new(false));

        let supervisor = MotionSupervisor::new(self.config.clone());
        let state_rx = supervisor.subscribe();

        info!(
            "🚀 Starting supervisory session for node {:#04x} (motion {} ms, monitor {} ms)",
            self.config.node_id, self.config.motion_period_ms, self.config.monitor_period_ms
        );

        let motion_task = tokio::spawn(run_motion(
            Arc::clone(&self.bus),
            supervisor,
            self.config.link_wait(),
            Arc::clone(&reset_requested),
            shutdown_rx.clone(),
        ));

        let monitor_task = tokio::spawn(run_monitor(
            self.bus,
            self.tracker,
            self.config,
            sink,
            state_rx.clone(),
            shutdown_rx,
        ));

        SessionHandle {
            shutdown: shutdown_tx,
            reset_requested,
            state: state_rx,
            motion_task,
            monitor_task,
        }
    }
}

pub struct SessionHandle {
    shutdown: watch::Sender<bool>,
    reset_requested: Arc<AtomicBool>,
    state: watch::Receiver<SupervisorState>,
    motion_task: JoinHandle<SupervisorStats>,
    monitor_task: JoinHandle<(HeartbeatStats, ReporterStats)>,
}

impl SessionHandle {
    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.state.clone()
    }

    /// Receiver that flips to `true` on shutdown, for collaborators such as a simulated bus.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Asks the motion task to restart the supervisor from `Disabled` at its next cycle.
    pub fn request_reset(&self) {
        self.reset_requested.store(true, Ordering::Release);
    }

    pub async fn shutdown(self) -> Result<SessionSummary, SupervisorError> {
        let _ = self.shutdown.send(true);
        let supervisor = self.motion_task.await?;
        let (heartbeat, telemetry) = self.monitor_task.await?;
        let final_state = *self.state.borrow();

        info!("🛑 Supervisory session stopped in {}", final_state);
        Ok(SessionSummary {
            final_state,
            supervisor,
            heartbeat,
            telemetry,
        })
    }
}

async fn run_motion<B: FieldBus + 'static>(
    bus: Arc<B>,
    mut supervisor: MotionSupervisor,
    link_wait: Duration,
    reset_requested: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
) -> SupervisorStats {
    let motion_period = supervisor.config().motion_period();

    loop {
        if *shutdown.borrow() {
            break;
        }
        if reset_requested.swap(false, Ordering::AcqRel) {
            supervisor.reset();
        }

        let pause = match supervisor.tick(bus.as_ref()).await {
            Ok(TickOutcome::LinkNotReady) => link_wait,
            Ok(TickOutcome::Executed { .. }) => motion_period,
            Err(e) => {
                warn!("⚠️ Supervisor tick failed: {}", e);
                motion_period
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    debug!("Motion task exiting after {} ticks", supervisor.stats().ticks);
    *supervisor.stats()
}

async fn run_monitor<B: FieldBus + 'static, S: TelemetrySink>(
    bus: Arc<B>,
    tracker: Arc<LivenessTracker>,
    config: SupervisorConfig,
    sink: S,
    state: watch::Receiver<SupervisorState>,
    mut shutdown: watch::Receiver<bool>,
) -> (HeartbeatStats, ReporterStats) {
    let mut heartbeat = HeartbeatMonitor::new(config.node_id, config.liveness_threshold_ms);
    let mut reporter = TelemetryReporter::new();
    let mut interval = tokio::time::interval(config.monitor_period());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        if !bus.is_link_ready() {
            continue;
        }

        if let Err(e) = heartbeat.poll(bus.as_ref(), &tracker) {
            warn!("Heartbeat re-sync failed: {}", e);
        }

        match DeviceSnapshot::read_from(bus.as_ref()) {
            Ok(snapshot) => {
                let current = *state.borrow();
                reporter.report(tracker.now_ms(), &snapshot, current, &sink);
            }
            Err(e) => debug!("Skipping telemetry report: {}", e),
        }
    }

    (*heartbeat.stats(), *reporter.stats())
}
