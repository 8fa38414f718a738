//! Liveness tracking for the drive's cyclic status frame.
//!
//! The drive has no dedicated heartbeat object mapped, so every received status frame
//! counts as a heartbeat. The bus layer calls [`LivenessTracker::on_status_update_received`]
//! from its receive path; the monitor task polls [`HeartbeatMonitor::poll`] on its own
//! cadence and re-issues NMT "enter operational" while the frame is missing.

use crate::bus::{FieldBus, NmtCommand};
use crate::error::BusError;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::Instant;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Liveness {
    Alive,
    Stale,
}

/// `Stale` iff strictly more than `threshold_ms` elapsed since the last update.
pub fn check_liveness(now_ms: u64, last_update_ms: u64, threshold_ms: u64) -> Liveness {
    if now_ms.saturating_sub(last_update_ms) > threshold_ms {
        Liveness::Stale
    } else {
        Liveness::Alive
    }
}

/// Timestamp of the last status frame, shared between the bus layer and the monitor.
///
/// Times are milliseconds since the tracker was created (the session epoch), stored in an
/// atomic so the receive path never takes a lock.
#[derive(Debug)]
pub struct LivenessTracker {
    epoch: Instant,
    last_update_ms: AtomicU64,
    updates: AtomicU64,
}

impl LivenessTracker {
    /// Starts the session clock; the start counts as the first update.
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last_update_ms: AtomicU64::new(0),
            updates: AtomicU64::new(0),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub fn on_status_update_received(&self) {
        self.record_update_at(self.now_ms());
    }

    pub fn record_update_at(&self, at_ms: u64) {
        self.last_update_ms.store(at_ms, Ordering::Release);
        self.updates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn last_update_ms(&self) -> u64 {
        self.last_update_ms.load(Ordering::Acquire)
    }

    pub fn updates(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }

    pub fn check_liveness(&self, now_ms: u64, threshold_ms: u64) -> Liveness {
        check_liveness(now_ms, self.last_update_ms(), threshold_ms)
    }
}

impl Default for LivenessTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatReport {
    pub liveness: Liveness,
    pub since_last_update_ms: u64,
    /// Set on the one poll that sent the session's first "enter operational".
    pub sent_initial_enable: bool,
    /// Set when the poll re-issued "enter operational" because the link was stale.
    pub sent_resync: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct HeartbeatStats {
    pub checks: u32,
    pub stale_checks: u32,
    pub resync_commands: u32,
    pub outages: u32,
    pub longest_gap_ms: u64,
}

#[derive(Debug)]
pub struct HeartbeatMonitor {
    node_id: u8,
    threshold_ms: u64,
    has_sent_initial_enable: bool,
    in_outage: bool,
    stats: HeartbeatStats,
}

impl HeartbeatMonitor {
    pub fn new(node_id: u8, threshold_ms: u64) -> Self {
        Self {
            node_id,
            threshold_ms,
            has_sent_initial_enable: false,
            in_outage: false,
            stats: HeartbeatStats::default(),
        }
    }

    pub fn has_sent_initial_enable(&self) -> bool {
        self.has_sent_initial_enable
    }

    pub fn stats(&self) -> &HeartbeatStats {
        &self.stats
    }

    pub fn poll<B: FieldBus + ?Sized>(
        &mut self,
        bus: &B,
        tracker: &LivenessTracker,
    ) -> Result<HeartbeatReport, BusError> {
        self.poll_at(bus, tracker, tracker.now_ms())
    }

    /// One heartbeat cycle evaluated at `now_ms` on the tracker's clock.
    ///
    /// Liveness loss is reported, never returned as an error; only a failing NMT send is.
    pub fn poll_at<B: FieldBus + ?Sized>(
        &mut self,
        bus: &B,
        tracker: &LivenessTracker,
        now_ms: u64,
    ) -> Result<HeartbeatReport, BusError> {
        let mut report = HeartbeatReport {
            liveness: Liveness::Alive,
            since_last_update_ms: 0,
            sent_initial_enable: false,
            sent_resync: false,
        };

        if !self.has_sent_initial_enable {
            info!("Setting drive {:#04x} to operational state", self.node_id);
            bus.send_nmt(self.node_id, NmtCommand::EnterOperational)?;
            self.has_sent_initial_enable = true;
            report.sent_initial_enable = true;
        }

        let last_update_ms = tracker.last_update_ms();
        report.since_last_update_ms = now_ms.saturating_sub(last_update_ms);
        report.liveness = check_liveness(now_ms, last_update_ms, self.threshold_ms);

        self.stats.checks = self.stats.checks.saturating_add(1);
        self.stats.longest_gap_ms = self.stats.longest_gap_ms.max(report.since_last_update_ms);

        match report.liveness {
            Liveness::Stale => {
                self.stats.stale_checks = self.stats.stale_checks.saturating_add(1);
                if self.in_outage {
                    warn!(
                        "Still no status frame after {} ms, re-sending enter operational",
                        report.since_last_update_ms
                    );
                } else {
                    self.in_outage = true;
                    self.stats.outages = self.stats.outages.saturating_add(1);
                    error!(
                        "Have not received drive status in {} ms! Attempting to re-establish",
                        report.since_last_update_ms
                    );
                }
                bus.send_nmt(self.node_id, NmtCommand::EnterOperational)?;
                self.stats.resync_commands = self.stats.resync_commands.saturating_add(1);
                report.sent_resync = true;
            }
            Liveness::Alive => {
                if self.in_outage {
                    self.in_outage = false;
                    info!(
                        "Drive status frames resumed after {} stale checks",
                        self.stats.stale_checks
                    );
                }
            }
        }

        Ok(report)
    }
}
