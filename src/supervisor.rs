//! Drive supervisory state machine.
//!
//! A tick is split in three parts:
//! - [`decide_action`] looks at the fresh [`DeviceSnapshot`] and picks the next state and
//!   action (pure, no time, no bus);
//! - [`Action::plan`] expands the action into flag/dwell/dispatch [`Step`]s;
//! - [`MotionSupervisor::tick`] executes the plan against the bus, sleeping through the
//!   dwells on the supervisor's own task.

use crate::bus::FieldBus;
use crate::command::{CommandEncoder, MotionCommand};
use crate::config::{DwellTimings, SupervisorConfig};
use crate::control::{ControlState, ControlWord};
use crate::error::SupervisorError;
use crate::status::{error_code, DeviceSnapshot, WarnWord};
use heapless::Vec;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const MAX_TRANSITION_HISTORY: usize = 32;
pub const MAX_PLAN_STEPS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SupervisorState {
    Disabled,
    Enabling,
    Homing,
    ActiveIdle,
    Moving,
    FaultRecoverable,
    /// Terminal for the session; left only through [`MotionSupervisor::reset`].
    FaultUnknown,
}

impl SupervisorState {
    pub fn label(self) -> &'static str {
        match self {
            SupervisorState::Disabled => "DISABLED",
            SupervisorState::Enabling => "ENABLING",
            SupervisorState::Homing => "HOMING",
            SupervisorState::ActiveIdle => "ACTIVE_IDLE",
            SupervisorState::Moving => "MOVING",
            SupervisorState::FaultRecoverable => "FAULT_RECOVERABLE",
            SupervisorState::FaultUnknown => "FAULT_UNKNOWN",
        }
    }

    /// Numeric code forwarded to the dashboard.
    pub fn code(self) -> u8 {
        match self {
            SupervisorState::Disabled => 0,
            SupervisorState::Enabling => 1,
            SupervisorState::Homing => 2,
            SupervisorState::ActiveIdle => 3,
            SupervisorState::Moving => 4,
            SupervisorState::FaultRecoverable => 5,
            SupervisorState::FaultUnknown => 6,
        }
    }

    pub fn is_fault(self) -> bool {
        matches!(self, SupervisorState::FaultRecoverable | SupervisorState::FaultUnknown)
    }
}

impl core::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    /// Pulse error acknowledge for a known error code.
    AcknowledgeError { code: u16 },
    /// Drop and re-assert switch-on so the drive sees a clean rising edge.
    ToggleEnable,
    Home,
    DispatchMove,
    /// Unknown error: do nothing but wait.
    Backoff { code: u16 },
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    AddFlag(ControlWord),
    RemoveFlag(ControlWord),
    Dwell(Duration),
    DispatchMove,
}

pub type Plan = Vec<Step, MAX_PLAN_STEPS>;

fn plan_of(steps: &[Step]) -> Plan {
    debug_assert!(steps.len() <= MAX_PLAN_STEPS, "Plan of {} steps exceeds capacity", steps.len());
    steps.iter().copied().collect()
}

impl Action {
    pub fn plan(self, dwell: &DwellTimings) -> Plan {
        let ms = Duration::from_millis;
        match self {
            Action::AcknowledgeError { .. } => plan_of(&[
                Step::AddFlag(ControlWord::ERROR_ACKNOWLEDGE),
                Step::Dwell(ms(dwell.acknowledge_ms)),
                Step::RemoveFlag(ControlWord::ERROR_ACKNOWLEDGE),
                Step::Dwell(ms(dwell.acknowledge_ms)),
            ]),
            Action::ToggleEnable => plan_of(&[
                Step::RemoveFlag(ControlWord::SWITCH_ON),
                Step::Dwell(ms(dwell.enable_off_ms)),
                Step::AddFlag(ControlWord::SWITCH_ON),
                Step::Dwell(ms(dwell.enable_on_ms)),
            ]),
            Action::Home => plan_of(&[
                Step::AddFlag(ControlWord::HOME),
                Step::Dwell(ms(dwell.home_hold_ms)),
                Step::RemoveFlag(ControlWord::HOME),
                Step::Dwell(ms(dwell.home_release_ms)),
            ]),
            Action::DispatchMove => plan_of(&[
                Step::DispatchMove,
                Step::Dwell(ms(dwell.move_settle_ms)),
            ]),
            Action::Backoff { .. } => plan_of(&[Step::Dwell(ms(dwell.fault_backoff_ms))]),
            Action::Idle => Plan::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// State entered for the duration of the action.
    pub state: SupervisorState,
    pub action: Action,
    /// State entered once the action's plan completed, if different.
    pub settles_to: Option<SupervisorState>,
}

impl Decision {
    fn new(state: SupervisorState, action: Action) -> Self {
        Self {
            state,
            action,
            settles_to: None,
        }
    }

    pub fn final_state(&self) -> SupervisorState {
        self.settles_to.unwrap_or(self.state)
    }
}

/// Chooses the next state and action, in strict priority order: error, not enabled,
/// not homed, ready to move, otherwise idle.
pub fn decide_action(current: SupervisorState, snapshot: &DeviceSnapshot) -> Decision {
    if current == SupervisorState::FaultUnknown {
        return Decision::new(
            SupervisorState::FaultUnknown,
            Action::Backoff { code: snapshot.error_word },
        );
    }

    if snapshot.has_error() {
        let code = snapshot.error_word;
        return if error_code::is_recoverable(code) {
            Decision::new(SupervisorState::FaultRecoverable, Action::AcknowledgeError { code })
        } else {
            Decision::new(SupervisorState::FaultUnknown, Action::Backoff { code })
        };
    }

    if !snapshot.is_enabled() {
        return Decision::new(SupervisorState::Enabling, Action::ToggleEnable);
    }

    let homed = snapshot.is_homed();
    let moving = snapshot.is_moving();

    if !homed && !moving {
        return Decision {
            state: SupervisorState::Homing,
            action: Action::Home,
            settles_to: Some(SupervisorState::ActiveIdle),
        };
    }

    if snapshot.is_switched_on() && homed && !moving {
        return Decision::new(SupervisorState::ActiveIdle, Action::DispatchMove);
    }

    let state = if moving { SupervisorState::Moving } else { current };
    Decision::new(state, Action::Idle)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: SupervisorState,
    pub to: SupervisorState,
    pub at_ms: u64,
    pub status_word: u16,
    pub error_word: u16,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SupervisorStats {
    pub ticks: u32,
    pub link_wait_ticks: u32,
    pub acknowledge_pulses: u32,
    pub enable_attempts: u32,
    pub homing_runs: u32,
    pub moves_dispatched: u32,
    pub backoffs: u32,
    /// Ticks that had to clear a transient control flag left by an interrupted action.
    pub transient_releases: u32,
    pub transitions: u32,
    pub resets: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The link was not ready; nothing was read or written.
    LinkNotReady,
    Executed {
        decision: Decision,
        command: Option<MotionCommand>,
    },
}

pub struct MotionSupervisor {
    config: SupervisorConfig,
    state: SupervisorState,
    control: ControlState,
    encoder: CommandEncoder,
    stats: SupervisorStats,
    history: Vec<TransitionRecord, MAX_TRANSITION_HISTORY>,
    last_warnings: WarnWord,
    state_tx: watch::Sender<SupervisorState>,
    epoch: Instant,
}

impl MotionSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        let (state_tx, _) = watch::channel(SupervisorState::Disabled);
        Self {
            encoder: CommandEncoder::new(config.profile),
            config,
            state: SupervisorState::Disabled,
            control: ControlState::new(),
            stats: SupervisorStats::default(),
            history: Vec::new(),
            last_warnings: WarnWord::empty(),
            state_tx,
            epoch: Instant::now(),
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Read-only view of the current state for other tasks.
    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.state_tx.subscribe()
    }

    pub fn control_word(&self) -> ControlWord {
        self.control.word()
    }

    pub fn stats(&self) -> &SupervisorStats {
        &self.stats
    }

    pub fn history(&self) -> &[TransitionRecord] {
        &self.history
    }

    pub fn encoder(&self) -> &CommandEncoder {
        &self.encoder
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// One decision cycle. Dwells are awaited here, so the caller's task is the only one
    /// that waits on them.
    ///
    /// A bus error aborts the plan where it stands; any transient flag it had raised is
    /// released at the start of the next tick, before the drive is re-evaluated.
    pub async fn tick<B: FieldBus + ?Sized>(&mut self, bus: &B) -> Result<TickOutcome, SupervisorError> {
        self.stats.ticks = self.stats.ticks.saturating_add(1);

        if !bus.is_link_ready() {
            self.stats.link_wait_ticks = self.stats.link_wait_ticks.saturating_add(1);
            debug!("Fieldbus link not ready, deferring supervisor tick");
            return Ok(TickOutcome::LinkNotReady);
        }

        let released = self.control.release_transient(bus)?;
        if !released.is_empty() {
            self.stats.transient_releases = self.stats.transient_releases.saturating_add(1);
            warn!("Released control flags left by an interrupted action: {:?}", released);
        }

        let snapshot = DeviceSnapshot::read_from(bus)?;
        self.track_warnings(snapshot.warnings());

        let previous = self.state;
        let decision = decide_action(previous, &snapshot);
        self.transition(decision.state, &snapshot);
        self.announce(previous, &decision);

        let mut command = None;
        for step in decision.action.plan(&self.config.dwell) {
            match step {
                Step::AddFlag(flag) => self.control.add_flag(bus, flag)?,
                Step::RemoveFlag(flag) => self.control.remove_flag(bus, flag)?,
                Step::Dwell(duration) => tokio::time::sleep(duration).await,
                Step::DispatchMove => command = Some(self.encoder.dispatch(bus)?),
            }
        }

        if let Some(next) = decision.settles_to {
            self.transition(next, &snapshot);
        }

        Ok(TickOutcome::Executed { decision, command })
    }

    fn announce(&mut self, previous: SupervisorState, decision: &Decision) {
        match decision.action {
            Action::AcknowledgeError { code } => {
                self.stats.acknowledge_pulses = self.stats.acknowledge_pulses.saturating_add(1);
                info!(
                    "Drive is in a known error state ({}, {:#06x}). Acknowledging!",
                    error_code::describe(code),
                    code
                );
            }
            Action::Backoff { code } => {
                self.stats.backoffs = self.stats.backoffs.saturating_add(1);
                if previous == SupervisorState::FaultUnknown {
                    debug!("Drive still in unknown error state {:#06x}, backing off", code);
                } else {
                    error!(
                        "Drive is in an unknown error state {:#06x}! Unrecoverable, please restart drive",
                        code
                    );
                }
            }
            Action::ToggleEnable => {
                self.stats.enable_attempts = self.stats.enable_attempts.saturating_add(1);
                info!("Switching on drive");
            }
            Action::Home => {
                self.stats.homing_runs = self.stats.homing_runs.saturating_add(1);
                info!("Homing drive");
            }
            Action::DispatchMove => {
                self.stats.moves_dispatched = self.stats.moves_dispatched.saturating_add(1);
            }
            Action::Idle => {}
        }
    }

    fn track_warnings(&mut self, warnings: WarnWord) {
        if warnings == self.last_warnings {
            return;
        }
        let raised = warnings.difference(self.last_warnings);
        if !raised.is_empty() {
            warn!("Drive warnings raised: {:?}", raised.describe());
        }
        let cleared = self.last_warnings.difference(warnings);
        if !cleared.is_empty() {
            info!("Drive warnings cleared: {:?}", cleared.describe());
        }
        self.last_warnings = warnings;
    }

    fn transition(&mut self, next: SupervisorState, snapshot: &DeviceSnapshot) {
        if next == self.state {
            return;
        }

        debug!("Supervisor state {} -> {}", self.state, next);
        let record = TransitionRecord {
            from: self.state,
            to: next,
            at_ms: self.epoch.elapsed().as_millis() as u64,
            status_word: snapshot.status_word,
            error_word: snapshot.error_word,
        };

        // Keep the most recent transitions
        if self.history.is_full() {
            self.history.remove(0);
        }
        let _ = self.history.push(record);

        self.state = next;
        self.stats.transitions = self.stats.transitions.saturating_add(1);
        self.state_tx.send_replace(next);
    }

    /// Session reset: back to `Disabled` with a fresh control word and encoder.
    ///
    /// The drive is not written; the next tick re-derives everything from its status.
    pub fn reset(&mut self) {
        info!("Supervisor session reset from {}", self.state);
        self.state = SupervisorState::Disabled;
        self.control.reset();
        self.encoder.reset();
        self.history.clear();
        self.last_warnings = WarnWord::empty();
        self.stats.resets = self.stats.resets.saturating_add(1);
        self.state_tx.send_replace(SupervisorState::Disabled);
    }
}
