//! In-process drive model implementing [`FieldBus`].
//!
//! The model keeps its own object dictionary and reacts to the control word and the
//! motion command the way the drive does: rising edges on switch-on and error
//! acknowledge, timed homing, point-to-point moves and the two recoverable errors. It
//! also plays the part of the bus driver: [`SimulatedDrive::step`] is the cyclic tick
//! that refreshes the status frame and resets the liveness timestamp.
//!
//! A passive drive ([`SimulatedDrive::passive`]) only records what is written to it,
//! which is what the decision tests want.

use crate::bus::{monitoring_sub, segment, status_sub, BusOp, EntryId, FieldBus, NmtCommand};
use crate::control::ControlWord;
use crate::error::BusError;
use crate::heartbeat::LivenessTracker;
use crate::status::{error_code, StatusWord, WarnWord};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const DEFAULT_HOMING_MS: u64 = 1500;
const AMBIENT_TEMP: u16 = 250; // 0.1 °C
const MAX_MODEL_TEMP: u16 = 800;
const NOMINAL_VOLTAGE: u16 = 720; // 0.1 V
const MAX_OPS_LOGGED: usize = 4096;

// Run word high byte
const RUN_NOT_READY: u8 = 0x00;
const RUN_READY_TO_SWITCH_ON: u8 = 0x02;
const RUN_ERROR: u8 = 0x04;
const RUN_OPERATION_ENABLED: u8 = 0x08;
const RUN_HOMING: u8 = 0x09;

#[derive(Debug, Clone, Copy)]
struct Motion {
    target: u16,
    velocity: u16,
}

#[derive(Debug)]
struct DriveState {
    reactive: bool,
    link_ready: bool,
    operational: bool,
    status_frames_enabled: bool,

    status: StatusWord,
    run_word: u16,
    error_word: u16,
    warn_word: u16,

    actual_position: u16,
    demand_position: u16,
    demand_current: u16,
    model_temp: u16,
    real_temp: u16,
    motor_voltage: u16,
    power_loss: u16,

    control_word: u16,
    pushed_control: ControlWord,
    command_header: u16,
    command_parameters: [u8; 8],
    last_accepted_header: Option<u16>,

    homing_ms: u64,
    homing_duration_ms: u64,
    motion: Option<Motion>,

    frames_published: u64,
    moves_completed: u32,
    ops: Vec<BusOp>,
}

impl DriveState {
    fn new(reactive: bool) -> Self {
        Self {
            reactive,
            link_ready: true,
            operational: !reactive,
            status_frames_enabled: true,
            status: StatusWord::empty(),
            run_word: u16::from(RUN_NOT_READY) << 8,
            error_word: 0,
            warn_word: WarnWord::NOT_HOMED.bits(),
            actual_position: 0,
            demand_position: 0,
            demand_current: 0,
            model_temp: AMBIENT_TEMP,
            real_temp: AMBIENT_TEMP,
            motor_voltage: NOMINAL_VOLTAGE,
            power_loss: 0,
            control_word: 0,
            pushed_control: ControlWord::empty(),
            command_header: 0,
            command_parameters: [0; 8],
            last_accepted_header: None,
            homing_ms: 0,
            homing_duration_ms: DEFAULT_HOMING_MS,
            motion: None,
            frames_published: 0,
            moves_completed: 0,
            ops: Vec::new(),
        }
    }

    fn log(&mut self, op: BusOp) {
        if self.ops.len() >= MAX_OPS_LOGGED {
            self.ops.remove(0);
        }
        self.ops.push(op);
    }

    fn raise_error(&mut self, code: u16) {
        warn!("Simulated drive raised error {:#06x} ({})", code, error_code::describe(code));
        self.error_word = code;
        self.status.insert(StatusWord::ERROR);
        self.status.remove(
            StatusWord::OPERATION_ENABLED | StatusWord::SWITCH_ON | StatusWord::MOTION_ACTIVE,
        );
        self.motion = None;
        self.homing_ms = 0;
    }

    fn on_control_pushed(&mut self, next: ControlWord) {
        let previous = self.pushed_control;
        self.pushed_control = next;
        if !self.reactive {
            return;
        }

        let rising = next.difference(previous);
        let falling = previous.difference(next);

        if self.status.contains(StatusWord::ERROR) {
            if rising.contains(ControlWord::ERROR_ACKNOWLEDGE) && error_code::is_recoverable(self.error_word) {
                info!("Simulated drive cleared error {:#06x}", self.error_word);
                self.error_word = 0;
                self.status.remove(StatusWord::ERROR);
            }
            return;
        }

        if falling.contains(ControlWord::SWITCH_ON) {
            self.status.remove(
                StatusWord::OPERATION_ENABLED | StatusWord::SWITCH_ON | StatusWord::MOTION_ACTIVE,
            );
            self.motion = None;
            self.homing_ms = 0;
        }
        if rising.contains(ControlWord::SWITCH_ON) {
            self.status.insert(
                StatusWord::OPERATION_ENABLED | StatusWord::SWITCH_ON | StatusWord::VOLTAGE_ENABLE,
            );
        }
        if falling.contains(ControlWord::HOME) && !self.status.contains(StatusWord::HOMED) {
            self.homing_ms = 0;
            self.status.remove(StatusWord::MOTION_ACTIVE);
        }
    }

    fn on_command_pushed(&mut self) {
        if !self.reactive || self.last_accepted_header == Some(self.command_header) {
            return;
        }
        self.last_accepted_header = Some(self.command_header);

        let ready = self.status.contains(StatusWord::OPERATION_ENABLED | StatusWord::HOMED)
            && !self.pushed_control.contains(ControlWord::HOME)
            && !self.status.contains(StatusWord::ERROR);
        if !ready {
            self.raise_error(error_code::MOTION_CMD_WRONG_STATE);
            return;
        }

        let p = self.command_parameters;
        let target = u16::from_le_bytes([p[0], p[1]]);
        let velocity = u16::from_le_bytes([p[2], p[3]]).max(1);
        debug!("Simulated drive accepted move to {:#06x}", target);
        self.demand_position = target;
        self.motion = Some(Motion { target, velocity });
        self.status.insert(StatusWord::MOTION_ACTIVE);
        self.status.remove(StatusWord::AT_TARGET);
    }

    fn advance(&mut self, dt_ms: u64) {
        let enabled = self.status.contains(StatusWord::OPERATION_ENABLED);

        if enabled && self.pushed_control.contains(ControlWord::HOME) && !self.status.contains(StatusWord::HOMED) {
            self.status.insert(StatusWord::MOTION_ACTIVE);
            self.homing_ms += dt_ms;
            if self.homing_ms >= self.homing_duration_ms {
                self.status.insert(StatusWord::HOMED);
                self.status.remove(StatusWord::MOTION_ACTIVE);
                self.warn_word &= !WarnWord::NOT_HOMED.bits();
                self.actual_position = 0;
                self.demand_position = 0;
            }
        }

        if let Some(motion) = self.motion {
            let step = ((u64::from(motion.velocity) * dt_ms) / 10_000).max(1);
            let step = u16::try_from(step).unwrap_or(u16::MAX);
            let position = self.actual_position;
            self.actual_position = if position < motion.target {
                position.saturating_add(step).min(motion.target)
            } else {
                position.saturating_sub(step).max(motion.target)
            };
            self.demand_current = 120;
            if self.actual_position == motion.target {
                self.motion = None;
                self.moves_completed = self.moves_completed.wrapping_add(1);
                self.status.remove(StatusWord::MOTION_ACTIVE);
                self.status.insert(StatusWord::AT_TARGET);
            }
        } else {
            self.demand_current = if enabled { 15 } else { 0 };
        }

        // First-order thermal model: heat with current, cool towards ambient.
        let heating = self.demand_current / 40;
        let cooling = u16::from(self.model_temp > AMBIENT_TEMP);
        self.model_temp = (self.model_temp + heating).saturating_sub(cooling).min(MAX_MODEL_TEMP);
        self.real_temp = (self.real_temp * 7 + self.model_temp) / 8;
        self.power_loss = self.demand_current / 4;

        let run_state = if self.status.contains(StatusWord::ERROR) {
            RUN_ERROR
        } else if self.pushed_control.contains(ControlWord::HOME) && enabled && !self.status.contains(StatusWord::HOMED) {
            RUN_HOMING
        } else if enabled {
            RUN_OPERATION_ENABLED
        } else if self.operational {
            RUN_READY_TO_SWITCH_ON
        } else {
            RUN_NOT_READY
        };
        self.run_word = (u16::from(run_state) << 8) | (self.run_word & 0x00FF);
    }
}

#[derive(Debug)]
pub struct SimulatedDrive {
    state: Mutex<DriveState>,
    liveness: Mutex<Option<Arc<LivenessTracker>>>,
}

impl SimulatedDrive {
    /// A drive that reacts to the control word and commands.
    ///
    /// It starts pre-operational: status frames only flow after NMT "enter operational".
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DriveState::new(true)),
            liveness: Mutex::new(None),
        }
    }

    /// A drive whose dictionary only changes through the test setters.
    pub fn passive() -> Self {
        Self {
            state: Mutex::new(DriveState::new(false)),
            liveness: Mutex::new(None),
        }
    }

    /// Registers the tracker reset by every published status frame.
    pub fn attach_liveness(&self, tracker: Arc<LivenessTracker>) {
        *self.liveness.lock().unwrap_or_else(PoisonError::into_inner) = Some(tracker);
    }

    fn bus_state(&self) -> Result<MutexGuard<'_, DriveState>, BusError> {
        self.state.lock().map_err(|_| BusError::LockPoisoned)
    }

    fn model(&self) -> MutexGuard<'_, DriveState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// One bus cycle: advance the model by `dt_ms` and publish the status frame.
    pub fn step(&self, dt_ms: u64) {
        let published = {
            let mut state = self.model();
            if state.reactive {
                state.advance(dt_ms);
            }
            let publish = state.link_ready && state.operational && state.status_frames_enabled;
            if publish {
                state.frames_published += 1;
            }
            publish
        };

        if published {
            if let Some(tracker) = self.liveness.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
                tracker.on_status_update_received();
            }
        }
    }

    /// Runs [`SimulatedDrive::step`] on a fixed period until `shutdown` flips to true.
    pub fn spawn_cycle(
        self: Arc<Self>,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            let dt_ms = period.as_millis() as u64;
            loop {
                tokio::select! {
                    _ = interval.tick() => self.step(dt_ms),
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    // Fault injection and test setters

    pub fn set_status(&self, status: StatusWord) {
        self.model().status = status;
    }

    pub fn set_error(&self, code: u16) {
        let mut state = self.model();
        state.error_word = code;
        state.status.insert(StatusWord::ERROR);
    }

    /// Raises a drive error the way the drive does: error bit set, power stage disabled.
    pub fn inject_error(&self, code: u16) {
        self.model().raise_error(code);
    }

    pub fn set_warnings(&self, warnings: WarnWord) {
        self.model().warn_word = warnings.bits();
    }

    pub fn set_link_ready(&self, ready: bool) {
        self.model().link_ready = ready;
    }

    /// Stops the cyclic status frame without touching link readiness.
    pub fn set_status_frames_enabled(&self, enabled: bool) {
        self.model().status_frames_enabled = enabled;
    }

    /// Drops the drive out of the operational state; on recovery it reports a bus
    /// guard timeout, as the drive does after missing its guard window.
    pub fn interrupt_link(&self) {
        let mut state = self.model();
        state.operational = false;
        if state.reactive {
            state.raise_error(error_code::CAN_BUS_GUARD_TIMEOUT);
        }
    }

    pub fn set_homing_duration(&self, duration: Duration) {
        self.model().homing_duration_ms = duration.as_millis() as u64;
    }

    pub fn status(&self) -> StatusWord {
        self.model().status
    }

    pub fn error_word(&self) -> u16 {
        self.model().error_word
    }

    pub fn is_operational(&self) -> bool {
        self.model().operational
    }

    pub fn actual_position(&self) -> u16 {
        self.model().actual_position
    }

    pub fn frames_published(&self) -> u64 {
        self.model().frames_published
    }

    pub fn moves_completed(&self) -> u32 {
        self.model().moves_completed
    }

    pub fn control_word(&self) -> u16 {
        self.model().control_word
    }

    pub fn command_parameters(&self) -> [u8; 8] {
        self.model().command_parameters
    }

    pub fn ops(&self) -> Vec<BusOp> {
        self.model().ops.clone()
    }

    pub fn take_ops(&self) -> Vec<BusOp> {
        std::mem::take(&mut self.model().ops)
    }
}

impl Default for SimulatedDrive {
    fn default() -> Self {
        Self::new()
    }
}

impl FieldBus for SimulatedDrive {
    fn read_u16(&self, entry: EntryId, sub: u8) -> Result<u16, BusError> {
        let state = self.bus_state()?;
        let value = match (entry, sub) {
            (EntryId::STATUS, status_sub::STATUS_WORD) => state.status.bits(),
            (EntryId::STATUS, status_sub::RUN_WORD) => state.run_word,
            (EntryId::STATUS, status_sub::ERROR_WORD) => state.error_word,
            (EntryId::STATUS, status_sub::WARN_WORD) => state.warn_word,
            (EntryId::CONTROL_WORD, 0x00) => state.control_word,
            (EntryId::COMMAND_HEADER, 0x00) => state.command_header,
            (EntryId::COMMAND_PARAMETERS, 1..=8) => u16::from(state.command_parameters[usize::from(sub - 1)]),
            (EntryId::MONITORING, monitoring_sub::ACTUAL_POSITION) => state.actual_position,
            (EntryId::MONITORING, monitoring_sub::DEMAND_POSITION) => state.demand_position,
            (EntryId::MONITORING, monitoring_sub::DEMAND_CURRENT) => state.demand_current,
            (EntryId::MONITORING, monitoring_sub::MODEL_TEMP) => state.model_temp,
            (EntryId::MONITORING, monitoring_sub::REAL_TEMP) => state.real_temp,
            (EntryId::MONITORING, monitoring_sub::MOTOR_VOLTAGE) => state.motor_voltage,
            (EntryId::MONITORING, monitoring_sub::POWER_LOSS) => state.power_loss,
            _ => return Err(BusError::EntryNotMapped { entry, sub }),
        };
        Ok(value)
    }

    fn write_u16(&self, entry: EntryId, sub: u8, value: u16) -> Result<(), BusError> {
        let mut state = self.bus_state()?;
        if !state.link_ready {
            return Err(BusError::LinkDown);
        }
        match (entry, sub) {
            (EntryId::CONTROL_WORD, 0x00) => state.control_word = value,
            (EntryId::COMMAND_HEADER, 0x00) => state.command_header = value,
            _ => return Err(BusError::EntryNotMapped { entry, sub }),
        }
        state.log(BusOp::Write { entry, sub, value });
        Ok(())
    }

    fn write_u8(&self, entry: EntryId, sub: u8, value: u8) -> Result<(), BusError> {
        let mut state = self.bus_state()?;
        if !state.link_ready {
            return Err(BusError::LinkDown);
        }
        match (entry, sub) {
            (EntryId::COMMAND_PARAMETERS, 1..=8) => state.command_parameters[usize::from(sub - 1)] = value,
            _ => return Err(BusError::EntryNotMapped { entry, sub }),
        }
        state.log(BusOp::Write { entry, sub, value: u16::from(value) });
        Ok(())
    }

    fn request_push(&self, entry: EntryId, segment: u8) -> Result<(), BusError> {
        let mut state = self.bus_state()?;
        if !state.link_ready {
            return Err(BusError::LinkDown);
        }
        match (entry, segment) {
            (EntryId::CONTROL_WORD, segment::CONTROL_WORD) => {
                let next = ControlWord::from_bits_retain(state.control_word);
                state.on_control_pushed(next);
            }
            (EntryId::COMMAND_HEADER, segment::COMMAND_HEADER) => {}
            (EntryId::COMMAND_PARAMETERS, segment::COMMAND_PARAMETERS) => state.on_command_pushed(),
            _ => return Err(BusError::EntryNotMapped { entry, sub: segment }),
        }
        state.log(BusOp::Push { entry, segment });
        Ok(())
    }

    fn send_nmt(&self, node_id: u8, command: NmtCommand) -> Result<(), BusError> {
        let mut state = self.bus_state()?;
        if !state.link_ready {
            return Err(BusError::LinkDown);
        }
        match command {
            NmtCommand::EnterOperational => state.operational = true,
            NmtCommand::EnterPreOperational | NmtCommand::EnterStopped => state.operational = false,
            NmtCommand::ResetNode | NmtCommand::ResetCommunication => {
                let ops = std::mem::take(&mut state.ops);
                let reactive = state.reactive;
                *state = DriveState::new(reactive);
                state.ops = ops;
            }
        }
        state.log(BusOp::Nmt { node_id, command });
        Ok(())
    }

    fn is_link_ready(&self) -> bool {
        self.model().link_ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_control(drive: &SimulatedDrive, word: ControlWord) {
        drive.write_u16(EntryId::CONTROL_WORD, 0, word.bits()).unwrap();
        drive.request_push(EntryId::CONTROL_WORD, segment::CONTROL_WORD).unwrap();
    }

    #[test]
    fn test_switch_on_edge_enables_drive() {
        let drive = SimulatedDrive::new();
        push_control(&drive, ControlWord::empty());
        assert!(!drive.status().contains(StatusWord::OPERATION_ENABLED));

        push_control(&drive, ControlWord::SWITCH_ON);
        assert!(drive.status().contains(StatusWord::OPERATION_ENABLED | StatusWord::SWITCH_ON));
    }

    #[test]
    fn test_homing_completes_after_duration() {
        let drive = SimulatedDrive::new();
        drive.set_homing_duration(Duration::from_millis(100));
        push_control(&drive, ControlWord::SWITCH_ON);
        push_control(&drive, ControlWord::SWITCH_ON | ControlWord::HOME);

        drive.step(50);
        assert!(drive.status().contains(StatusWord::MOTION_ACTIVE));
        assert!(!drive.status().contains(StatusWord::HOMED));

        drive.step(50);
        assert!(drive.status().contains(StatusWord::HOMED));
        assert!(!drive.status().contains(StatusWord::MOTION_ACTIVE));
    }

    #[test]
    fn test_only_recoverable_errors_clear_on_acknowledge() {
        let drive = SimulatedDrive::new();
        drive.inject_error(0x0F00);
        push_control(&drive, ControlWord::ERROR_ACKNOWLEDGE);
        assert!(drive.status().contains(StatusWord::ERROR));

        push_control(&drive, ControlWord::empty());
        drive.inject_error(error_code::CAN_BUS_GUARD_TIMEOUT);
        push_control(&drive, ControlWord::ERROR_ACKNOWLEDGE);
        assert!(!drive.status().contains(StatusWord::ERROR));
        assert_eq!(drive.error_word(), 0);
    }

    #[test]
    fn test_motion_command_while_homing_is_rejected() {
        let drive = SimulatedDrive::new();
        push_control(&drive, ControlWord::SWITCH_ON | ControlWord::HOME);
        drive.write_u16(EntryId::COMMAND_HEADER, 0, 0x0900).unwrap();
        drive.request_push(EntryId::COMMAND_PARAMETERS, segment::COMMAND_PARAMETERS).unwrap();
        assert_eq!(drive.error_word(), error_code::MOTION_CMD_WRONG_STATE);
    }

    #[test]
    fn test_frames_only_flow_when_operational() {
        let drive = SimulatedDrive::new();
        drive.step(10);
        assert_eq!(drive.frames_published(), 0);

        drive.send_nmt(0x3F, NmtCommand::EnterOperational).unwrap();
        drive.step(10);
        assert_eq!(drive.frames_published(), 1);
    }

    #[test]
    fn test_unmapped_entry_is_rejected() {
        let drive = SimulatedDrive::passive();
        let result = drive.read_u16(EntryId(0x1000), 0);
        assert_eq!(result, Err(BusError::EntryNotMapped { entry: EntryId(0x1000), sub: 0 }));
    }

    #[test]
    fn test_writes_fail_while_link_down() {
        let drive = SimulatedDrive::passive();
        drive.set_link_ready(false);
        assert_eq!(drive.write_u16(EntryId::CONTROL_WORD, 0, 1), Err(BusError::LinkDown));
        assert!(drive.ops().is_empty());
    }
}
