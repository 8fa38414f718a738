//! Drive status words and the per-tick device snapshot.
//!
//! Bit positions follow the drive's CANopen profile and must stay bit-exact.

use crate::bus::{monitoring_sub, status_sub, EntryId, FieldBus};
use crate::error::BusError;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Status word reported in sub 1 of the cyclic status frame.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StatusWord: u16 {
        const OPERATION_ENABLED = 1 << 0;
        const SWITCH_ON         = 1 << 1;
        const ERROR             = 1 << 3;
        const VOLTAGE_ENABLE    = 1 << 4;
        const WARNING           = 1 << 7;
        const AT_TARGET         = 1 << 10;
        const HOMED             = 1 << 11;
        const FATAL_ERROR       = 1 << 12;
        const MOTION_ACTIVE     = 1 << 13;
    }
}

bitflags! {
    /// Warn word reported in sub 4 of the cyclic status frame.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct WarnWord: u16 {
        const MOTOR_HOT_SENSOR          = 1 << 0;
        const MOTOR_SHORT_TIME_OVERLOAD = 1 << 1;
        const SUPPLY_VOLTAGE_LOW        = 1 << 2;
        const SUPPLY_VOLTAGE_HIGH       = 1 << 3;
        const DRIVE_HOT                 = 1 << 6;
        const NOT_HOMED                 = 1 << 7;
    }
}

/// Error codes the supervisor knows how to clear with an acknowledge pulse.
pub mod error_code {
    pub const CAN_BUS_GUARD_TIMEOUT: u16 = 0x00CD;
    pub const MOTION_CMD_WRONG_STATE: u16 = 0x0086;

    pub const RECOVERABLE: [u16; 2] = [CAN_BUS_GUARD_TIMEOUT, MOTION_CMD_WRONG_STATE];

    pub fn is_recoverable(code: u16) -> bool {
        RECOVERABLE.contains(&code)
    }

    pub fn describe(code: u16) -> &'static str {
        match code {
            CAN_BUS_GUARD_TIMEOUT => "CAN bus guard timeout",
            MOTION_CMD_WRONG_STATE => "motion command in wrong state",
            _ => "unknown drive error",
        }
    }
}

impl WarnWord {
    pub fn describe(self) -> heapless::Vec<&'static str, 6> {
        let mut labels = heapless::Vec::new();
        for (name, _) in self.iter_names() {
            let _ = labels.push(name);
        }
        labels
    }
}

/// Read-only view of the drive for a single tick.
///
/// Fields are read one after another while the bus layer keeps updating them, so no
/// cross-field consistency is implied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub status_word: u16,
    pub run_word: u16,
    pub error_word: u16,
    pub warn_word: u16,
    pub actual_position: u16,
    pub demand_position: u16,
    pub demand_current: u16,
    pub model_temp: u16,
    pub real_temp: u16,
    pub motor_voltage: u16,
    pub power_loss: u16,
}

impl DeviceSnapshot {
    pub fn read_from<B: FieldBus + ?Sized>(bus: &B) -> Result<Self, BusError> {
        Ok(Self {
            status_word: bus.read_u16(EntryId::STATUS, status_sub::STATUS_WORD)?,
            run_word: bus.read_u16(EntryId::STATUS, status_sub::RUN_WORD)?,
            error_word: bus.read_u16(EntryId::STATUS, status_sub::ERROR_WORD)?,
            warn_word: bus.read_u16(EntryId::STATUS, status_sub::WARN_WORD)?,
            actual_position: bus.read_u16(EntryId::MONITORING, monitoring_sub::ACTUAL_POSITION)?,
            demand_position: bus.read_u16(EntryId::MONITORING, monitoring_sub::DEMAND_POSITION)?,
            demand_current: bus.read_u16(EntryId::MONITORING, monitoring_sub::DEMAND_CURRENT)?,
            model_temp: bus.read_u16(EntryId::MONITORING, monitoring_sub::MODEL_TEMP)?,
            real_temp: bus.read_u16(EntryId::MONITORING, monitoring_sub::REAL_TEMP)?,
            motor_voltage: bus.read_u16(EntryId::MONITORING, monitoring_sub::MOTOR_VOLTAGE)?,
            power_loss: bus.read_u16(EntryId::MONITORING, monitoring_sub::POWER_LOSS)?,
        })
    }

    pub fn status(&self) -> StatusWord {
        StatusWord::from_bits_retain(self.status_word)
    }

    pub fn warnings(&self) -> WarnWord {
        WarnWord::from_bits_retain(self.warn_word)
    }

    pub fn is_enabled(&self) -> bool {
        self.status().contains(StatusWord::OPERATION_ENABLED)
    }

    pub fn is_switched_on(&self) -> bool {
        self.status().contains(StatusWord::SWITCH_ON)
    }

    pub fn is_homed(&self) -> bool {
        self.status().contains(StatusWord::HOMED)
    }

    pub fn is_moving(&self) -> bool {
        self.status().contains(StatusWord::MOTION_ACTIVE)
    }

    pub fn has_error(&self) -> bool {
        self.status().contains(StatusWord::ERROR)
    }

    /// Main state machine state of the drive, carried in the high byte of the run word.
    pub fn run_state(&self) -> u8 {
        ((self.run_word & 0xFF00) >> 8) as u8
    }
}
