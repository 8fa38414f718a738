//! Narrow access contract to the CANopen stack.
//!
//! The supervisor never touches frames or PDO mapping directly. Everything it needs from
//! the bus goes through [`FieldBus`]: dictionary reads and writes, an out-of-cycle push of
//! a mapped entry, and the NMT "enter operational" command.

use crate::error::BusError;
use serde::{Deserialize, Serialize};

/// Object dictionary index of an entry exposed by the drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryId(pub u16);

impl EntryId {
    /// Cyclic status frame: sub 1 status word, 2 run word, 3 error word, 4 warn word.
    pub const STATUS: EntryId = EntryId(0x2110);
    /// Control word, sub 0.
    pub const CONTROL_WORD: EntryId = EntryId(0x2111);
    /// Motion command header, sub 0.
    pub const COMMAND_HEADER: EntryId = EntryId(0x2112);
    /// Motion command parameters, subs 1..=8 written byte-wise.
    pub const COMMAND_PARAMETERS: EntryId = EntryId(0x2113);
    /// Monitoring channels: position, current, temperatures, voltage, power loss.
    pub const MONITORING: EntryId = EntryId(0x2114);
}

impl core::fmt::Display for EntryId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

pub mod status_sub {
    pub const STATUS_WORD: u8 = 0x01;
    pub const RUN_WORD: u8 = 0x02;
    pub const ERROR_WORD: u8 = 0x03;
    pub const WARN_WORD: u8 = 0x04;
}

pub mod monitoring_sub {
    pub const ACTUAL_POSITION: u8 = 0x01;
    pub const DEMAND_POSITION: u8 = 0x02;
    pub const DEMAND_CURRENT: u8 = 0x03;
    pub const MODEL_TEMP: u8 = 0x04;
    pub const REAL_TEMP: u8 = 0x05;
    pub const MOTOR_VOLTAGE: u8 = 0x06;
    pub const POWER_LOSS: u8 = 0x07;
}

/// Process-data segment selectors used with [`FieldBus::request_push`].
pub mod segment {
    pub const CONTROL_WORD: u8 = 0x00;
    /// TPDO carrying the command header and the first parameter bytes.
    pub const COMMAND_HEADER: u8 = 0x01;
    /// TPDO carrying the trailing parameter bytes.
    pub const COMMAND_PARAMETERS: u8 = 0x07;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NmtCommand {
    EnterOperational,
    EnterPreOperational,
    EnterStopped,
    ResetNode,
    ResetCommunication,
}

impl NmtCommand {
    /// Command specifier as carried in the NMT frame.
    pub fn code(self) -> u8 {
        match self {
            NmtCommand::EnterOperational => 0x01,
            NmtCommand::EnterStopped => 0x02,
            NmtCommand::EnterPreOperational => 0x80,
            NmtCommand::ResetNode => 0x81,
            NmtCommand::ResetCommunication => 0x82,
        }
    }
}

/// Access facade over a connected, cyclically exchanging CANopen stack.
///
/// Implementations are shared between the supervisor task and the monitor task, so all
/// methods take `&self` and must serialise access to the dictionary internally.
pub trait FieldBus: Send + Sync {
    fn read_u16(&self, entry: EntryId, sub: u8) -> Result<u16, BusError>;
    fn write_u16(&self, entry: EntryId, sub: u8, value: u16) -> Result<(), BusError>;
    fn write_u8(&self, entry: EntryId, sub: u8, value: u8) -> Result<(), BusError>;
    /// Forces an out-of-cycle transmission of a mapped process-data entry.
    fn request_push(&self, entry: EntryId, segment: u8) -> Result<(), BusError>;
    fn send_nmt(&self, node_id: u8, command: NmtCommand) -> Result<(), BusError>;
    fn is_link_ready(&self) -> bool;
}

impl<T: FieldBus + ?Sized> FieldBus for std::sync::Arc<T> {
    fn read_u16(&self, entry: EntryId, sub: u8) -> Result<u16, BusError> {
        (**self).read_u16(entry, sub)
    }

    fn write_u16(&self, entry: EntryId, sub: u8, value: u16) -> Result<(), BusError> {
        (**self).write_u16(entry, sub, value)
    }

    fn write_u8(&self, entry: EntryId, sub: u8, value: u8) -> Result<(), BusError> {
        (**self).write_u8(entry, sub, value)
    }

    fn request_push(&self, entry: EntryId, segment: u8) -> Result<(), BusError> {
        (**self).request_push(entry, segment)
    }

    fn send_nmt(&self, node_id: u8, command: NmtCommand) -> Result<(), BusError> {
        (**self).send_nmt(node_id, command)
    }

    fn is_link_ready(&self) -> bool {
        (**self).is_link_ready()
    }
}

/// One observable operation issued through the facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BusOp {
    Write { entry: EntryId, sub: u8, value: u16 },
    Push { entry: EntryId, segment: u8 },
    Nmt { node_id: u8, command: NmtCommand },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_id_display() {
        assert_eq!(EntryId::STATUS.to_string(), "0x2110");
        assert_eq!(EntryId::COMMAND_PARAMETERS.to_string(), "0x2113");
    }

    #[test]
    fn test_nmt_command_codes() {
        assert_eq!(NmtCommand::EnterOperational.code(), 0x01);
        assert_eq!(NmtCommand::ResetCommunication.code(), 0x82);
    }
}
