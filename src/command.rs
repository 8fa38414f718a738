//! Motion command encoding for the drive's "VAI 16-bit go to position" command (090xh).

use crate::bus::{segment, EntryId, FieldBus};
use crate::config::MotionProfile;
use crate::error::BusError;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;
use tracing::info;

/// Command family tag carried in the header's high byte.
pub const GO_TO_POSITION_FAMILY: u8 = 0x09;
const GO_TO_POSITION_SUB_ID: u8 = 0x00;

/// The counter lives in a 4-bit header field.
const SEQUENCE_BITS: u32 = 4;
const SEQUENCE_MODULUS: u8 = 1 << SEQUENCE_BITS;
const_assert_eq!(SEQUENCE_MODULUS, 16);

/// Parameter words carried after the header, each split into two bytes.
const PARAMETER_WORDS: usize = 4;
const_assert_eq!(PARAMETER_WORDS * 2, 8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotionCommand {
    pub sequence_counter: u8,
    pub target_position: u16,
    pub velocity: u16,
    pub acceleration: u16,
    pub deceleration: u16,
}

impl MotionCommand {
    pub fn header(&self) -> u16 {
        (u16::from(GO_TO_POSITION_FAMILY) << 8)
            | (u16::from(GO_TO_POSITION_SUB_ID & 0x0F) << 4)
            | u16::from(self.sequence_counter & 0x0F)
    }

    /// Parameter block as written to subs 1..=8: little-endian words in order target
    /// position, velocity, acceleration, deceleration.
    pub fn parameter_bytes(&self) -> [u8; PARAMETER_WORDS * 2] {
        let mut bytes = [0u8; PARAMETER_WORDS * 2];
        let words = [
            self.target_position,
            self.velocity,
            self.acceleration,
            self.deceleration,
        ];
        for (chunk, word) in bytes.chunks_exact_mut(2).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        bytes
    }
}

/// Builds successive motion commands, owning the rolling sequence counter and the
/// set-point alternation.
#[derive(Debug)]
pub struct CommandEncoder {
    profile: MotionProfile,
    next_sequence: u8,
    last_target: Option<u16>,
    dispatched: u32,
}

impl CommandEncoder {
    pub fn new(profile: MotionProfile) -> Self {
        Self {
            profile,
            next_sequence: 0,
            last_target: None,
            dispatched: 0,
        }
    }

    pub fn profile(&self) -> &MotionProfile {
        &self.profile
    }

    pub fn last_target(&self) -> Option<u16> {
        self.last_target
    }

    pub fn dispatched(&self) -> u32 {
        self.dispatched
    }

    /// Produces the next command and advances the counter and the alternation.
    pub fn build(&mut self) -> MotionCommand {
        let target_position = if self.last_target == Some(self.profile.set_point_a) {
            self.profile.set_point_b
        } else {
            self.profile.set_point_a
        };

        let command = MotionCommand {
            sequence_counter: self.next_sequence,
            target_position,
            velocity: self.profile.max_velocity,
            acceleration: self.profile.acceleration,
            deceleration: self.profile.deceleration,
        };

        // NASA Rule 5: Safety assertion for header field width
        debug_assert!(
            command.sequence_counter < SEQUENCE_MODULUS,
            "Sequence counter {} exceeds 4-bit field",
            command.sequence_counter
        );

        self.next_sequence = (self.next_sequence + 1) % SEQUENCE_MODULUS;
        self.last_target = Some(target_position);
        command
    }

    /// Builds the next command, writes header and parameters to the dictionary and
    /// requests a push of both process-data segments.
    pub fn dispatch<B: FieldBus + ?Sized>(&mut self, bus: &B) -> Result<MotionCommand, BusError> {
        let command = self.build();

        bus.write_u16(EntryId::COMMAND_HEADER, 0x00, command.header())?;
        for (sub, byte) in (1u8..).zip(command.parameter_bytes()) {
            bus.write_u8(EntryId::COMMAND_PARAMETERS, sub, byte)?;
        }

        bus.request_push(EntryId::COMMAND_HEADER, segment::COMMAND_HEADER)?;
        bus.request_push(EntryId::COMMAND_PARAMETERS, segment::COMMAND_PARAMETERS)?;

        self.dispatched = self.dispatched.wrapping_add(1);
        info!(
            "Dispatched move #{} to {:#06x} (header {:#06x})",
            self.dispatched,
            command.target_position,
            command.header()
        );

        Ok(command)
    }

    pub fn reset(&mut self) {
        self.next_sequence = 0;
        self.last_target = None;
        self.dispatched = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let command = MotionCommand {
            sequence_counter: 0x0B,
            target_position: 0,
            velocity: 0,
            acceleration: 0,
            deceleration: 0,
        };
        assert_eq!(command.header(), 0x090B);
    }

    #[test]
    fn test_parameter_bytes_are_little_endian() {
        let command = MotionCommand {
            sequence_counter: 0,
            target_position: 0x03E8,
            velocity: 0x1388,
            acceleration: 0x00FF,
            deceleration: 0x00FF,
        };
        assert_eq!(
            command.parameter_bytes(),
            [0xE8, 0x03, 0x88, 0x13, 0xFF, 0x00, 0xFF, 0x00]
        );
    }

    #[test]
    fn test_first_move_targets_set_point_a() {
        let mut encoder = CommandEncoder::new(MotionProfile::default());
        let command = encoder.build();
        assert_eq!(command.sequence_counter, 0);
        assert_eq!(command.target_position, 0x01F4);
        assert_eq!(command.velocity, 5000);
    }

    #[test]
    fn test_reset_restarts_sequence() {
        let mut encoder = CommandEncoder::new(MotionProfile::default());
        encoder.build();
        encoder.build();
        encoder.reset();
        let command = encoder.build();
        assert_eq!(command.sequence_counter, 0);
        assert_eq!(command.target_position, 0x01F4);
    }
}
