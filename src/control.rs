//! Supervisor-owned control word.

use crate::bus::{segment, EntryId, FieldBus};
use crate::error::BusError;
use bitflags::bitflags;
use tracing::debug;

bitflags! {
    /// Control word flags sent to the drive on entry 0x2111.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ControlWord: u16 {
        const SWITCH_ON         = 1 << 0;
        const ERROR_ACKNOWLEDGE = 1 << 7;
        const HOME              = 1 << 11;
    }
}

impl ControlWord {
    /// Flags that are only ever held for the length of one action.
    pub const TRANSIENT: ControlWord = ControlWord::ERROR_ACKNOWLEDGE.union(ControlWord::HOME);

    #[must_use]
    pub fn with_flag(self, flag: ControlWord) -> ControlWord {
        self.union(flag)
    }

    #[must_use]
    pub fn without_flag(self, flag: ControlWord) -> ControlWord {
        self.difference(flag)
    }
}

/// Holds the control word last committed to the drive.
///
/// The word is only changed through [`ControlState::add_flag`] and
/// [`ControlState::remove_flag`], each of which writes the whole word and requests an
/// immediate push. Owning this by value inside the supervisor makes it single-writer.
#[derive(Debug)]
pub struct ControlState {
    word: ControlWord,
    commits: u32,
}

impl ControlState {
    pub fn new() -> Self {
        Self {
            word: ControlWord::empty(),
            commits: 0,
        }
    }

    pub fn word(&self) -> ControlWord {
        self.word
    }

    pub fn commits(&self) -> u32 {
        self.commits
    }

    pub fn add_flag<B: FieldBus + ?Sized>(&mut self, bus: &B, flag: ControlWord) -> Result<(), BusError> {
        self.commit(bus, self.word.with_flag(flag))
    }

    pub fn remove_flag<B: FieldBus + ?Sized>(&mut self, bus: &B, flag: ControlWord) -> Result<(), BusError> {
        self.commit(bus, self.word.without_flag(flag))
    }

    /// Drops any transient flag left set by an action that did not finish.
    ///
    /// Returns the flags that were released, empty if nothing had to be written.
    pub fn release_transient<B: FieldBus + ?Sized>(&mut self, bus: &B) -> Result<ControlWord, BusError> {
        let stuck = self.word.intersection(ControlWord::TRANSIENT);
        if !stuck.is_empty() {
            self.remove_flag(bus, stuck)?;
        }
        Ok(stuck)
    }

    /// Writes `next` and pushes it. The local copy only changes once the drive has been
    /// asked to apply it.
    fn commit<B: FieldBus + ?Sized>(&mut self, bus: &B, next: ControlWord) -> Result<(), BusError> {
        bus.write_u16(EntryId::CONTROL_WORD, 0x00, next.bits())?;
        bus.request_push(EntryId::CONTROL_WORD, segment::CONTROL_WORD)?;
        self.word = next;
        self.commits = self.commits.wrapping_add(1);
        debug!("control word committed: {:#06x}", next.bits());
        Ok(())
    }

    /// Forgets the committed word without touching the bus.
    pub fn reset(&mut self) {
        self.word = ControlWord::empty();
        self.commits = 0;
    }
}

impl Default for ControlState {
    fn default() -> Self {
        Self::new()
    }
}
