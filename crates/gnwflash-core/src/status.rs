//! Device-authoritative state and status words
//!
//! Both values are owned by the firmware and read by the host. Wire values
//! must match the firmware enums exactly; anything the host does not know
//! decodes to an `Unknown` variant carrying the raw word.

use core::fmt;

/// Boot handshake value the firmware checks before entering the flashapp
pub const BOOT_MAGIC: u32 = 0xF1A5_F1A5;

/// Mask selecting the high half of a status word
pub const STATUS_CLASS_MASK: u32 = 0xFFFF_0000;

/// High half shared by every fatal status code
pub const STATUS_FATAL_CLASS: u32 = 0xBAD0_0000;

/// Flashapp state machine state (`flashapp_state`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlashAppState {
    /// Clearing shared variables after boot
    Init,
    /// Waiting for a ready context
    Idle,
    /// Picked up a context
    Start,
    /// About to hash the context buffer in RAM
    CheckHashRamNext,
    /// Hashing the context buffer in RAM
    CheckHashRam,
    /// Decompressing the context buffer
    Decompressing,
    /// About to erase
    EraseNext,
    /// Erasing
    Erase,
    /// About to program
    ProgramNext,
    /// Programming
    Program,
    /// About to hash the programmed flash region
    CheckHashFlashNext,
    /// Hashing the programmed flash region
    CheckHashFlash,
    /// Terminal success state
    Final,
    /// Terminal failure state, left only through a reset
    Error,
    /// Value not known to this host
    Unknown(u32),
}

impl FlashAppState {
    const TABLE: [(u32, FlashAppState, &'static str); 14] = [
        (0x00, Self::Init, "INIT"),
        (0x01, Self::Idle, "IDLE"),
        (0x02, Self::Start, "START"),
        (0x03, Self::CheckHashRamNext, "CHECK_HASH_RAM_NEXT"),
        (0x04, Self::CheckHashRam, "CHECK_HASH_RAM"),
        (0x05, Self::Decompressing, "DECOMPRESSING"),
        (0x06, Self::EraseNext, "ERASE_NEXT"),
        (0x07, Self::Erase, "ERASE"),
        (0x08, Self::ProgramNext, "PROGRAM_NEXT"),
        (0x09, Self::Program, "PROGRAM"),
        (0x0A, Self::CheckHashFlashNext, "CHECK_HASH_FLASH_NEXT"),
        (0x0B, Self::CheckHashFlash, "CHECK_HASH_FLASH"),
        (0x0C, Self::Final, "FINAL"),
        (0x0D, Self::Error, "ERROR"),
    ];

    /// Decode a raw state word
    pub fn from_raw(raw: u32) -> Self {
        Self::TABLE
            .iter()
            .find(|(value, _, _)| *value == raw)
            .map(|(_, state, _)| *state)
            .unwrap_or(Self::Unknown(raw))
    }

    /// Encode back to the wire value
    pub fn raw(self) -> u32 {
        match self {
            Self::Unknown(raw) => raw,
            known => Self::TABLE
                .iter()
                .find(|(_, state, _)| *state == known)
                .map(|(value, _, _)| *value)
                .unwrap_or_default(),
        }
    }

    /// Firmware name of the state, `"UNKNOWN"` for unrecognized values
    pub fn name(self) -> &'static str {
        Self::TABLE
            .iter()
            .find(|(_, state, _)| *state == self)
            .map(|(_, _, name)| *name)
            .unwrap_or("UNKNOWN")
    }
}

impl From<u32> for FlashAppState {
    fn from(raw: u32) -> Self {
        Self::from_raw(raw)
    }
}

impl fmt::Display for FlashAppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(raw) => write!(f, "UNKNOWN(0x{:08X})", raw),
            other => f.write_str(other.name()),
        }
    }
}

/// Program status register (`program_status`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgramStatus {
    /// Firmware has not reached the flashapp yet
    Booting,
    /// Ready for work
    Idle,
    /// Last request finished
    Done,
    /// Processing a context
    Busy,
    /// Context buffer hash did not match in RAM
    BadHashRam,
    /// Programmed flash hash did not match
    BadHashFlash,
    /// Erase address not aligned to the smallest erase size
    NotAligned,
    /// Value not known to this host
    Unknown(u32),
}

impl ProgramStatus {
    const TABLE: [(u32, ProgramStatus, &'static str); 7] = [
        (0x0000_0000, Self::Booting, "BOOTING"),
        (0xCAFE_0000, Self::Idle, "IDLE"),
        (0xCAFE_0001, Self::Done, "DONE"),
        (0xCAFE_0002, Self::Busy, "BUSY"),
        (0xBAD0_0001, Self::BadHashRam, "BAD_HASH_RAM"),
        // Spelled as in the firmware enum.
        (0xBAD0_0002, Self::BadHashFlash, "BAD_HAS_FLASH"),
        (0xBAD0_0003, Self::NotAligned, "NOT_ALIGNED"),
    ];

    /// Decode a raw status word
    pub fn from_raw(raw: u32) -> Self {
        Self::TABLE
            .iter()
            .find(|(value, _, _)| *value == raw)
            .map(|(_, status, _)| *status)
            .unwrap_or(Self::Unknown(raw))
    }

    /// Encode back to the wire value
    pub fn raw(self) -> u32 {
        match self {
            Self::Unknown(raw) => raw,
            known => Self::TABLE
                .iter()
                .find(|(_, status, _)| *status == known)
                .map(|(value, _, _)| *value)
                .unwrap_or_default(),
        }
    }

    /// Firmware name of the status, `"UNKNOWN"` for unrecognized values
    pub fn name(self) -> &'static str {
        Self::TABLE
            .iter()
            .find(|(_, status, _)| *status == self)
            .map(|(_, _, name)| *name)
            .unwrap_or("UNKNOWN")
    }

    /// Whether the status carries the fatal `0xBAD0xxxx` pattern
    ///
    /// Unknown codes in the fatal range are fatal too.
    pub fn is_fatal(self) -> bool {
        self.raw() & STATUS_CLASS_MASK == STATUS_FATAL_CLASS
    }
}

impl From<u32> for ProgramStatus {
    fn from(raw: u32) -> Self {
        Self::from_raw(raw)
    }
}

impl fmt::Display for ProgramStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(raw) => write!(f, "UNKNOWN(0x{:08X})", raw),
            other => f.write_str(other.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_wire_values() {
        assert_eq!(FlashAppState::from_raw(0), FlashAppState::Init);
        assert_eq!(FlashAppState::from_raw(5), FlashAppState::Decompressing);
        assert_eq!(FlashAppState::from_raw(13), FlashAppState::Error);
        assert_eq!(FlashAppState::Error.raw(), 13);
        assert_eq!(FlashAppState::CheckHashFlash.name(), "CHECK_HASH_FLASH");
    }

    #[test]
    fn test_unknown_state() {
        let state = FlashAppState::from_raw(0x42);
        assert_eq!(state, FlashAppState::Unknown(0x42));
        assert_eq!(state.raw(), 0x42);
        assert_eq!(state.name(), "UNKNOWN");
        assert_eq!(state.to_string(), "UNKNOWN(0x00000042)");
    }

    #[test]
    fn test_status_wire_values() {
        assert_eq!(ProgramStatus::from_raw(0), ProgramStatus::Booting);
        assert_eq!(ProgramStatus::from_raw(0xCAFE_0000), ProgramStatus::Idle);
        assert_eq!(ProgramStatus::from_raw(0xCAFE_0001), ProgramStatus::Done);
        assert_eq!(ProgramStatus::from_raw(0xCAFE_0002), ProgramStatus::Busy);
        assert_eq!(ProgramStatus::BadHashFlash.raw(), 0xBAD0_0002);
        assert_eq!(ProgramStatus::BadHashFlash.to_string(), "BAD_HAS_FLASH");
    }

    #[test]
    fn test_fatal_classification() {
        assert!(ProgramStatus::BadHashRam.is_fatal());
        assert!(ProgramStatus::BadHashFlash.is_fatal());
        assert!(ProgramStatus::NotAligned.is_fatal());
        assert!(ProgramStatus::from_raw(0xBAD0_1234).is_fatal());
        assert!(!ProgramStatus::Busy.is_fatal());
        assert!(!ProgramStatus::Booting.is_fatal());
        assert!(!ProgramStatus::from_raw(0xBAD1_0000).is_fatal());
    }
}
