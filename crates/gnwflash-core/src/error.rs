//! Error types for gnwflash-core

use std::time::Duration;

use thiserror::Error;

use crate::status::{FlashAppState, ProgramStatus};

/// Errors surfaced by the flashing engine
///
/// None of these are retried internally. After `Timeout`, `Data` or `State`
/// the device is in an indeterminate state and needs a reset (i.e. a new
/// [`start`](crate::ops::FlashApp::start)) before it is used again.
#[derive(Error, Debug)]
pub enum Error {
    // Device errors
    /// A polled condition did not resolve before its deadline
    #[error("timed out after {elapsed:?} waiting for {waiting_for}")]
    Timeout {
        /// What was being waited for
        waiting_for: String,
        /// Time spent waiting
        elapsed: Duration,
    },
    /// Device reported a fatal status code
    #[error("device reported {status}")]
    Data {
        /// Decoded status word
        status: ProgramStatus,
    },
    /// Device firmware entered its ERROR state without a fatal status code
    #[error("device entered the {state} state (status {status})")]
    State {
        /// Decoded state word
        state: FlashAppState,
        /// Status word read alongside it
        status: ProgramStatus,
    },

    // Validation errors
    /// Offset is not aligned to the minimum erase granularity
    #[error("offset 0x{offset:08X} is not aligned to {align} bytes")]
    Misaligned {
        /// Offending offset
        offset: u32,
        /// Required alignment
        align: u32,
    },
    /// Offset (plus length) leaves the extflash window
    #[error(
        "offset 0x{offset:08X} (+{len} bytes) is outside extflash; \
         pass the flash offset, not the 0x90000000 mapped address"
    )]
    OutOfRange {
        /// Offending offset
        offset: u32,
        /// Length of the access
        len: usize,
    },
    /// A sized erase of zero bytes was requested
    #[error("erase size must be non-zero unless erasing the whole chip")]
    ZeroSizeErase,
    /// Compression method name not recognized
    #[error("unknown compression method '{0}'")]
    UnknownCompression(String),
    /// Payload larger than a transfer context buffer
    #[error("payload of {len} bytes exceeds the {capacity} byte context buffer")]
    PayloadTooLarge {
        /// Payload length
        len: usize,
        /// Buffer capacity
        capacity: usize,
    },

    // Host-side failures
    /// Compression codec failure or round-trip mismatch
    #[error("compression failed: {0}")]
    Compression(String),
    /// Debug link or target memory access failed
    #[error("target access failed: {0}")]
    Transport(String),
    /// Shared memory layout could not be built or is missing a variable
    #[error("layout error: {0}")]
    Layout(String),
    /// Filesystem geometry or block access error
    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl Error {
    /// Whether the error was raised before any device I/O because the
    /// caller passed bad arguments
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::Misaligned { .. }
                | Self::OutOfRange { .. }
                | Self::ZeroSizeErase
                | Self::UnknownCompression(_)
                | Self::PayloadTooLarge { .. }
        )
    }

    /// Whether the device needs an external reset before it can be reused
    pub fn requires_reset(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Data { .. } | Self::State { .. }
        )
    }
}

/// Result type alias using the core Error type
pub type Result<T> = core::result::Result<T, Error>;
