//! Protocol session
//!
//! A [`Session`] bundles everything one conversation with the flashapp needs:
//! the transport, the clock, the resolved address table and the poll
//! settings. It is passed explicitly to every layer instead of living in a
//! global, and the `&mut` borrow on it is the single mutual-exclusion
//! boundary around the transport.

use crate::error::{Error, Result};
use crate::layout::{CommVariable, ProtocolLayout};
use crate::poll::{Clock, PollConfig, StdClock};
use crate::target::TargetMemory;

/// Transport, clock and layout of one flashapp conversation
pub struct Session<T, C = StdClock> {
    pub(crate) target: T,
    pub(crate) clock: C,
    pub(crate) layout: ProtocolLayout,
    pub(crate) poll: PollConfig,
}

impl<T: TargetMemory> Session<T, StdClock> {
    /// Create a session using the wall clock
    pub fn new(target: T, layout: ProtocolLayout, poll: PollConfig) -> Self {
        Self::with_clock(target, layout, poll, StdClock)
    }
}

impl<T: TargetMemory, C: Clock> Session<T, C> {
    /// Create a session with an explicit clock
    pub fn with_clock(target: T, layout: ProtocolLayout, poll: PollConfig, clock: C) -> Self {
        Self {
            target,
            clock,
            layout,
            poll,
        }
    }

    /// Resolved address table
    pub fn layout(&self) -> &ProtocolLayout {
        &self.layout
    }

    /// Poll interval and default deadline
    pub fn poll_config(&self) -> PollConfig {
        self.poll
    }

    /// The session clock
    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Direct access to the transport
    pub fn target_mut(&mut self) -> &mut T {
        &mut self.target
    }

    /// Give the transport back
    pub fn into_target(self) -> T {
        self.target
    }

    /// Read a 4-byte variable
    pub fn read_u32(&mut self, var: CommVariable) -> Result<u32> {
        check_word(var)?;
        self.target.read32(var.address)
    }

    /// Write a 4-byte variable
    pub fn write_u32(&mut self, var: CommVariable, value: u32) -> Result<()> {
        check_word(var)?;
        self.target.write32(var.address, value)
    }

    /// Read a whole variable
    pub fn read_var(&mut self, var: CommVariable) -> Result<Vec<u8>> {
        self.target.read_block(var.address, var.size as usize)
    }

    /// Write `data` at the start of a variable
    ///
    /// `data` may be shorter than the variable but never longer.
    pub fn write_var(&mut self, var: CommVariable, data: &[u8]) -> Result<()> {
        if data.len() > var.size as usize {
            return Err(Error::PayloadTooLarge {
                len: data.len(),
                capacity: var.size as usize,
            });
        }
        if data.is_empty() {
            return Ok(());
        }
        self.target.write_block(var.address, data)
    }
}

fn check_word(var: CommVariable) -> Result<()> {
    if var.size != 4 {
        return Err(Error::Layout(format!(
            "variable at 0x{:08X} is {} bytes, not a word",
            var.address, var.size
        )));
    }
    Ok(())
}
