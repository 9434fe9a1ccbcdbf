//! Target memory access
//!
//! The engine never talks to a debug probe directly. Backends (probe-rs, the
//! in-memory emulator) implement [`TargetMemory`]; all calls are blocking and
//! the trait makes no concurrency promises, so callers hold it through
//! `&mut`.

use crate::error::{Error, Result};

/// Synchronous core control and memory access over the debug link
pub trait TargetMemory {
    /// Halt the core
    fn halt(&mut self) -> Result<()>;

    /// Resume the core
    fn resume(&mut self) -> Result<()>;

    /// Reset the core and let it run
    fn reset(&mut self) -> Result<()>;

    /// Reset the core and halt it at the reset vector
    fn reset_and_halt(&mut self) -> Result<()>;

    /// Read `size` bytes starting at `addr`
    fn read_block(&mut self, addr: u32, size: usize) -> Result<Vec<u8>>;

    /// Write one little-endian word
    fn write32(&mut self, addr: u32, value: u32) -> Result<()>;

    /// Write a block of bytes
    fn write_block(&mut self, addr: u32, data: &[u8]) -> Result<()>;

    /// Read one little-endian word
    fn read32(&mut self, addr: u32) -> Result<u32> {
        let bytes = self.read_block(addr, 4)?;
        let word: [u8; 4] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| Error::Transport(format!("short read at 0x{:08X}", addr)))?;
        Ok(u32::from_le_bytes(word))
    }
}

impl<T: TargetMemory + ?Sized> TargetMemory for Box<T> {
    fn halt(&mut self) -> Result<()> {
        (**self).halt()
    }

    fn resume(&mut self) -> Result<()> {
        (**self).resume()
    }

    fn reset(&mut self) -> Result<()> {
        (**self).reset()
    }

    fn reset_and_halt(&mut self) -> Result<()> {
        (**self).reset_and_halt()
    }

    fn read_block(&mut self, addr: u32, size: usize) -> Result<Vec<u8>> {
        (**self).read_block(addr, size)
    }

    fn write32(&mut self, addr: u32, value: u32) -> Result<()> {
        (**self).write32(addr, value)
    }

    fn write_block(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        (**self).write_block(addr, data)
    }

    fn read32(&mut self, addr: u32) -> Result<u32> {
        (**self).read32(addr)
    }
}

impl<T: TargetMemory + ?Sized> TargetMemory for &mut T {
    fn halt(&mut self) -> Result<()> {
        (**self).halt()
    }

    fn resume(&mut self) -> Result<()> {
        (**self).resume()
    }

    fn reset(&mut self) -> Result<()> {
        (**self).reset()
    }

    fn reset_and_halt(&mut self) -> Result<()> {
        (**self).reset_and_halt()
    }

    fn read_block(&mut self, addr: u32, size: usize) -> Result<Vec<u8>> {
        (**self).read_block(addr, size)
    }

    fn write32(&mut self, addr: u32, value: u32) -> Result<()> {
        (**self).write32(addr, value)
    }

    fn write_block(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        (**self).write_block(addr, data)
    }

    fn read32(&mut self, addr: u32) -> Result<u32> {
        (**self).read32(addr)
    }
}
