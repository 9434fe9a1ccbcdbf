//! gnwflash-probe - Target memory access through probe-rs
//!
//! Attaches to the STM32H7 in the Game & Watch over SWD with any debug probe
//! probe-rs supports (ST-Link, J-Link, CMSIS-DAP, ...) and exposes core 0 as
//! a [`TargetMemory`].

use std::time::Duration;

use gnwflash_core::error::{Error, Result};
use gnwflash_core::target::TargetMemory;
use probe_rs::{Core, MemoryInterface, Permissions, Session};

/// How long to wait for the core to halt
const HALT_TIMEOUT: Duration = Duration::from_millis(500);

fn transport_error(context: &str, e: probe_rs::Error) -> Error {
    Error::Transport(format!("{}: {}", context, e))
}

/// Debug probe session on core 0 of the target
pub struct ProbeTarget {
    session: Session,
}

impl ProbeTarget {
    /// Attach to the first probe found, targeting `chip`
    pub fn attach(chip: &str) -> Result<Self> {
        log::info!("Attaching to {} via probe-rs...", chip);
        let session = Session::auto_attach(chip, Permissions::default())
            .map_err(|e| transport_error("failed to attach", e))?;
        Ok(Self { session })
    }

    /// Wrap an existing probe-rs session
    pub fn from_session(session: Session) -> Self {
        Self { session }
    }

    fn core(&mut self) -> Result<Core<'_>> {
        self.session
            .core(0)
            .map_err(|e| transport_error("failed to open core 0", e))
    }
}

impl TargetMemory for ProbeTarget {
    fn halt(&mut self) -> Result<()> {
        self.core()?
            .halt(HALT_TIMEOUT)
            .map(|_| ())
            .map_err(|e| transport_error("halt", e))
    }

    fn resume(&mut self) -> Result<()> {
        self.core()?.run().map_err(|e| transport_error("resume", e))
    }

    fn reset(&mut self) -> Result<()> {
        self.core()?.reset().map_err(|e| transport_error("reset", e))
    }

    fn reset_and_halt(&mut self) -> Result<()> {
        self.core()?
            .reset_and_halt(HALT_TIMEOUT)
            .map(|_| ())
            .map_err(|e| transport_error("reset and halt", e))
    }

    fn read_block(&mut self, addr: u32, size: usize) -> Result<Vec<u8>> {
        let mut data = vec![0u8; size];
        self.core()?
            .read_8(u64::from(addr), &mut data)
            .map_err(|e| transport_error(&format!("read at 0x{:08X}", addr), e))?;
        Ok(data)
    }

    fn write32(&mut self, addr: u32, value: u32) -> Result<()> {
        self.core()?
            .write_word_32(u64::from(addr), value)
            .map_err(|e| transport_error(&format!("write at 0x{:08X}", addr), e))
    }

    fn write_block(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        self.core()?
            .write_8(u64::from(addr), data)
            .map_err(|e| transport_error(&format!("write at 0x{:08X}", addr), e))
    }
}
