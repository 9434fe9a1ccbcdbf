//! Scripted target used by the unit tests
//!
//! Plain sparse memory plus a few hooks: a status override and an optional
//! "device" that consumes a context the first time its ready flag is seen
//! set, possibly held back by a gate.

use std::collections::HashMap;

use crate::error::Result;
use crate::layout::ProtocolLayout;
use crate::status::{FlashAppState, ProgramStatus};
use crate::target::TargetMemory;

const PAGE_SIZE: usize = 4096;

pub(crate) struct MockTarget {
    pages: HashMap<u32, Box<[u8; PAGE_SIZE]>>,
    layout: ProtocolLayout,
    /// `(address, length)` of every host write, in order
    pub writes: Vec<(u32, usize)>,
    /// Context indices in the order the fake device consumed them
    pub consumed: Vec<usize>,
    /// Value returned for `program_status` reads instead of memory
    pub status_override: Option<Box<dyn FnMut() -> u32>>,
    /// Clear a ready flag right after the host has seen it set
    pub consume_ready: bool,
    /// Holds `consume_ready` back while it returns false
    pub ready_gate: Option<Box<dyn FnMut() -> bool>>,
    pub running: bool,
    pub resets: usize,
}

impl MockTarget {
    pub fn new() -> Self {
        Self {
            pages: HashMap::new(),
            layout: ProtocolLayout::dual_context().unwrap(),
            writes: Vec::new(),
            consumed: Vec::new(),
            status_override: None,
            consume_ready: false,
            ready_gate: None,
            running: false,
            resets: 0,
        }
    }

    pub fn peek(&self, addr: u32, len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| {
                let a = addr + i as u32;
                self.pages
                    .get(&(a / PAGE_SIZE as u32))
                    .map(|page| page[a as usize % PAGE_SIZE])
                    .unwrap_or(0)
            })
            .collect()
    }

    pub fn peek32(&self, addr: u32) -> u32 {
        let bytes = self.peek(addr, 4);
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    /// Store without logging a host write
    pub fn poke(&mut self, addr: u32, data: &[u8]) {
        for (i, byte) in data.iter().enumerate() {
            let a = addr + i as u32;
            let page = self
                .pages
                .entry(a / PAGE_SIZE as u32)
                .or_insert_with(|| Box::new([0; PAGE_SIZE]));
            page[a as usize % PAGE_SIZE] = *byte;
        }
    }

    pub fn set_status(&mut self, status: ProgramStatus) {
        let addr = self.layout.program_status.address;
        self.poke(addr, &status.raw().to_le_bytes());
    }

    pub fn set_state(&mut self, state: FlashAppState) {
        let addr = self.layout.flashapp_state.address;
        self.poke(addr, &state.raw().to_le_bytes());
    }

    fn ready_index(&self, addr: u32) -> Option<usize> {
        self.layout
            .contexts
            .iter()
            .position(|ctx| ctx.ready.address == addr)
    }
}

impl TargetMemory for MockTarget {
    fn halt(&mut self) -> Result<()> {
        self.running = false;
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        self.running = true;
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.resets += 1;
        self.running = true;
        Ok(())
    }

    fn reset_and_halt(&mut self) -> Result<()> {
        self.resets += 1;
        self.running = false;
        Ok(())
    }

    fn read_block(&mut self, addr: u32, size: usize) -> Result<Vec<u8>> {
        if addr == self.layout.program_status.address && size == 4 {
            if let Some(status) = self.status_override.as_mut() {
                return Ok(status().to_le_bytes().to_vec());
            }
        }

        let data = self.peek(addr, size);
        let open = self.ready_gate.as_mut().map_or(true, |gate| gate());
        if self.consume_ready && open && size == 4 {
            if let Some(index) = self.ready_index(addr) {
                if self.peek32(addr) == 1 {
                    self.poke(addr, &0u32.to_le_bytes());
                    self.consumed.push(index);
                }
            }
        }
        Ok(data)
    }

    fn write32(&mut self, addr: u32, value: u32) -> Result<()> {
        self.writes.push((addr, 4));
        self.poke(addr, &value.to_le_bytes());
        Ok(())
    }

    fn write_block(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        self.writes.push((addr, data.len()));
        self.poke(addr, data);
        Ok(())
    }
}
