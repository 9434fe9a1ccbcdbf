//! gnwflash-dummy - In-memory flashapp emulator for testing
//!
//! This crate provides a dummy target that runs a model of the flashapp
//! firmware against emulated RAM and external flash. It is useful for
//! testing the host engine and the CLI without a Game & Watch attached.
//!
//! The firmware model advances a few state machine steps every time the
//! host reads target memory, the same way the real firmware keeps running
//! while the probe polls it.

use std::collections::HashMap;

use gnwflash_core::compress::{decompress_lzma, sha256, Sha256Digest};
use gnwflash_core::error::{Error, Result};
use gnwflash_core::layout::{ContextLayout, ProtocolLayout, ERASE_ALIGNMENT, READ_WINDOW_BASE};
use gnwflash_core::ops::DBGMCU_CR;
use gnwflash_core::status::{FlashAppState, ProgramStatus, BOOT_MAGIC};
use gnwflash_core::target::TargetMemory;

const PAGE_SIZE: usize = 4096;

/// Failure to inject into the firmware model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Corrupt the context buffer before it is hashed
    CorruptRam,
    /// Flip a bit while programming
    CorruptFlash,
    /// Report BUSY forever after picking up a context
    StuckBusy,
    /// Jump to the ERROR state without setting a fatal status
    EnterErrorState,
}

/// Filesystem partition advertised through the mirrored `lfs_cfg`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DummyFilesystem {
    /// Extflash offset of the partition
    pub offset: u32,
    /// Erase block size
    pub block_size: u32,
    /// Number of blocks
    pub block_count: u32,
    /// littlefs read and program size
    pub io_size: u32,
}

/// Configuration for the dummy target
#[derive(Debug, Clone)]
pub struct DummyConfig {
    /// External flash size in bytes
    pub extflash_size: usize,
    /// Firmware state machine steps run per host memory read
    pub steps_per_access: usize,
    /// Filesystem partition, `None` leaves `lfs_cfg` zeroed
    pub filesystem: Option<DummyFilesystem>,
    /// Injected failure
    pub fault: Option<Fault>,
}

impl Default for DummyConfig {
    fn default() -> Self {
        let extflash_size = 16 * 1024 * 1024;
        Self {
            extflash_size,
            steps_per_access: 16,
            filesystem: Some(DummyFilesystem {
                offset: (extflash_size - (1 << 20)) as u32,
                block_size: 4096,
                block_count: 256,
                io_size: 256,
            }),
            fault: None,
        }
    }
}

/// A context as the firmware saw it when picking it up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    /// Context index
    pub context: usize,
    /// Destination extflash offset
    pub address: u32,
    /// Payload size
    pub size: u32,
    /// Erase flag
    pub erase: bool,
    /// Bytes to erase, 0 for the whole chip
    pub erase_bytes: u32,
    /// Decompressed size, 0 for raw payloads
    pub decompressed_size: u32,
    /// `program_chunk_idx` at pickup
    pub chunk_idx: u32,
    /// `program_chunk_count` at pickup
    pub chunk_count: u32,
}

// Request being worked on
struct Job {
    submission: Submission,
    payload: Vec<u8>,
    expected_sha256: Sha256Digest,
    expected_sha256_decompressed: Sha256Digest,
}

#[derive(Default)]
struct Ram {
    pages: HashMap<u32, Box<[u8; PAGE_SIZE]>>,
}

impl Ram {
    fn read(&self, addr: u32, buf: &mut [u8]) {
        let mut done = 0;
        while done < buf.len() {
            let at = addr as usize + done;
            let in_page = at % PAGE_SIZE;
            let n = (PAGE_SIZE - in_page).min(buf.len() - done);
            match self.pages.get(&((at / PAGE_SIZE) as u32)) {
                Some(page) => buf[done..done + n].copy_from_slice(&page[in_page..in_page + n]),
                None => buf[done..done + n].fill(0),
            }
            done += n;
        }
    }

    fn write(&mut self, addr: u32, data: &[u8]) {
        let mut done = 0;
        while done < data.len() {
            let at = addr as usize + done;
            let in_page = at % PAGE_SIZE;
            let n = (PAGE_SIZE - in_page).min(data.len() - done);
            let page = self
                .pages
                .entry((at / PAGE_SIZE) as u32)
                .or_insert_with(|| Box::new([0; PAGE_SIZE]));
            page[in_page..in_page + n].copy_from_slice(&data[done..done + n]);
            done += n;
        }
    }

    fn read32(&self, addr: u32) -> u32 {
        let mut word = [0; 4];
        self.read(addr, &mut word);
        u32::from_le_bytes(word)
    }

    fn write32(&mut self, addr: u32, value: u32) {
        self.write(addr, &value.to_le_bytes());
    }
}

/// Dummy Game & Watch running the flashapp
pub struct DummyFlashApp {
    config: DummyConfig,
    layout: ProtocolLayout,
    ram: Ram,
    extflash: Vec<u8>,
    running: bool,
    boot_pending: bool,
    flashapp: bool,
    debug_disabled: bool,
    next_context: usize,
    job: Option<Job>,
    submissions: Vec<Submission>,
}

impl DummyFlashApp {
    /// Create a target with erased extflash and the dual-context layout
    pub fn new(config: DummyConfig) -> Result<Self> {
        Ok(Self::with_layout(config, ProtocolLayout::dual_context()?))
    }

    /// Create a target with the default configuration
    pub fn new_default() -> Result<Self> {
        Self::new(DummyConfig::default())
    }

    /// Create a target with pre-filled extflash
    pub fn with_data(config: DummyConfig, initial_data: &[u8]) -> Result<Self> {
        let mut target = Self::new(config)?;
        let len = initial_data.len().min(target.extflash.len());
        target.extflash[..len].copy_from_slice(&initial_data[..len]);
        Ok(target)
    }

    /// Create a target whose firmware uses `layout`
    pub fn with_layout(config: DummyConfig, layout: ProtocolLayout) -> Self {
        let extflash = vec![0xFF; config.extflash_size];
        Self {
            config,
            layout,
            ram: Ram::default(),
            extflash,
            running: true,
            boot_pending: false,
            flashapp: false,
            debug_disabled: false,
            next_context: 0,
            job: None,
            submissions: Vec::new(),
        }
    }

    /// External flash contents
    pub fn extflash(&self) -> &[u8] {
        &self.extflash
    }

    /// Mutable external flash contents
    pub fn extflash_mut(&mut self) -> &mut [u8] {
        &mut self.extflash
    }

    /// Every context the firmware picked up, in order
    pub fn submissions(&self) -> &[Submission] {
        &self.submissions
    }

    /// Current firmware state
    pub fn state(&self) -> FlashAppState {
        FlashAppState::from_raw(self.ram.read32(self.layout.flashapp_state.address))
    }

    /// Current status word
    pub fn status(&self) -> ProgramStatus {
        ProgramStatus::from_raw(self.ram.read32(self.layout.program_status.address))
    }

    /// Whether the host wrote 0 to DBGMCU_CR
    pub fn debug_disabled(&self) -> bool {
        self.debug_disabled
    }

    /// Whether the core is running
    pub fn is_running(&self) -> bool {
        self.running
    }

    fn boot(&mut self) {
        self.boot_pending = false;
        self.job = None;
        self.flashapp = self.ram.read32(self.layout.boot_magic.address) == BOOT_MAGIC;
        if !self.flashapp {
            log::debug!("dummy: no boot magic, staying in the main firmware");
            return;
        }

        self.ram.write32(self.layout.boot_magic.address, 0);
        self.ram.write32(self.layout.log_idx.address, 0);

        let lfs = self.layout.lfs_cfg;
        let (context, io_size, block_size, block_count) = match self.config.filesystem {
            Some(fs) => (
                READ_WINDOW_BASE + fs.offset,
                fs.io_size,
                fs.block_size,
                fs.block_count,
            ),
            None => (0, 0, 0, 0),
        };
        self.ram.write32(lfs.context.address, context);
        self.ram.write32(lfs.read_size.address, io_size);
        self.ram.write32(lfs.prog_size.address, io_size);
        self.ram.write32(lfs.block_size.address, block_size);
        self.ram.write32(lfs.block_count.address, block_count);

        self.log_line("flashapp started");
    }

    fn log_line(&mut self, line: &str) {
        log::trace!("dummy: {}", line);
        let idx = self.ram.read32(self.layout.log_idx.address);
        let capacity = self.layout.logbuf.size;
        let text = format!("{}\n", line);
        let n = (text.len() as u32).min(capacity.saturating_sub(idx));
        if n > 0 {
            self.ram
                .write(self.layout.logbuf.address + idx, &text.as_bytes()[..n as usize]);
            self.ram.write32(self.layout.log_idx.address, idx + n);
        }
    }

    fn set_state(&mut self, next: FlashAppState) {
        let current = self.state();
        self.log_line(&format!("State: {} -> {}", current, next));
        self.ram.write32(self.layout.flashapp_state.address, next.raw());
    }

    fn set_status(&mut self, status: ProgramStatus) {
        self.ram.write32(self.layout.program_status.address, status.raw());
    }

    fn fail(&mut self, status: ProgramStatus) {
        self.set_status(status);
        self.set_state(FlashAppState::Error);
    }

    fn tick(&mut self) {
        for _ in 0..self.config.steps_per_access {
            if !self.running || !self.flashapp {
                return;
            }
            self.step();
        }
    }

    fn next_ready(&self) -> Option<usize> {
        let count = self.layout.contexts.len();
        (0..count)
            .map(|i| (self.next_context + i) % count)
            .find(|&i| self.ram.read32(self.layout.contexts[i].ready.address) == 1)
    }

    fn pick_up(&mut self, ctx: ContextLayout) {
        let read = |var: gnwflash_core::layout::CommVariable| self.ram.read32(var.address);
        let submission = Submission {
            context: ctx.index,
            address: read(ctx.address),
            size: read(ctx.size),
            erase: read(ctx.erase) != 0,
            erase_bytes: read(ctx.erase_bytes),
            decompressed_size: read(ctx.decompressed_size),
            chunk_idx: read(self.layout.program_chunk_idx),
            chunk_count: read(self.layout.program_chunk_count),
        };

        let mut payload = vec![0; (submission.size.min(ctx.buffer.size)) as usize];
        self.ram.read(ctx.buffer.address, &mut payload);
        let mut expected_sha256 = [0; 32];
        self.ram.read(ctx.expected_sha256.address, &mut expected_sha256);
        let mut expected_sha256_decompressed = [0; 32];
        self.ram.read(
            ctx.expected_sha256_decompressed.address,
            &mut expected_sha256_decompressed,
        );

        self.submissions.push(submission.clone());
        self.next_context = (ctx.index + 1) % self.layout.contexts.len();
        self.job = Some(Job {
            submission,
            payload,
            expected_sha256,
            expected_sha256_decompressed,
        });
    }

    // The payload now lives in the firmware's work buffer.
    fn release_context(&mut self) {
        if let Some(job) = &self.job {
            let ready = self.layout.contexts[job.submission.context].ready;
            self.ram.write32(ready.address, 0);
        }
    }

    fn step(&mut self) {
        use FlashAppState as S;

        match self.state() {
            S::Init => {
                let comm = [
                    self.layout.program_status,
                    self.layout.utc_timestamp,
                    self.layout.program_chunk_idx,
                ];
                for var in comm {
                    self.ram.write32(var.address, 0);
                }
                for ctx in self.layout.contexts {
                    self.ram.write32(ctx.ready.address, 0);
                }
                self.ram.write32(self.layout.program_chunk_count.address, 1);
                self.set_state(S::Idle);
            }
            S::Idle => {
                self.set_status(ProgramStatus::Idle);
                if let Some(index) = self.next_ready() {
                    self.pick_up(self.layout.contexts[index]);
                    self.set_state(S::Start);
                }
            }
            S::Start => {
                self.set_status(ProgramStatus::Busy);
                match self.config.fault {
                    Some(Fault::StuckBusy) => {}
                    Some(Fault::EnterErrorState) => self.set_state(S::Error),
                    _ => self.set_state(S::CheckHashRamNext),
                }
            }
            S::CheckHashRamNext => self.set_state(S::CheckHashRam),
            S::CheckHashRam => {
                let corrupt = self.config.fault == Some(Fault::CorruptRam);
                let Some(job) = self.job.as_mut() else {
                    return self.fail(ProgramStatus::BadHashRam);
                };
                if corrupt {
                    if let Some(byte) = job.payload.first_mut() {
                        *byte ^= 0x01;
                    } else {
                        job.expected_sha256[0] ^= 0x01;
                    }
                }
                if sha256(&job.payload) != job.expected_sha256 {
                    return self.fail(ProgramStatus::BadHashRam);
                }
                if job.submission.decompressed_size != 0 {
                    self.set_state(S::Decompressing);
                } else {
                    self.release_context();
                    self.set_state(S::EraseNext);
                }
            }
            S::Decompressing => {
                let Some(job) = self.job.as_mut() else {
                    return self.fail(ProgramStatus::BadHashRam);
                };
                let ok = match decompress_lzma(&job.payload) {
                    Ok(data) => {
                        let ok = data.len() == job.submission.decompressed_size as usize
                            && sha256(&data) == job.expected_sha256_decompressed;
                        job.payload = data;
                        ok
                    }
                    Err(_) => false,
                };
                if !ok {
                    return self.fail(ProgramStatus::BadHashRam);
                }
                self.release_context();
                self.set_state(S::EraseNext);
            }
            S::EraseNext => {
                let Some(job) = &self.job else {
                    return self.fail(ProgramStatus::NotAligned);
                };
                let submission = &job.submission;
                if !submission.erase {
                    self.set_state(S::ProgramNext);
                } else if submission.erase_bytes != 0 && submission.address % ERASE_ALIGNMENT != 0
                {
                    self.fail(ProgramStatus::NotAligned);
                } else {
                    self.set_state(S::Erase);
                }
            }
            S::Erase => {
                if let Some(job) = &self.job {
                    let (start, len) = if job.submission.erase_bytes == 0 {
                        (0, self.extflash.len())
                    } else {
                        let align = ERASE_ALIGNMENT as usize;
                        let bytes = (job.submission.erase_bytes as usize).div_ceil(align) * align;
                        (job.submission.address as usize, bytes)
                    };
                    let end = (start + len).min(self.extflash.len());
                    if start < end {
                        self.extflash[start..end].fill(0xFF);
                    }
                }
                self.set_state(S::ProgramNext);
            }
            S::ProgramNext => self.set_state(S::Program),
            S::Program => {
                let corrupt = self.config.fault == Some(Fault::CorruptFlash);
                if let Some(job) = &self.job {
                    let start = job.submission.address as usize;
                    let end = (start + job.payload.len()).min(self.extflash.len());
                    if start < end {
                        // NOR programming only clears bits
                        for (dst, src) in self.extflash[start..end].iter_mut().zip(&job.payload) {
                            *dst &= *src;
                        }
                        if corrupt {
                            self.extflash[start] ^= 0x01;
                        }
                    }
                }
                self.set_state(S::CheckHashFlashNext);
            }
            S::CheckHashFlashNext => self.set_state(S::CheckHashFlash),
            S::CheckHashFlash => {
                let Some(job) = self.job.take() else {
                    return self.fail(ProgramStatus::BadHashFlash);
                };
                let start = (job.submission.address as usize).min(self.extflash.len());
                let end = start + job.payload.len();
                let expected = if job.submission.decompressed_size != 0 {
                    job.expected_sha256_decompressed
                } else {
                    job.expected_sha256
                };
                if end > self.extflash.len() || sha256(&self.extflash[start..end]) != expected {
                    return self.fail(ProgramStatus::BadHashFlash);
                }
                self.set_state(S::Idle);
            }
            S::Final | S::Error | S::Unknown(_) => {}
        }
    }

    fn window(&self, addr: u32, size: usize) -> Result<std::ops::Range<usize>> {
        let start = (addr - READ_WINDOW_BASE) as usize;
        let end = start + size;
        if end > self.extflash.len() {
            return Err(Error::Transport(format!(
                "read of {} bytes at 0x{:08X} past the end of extflash",
                size, addr
            )));
        }
        Ok(start..end)
    }
}

impl TargetMemory for DummyFlashApp {
    fn halt(&mut self) -> Result<()> {
        self.running = false;
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        self.running = true;
        if self.boot_pending {
            self.boot();
        }
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.boot_pending = true;
        self.resume()
    }

    fn reset_and_halt(&mut self) -> Result<()> {
        self.running = false;
        self.boot_pending = true;
        self.flashapp = false;
        Ok(())
    }

    fn read_block(&mut self, addr: u32, size: usize) -> Result<Vec<u8>> {
        self.tick();

        if addr >= READ_WINDOW_BASE {
            let range = self.window(addr, size)?;
            return Ok(self.extflash[range].to_vec());
        }
        let mut buf = vec![0; size];
        self.ram.read(addr, &mut buf);
        Ok(buf)
    }

    fn write32(&mut self, addr: u32, value: u32) -> Result<()> {
        if addr == DBGMCU_CR {
            self.debug_disabled = value == 0;
            return Ok(());
        }
        self.write_block(addr, &value.to_le_bytes())
    }

    fn write_block(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        if addr >= READ_WINDOW_BASE {
            return Err(Error::Transport(format!(
                "extflash window at 0x{:08X} is read-only",
                addr
            )));
        }
        self.ram.write(addr, data);
        Ok(())
    }
}
