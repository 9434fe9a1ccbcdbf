//! High-level flash operations
//!
//! [`FlashApp`] is the session object the CLI and the filesystem adapter
//! drive: it owns the transport, the resolved layout and the context pool.
//! Erase and write go through the transfer contexts; reads bypass them and
//! load straight from the memory-mapped extflash window.

use std::time::Duration;

use crate::compress::{Compression, Compressor, PreparedChunk};
use crate::error::{Error, Result};
use crate::fs::FsGeometry;
use crate::layout::{ProtocolLayout, ERASE_ALIGNMENT, READ_WINDOW_BASE};
use crate::poll::{Clock, PollConfig, StdClock};
use crate::pool::{ContextPool, Request};
use crate::session::Session;
use crate::target::TargetMemory;

/// STM32H7 debug MCU configuration register
pub const DBGMCU_CR: u32 = 0x5C00_1004;

/// Default number of compression workers
pub const DEFAULT_WORKERS: usize = 2;

/// Default deadline for the device to finish a pure erase
pub const DEFAULT_ERASE_TIMEOUT: Duration = Duration::from_secs(120);

// =============================================================================
// Configuration
// =============================================================================

/// Engine tuning knobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Poll interval and deadline of every wait
    pub poll: PollConfig,
    /// Chunk compression method
    pub compression: Compression,
    /// Compression worker threads, capped at the context count
    pub workers: usize,
    /// Deadline for the device to finish an erase request
    ///
    /// A whole-chip erase of the 16 MiB NOR part takes far longer than any
    /// other request, so it does not share `poll.timeout`.
    pub erase_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll: PollConfig::default(),
            compression: Compression::Lzma,
            workers: DEFAULT_WORKERS,
            erase_timeout: DEFAULT_ERASE_TIMEOUT,
        }
    }
}

/// Amount of flash an erase covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EraseSize {
    /// Erase this many bytes from the offset
    Bytes(u32),
    /// Erase the entire chip; the offset is ignored
    WholeChip,
}

// =============================================================================
// Progress reporting
// =============================================================================

/// Statistics from a write
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteStats {
    /// Number of chunks submitted
    pub chunks: usize,
    /// How many of them went out compressed
    pub compressed_chunks: usize,
    /// Image bytes programmed
    pub bytes_written: usize,
    /// Payload bytes copied into context buffers
    pub bytes_transferred: usize,
}

impl WriteStats {
    /// Transferred over programmed bytes
    pub fn ratio(&self) -> f64 {
        if self.bytes_written == 0 {
            1.0
        } else {
            self.bytes_transferred as f64 / self.bytes_written as f64
        }
    }
}

/// Progress callback for write operations
pub trait WriteProgress {
    /// Called before the first chunk is prepared
    fn writing(&mut self, bytes_to_write: usize, chunks: usize);

    /// Called after each chunk has been handed to the device
    fn write_progress(&mut self, bytes_submitted: usize);

    /// Called once every chunk is submitted, while waiting for the device
    fn draining(&mut self);

    /// Called when the device has verified the last chunk
    fn complete(&mut self, stats: &WriteStats);
}

/// A no-op progress reporter
pub struct NoProgress;

impl WriteProgress for NoProgress {
    fn writing(&mut self, _bytes_to_write: usize, _chunks: usize) {}
    fn write_progress(&mut self, _bytes_submitted: usize) {}
    fn draining(&mut self) {}
    fn complete(&mut self, _stats: &WriteStats) {}
}

// =============================================================================
// Offset validation
// =============================================================================

/// Check an offset used by an erase or an erasing write
///
/// The offset must be 4096-byte aligned and below the read window base.
/// The second check catches a memory-mapped address passed by mistake.
pub fn validate_offset(offset: u32) -> Result<()> {
    if offset >= READ_WINDOW_BASE {
        return Err(Error::OutOfRange { offset, len: 0 });
    }
    if offset % ERASE_ALIGNMENT != 0 {
        return Err(Error::Misaligned {
            offset,
            align: ERASE_ALIGNMENT,
        });
    }
    Ok(())
}

/// Check that `len` bytes from `offset` stay inside extflash
pub fn validate_range(offset: u32, len: usize) -> Result<()> {
    if offset >= READ_WINDOW_BASE || u64::from(offset) + len as u64 > u64::from(READ_WINDOW_BASE)
    {
        return Err(Error::OutOfRange { offset, len });
    }
    Ok(())
}

// =============================================================================
// FlashApp
// =============================================================================

/// A flashapp session: transport, layout, context pool and configuration
pub struct FlashApp<T, C = StdClock> {
    session: Session<T, C>,
    pool: ContextPool,
    config: EngineConfig,
    geometry: Option<FsGeometry>,
}

impl<T: TargetMemory> FlashApp<T, StdClock> {
    /// Session on the built-in dual-context layout
    pub fn new(target: T, config: EngineConfig) -> Result<Self> {
        Self::with_layout(target, ProtocolLayout::dual_context()?, config)
    }

    /// Session on an explicit layout
    pub fn with_layout(target: T, layout: ProtocolLayout, config: EngineConfig) -> Result<Self> {
        Ok(Self::with_layout_and_clock(target, layout, config, StdClock))
    }
}

impl<T: TargetMemory, C: Clock> FlashApp<T, C> {
    /// Session with an explicit layout and clock
    pub fn with_layout_and_clock(
        target: T,
        layout: ProtocolLayout,
        config: EngineConfig,
        clock: C,
    ) -> Self {
        let pool = ContextPool::new(&layout);
        Self {
            session: Session::with_clock(target, layout, config.poll, clock),
            pool,
            config,
            geometry: None,
        }
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The underlying protocol session
    pub fn session_mut(&mut self) -> &mut Session<T, C> {
        &mut self.session
    }

    /// Give the transport back
    pub fn into_target(self) -> T {
        self.session.into_target()
    }

    /// Boot the flashapp and discover the filesystem geometry
    ///
    /// A missing or inconsistent `lfs_cfg` is not an error here; it only
    /// makes [`geometry`](Self::geometry) fail later.
    pub fn start(&mut self) -> Result<()> {
        self.session.start()?;

        let lfs = self.session.layout().lfs_cfg;
        let context = self.session.read_u32(lfs.context)?;
        let read_size = self.session.read_u32(lfs.read_size)?;
        let prog_size = self.session.read_u32(lfs.prog_size)?;
        let block_size = self.session.read_u32(lfs.block_size)?;
        let block_count = self.session.read_u32(lfs.block_count)?;

        self.geometry = match FsGeometry::from_lfs_config(
            context,
            read_size,
            prog_size,
            block_size,
            block_count,
        ) {
            Ok(geometry) => {
                log::debug!(
                    "Filesystem: {} blocks of {} bytes at 0x{:08X}",
                    geometry.block_count,
                    geometry.block_size,
                    geometry.base_offset
                );
                Some(geometry)
            }
            Err(e) => {
                log::warn!("No usable filesystem geometry: {}", e);
                None
            }
        };
        Ok(())
    }

    /// Filesystem geometry discovered by [`start`](Self::start)
    pub fn geometry(&self) -> Result<FsGeometry> {
        self.geometry
            .ok_or_else(|| Error::Filesystem("geometry not available, was the flashapp started?".into()))
    }

    /// Erase `size` bytes at `offset`, or the whole chip
    ///
    /// Erases never overlap other requests: the pool is drained before
    /// the request is submitted and again before returning.
    pub fn erase(&mut self, offset: u32, size: EraseSize) -> Result<()> {
        let (offset, bytes) = match size {
            EraseSize::WholeChip => (0, 0),
            EraseSize::Bytes(0) => return Err(Error::ZeroSizeErase),
            EraseSize::Bytes(bytes) => {
                validate_offset(offset)?;
                validate_range(offset, bytes as usize)?;
                (offset, bytes)
            }
        };

        self.pool.drain(&mut self.session)?;

        let layout = self.session.layout().clone();
        self.session.write_u32(layout.program_chunk_count, 1)?;
        self.session.write_u32(layout.program_chunk_idx, 1)?;
        let index = self.pool.acquire(&mut self.session)?;
        self.pool
            .submit(&mut self.session, index, Request::Erase { offset, bytes })?;

        self.pool
            .drain_within(&mut self.session, self.config.erase_timeout)
    }

    /// Erase and program `data` at `offset`
    pub fn write(&mut self, offset: u32, data: &[u8]) -> Result<WriteStats> {
        self.write_with_progress(offset, data, &mut NoProgress)
    }

    /// [`write`](Self::write) with progress reporting
    pub fn write_with_progress<P: WriteProgress>(
        &mut self,
        offset: u32,
        data: &[u8],
        progress: &mut P,
    ) -> Result<WriteStats> {
        validate_offset(offset)?;
        self.transfer(offset, data, true, progress)
    }

    /// Program `data` at `offset` without erasing first
    ///
    /// The destination must already be erased. Only the range is checked, so
    /// this serves sub-block filesystem programs.
    pub fn program(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        self.transfer(offset, data, false, &mut NoProgress).map(|_| ())
    }

    fn transfer<P: WriteProgress>(
        &mut self,
        offset: u32,
        data: &[u8],
        erase: bool,
        progress: &mut P,
    ) -> Result<WriteStats> {
        validate_range(offset, data.len())?;
        let mut stats = WriteStats::default();
        if data.is_empty() {
            return Ok(stats);
        }

        let chunk_size = self.pool.capacity();
        let chunks: Vec<&[u8]> = data.chunks(chunk_size).collect();
        let compressor = Compressor::new(self.config.compression, self.config.workers);
        log::debug!(
            "Writing {} bytes at 0x{:08X} in {} chunk(s), compression {}, {} worker(s)",
            data.len(),
            offset,
            chunks.len(),
            self.config.compression,
            compressor.workers()
        );

        let layout = self.session.layout().clone();
        self.session
            .write_u32(layout.program_chunk_count, chunks.len() as u32)?;
        progress.writing(data.len(), chunks.len());

        let session = &mut self.session;
        let pool = &self.pool;
        compressor.run(&chunks, |chunk: PreparedChunk| {
            let index = pool.acquire(session)?;
            session.write_u32(layout.program_chunk_idx, chunk.index as u32 + 1)?;
            pool.submit(
                session,
                index,
                Request::Program {
                    offset: offset + (chunk.index * chunk_size) as u32,
                    chunk: &chunk,
                    erase,
                },
            )?;

            stats.chunks += 1;
            stats.bytes_written += chunk.original_len;
            stats.bytes_transferred += chunk.payload.len();
            if chunk.is_compressed() {
                stats.compressed_chunks += 1;
            }
            progress.write_progress(stats.bytes_written);
            Ok(())
        })?;

        progress.draining();
        self.pool.drain(&mut self.session)?;
        progress.complete(&stats);
        Ok(stats)
    }

    /// Read `size` bytes at `offset` through the memory-mapped window
    pub fn read(&mut self, offset: u32, size: usize) -> Result<Vec<u8>> {
        validate_range(offset, size)?;
        if u64::from(READ_WINDOW_BASE) + u64::from(offset) + size as u64 > 1 << 32 {
            return Err(Error::OutOfRange { offset, len: size });
        }
        self.pool.drain(&mut self.session)?;
        self.session
            .target_mut()
            .read_block(READ_WINDOW_BASE + offset, size)
    }

    /// Turn the debug block off to cut standby power
    ///
    /// The probe cannot attach to the stopped core afterwards until the
    /// next power cycle.
    pub fn disable_debug(&mut self) -> Result<()> {
        let target = self.session.target_mut();
        target.halt()?;
        target.write32(DBGMCU_CR, 0)?;
        target.resume()
    }

    /// Contents of the firmware log buffer
    pub fn read_log(&mut self) -> Result<String> {
        self.session.read_log()
    }
}
