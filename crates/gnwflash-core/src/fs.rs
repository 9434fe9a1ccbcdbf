//! Block device adapter for the on-flash filesystem
//!
//! The firmware keeps a littlefs partition in extflash and mirrors its
//! `struct lfs_config` into shared RAM. The host reads the geometry from
//! there at bootstrap and serves littlefs' block primitives through the
//! flashapp operations. Directory and file handling stay in the filesystem
//! library.

use crate::error::{Error, Result};
use crate::layout::{ERASE_ALIGNMENT, READ_WINDOW_BASE};
use crate::ops::{EraseSize, FlashApp};
use crate::poll::Clock;
use crate::target::TargetMemory;

/// Filesystem partition geometry as configured in the firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsGeometry {
    /// Extflash offset of block 0
    pub base_offset: u32,
    /// Erase block size
    pub block_size: u32,
    /// Number of blocks
    pub block_count: u32,
    /// Minimum read size
    pub read_size: u32,
    /// Minimum program size
    pub prog_size: u32,
}

impl FsGeometry {
    /// Validate raw `lfs_cfg` words
    ///
    /// `context` is the memory-mapped address of the partition.
    pub fn from_lfs_config(
        context: u32,
        read_size: u32,
        prog_size: u32,
        block_size: u32,
        block_count: u32,
    ) -> Result<Self> {
        let base_offset = context.checked_sub(READ_WINDOW_BASE).ok_or_else(|| {
            Error::Filesystem(format!(
                "partition address 0x{:08X} is outside the extflash window",
                context
            ))
        })?;

        if block_size == 0 || block_count == 0 || read_size == 0 || prog_size == 0 {
            return Err(Error::Filesystem(format!(
                "incomplete geometry: block {}x{}, read {}, prog {}",
                block_size, block_count, read_size, prog_size
            )));
        }
        if block_size % ERASE_ALIGNMENT != 0 || base_offset % ERASE_ALIGNMENT != 0 {
            return Err(Error::Filesystem(format!(
                "blocks must be aligned to {} bytes (base 0x{:08X}, size {})",
                ERASE_ALIGNMENT, base_offset, block_size
            )));
        }

        let geometry = Self {
            base_offset,
            block_size,
            block_count,
            read_size,
            prog_size,
        };
        if u64::from(base_offset) + geometry.size() > u64::from(READ_WINDOW_BASE) {
            return Err(Error::Filesystem("partition runs past extflash".into()));
        }
        Ok(geometry)
    }

    /// Partition size in bytes
    pub fn size(&self) -> u64 {
        u64::from(self.block_size) * u64::from(self.block_count)
    }

    /// Extflash offset of `(block, offset)`, checking `len` stays in the block
    pub fn offset(&self, block: u32, offset: u32, len: usize) -> Result<u32> {
        if block >= self.block_count {
            return Err(Error::Filesystem(format!(
                "block {} out of range (count {})",
                block, self.block_count
            )));
        }
        if u64::from(offset) + len as u64 > u64::from(self.block_size) {
            return Err(Error::Filesystem(format!(
                "{} bytes at {} cross the end of block {}",
                len, offset, block
            )));
        }
        Ok(self.base_offset + block * self.block_size + offset)
    }
}

/// The primitives an embedded filesystem needs from its storage
pub trait BlockDevice {
    /// Read `buf.len()` bytes at `offset` within `block`
    fn read(&mut self, block: u32, offset: u32, buf: &mut [u8]) -> Result<()>;

    /// Program `data` at `offset` within an erased `block`
    fn prog(&mut self, block: u32, offset: u32, data: &[u8]) -> Result<()>;

    /// Erase one block
    fn erase(&mut self, block: u32) -> Result<()>;

    /// Flush pending writes
    fn sync(&mut self) -> Result<()>;
}

/// [`BlockDevice`] over the flashapp erase/program/read operations
pub struct ExtflashBlockDevice<'a, T, C> {
    app: &'a mut FlashApp<T, C>,
    geometry: FsGeometry,
}

impl<'a, T: TargetMemory, C: Clock> ExtflashBlockDevice<'a, T, C> {
    /// Adapter using the geometry discovered at bootstrap
    pub fn new(app: &'a mut FlashApp<T, C>) -> Result<Self> {
        let geometry = app.geometry()?;
        Ok(Self::with_geometry(app, geometry))
    }

    /// Adapter with an explicit geometry
    pub fn with_geometry(app: &'a mut FlashApp<T, C>, geometry: FsGeometry) -> Self {
        Self { app, geometry }
    }

    /// Partition geometry
    pub fn geometry(&self) -> FsGeometry {
        self.geometry
    }
}

impl<T: TargetMemory, C: Clock> BlockDevice for ExtflashBlockDevice<'_, T, C> {
    fn read(&mut self, block: u32, offset: u32, buf: &mut [u8]) -> Result<()> {
        let at = self.geometry.offset(block, offset, buf.len())?;
        let data = self.app.read(at, buf.len())?;
        buf.copy_from_slice(&data);
        Ok(())
    }

    fn prog(&mut self, block: u32, offset: u32, data: &[u8]) -> Result<()> {
        let at = self.geometry.offset(block, offset, data.len())?;
        self.app.program(at, data)
    }

    fn erase(&mut self, block: u32) -> Result<()> {
        let at = self.geometry.offset(block, 0, 0)?;
        self.app.erase(at, EraseSize::Bytes(self.geometry.block_size))
    }

    // Every operation drains before it returns.
    fn sync(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry_from_lfs_config() {
        let geometry = FsGeometry::from_lfs_config(0x9010_0000, 256, 256, 4096, 256).unwrap();
        assert_eq!(geometry.base_offset, 0x10_0000);
        assert_eq!(geometry.size(), 1 << 20);
        assert_eq!(geometry.offset(0, 0, 4096).unwrap(), 0x10_0000);
        assert_eq!(geometry.offset(2, 512, 256).unwrap(), 0x10_2200);
    }

    #[test]
    fn test_geometry_rejects_bad_config() {
        // Unset base pointer
        assert!(FsGeometry::from_lfs_config(0, 256, 256, 4096, 256).is_err());
        assert!(FsGeometry::from_lfs_config(0x9000_0000, 256, 256, 0, 256).is_err());
        assert!(FsGeometry::from_lfs_config(0x9000_0800, 256, 256, 4096, 256).is_err());
        assert!(FsGeometry::from_lfs_config(0x9000_0000, 256, 256, 2048, 256).is_err());
    }

    #[test]
    fn test_offset_bounds() {
        let geometry = FsGeometry::from_lfs_config(0x9000_0000, 256, 256, 4096, 4).unwrap();
        assert!(geometry.offset(4, 0, 1).is_err());
        assert!(geometry.offset(3, 4000, 97).is_err());
        assert!(geometry.offset(3, 4000, 96).is_ok());
    }
}
