//! littlefs2 storage over the flashapp block device
//!
//! littlefs2 fixes the geometry at compile time, so [`LfsStorage`] only
//! accepts partitions that match the firmware's `lfs_config` exactly.

use gnwflash_core::fs::{BlockDevice, FsGeometry};
use littlefs2::consts;
use littlefs2::driver::Storage;
use littlefs2::fs::Filesystem;
use littlefs2::io;
use littlefs2::path::PathBuf;

const READ_SIZE: usize = 256;
const WRITE_SIZE: usize = 256;
const BLOCK_SIZE: usize = 4096;
const BLOCK_COUNT: usize = 256;

/// One directory entry as printed by `ls`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub name: String,
    pub is_dir: bool,
    pub len: usize,
}

/// littlefs2 [`Storage`] backed by a [`BlockDevice`]
pub struct LfsStorage<D> {
    device: D,
}

impl<D: BlockDevice> LfsStorage<D> {
    /// Wrap `device`, checking that `geometry` is what littlefs2 was built for
    pub fn new(device: D, geometry: FsGeometry) -> Result<Self, Box<dyn std::error::Error>> {
        let expected = (READ_SIZE, WRITE_SIZE, BLOCK_SIZE, BLOCK_COUNT);
        let actual = (
            geometry.read_size as usize,
            geometry.prog_size as usize,
            geometry.block_size as usize,
            geometry.block_count as usize,
        );
        if actual != expected {
            return Err(format!(
                "Unsupported filesystem geometry: read {} prog {} block {}x{}",
                actual.0, actual.1, actual.2, actual.3
            )
            .into());
        }
        Ok(Self { device })
    }

    /// Split a partition-relative range at block boundaries
    fn for_each_block<F>(off: usize, len: usize, mut f: F) -> io::Result<usize>
    where
        F: FnMut(u32, u32, std::ops::Range<usize>) -> gnwflash_core::Result<()>,
    {
        let mut done = 0;
        while done < len {
            let at = off + done;
            let in_block = at % BLOCK_SIZE;
            let n = (BLOCK_SIZE - in_block).min(len - done);
            f((at / BLOCK_SIZE) as u32, in_block as u32, done..done + n).map_err(|e| {
                log::debug!("littlefs block access failed: {}", e);
                io::Error::Io
            })?;
            done += n;
        }
        Ok(len)
    }
}

impl<D: BlockDevice> Storage for LfsStorage<D> {
    const READ_SIZE: usize = READ_SIZE;
    const WRITE_SIZE: usize = WRITE_SIZE;
    const BLOCK_SIZE: usize = BLOCK_SIZE;
    const BLOCK_COUNT: usize = BLOCK_COUNT;
    const BLOCK_CYCLES: isize = 500;

    type CACHE_SIZE = consts::U256;
    // In units of u64, i.e. 16 bytes
    type LOOKAHEAD_SIZE = consts::U2;

    fn read(&mut self, off: usize, buf: &mut [u8]) -> io::Result<usize> {
        let device = &mut self.device;
        Self::for_each_block(off, buf.len(), |block, offset, range| {
            device.read(block, offset, &mut buf[range])
        })
    }

    fn write(&mut self, off: usize, data: &[u8]) -> io::Result<usize> {
        let device = &mut self.device;
        Self::for_each_block(off, data.len(), |block, offset, range| {
            device.prog(block, offset, &data[range])
        })
    }

    fn erase(&mut self, off: usize, len: usize) -> io::Result<usize> {
        let device = &mut self.device;
        Self::for_each_block(off, len, |block, _, _| device.erase(block))
    }
}

fn lfs_error(context: &str, e: io::Error) -> Box<dyn std::error::Error> {
    format!("{}: littlefs error {:?}", context, e).into()
}

/// Longest path littlefs2 accepts, in bytes
const PATH_MAX: usize = 255;

/// Reject paths littlefs2's `PathBuf` would panic on
fn check_path(path: &str) -> Result<(), Box<dyn std::error::Error>> {
    if !path.is_ascii() {
        return Err(format!("Invalid path {:?}: only ASCII names are supported", path).into());
    }
    if path.len() > PATH_MAX {
        return Err(format!(
            "Invalid path: {} bytes, at most {} allowed",
            path.len(),
            PATH_MAX
        )
        .into());
    }
    if path.contains('\0') {
        return Err(format!("Invalid path {:?}: contains a NUL byte", path).into());
    }
    Ok(())
}

/// List the entries of `path`, skipping `.` and `..`
pub fn list_dir<D: BlockDevice>(
    storage: &mut LfsStorage<D>,
    path: &str,
) -> Result<Vec<Entry>, Box<dyn std::error::Error>> {
    check_path(path)?;

    let mut alloc = Filesystem::allocate();
    let fs = Filesystem::mount(&mut alloc, storage)
        .map_err(|e| lfs_error("Failed to mount the filesystem", e))?;

    let dir = PathBuf::from(path);
    let entries = fs
        .read_dir_and_then(&dir, |entries| {
            let mut listed = Vec::new();
            for entry in entries {
                let entry = entry?;
                let name = entry.file_name().to_string();
                if name == "." || name == ".." {
                    continue;
                }
                let metadata = entry.metadata();
                listed.push(Entry {
                    name,
                    is_dir: metadata.is_dir(),
                    len: metadata.len(),
                });
            }
            Ok(listed)
        })
        .map_err(|e| lfs_error(&format!("Failed to list {}", path), e))?;
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_path() {
        assert!(check_path("/").is_ok());
        assert!(check_path("/SAVES/zelda.sav").is_ok());
        assert!(check_path("/SAVES/\u{e9}").is_err());
        assert!(check_path("/SAVES\0/x").is_err());
        assert!(check_path(&format!("/{}", "a".repeat(254))).is_ok());
        assert!(check_path(&format!("/{}", "a".repeat(255))).is_err());
    }

    #[cfg(feature = "dummy")]
    mod device {
        use super::super::*;
        use gnwflash_core::fs::ExtflashBlockDevice;
        use gnwflash_core::layout::ProtocolLayout;
        use gnwflash_core::ops::{EngineConfig, FlashApp};
        use gnwflash_core::poll::FakeClock;
        use gnwflash_dummy::DummyFlashApp;

        fn app() -> FlashApp<DummyFlashApp, FakeClock> {
            let mut app = FlashApp::with_layout_and_clock(
                DummyFlashApp::new_default().unwrap(),
                ProtocolLayout::dual_context().unwrap(),
                EngineConfig::default(),
                FakeClock::new(),
            );
            app.start().unwrap();
            app
        }

        #[test]
        fn test_format_write_and_list() {
            let mut app = app();
            let geometry = app.geometry().unwrap();
            let device = ExtflashBlockDevice::new(&mut app).unwrap();
            let mut storage = LfsStorage::new(device, geometry).unwrap();

            Filesystem::format(&mut storage).unwrap();
            {
                let mut alloc = Filesystem::allocate();
                let fs = Filesystem::mount(&mut alloc, &mut storage).unwrap();
                fs.create_dir(&PathBuf::from("/SAVES")).unwrap();
                fs.write(&PathBuf::from("/SAVES/zelda.sav"), &[0x5A; 1000])
                    .unwrap();
            }

            let mut root = list_dir(&mut storage, "/").unwrap();
            root.sort_by(|a, b| a.name.cmp(&b.name));
            assert_eq!(
                root,
                vec![Entry {
                    name: "SAVES".into(),
                    is_dir: true,
                    len: 0
                }]
            );

            let saves = list_dir(&mut storage, "/SAVES").unwrap();
            assert_eq!(saves.len(), 1);
            assert_eq!(saves[0].name, "zelda.sav");
            assert_eq!(saves[0].len, 1000);
        }

        #[test]
        fn test_unformatted_partition_fails_to_mount() {
            let mut app = app();
            let geometry = app.geometry().unwrap();
            let device = ExtflashBlockDevice::new(&mut app).unwrap();
            let mut storage = LfsStorage::new(device, geometry).unwrap();
            assert!(list_dir(&mut storage, "/").is_err());
        }

        #[test]
        fn test_list_rejects_non_ascii_path() {
            let mut app = app();
            let geometry = app.geometry().unwrap();
            let device = ExtflashBlockDevice::new(&mut app).unwrap();
            let mut storage = LfsStorage::new(device, geometry).unwrap();
            Filesystem::format(&mut storage).unwrap();

            let err = list_dir(&mut storage, "/SAVES/\u{e9}").unwrap_err();
            assert!(err.to_string().contains("ASCII"));
            assert!(list_dir(&mut storage, "/").unwrap().is_empty());
        }

        #[test]
        fn test_rejects_foreign_geometry() {
            let mut app = app();
            let geometry = FsGeometry {
                block_size: 8192,
                block_count: 128,
                ..app.geometry().unwrap()
            };
            let device = ExtflashBlockDevice::with_geometry(&mut app, geometry);
            assert!(LfsStorage::new(device, geometry).is_err());
        }
    }
}
