//! `ls` command: list a directory of the on-flash filesystem

use gnwflash_core::ops::FlashApp;
use gnwflash_core::poll::Clock;
use gnwflash_core::target::TargetMemory;

use super::CmdResult;

/// List `path` on the littlefs partition
#[cfg(feature = "littlefs")]
pub fn run_ls<T: TargetMemory, C: Clock>(app: &mut FlashApp<T, C>, path: &str) -> CmdResult {
    use crate::lfs::{list_dir, LfsStorage};
    use gnwflash_core::fs::ExtflashBlockDevice;

    let geometry = app.geometry()?;
    let device = ExtflashBlockDevice::new(app)?;
    let mut storage = LfsStorage::new(device, geometry)?;

    let mut entries = list_dir(&mut storage, path)?;
    entries.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.name.cmp(&b.name)));

    for entry in &entries {
        if entry.is_dir {
            println!("{:>10}  {}/", "<DIR>", entry.name);
        } else {
            println!("{:>10}  {}", entry.len, entry.name);
        }
    }
    println!("{} entries", entries.len());
    Ok(())
}

#[cfg(not(feature = "littlefs"))]
pub fn run_ls<T: TargetMemory, C: Clock>(_app: &mut FlashApp<T, C>, _path: &str) -> CmdResult {
    Err("ls needs the littlefs feature (recompile with --features littlefs)".into())
}
