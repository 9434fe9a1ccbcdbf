//! Read command implementation

use std::path::Path;

use gnwflash_core::ops::FlashApp;
use gnwflash_core::poll::Clock;
use gnwflash_core::target::TargetMemory;
use indicatif::{ProgressBar, ProgressStyle};

use super::{format_size, write_file, CmdResult};

/// Bytes pulled from the read window per transfer
const READ_BLOCK: usize = 64 * 1024;

/// Dump `size` bytes of extflash starting at `address` into `output`
pub fn run_read<T: TargetMemory, C: Clock>(
    app: &mut FlashApp<T, C>,
    output: &Path,
    address: u32,
    size: u32,
) -> CmdResult<Vec<u8>> {
    let size = size as usize;
    println!("Reading {} from 0x{:08X}", format_size(size), address);

    let pb = ProgressBar::new(size as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")?
            .progress_chars("#>-"),
    );

    let mut data = Vec::with_capacity(size);
    while data.len() < size {
        let len = READ_BLOCK.min(size - data.len());
        let offset = address + data.len() as u32;
        data.extend_from_slice(&app.read(offset, len)?);
        pb.set_position(data.len() as u64);
    }
    pb.finish_and_clear();

    write_file(output, &data)?;
    println!("Wrote {} bytes to {}", data.len(), output.display());
    Ok(data)
}
