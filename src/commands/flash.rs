//! `flash` command: erase and program an image

use std::path::Path;
use std::time::Duration;

use gnwflash_core::compress::Compression;
use gnwflash_core::ops::{FlashApp, WriteProgress, WriteStats};
use gnwflash_core::poll::Clock;
use gnwflash_core::target::TargetMemory;
use indicatif::{ProgressBar, ProgressStyle};

use super::{format_size, read_file, CmdResult};

/// Create a byte progress bar with a phase suffix
fn create_progress_bar_with_phase(total: u64, phase: &str) -> CmdResult<ProgressBar> {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(&format!(
                "{{spinner:.green}} [{{elapsed_precise}}] [{{bar:40.cyan/blue}}] {{bytes}}/{{total_bytes}} ({{bytes_per_sec}}, {{eta}}) {}",
                phase
            ))?
            .progress_chars("#>-"),
    );
    Ok(pb)
}

fn create_spinner_style() -> CmdResult<ProgressStyle> {
    Ok(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?)
}

// =============================================================================
// Progress reporting
// =============================================================================

/// Progress reporter using indicatif progress bars
///
/// Only one bar or spinner is live at a time: the byte bar while chunks are
/// submitted, then a spinner while the device finishes the last ones.
#[derive(Default)]
pub struct IndicatifProgress {
    current_bar: Option<ProgressBar>,
    phase: &'static str,
}

impl IndicatifProgress {
    pub fn new() -> Self {
        Self::default()
    }

    fn create_bar(&mut self, total: u64, phase: &'static str) {
        self.phase = phase;
        let pb = create_progress_bar_with_phase(total, phase)
            .unwrap_or_else(|_| ProgressBar::new(total));
        self.current_bar = Some(pb);
    }

    fn create_spinner(&mut self, message: String) {
        let pb = ProgressBar::new_spinner();
        pb.set_style(create_spinner_style().unwrap_or_else(|_| ProgressStyle::default_spinner()));
        pb.set_message(message);
        pb.enable_steady_tick(Duration::from_millis(100));
        self.current_bar = Some(pb);
    }

    fn finish(&mut self, message: &str) {
        if let Some(pb) = self.current_bar.take() {
            pb.finish_with_message(message.to_string());
        }
    }
}

impl WriteProgress for IndicatifProgress {
    fn writing(&mut self, bytes_to_write: usize, chunks: usize) {
        log::debug!("Writing {} bytes in {} chunks", bytes_to_write, chunks);
        self.create_bar(bytes_to_write as u64, "Writing");
    }

    fn write_progress(&mut self, bytes_submitted: usize) {
        if let Some(pb) = &self.current_bar {
            pb.set_position(bytes_submitted as u64);
        }
    }

    fn draining(&mut self) {
        self.finish(self.phase);
        self.create_spinner("Waiting for the device to verify the last chunks...".into());
    }

    fn complete(&mut self, stats: &WriteStats) {
        if let Some(pb) = self.current_bar.take() {
            pb.finish_and_clear();
        }
        log::debug!(
            "{} of {} chunks sent compressed",
            stats.compressed_chunks,
            stats.chunks
        );
    }
}

/// Erase and program `file` at extflash `address`
pub fn run_flash<T: TargetMemory, C: Clock>(
    app: &mut FlashApp<T, C>,
    file: &Path,
    address: u32,
    progress: &mut impl WriteProgress,
) -> CmdResult<WriteStats> {
    let data = read_file(file)?;
    if data.is_empty() {
        return Err(format!("{} is empty, nothing to flash", file.display()).into());
    }
    println!(
        "Flashing {} ({}) to 0x{:08X}",
        file.display(),
        format_size(data.len()),
        address
    );

    let stats = app.write_with_progress(address, &data, progress)?;
    print_stats(&stats, app.config().compression);
    Ok(stats)
}

fn print_stats(stats: &WriteStats, compression: Compression) {
    if compression == Compression::None {
        println!("Wrote {} bytes in {} chunks", stats.bytes_written, stats.chunks);
    } else {
        println!(
            "Wrote {} bytes in {} chunks, transferred {} bytes ({:.1}%)",
            stats.bytes_written,
            stats.chunks,
            stats.bytes_transferred,
            stats.ratio() * 100.0
        );
    }
}
