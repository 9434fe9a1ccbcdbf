//! CLI command implementations
//!
//! Every device command follows the same pattern: open the target backend,
//! boot the flashapp, run the operation, and on failure dump the firmware
//! log before reporting the error. The `layout` and `targets` commands never
//! touch a device.

pub mod erase;
pub mod flash;
pub mod layout;
pub mod ls;
pub mod read;

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

use gnwflash_core::layout::{LayoutSpec, ProtocolLayout};
use gnwflash_core::ops::{EngineConfig, FlashApp};
use gnwflash_core::poll::{Clock, PollConfig};
use gnwflash_core::target::TargetMemory;
use indicatif::{ProgressBar, ProgressStyle};

use crate::cli::Cli;
use crate::programmers;

/// Shorthand for the command result type
pub type CmdResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

/// Session options shared by all device commands
pub struct DeviceOptions<'a> {
    pub target: &'a str,
    pub chip: &'a str,
    pub layout: ProtocolLayout,
    pub config: EngineConfig,
    pub disable_debug: bool,
}

impl<'a> DeviceOptions<'a> {
    /// Collect the global options
    pub fn from_cli(cli: &'a Cli) -> CmdResult<Self> {
        let timeout = Duration::try_from_secs_f64(cli.timeout)
            .map_err(|e| format!("Invalid timeout {}: {}", cli.timeout, e))?;
        let erase_timeout = Duration::try_from_secs_f64(cli.erase_timeout)
            .map_err(|e| format!("Invalid erase timeout {}: {}", cli.erase_timeout, e))?;
        let layout = load_layout(cli.layout_file.as_deref())?;

        Ok(Self {
            target: &cli.target,
            chip: &cli.chip,
            layout,
            config: EngineConfig {
                poll: PollConfig {
                    interval: Duration::from_millis(cli.poll_interval),
                    timeout,
                },
                erase_timeout,
                ..EngineConfig::default()
            },
            disable_debug: cli.disable_debug,
        })
    }
}

/// Resolve the shared memory layout, built-in or from a TOML file
pub fn load_layout(path: Option<&Path>) -> CmdResult<ProtocolLayout> {
    let spec = match path {
        Some(path) => {
            log::info!("Using layout from {}", path.display());
            LayoutSpec::from_toml_file(path)?
        }
        None => LayoutSpec::dual_context(),
    };
    Ok(ProtocolLayout::from_spec(&spec)?)
}

/// Open the target, boot the flashapp and run `f` on the session
pub fn with_flashapp<F, R>(opts: DeviceOptions<'_>, f: F) -> CmdResult<R>
where
    F: FnOnce(&mut FlashApp<Box<dyn TargetMemory>>) -> CmdResult<R>,
{
    let target = programmers::open_target(opts.target, opts.chip)?;
    let mut app = FlashApp::with_layout(target, opts.layout, opts.config)?;

    let spinner = spinner("Starting flashapp...");
    let started = app.start();
    spinner.finish_and_clear();
    if let Err(e) = started {
        dump_device_log(&mut app);
        return Err(e.into());
    }

    let result = f(&mut app);
    if result.is_err() {
        dump_device_log(&mut app);
    } else if opts.disable_debug {
        log::info!("Disabling the debug block");
        app.disable_debug()?;
    }
    result
}

/// Log the firmware log buffer at debug level
fn dump_device_log<T: TargetMemory, C: Clock>(app: &mut FlashApp<T, C>) {
    match app.read_log() {
        Ok(text) if !text.is_empty() => {
            log::debug!("Device log:");
            for line in text.lines() {
                log::debug!("  {}", line);
            }
        }
        Ok(_) => {}
        Err(e) => log::debug!("Could not read the device log: {}", e),
    }
}

/// Create a steady spinner with a message
pub fn spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Read a whole input file
pub fn read_file(path: &Path) -> CmdResult<Vec<u8>> {
    let mut file =
        File::open(path).map_err(|e| format!("Failed to open {}: {}", path.display(), e))?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;
    Ok(data)
}

/// Write a whole output file
pub fn write_file(path: &Path, data: &[u8]) -> CmdResult {
    let mut file =
        File::create(path).map_err(|e| format!("Failed to create {}: {}", path.display(), e))?;
    file.write_all(data)?;
    Ok(())
}

/// Format a byte count the way the progress output does
pub fn format_size(bytes: usize) -> String {
    if bytes >= 1024 * 1024 && bytes % (1024 * 1024) == 0 {
        format!("{} MiB", bytes / (1024 * 1024))
    } else if bytes >= 1024 && bytes % 1024 == 0 {
        format!("{} KiB", bytes / 1024)
    } else {
        format!("{} bytes", bytes)
    }
}
