//! gnwflash - Game & Watch external flash programmer
//!
//! Drives the "flashapp" firmware running on the Game & Watch over a debug
//! probe. The host never touches the flash controller itself: it fills one
//! of two RAM transfer contexts with a (possibly LZMA compressed) chunk,
//! flags it ready, and the firmware erases, programs and verifies the
//! external flash on its own.
//!
//! # Architecture
//!
//! - `gnwflash-core` holds the protocol engine (layout, context pool,
//!   compression, high-level operations)
//! - backends implement `TargetMemory`: `gnwflash-probe` for real hardware
//!   through probe-rs, `gnwflash-dummy` for an in-memory emulator
//! - this binary wires the CLI to the engine

mod cli;
mod commands;
#[cfg(feature = "littlefs")]
mod lfs;
mod programmers;

use clap::error::ErrorKind;
use clap::Parser;
use cli::{Cli, Commands};
use commands::DeviceOptions;

fn main() {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            e.exit()
        }
        Err(e) => {
            let _ = e.print();
            std::process::exit(1);
        }
    };

    // Set log level based on verbosity
    match cli.verbose {
        0 => {} // default (info)
        1 => log::set_max_level(log::LevelFilter::Debug),
        _ => log::set_max_level(log::LevelFilter::Trace),
    }

    if let Err(e) = run(&cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> commands::CmdResult {
    match &cli.command {
        Commands::Targets => {
            print!("{}", programmers::target_help());
            Ok(())
        }
        Commands::Layout { legacy } => {
            let layout = commands::load_layout(cli.layout_file.as_deref())?;
            commands::layout::run_layout(&layout, *legacy)
        }
        Commands::Flash {
            file,
            address,
            compression,
            workers,
        } => {
            let mut opts = DeviceOptions::from_cli(cli)?;
            opts.config.compression = *compression;
            opts.config.workers = *workers;
            commands::with_flashapp(opts, |app| {
                let mut progress = commands::flash::IndicatifProgress::new();
                commands::flash::run_flash(app, file, *address, &mut progress).map(|_| ())
            })
        }
        Commands::Erase { offset, size } => {
            let opts = DeviceOptions::from_cli(cli)?;
            commands::with_flashapp(opts, |app| {
                commands::erase::run_erase(app, *offset, *size)
            })
        }
        Commands::Ls { path } => {
            let opts = DeviceOptions::from_cli(cli)?;
            commands::with_flashapp(opts, |app| commands::ls::run_ls(app, path))
        }
        Commands::Read {
            file,
            address,
            size,
        } => {
            let opts = DeviceOptions::from_cli(cli)?;
            commands::with_flashapp(opts, |app| {
                commands::read::run_read(app, file, *address, *size).map(|_| ())
            })
        }
    }
}
