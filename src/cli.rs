//! CLI argument parsing

use crate::programmers;
use clap::{Parser, Subcommand};
use gnwflash_core::compress::Compression;
use gnwflash_core::layout::parse_number;
use std::path::PathBuf;

/// Chip name handed to probe-rs by default
pub const DEFAULT_CHIP: &str = "STM32H7B0VBTx";

/// Parse a string as a hex or decimal u32
fn parse_hex_u32(s: &str) -> Result<u32, String> {
    parse_number(s)
}

/// Generate dynamic help text for the target argument
fn target_help() -> String {
    format!(
        "Target backend to use [available: {}]",
        programmers::target_names_short()
    )
}

#[derive(Parser)]
#[command(name = "gnwflash")]
#[command(author, version, about = "Game & Watch external flash programmer", long_about = None)]
pub struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[arg(short, long, global = true, default_value = "probe-rs", help = target_help())]
    pub target: String,

    /// Chip name passed to probe-rs
    #[arg(long, global = true, default_value = DEFAULT_CHIP)]
    pub chip: String,

    /// Seconds to wait for any single device response
    #[arg(long, global = true, default_value_t = 10.0)]
    pub timeout: f64,

    /// Seconds to wait for the device to finish an erase
    #[arg(long, global = true, default_value_t = 120.0)]
    pub erase_timeout: f64,

    /// Milliseconds between two polls of the device
    #[arg(long, global = true, default_value_t = 50)]
    pub poll_interval: u64,

    /// Shared memory layout file (TOML), overriding the built-in table
    #[arg(long, global = true)]
    pub layout_file: Option<PathBuf>,

    /// Turn the debug block off when done to save battery
    #[arg(long, global = true)]
    pub disable_debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Erase and program a file into extflash
    Flash {
        /// Image to program
        file: PathBuf,

        /// Extflash offset (not the 0x90000000 mapped address)
        #[arg(value_parser = parse_hex_u32)]
        address: u32,

        /// Chunk compression (lzma, none)
        #[arg(long, default_value = "lzma", value_parser = clap::value_parser!(Compression))]
        compression: Compression,

        /// Compression worker threads (capped at the number of contexts)
        #[arg(long, default_value_t = 2)]
        workers: usize,
    },

    /// Erase part of extflash, or all of it
    Erase {
        /// Extflash offset of the first byte to erase
        #[arg(long, value_parser = parse_hex_u32, requires = "size")]
        offset: Option<u32>,

        /// Bytes to erase; the whole chip when omitted
        #[arg(long, value_parser = parse_hex_u32)]
        size: Option<u32>,
    },

    /// List a directory of the on-flash filesystem
    Ls {
        /// Directory to list
        #[arg(default_value = "/")]
        path: String,
    },

    /// Dump extflash contents to a file
    Read {
        /// Output file
        file: PathBuf,

        /// Extflash offset
        #[arg(value_parser = parse_hex_u32)]
        address: u32,

        /// Number of bytes to read
        #[arg(value_parser = parse_hex_u32)]
        size: u32,
    },

    /// Print the shared memory address table
    Layout {
        /// Show the legacy single-buffer protocol instead
        #[arg(long)]
        legacy: bool,
    },

    /// List available target backends
    Targets,
}
