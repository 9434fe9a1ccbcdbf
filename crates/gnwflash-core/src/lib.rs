//! gnwflash-core - Host-side engine for the flashapp programming protocol
//!
//! The target runs a small firmware ("flashapp") that exposes a block of
//! shared RAM at fixed, linker-defined addresses. Once it runs, the host only
//! fills one of two transfer contexts and flips its `ready` flag; the
//! firmware erases, programs and hash-checks the external flash on its own.
//! This crate implements the host side:
//!
//! - [`layout`] - address tables for the shared variables and contexts
//! - [`status`] - the device-authoritative state and status enumerations
//! - [`target`] - the memory access trait a debug probe must provide
//! - [`poll`] - clocks and the fixed-interval busy-poll primitive
//! - [`session`] / [`state`] - typed variable access and the state machine driver
//! - [`pool`] - the double-buffered transfer context pool
//! - [`compress`] - chunking, LZMA compression and hashing
//! - [`ops`] - erase / write / read on top of all of the above
//! - [`fs`] - block-device adapter for an embedded filesystem
//!
//! # Example
//!
//! ```ignore
//! use gnwflash_core::ops::{EngineConfig, EraseSize, FlashApp};
//!
//! fn program<T: gnwflash_core::target::TargetMemory>(target: T, image: &[u8]) -> gnwflash_core::Result<()> {
//!     let mut app = FlashApp::new(target, EngineConfig::default())?;
//!     app.start()?;
//!     app.erase(0, EraseSize::WholeChip)?;
//!     app.write(0, image)?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod compress;
pub mod error;
pub mod fs;
pub mod layout;
pub mod ops;
pub mod poll;
pub mod pool;
pub mod session;
pub mod state;
pub mod status;
pub mod target;

#[cfg(test)]
pub(crate) mod mock;

pub use error::{Error, Result};
