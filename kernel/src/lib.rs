//! Emberboot core: the early-boot runtime of a modular bootloader.
//!
//! Region heap, sector cache, disk and partition layers, filesystem
//! dispatch, and the loader that links relocatable ELF modules into the
//! running image. Everything hangs off one [`kernel::Kernel`] context.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod device;
pub mod dl;
pub mod error;
pub mod fs;
pub mod kernel;
pub mod mem;
pub mod storage;
pub mod time;

// Hardware-dependent, only built for the freestanding target.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod arch;

#[cfg(test)]
mod testutil;

pub use error::{Error, ErrorKind, Result};
pub use kernel::Kernel;
