//! A static linker for RISC-V 64.
//!
//! Consumes ELF64 little-endian relocatable objects (and archives of them),
//! resolves symbols across them, lays the inputs out into an `ET_EXEC` image,
//! applies relocations, and hands the finished bytes back to the driver.

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

pub mod arch;
pub mod context;
pub mod elf;
pub mod error;
pub mod file;
pub mod input;
pub mod merge;
pub mod output;
pub mod passes;
pub mod symbol;
pub mod util;

#[cfg(test)]
pub(crate) mod testobj;
