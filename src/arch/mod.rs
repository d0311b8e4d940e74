//! Architecture specific definitions. Only RISC-V is supported.

pub mod riscv;
