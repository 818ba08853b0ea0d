//! 32-bit x86 architecture support: I/O primitives, segmentation, interrupts, and the
//! bootloader handoff contract.

pub mod boot;
pub mod gdt;
pub mod idt;
pub mod io;
pub mod pit;
pub mod serial;
