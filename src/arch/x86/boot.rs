/*
 * This file is part of Kestrel. See the license notice in `src/kernel.rs`.
 */

//! The bootloader handoff contract (§6 of the design ledger).
//!
//! The bootloader is an external collaborator: by the time `kernel_main` runs, it has
//! already put the CPU in 32-bit protected mode with a temporary GDT, paging off and
//! interrupts disabled, and has populated two fixed low-memory locations that this
//! module reads.

use core::mem::size_of;

/// Physical address of the 32-bit little-endian memory-size-in-bytes word.
const MEMMAP_ADDR: usize = 0x500;
/// Physical address of the optional VESA mode-info block.
const VESA_INFO_ADDR: usize = 0x600;

/// Packed VESA mode info, exactly as the bootloader lays it out at [`VESA_INFO_ADDR`].
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct VesaInfo {
	pub width: u16,
	pub height: u16,
	pub bpp: u8,
	pub pad: u8,
	pub pitch: u16,
	pub framebuffer_phys: u32,
	pub enabled: u8,
}

/// Everything the kernel needs out of the bootloader handoff.
#[derive(Clone, Copy, Debug)]
pub struct Handoff {
	/// Total physical memory in bytes, as reported by the bootloader's probe (typically
	/// BIOS `INT 15h, AX=E820h`).
	pub mem_size: u32,
	/// `Some` if the bootloader left a valid VESA linear framebuffer set up.
	pub vesa: Option<VesaInfo>,
}

/// Reads the bootloader handoff data from its fixed physical addresses.
///
/// # Safety note
///
/// This reads raw physical memory below 1 MiB, which is identity-mapped at boot and
/// stays so forever (§4.3 invariants), so no unsafe block beyond the volatile reads
/// themselves is required once paging is enabled.
pub fn read_handoff() -> Handoff {
	let mem_size = unsafe { (MEMMAP_ADDR as *const u32).read_volatile() };
	let vesa_raw = unsafe { (VESA_INFO_ADDR as *const VesaInfo).read_unaligned() };
	let vesa = if vesa_raw.enabled == 1 {
		Some(vesa_raw)
	} else {
		None
	};
	Handoff { mem_size, vesa }
}

const _: () = assert!(size_of::<VesaInfo>() == 13);
