/*
 * This file is part of Kestrel. See the license notice in `src/kernel.rs`.
 */

//! The GDT (Global Descriptor Table) is a deprecated structure that x86 still requires
//! to switch to protected mode, to set up privilege rings and to load the Task State
//! Segment. This kernel uses it for exactly the five entries it needs and nothing else.

use core::{arch::asm, mem::size_of};

/// Selector of the kernel code segment. Appears in every installed IDT gate.
pub const KERNEL_CS: u16 = 0x08;
/// Selector of the kernel data segment.
pub const KERNEL_DS: u16 = 0x10;
/// Selector of the user code segment (ring 3).
pub const USER_CS: u16 = 0x18;
/// Selector of the user data segment (ring 3).
pub const USER_DS: u16 = 0x20;

const ENTRY_COUNT: usize = 5;

/// A raw 8-byte GDT entry.
#[repr(transparent)]
#[derive(Clone, Copy, Default)]
struct Entry(u64);

impl Entry {
	const fn null() -> Self {
		Self(0)
	}

	/// Builds a flat (base=0, limit=4GB) segment descriptor.
	///
	/// `access` is the standard access byte (present, ring, type); `flags` holds the
	/// granularity/size bits (bits 52-55 of the descriptor).
	const fn flat(access: u8, flags: u8) -> Self {
		let limit: u32 = 0xfffff;
		let base: u32 = 0;
		let low = (limit & 0xffff) as u64
			| ((base & 0xffff) as u64) << 16
			| (((base >> 16) & 0xff) as u64) << 32
			| (access as u64) << 40
			| (((limit >> 16) & 0xf) as u64) << 48
			| (flags as u64) << 52
			| (((base >> 24) & 0xff) as u64) << 56;
		Self(low)
	}
}

/// Present, ring 0, code segment, executable, readable.
const KERNEL_CODE_ACCESS: u8 = 0b1001_1010;
/// Present, ring 0, data segment, writable.
const KERNEL_DATA_ACCESS: u8 = 0b1001_0010;
/// Present, ring 3, code segment, executable, readable.
const USER_CODE_ACCESS: u8 = 0b1111_1010;
/// Present, ring 3, data segment, writable.
const USER_DATA_ACCESS: u8 = 0b1111_0010;
/// 32-bit protected mode, page granularity.
const FLAT_FLAGS: u8 = 0b1100;

static GDT: [Entry; ENTRY_COUNT] = [
	Entry::null(),
	Entry::flat(KERNEL_CODE_ACCESS, FLAT_FLAGS),
	Entry::flat(KERNEL_DATA_ACCESS, FLAT_FLAGS),
	Entry::flat(USER_CODE_ACCESS, FLAT_FLAGS),
	Entry::flat(USER_DATA_ACCESS, FLAT_FLAGS),
];

#[repr(C, packed)]
struct DescriptorTablePointer {
	limit: u16,
	base: u32,
}

/// Loads the GDT register and reloads every segment register to point at the new
/// kernel code/data selectors.
///
/// # Safety
///
/// Must run exactly once, early in boot, with interrupts disabled.
unsafe fn load(pointer: &DescriptorTablePointer) {
	unsafe {
		asm!(
			"lgdt [{ptr}]",
			// Far return to reload CS with the new kernel code selector. The kernel is
			// statically linked (no PIC), so `lea` of a local label gives its link-time
			// absolute address directly.
			"push {cs}",
			"lea {tmp}, [2f]",
			"push {tmp}",
			"retf",
			"2:",
			"mov ax, {ds}",
			"mov ds, ax",
			"mov es, ax",
			"mov fs, ax",
			"mov gs, ax",
			"mov ss, ax",
			ptr = in(reg) pointer,
			cs = in(reg) KERNEL_CS as u32,
			ds = in(reg) KERNEL_DS as u32,
			tmp = out(reg) _,
			out("ax") _,
		);
	}
}

/// Installs the kernel's GDT, replacing the bootloader's temporary one.
///
/// Must be called once, before [`crate::arch::x86::idt::init`].
pub fn init() {
	let pointer = DescriptorTablePointer {
		limit: (size_of::<[Entry; ENTRY_COUNT]>() - 1) as u16,
		base: GDT.as_ptr() as u32,
	};
	unsafe {
		load(&pointer);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn null_descriptor_is_zero() {
		assert_eq!(Entry::null().0, 0);
	}

	#[test]
	fn flat_descriptor_covers_4gb_with_page_granularity() {
		let e = Entry::flat(KERNEL_CODE_ACCESS, FLAT_FLAGS);
		let limit_low = e.0 & 0xffff;
		let limit_high = (e.0 >> 48) & 0xf;
		assert_eq!(limit_low, 0xffff);
		assert_eq!(limit_high, 0xf);
		let access = ((e.0 >> 40) & 0xff) as u8;
		assert_eq!(access, KERNEL_CODE_ACCESS);
	}

	#[test]
	fn selectors_match_table_offsets() {
		assert_eq!(KERNEL_CS as usize, 1 * size_of::<Entry>());
		assert_eq!(KERNEL_DS as usize, 2 * size_of::<Entry>());
		assert_eq!(USER_CS as usize, 3 * size_of::<Entry>());
		assert_eq!(USER_DS as usize, 4 * size_of::<Entry>());
	}
}
