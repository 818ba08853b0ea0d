/*
 * This file is part of Kestrel. See the license notice in `src/kernel.rs`.
 */

//! Two-level x86 paging: a page directory of 1024 entries, each either empty or pointing
//! at a page table of 1024 entries, each pointing at a physical frame.
//!
//! The kernel's own page directory and its first four page tables (enough to identity-map
//! 16 MB) live at fixed physical addresses inside the permanently-reserved first 4 MB
//! [`crate::memory::pmm`] never hands out, sidestepping the chicken-and-egg problem of
//! needing paging structures before a page-frame allocator can place them.

use crate::{
	memory::{pmm, PhysAddr, VirtAddr, PAGE_SIZE},
	sync::IntSpin,
};

/// Present.
pub const FLAG_PRESENT: u32 = 1 << 0;
/// Writable.
pub const FLAG_WRITE: u32 = 1 << 1;
/// Accessible from ring 3. Unused today (no user-mode tasks) but part of the entry shape.
pub const FLAG_USER: u32 = 1 << 2;
pub const FLAG_WRITE_THROUGH: u32 = 1 << 3;
pub const FLAG_CACHE_DISABLE: u32 = 1 << 4;
pub const FLAG_ACCESSED: u32 = 1 << 5;
/// 4 MB page (PDE only). Never set by this implementation; named for data-model fidelity.
pub const FLAG_PAGE_SIZE: u32 = 1 << 7;
pub const FLAG_GLOBAL: u32 = 1 << 8;

/// Flags for a kernel-only, writable, cached page - what every identity-mapped kernel
/// page uses.
pub const KERNEL_PAGE: u32 = FLAG_PRESENT | FLAG_WRITE;

const ENTRIES_PER_TABLE: usize = 1024;
const ADDR_MASK: u32 = !0xfff;

/// Physical address of the kernel's permanent page directory.
const KERNEL_PD_ADDR: usize = 0x300000;
/// Physical address of the first of four permanent page tables following the directory.
const KERNEL_PT_START: usize = 0x301000;
/// Bytes identity-mapped at boot: four page tables' worth.
const IDENTITY_MAP_SIZE: usize = 16 * 1024 * 1024;

#[repr(transparent)]
#[derive(Clone, Copy, Default)]
struct Entry(u32);

impl Entry {
	const fn empty() -> Self {
		Self(0)
	}

	fn set(&mut self, frame: PhysAddr, flags: u32) {
		self.0 = (frame.0 as u32 & ADDR_MASK) | (flags & !ADDR_MASK) | FLAG_PRESENT;
	}

	fn is_present(self) -> bool {
		self.0 & FLAG_PRESENT != 0
	}

	fn address(self) -> PhysAddr {
		PhysAddr((self.0 & ADDR_MASK) as usize)
	}
}

#[repr(C, align(4096))]
struct Table([Entry; ENTRIES_PER_TABLE]);

impl Table {
	fn zeroed_at(phys: PhysAddr) -> *mut Table {
		let table = phys.0 as *mut Table;
		unsafe {
			(*table).0 = [Entry::empty(); ENTRIES_PER_TABLE];
		}
		table
	}
}

/// Physical address of a page directory, opaque to callers beyond passing it back to
/// [`switch_to`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageDirectory(PhysAddr);

struct State {
	current: Option<PageDirectory>,
}

static STATE: IntSpin<State> = IntSpin::new(State { current: None });

fn directory_table(pd: PageDirectory) -> *mut Table {
	pd.0 .0 as *mut Table
}

/// Builds the kernel's permanent page directory at [`KERNEL_PD_ADDR`], identity-maps the
/// first [`IDENTITY_MAP_SIZE`] bytes as kernel-writable, and loads CR3 - but does not yet
/// set the paging bit; call [`enable`] once the caller is ready.
pub fn init() {
	let pd_phys = PhysAddr(KERNEL_PD_ADDR);
	let pd = Table::zeroed_at(pd_phys);

	let num_tables = IDENTITY_MAP_SIZE / (ENTRIES_PER_TABLE * PAGE_SIZE);
	for pt_idx in 0..num_tables {
		let pt_phys = PhysAddr(KERNEL_PT_START + pt_idx * PAGE_SIZE);
		let pt = Table::zeroed_at(pt_phys);
		for pte_idx in 0..ENTRIES_PER_TABLE {
			let frame = PhysAddr((pt_idx * ENTRIES_PER_TABLE + pte_idx) * PAGE_SIZE);
			unsafe {
				(*pt).0[pte_idx].set(frame, KERNEL_PAGE);
			}
		}
		unsafe {
			(*pd).0[pt_idx].set(pt_phys, KERNEL_PAGE);
		}
	}

	let directory = PageDirectory(pd_phys);
	STATE.lock().current = Some(directory);
	load_cr3(pd_phys);
}

/// Sets the CPU's paging-enable bit. Must be called after [`init`].
pub fn enable() {
	unsafe {
		let mut cr0: u32;
		core::arch::asm!("mov {0}, cr0", out(reg) cr0, options(nomem, nostack, preserves_flags));
		cr0 |= 1 << 31;
		core::arch::asm!("mov cr0, {0}", in(reg) cr0, options(nostack, preserves_flags));
	}
}

fn load_cr3(pd: PhysAddr) {
	unsafe {
		core::arch::asm!("mov cr3, {0}", in(reg) pd.0 as u32, options(nostack, preserves_flags));
	}
}

fn invlpg(virt: VirtAddr) {
	unsafe {
		core::arch::asm!("invlpg [{0}]", in(reg) virt.0 as u32, options(nostack, preserves_flags));
	}
}

fn current_directory() -> PageDirectory {
	STATE.lock().current.expect("vmm::init must run before any mapping operation")
}

fn page_table(virt: VirtAddr, create: bool) -> Option<*mut Table> {
	let (pde_index, _, _) = virt.split();
	let pd = directory_table(current_directory());
	let pde = unsafe { &mut (*pd).0[pde_index] };
	if pde.is_present() {
		return Some(pde.address().0 as *mut Table);
	}
	if !create {
		return None;
	}
	let frame = pmm::alloc_page()?;
	let pt = Table::zeroed_at(frame);
	pde.set(frame, FLAG_PRESENT | FLAG_WRITE);
	Some(pt)
}

/// Maps `virt` to `phys` with `flags`, allocating a page table for the containing PDE if
/// one doesn't already exist. Mapping an already-mapped `virt` silently replaces the PTE.
pub fn map(virt: VirtAddr, phys: PhysAddr, flags: u32) -> bool {
	let Some(pt) = page_table(virt, true) else {
		return false;
	};
	let (_, pte_index, _) = virt.split();
	unsafe {
		(*pt).0[pte_index].set(phys, flags);
	}
	invlpg(virt);
	true
}

/// Clears the PTE for `virt` if mapped. A no-op otherwise.
pub fn unmap(virt: VirtAddr) {
	let Some(pt) = page_table(virt, false) else {
		return;
	};
	let (_, pte_index, _) = virt.split();
	unsafe {
		(*pt).0[pte_index] = Entry::empty();
	}
	invlpg(virt);
}

/// Maps `byte_size` (rounded up to whole pages) starting at `virt_base`/`phys_base`. On
/// any failure, unmaps everything already mapped by this call and returns `false`.
pub fn map_range(virt_base: VirtAddr, phys_base: PhysAddr, byte_size: usize, flags: u32) -> bool {
	let pages = byte_size.div_ceil(PAGE_SIZE);
	for i in 0..pages {
		let virt = virt_base + i * PAGE_SIZE;
		let phys = phys_base + i * PAGE_SIZE;
		if !map(virt, phys, flags) {
			for j in 0..i {
				unmap(virt_base + j * PAGE_SIZE);
			}
			return false;
		}
	}
	true
}

/// Allocates one physical page and maps it at `virt`. Frees the page back to the PMM if
/// the mapping step fails (out of page-table memory).
pub fn alloc_page_at(virt: VirtAddr, flags: u32) -> Option<PhysAddr> {
	let phys = pmm::alloc_page()?;
	if !map(virt, phys, flags) {
		pmm::free_page(phys);
		return None;
	}
	Some(phys)
}

/// Returns the physical address `virt` translates to, or `None` if unmapped.
pub fn translate(virt: VirtAddr) -> Option<PhysAddr> {
	let pt = page_table(virt, false)?;
	let (_, pte_index, offset) = virt.split();
	let pte = unsafe { (*pt).0[pte_index] };
	if !pte.is_present() {
		return None;
	}
	Some(pte.address() + offset)
}

pub fn is_mapped(virt: VirtAddr) -> bool {
	translate(virt).is_some()
}

/// Shallow-copies the current directory's PDEs (sharing page tables) into a freshly
/// allocated directory. The documented basis for a future per-task address space; there
/// is no code path that calls this today since every task shares the kernel directory.
pub fn clone_current() -> Option<PageDirectory> {
	let frame = pmm::alloc_page()?;
	let new_pd = Table::zeroed_at(frame);
	let current = directory_table(current_directory());
	unsafe {
		(*new_pd).0 = (*current).0;
	}
	Some(PageDirectory(frame))
}

/// Loads `pd` into CR3 and records it as the current directory.
pub fn switch_to(pd: PageDirectory) {
	STATE.lock().current = Some(pd);
	load_cr3(pd.0);
}

/// Bits of the page-fault error code (§6), decoded for [`crate::panic::fault`] and any
/// future demand-paging policy.
#[derive(Clone, Copy, Debug)]
pub struct PageFaultInfo {
	pub fault_addr: VirtAddr,
	pub present: bool,
	pub write: bool,
	pub user: bool,
	pub reserved: bool,
	pub instruction_fetch: bool,
}

/// Decodes a page-fault error code and the CR2 faulting address.
pub fn decode_page_fault(error_code: u32, fault_addr: VirtAddr) -> PageFaultInfo {
	PageFaultInfo {
		fault_addr,
		present: error_code & 0x1 != 0,
		write: error_code & 0x2 != 0,
		user: error_code & 0x4 != 0,
		reserved: error_code & 0x8 != 0,
		instruction_fetch: error_code & 0x10 != 0,
	}
}

/// Registered with the IDT at vector 14. There is no demand-paging or stack-growth
/// policy (§1 Non-goals), so every page fault is fatal.
pub fn page_fault_handler(frame: &crate::arch::x86::idt::InterruptFrame) {
	let cr2: u32;
	unsafe {
		core::arch::asm!("mov {0}, cr2", out(reg) cr2, options(nomem, nostack, preserves_flags));
	}
	let info = decode_page_fault(frame.err_code, VirtAddr(cr2 as usize));
	crate::println!(
		"page fault: addr={:#010x} present={} write={} user={} reserved={} fetch={}",
		info.fault_addr.0,
		info.present,
		info.write,
		info.user,
		info.reserved,
		info.instruction_fetch
	);
	crate::panic::fault(frame);
}

/// Installs [`page_fault_handler`] at vector 14.
pub fn register_page_fault_handler() {
	crate::arch::x86::idt::register_handler(14, page_fault_handler);
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn decode_page_fault_extracts_each_bit_independently() {
		let info = decode_page_fault(0x0, VirtAddr(0x80000000));
		assert!(!info.present && !info.write && !info.user && !info.reserved && !info.instruction_fetch);

		let info = decode_page_fault(0x1, VirtAddr(0));
		assert!(info.present);

		let info = decode_page_fault(0x2, VirtAddr(0));
		assert!(info.write && !info.present);

		let info = decode_page_fault(0x4, VirtAddr(0));
		assert!(info.user);

		let info = decode_page_fault(0x8, VirtAddr(0));
		assert!(info.reserved);

		let info = decode_page_fault(0x10, VirtAddr(0));
		assert!(info.instruction_fetch);
	}

	#[test]
	fn decode_page_fault_matches_boot_fault_example() {
		// supervisor write to an unmapped page, error_code bit1 set and nothing else
		let info = decode_page_fault(0x2, VirtAddr(0x80000000));
		assert_eq!(info.fault_addr.0, 0x80000000);
		assert!(!info.present);
		assert!(info.write);
		assert!(!info.user);
	}
}
