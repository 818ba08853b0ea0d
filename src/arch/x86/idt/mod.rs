/*
 * This file is part of Kestrel. See the license notice in `src/kernel.rs`.
 */

//! The IDT (Interrupt Descriptor Table) maps each of the 256 interrupt vectors to a gate
//! pointing at one of the uniform stubs in `isr_stubs.s`. Those stubs push a common
//! [`InterruptFrame`] and call [`dispatch`], which looks the vector up in a table of
//! Rust handlers installed with [`register_handler`].

pub mod pic;

use core::mem::size_of;

use crate::{arch::x86::gdt, println, sync::IntSpin};

/// The register/flags layout every `isr_stubs.s` entry pushes before calling into Rust.
/// Field order matches memory order low-to-high, i.e. the reverse of assembly push order
/// (the last field is the first thing the CPU pushed automatically). Every interrupt in
/// this kernel is taken at ring 0, and the CPU only pushes `useresp`/`ss` on a privilege
/// level change, which never happens here (no user-mode tasks) — those two fields read
/// whatever already sits below `eflags` on the interrupted task's own stack. They are
/// kept for layout fidelity with the external frame shape, not because they carry
/// meaningful data in this build. Must stay in lockstep with the assembly.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct InterruptFrame {
	pub edi: u32,
	pub esi: u32,
	pub ebp: u32,
	pub esp_dummy: u32,
	pub ebx: u32,
	pub edx: u32,
	pub ecx: u32,
	pub eax: u32,
	pub int_no: u32,
	pub err_code: u32,
	pub eip: u32,
	pub cs: u32,
	pub eflags: u32,
	pub useresp: u32,
	pub ss: u32,
}

/// A Rust-side interrupt handler.
pub type Handler = fn(&InterruptFrame);

const ENTRIES_COUNT: usize = 256;
/// First vector carrying a remapped hardware IRQ.
const IRQ_BASE: u8 = pic::IRQ_BASE;
const IRQ_COUNT: u8 = 16;

static HANDLERS: IntSpin<[Option<Handler>; ENTRIES_COUNT]> = IntSpin::new([None; ENTRIES_COUNT]);

/// CPU exception names, indexed by vector. Used by the default handler and by the panic
/// path to describe an unhandled fault.
pub static EXCEPTION_NAMES: &[&str] = &[
	"Divide-by-zero Error",
	"Debug",
	"Non-maskable Interrupt",
	"Breakpoint",
	"Overflow",
	"Bound Range Exceeded",
	"Invalid Opcode",
	"Device Not Available",
	"Double Fault",
	"Coprocessor Segment Overrun",
	"Invalid TSS",
	"Segment Not Present",
	"Stack-Segment Fault",
	"General Protection Fault",
	"Page Fault",
	"Unknown",
	"x87 Floating-Point Exception",
	"Alignment Check",
	"Machine Check",
	"SIMD Floating-Point Exception",
	"Virtualization Exception",
	"Unknown",
	"Unknown",
	"Unknown",
	"Unknown",
	"Unknown",
	"Unknown",
	"Unknown",
	"Unknown",
	"Unknown",
	"Unknown",
	"Unknown",
];

/// Installs `handler` for `vector`, replacing whatever was previously registered.
pub fn register_handler(vector: u8, handler: Handler) {
	HANDLERS.lock()[vector as usize] = Some(handler);
}

/// Removes the handler registered for `vector`, if any.
pub fn unregister_handler(vector: u8) {
	HANDLERS.lock()[vector as usize] = None;
}

/// Entry point called from every `isr_stubs.s` stub, after it has pushed the common
/// frame and before it restores registers and `iret`s.
///
/// Exceptions (vector < 32) with no registered handler panic: there is no safe way to
/// resume after, say, an unhandled general protection fault. Unhandled hardware IRQs are
/// acknowledged and logged, since masking them permanently would wedge the device.
#[no_mangle]
extern "C" fn isr_dispatch(frame: &InterruptFrame) {
	let vector = frame.int_no as u8;
	let handler = HANDLERS.lock()[vector as usize];
	match handler {
		Some(handler) => handler(frame),
		None if vector < 32 => crate::panic::fault(frame),
		None => {
			println!("kestrel: unhandled interrupt vector {}", vector);
		}
	}
	if (IRQ_BASE..IRQ_BASE + IRQ_COUNT).contains(&vector) {
		pic::end_of_interrupt(vector - IRQ_BASE);
	}
}

#[repr(C, packed)]
struct Descriptor {
	offset_low: u16,
	selector: u16,
	zero: u8,
	type_attr: u8,
	offset_high: u16,
}

impl Descriptor {
	const fn missing() -> Self {
		Self {
			offset_low: 0,
			selector: 0,
			zero: 0,
			type_attr: 0,
			offset_high: 0,
		}
	}

	fn new(handler: unsafe extern "C" fn(), selector: u16, type_attr: u8) -> Self {
		let addr = handler as usize as u32;
		Self {
			offset_low: (addr & 0xffff) as u16,
			selector,
			zero: 0,
			type_attr,
			offset_high: ((addr >> 16) & 0xffff) as u16,
		}
	}
}

/// Present, ring 0, 32-bit interrupt gate (clears IF on entry).
const GATE_INTERRUPT_32: u8 = 0x8e;

#[repr(C, packed)]
struct DescriptorTablePointer {
	limit: u16,
	base: u32,
}

static mut IDT: [Descriptor; ENTRIES_COUNT] = [const { Descriptor::missing() }; ENTRIES_COUNT];

extern "C" {
	fn isr0();
	fn isr1();
	fn isr2();
	fn isr3();
	fn isr4();
	fn isr5();
	fn isr6();
	fn isr7();
	fn isr8();
	fn isr9();
	fn isr10();
	fn isr11();
	fn isr12();
	fn isr13();
	fn isr14();
	fn isr15();
	fn isr16();
	fn isr17();
	fn isr18();
	fn isr19();
	fn isr20();
	fn isr21();
	fn isr22();
	fn isr23();
	fn isr24();
	fn isr25();
	fn isr26();
	fn isr27();
	fn isr28();
	fn isr29();
	fn isr30();
	fn isr31();
	fn irq0();
	fn irq1();
	fn irq2();
	fn irq3();
	fn irq4();
	fn irq5();
	fn irq6();
	fn irq7();
	fn irq8();
	fn irq9();
	fn irq10();
	fn irq11();
	fn irq12();
	fn irq13();
	fn irq14();
	fn irq15();
}

macro_rules! stub_table {
	($($f:expr),* $(,)?) => { [$($f as unsafe extern "C" fn()),*] };
}

/// Installs the IDT, remaps the PIC to vectors 32-47, and loads the IDT register.
///
/// Interrupts remain disabled on return; the caller enables them once the rest of early
/// boot (paging, the heap, the scheduler) is ready.
pub fn init() {
	const STUB_COUNT: usize = if ENTRIES_COUNT < 48 { ENTRIES_COUNT } else { 48 };
	let stubs: [unsafe extern "C" fn(); STUB_COUNT] = stub_table![
		isr0, isr1, isr2, isr3, isr4, isr5, isr6, isr7, isr8, isr9, isr10, isr11, isr12,
		isr13, isr14, isr15, isr16, isr17, isr18, isr19, isr20, isr21, isr22, isr23, isr24,
		isr25, isr26, isr27, isr28, isr29, isr30, isr31, irq0, irq1, irq2, irq3, irq4, irq5,
		irq6, irq7, irq8, irq9, irq10, irq11, irq12, irq13, irq14, irq15,
	];
	unsafe {
		let idt = &raw mut IDT;
		for (i, stub) in stubs.into_iter().enumerate() {
			(*idt)[i] = Descriptor::new(stub, gdt::KERNEL_CS, GATE_INTERRUPT_32);
		}
	}

	pic::remap(IRQ_BASE, IRQ_BASE + 8);

	let pointer = DescriptorTablePointer {
		limit: (size_of::<[Descriptor; ENTRIES_COUNT]>() - 1) as u16,
		base: &raw const IDT as u32,
	};
	unsafe {
		core::arch::asm!("lidt [{0}]", in(reg) &pointer, options(readonly, nostack, preserves_flags));
	}
}
