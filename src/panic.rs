/*
 * This file is part of Kestrel. See the license notice in `src/kernel.rs`.
 */

//! Kernel panic handling.
//!
//! A panic is an error the kernel has no way to recover from: a violated invariant, a
//! CPU exception nobody registered a handler for. There is nothing left to do but stop
//! the machine in a state a developer can inspect, which is why this prints everything
//! it has before halting rather than trying to unwind.

use core::{
	panic::{Location, PanicInfo},
	sync::atomic::{AtomicBool, Ordering},
};

use crate::{arch::x86::idt::InterruptFrame, logger::LOGGER, println};

static PANICKING: AtomicBool = AtomicBool::new(false);

fn panic_impl(msg: impl core::fmt::Display, loc: Option<&Location>, frame: Option<&InterruptFrame>) -> ! {
	crate::arch::x86::io::cli();
	// A panic raised while already printing a panic (e.g. the logger itself is broken)
	// would recurse forever; give up immediately instead.
	if PANICKING.swap(true, Ordering::SeqCst) {
		loop {
			crate::arch::x86::io::halt();
		}
	}
	LOGGER.lock().silent = false;

	println!("-- KERNEL PANIC! --");
	if let Some(loc) = loc {
		println!("Reason: {msg} Location: {loc}");
	} else {
		println!("Reason: {msg}");
	}
	if let Some(frame) = frame {
		println!(
			"vector={} error_code={:#x} eip={:#010x} cs={:#x} eflags={:#010x}",
			frame.int_no, frame.err_code, frame.eip, frame.cs, frame.eflags
		);
		println!(
			"eax={:#010x} ebx={:#010x} ecx={:#010x} edx={:#010x}",
			frame.eax, frame.ebx, frame.ecx, frame.edx
		);
		println!(
			"esi={:#010x} edi={:#010x} ebp={:#010x}",
			frame.esi, frame.edi, frame.ebp
		);
	}
	println!("-- end trace --");
	loop {
		crate::arch::x86::io::halt();
	}
}

#[cfg(not(test))]
#[panic_handler]
fn panic(panic_info: &PanicInfo) -> ! {
	panic_impl(panic_info.message(), panic_info.location(), None);
}

/// Called by [`crate::arch::x86::idt::isr_dispatch`] for a CPU exception (vector < 32)
/// with no registered handler. There is no generic way to resume after an unhandled
/// fault, so this never returns.
pub fn fault(frame: &InterruptFrame) -> ! {
	let name = crate::arch::x86::idt::EXCEPTION_NAMES
		.get(frame.int_no as usize)
		.copied()
		.unwrap_or("Unknown");
	panic_impl(name, None, Some(frame));
}
