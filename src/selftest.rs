/*
 * This file is part of Kestrel. See the license notice in `src/kernel.rs`.
 */

//! In-kernel self tests.
//!
//! The host-side `#[cfg(test)]` suite exercises every piece of hardware-independent
//! logic (the bitmap allocator, the free-list heap, FAT32 layout math, scheduler
//! bookkeeping) outside the kernel entirely, but a handful of things - the fact that
//! paging is actually enabled, that a page fault actually reaches the VMM handler, that a
//! freshly created task actually runs - can only be checked by booting the real image.
//! This module is that runner.
//!
//! # Issues
//!
//! The kernel cannot reset itself between tests, so a test that corrupts shared state
//! could make a later test pass for the wrong reason. Keep each test's footprint small
//! and prefer asserting on freshly allocated resources over globally shared ones.

use core::{
	any::type_name,
	sync::atomic::{AtomicBool, Ordering},
};

static RUNNING: AtomicBool = AtomicBool::new(false);

/// Anything runnable as a self test. Blanket-implemented for any zero-argument function,
/// so a test is just a `fn()` named after what it checks.
pub trait Testable {
	fn run(&self);
}

impl<T: Fn()> Testable for T {
	fn run(&self) {
		let name = type_name::<T>();
		crate::print!("test {name} ... ");
		self();
		crate::println!("ok");
	}
}

/// Runs every test in `tests` in order, then halts.
pub fn runner(tests: &[&dyn Testable]) -> ! {
	crate::println!("running {} self tests", tests.len());
	RUNNING.store(true, Ordering::Relaxed);
	for test in tests {
		test.run();
	}
	RUNNING.store(false, Ordering::Relaxed);
	crate::println!("no more tests to run");
	loop {
		crate::arch::x86::io::halt();
	}
}

/// Whether self tests are currently running. Used by subsystems that want to skip
/// expensive diagnostics (e.g. a device probe retry loop) while under test.
pub fn is_running() -> bool {
	RUNNING.load(Ordering::Relaxed)
}
