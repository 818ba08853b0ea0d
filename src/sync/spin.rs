/*
 * This file is part of Kestrel. See the license notice in `src/kernel.rs`.
 */

//! A mutex that never actually spins.
//!
//! On a single core, a lock held by task code can only ever be contended by an interrupt
//! handler running on top of it, never by another thread running in parallel. So instead
//! of busy-waiting, `Spin` with `INT = false` simply disables interrupts for the lifetime
//! of the guard, which is both sufficient and strictly cheaper than a real spinlock.

use core::{
	cell::UnsafeCell,
	ops::{Deref, DerefMut},
	sync::atomic::{AtomicBool, Ordering},
};

use crate::arch::x86::io;

/// A lock around `T`.
///
/// When `INT` is `false` (see [`IntSpin`]), acquiring the lock disables interrupts; the
/// previous interrupt-enable state is restored when the guard is dropped. This is the
/// primitive every structure shared between task context and interrupt handlers (the PMM
/// bitmap, the scheduler's task table, the event queue, the VFS fd table) is built on.
pub struct Spin<T: ?Sized, const INT: bool = true> {
	locked: AtomicBool,
	value: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send, const INT: bool> Sync for Spin<T, INT> {}

impl<T, const INT: bool> Spin<T, INT> {
	pub const fn new(value: T) -> Self {
		Self {
			locked: AtomicBool::new(false),
			value: UnsafeCell::new(value),
		}
	}
}

impl<T: ?Sized, const INT: bool> Spin<T, INT> {
	/// Acquires the lock, blocking until available.
	///
	/// On a single core this only ever blocks transiently: either no one else holds the
	/// lock, or `INT = false` and interrupts are already disabled, meaning whoever holds
	/// it is the very code calling `lock` (a bug, not contention).
	pub fn lock(&self) -> SpinGuard<'_, T, INT> {
		let restore_interrupts = if !INT {
			let was_enabled = io::is_interrupt_enabled();
			io::cli();
			was_enabled
		} else {
			false
		};
		while self
			.locked
			.compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
			.is_err()
		{
			core::hint::spin_loop();
		}
		SpinGuard {
			lock: self,
			restore_interrupts,
		}
	}

	/// Releases a held lock without going through a guard's `Drop`, for code that resumes
	/// on a different stack than the one that called [`lock`](Self::lock) - a freshly
	/// context-switched-to task finishing what the scheduler's `schedule()` call started
	/// on its behalf. Always restores interrupts when `INT` is `false`, since the new
	/// stack has no record of whether they were enabled before the lock was taken and
	/// should simply run with them on.
	///
	/// # Safety
	///
	/// The caller must ensure the lock is actually held and that exactly one such call (or
	/// one guard drop, never both) retires it.
	pub unsafe fn force_unlock(&self) {
		self.locked.store(false, Ordering::Release);
		if !INT {
			io::sti();
		}
	}

	/// Attempts to acquire the lock without blocking.
	pub fn try_lock(&self) -> Option<SpinGuard<'_, T, INT>> {
		let restore_interrupts = if !INT {
			let was_enabled = io::is_interrupt_enabled();
			io::cli();
			was_enabled
		} else {
			false
		};
		if self
			.locked
			.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
			.is_ok()
		{
			Some(SpinGuard {
				lock: self,
				restore_interrupts,
			})
		} else {
			if restore_interrupts {
				io::sti();
			}
			None
		}
	}
}

/// RAII guard returned by [`Spin::lock`]. Not `Send`: releasing a lock on a different
/// task than the one that took it would restore the wrong interrupt state.
pub struct SpinGuard<'a, T: ?Sized, const INT: bool> {
	lock: &'a Spin<T, INT>,
	restore_interrupts: bool,
}

impl<'a, T: ?Sized, const INT: bool> !Send for SpinGuard<'a, T, INT> {}

impl<'a, T: ?Sized, const INT: bool> Deref for SpinGuard<'a, T, INT> {
	type Target = T;

	fn deref(&self) -> &T {
		unsafe { &*self.lock.value.get() }
	}
}

impl<'a, T: ?Sized, const INT: bool> DerefMut for SpinGuard<'a, T, INT> {
	fn deref_mut(&mut self) -> &mut T {
		unsafe { &mut *self.lock.value.get() }
	}
}

impl<'a, T: ?Sized, const INT: bool> Drop for SpinGuard<'a, T, INT> {
	fn drop(&mut self) {
		self.lock.locked.store(false, Ordering::Release);
		if self.restore_interrupts {
			io::sti();
		}
	}
}

/// A [`Spin`] that disables interrupts while held. The default choice for state touched
/// by interrupt handlers.
pub type IntSpin<T> = Spin<T, false>;

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn basic_lock_unlock() {
		let s: Spin<u32, true> = Spin::new(0);
		*s.lock() = 42;
		assert_eq!(*s.lock(), 42);
	}

	#[test]
	fn try_lock_fails_while_held() {
		let s: Spin<u32, true> = Spin::new(0);
		let guard = s.lock();
		assert!(s.try_lock().is_none());
		drop(guard);
		assert!(s.try_lock().is_some());
	}
}
