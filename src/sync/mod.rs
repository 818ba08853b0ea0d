//! Synchronization primitives for a single-core, preemptible kernel.
//!
//! There is no multiprocessor support, so the only source of concurrent access to shared
//! state is an interrupt handler running in the middle of task code that holds the same
//! lock. [`spin::Spin`] solves that by disabling interrupts for the duration of the
//! critical section rather than by spinning against another core.

pub mod spin;

pub use spin::{IntSpin, Spin};
