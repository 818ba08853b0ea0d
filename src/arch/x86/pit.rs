/*
 * This file is part of Kestrel. See the license notice in `src/kernel.rs`.
 */

//! The 8253/8254 Programmable Interval Timer, configured to fire IRQ0 at a fixed
//! frequency so [`crate::sched`] has a real preemption clock rather than polling a
//! wall-clock source.

use crate::arch::x86::io::outb;

const CHANNEL0_DATA: u16 = 0x40;
const COMMAND: u16 = 0x43;
/// Input clock frequency of the PIT crystal.
const BASE_FREQUENCY: u32 = 1_193_182;
/// Channel 0, access mode lobyte/hibyte, mode 3 (square wave), binary.
const COMMAND_CHANNEL0_SQUARE_WAVE: u8 = 0x36;

/// Programs channel 0 to fire at `frequency_hz`. IRQ0 delivery still needs unmasking at
/// the PIC and a handler registered at vector 32, both done by [`crate::sched::init`].
pub fn init(frequency_hz: u32) {
	let divisor = (BASE_FREQUENCY / frequency_hz.max(1)).clamp(1, 0xffff) as u16;
	unsafe {
		outb(COMMAND, COMMAND_CHANNEL0_SQUARE_WAVE);
		outb(CHANNEL0_DATA, (divisor & 0xff) as u8);
		outb(CHANNEL0_DATA, (divisor >> 8) as u8);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn divisor_for_1000hz_matches_known_value() {
		let divisor = BASE_FREQUENCY / 1000;
		assert_eq!(divisor, 1193);
	}
}
