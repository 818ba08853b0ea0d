/*
 * This file is part of Kestrel. See the license notice in `src/kernel.rs`.
 */

//! A minimal ATA/IDE PIO driver: drive detection via `IDENTIFY`, and LBA28 sector
//! read/write. No DMA, no LBA48, no ATAPI packet commands beyond detecting a CD-ROM's
//! signature — enough to read a boot disk.

use crate::{
	arch::x86::io::{inb, inw, outb, outw},
	block::{self, BlockDevice, BlockError, DeviceInfo, DeviceType},
};

const PRIMARY_IO: u16 = 0x1F0;
const PRIMARY_CTRL: u16 = 0x3F6;
const SECONDARY_IO: u16 = 0x170;
const SECONDARY_CTRL: u16 = 0x376;

const REG_SECCOUNT: u16 = 2;
const REG_LBA0: u16 = 3;
const REG_LBA1: u16 = 4;
const REG_LBA2: u16 = 5;
const REG_HDDEVSEL: u16 = 6;
const REG_COMMAND: u16 = 7;
const REG_STATUS: u16 = 7;
const REG_ALTSTATUS: u16 = 0;
const REG_DEVCTRL: u16 = 0;

const CMD_READ_PIO: u8 = 0x20;
const CMD_WRITE_PIO: u8 = 0x30;
const CMD_IDENTIFY: u8 = 0xEC;
const CMD_IDENTIFY_PACKET: u8 = 0xA1;
const CMD_CACHE_FLUSH: u8 = 0xE7;

const SR_BSY: u8 = 0x80;
const SR_DRQ: u8 = 0x08;
const SR_ERR: u8 = 0x01;

fn io_base(channel: u8) -> u16 {
	if channel == 0 {
		PRIMARY_IO
	} else {
		SECONDARY_IO
	}
}

fn ctrl_base(channel: u8) -> u16 {
	if channel == 0 {
		PRIMARY_CTRL
	} else {
		SECONDARY_CTRL
	}
}

/// Reads the alternate status register four times, the classic ATA way to burn ~400ns
/// after a drive/command change before the status register is trustworthy.
fn delay_400ns(channel: u8) {
	let ctrl = ctrl_base(channel);
	for _ in 0..4 {
		unsafe {
			inb(ctrl + REG_ALTSTATUS);
		}
	}
}

fn soft_reset(channel: u8) {
	let ctrl = ctrl_base(channel);
	unsafe {
		outb(ctrl + REG_DEVCTRL, 0x04);
	}
	delay_400ns(channel);
	unsafe {
		outb(ctrl + REG_DEVCTRL, 0x00);
	}
	delay_400ns(channel);
	wait_ready(channel, 2_000_000);
}

fn select_drive(channel: u8, drive: u8, lba: u32, lba_mode: bool) {
	let io = io_base(channel);
	let head = if lba_mode { (lba >> 24) & 0x0F } else { 0 };
	let select = 0xA0 | (drive << 4) | (if lba_mode { 0x40 } else { 0 }) | head as u8;
	unsafe {
		outb(io + REG_HDDEVSEL, select);
	}
	delay_400ns(channel);
}

/// Polls the status register until `BSY` clears or `spins` iterations pass. `spins` is a
/// raw iteration count rather than a calibrated timeout, same as the reference driver.
fn wait_ready(channel: u8, spins: u32) -> bool {
	let io = io_base(channel);
	for _ in 0..spins {
		let status = unsafe { inb(io + REG_STATUS) };
		if status & SR_BSY == 0 {
			return true;
		}
	}
	false
}

fn wait_drq(channel: u8, spins: u32) -> bool {
	let io = io_base(channel);
	for _ in 0..spins {
		let status = unsafe { inb(io + REG_STATUS) };
		if status & (SR_ERR) != 0 {
			return false;
		}
		if status & SR_BSY == 0 && status & SR_DRQ != 0 {
			return true;
		}
	}
	false
}

fn insw(port: u16, buf: &mut [u16]) {
	for word in buf.iter_mut() {
		*word = unsafe { inw(port) };
	}
}

fn outsw(port: u16, buf: &[u16]) {
	for &word in buf {
		unsafe {
			outw(port, word);
		}
	}
}

struct IdentifyResult {
	is_atapi: bool,
	supports_lba: bool,
	size_sectors: u32,
	model: [u8; 41],
}

fn identify(channel: u8, drive: u8) -> Option<IdentifyResult> {
	let io = io_base(channel);

	select_drive(channel, drive, 0, false);
	unsafe {
		outb(io + REG_SECCOUNT, 0);
		outb(io + REG_LBA0, 0);
		outb(io + REG_LBA1, 0);
		outb(io + REG_LBA2, 0);
		outb(io + REG_COMMAND, CMD_IDENTIFY);
	}
	delay_400ns(channel);

	if unsafe { inb(io + REG_STATUS) } == 0 {
		return None;
	}
	if !wait_ready(channel, 1_000_000) {
		return None;
	}

	let lba1 = unsafe { inb(io + REG_LBA1) };
	let lba2 = unsafe { inb(io + REG_LBA2) };
	let is_atapi = (lba1 == 0x14 && lba2 == 0xEB) || (lba1 == 0x69 && lba2 == 0x96);
	if !is_atapi && (lba1 != 0 || lba2 != 0) {
		return None;
	}
	if is_atapi {
		unsafe {
			outb(io + REG_COMMAND, CMD_IDENTIFY_PACKET);
		}
		delay_400ns(channel);
	}

	if !wait_drq(channel, 1_000_000) {
		return None;
	}

	let mut data = [0u16; 256];
	insw(io, &mut data);

	let supports_lba = data[49] & (1 << 9) != 0;
	let size_sectors = if supports_lba {
		data[60] as u32 | ((data[61] as u32) << 16)
	} else {
		data[1] as u32 * data[3] as u32 * data[6] as u32
	};

	let mut model = [0u8; 41];
	for i in 0..20 {
		model[i * 2] = (data[27 + i] >> 8) as u8;
		model[i * 2 + 1] = (data[27 + i] & 0xFF) as u8;
	}
	let mut end = 40;
	while end > 0 && (model[end - 1] == b' ' || model[end - 1] == 0) {
		end -= 1;
	}
	for b in &mut model[end..] {
		*b = 0;
	}

	Some(IdentifyResult {
		is_atapi,
		supports_lba,
		size_sectors,
		model,
	})
}

/// A single detected ATA/ATAPI drive, registered with [`crate::block`] as a
/// [`BlockDevice`].
pub struct AtaDrive {
	info: DeviceInfo,
	channel: u8,
	drive: u8,
	supports_lba: bool,
	size_sectors: u32,
}

impl BlockDevice for AtaDrive {
	fn info(&self) -> &DeviceInfo {
		&self.info
	}

	fn info_mut(&mut self) -> &mut DeviceInfo {
		&mut self.info
	}

	fn sector_count(&self) -> u64 {
		self.size_sectors as u64
	}

	fn read_sectors(&mut self, lba: u64, count: u32, buf: &mut [u8]) -> Result<(), BlockError> {
		if lba + count as u64 > self.size_sectors as u64 {
			return Err(BlockError::OutOfRange);
		}
		if !self.supports_lba {
			return Err(BlockError::Io);
		}
		let io = io_base(self.channel);
		select_drive(self.channel, self.drive, lba as u32, true);
		if !wait_ready(self.channel, 1_000_000) {
			return Err(BlockError::Io);
		}
		unsafe {
			outb(io + REG_SECCOUNT, count as u8);
			outb(io + REG_LBA0, (lba & 0xFF) as u8);
			outb(io + REG_LBA1, ((lba >> 8) & 0xFF) as u8);
			outb(io + REG_LBA2, ((lba >> 16) & 0xFF) as u8);
			outb(io + REG_HDDEVSEL, 0xE0 | (self.drive << 4) | (((lba >> 24) & 0x0F) as u8));
			outb(io + REG_COMMAND, CMD_READ_PIO);
		}
		for chunk in buf.chunks_mut(512).take(count as usize) {
			if !wait_drq(self.channel, 1_000_000) {
				return Err(BlockError::Io);
			}
			let mut words = [0u16; 256];
			insw(io, &mut words);
			for (dst, word) in chunk.chunks_mut(2).zip(words.iter()) {
				dst[0] = (*word & 0xFF) as u8;
				if dst.len() > 1 {
					dst[1] = (*word >> 8) as u8;
				}
			}
			delay_400ns(self.channel);
		}
		Ok(())
	}

	fn write_sectors(&mut self, lba: u64, count: u32, buf: &[u8]) -> Result<(), BlockError> {
		if lba + count as u64 > self.size_sectors as u64 {
			return Err(BlockError::OutOfRange);
		}
		if !self.supports_lba {
			return Err(BlockError::Io);
		}
		let io = io_base(self.channel);
		select_drive(self.channel, self.drive, lba as u32, true);
		if !wait_ready(self.channel, 1_000_000) {
			return Err(BlockError::Io);
		}
		unsafe {
			outb(io + REG_SECCOUNT, count as u8);
			outb(io + REG_LBA0, (lba & 0xFF) as u8);
			outb(io + REG_LBA1, ((lba >> 8) & 0xFF) as u8);
			outb(io + REG_LBA2, ((lba >> 16) & 0xFF) as u8);
			outb(io + REG_HDDEVSEL, 0xE0 | (self.drive << 4) | (((lba >> 24) & 0x0F) as u8));
			outb(io + REG_COMMAND, CMD_WRITE_PIO);
		}
		for chunk in buf.chunks(512).take(count as usize) {
			if !wait_drq(self.channel, 1_000_000) {
				return Err(BlockError::Io);
			}
			let mut words = [0u16; 256];
			for (word, src) in words.iter_mut().zip(chunk.chunks(2)) {
				*word = src[0] as u16 | (*src.get(1).unwrap_or(&0) as u16) << 8;
			}
			outsw(io, &words);
			delay_400ns(self.channel);
		}
		unsafe {
			outb(io + REG_COMMAND, CMD_CACHE_FLUSH);
		}
		wait_ready(self.channel, 5_000_000);
		Ok(())
	}

	fn flush(&mut self) -> Result<(), BlockError> {
		let io = io_base(self.channel);
		unsafe {
			outb(io + REG_COMMAND, CMD_CACHE_FLUSH);
		}
		if wait_ready(self.channel, 5_000_000) {
			Ok(())
		} else {
			Err(BlockError::Io)
		}
	}
}

/// Probes both ATA channels, both drive slots each, and registers every responding drive
/// with [`crate::block`].
pub fn init() {
	for channel in 0..2u8 {
		soft_reset(channel);
		for drive in 0..2u8 {
			let Some(result) = identify(channel, drive) else {
				continue;
			};
			let device_type = if result.is_atapi {
				DeviceType::AtapiCdrom
			} else {
				DeviceType::AtaHdd
			};
			let model = core::str::from_utf8(&result.model)
				.unwrap_or("")
				.trim_end_matches('\0');
			let info = DeviceInfo::new(device_type).with_model(model);
			let drive_handle = AtaDrive {
				info,
				channel,
				drive,
				supports_lba: result.supports_lba,
				size_sectors: result.size_sectors,
			};
			block::register_device(alloc::boxed::Box::new(drive_handle));
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn read_sectors_rejects_out_of_range_request() {
		let mut drive = AtaDrive {
			info: DeviceInfo::new(DeviceType::AtaHdd),
			channel: 0,
			drive: 0,
			supports_lba: true,
			size_sectors: 100,
		};
		let mut buf = [0u8; 512];
		assert_eq!(drive.read_sectors(99, 2, &mut buf), Err(BlockError::OutOfRange));
	}

	#[test]
	fn write_sectors_rejects_when_lba_unsupported() {
		let mut drive = AtaDrive {
			info: DeviceInfo::new(DeviceType::AtaHdd),
			channel: 0,
			drive: 0,
			supports_lba: false,
			size_sectors: 100,
		};
		let buf = [0u8; 512];
		assert_eq!(drive.write_sectors(0, 1, &buf), Err(BlockError::Io));
	}
}
