/*
 * This file is part of Kestrel. See the license notice in `src/kernel.rs`.
 */

//! The block device registry: a uniform interface over whatever physical or virtual
//! medium backs a filesystem, with canonical names assigned by device class on
//! registration (`hda`, `sda`, `cd0`, `rd0`; partitions name themselves before
//! registering, e.g. `hda1`).

pub mod ata;
pub mod partition;
pub mod ramdisk;

use alloc::{boxed::Box, vec::Vec};
use core::fmt;

use crate::sync::IntSpin;

/// Upper bound on registered devices, whole-disk and partition alike.
pub const MAX_DEVICES: usize = 32;

const NAME_LEN: usize = 8;
const MODEL_LEN: usize = 41;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceType {
	AtaHdd,
	AtaSsd,
	AhciHdd,
	AhciSsd,
	Nvme,
	UsbMass,
	AtapiCdrom,
	RamDisk,
	Floppy,
	Partition,
}

/// An error from a block device operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockError {
	/// The requested LBA range extends past the device's declared sector count.
	OutOfRange,
	/// The underlying medium reported a failure.
	Io,
}

/// Identity and capacity of a registered device. Fixed-size name/model fields rather
/// than heap strings, the same texture as [`crate::sched`]'s task names.
#[derive(Clone, Copy)]
pub struct DeviceInfo {
	pub device_type: DeviceType,
	name: [u8; NAME_LEN],
	model: [u8; MODEL_LEN],
}

impl DeviceInfo {
	pub fn new(device_type: DeviceType) -> Self {
		Self {
			device_type,
			name: [0; NAME_LEN],
			model: [0; MODEL_LEN],
		}
	}

	pub fn with_model(mut self, model: &str) -> Self {
		write_cstr(&mut self.model, model);
		self
	}

	pub fn name(&self) -> &str {
		read_cstr(&self.name)
	}

	pub fn model(&self) -> &str {
		read_cstr(&self.model)
	}

	pub(crate) fn set_name(&mut self, name: &str) {
		write_cstr(&mut self.name, name);
	}
}

impl fmt::Debug for DeviceInfo {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("DeviceInfo")
			.field("device_type", &self.device_type)
			.field("name", &self.name())
			.field("model", &self.model())
			.finish()
	}
}

fn write_cstr(slot: &mut [u8], s: &str) {
	let bytes = s.as_bytes();
	let len = bytes.len().min(slot.len() - 1);
	slot[..len].copy_from_slice(&bytes[..len]);
	for b in &mut slot[len..] {
		*b = 0;
	}
}

fn read_cstr(slot: &[u8]) -> &str {
	let len = slot.iter().position(|&b| b == 0).unwrap_or(slot.len());
	core::str::from_utf8(&slot[..len]).unwrap_or("")
}

/// A polymorphic handle over a storage medium: a whole ATA disk, a partition forwarding
/// to its parent with an LBA offset, or a RAM disk.
pub trait BlockDevice: Send {
	fn info(&self) -> &DeviceInfo;
	fn info_mut(&mut self) -> &mut DeviceInfo;

	fn sector_size(&self) -> u32 {
		512
	}

	fn sector_count(&self) -> u64;

	fn read_sectors(&mut self, lba: u64, count: u32, buf: &mut [u8]) -> Result<(), BlockError>;
	fn write_sectors(&mut self, lba: u64, count: u32, buf: &[u8]) -> Result<(), BlockError>;

	fn flush(&mut self) -> Result<(), BlockError> {
		Ok(())
	}

	fn size_mb(&self) -> u64 {
		(self.sector_count() * self.sector_size() as u64) / (1024 * 1024)
	}
}

struct Registry {
	/// A `None` slot is a removed device; indices of the devices around it must stay
	/// stable, since [`partition::PartitionDevice`] and the FAT32 driver hold onto a
	/// device's index for as long as they use it.
	devices: Vec<Option<Box<dyn BlockDevice>>>,
	hd_count: u8,
	sd_count: u8,
	cd_count: u8,
	rd_count: u8,
	fd_count: u8,
}

impl Registry {
	const fn new() -> Self {
		Self {
			devices: Vec::new(),
			hd_count: 0,
			sd_count: 0,
			cd_count: 0,
			rd_count: 0,
			fd_count: 0,
		}
	}

	/// Assigns the next name in a device-class's counter sequence. Partitions are expected
	/// to already carry a name (see [`partition`]) and never reach the default arm below.
	fn generate_name(&mut self, device_type: DeviceType) -> ([u8; 4], usize) {
		let mut buf = [0u8; 4];
		match device_type {
			DeviceType::AtaHdd | DeviceType::AtaSsd => {
				buf[0] = b'h';
				buf[1] = b'd';
				buf[2] = b'a' + self.hd_count;
				self.hd_count += 1;
				(buf, 3)
			}
			DeviceType::AhciHdd | DeviceType::AhciSsd | DeviceType::Nvme | DeviceType::UsbMass => {
				buf[0] = b's';
				buf[1] = b'd';
				buf[2] = b'a' + self.sd_count;
				self.sd_count += 1;
				(buf, 3)
			}
			DeviceType::AtapiCdrom => {
				buf[0] = b'c';
				buf[1] = b'd';
				buf[2] = b'0' + self.cd_count;
				self.cd_count += 1;
				(buf, 3)
			}
			DeviceType::RamDisk => {
				buf[0] = b'r';
				buf[1] = b'd';
				buf[2] = b'0' + self.rd_count;
				self.rd_count += 1;
				(buf, 3)
			}
			DeviceType::Floppy => {
				buf[0] = b'f';
				buf[1] = b'd';
				buf[2] = b'0' + self.fd_count;
				self.fd_count += 1;
				(buf, 3)
			}
			DeviceType::Partition => (*b"part", 4),
		}
	}
}

static DEVICES: IntSpin<Registry> = IntSpin::new(Registry::new());

/// Resets the registry, probes for ATA/ATAPI drives, and scans every whole disk found for
/// a partition table. After this call, `fs::vfs::init` can look for a FAT32 partition to
/// mount as root.
pub fn init() {
	{
		let mut registry = DEVICES.lock();
		*registry = Registry::new();
	}

	ata::init();

	let mut index = 0;
	while index < device_count() {
		let is_whole_disk = with_device(index, |d| d.info().device_type != DeviceType::Partition)
			.unwrap_or(false);
		if is_whole_disk {
			partition::scan_device(index);
		}
		index += 1;
	}
}

/// Registers `device`, naming it by class if it doesn't already carry a name (set by
/// [`partition::scan_device`] before registering a partition). Returns the device's index
/// in the registry, or `None` if [`MAX_DEVICES`] is already reached.
pub fn register_device(mut device: Box<dyn BlockDevice>) -> Option<usize> {
	let mut registry = DEVICES.lock();
	if registry.devices.len() >= MAX_DEVICES {
		return None;
	}
	if device.info().name().is_empty() {
		let (buf, len) = registry.generate_name(device.info().device_type);
		let name = core::str::from_utf8(&buf[..len]).unwrap_or("dev");
		device.info_mut().set_name(name);
	}
	crate::println!(
		"block: registered /dev/{} ({} MB)",
		device.info().name(),
		device.size_mb()
	);
	registry.devices.push(Some(device));
	Some(registry.devices.len() - 1)
}

/// Removes the device named `name`, leaving its slot empty rather than shifting later
/// devices down, so an index into the registry taken before this call (e.g. a mounted
/// FAT32 driver's `device_index`, or a [`partition::PartitionDevice`]'s parent index)
/// stays valid and keeps pointing at whatever device still occupies it. Returns `false`
/// if no such device is registered.
pub fn unregister_device(name: &str) -> bool {
	let mut registry = DEVICES.lock();
	let slot = registry.devices.iter_mut().find(|d| d.as_ref().is_some_and(|d| d.info().name() == name));
	match slot {
		Some(slot) => {
			*slot = None;
			true
		}
		None => false,
	}
}

/// Upper bound on valid device indices; includes removed slots, so callers iterating
/// `0..device_count()` must still check [`with_device`]'s result.
pub fn device_count() -> usize {
	DEVICES.lock().devices.len()
}

/// Runs `f` against the registered device at `index`, or returns `None` if out of range
/// or if that slot was removed. The registry stays locked for the duration of `f`;
/// callers must not try to look up a second device from inside it.
pub fn with_device<R>(index: usize, f: impl FnOnce(&mut dyn BlockDevice) -> R) -> Option<R> {
	let mut registry = DEVICES.lock();
	registry.devices.get_mut(index)?.as_mut().map(|d| f(d.as_mut()))
}

pub fn with_device_by_name<R>(name: &str, f: impl FnOnce(&mut dyn BlockDevice) -> R) -> Option<R> {
	let mut registry = DEVICES.lock();
	let index = registry.devices.iter().position(|d| d.as_ref().is_some_and(|d| d.info().name() == name))?;
	Some(f(registry.devices[index].as_mut()?.as_mut()))
}

pub fn find_first_hdd() -> Option<usize> {
	let registry = DEVICES.lock();
	registry.devices.iter().position(|d| {
		d.as_ref().is_some_and(|d| {
			matches!(
				d.info().device_type,
				DeviceType::AtaHdd | DeviceType::AtaSsd | DeviceType::AhciHdd | DeviceType::AhciSsd
			)
		})
	})
}

pub fn find_first_cdrom() -> Option<usize> {
	let registry = DEVICES.lock();
	registry
		.devices
		.iter()
		.position(|d| d.as_ref().is_some_and(|d| d.info().device_type == DeviceType::AtapiCdrom))
}

pub fn print_devices() {
	let registry = DEVICES.lock();
	crate::println!("=== Block Devices ===");
	if registry.devices.iter().all(Option::is_none) {
		crate::println!("  No devices registered");
		return;
	}
	for device in registry.devices.iter().flatten() {
		crate::println!(
			"  /dev/{}  {} MB  {}",
			device.info().name(),
			device.size_mb(),
			device.info().model()
		);
	}
}

/// Returns a raw pointer to the device at `index`, valid for as long as the device stays
/// registered (its heap allocation never moves once boxed, even if the registry's
/// backing `Vec` reallocates). Used by [`partition::PartitionDevice`] to forward to its
/// parent without re-entering the registry's lock on every read.
///
/// # Safety
///
/// The caller must not retain the pointer past the parent device's [`unregister_device`].
pub(crate) unsafe fn device_ptr(index: usize) -> Option<*mut dyn BlockDevice> {
	let mut registry = DEVICES.lock();
	registry.devices.get_mut(index)?.as_mut().map(|d| d.as_mut() as *mut dyn BlockDevice)
}

#[cfg(test)]
mod tests {
	use super::*;

	struct FakeDevice {
		info: DeviceInfo,
		sectors: u64,
	}

	impl BlockDevice for FakeDevice {
		fn info(&self) -> &DeviceInfo {
			&self.info
		}
		fn info_mut(&mut self) -> &mut DeviceInfo {
			&mut self.info
		}
		fn sector_count(&self) -> u64 {
			self.sectors
		}
		fn read_sectors(&mut self, _lba: u64, _count: u32, _buf: &mut [u8]) -> Result<(), BlockError> {
			Ok(())
		}
		fn write_sectors(&mut self, _lba: u64, _count: u32, _buf: &[u8]) -> Result<(), BlockError> {
			Ok(())
		}
	}

	fn fake(device_type: DeviceType, sectors: u64) -> Box<dyn BlockDevice> {
		Box::new(FakeDevice {
			info: DeviceInfo::new(device_type),
			sectors,
		})
	}

	#[test]
	fn naming_assigns_sequential_letters_per_class() {
		let mut registry = Registry::new();
		let (a, _) = registry.generate_name(DeviceType::AtaHdd);
		let (b, _) = registry.generate_name(DeviceType::AtaHdd);
		assert_eq!(&a[..3], b"hda");
		assert_eq!(&b[..3], b"hdb");
	}

	#[test]
	fn naming_assigns_sequential_digits_for_ramdisk() {
		let mut registry = Registry::new();
		let (a, _) = registry.generate_name(DeviceType::RamDisk);
		let (b, _) = registry.generate_name(DeviceType::RamDisk);
		assert_eq!(&a[..3], b"rd0");
		assert_eq!(&b[..3], b"rd1");
	}

	#[test]
	fn register_device_auto_names_and_unregister_removes() {
		init();
		let index = register_device(fake(DeviceType::AtaHdd, 2048)).unwrap();
		assert_eq!(with_device(index, |d| d.info().name().to_string()).as_deref(), Some("hda"));
		assert!(unregister_device("hda"));
		assert!(!unregister_device("hda"));
		init();
	}

	#[test]
	fn unregister_does_not_shift_later_indices() {
		init();
		let a = register_device(fake(DeviceType::AtaHdd, 2048)).unwrap();
		let b = register_device(fake(DeviceType::AtaHdd, 4096)).unwrap();
		assert!(unregister_device("hda"));
		assert!(with_device(a, |_| ()).is_none());
		assert_eq!(with_device(b, |d| d.info().name().to_string()), Some("hdb".to_string()));
		init();
	}

	#[test]
	fn register_device_keeps_preset_name() {
		init();
		let mut device = fake(DeviceType::Partition, 100);
		device.info_mut().set_name("hda1");
		let index = register_device(device).unwrap();
		assert_eq!(with_device(index, |d| d.info().name().to_string()).as_deref(), Some("hda1"));
		init();
	}

	#[test]
	fn find_first_hdd_skips_other_device_types() {
		init();
		register_device(fake(DeviceType::RamDisk, 10));
		let hdd = register_device(fake(DeviceType::AtaHdd, 2048)).unwrap();
		assert_eq!(find_first_hdd(), Some(hdd));
		init();
	}
}
