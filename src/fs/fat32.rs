/*
 * This file is part of Kestrel. See the license notice in `src/kernel.rs`.
 */

//! A FAT32 driver built directly on [`crate::block`], read-write. LBAs are device-relative:
//! the block device behind a mount is usually a [`crate::block::partition::PartitionDevice`],
//! which already applies the partition's start offset, so every LBA this module computes
//! is relative to the start of whatever device it was mounted on.
//!
//! Long filenames are recognized and skipped rather than stitched together; every file
//! this driver creates or looks up goes by its 8.3 short name.

use alloc::{format, string::String, vec, vec::Vec};

use crate::{
	block,
	fs::{split_parent, split_path, DirEntry, DirHandle, FileHandle, FsError, FsResult, Stat},
};

const SECTOR_SIZE: usize = 512;
const DIR_ENTRY_SIZE: usize = 32;
const FAT32_EOC: u32 = 0x0FFF_FFF8;
const FAT32_BAD: u32 = 0x0FFF_FFF7;
const ATTR_LONG_NAME: u8 = 0x0F;
const ATTR_DIRECTORY: u8 = 0x10;
const ATTR_VOLUME_ID: u8 = 0x08;

#[repr(C, packed)]
struct BootSector {
	_jump: [u8; 3],
	_oem_name: [u8; 8],
	bytes_per_sector: u16,
	sectors_per_cluster: u8,
	reserved_sectors: u16,
	fat_count: u8,
	_root_entry_count: u16,
	_total_sectors_16: u16,
	_media_type: u8,
	fat_size_16: u16,
	_sectors_per_track: u16,
	_head_count: u16,
	_hidden_sectors: u32,
	total_sectors_32: u32,
	fat_size_32: u32,
	_ext_flags: u16,
	_fs_version: u16,
	root_cluster: u32,
	_fs_info_sector: u16,
	_backup_boot_sector: u16,
	_reserved: [u8; 12],
	_drive_number: u8,
	_reserved1: u8,
	_boot_signature: u8,
	_volume_id: u32,
	volume_label: [u8; 11],
	_fs_type: [u8; 8],
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct RawDirEntry {
	name: [u8; 8],
	ext: [u8; 3],
	attributes: u8,
	_reserved: u8,
	_create_time_tenths: u8,
	_create_time: u16,
	_create_date: u16,
	_access_date: u16,
	cluster_high: u16,
	_modify_time: u16,
	_modify_date: u16,
	cluster_low: u16,
	file_size: u32,
}

impl RawDirEntry {
	fn blank() -> Self {
		// SAFETY: an all-zero byte pattern is a valid `RawDirEntry` (every field is an
		// integer type).
		unsafe { core::mem::zeroed() }
	}

	fn is_end(&self) -> bool {
		self.name[0] == 0x00
	}

	fn is_deleted(&self) -> bool {
		self.name[0] == 0xE5
	}

	fn is_long_name(&self) -> bool {
		self.attributes == ATTR_LONG_NAME
	}

	fn is_volume_id(&self) -> bool {
		self.attributes & ATTR_VOLUME_ID != 0
	}

	fn is_directory(&self) -> bool {
		self.attributes & ATTR_DIRECTORY != 0
	}

	fn start_cluster(&self) -> u32 {
		let high = self.cluster_high;
		let low = self.cluster_low;
		((high as u32) << 16) | low as u32
	}

	fn size(&self) -> u32 {
		self.file_size
	}

	fn short_name(&self) -> String {
		let mut s = String::new();
		for &b in &self.name {
			if b == b' ' {
				break;
			}
			s.push(b as char);
		}
		if self.ext[0] != b' ' {
			s.push('.');
			for &b in &self.ext {
				if b == b' ' {
					break;
				}
				s.push(b as char);
			}
		}
		s
	}

	fn set_start_cluster(&mut self, cluster: u32) {
		self.cluster_high = (cluster >> 16) as u16;
		self.cluster_low = (cluster & 0xFFFF) as u16;
	}
}

/// Where a directory entry lives on disk, so a later write can patch its size/cluster
/// fields in place.
#[derive(Clone, Copy)]
struct DirLoc {
	sector_lba: u64,
	offset_in_sector: usize,
}

struct Lookup {
	cluster: u32,
	size: u32,
	is_directory: bool,
	loc: Option<DirLoc>,
}

struct OpenFile {
	cluster: u32,
	size: u32,
	position: u32,
	loc: Option<DirLoc>,
	valid: bool,
}

struct DirStream {
	entries: Vec<DirEntry>,
	position: usize,
	valid: bool,
}

pub struct Fat32 {
	device_index: Option<usize>,
	sectors_per_cluster: u8,
	fat_count: u8,
	fat_size_sectors: u32,
	root_cluster: u32,
	fat_begin_lba: u64,
	cluster_begin_lba: u64,
	total_clusters: u32,
	volume_label: String,
	open_files: Vec<OpenFile>,
	dir_streams: Vec<DirStream>,
}

impl Fat32 {
	pub fn new() -> Self {
		Self {
			device_index: None,
			sectors_per_cluster: 0,
			fat_count: 0,
			fat_size_sectors: 0,
			root_cluster: 0,
			fat_begin_lba: 0,
			cluster_begin_lba: 0,
			total_clusters: 0,
			volume_label: String::new(),
			open_files: Vec::new(),
			dir_streams: Vec::new(),
		}
	}

	pub fn volume_label(&self) -> &str {
		&self.volume_label
	}

	fn device(&self) -> FsResult<usize> {
		self.device_index.ok_or(FsError::IOError)
	}

	fn read_sector(&self, lba: u64, buf: &mut [u8; SECTOR_SIZE]) -> FsResult<()> {
		let index = self.device()?;
		block::with_device(index, |d| d.read_sectors(lba, 1, buf))
			.ok_or(FsError::IOError)?
			.map_err(|_| FsError::IOError)
	}

	fn write_sector(&self, lba: u64, buf: &[u8; SECTOR_SIZE]) -> FsResult<()> {
		let index = self.device()?;
		block::with_device(index, |d| d.write_sectors(lba, 1, buf))
			.ok_or(FsError::IOError)?
			.map_err(|_| FsError::IOError)
	}

	fn cluster_to_lba(&self, cluster: u32) -> u64 {
		self.cluster_begin_lba + (cluster as u64 - 2) * self.sectors_per_cluster as u64
	}

	fn cluster_bytes(&self) -> usize {
		self.sectors_per_cluster as usize * SECTOR_SIZE
	}

	fn read_cluster(&self, cluster: u32) -> FsResult<Vec<u8>> {
		let index = self.device()?;
		let mut buf = vec![0u8; self.cluster_bytes()];
		let lba = self.cluster_to_lba(cluster);
		block::with_device(index, |d| d.read_sectors(lba, self.sectors_per_cluster as u32, &mut buf))
			.ok_or(FsError::IOError)?
			.map_err(|_| FsError::IOError)?;
		Ok(buf)
	}

	fn write_cluster(&self, cluster: u32, data: &[u8]) -> FsResult<()> {
		let index = self.device()?;
		let lba = self.cluster_to_lba(cluster);
		block::with_device(index, |d| d.write_sectors(lba, self.sectors_per_cluster as u32, data))
			.ok_or(FsError::IOError)?
			.map_err(|_| FsError::IOError)
	}

	/// Reads the raw (unmasked) FAT entry for `cluster`, from the first FAT copy.
	fn fat_entry(&self, cluster: u32) -> FsResult<u32> {
		let fat_offset = cluster as u64 * 4;
		let sector = self.fat_begin_lba + fat_offset / SECTOR_SIZE as u64;
		let offset = (fat_offset % SECTOR_SIZE as u64) as usize;
		let mut buf = [0u8; SECTOR_SIZE];
		self.read_sector(sector, &mut buf)?;
		Ok(u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap()))
	}

	/// Writes `value` into `cluster`'s FAT entry in every FAT copy.
	fn set_fat_entry(&self, cluster: u32, value: u32) -> FsResult<()> {
		let fat_offset = cluster as u64 * 4;
		let sector_in_fat = fat_offset / SECTOR_SIZE as u64;
		let offset = (fat_offset % SECTOR_SIZE as u64) as usize;
		for copy in 0..self.fat_count as u64 {
			let sector = self.fat_begin_lba + copy * self.fat_size_sectors as u64 + sector_in_fat;
			let mut buf = [0u8; SECTOR_SIZE];
			self.read_sector(sector, &mut buf)?;
			buf[offset..offset + 4].copy_from_slice(&(value & 0x0FFF_FFFF).to_le_bytes());
			self.write_sector(sector, &buf)?;
		}
		Ok(())
	}

	fn next_cluster(&self, cluster: u32) -> FsResult<u32> {
		Ok(self.fat_entry(cluster)? & 0x0FFF_FFFF)
	}

	fn is_end_of_chain(value: u32) -> bool {
		value >= FAT32_EOC || value == FAT32_BAD
	}

	/// Scans the whole FAT for a free (zero) entry, marks it end-of-chain, and returns its
	/// cluster number.
	/// Scans the FAT for a free (zero) entry, one sector at a time, checking every entry a
	/// loaded sector holds before reading the next one rather than re-reading the same
	/// sector once per cluster.
	fn alloc_cluster(&self) -> FsResult<u32> {
		let entries_per_sector = SECTOR_SIZE as u64 / 4;
		let last_cluster = self.total_clusters + 1;
		let mut cluster = 2u32;
		while cluster <= last_cluster {
			let sector = self.fat_begin_lba + cluster as u64 * 4 / SECTOR_SIZE as u64;
			let mut buf = [0u8; SECTOR_SIZE];
			self.read_sector(sector, &mut buf)?;

			let sector_start_cluster = cluster as u64 - (cluster as u64 % entries_per_sector);
			let last_in_sector = (sector_start_cluster + entries_per_sector - 1).min(last_cluster as u64) as u32;
			while cluster <= last_in_sector {
				let offset = (cluster as u64 % entries_per_sector) as usize * 4;
				if u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap()) == 0 {
					self.set_fat_entry(cluster, FAT32_EOC)?;
					return Ok(cluster);
				}
				cluster += 1;
			}
		}
		Err(FsError::NoSpace)
	}

	/// Appends a freshly allocated cluster to the chain ending at `tail`, returns the new
	/// cluster.
	fn extend_chain(&self, tail: u32) -> FsResult<u32> {
		let new_cluster = self.alloc_cluster()?;
		self.set_fat_entry(tail, new_cluster)?;
		Ok(new_cluster)
	}

	/// Walks every 32-byte record across `dir_cluster`'s chain, yielding `(entry, loc)` for
	/// records up to and excluding the end-of-directory marker. Stops early on read error.
	fn for_each_entry(
		&self,
		dir_cluster: u32,
		mut f: impl FnMut(&RawDirEntry, DirLoc) -> bool,
	) -> FsResult<()> {
		let mut cluster = dir_cluster;
		'outer: loop {
			let data = self.read_cluster(cluster)?;
			for sector_index in 0..self.sectors_per_cluster as usize {
				let sector_lba = self.cluster_to_lba(cluster) + sector_index as u64;
				let sector = &data[sector_index * SECTOR_SIZE..(sector_index + 1) * SECTOR_SIZE];
				for (i, chunk) in sector.chunks(DIR_ENTRY_SIZE).enumerate() {
					let entry = unsafe { &*(chunk.as_ptr() as *const RawDirEntry) };
					if entry.is_end() {
						break 'outer;
					}
					let loc = DirLoc { sector_lba, offset_in_sector: i * DIR_ENTRY_SIZE };
					if !f(entry, loc) {
						break 'outer;
					}
				}
			}
			let next = self.next_cluster(cluster)?;
			if Self::is_end_of_chain(next) {
				break;
			}
			cluster = next;
		}
		Ok(())
	}

	fn find_in_dir(&self, dir_cluster: u32, name: &str) -> FsResult<Option<Lookup>> {
		let mut found = None;
		self.for_each_entry(dir_cluster, |entry, loc| {
			if entry.is_deleted() || entry.is_long_name() || entry.is_volume_id() {
				return true;
			}
			if entry.short_name().eq_ignore_ascii_case(name) {
				found = Some(Lookup {
					cluster: entry.start_cluster(),
					size: entry.size(),
					is_directory: entry.is_directory(),
					loc: Some(loc),
				});
				return false;
			}
			true
		})?;
		Ok(found)
	}

	fn lookup(&self, path: &str) -> FsResult<Lookup> {
		let components: Vec<&str> = split_path(path).collect();
		if components.is_empty() {
			return Ok(Lookup { cluster: self.root_cluster, size: 0, is_directory: true, loc: None });
		}
		let mut cluster = self.root_cluster;
		let mut result = None;
		for (i, component) in components.iter().enumerate() {
			let entry = self.find_in_dir(cluster, component)?.ok_or(FsError::NotFound)?;
			if i + 1 < components.len() && !entry.is_directory {
				return Err(FsError::NotDirectory);
			}
			cluster = entry.cluster;
			result = Some(entry);
		}
		Ok(result.unwrap())
	}

	fn lookup_parent(&self, path: &str) -> FsResult<u32> {
		let (components, _) = split_parent(path);
		if components.is_empty() {
			return Ok(self.root_cluster);
		}
		let mut cluster = self.root_cluster;
		for component in components {
			let entry = self.find_in_dir(cluster, component)?.ok_or(FsError::NotFound)?;
			if !entry.is_directory {
				return Err(FsError::NotDirectory);
			}
			cluster = entry.cluster;
		}
		Ok(cluster)
	}

	/// Uppercases and 8.3-splits `name`, appending a `~N` collision suffix if needed so
	/// the result is unique within `dir_cluster`.
	fn synthesize_short_name(&self, dir_cluster: u32, name: &str) -> FsResult<([u8; 8], [u8; 3])> {
		let (base, ext) = match name.rsplit_once('.') {
			Some((b, e)) => (b, e),
			None => (name, ""),
		};
		let clean = |s: &str, max: usize| -> Vec<u8> {
			s.chars()
				.filter(|c| c.is_ascii_alphanumeric())
				.take(max)
				.map(|c| c.to_ascii_uppercase() as u8)
				.collect()
		};
		let base_clean = clean(base, 8);
		let ext_clean = clean(ext, 3);

		for suffix in 0..=999u32 {
			let mut candidate_base = base_clean.clone();
			if suffix > 0 {
				let tag = format!("~{suffix}");
				let keep = 8 - tag.len().min(8);
				candidate_base.truncate(keep);
				candidate_base.extend_from_slice(tag.as_bytes());
			}
			let mut name_field = [b' '; 8];
			name_field[..candidate_base.len()].copy_from_slice(&candidate_base);
			let mut ext_field = [b' '; 3];
			ext_field[..ext_clean.len()].copy_from_slice(&ext_clean);

			let mut candidate = String::new();
			for &b in &name_field {
				if b != b' ' {
					candidate.push(b as char);
				}
			}
			if ext_field[0] != b' ' {
				candidate.push('.');
				for &b in &ext_field {
					if b != b' ' {
						candidate.push(b as char);
					}
				}
			}
			if self.find_in_dir(dir_cluster, &candidate)?.is_none() {
				return Ok((name_field, ext_field));
			}
		}
		Err(FsError::NoSpace)
	}

	/// Finds an end-of-directory or deleted slot in `dir_cluster`'s chain, extending the
	/// chain by one cluster if every existing one is full.
	fn find_free_slot(&self, dir_cluster: u32) -> FsResult<DirLoc> {
		let mut loc = None;
		self.for_each_entry(dir_cluster, |entry, l| {
			if entry.is_end() || entry.is_deleted() {
				loc = Some(l);
				return false;
			}
			true
		})?;
		if let Some(loc) = loc {
			return Ok(loc);
		}

		let mut cluster = dir_cluster;
		loop {
			let next = self.next_cluster(cluster)?;
			if Self::is_end_of_chain(next) {
				break;
			}
			cluster = next;
		}
		let new_cluster = self.extend_chain(cluster)?;
		self.write_cluster(new_cluster, &vec![0u8; self.cluster_bytes()])?;
		Ok(DirLoc { sector_lba: self.cluster_to_lba(new_cluster), offset_in_sector: 0 })
	}

	fn write_dir_entry(&self, loc: DirLoc, entry: &RawDirEntry) -> FsResult<()> {
		let mut sector = [0u8; SECTOR_SIZE];
		self.read_sector(loc.sector_lba, &mut sector)?;
		let bytes = unsafe {
			core::slice::from_raw_parts(entry as *const RawDirEntry as *const u8, DIR_ENTRY_SIZE)
		};
		sector[loc.offset_in_sector..loc.offset_in_sector + DIR_ENTRY_SIZE].copy_from_slice(bytes);
		self.write_sector(loc.sector_lba, &sector)
	}

	fn read_dir_entry(&self, loc: DirLoc) -> FsResult<RawDirEntry> {
		let mut sector = [0u8; SECTOR_SIZE];
		self.read_sector(loc.sector_lba, &mut sector)?;
		let chunk = &sector[loc.offset_in_sector..loc.offset_in_sector + DIR_ENTRY_SIZE];
		Ok(unsafe { *(chunk.as_ptr() as *const RawDirEntry) })
	}
}

impl Default for Fat32 {
	fn default() -> Self {
		Self::new()
	}
}

impl super::Filesystem for Fat32 {
	fn mount(&mut self, device_index: Option<usize>) -> FsResult<()> {
		let index = device_index.ok_or(FsError::Unsupported)?;
		self.device_index = Some(index);

		let mut sector = [0u8; SECTOR_SIZE];
		self.read_sector(0, &mut sector)?;
		let boot = unsafe { &*(sector.as_ptr() as *const BootSector) };

		let bytes_per_sector = boot.bytes_per_sector;
		let fat_size_16 = boot.fat_size_16;
		let fat_size_32 = boot.fat_size_32;
		if bytes_per_sector as usize != SECTOR_SIZE || fat_size_16 != 0 || fat_size_32 == 0 {
			self.device_index = None;
			return Err(FsError::Unsupported);
		}

		self.sectors_per_cluster = boot.sectors_per_cluster;
		self.fat_count = boot.fat_count;
		self.fat_size_sectors = fat_size_32;
		self.root_cluster = boot.root_cluster;
		let reserved_sectors = boot.reserved_sectors;
		self.fat_begin_lba = reserved_sectors as u64;
		self.cluster_begin_lba = self.fat_begin_lba + self.fat_count as u64 * self.fat_size_sectors as u64;

		let total_sectors = boot.total_sectors_32;
		let data_sectors =
			total_sectors.saturating_sub(reserved_sectors as u32 + self.fat_count as u32 * fat_size_32);
		self.total_clusters = if self.sectors_per_cluster > 0 {
			data_sectors / self.sectors_per_cluster as u32
		} else {
			0
		};

		let mut label = String::new();
		for &b in &boot.volume_label {
			label.push(b as char);
		}
		self.volume_label = label.trim_end().into();

		self.open_files.clear();
		self.dir_streams.clear();
		Ok(())
	}

	fn unmount(&mut self) {
		self.device_index = None;
		self.open_files.clear();
		self.dir_streams.clear();
	}

	fn open(&mut self, path: &str, mode: super::OpenMode) -> FsResult<FileHandle> {
		let lookup = match self.lookup(path) {
			Ok(l) => l,
			Err(FsError::NotFound) if mode.create => {
				let parent = self.lookup_parent(path)?;
				let (_, name) = split_parent(path);
				let name = name.ok_or(FsError::InvalidPath)?;
				let (name_field, ext_field) = self.synthesize_short_name(parent, name)?;
				let loc = self.find_free_slot(parent)?;
				let mut entry = RawDirEntry::blank();
				entry.name = name_field;
				entry.ext = ext_field;
				self.write_dir_entry(loc, &entry)?;
				Lookup { cluster: 0, size: 0, is_directory: false, loc: Some(loc) }
			}
			Err(e) => return Err(e),
		};
		if lookup.is_directory {
			return Err(FsError::IsDirectory);
		}
		if mode.truncate && lookup.size > 0 {
			if let Some(loc) = lookup.loc {
				let mut entry = self.read_dir_entry(loc)?;
				entry.file_size = 0;
				entry.set_start_cluster(0);
				self.write_dir_entry(loc, &entry)?;
			}
		}
		let (cluster, size) = if mode.truncate { (0, 0) } else { (lookup.cluster, lookup.size) };
		let position = if mode.append { size } else { 0 };
		let slot = OpenFile { cluster, size, position, loc: lookup.loc, valid: true };
		let handle = if let Some(i) = self.open_files.iter().position(|f| !f.valid) {
			self.open_files[i] = slot;
			i
		} else {
			self.open_files.push(slot);
			self.open_files.len() - 1
		};
		Ok(FileHandle(handle as u32))
	}

	fn close(&mut self, handle: FileHandle) {
		if let Some(f) = self.open_files.get_mut(handle.0 as usize) {
			f.valid = false;
		}
	}

	fn read(&mut self, handle: FileHandle, buf: &mut [u8]) -> FsResult<usize> {
		let (cluster, size, mut position) = {
			let f = self.open_files.get(handle.0 as usize).filter(|f| f.valid).ok_or(FsError::BadHandle)?;
			(f.cluster, f.size, f.position)
		};
		if position >= size || cluster < 2 {
			return Ok(0);
		}
		let to_read = buf.len().min((size - position) as usize);
		let cluster_size = self.cluster_bytes();
		let mut current_cluster = cluster;
		let mut skip = position as usize / cluster_size;
		let mut offset_in_cluster = position as usize % cluster_size;
		while skip > 0 {
			current_cluster = self.next_cluster(current_cluster)?;
			skip -= 1;
		}

		let mut read_total = 0usize;
		while read_total < to_read {
			if current_cluster < 2 || Self::is_end_of_chain(current_cluster) {
				break;
			}
			let data = self.read_cluster(current_cluster)?;
			let chunk = (cluster_size - offset_in_cluster).min(to_read - read_total);
			buf[read_total..read_total + chunk]
				.copy_from_slice(&data[offset_in_cluster..offset_in_cluster + chunk]);
			read_total += chunk;
			offset_in_cluster = 0;
			if read_total < to_read {
				current_cluster = self.next_cluster(current_cluster)?;
			}
		}
		position += read_total as u32;
		if let Some(f) = self.open_files.get_mut(handle.0 as usize) {
			f.position = position;
		}
		Ok(read_total)
	}

	fn write(&mut self, handle: FileHandle, buf: &[u8]) -> FsResult<usize> {
		let (mut cluster, mut size, mut position, loc) = {
			let f = self.open_files.get(handle.0 as usize).filter(|f| f.valid).ok_or(FsError::BadHandle)?;
			(f.cluster, f.size, f.position, f.loc)
		};

		if cluster < 2 {
			cluster = self.alloc_cluster()?;
		}

		let cluster_size = self.cluster_bytes();
		let mut current_cluster = cluster;
		let mut clusters_to_skip = position as usize / cluster_size;
		while clusters_to_skip > 0 {
			let next = self.next_cluster(current_cluster)?;
			current_cluster = if Self::is_end_of_chain(next) {
				self.extend_chain(current_cluster)?
			} else {
				next
			};
			clusters_to_skip -= 1;
		}

		let mut written = 0usize;
		let mut offset_in_cluster = position as usize % cluster_size;
		while written < buf.len() {
			let mut data = self.read_cluster(current_cluster)?;
			let chunk = (cluster_size - offset_in_cluster).min(buf.len() - written);
			data[offset_in_cluster..offset_in_cluster + chunk].copy_from_slice(&buf[written..written + chunk]);
			self.write_cluster(current_cluster, &data)?;
			written += chunk;
			offset_in_cluster = 0;
			if written < buf.len() {
				let next = self.next_cluster(current_cluster)?;
				current_cluster = if Self::is_end_of_chain(next) {
					self.extend_chain(current_cluster)?
				} else {
					next
				};
			}
		}

		position += written as u32;
		size = size.max(position);
		if let Some(f) = self.open_files.get_mut(handle.0 as usize) {
			f.cluster = cluster;
			f.size = size;
			f.position = position;
		}
		if let Some(loc) = loc {
			let mut entry = self.read_dir_entry(loc)?;
			entry.set_start_cluster(cluster);
			entry.file_size = size;
			self.write_dir_entry(loc, &entry)?;
		}
		Ok(written)
	}

	fn seek(&mut self, handle: FileHandle, absolute_offset: u32) -> FsResult<()> {
		let f = self.open_files.get_mut(handle.0 as usize).filter(|f| f.valid).ok_or(FsError::BadHandle)?;
		f.position = absolute_offset;
		Ok(())
	}

	fn opendir(&mut self, path: &str) -> FsResult<DirHandle> {
		let lookup = self.lookup(path)?;
		if !lookup.is_directory {
			return Err(FsError::NotDirectory);
		}
		let mut listing = Vec::new();
		self.for_each_entry(lookup.cluster, |entry, _| {
			if !entry.is_deleted() && !entry.is_long_name() && !entry.is_volume_id() {
				listing.push(DirEntry {
					name: entry.short_name(),
					size: entry.size(),
					is_directory: entry.is_directory(),
				});
			}
			true
		})?;
		let slot = DirStream { entries: listing, position: 0, valid: true };
		let handle = if let Some(i) = self.dir_streams.iter().position(|s| !s.valid) {
			self.dir_streams[i] = slot;
			i
		} else {
			self.dir_streams.push(slot);
			self.dir_streams.len() - 1
		};
		Ok(DirHandle(handle as u32))
	}

	fn readdir(&mut self, handle: DirHandle) -> FsResult<DirEntry> {
		let s = self.dir_streams.get_mut(handle.0 as usize).filter(|s| s.valid).ok_or(FsError::BadHandle)?;
		let entry = s.entries.get(s.position).cloned().ok_or(FsError::NotFound)?;
		s.position += 1;
		Ok(entry)
	}

	fn closedir(&mut self, handle: DirHandle) {
		if let Some(s) = self.dir_streams.get_mut(handle.0 as usize) {
			s.valid = false;
		}
	}

	fn stat(&mut self, path: &str) -> FsResult<Stat> {
		let lookup = self.lookup(path)?;
		Ok(Stat { size: lookup.size, is_directory: lookup.is_directory })
	}

	fn mkdir(&mut self, path: &str) -> FsResult<()> {
		if self.lookup(path).is_ok() {
			return Err(FsError::AlreadyExists);
		}
		let parent = self.lookup_parent(path)?;
		let (_, name) = split_parent(path);
		let name = name.ok_or(FsError::InvalidPath)?;
		let (name_field, ext_field) = self.synthesize_short_name(parent, name)?;
		let new_cluster = self.alloc_cluster()?;

		let mut dir_data = vec![0u8; self.cluster_bytes()];
		let mut dot = RawDirEntry::blank();
		dot.name = *b".       ";
		dot.attributes = ATTR_DIRECTORY;
		dot.set_start_cluster(new_cluster);
		let mut dotdot = RawDirEntry::blank();
		dotdot.name = *b"..      ";
		dotdot.attributes = ATTR_DIRECTORY;
		dotdot.set_start_cluster(parent);
		let dot_bytes =
			unsafe { core::slice::from_raw_parts(&dot as *const RawDirEntry as *const u8, DIR_ENTRY_SIZE) };
		let dotdot_bytes =
			unsafe { core::slice::from_raw_parts(&dotdot as *const RawDirEntry as *const u8, DIR_ENTRY_SIZE) };
		dir_data[..DIR_ENTRY_SIZE].copy_from_slice(dot_bytes);
		dir_data[DIR_ENTRY_SIZE..DIR_ENTRY_SIZE * 2].copy_from_slice(dotdot_bytes);
		self.write_cluster(new_cluster, &dir_data)?;

		let loc = self.find_free_slot(parent)?;
		let mut entry = RawDirEntry::blank();
		entry.name = name_field;
		entry.ext = ext_field;
		entry.attributes = ATTR_DIRECTORY;
		entry.set_start_cluster(new_cluster);
		self.write_dir_entry(loc, &entry)
	}

	fn unlink(&mut self, path: &str) -> FsResult<()> {
		let lookup = self.lookup(path)?;
		if lookup.is_directory {
			return Err(FsError::IsDirectory);
		}
		let loc = lookup.loc.ok_or(FsError::InvalidPath)?;
		let mut entry = self.read_dir_entry(loc)?;
		entry.name[0] = 0xE5;
		self.write_dir_entry(loc, &entry)?;

		let mut cluster = lookup.cluster;
		while cluster >= 2 && !Self::is_end_of_chain(cluster) {
			let next = self.next_cluster(cluster)?;
			self.set_fat_entry(cluster, 0)?;
			cluster = next;
		}
		Ok(())
	}

	fn rmdir(&mut self, path: &str) -> FsResult<()> {
		let lookup = self.lookup(path)?;
		if !lookup.is_directory {
			return Err(FsError::NotDirectory);
		}
		let loc = lookup.loc.ok_or(FsError::PermissionDenied)?;

		let mut has_children = false;
		self.for_each_entry(lookup.cluster, |entry, _| {
			let name = entry.short_name();
			if !entry.is_deleted() && !entry.is_long_name() && !entry.is_volume_id() && name != "." && name != ".." {
				has_children = true;
				return false;
			}
			true
		})?;
		if has_children {
			return Err(FsError::DirectoryNotEmpty);
		}

		let mut entry = self.read_dir_entry(loc)?;
		entry.name[0] = 0xE5;
		self.write_dir_entry(loc, &entry)?;

		let mut cluster = lookup.cluster;
		while cluster >= 2 && !Self::is_end_of_chain(cluster) {
			let next = self.next_cluster(cluster)?;
			self.set_fat_entry(cluster, 0)?;
			cluster = next;
		}
		Ok(())
	}

	fn rename(&mut self, from: &str, to: &str) -> FsResult<()> {
		if self.lookup(to).is_ok() {
			return Err(FsError::AlreadyExists);
		}
		let lookup = self.lookup(from)?;
		let loc = lookup.loc.ok_or(FsError::InvalidPath)?;
		let to_parent = self.lookup_parent(to)?;
		let (_, name) = split_parent(to);
		let name = name.ok_or(FsError::InvalidPath)?;
		let (name_field, ext_field) = self.synthesize_short_name(to_parent, name)?;

		let mut entry = self.read_dir_entry(loc)?;
		entry.name = name_field;
		entry.ext = ext_field;
		self.write_dir_entry(loc, &entry)?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn cluster_to_lba_matches_known_offset() {
		let mut fs = Fat32::new();
		fs.sectors_per_cluster = 8;
		fs.cluster_begin_lba = 1000;
		assert_eq!(fs.cluster_to_lba(2), 1000);
		assert_eq!(fs.cluster_to_lba(3), 1008);
	}

	#[test]
	fn is_end_of_chain_matches_fat32_markers() {
		assert!(Fat32::is_end_of_chain(0x0FFF_FFF8));
		assert!(Fat32::is_end_of_chain(0x0FFF_FFFF));
		assert!(Fat32::is_end_of_chain(FAT32_BAD));
		assert!(!Fat32::is_end_of_chain(5));
	}

	#[test]
	fn raw_dir_entry_short_name_joins_base_and_extension() {
		let mut entry = RawDirEntry::blank();
		entry.name = *b"HELLO   ";
		entry.ext = *b"TXT";
		assert_eq!(entry.short_name(), "HELLO.TXT");
	}

	#[test]
	fn raw_dir_entry_start_cluster_combines_high_and_low_words() {
		let mut entry = RawDirEntry::blank();
		entry.set_start_cluster(0x0001_2345);
		assert_eq!(entry.start_cluster(), 0x0001_2345);
	}
}
