/*
 * This file is part of Kestrel. See the license notice in `src/kernel.rs`.
 */

//! The virtual filesystem: a mount table keyed by absolute path, a system-wide open-file
//! table, and the auto-detect logic that decides what ends up mounted at `/` on boot.
//!
//! Every path accepted here is absolute. Resolving a shell's working directory against a
//! relative path happens on the caller's side, not in the VFS, the same way [`crate::event`]
//! leaves interpreting its events up to whatever drains the queue.

use alloc::{boxed::Box, format, string::String, vec::Vec};

use crate::{
	block,
	fs::{
		fat32::Fat32, ramfs::Ramfs, split_path, DirEntry, DirHandle, FileHandle, Filesystem, FsError,
		FsResult, OpenMode, Stat,
	},
	sync::IntSpin,
};

const MAX_MOUNTS: usize = crate::build_cfg!(max_mounts);
const MAX_OPEN_FILES: usize = crate::build_cfg!(max_open_files);

struct Mount {
	path: String,
	fs: Box<dyn Filesystem>,
}

struct OpenFile {
	mount: usize,
	handle: FileHandle,
	valid: bool,
}

struct OpenDir {
	mount: usize,
	handle: DirHandle,
	valid: bool,
}

struct Vfs {
	mounts: Vec<Mount>,
	files: Vec<OpenFile>,
	dirs: Vec<OpenDir>,
}

impl Vfs {
	const fn new() -> Self {
		Self { mounts: Vec::new(), files: Vec::new(), dirs: Vec::new() }
	}
}

static VFS: IntSpin<Vfs> = IntSpin::new(Vfs::new());

/// Joins path components back into a canonical absolute path with no trailing slash
/// (except for the root itself).
fn normalize(path: &str) -> String {
	let components: Vec<&str> = split_path(path).collect();
	if components.is_empty() {
		String::from("/")
	} else {
		format!("/{}", components.join("/"))
	}
}

/// Finds the mount with the longest path that is a prefix of `path`, and the remainder to
/// hand to that filesystem's own operations.
fn resolve(mounts: &[Mount], path: &str) -> Option<(usize, String)> {
	let normalized = normalize(path);
	let mut best: Option<usize> = None;
	let mut best_len = 0usize;
	for (i, m) in mounts.iter().enumerate() {
		let matches = m.path == "/" || normalized == m.path || normalized.starts_with(&format!("{}/", m.path));
		if matches && m.path.len() >= best_len {
			best = Some(i);
			best_len = m.path.len();
		}
	}
	let index = best?;
	let mount_path = mounts[index].path.clone();
	let mut remainder = if mount_path == "/" { normalized } else { normalized[mount_path.len()..].into() };
	if remainder.is_empty() {
		remainder = String::from("/");
	}
	Some((index, remainder))
}

/// Mounts `fs` at `path`, calling its `mount` hook with `device_index`. Fails with
/// [`FsError::NoSpace`] once [`MAX_MOUNTS`] entries are already in use.
pub fn mount(path: &str, mut fs: Box<dyn Filesystem>, device_index: Option<usize>) -> FsResult<()> {
	let mut vfs = VFS.lock();
	if vfs.mounts.len() >= MAX_MOUNTS {
		return Err(FsError::NoSpace);
	}
	fs.mount(device_index)?;
	vfs.mounts.push(Mount { path: normalize(path), fs });
	Ok(())
}

pub fn unmount(path: &str) -> FsResult<()> {
	let mut vfs = VFS.lock();
	let target = normalize(path);
	let index = vfs.mounts.iter().position(|m| m.path == target).ok_or(FsError::NotFound)?;
	vfs.mounts[index].fs.unmount();
	vfs.mounts.remove(index);
	Ok(())
}

/// Probes every registered block device for a mountable FAT32 volume; the first one that
/// mounts cleanly becomes root. Falls back to RAMFS if none does.
pub fn init() {
	*VFS.lock() = Vfs::new();

	let mut mounted_root = false;
	for index in 0..block::device_count() {
		let mut fat = Fat32::new();
		if fat.mount(Some(index)).is_ok() {
			crate::println!("[vfs] mounted FAT32 volume \"{}\" at /", fat.volume_label());
			VFS.lock().mounts.push(Mount { path: String::from("/"), fs: Box::new(fat) });
			mounted_root = true;
			break;
		}
	}

	if !mounted_root {
		let mut ramfs = Ramfs::new();
		let _ = ramfs.mount(None);
		crate::println!("[vfs] no FAT32 volume found, mounting RAMFS at / (degraded mode)");
		VFS.lock().mounts.push(Mount { path: String::from("/"), fs: Box::new(ramfs) });
	}
}

fn alloc_file_slot(vfs: &mut Vfs, mount: usize, handle: FileHandle) -> u32 {
	if let Some(i) = vfs.files.iter().position(|f| !f.valid) {
		vfs.files[i] = OpenFile { mount, handle, valid: true };
		i as u32
	} else {
		vfs.files.push(OpenFile { mount, handle, valid: true });
		(vfs.files.len() - 1) as u32
	}
}

pub fn open(path: &str, mode: OpenMode) -> FsResult<u32> {
	let mut vfs = VFS.lock();
	if vfs.files.iter().filter(|f| f.valid).count() >= MAX_OPEN_FILES {
		return Err(FsError::NoSpace);
	}
	let (mount, relpath) = resolve(&vfs.mounts, path).ok_or(FsError::InvalidPath)?;
	let handle = vfs.mounts[mount].fs.open(&relpath, mode)?;
	Ok(alloc_file_slot(&mut vfs, mount, handle))
}

pub fn close(fd: u32) {
	let mut vfs = VFS.lock();
	if let Some((mount, handle)) = vfs.files.get(fd as usize).filter(|f| f.valid).map(|f| (f.mount, f.handle)) {
		vfs.mounts[mount].fs.close(handle);
	}
	if let Some(f) = vfs.files.get_mut(fd as usize) {
		f.valid = false;
	}
}

pub fn read(fd: u32, buf: &mut [u8]) -> FsResult<usize> {
	let mut vfs = VFS.lock();
	let f = vfs.files.get(fd as usize).filter(|f| f.valid).map(|f| (f.mount, f.handle)).ok_or(FsError::BadHandle)?;
	vfs.mounts[f.0].fs.read(f.1, buf)
}

pub fn write(fd: u32, buf: &[u8]) -> FsResult<usize> {
	let mut vfs = VFS.lock();
	let f = vfs.files.get(fd as usize).filter(|f| f.valid).map(|f| (f.mount, f.handle)).ok_or(FsError::BadHandle)?;
	vfs.mounts[f.0].fs.write(f.1, buf)
}

pub fn seek(fd: u32, absolute_offset: u32) -> FsResult<()> {
	let mut vfs = VFS.lock();
	let f = vfs.files.get(fd as usize).filter(|f| f.valid).map(|f| (f.mount, f.handle)).ok_or(FsError::BadHandle)?;
	vfs.mounts[f.0].fs.seek(f.1, absolute_offset)
}

pub fn opendir(path: &str) -> FsResult<u32> {
	let mut vfs = VFS.lock();
	let (mount, relpath) = resolve(&vfs.mounts, path).ok_or(FsError::InvalidPath)?;
	let handle = vfs.mounts[mount].fs.opendir(&relpath)?;
	let slot = if let Some(i) = vfs.dirs.iter().position(|d| !d.valid) {
		vfs.dirs[i] = OpenDir { mount, handle, valid: true };
		i as u32
	} else {
		vfs.dirs.push(OpenDir { mount, handle, valid: true });
		(vfs.dirs.len() - 1) as u32
	};
	Ok(slot)
}

pub fn readdir(dh: u32) -> FsResult<DirEntry> {
	let mut vfs = VFS.lock();
	let d = vfs.dirs.get(dh as usize).filter(|d| d.valid).map(|d| (d.mount, d.handle)).ok_or(FsError::BadHandle)?;
	vfs.mounts[d.0].fs.readdir(d.1)
}

pub fn closedir(dh: u32) {
	let mut vfs = VFS.lock();
	if let Some(d) = vfs.dirs.get(dh as usize).filter(|d| d.valid).map(|d| (d.mount, d.handle)) {
		vfs.mounts[d.0].fs.closedir(d.1);
	}
	if let Some(d) = vfs.dirs.get_mut(dh as usize) {
		d.valid = false;
	}
}

pub fn stat(path: &str) -> FsResult<Stat> {
	let mut vfs = VFS.lock();
	let (mount, relpath) = resolve(&vfs.mounts, path).ok_or(FsError::InvalidPath)?;
	vfs.mounts[mount].fs.stat(&relpath)
}

pub fn mkdir(path: &str) -> FsResult<()> {
	let mut vfs = VFS.lock();
	let (mount, relpath) = resolve(&vfs.mounts, path).ok_or(FsError::InvalidPath)?;
	vfs.mounts[mount].fs.mkdir(&relpath)
}

pub fn unlink(path: &str) -> FsResult<()> {
	let mut vfs = VFS.lock();
	let (mount, relpath) = resolve(&vfs.mounts, path).ok_or(FsError::InvalidPath)?;
	vfs.mounts[mount].fs.unlink(&relpath)
}

pub fn rmdir(path: &str) -> FsResult<()> {
	let mut vfs = VFS.lock();
	let (mount, relpath) = resolve(&vfs.mounts, path).ok_or(FsError::InvalidPath)?;
	vfs.mounts[mount].fs.rmdir(&relpath)
}

/// Renames within a single filesystem; `from` and `to` resolving to different mounts is
/// reported as [`FsError::Unsupported`] rather than attempted as a copy.
pub fn rename(from: &str, to: &str) -> FsResult<()> {
	let mut vfs = VFS.lock();
	let (from_mount, from_rel) = resolve(&vfs.mounts, from).ok_or(FsError::InvalidPath)?;
	let (to_mount, to_rel) = resolve(&vfs.mounts, to).ok_or(FsError::InvalidPath)?;
	if from_mount != to_mount {
		return Err(FsError::Unsupported);
	}
	vfs.mounts[from_mount].fs.rename(&from_rel, &to_rel)
}

pub fn is_directory(path: &str) -> bool {
	stat(path).map(|s| s.is_directory).unwrap_or(false)
}

pub fn exists(path: &str) -> bool {
	stat(path).is_ok()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn normalize_collapses_separators_and_drops_trailing_slash() {
		assert_eq!(normalize("/a//b/"), "/a/b");
		assert_eq!(normalize(""), "/");
		assert_eq!(normalize("/"), "/");
	}

	#[test]
	fn resolve_picks_longest_matching_mount() {
		let mounts = alloc::vec![
			Mount { path: String::from("/"), fs: Box::new(Ramfs::new()) },
			Mount { path: String::from("/mnt/usb"), fs: Box::new(Ramfs::new()) },
		];
		let (index, rel) = resolve(&mounts, "/mnt/usb/file.txt").unwrap();
		assert_eq!(index, 1);
		assert_eq!(rel, "/file.txt");

		let (index, rel) = resolve(&mounts, "/etc/passwd").unwrap();
		assert_eq!(index, 0);
		assert_eq!(rel, "/etc/passwd");
	}
}
