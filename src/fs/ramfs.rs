/*
 * This file is part of Kestrel. See the license notice in `src/kernel.rs`.
 */

//! An in-memory filesystem: a flat table of entries, each carrying its own full path,
//! letting the shell and the test suite exercise the VFS without a disk behind it.
//!
//! Unlike the reference implementation's fixed `FileEntry[MAX_FILES]` array of
//! statically-sized byte buffers, entries here live in a `Vec` and each file's data is its
//! own `Vec<u8>` — this crate has a heap, so there is no reason to reserve a megabyte of
//! `.bss` per slot up front. The slot-reuse discipline (an `Empty` entry is eligible for a
//! future `create`) and the "full path stored per-entry" design are kept as-is.

use alloc::{
	format,
	string::{String, ToString},
	vec::Vec,
};

use crate::fs::{split_parent, split_path, DirEntry, DirHandle, FileHandle, FsError, FsResult, Stat};

const MAX_FILES: usize = crate::build_cfg!(ramfs_max_files);
const MAX_FILE_SIZE: usize = crate::build_cfg!(ramfs_max_file_size);

#[derive(Clone, Copy, PartialEq, Eq)]
enum Kind {
	Empty,
	File,
	Directory,
}

struct Entry {
	path: String,
	kind: Kind,
	data: Vec<u8>,
}

impl Entry {
	fn empty() -> Self {
		Self { path: String::new(), kind: Kind::Empty, data: Vec::new() }
	}
}

struct OpenFile {
	entry: usize,
	position: u32,
	valid: bool,
}

struct DirStream {
	entries: Vec<DirEntry>,
	position: usize,
	valid: bool,
}

/// Joins non-empty path components back into a canonical absolute path (`"/"` for the
/// root, `"/a/b"` for anything else, never a trailing slash).
fn normalize(path: &str) -> String {
	let components: Vec<&str> = split_path(path).collect();
	if components.is_empty() {
		String::from("/")
	} else {
		format!("/{}", components.join("/"))
	}
}

pub struct Ramfs {
	entries: Vec<Entry>,
	open_files: Vec<OpenFile>,
	dir_streams: Vec<DirStream>,
}

impl Ramfs {
	pub fn new() -> Self {
		Self { entries: Vec::new(), open_files: Vec::new(), dir_streams: Vec::new() }
	}

	fn find(&self, path: &str) -> Option<usize> {
		let target = normalize(path);
		self.entries.iter().position(|e| e.kind != Kind::Empty && e.path == target)
	}

	fn find_free_slot(&mut self) -> Option<usize> {
		if let Some(i) = self.entries.iter().position(|e| e.kind == Kind::Empty) {
			return Some(i);
		}
		if self.entries.len() >= MAX_FILES {
			return None;
		}
		self.entries.push(Entry::empty());
		Some(self.entries.len() - 1)
	}

	fn parent_of(&self, path: &str) -> Option<usize> {
		let normalized = normalize(path);
		let (components, _) = split_parent(&normalized);
		if components.is_empty() {
			return self.find("/");
		}
		let parent_path = format!("/{}", components.join("/"));
		self.find(&parent_path)
	}

	fn create_entry(&mut self, path: &str, kind: Kind) -> FsResult<usize> {
		let target = normalize(path);
		if target == "/" {
			return Err(FsError::AlreadyExists);
		}
		if self.find(&target).is_some() {
			return Err(FsError::AlreadyExists);
		}
		let Some(parent_index) = self.parent_of(&target) else {
			return Err(FsError::NotFound);
		};
		if self.entries[parent_index].kind != Kind::Directory {
			return Err(FsError::NotDirectory);
		}
		let Some(slot) = self.find_free_slot() else {
			return Err(FsError::NoSpace);
		};
		self.entries[slot] = Entry { path: target, kind, data: Vec::new() };
		Ok(slot)
	}

	fn is_descendant(&self, ancestor_path: &str, entry: &Entry) -> bool {
		if ancestor_path == "/" {
			return entry.path != "/";
		}
		entry.path.starts_with(ancestor_path) && entry.path.as_bytes().get(ancestor_path.len()) == Some(&b'/')
	}

	fn has_children(&self, dir_index: usize) -> bool {
		let dir_path = self.entries[dir_index].path.clone();
		self.entries.iter().any(|e| e.kind != Kind::Empty && self.is_descendant(&dir_path, e))
	}
}

impl Default for Ramfs {
	fn default() -> Self {
		Self::new()
	}
}

impl super::Filesystem for Ramfs {
	fn mount(&mut self, _device_index: Option<usize>) -> FsResult<()> {
		self.entries.clear();
		self.open_files.clear();
		self.dir_streams.clear();
		self.entries.push(Entry { path: String::from("/"), kind: Kind::Directory, data: Vec::new() });
		Ok(())
	}

	fn unmount(&mut self) {
		self.entries.clear();
		self.open_files.clear();
		self.dir_streams.clear();
	}

	fn open(&mut self, path: &str, mode: super::OpenMode) -> FsResult<FileHandle> {
		let entry_index = match self.find(path) {
			Some(i) => {
				if self.entries[i].kind == Kind::Directory {
					return Err(FsError::IsDirectory);
				}
				i
			}
			None => {
				if !mode.create {
					return Err(FsError::NotFound);
				}
				self.create_entry(path, Kind::File)?
			}
		};
		if mode.truncate {
			self.entries[entry_index].data.clear();
		}
		let position = if mode.append { self.entries[entry_index].data.len() as u32 } else { 0 };
		let slot = if let Some(i) = self.open_files.iter().position(|f| !f.valid) {
			self.open_files[i] = OpenFile { entry: entry_index, position, valid: true };
			i
		} else {
			self.open_files.push(OpenFile { entry: entry_index, position, valid: true });
			self.open_files.len() - 1
		};
		Ok(FileHandle(slot as u32))
	}

	fn close(&mut self, handle: FileHandle) {
		if let Some(f) = self.open_files.get_mut(handle.0 as usize) {
			f.valid = false;
		}
	}

	fn read(&mut self, handle: FileHandle, buf: &mut [u8]) -> FsResult<usize> {
		let f = self.open_files.get_mut(handle.0 as usize).filter(|f| f.valid).ok_or(FsError::BadHandle)?;
		let data = &self.entries[f.entry].data;
		let available = data.len().saturating_sub(f.position as usize);
		let n = buf.len().min(available);
		buf[..n].copy_from_slice(&data[f.position as usize..f.position as usize + n]);
		f.position += n as u32;
		Ok(n)
	}

	fn write(&mut self, handle: FileHandle, buf: &[u8]) -> FsResult<usize> {
		let f = self.open_files.get_mut(handle.0 as usize).filter(|f| f.valid).ok_or(FsError::BadHandle)?;
		let position = f.position as usize;
		let space_left = MAX_FILE_SIZE.saturating_sub(position);
		let n = buf.len().min(space_left);
		if n == 0 {
			return Ok(0);
		}
		let data = &mut self.entries[f.entry].data;
		if data.len() < position + n {
			data.resize(position + n, 0);
		}
		data[position..position + n].copy_from_slice(&buf[..n]);
		f.position += n as u32;
		Ok(n)
	}

	fn seek(&mut self, handle: FileHandle, absolute_offset: u32) -> FsResult<()> {
		let f = self.open_files.get_mut(handle.0 as usize).filter(|f| f.valid).ok_or(FsError::BadHandle)?;
		let len = self.entries[f.entry].data.len() as u32;
		if absolute_offset > len {
			return Err(FsError::InvalidPath);
		}
		f.position = absolute_offset;
		Ok(())
	}

	fn opendir(&mut self, path: &str) -> FsResult<DirHandle> {
		let dir_index = self.find(path).ok_or(FsError::NotFound)?;
		if self.entries[dir_index].kind != Kind::Directory {
			return Err(FsError::NotDirectory);
		}
		let dir_path = self.entries[dir_index].path.clone();
		let mut listing = Vec::new();
		for e in &self.entries {
			if e.kind == Kind::Empty || !self.is_descendant(&dir_path, e) {
				continue;
			}
			let rest = if dir_path == "/" { &e.path[1..] } else { &e.path[dir_path.len() + 1..] };
			if rest.contains('/') {
				continue;
			}
			listing.push(DirEntry {
				name: rest.to_string(),
				size: e.data.len() as u32,
				is_directory: e.kind == Kind::Directory,
			});
		}
		let slot = if let Some(i) = self.dir_streams.iter().position(|s| !s.valid) {
			self.dir_streams[i] = DirStream { entries: listing, position: 0, valid: true };
			i
		} else {
			self.dir_streams.push(DirStream { entries: listing, position: 0, valid: true });
			self.dir_streams.len() - 1
		};
		Ok(DirHandle(slot as u32))
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
		let i = self.find(path).ok_or(FsError::NotFound)?;
		let e = &self.entries[i];
		Ok(Stat { size: e.data.len() as u32, is_directory: e.kind == Kind::Directory })
	}

	fn mkdir(&mut self, path: &str) -> FsResult<()> {
		self.create_entry(path, Kind::Directory).map(|_| ())
	}

	fn unlink(&mut self, path: &str) -> FsResult<()> {
		let i = self.find(path).ok_or(FsError::NotFound)?;
		if self.entries[i].kind == Kind::Directory {
			return Err(FsError::IsDirectory);
		}
		self.entries[i] = Entry::empty();
		Ok(())
	}

	fn rmdir(&mut self, path: &str) -> FsResult<()> {
		let normalized = normalize(path);
		if normalized == "/" {
			return Err(FsError::PermissionDenied);
		}
		let i = self.find(path).ok_or(FsError::NotFound)?;
		if self.entries[i].kind != Kind::Directory {
			return Err(FsError::NotDirectory);
		}
		if self.has_children(i) {
			return Err(FsError::DirectoryNotEmpty);
		}
		self.entries[i] = Entry::empty();
		Ok(())
	}

	fn rename(&mut self, from: &str, to: &str) -> FsResult<()> {
		let from_path = normalize(from);
		let to_path = normalize(to);
		if from_path == "/" {
			return Err(FsError::PermissionDenied);
		}
		if self.find(&to_path).is_some() {
			return Err(FsError::AlreadyExists);
		}
		let i = self.find(from).ok_or(FsError::NotFound)?;
		if self.parent_of(&to_path).is_none() {
			return Err(FsError::NotFound);
		}
		let is_dir = self.entries[i].kind == Kind::Directory;
		if is_dir {
			let descendants: Vec<usize> = self
				.entries
				.iter()
				.enumerate()
				.filter(|(_, e)| e.kind != Kind::Empty && self.is_descendant(&from_path, e))
				.map(|(idx, _)| idx)
				.collect();
			for idx in descendants {
				let suffix = self.entries[idx].path[from_path.len()..].to_string();
				self.entries[idx].path = format!("{to_path}{suffix}");
			}
		}
		self.entries[i].path = to_path;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::fs::{Filesystem, OpenMode};

	#[test]
	fn write_then_read_round_trips() {
		let mut fs = Ramfs::new();
		fs.mount(None).unwrap();
		let fd = fs.open("/hello.txt", OpenMode::write_create()).unwrap();
		assert_eq!(fs.write(fd, b"hi there").unwrap(), 8);
		fs.close(fd);

		let fd = fs.open("/hello.txt", OpenMode::read()).unwrap();
		let mut buf = [0u8; 32];
		let n = fs.read(fd, &mut buf).unwrap();
		assert_eq!(&buf[..n], b"hi there");
	}

	#[test]
	fn mkdir_then_rmdir_removes_it() {
		let mut fs = Ramfs::new();
		fs.mount(None).unwrap();
		fs.mkdir("/docs").unwrap();
		assert!(fs.exists("/docs"));
		fs.rmdir("/docs").unwrap();
		assert!(!fs.exists("/docs"));
	}

	#[test]
	fn rmdir_refuses_non_empty_directory() {
		let mut fs = Ramfs::new();
		fs.mount(None).unwrap();
		fs.mkdir("/docs").unwrap();
		fs.open("/docs/a.txt", OpenMode::write_create()).unwrap();
		assert_eq!(fs.rmdir("/docs"), Err(FsError::DirectoryNotEmpty));
	}

	#[test]
	fn opendir_lists_direct_children_only() {
		let mut fs = Ramfs::new();
		fs.mount(None).unwrap();
		fs.mkdir("/docs").unwrap();
		fs.open("/docs/a.txt", OpenMode::write_create()).unwrap();
		fs.open("/docs/b.txt", OpenMode::write_create()).unwrap();
		fs.open("/top.txt", OpenMode::write_create()).unwrap();

		let dh = fs.opendir("/docs").unwrap();
		let mut names: Vec<String> = Vec::new();
		while let Ok(entry) = fs.readdir(dh) {
			names.push(entry.name);
		}
		names.sort();
		assert_eq!(names, alloc::vec![String::from("a.txt"), String::from("b.txt")]);
	}

	#[test]
	fn create_fails_once_table_is_full() {
		let mut fs = Ramfs::new();
		fs.mount(None).unwrap();
		for i in 0..(MAX_FILES - 1) {
			fs.create_entry(&format!("/f{i}"), Kind::File).unwrap();
		}
		assert_eq!(fs.create_entry("/overflow", Kind::File), Err(FsError::NoSpace));
	}

	#[test]
	fn rename_moves_directory_and_its_children() {
		let mut fs = Ramfs::new();
		fs.mount(None).unwrap();
		fs.mkdir("/old").unwrap();
		fs.open("/old/a.txt", OpenMode::write_create()).unwrap();
		fs.rename("/old", "/new").unwrap();
		assert!(!fs.exists("/old/a.txt"));
		assert!(fs.exists("/new/a.txt"));
	}
}
