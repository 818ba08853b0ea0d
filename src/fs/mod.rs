/*
 * This file is part of Kestrel. See the license notice in `src/kernel.rs`.
 */

//! Filesystem abstraction: the error taxonomy, directory/open-mode/stat types, and the
//! [`Filesystem`] trait every driver ([`fat32`] and [`ramfs`]) implements. [`vfs`] is the
//! only caller that should ever touch a driver directly.

pub mod fat32;
pub mod ramfs;
pub mod vfs;

use alloc::string::String;

/// Errors a filesystem operation can return, shared across every driver and the VFS
/// itself so callers never need to know which filesystem is mounted where.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FsError {
	NotFound,
	AlreadyExists,
	NotDirectory,
	IsDirectory,
	DirectoryNotEmpty,
	NoSpace,
	PermissionDenied,
	IOError,
	InvalidPath,
	Unsupported,
	BadHandle,
}

pub type FsResult<T> = Result<T, FsError>;

/// Flags drawn from the caller's requested open mode. `Create` is required to materialize
/// a nonexistent file; a missing `Write` or `Append` leaves the descriptor read-only.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpenMode {
	pub read: bool,
	pub write: bool,
	pub create: bool,
	pub append: bool,
	pub truncate: bool,
}

impl OpenMode {
	pub const fn read() -> Self {
		Self { read: true, write: false, create: false, append: false, truncate: false }
	}

	pub const fn write_create() -> Self {
		Self { read: false, write: true, create: true, append: false, truncate: true }
	}
}

/// A filesystem-internal handle, opaque to everything except the driver that issued it.
/// [`vfs`] pairs this with a mount index to build a system-wide file descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileHandle(pub u32);

/// A single `readdir` record.
#[derive(Clone, Debug)]
pub struct DirEntry {
	pub name: String,
	pub size: u32,
	pub is_directory: bool,
}

/// The result of `stat`.
#[derive(Clone, Copy, Debug)]
pub struct Stat {
	pub size: u32,
	pub is_directory: bool,
}

/// An open directory-listing stream, opaque like [`FileHandle`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DirHandle(pub u32);

/// The operations a mountable filesystem driver must implement. A driver owns no block
/// device reference until [`Filesystem::mount`] gives it one (RAMFS never gets one).
pub trait Filesystem: Send {
	fn mount(&mut self, device_index: Option<usize>) -> FsResult<()>;
	fn unmount(&mut self);

	fn open(&mut self, path: &str, mode: OpenMode) -> FsResult<FileHandle>;
	fn close(&mut self, handle: FileHandle);
	fn read(&mut self, handle: FileHandle, buf: &mut [u8]) -> FsResult<usize>;
	fn write(&mut self, handle: FileHandle, buf: &[u8]) -> FsResult<usize>;
	fn seek(&mut self, handle: FileHandle, absolute_offset: u32) -> FsResult<()>;

	fn opendir(&mut self, path: &str) -> FsResult<DirHandle>;
	fn readdir(&mut self, handle: DirHandle) -> FsResult<DirEntry>;
	fn closedir(&mut self, handle: DirHandle);

	fn stat(&mut self, path: &str) -> FsResult<Stat>;
	fn mkdir(&mut self, path: &str) -> FsResult<()>;
	fn unlink(&mut self, path: &str) -> FsResult<()>;
	fn rmdir(&mut self, path: &str) -> FsResult<()>;
	fn rename(&mut self, from: &str, to: &str) -> FsResult<()>;

	fn is_directory(&mut self, path: &str) -> bool {
		matches!(self.stat(path), Ok(s) if s.is_directory)
	}

	fn exists(&mut self, path: &str) -> bool {
		self.stat(path).is_ok()
	}
}

/// Splits an absolute or relative path into non-empty components, ignoring both `/` and
/// `\` separators and collapsing repeats, the way the original FAT32 walker does.
pub(crate) fn split_path(path: &str) -> impl Iterator<Item = &str> {
	path.split(['/', '\\']).filter(|c| !c.is_empty())
}

/// Splits `path` into its parent directory (as joined components, no leading slash) and
/// final component. Used by `create`/`unlink`/`rmdir` to find the containing directory.
pub(crate) fn split_parent(path: &str) -> (alloc::vec::Vec<&str>, Option<&str>) {
	let mut components: alloc::vec::Vec<&str> = split_path(path).collect();
	let last = components.pop();
	(components, last)
}
