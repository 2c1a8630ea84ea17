/*
 * Copyright 2024 Luc Lenôtre
 *
 * This file is part of Maestro.
 *
 * Maestro is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * Maestro is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * Maestro. If not, see <https://www.gnu.org/licenses/>.
 */

//! Per-process file descriptor table: first-fit slot reuse over shared open-file handles.
//!
//! Adapted from the reference `FileDescriptorTable` design: a `Vec<Option<FileDescriptor>>`
//! indexed by fd, where duplicated descriptors share one `Arc<Mutex<FileHandle>>` (and therefore
//! one cursor position), exactly like a real `dup`.

use crate::fs::{Fs, InodeRef};
use std::cmp::max;
use std::sync::{Arc, Mutex};
use utils::errno;
use utils::errno::EResult;
use utils::limits::OPEN_MAX;

/// File descriptor flag: close this descriptor across a future `exec`.
pub const FD_CLOEXEC: i32 = 1;

/// Fds below this are reserved for stdin/stdout and never handed out by [`FileDescriptorTable::create_fd`].
pub const RESERVED_FDS: u32 = 2;

/// An open file description: the inode it refers to, and a cursor position private to this
/// description (shared by every fd that `dup`s it, independent from any other `open` of the same
/// inode).
pub struct FileHandle {
	pub inode: InodeRef,
	pub position: u64,
	pub deny_write_registered: bool,
}

/// One process's view of an open file description: per-fd flags plus the shared handle.
#[derive(Clone)]
pub struct FileDescriptor {
	pub flags: i32,
	file: Arc<Mutex<FileHandle>>,
}

impl FileDescriptor {
	fn new(flags: i32, inode: InodeRef) -> Self {
		Self {
			flags,
			file: Arc::new(Mutex::new(FileHandle {
				inode,
				position: 0,
				deny_write_registered: false,
			})),
		}
	}

	/// The shared open-file handle.
	pub fn handle(&self) -> &Arc<Mutex<FileHandle>> {
		&self.file
	}

	/// Closes this descriptor. If it was the last reference to the open file description, closes
	/// the underlying inode too.
	fn close(self, fs: &Fs) -> EResult<()> {
		let Some(handle) = Arc::into_inner(self.file) else {
			return Ok(());
		};
		let handle = handle.into_inner().unwrap();
		if handle.deny_write_registered {
			fs.allow_write(&handle.inode);
		}
		fs.close(handle.inode)
	}
}

/// Constraint on a newly duplicated file descriptor's numeric id.
pub enum NewFdConstraint {
	None,
	Fixed(u32),
	Min(u32),
}

/// A process's file descriptor table.
#[derive(Default)]
pub struct FileDescriptorTable(Vec<Option<FileDescriptor>>);

impl FileDescriptorTable {
	fn available(&self, min: u32) -> EResult<u32> {
		let min = min as usize;
		let hole = if min < self.0.len() {
			self.0[min..].iter().position(Option::is_none).map(|i| (min + i) as u32)
		} else {
			None
		};
		match hole {
			Some(fd) => Ok(fd),
			None => {
				let id = max(self.0.len(), min) as u32;
				if id < OPEN_MAX {
					Ok(id)
				} else {
					Err(errno!(EBADF))
				}
			}
		}
	}

	fn extend(&mut self, id: u32) {
		let id = id as usize;
		if id >= self.0.len() {
			self.0.resize_with(id + 1, || None);
		}
	}

	/// Opens `inode` as a new fd (the lowest available id at or above [`RESERVED_FDS`]), returning
	/// it alongside its id.
	pub fn create_fd(&mut self, flags: i32, inode: InodeRef) -> EResult<u32> {
		let id = self.available(RESERVED_FDS)?;
		self.extend(id);
		self.0[id as usize] = Some(FileDescriptor::new(flags, inode));
		Ok(id)
	}

	/// Returns the descriptor for `id`, if open.
	pub fn get(&self, id: u32) -> EResult<&FileDescriptor> {
		self.0
			.get(id as usize)
			.and_then(Option::as_ref)
			.ok_or_else(|| errno!(EBADF))
	}

	/// Duplicates the descriptor at `id` under a new id chosen per `constraint`.
	pub fn duplicate_fd(&mut self, id: u32, constraint: NewFdConstraint, cloexec: bool) -> EResult<u32> {
		let new_id = match constraint {
			NewFdConstraint::None => self.available(0)?,
			NewFdConstraint::Fixed(id) => {
				if id >= OPEN_MAX {
					return Err(errno!(EBADF));
				}
				id
			}
			NewFdConstraint::Min(min) => self.available(min)?,
		};
		let mut new_fd = self.get(id)?.clone();
		new_fd.flags = if cloexec { FD_CLOEXEC } else { 0 };
		self.extend(new_id);
		self.0[new_id as usize] = Some(new_fd);
		Ok(new_id)
	}

	/// Closes the descriptor at `id`.
	pub fn close_fd(&mut self, fs: &Fs, id: u32) -> EResult<()> {
		let slot = self.0.get_mut(id as usize).ok_or_else(|| errno!(EBADF))?;
		let fd = slot.take().ok_or_else(|| errno!(EBADF))?;
		if let Some(new_len) = self.0.iter().rposition(Option::is_some).map(|i| i + 1) {
			self.0.truncate(new_len);
		} else {
			self.0.clear();
		}
		fd.close(fs)
	}

	/// Closes every descriptor still open, e.g. on process exit.
	pub fn close_all(&mut self, fs: &Fs) -> EResult<()> {
		for fd in self.0.drain(..).flatten() {
			fd.close(fs)?;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::blockdev::{MemBlockDevice, Role};
	use crate::cfg::FsConfig;
	use crate::fs::Fs;

	fn fixture() -> Fs {
		let dev = MemBlockDevice::new(Role::Fs, 512, 64);
		Fs::format(Box::new(dev), FsConfig::default()).unwrap()
	}

	#[test]
	fn fds_reuse_the_lowest_free_slot() {
		let fs = fixture();
		let mut fds = FileDescriptorTable::default();
		let a = fds.create_fd(0, fs.root().unwrap()).unwrap();
		let b = fds.create_fd(0, fs.root().unwrap()).unwrap();
		assert_eq!((a, b), (RESERVED_FDS, RESERVED_FDS + 1));
		fds.close_fd(&fs, a).unwrap();
		let c = fds.create_fd(0, fs.root().unwrap()).unwrap();
		assert_eq!(c, RESERVED_FDS);
		fds.close_all(&fs).unwrap();
	}

	#[test]
	fn duplicate_shares_the_cursor() {
		let fs = fixture();
		let mut fds = FileDescriptorTable::default();
		let a = fds.create_fd(0, fs.root().unwrap()).unwrap();
		let b = fds.duplicate_fd(a, NewFdConstraint::None, false).unwrap();
		fds.get(a).unwrap().handle().lock().unwrap().position = 42;
		assert_eq!(fds.get(b).unwrap().handle().lock().unwrap().position, 42);
		fds.close_all(&fs).unwrap();
	}
}
