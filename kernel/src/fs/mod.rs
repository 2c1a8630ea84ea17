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

//! The indexed on-disk filesystem: free-map, inode layer, directories and path resolution.

pub mod dir;
pub mod dirent;
pub mod format;
pub mod inode;
pub mod path;

use crate::blockdev::BlockDevice;
use crate::cfg::FsConfig;
use crate::fs::free_map::FreeMap;
pub use crate::fs::inode::InodeRef;
use crate::fs::inode::OpenInodes;
use std::sync::Mutex;

pub mod free_map;

/// Sector reserved for the boot block; never allocated to a file.
pub const BOOT_SECTOR: u32 = 0;
/// Sector where the free-map bitmap begins.
pub const FREE_MAP_SECTOR: u32 = 1;

/// A mounted filesystem volume: the block device, its configuration, the free-map, and the
/// open-inode cache. Global state is instantiated once, as `filesys_init`/`filesys_done` do in
/// the reference design.
pub struct Fs {
	dev: Box<dyn BlockDevice>,
	cfg: FsConfig,
	free_map: Mutex<FreeMap>,
	open_inodes: OpenInodes,
	root_sector: u32,
	free_map_sectors: u32,
	/// Serializes user-visible filesystem syscalls; outermost among the filesystem locks (§5).
	filesystem_lock: Mutex<()>,
}

impl Fs {
	/// Acquires the filesystem-wide syscall lock. Callers take this once, at the top of a
	/// user-visible filesystem syscall, and hold it for the syscall's whole body.
	pub fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
		self.filesystem_lock.lock().unwrap()
	}

	/// The sector of the root directory inode.
	pub fn root_sector(&self) -> u32 {
		self.root_sector
	}

	/// The filesystem configuration this volume was mounted with.
	pub fn config(&self) -> &FsConfig {
		&self.cfg
	}

	/// Opens the root directory.
	pub fn root(&self) -> utils::errno::EResult<InodeRef> {
		self.open(self.root_sector)
	}

	/// Persists the free-map back to its reserved sectors. Mirrors `filesys_done`.
	pub fn sync_free_map(&self) -> utils::errno::EResult<()> {
		let fm = self.free_map.lock().unwrap();
		fm.flush(self.dev.as_ref(), FREE_MAP_SECTOR, self.free_map_sectors)
	}

	/// Allocates `count` contiguous free sectors from the volume's free-map.
	pub fn free_map_allocate(&self, count: u32) -> utils::errno::EResult<u32> {
		self.free_map.lock().unwrap().allocate(count)
	}

	/// Releases `count` sectors starting at `sector` back to the volume's free-map.
	pub fn free_map_release(&self, sector: u32, count: u32) {
		self.free_map.lock().unwrap().release(sector, count)
	}
}
