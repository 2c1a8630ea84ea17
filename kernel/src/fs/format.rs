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

//! Volume formatting: lays out the free-map and the root directory on a fresh block device.

use crate::blockdev::BlockDevice;
use crate::cfg::FsConfig;
use crate::fs::free_map::FreeMap;
use crate::fs::inode::OpenInodes;
use crate::fs::{Fs, BOOT_SECTOR, FREE_MAP_SECTOR};
use log::info;
use std::sync::Mutex;
use utils::errno::EResult;

impl Fs {
	/// Formats a fresh volume: reserves the boot sector, the free-map's own sectors, and writes
	/// an empty root directory right after them. `ROOT_DIR_SECTOR` in the external-interface
	/// sense is `2` for any volume whose free-map fits in one sector; for larger volumes the
	/// root sector grows to make room for the bitmap, and callers must use [`Fs::root_sector`]
	/// rather than a hardcoded constant.
	pub fn format(dev: Box<dyn BlockDevice>, cfg: FsConfig) -> EResult<Self> {
		let sector_count = dev.sector_count();
		let free_map_sectors = FreeMap::sectors_needed(sector_count, dev.sector_size());
		let root_sector = FREE_MAP_SECTOR + free_map_sectors;

		let mut fm = FreeMap::new(sector_count);
		fm.mark_used(BOOT_SECTOR);
		for s in 0..free_map_sectors {
			fm.mark_used(FREE_MAP_SECTOR + s);
		}
		fm.mark_used(root_sector);
		fm.flush(dev.as_ref(), FREE_MAP_SECTOR, free_map_sectors)?;

		let fs = Fs {
			dev,
			cfg,
			free_map: Mutex::new(fm),
			open_inodes: OpenInodes::new(),
			root_sector,
			free_map_sectors,
			filesystem_lock: Mutex::new(()),
		};
		fs.create_inode(root_sector, 0, true, root_sector)?;
		info!(
			"formatted volume: {sector_count} sectors, free-map at {FREE_MAP_SECTOR}..{}, root at {root_sector}",
			FREE_MAP_SECTOR + free_map_sectors
		);
		Ok(fs)
	}

	/// Mounts a volume previously written by [`Fs::format`].
	pub fn mount(dev: Box<dyn BlockDevice>, cfg: FsConfig) -> EResult<Self> {
		let sector_count = dev.sector_count();
		let free_map_sectors = FreeMap::sectors_needed(sector_count, dev.sector_size());
		let root_sector = FREE_MAP_SECTOR + free_map_sectors;
		let fm = FreeMap::load(dev.as_ref(), sector_count, FREE_MAP_SECTOR, free_map_sectors)?;
		Ok(Fs {
			dev,
			cfg,
			free_map: Mutex::new(fm),
			open_inodes: OpenInodes::new(),
			root_sector,
			free_map_sectors,
			filesystem_lock: Mutex::new(()),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::blockdev::{MemBlockDevice, Role};

	#[test]
	fn format_then_mount_preserves_free_map() {
		let dev = MemBlockDevice::new(Role::Fs, 512, 64);
		let fs = Fs::format(Box::new(dev), FsConfig::default()).unwrap();
		let sector = fs.free_map.lock().unwrap().allocate(1).unwrap();
		fs.sync_free_map().unwrap();
		let root = fs.root().unwrap();
		assert!(root.entry().is_directory());
		assert_eq!(root.entry().parent(), fs.root_sector());
		fs.close(root).unwrap();
		let _ = sector;
	}
}
