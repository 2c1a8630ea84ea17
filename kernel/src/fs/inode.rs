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

//! On-disk inode layout, the open-inode cache, and the indexed block allocator
//! (`byte_to_sector`).

use crate::cfg::FsConfig;
use crate::fs::Fs;
use bytemuck::{Pod, Zeroable};
use log::{debug, trace, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use utils::errno;
use utils::errno::EResult;
use utils::limits::DIRECT_BLOCKS;

/// Fixed constant identifying a valid on-disk inode.
pub const INODE_MAGIC: u32 = 0x494e4f44;

/// The on-disk inode layout. Sized to exactly one reference sector (`DIRECT_BLOCKS = 122`,
/// sector size 512): `4*4 + 122*4 + 4*2 = 512` bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct OnDiskInode {
	/// Byte length of the file. Never observably negative.
	pub length: i32,
	/// Must equal [`INODE_MAGIC`] for a valid inode.
	pub magic: u32,
	/// Non-zero iff this inode is a directory.
	pub directory: u32,
	/// Sector of the parent directory inode; root's parent is itself.
	pub parent: u32,
	/// Direct block pointers, 0 meaning unallocated (sparse).
	pub direct: [u32; DIRECT_BLOCKS],
	/// Sector of the single-indirect block, or 0.
	pub indirect: u32,
	/// Sector of the double-indirect block, or 0.
	pub double_indirect: u32,
}

const _: () = assert!(std::mem::size_of::<OnDiskInode>() == 512);

impl OnDiskInode {
	fn zeroed(length: i32, directory: bool, parent: u32) -> Self {
		Self {
			length,
			magic: INODE_MAGIC,
			directory: directory as u32,
			parent,
			direct: [0; DIRECT_BLOCKS],
			indirect: 0,
			double_indirect: 0,
		}
	}

	/// Whether this inode describes a directory.
	pub fn is_directory(&self) -> bool {
		self.directory != 0
	}
}

struct InodeMeta {
	open_count: u32,
	removed: bool,
	deny_write_count: u32,
}

/// Cache entry for one open inode, keyed by its sector (invariant I1: at most one entry per
/// sector).
pub struct InodeEntry {
	sector: u32,
	meta: Mutex<InodeMeta>,
	disk: Mutex<OnDiskInode>,
	/// Per-inode lock guarding `byte_to_sector` mutation; held only for non-directory inodes
	/// (directories are serialized by the caller's filesystem-wide lock instead).
	io_lock: Mutex<()>,
}

impl InodeEntry {
	/// The sector identifying this inode.
	pub fn sector(&self) -> u32 {
		self.sector
	}

	/// Returns the current byte length of the file.
	pub fn length(&self) -> i64 {
		self.disk.lock().unwrap().length as i64
	}

	/// Whether this inode is a directory.
	pub fn is_directory(&self) -> bool {
		self.disk.lock().unwrap().is_directory()
	}

	/// Sector of the parent directory.
	pub fn parent(&self) -> u32 {
		self.disk.lock().unwrap().parent
	}

	/// Snapshot of the deny-write counter (T7).
	pub fn deny_write_count(&self) -> u32 {
		self.meta.lock().unwrap().deny_write_count
	}

	/// Snapshot of the open-reference counter (T1).
	pub fn open_count(&self) -> u32 {
		self.meta.lock().unwrap().open_count
	}
}

/// A reference-counted handle to an open inode. Obtained from [`Fs::open`]/[`Fs::create_open`],
/// released by [`Fs::close`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InodeRef(pub(crate) Arc<InodeEntry>);

impl std::fmt::Debug for InodeEntry {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("InodeEntry").field("sector", &self.sector).finish()
	}
}

impl PartialEq for InodeEntry {
	fn eq(&self, other: &Self) -> bool {
		self.sector == other.sector
	}
}

impl Eq for InodeEntry {}

impl InodeRef {
	/// The underlying cache entry.
	pub fn entry(&self) -> &InodeEntry {
		&self.0
	}

	/// The sector identifying this inode.
	pub fn sector(&self) -> u32 {
		self.0.sector
	}
}

/// The open-inode cache, keyed by sector.
#[derive(Default)]
pub struct OpenInodes {
	map: Mutex<HashMap<u32, Arc<InodeEntry>>>,
}

impl OpenInodes {
	pub(crate) fn new() -> Self {
		Self::default()
	}
}

fn n(cfg: &FsConfig) -> u64 {
	cfg.indirect_count() as u64
}

impl Fs {
	/// Writes a fresh, zero-length inode image to `sector`. Data blocks are not pre-allocated;
	/// they are allocated lazily on first write that touches them.
	pub fn create_inode(&self, sector: u32, length: i32, directory: bool, parent: u32) -> EResult<()> {
		let image = OnDiskInode::zeroed(length, directory, parent);
		self.write_inode_image(sector, &image)
	}

	pub(crate) fn write_inode_image(&self, sector: u32, image: &OnDiskInode) -> EResult<()> {
		self.dev.write(sector, bytemuck::bytes_of(image))
	}

	fn read_inode_image(&self, sector: u32) -> EResult<OnDiskInode> {
		let mut buf = vec![0u8; std::mem::size_of::<OnDiskInode>()];
		self.dev.read(sector, &mut buf)?;
		let image = bytemuck::pod_read_unaligned::<OnDiskInode>(&buf);
		if image.magic != INODE_MAGIC {
			warn!("inode at sector {sector} has bad magic {:#x}", image.magic);
			return Err(errno!(EIO));
		}
		Ok(image)
	}

	/// Opens the inode at `sector`. If it is already cached, increments its reference count and
	/// returns the shared handle (failing if it has been removed — I3). Otherwise reads it from
	/// disk and installs a fresh cache entry with count 1.
	pub fn open(&self, sector: u32) -> EResult<InodeRef> {
		let mut map = self.open_inodes.map.lock().unwrap();
		if let Some(entry) = map.get(&sector) {
			let mut meta = entry.meta.lock().unwrap();
			if meta.removed {
				return Err(errno!(ENOENT));
			}
			meta.open_count += 1;
			trace!("inode {sector}: open_count -> {}", meta.open_count);
			return Ok(InodeRef(entry.clone()));
		}
		let image = self.read_inode_image(sector)?;
		let entry = Arc::new(InodeEntry {
			sector,
			meta: Mutex::new(InodeMeta {
				open_count: 1,
				removed: false,
				deny_write_count: 0,
			}),
			disk: Mutex::new(image),
			io_lock: Mutex::new(()),
		});
		map.insert(sector, entry.clone());
		debug!("inode {sector}: opened, cache miss");
		Ok(InodeRef(entry))
	}

	/// Closes `inode`. If this was the last reference, removes it from the cache; if it had been
	/// marked removed, releases all of its data blocks and its own sector back to the free-map.
	///
	/// The decrement and the cache eviction happen under one held `open_inodes.map` lock, so a
	/// concurrent [`Fs::open`] can never observe the entry between "decremented to zero" and
	/// "removed from the map" and resurrect it.
	pub fn close(&self, inode: InodeRef) -> EResult<()> {
		let sector = inode.0.sector;
		let mut map = self.open_inodes.map.lock().unwrap();
		let (open_count, removed) = {
			let mut meta = inode.0.meta.lock().unwrap();
			meta.open_count -= 1;
			(meta.open_count, meta.removed)
		};
		if open_count > 0 {
			return Ok(());
		}
		map.remove(&sector);
		drop(map);
		if removed {
			debug!("inode {sector}: last close of removed inode, freeing blocks");
			let image = *inode.0.disk.lock().unwrap();
			self.free_all_blocks(&image)?;
			self.free_map.lock().unwrap().release(sector, 1);
		}
		Ok(())
	}

	/// Marks `inode` removed. Data is not freed until the last close (I4).
	pub fn remove_inode(&self, inode: &InodeRef) {
		inode.0.meta.lock().unwrap().removed = true;
	}

	/// Disallows writes to `inode` (used while an executable is mapped). Enforces
	/// `deny_write_count <= open_count`.
	pub fn deny_write(&self, inode: &InodeRef) -> EResult<()> {
		let mut meta = inode.0.meta.lock().unwrap();
		if meta.deny_write_count >= meta.open_count {
			return Err(errno!(EBUSY));
		}
		meta.deny_write_count += 1;
		Ok(())
	}

	/// Re-allows writes to `inode` previously denied by [`Fs::deny_write`].
	pub fn allow_write(&self, inode: &InodeRef) {
		let mut meta = inode.0.meta.lock().unwrap();
		debug_assert!(meta.deny_write_count > 0);
		meta.deny_write_count = meta.deny_write_count.saturating_sub(1);
	}

	fn ensure_block(&self, ptr: &mut u32) -> EResult<()> {
		if *ptr != 0 {
			return Ok(());
		}
		let sector = self.free_map.lock().unwrap().allocate(1)?;
		let zero = vec![0u8; self.cfg.sector_size as usize];
		self.dev.write(sector, &zero)?;
		*ptr = sector;
		Ok(())
	}

	fn read_block(&self, sector: u32) -> EResult<Vec<u32>> {
		let mut buf = vec![0u8; self.cfg.sector_size as usize];
		self.dev.read(sector, &mut buf)?;
		Ok(buf.chunks_exact(4).map(bytemuck::pod_read_unaligned::<u32>).collect())
	}

	fn write_block(&self, sector: u32, block: &[u32]) -> EResult<()> {
		self.dev.write(sector, bytemuck::cast_slice(block))
	}

	/// Returns the sector containing `offset` within `inode`'s data, allocating pointers along
	/// the way (direct, then single-indirect, then double-indirect) if `create` is true and they
	/// are currently zero. Returns 0 for a sparse hole when `create` is false.
	pub fn byte_to_sector(&self, inode: &InodeRef, offset: u64, create: bool) -> EResult<u32> {
		let is_dir = inode.0.is_directory();
		let _guard = if !is_dir {
			Some(inode.0.io_lock.lock().unwrap())
		} else {
			None
		};
		self.byte_to_sector_locked(inode, offset, create)
	}

	fn byte_to_sector_locked(&self, inode: &InodeRef, offset: u64, create: bool) -> EResult<u32> {
		let cfg = &self.cfg;
		let s = cfg.sector_size as u64;
		let direct_span = cfg.direct_span();
		let indirect_span = cfg.indirect_span();
		let nn = n(cfg);

		if offset < direct_span {
			let idx = (offset / s) as usize;
			let mut disk = inode.0.disk.lock().unwrap();
			if disk.direct[idx] != 0 {
				return Ok(disk.direct[idx]);
			}
			if !create {
				return Ok(0);
			}
			let sector = self.free_map.lock().unwrap().allocate(1)?;
			disk.direct[idx] = sector;
			self.write_inode_image(inode.0.sector, &disk)?;
			return Ok(sector);
		}

		if offset < indirect_span {
			let idx = ((offset - direct_span) / s) as usize;
			let ind_sector = {
				let mut disk = inode.0.disk.lock().unwrap();
				if disk.indirect == 0 {
					if !create {
						return Ok(0);
					}
					self.ensure_block(&mut disk.indirect)?;
					self.write_inode_image(inode.0.sector, &disk)?;
				}
				disk.indirect
			};
			return self.block_ptr(ind_sector, idx, create);
		}

		if offset < cfg.max_file_size() {
			let rel = offset - indirect_span;
			let outer_idx = (rel / (nn * s)) as usize;
			let inner_idx = ((rel % (nn * s)) / s) as usize;
			let dbl_sector = {
				let mut disk = inode.0.disk.lock().unwrap();
				if disk.double_indirect == 0 {
					if !create {
						return Ok(0);
					}
					self.ensure_block(&mut disk.double_indirect)?;
					self.write_inode_image(inode.0.sector, &disk)?;
				}
				disk.double_indirect
			};
			let mut outer = self.read_block(dbl_sector)?;
			if outer[outer_idx] == 0 {
				if !create {
					return Ok(0);
				}
				self.ensure_block(&mut outer[outer_idx])?;
				self.write_block(dbl_sector, &outer)?;
			}
			let inner_sector = outer[outer_idx];
			return self.block_ptr(inner_sector, inner_idx, create);
		}

		Err(errno!(EOVERFLOW))
	}

	/// Reads, and if necessary allocates, the pointer at `idx` within the indirect block at
	/// `block_sector`.
	fn block_ptr(&self, block_sector: u32, idx: usize, create: bool) -> EResult<u32> {
		let mut block = self.read_block(block_sector)?;
		if block[idx] != 0 {
			return Ok(block[idx]);
		}
		if !create {
			return Ok(0);
		}
		let sector = self.free_map.lock().unwrap().allocate(1)?;
		block[idx] = sector;
		self.write_block(block_sector, &block)?;
		Ok(sector)
	}

	/// Reads up to `buf.len()` bytes from `inode` at `offset`, clipped to the file's length.
	/// Sparse sectors read as zeros without disk I/O.
	pub fn read_at(&self, inode: &InodeRef, buf: &mut [u8], offset: u64) -> EResult<usize> {
		let length = inode.0.length().max(0) as u64;
		let avail = length.saturating_sub(offset);
		let to_read = (buf.len() as u64).min(avail) as usize;
		let s = self.cfg.sector_size as u64;
		let mut done = 0usize;
		while done < to_read {
			let off = offset + done as u64;
			let sector_off = (off % s) as usize;
			let chunk = (s as usize - sector_off).min(to_read - done);
			let base = off - sector_off as u64;
			let sector = self.byte_to_sector(inode, base, false)?;
			if sector == 0 {
				buf[done..done + chunk].fill(0);
			} else if sector_off == 0 && chunk == s as usize {
				self.dev.read(sector, &mut buf[done..done + chunk])?;
			} else {
				let mut scratch = vec![0u8; s as usize];
				self.dev.read(sector, &mut scratch)?;
				buf[done..done + chunk].copy_from_slice(&scratch[sector_off..sector_off + chunk]);
			}
			done += chunk;
		}
		Ok(to_read)
	}

	/// Writes `buf` to `inode` at `offset`, growing `length` (and writing back the inode image)
	/// if the write extends past the current end of file. Returns the number of bytes actually
	/// written, which is short of `buf.len()` if `deny_write` is in effect or if allocation fails
	/// partway through.
	pub fn write_at(&self, inode: &InodeRef, buf: &[u8], offset: u64) -> EResult<usize> {
		if inode.0.meta.lock().unwrap().deny_write_count > 0 {
			return Ok(0);
		}
		let max_size = self.cfg.max_file_size();
		let avail = max_size.saturating_sub(offset);
		let to_write = (buf.len() as u64).min(avail) as usize;
		let s = self.cfg.sector_size as u64;
		let mut done = 0usize;
		while done < to_write {
			let off = offset + done as u64;
			let sector_off = (off % s) as usize;
			let chunk = (s as usize - sector_off).min(to_write - done);
			let base = off - sector_off as u64;
			let sector = match self.byte_to_sector(inode, base, true) {
				Ok(sector) if sector != 0 => sector,
				_ => break,
			};
			if sector_off == 0 && chunk == s as usize {
				self.dev.write(sector, &buf[done..done + chunk])?;
			} else {
				let mut scratch = vec![0u8; s as usize];
				self.dev.read(sector, &mut scratch)?;
				scratch[sector_off..sector_off + chunk].copy_from_slice(&buf[done..done + chunk]);
				self.dev.write(sector, &scratch)?;
			}
			done += chunk;
		}
		let new_len = offset + done as u64;
		let mut disk = inode.0.disk.lock().unwrap();
		if new_len > disk.length as u64 {
			disk.length = new_len as i32;
			self.write_inode_image(inode.0.sector, &disk)?;
		}
		Ok(done)
	}

	/// Releases every data sector reachable from `image` (direct, single- and double-indirect)
	/// to the free-map, including the block-pointer sectors themselves.
	fn free_all_blocks(&self, image: &OnDiskInode) -> EResult<()> {
		let mut fm = self.free_map.lock().unwrap();
		for &d in &image.direct {
			fm.release(d, 1);
		}
		if image.indirect != 0 {
			drop(fm);
			let block = self.read_block(image.indirect)?;
			fm = self.free_map.lock().unwrap();
			for &d in &block {
				fm.release(d, 1);
			}
			fm.release(image.indirect, 1);
		}
		if image.double_indirect != 0 {
			drop(fm);
			let outer = self.read_block(image.double_indirect)?;
			for &ind in &outer {
				if ind == 0 {
					continue;
				}
				let inner = self.read_block(ind)?;
				let mut fm = self.free_map.lock().unwrap();
				for &d in &inner {
					fm.release(d, 1);
				}
				fm.release(ind, 1);
			}
			fm = self.free_map.lock().unwrap();
			fm.release(image.double_indirect, 1);
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::blockdev::{MemBlockDevice, Role};
	use crate::fs::Fs;

	fn fixture(sectors: u32) -> Fs {
		let cfg = FsConfig::default();
		let dev = MemBlockDevice::new(Role::Fs, cfg.sector_size, sectors);
        let fs = Fs::format(Box::new(dev), cfg).unwrap();
        fs
	}

	#[test]
	fn create_open_close_roundtrip() {
		let fs = fixture(64);
		let sector = fs.free_map.lock().unwrap().allocate(1).unwrap();
		fs.create_inode(sector, 0, false, fs.root_sector()).unwrap();
		let h = fs.open(sector).unwrap();
		assert_eq!(h.entry().open_count(), 1);
		let h2 = fs.open(sector).unwrap();
		assert_eq!(h.entry().open_count(), 2);
		fs.close(h).unwrap();
		assert_eq!(h2.entry().open_count(), 1);
		fs.close(h2).unwrap();
	}

	#[test]
	fn removed_inode_frees_blocks_on_last_close() {
		let fs = fixture(256);
		let sector = fs.free_map.lock().unwrap().allocate(1).unwrap();
		fs.create_inode(sector, 0, false, fs.root_sector()).unwrap();
		let h = fs.open(sector).unwrap();
		let data = vec![0x42u8; fs.cfg.sector_size as usize * 3];
		fs.write_at(&h, &data, 0).unwrap();
		fs.remove_inode(&h);
		let h2 = fs.open(sector);
		assert!(h2.is_err(), "removed inode must not be reopenable (I3)");
		fs.close(h).unwrap();
		// All sectors, including the inode's own, are now free again.
		let fm = fs.free_map.lock().unwrap();
		assert!(!fm.is_used(sector));
	}

	#[test]
	fn read_past_eof_clips_to_zero() {
		let fs = fixture(64);
		let sector = fs.free_map.lock().unwrap().allocate(1).unwrap();
		fs.create_inode(sector, 0, false, fs.root_sector()).unwrap();
		let h = fs.open(sector).unwrap();
		fs.write_at(&h, b"hello", 0).unwrap();
		let mut buf = [0u8; 10];
		let n = fs.read_at(&h, &mut buf, 0).unwrap();
		assert_eq!(n, 5);
		assert_eq!(&buf[..5], b"hello");
		fs.close(h).unwrap();
	}

	#[test]
	fn sparse_region_reads_as_zero() {
		let fs = fixture(512);
		let sector = fs.free_map.lock().unwrap().allocate(1).unwrap();
		fs.create_inode(sector, 0, false, fs.root_sector()).unwrap();
		let h = fs.open(sector).unwrap();
		let s = fs.cfg.sector_size as u64;
		fs.write_at(&h, &[0xA5], s * 3).unwrap();
		let mut buf = vec![0xFFu8; s as usize];
		fs.read_at(&h, &mut buf, 0).unwrap();
		assert!(buf.iter().all(|&b| b == 0));
		fs.close(h).unwrap();
	}

	#[test]
	fn deny_write_blocks_writes_and_is_counted() {
		let fs = fixture(64);
		let sector = fs.free_map.lock().unwrap().allocate(1).unwrap();
		fs.create_inode(sector, 0, false, fs.root_sector()).unwrap();
		let h = fs.open(sector).unwrap();
		fs.deny_write(&h).unwrap();
		assert_eq!(h.entry().deny_write_count(), 1);
		let n = fs.write_at(&h, b"nope", 0).unwrap();
		assert_eq!(n, 0);
		fs.allow_write(&h);
		let n = fs.write_at(&h, b"ok", 0).unwrap();
		assert_eq!(n, 2);
		fs.close(h).unwrap();
	}

	#[test]
	fn boundary_at_direct_span_crosses_into_indirect() {
		let cfg = FsConfig::default();
		let d = cfg.direct_blocks as u64;
		let s = cfg.sector_size as u64;
		let sectors_needed = (d + 4) as u32 + 64;
		let fs = fixture(sectors_needed);
		let sector = fs.free_map.lock().unwrap().allocate(1).unwrap();
		fs.create_inode(sector, 0, false, fs.root_sector()).unwrap();
		let h = fs.open(sector).unwrap();
		let offset = d * s;
		fs.write_at(&h, &[0x5A], offset).unwrap();
		let mut one = [0u8; 1];
		fs.read_at(&h, &mut one, offset).unwrap();
		assert_eq!(one[0], 0x5A);
		assert_eq!(h.entry().length(), offset as i64 + 1);
		fs.close(h).unwrap();
	}
}
