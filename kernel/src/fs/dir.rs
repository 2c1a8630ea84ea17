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

//! Directory operations: entries are fixed-size records packed into an ordinary inode's data.

use crate::fs::dirent::{decode, encode, validate_name, DirEntry, ENTRY_SIZE};
use crate::fs::inode::InodeRef;
use crate::fs::Fs;
use utils::errno;
use utils::errno::EResult;

fn entry_count(dir: &InodeRef) -> u64 {
	dir.entry().length() as u64 / ENTRY_SIZE as u64
}

fn read_entry(fs: &Fs, dir: &InodeRef, idx: u64) -> EResult<DirEntry> {
	let mut buf = [0u8; ENTRY_SIZE];
	fs.read_at(dir, &mut buf, idx * ENTRY_SIZE as u64)?;
	Ok(decode(&buf))
}

fn write_entry(fs: &Fs, dir: &InodeRef, idx: u64, entry: &DirEntry) -> EResult<()> {
	let bytes = encode(entry);
	let n = fs.write_at(dir, &bytes, idx * ENTRY_SIZE as u64)?;
	if n != ENTRY_SIZE {
		return Err(errno!(ENOSPC));
	}
	Ok(())
}

fn find_by_name(fs: &Fs, dir: &InodeRef, name: &str) -> EResult<Option<(u64, DirEntry)>> {
	let count = entry_count(dir);
	for idx in 0..count {
		let entry = read_entry(fs, dir, idx)?;
		if entry.is_in_use() && entry.name() == name {
			return Ok(Some((idx, entry)));
		}
	}
	Ok(None)
}

/// Inserts a new entry named `name` in `dir`, creating a fresh inode of `size` bytes for it.
///
/// Rejects empty names, `.`/`..`, names over `NAME_MAX`, and duplicates. Reuses the first free
/// slot before extending the directory. Rolls back the reserved inode sector if creation fails
/// partway through.
pub fn add(fs: &Fs, dir: &InodeRef, name: &str, is_dir: bool, size: u32) -> EResult<u32> {
	if !validate_name(name) {
		return Err(errno!(EINVAL));
	}
	if find_by_name(fs, dir, name)?.is_some() {
		return Err(errno!(EEXIST));
	}
	let count = entry_count(dir);
	let mut slot = count;
	for idx in 0..count {
		if !read_entry(fs, dir, idx)?.is_in_use() {
			slot = idx;
			break;
		}
	}
	let inode_sector = fs.free_map_allocate(1)?;
	if let Err(e) = fs.create_inode(inode_sector, size as i32, is_dir, dir.sector()) {
		fs.free_map_release(inode_sector, 1);
		return Err(e);
	}
	let entry = DirEntry::new(inode_sector, name);
	if let Err(e) = write_entry(fs, dir, slot, &entry) {
		fs.free_map_release(inode_sector, 1);
		return Err(e);
	}
	Ok(inode_sector)
}

/// Resolves `name` within `dir`: `.` reopens `dir` itself, `..` opens the stored parent sector,
/// otherwise the matching entry's inode is opened.
pub fn lookup(fs: &Fs, dir: &InodeRef, name: &str) -> EResult<InodeRef> {
	match name {
		"." => fs.open(dir.sector()),
		".." => fs.open(dir.entry().parent()),
		_ => match find_by_name(fs, dir, name)? {
			Some((_, entry)) => fs.open(entry.inode_sector),
			None => Err(errno!(ENOENT)),
		},
	}
}

/// Returns whether `dir` contains no live entries (ignoring the synthesized `.`/`..`).
pub fn is_empty(fs: &Fs, dir: &InodeRef) -> EResult<bool> {
	let count = entry_count(dir);
	for idx in 0..count {
		if read_entry(fs, dir, idx)?.is_in_use() {
			return Ok(false);
		}
	}
	Ok(true)
}

/// Removes `name` from `dir`. Refuses to remove the root directory or a non-empty directory.
/// Marks the entry free, then marks the target inode removed; block reclamation happens on the
/// target's last close, so other open handles on it are unaffected.
pub fn remove(fs: &Fs, dir: &InodeRef, name: &str) -> EResult<()> {
	if name == "." || name == ".." {
		return Err(errno!(EPERM));
	}
	let (idx, entry) = find_by_name(fs, dir, name)?.ok_or_else(|| errno!(ENOENT))?;
	if entry.inode_sector == fs.root_sector() {
		return Err(errno!(EPERM));
	}
	let target = fs.open(entry.inode_sector)?;
	if target.entry().is_directory() && !is_empty(fs, &target)? {
		fs.close(target)?;
		return Err(errno!(ENOTEMPTY));
	}
	let mut cleared = entry;
	cleared.in_use = 0;
	write_entry(fs, dir, idx, &cleared)?;
	fs.remove_inode(&target);
	fs.close(target)?;
	Ok(())
}

/// Advances a read cursor over `dir`'s entries, skipping freed slots, and returns the next live
/// entry's name.
pub fn readdir(fs: &Fs, dir: &InodeRef, pos: &mut u64) -> EResult<Option<String>> {
	let count = entry_count(dir);
	loop {
		let idx = *pos / ENTRY_SIZE as u64;
		if idx >= count {
			return Ok(None);
		}
		let entry = read_entry(fs, dir, idx)?;
		*pos += ENTRY_SIZE as u64;
		if entry.is_in_use() {
			return Ok(Some(entry.name().to_string()));
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::blockdev::{MemBlockDevice, Role};
	use crate::cfg::FsConfig;

	fn fixture() -> Fs {
		let dev = MemBlockDevice::new(Role::Fs, 512, 256);
		Fs::format(Box::new(dev), FsConfig::default()).unwrap()
	}

	#[test]
	fn add_lookup_roundtrip() {
		let fs = fixture();
		let root = fs.root().unwrap();
		let sector = add(&fs, &root, "file", false, 0).unwrap();
		let found = lookup(&fs, &root, "file").unwrap();
		assert_eq!(found.sector(), sector);
		fs.close(found).unwrap();
		fs.close(root).unwrap();
	}

	#[test]
	fn duplicate_name_rejected() {
		let fs = fixture();
		let root = fs.root().unwrap();
		add(&fs, &root, "a", false, 0).unwrap();
		assert_eq!(add(&fs, &root, "a", false, 0), Err(errno!(EEXIST)));
		fs.close(root).unwrap();
	}

	#[test]
	fn dot_and_dotdot_resolve_without_scanning() {
		let fs = fixture();
		let root = fs.root().unwrap();
		let dot = lookup(&fs, &root, ".").unwrap();
		assert_eq!(dot.sector(), root.sector());
		let dotdot = lookup(&fs, &root, "..").unwrap();
		assert_eq!(dotdot.sector(), root.sector());
		fs.close(dot).unwrap();
		fs.close(dotdot).unwrap();
		fs.close(root).unwrap();
	}

	#[test]
	fn remove_refuses_non_empty_directory() {
		let fs = fixture();
		let root = fs.root().unwrap();
		add(&fs, &root, "d", true, 0).unwrap();
		let d = lookup(&fs, &root, "d").unwrap();
		add(&fs, &d, "child", false, 0).unwrap();
		fs.close(d).unwrap();
		assert_eq!(remove(&fs, &root, "d"), Err(errno!(ENOTEMPTY)));
		fs.close(root).unwrap();
	}

	#[test]
	fn remove_refuses_root() {
		let fs = fixture();
		let root = fs.root().unwrap();
		assert_eq!(remove(&fs, &root, "."), Err(errno!(EPERM)));
		fs.close(root).unwrap();
	}

	#[test]
	fn readdir_skips_freed_slots() {
		let fs = fixture();
		let root = fs.root().unwrap();
		add(&fs, &root, "a", false, 0).unwrap();
		add(&fs, &root, "b", false, 0).unwrap();
		remove(&fs, &root, "a").unwrap();
		let mut pos = 0u64;
		let mut names = Vec::new();
		while let Some(name) = readdir(&fs, &root, &mut pos).unwrap() {
			names.push(name);
		}
		assert_eq!(names, vec!["b".to_string()]);
		fs.close(root).unwrap();
	}

	#[test]
	fn removed_file_survives_until_last_close() {
		let fs = fixture();
		let root = fs.root().unwrap();
		add(&fs, &root, "f", false, 0).unwrap();
		let h1 = lookup(&fs, &root, "f").unwrap();
		let h2 = lookup(&fs, &root, "f").unwrap();
		remove(&fs, &root, "f").unwrap();
		// h2 still usable even though the name is gone and removal was requested.
		fs.write_at(&h2, b"ok", 0).unwrap();
		fs.close(h1).unwrap();
		fs.close(h2).unwrap();
		fs.close(root).unwrap();
	}
}
