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

//! Fixed-size directory entry records, stored linearly in a directory inode's data.

use bytemuck::{Pod, Zeroable};
use utils::limits::NAME_MAX;

/// One directory entry record: `{inode_sector, name[NAME_MAX+1], in_use}`.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct DirEntry {
	/// Sector of the referenced inode. Meaningless if `in_use == 0`.
	pub inode_sector: u32,
	/// NUL-padded name, at most `NAME_MAX` bytes plus a terminator.
	pub name: [u8; NAME_MAX + 1],
	/// Non-zero iff this slot holds a live entry.
	pub in_use: u32,
}

pub const ENTRY_SIZE: usize = std::mem::size_of::<DirEntry>();

impl DirEntry {
	/// Builds a new in-use entry for `name` pointing at `inode_sector`.
	///
	/// Panics if `name` is longer than `NAME_MAX` bytes; callers validate this first.
	pub fn new(inode_sector: u32, name: &str) -> Self {
		assert!(name.len() <= NAME_MAX);
		let mut buf = [0u8; NAME_MAX + 1];
		buf[..name.len()].copy_from_slice(name.as_bytes());
		Self {
			inode_sector,
			name: buf,
			in_use: 1,
		}
	}

	/// Returns the stored name as a `&str`, up to the first NUL byte.
	pub fn name(&self) -> &str {
		let end = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
		std::str::from_utf8(&self.name[..end]).unwrap_or("")
	}

	/// Whether this slot holds a live entry.
	pub fn is_in_use(&self) -> bool {
		self.in_use != 0
	}

	fn as_bytes(&self) -> &[u8] {
		bytemuck::bytes_of(self)
	}

	fn from_bytes(bytes: &[u8]) -> Self {
		*bytemuck::from_bytes(bytes)
	}
}

pub(crate) fn encode(entry: &DirEntry) -> [u8; ENTRY_SIZE] {
	let mut out = [0u8; ENTRY_SIZE];
	out.copy_from_slice(entry.as_bytes());
	out
}

pub(crate) fn decode(bytes: &[u8]) -> DirEntry {
	DirEntry::from_bytes(bytes)
}

/// Validates a single path-component name: non-empty, not `.`/`..`, no `/`, within `NAME_MAX`.
pub fn validate_name(name: &str) -> bool {
	!name.is_empty()
		&& name != "."
		&& name != ".."
		&& !name.contains('/')
		&& name.len() <= NAME_MAX
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn name_at_max_length_is_accepted() {
		let name = "a".repeat(NAME_MAX);
		assert!(validate_name(&name));
		let entry = DirEntry::new(5, &name);
		assert_eq!(entry.name(), name);
	}

	#[test]
	fn name_over_max_length_is_rejected() {
		let name = "a".repeat(NAME_MAX + 1);
		assert!(!validate_name(&name));
	}

	#[test]
	fn dot_and_dotdot_are_reserved() {
		assert!(!validate_name("."));
		assert!(!validate_name(".."));
	}

	#[test]
	fn encode_decode_roundtrip() {
		let entry = DirEntry::new(42, "foo");
		let bytes = encode(&entry);
		let back = decode(&bytes);
		assert_eq!({ back.inode_sector }, 42);
		assert_eq!(back.name(), "foo");
		assert!(back.is_in_use());
	}
}
