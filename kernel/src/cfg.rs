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

//! Runtime configuration, deserializable from TOML.
//!
//! The original design fixes these as compile-time constants; here they are runtime config so
//! tests can shrink a filesystem down to a handful of sectors without touching the allocator
//! code.

use serde::Deserialize;
use utils::limits;

/// Filesystem-layer configuration.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct FsConfig {
	/// Size in bytes of one block-device sector.
	pub sector_size: u32,
	/// Number of direct block pointers per inode.
	pub direct_blocks: u32,
	/// Maximum length of one path component.
	pub name_max: u32,
	/// Maximum length of a whole path.
	pub max_path_length: u32,
}

impl Default for FsConfig {
	fn default() -> Self {
		Self {
			sector_size: limits::SECTOR_SIZE,
			direct_blocks: limits::DIRECT_BLOCKS as u32,
			name_max: limits::NAME_MAX as u32,
			max_path_length: limits::MAX_PATH_LENGTH as u32,
		}
	}
}

impl FsConfig {
	/// Returns `N`, the number of sector pointers held by one indirect block.
	pub fn indirect_count(&self) -> u32 {
		self.sector_size / 4
	}

	/// Returns the maximum file size representable by the indexed allocator: `(D + N + N^2) * S`.
	pub fn max_file_size(&self) -> u64 {
		let d = self.direct_blocks as u64;
		let n = self.indirect_count() as u64;
		(d + n + n * n) * self.sector_size as u64
	}

	/// Byte offset of the first indirect-block sector.
	pub fn direct_span(&self) -> u64 {
		self.direct_blocks as u64 * self.sector_size as u64
	}

	/// Byte offset of the first double-indirect sector.
	pub fn indirect_span(&self) -> u64 {
		self.direct_span() + self.indirect_count() as u64 * self.sector_size as u64
	}
}

/// Virtual-memory-layer configuration.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct VmConfig {
	/// Size in bytes of one virtual-memory page (and one swap-device sector group).
	pub page_size: usize,
	/// Number of frames in the global frame table.
	pub frame_table_size: usize,
	/// Number of page-sized slots in the swap area.
	pub swap_size_pages: usize,
}

impl Default for VmConfig {
	fn default() -> Self {
		Self {
			page_size: limits::PAGE_SIZE,
			frame_table_size: 32,
			swap_size_pages: 32,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_matches_reference_constants() {
		let cfg = FsConfig::default();
		assert_eq!(cfg.sector_size, 512);
		assert_eq!(cfg.direct_blocks, 122);
		assert_eq!(cfg.indirect_count(), 128);
		assert_eq!(cfg.max_file_size(), (122 + 128 + 128 * 128) * 512);
	}

	#[test]
	fn parses_from_toml() {
		let cfg: FsConfig = toml::from_str("sector_size = 64\ndirect_blocks = 4\n").unwrap();
		assert_eq!(cfg.sector_size, 64);
		assert_eq!(cfg.direct_blocks, 4);
		assert_eq!(cfg.name_max, 14);
	}
}
