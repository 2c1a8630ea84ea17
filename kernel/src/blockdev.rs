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

//! Block device abstraction: synchronous sector-addressed I/O.
//!
//! The real controller is out of scope; [`MemBlockDevice`] is the hosted stand-in used by every
//! test and by the demo `format`/mount path.

use std::sync::Mutex;
use utils::errno;
use utils::errno::EResult;

/// The role a block device plays, used only for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
	/// The filesystem volume.
	Fs,
	/// The swap area.
	Swap,
}

/// Synchronous, sector-addressed block I/O.
///
/// Implementors must treat `sector` as opaque beyond bounds-checking; `sector_size` is fixed for
/// the lifetime of the device.
pub trait BlockDevice: Send + Sync {
	/// Returns the size, in bytes, of one sector.
	fn sector_size(&self) -> u32;

	/// Returns the number of sectors on the device.
	fn sector_count(&self) -> u32;

	/// Reads the sector at `sector` into `buf`, which must be exactly `sector_size()` bytes.
	fn read(&self, sector: u32, buf: &mut [u8]) -> EResult<()>;

	/// Writes `buf`, which must be exactly `sector_size()` bytes, into the sector at `sector`.
	fn write(&self, sector: u32, buf: &[u8]) -> EResult<()>;
}

/// A [`BlockDevice`] backed by an in-memory buffer.
///
/// Stands in for the disk controller and swap controller alike in this hosted crate; real
/// persistence is out of scope.
pub struct MemBlockDevice {
	role: Role,
	sector_size: u32,
	data: Mutex<Vec<u8>>,
}

impl MemBlockDevice {
	/// Creates a new zero-filled block device of `sector_count` sectors of `sector_size` bytes
	/// each.
	pub fn new(role: Role, sector_size: u32, sector_count: u32) -> Self {
		Self {
			role,
			sector_size,
			data: Mutex::new(vec![0u8; sector_size as usize * sector_count as usize]),
		}
	}

	/// Returns the device's role.
	pub fn role(&self) -> Role {
		self.role
	}

	fn bounds_check(&self, sector: u32, buf_len: usize) -> EResult<(usize, usize)> {
		if buf_len != self.sector_size as usize {
			return Err(errno!(EINVAL));
		}
		let off = sector as usize * self.sector_size as usize;
		let end = off + self.sector_size as usize;
		if sector >= self.sector_count() {
			return Err(errno!(EINVAL));
		}
		Ok((off, end))
	}
}

impl BlockDevice for MemBlockDevice {
	fn sector_size(&self) -> u32 {
		self.sector_size
	}

	fn sector_count(&self) -> u32 {
		let data = self.data.lock().unwrap();
		(data.len() / self.sector_size as usize) as u32
	}

	fn read(&self, sector: u32, buf: &mut [u8]) -> EResult<()> {
		let (off, end) = self.bounds_check(sector, buf.len())?;
		let data = self.data.lock().unwrap();
		buf.copy_from_slice(&data[off..end]);
		Ok(())
	}

	fn write(&self, sector: u32, buf: &[u8]) -> EResult<()> {
		let (off, end) = self.bounds_check(sector, buf.len())?;
		let mut data = self.data.lock().unwrap();
		data[off..end].copy_from_slice(buf);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn read_back_what_was_written() {
		let dev = MemBlockDevice::new(Role::Fs, 512, 4);
		let mut buf = vec![0xAB; 512];
		dev.write(2, &buf).unwrap();
		buf.fill(0);
		dev.read(2, &mut buf).unwrap();
		assert!(buf.iter().all(|&b| b == 0xAB));
	}

	#[test]
	fn out_of_bounds_sector_fails() {
		let dev = MemBlockDevice::new(Role::Fs, 512, 4);
		let buf = vec![0u8; 512];
		assert_eq!(dev.write(4, &buf), Err(errno!(EINVAL)));
	}

	#[test]
	fn wrong_size_buffer_fails() {
		let dev = MemBlockDevice::new(Role::Fs, 512, 4);
		let buf = vec![0u8; 10];
		assert_eq!(dev.read(0, &mut buf.clone()), Err(errno!(EINVAL)));
		let _ = buf;
	}
}
