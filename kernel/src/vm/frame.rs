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

//! Global frame table: the physical-page allocator's user-page pool, with second-chance FIFO
//! clock eviction into swap or back to a backing file.

use crate::vm::page::{PageHandle, PageType};
use crate::vm::swap::Swap;
use log::{debug, trace};
use std::sync::{Arc, Mutex};
use utils::errno::EResult;

struct Slot {
	content: Vec<u8>,
	owner: Option<PageHandle>,
}

/// An ordered pool of up to `capacity` physical frames, shared by every process's supplemental
/// page table.
pub struct FrameTable {
	slots: Mutex<Vec<Slot>>,
	clock_hand: Mutex<usize>,
	capacity: usize,
	page_size: usize,
	swap: Arc<Swap>,
}

impl FrameTable {
	/// Creates an empty frame table that grows lazily up to `capacity` frames of `page_size`
	/// bytes, evicting to `swap` once full.
	pub fn new(capacity: usize, page_size: usize, swap: Arc<Swap>) -> Self {
		Self {
			slots: Mutex::new(Vec::new()),
			clock_hand: Mutex::new(0),
			capacity,
			page_size,
			swap,
		}
	}

	/// Allocates a frame, zero-filling it if `zero` is set. Evicts a victim and retries once if
	/// the table is already at capacity.
	pub fn allocate(&self, zero: bool) -> EResult<usize> {
		if let Some(idx) = self.try_claim_free(zero) {
			return Ok(idx);
		}
		self.evict()?;
		Ok(self
			.try_claim_free(zero)
			.expect("eviction must free exactly one frame"))
	}

	fn try_claim_free(&self, zero: bool) -> Option<usize> {
		let mut slots = self.slots.lock().unwrap();
		if let Some(idx) = slots.iter().position(|s| s.owner.is_none()) {
			if zero {
				slots[idx].content.fill(0);
			}
			return Some(idx);
		}
		if slots.len() < self.capacity {
			slots.push(Slot {
				content: vec![0u8; self.page_size],
				owner: None,
			});
			return Some(slots.len() - 1);
		}
		None
	}

	/// Attaches `page` as the owner of the frame at `idx`.
	pub fn attach(&self, idx: usize, page: PageHandle) {
		self.slots.lock().unwrap()[idx].owner = Some(page);
	}

	/// Runs `f` with mutable access to the frame's content buffer (used to fill it in on fault).
	pub fn read_into(&self, idx: usize, f: impl FnOnce(&mut [u8]) -> EResult<()>) -> EResult<()> {
		let mut slots = self.slots.lock().unwrap();
		f(&mut slots[idx].content)
	}

	/// Returns a copy of the frame's current content, for inspection or writeback.
	pub fn snapshot(&self, idx: usize) -> Vec<u8> {
		self.slots.lock().unwrap()[idx].content.clone()
	}

	/// Marks the given frame's content dirty (simulates the hardware dirty bit that real eviction
	/// reads).
	pub fn mark_dirty(&self, idx: usize, content: &[u8]) {
		self.slots.lock().unwrap()[idx].content.copy_from_slice(content);
	}

	/// Frees a specific frame, performing the same writeback-or-swap-or-discard decision as
	/// eviction. Used for explicit `munmap`/process-exit teardown.
	pub fn free(&self, idx: usize) -> EResult<()> {
		self.retire(idx)
	}

	fn find_evictable(&self) -> usize {
		loop {
			let slots = self.slots.lock().unwrap();
			let mut hand = self.clock_hand.lock().unwrap();
			let n = slots.len();
			assert!(n > 0, "eviction requested on an empty frame table");
			for _ in 0..n {
				let idx = *hand;
				*hand = (*hand + 1) % n;
				let Some(owner) = slots[idx].owner.clone() else {
					continue;
				};
				let mut p = owner.lock().unwrap();
				if p.accessed {
					p.accessed = false;
					continue;
				}
				drop(p);
				drop(hand);
				drop(slots);
				return idx;
			}
			// Every occupied frame had its accessed bit set; they were all cleared this pass, so
			// the next pass is guaranteed to find one.
		}
	}

	fn evict(&self) -> EResult<()> {
		let idx = self.find_evictable();
		debug!("frame table: evicting frame {idx}");
		self.retire(idx)
	}

	/// Writes back (if dirty + mmap), swaps out (if dirty + normal/writable-executable), or
	/// discards (read-only executable, or clean) the frame at `idx`, then detaches it from its
	/// owning page and marks the slot free.
	fn retire(&self, idx: usize) -> EResult<()> {
		let owner = {
			let slots = self.slots.lock().unwrap();
			slots[idx].owner.clone()
		};
		let Some(owner) = owner else {
			return Ok(());
		};
		let (type_, writable, dirty, file, file_offset, file_length) = {
			let p = owner.lock().unwrap();
			(p.type_, p.writable, p.dirty, p.file.clone(), p.file_offset, p.file_length)
		};
		let content = self.slots.lock().unwrap()[idx].content.clone();
		match type_ {
			PageType::Mmap if dirty => {
				if let Some(file) = &file {
					let len = file_length.min(self.page_size as u64) as usize;
					file.write_at(&content[..len], file_offset)?;
					trace!("frame {idx}: wrote back {len} dirty mmap bytes");
				}
			}
			PageType::Normal if dirty => {
				let sector = self.swap.write(&content)?;
				let mut p = owner.lock().unwrap();
				p.swapped = true;
				p.swap_sector = sector;
			}
			PageType::Executable if writable && dirty => {
				let sector = self.swap.write(&content)?;
				let mut p = owner.lock().unwrap();
				p.swapped = true;
				p.swap_sector = sector;
			}
			// Clean mmap pages, read-only executable pages, and clean normal pages (the last
			// being possible only just after eager allocation) need no writeback: drop them.
			_ => {}
		}
		owner.lock().unwrap().frame = None;
		self.slots.lock().unwrap()[idx].owner = None;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::blockdev::{MemBlockDevice, Role};
	use crate::vm::page::{BackingFile, SupplementalPageTable};

	struct RecordingFile(Mutex<Vec<u8>>);
	impl BackingFile for RecordingFile {
		fn read_at(&self, buf: &mut [u8], offset: u64) -> EResult<usize> {
			let data = self.0.lock().unwrap();
			let off = offset as usize;
			let n = buf.len().min(data.len().saturating_sub(off));
			buf[..n].copy_from_slice(&data[off..off + n]);
			Ok(n)
		}
		fn write_at(&self, buf: &[u8], offset: u64) -> EResult<usize> {
			let mut data = self.0.lock().unwrap();
			let off = offset as usize;
			if data.len() < off + buf.len() {
				data.resize(off + buf.len(), 0);
			}
			data[off..off + buf.len()].copy_from_slice(buf);
			Ok(buf.len())
		}
	}

	fn swap_fixture(page_size: usize, slots: u32) -> Arc<Swap> {
		let spl = page_size / 512;
		let dev = MemBlockDevice::new(Role::Swap, 512, spl as u32 * slots);
		Arc::new(Swap::new(Box::new(dev), page_size))
	}

	#[test]
	fn fills_up_to_capacity_before_evicting() {
		let page_size = 64;
		let swap = swap_fixture(page_size, 8);
		let frames = FrameTable::new(2, page_size, swap);
		let mut spt = SupplementalPageTable::new();
		let p1 = spt.page_create(&frames, 0x1000, true).unwrap();
		let p2 = spt.page_create(&frames, 0x2000, true).unwrap();
		assert_ne!(p1.lock().unwrap().frame, p2.lock().unwrap().frame);
	}

	#[test]
	fn dirty_normal_page_is_swapped_on_eviction() {
		let page_size = 64;
		let swap = swap_fixture(page_size, 8);
		let frames = FrameTable::new(1, page_size, swap);
		let mut spt = SupplementalPageTable::new();
		let p1 = spt.page_create(&frames, 0x1000, true).unwrap();
		let frame1 = p1.lock().unwrap().frame.unwrap();
		frames.mark_dirty(frame1, &[0xCCu8; 64]);
		p1.lock().unwrap().dirty = true;
		// Allocating a second page with the table at capacity 1 forces eviction of p1.
		let _p2 = spt.page_create(&frames, 0x2000, true).unwrap();
		let p1 = p1.lock().unwrap();
		assert!(p1.frame.is_none());
		assert!(p1.swapped);
	}

	#[test]
	fn dirty_mmap_page_is_written_back_on_eviction() {
		let page_size = 64;
		let swap = swap_fixture(page_size, 8);
		let frames = FrameTable::new(1, page_size, swap);
		let mut spt = SupplementalPageTable::new();
		let file = Arc::new(RecordingFile(Mutex::new(vec![0u8; 64])));
		let p1 = spt
			.page_create_mmap(0x3000, file.clone(), 0, 64)
			.unwrap();
		let frame1 = frames.allocate(true).unwrap();
		frames.attach(frame1, p1.clone());
		p1.lock().unwrap().frame = Some(frame1);
		frames.mark_dirty(frame1, &[0xABu8; 64]);
		p1.lock().unwrap().dirty = true;
		let _p2 = spt.page_create(&frames, 0x4000, true).unwrap();
		assert!(file.0.lock().unwrap().iter().all(|&b| b == 0xAB));
	}

	#[test]
	fn accessed_bit_grants_a_second_chance() {
		let page_size = 64;
		let swap = swap_fixture(page_size, 8);
		let frames = FrameTable::new(2, page_size, swap);
		let mut spt = SupplementalPageTable::new();
		let p1 = spt.page_create(&frames, 0x1000, true).unwrap();
		let p2 = spt.page_create(&frames, 0x2000, true).unwrap();
		p1.lock().unwrap().accessed = true;
		// Both frames occupied; p1 gets a second chance, p2 (not accessed) is evicted instead.
		let _p3 = spt.page_create(&frames, 0x3000, true).unwrap();
		assert!(p1.lock().unwrap().frame.is_some());
		assert!(p2.lock().unwrap().frame.is_none());
	}
}
