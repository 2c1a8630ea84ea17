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

//! Per-process virtual memory: supplemental page table, shared frame table, shared swap area,
//! and the page-fault entry point that ties them together.

pub mod frame;
pub mod page;
pub mod swap;

use crate::cfg::VmConfig;
use crate::vm::frame::FrameTable;
use crate::vm::page::{try_load, BackingFile, PageHandle, SupplementalPageTable};
use crate::vm::swap::Swap;
use std::sync::Arc;
use utils::errno;
use utils::errno::EResult;

/// How far below the recorded user stack pointer a fault is still considered legitimate stack
/// growth, in bytes. A generous margin (reference systems commonly use 32, the size of the
/// largest single stack-touching instruction's displacement) rather than a tight one.
const STACK_GROWTH_MARGIN: u64 = 32;

/// Maximum size the stack is allowed to grow to, in bytes, counted down from its top.
const MAX_STACK_SIZE: u64 = 8 * 1024 * 1024;

/// One process's virtual address space: its supplemental page table plus the shared frame table
/// and swap area it faults against.
pub struct VmSpace {
	pub pages: SupplementalPageTable,
	pub frames: Arc<FrameTable>,
	pub swap: Arc<Swap>,
	page_size: usize,
	stack_top: u64,
}

impl VmSpace {
	/// Creates an address space sharing the given (global) frame table and swap area.
	pub fn new(frames: Arc<FrameTable>, swap: Arc<Swap>, cfg: &VmConfig, stack_top: u64) -> Self {
		Self {
			pages: SupplementalPageTable::new(),
			frames,
			swap,
			page_size: cfg.page_size,
			stack_top,
		}
	}

	fn round_down(&self, vaddr: u64) -> u64 {
		vaddr & !(self.page_size as u64 - 1)
	}

	/// Simulates a hardware memory access to `vaddr`, standing in for the accessed/dirty bits a
	/// real page-fault handler would read off the hardware page table.
	pub fn touch(&self, vaddr: u64, write: bool) {
		if let Some(page) = self.pages.find(self.round_down(vaddr)) {
			let mut p = page.lock().unwrap();
			p.accessed = true;
			if write {
				p.dirty = true;
			}
		}
	}

	/// The page-fault entry point. `saved_esp` is the user stack pointer captured on syscall
	/// entry, used to judge stack-growth faults. Returns `Err(EFAULT)` for an address that is not
	/// a legitimate stack-growth candidate and has no supplemental page entry — the caller should
	/// terminate the process with exit status -1.
	pub fn fault(&mut self, vaddr: u64, saved_esp: u64) -> EResult<PageHandle> {
		let page_vaddr = self.round_down(vaddr);
		if let Some(page) = self.pages.find(page_vaddr) {
			try_load(&page, &self.frames, &self.swap, self.page_size)?;
			return Ok(page);
		}
		if vaddr == 0 {
			return Err(errno!(EFAULT));
		}
		let below_stack = self.stack_top.saturating_sub(vaddr) <= MAX_STACK_SIZE;
		let near_esp = saved_esp.saturating_sub(vaddr) <= STACK_GROWTH_MARGIN || vaddr >= saved_esp;
		if vaddr < self.stack_top && below_stack && near_esp {
			let page = self.pages.page_create(&self.frames, page_vaddr, true)?;
			return Ok(page);
		}
		Err(errno!(EFAULT))
	}

	/// Creates an eagerly-allocated, zero-filled writable page (e.g. the initial stack page).
	pub fn alloc_zero_page(&mut self, vaddr: u64, writable: bool) -> EResult<PageHandle> {
		self.pages.page_create(&self.frames, self.round_down(vaddr), writable)
	}

	/// Creates a lazy, write-back file mapping.
	pub fn map_file(
		&mut self,
		vaddr: u64,
		file: Arc<dyn BackingFile>,
		offset: u64,
		length: u64,
	) -> EResult<PageHandle> {
		self.pages
			.page_create_mmap(self.round_down(vaddr), file, offset, length)
	}

	/// Tears down a set of pages by virtual address, e.g. for `munmap`: each page's frame is
	/// released (written back to its file first if dirty, per [`FrameTable::free`]) and the
	/// entry is dropped from the supplemental table. Pages never faulted in are simply dropped.
	pub fn unmap(&mut self, vaddrs: &[u64]) -> EResult<()> {
		for &vaddr in vaddrs {
			let Some(page) = self.pages.take(vaddr) else {
				continue;
			};
			let frame = page.lock().unwrap().frame;
			if let Some(idx) = frame {
				self.frames.free(idx)?;
			}
		}
		Ok(())
	}

	/// Tears down the address space on process exit: every page's frame is released (mmap pages
	/// written back if dirty, swap slots freed), matching the per-page destruction documented for
	/// the supplemental page table.
	pub fn destroy(&mut self) -> EResult<()> {
		for page in self.pages.drain() {
			let (frame, swapped, swap_sector) = {
				let p = page.lock().unwrap();
				(p.frame, p.swapped, p.swap_sector)
			};
			if let Some(idx) = frame {
				self.frames.free(idx)?;
			} else if swapped {
				self.swap.free(swap_sector)?;
			}
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::blockdev::{MemBlockDevice, Role};

	fn fixture() -> (Arc<FrameTable>, Arc<Swap>, VmConfig) {
		let cfg = VmConfig {
			page_size: 64,
			frame_table_size: 4,
			swap_size_pages: 8,
		};
		let dev = MemBlockDevice::new(Role::Swap, 512, (cfg.page_size / 512).max(1) as u32 * cfg.swap_size_pages as u32);
		let swap = Arc::new(Swap::new(Box::new(dev), cfg.page_size));
		let frames = Arc::new(FrameTable::new(cfg.frame_table_size, cfg.page_size, swap.clone()));
		(frames, swap, cfg)
	}

	#[test]
	fn fault_near_stack_pointer_grows_the_stack() {
		let (frames, swap, cfg) = fixture();
		let stack_top = 0x1000u64;
		let mut vm = VmSpace::new(frames, swap, &cfg, stack_top);
		let esp = stack_top - 8;
		let page = vm.fault(stack_top - 16, esp).unwrap();
        assert!(page.lock().unwrap().frame.is_some());
	}

	#[test]
	fn fault_far_below_stack_is_fatal() {
		let (frames, swap, cfg) = fixture();
		let stack_top = 0x100000u64;
		let mut vm = VmSpace::new(frames, swap, &cfg, stack_top);
		let esp = stack_top - 8;
		match vm.fault(0, esp) {
			Err(e) => assert_eq!(e, errno!(EFAULT)),
			Ok(_) => panic!("expected EFAULT"),
		}
	}

	#[test]
	fn destroy_frees_frames_and_swap_slots() {
		let (frames, swap, cfg) = fixture();
		let mut vm = VmSpace::new(frames.clone(), swap, &cfg, 0x1000);
		vm.alloc_zero_page(0x500, true).unwrap();
		vm.destroy().unwrap();
		// The freed frame is immediately reusable.
		assert!(frames.allocate(false).is_ok());
	}
}
