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

//! Per-process supplemental page table: the kernel's record of how each virtual page is to be
//! materialized, and the page-fault entry point that consumes it.
//!
//! There is no hardware page table in this hosted crate (trap handling is out of scope), so the
//! "accessed"/"dirty" bits that the reference design reads from hardware are instead tracked
//! directly on [`Page`] and flipped by [`VmSpace::touch`], the stand-in for a real memory access.

use crate::vm::frame::FrameTable;
use crate::vm::swap::Swap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use utils::errno;
use utils::errno::EResult;

/// A file (or file-like object) a page can be lazily read from / written back to.
///
/// Decouples the virtual-memory layer from the filesystem layer's concrete types so it can be
/// exercised with an in-memory double in tests.
pub trait BackingFile: Send + Sync {
	/// Reads up to `buf.len()` bytes at `offset`.
	fn read_at(&self, buf: &mut [u8], offset: u64) -> EResult<usize>;
	/// Writes `buf` at `offset`.
	fn write_at(&self, buf: &[u8], offset: u64) -> EResult<usize>;
}

/// The role a page plays, determining its eviction and fault-in behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
	/// An anonymous (stack/heap) page: swapped out when evicted.
	Normal,
	/// A file-backed mapping: written back to `file` when dirty, never swapped.
	Mmap,
	/// A page of a loaded executable: read-only pages are simply discarded and re-read;
	/// writable variants behave like `Normal` on eviction.
	Executable,
}

/// One supplemental page table entry.
pub struct Page {
	/// Page-aligned virtual address.
	pub vaddr: u64,
	pub writable: bool,
	pub type_: PageType,
	pub file: Option<Arc<dyn BackingFile>>,
	pub file_offset: u64,
	pub file_length: u64,
	/// Index into the global [`FrameTable`], if materialized.
	pub frame: Option<usize>,
	pub swapped: bool,
	pub swap_sector: u32,
	pub accessed: bool,
	pub dirty: bool,
}

pub type PageHandle = Arc<Mutex<Page>>;

impl Page {
	fn new(vaddr: u64, writable: bool, type_: PageType) -> Self {
		Self {
			vaddr,
			writable,
			type_,
			file: None,
			file_offset: 0,
			file_length: 0,
			frame: None,
			swapped: false,
			swap_sector: 0,
			accessed: false,
			dirty: false,
		}
	}
}

/// Per-process mapping `vaddr -> page`. Only one page per `vaddr`.
#[derive(Default)]
pub struct SupplementalPageTable {
	pages: HashMap<u64, PageHandle>,
}

impl SupplementalPageTable {
	pub fn new() -> Self {
		Self::default()
	}

	fn insert(&mut self, page: Page) -> EResult<PageHandle> {
		if self.pages.contains_key(&page.vaddr) {
			return Err(errno!(EINVAL));
		}
		let vaddr = page.vaddr;
		let handle = Arc::new(Mutex::new(page));
		self.pages.insert(vaddr, handle.clone());
		Ok(handle)
	}

	/// Creates a `NORMAL` page and eagerly allocates a frame for it (used for the initial stack
	/// and zero-filled heap extensions).
	pub fn page_create(
		&mut self,
		frames: &FrameTable,
		vaddr: u64,
		writable: bool,
	) -> EResult<PageHandle> {
		let handle = self.insert(Page::new(vaddr, writable, PageType::Normal))?;
		let frame = frames.allocate(true)?;
		handle.lock().unwrap().frame = Some(frame);
		frames.attach(frame, handle.clone());
		Ok(handle)
	}

	/// Creates a lazily-loaded, write-back `MMAP` page.
	pub fn page_create_mmap(
		&mut self,
		vaddr: u64,
		file: Arc<dyn BackingFile>,
		offset: u64,
		length: u64,
	) -> EResult<PageHandle> {
		let mut page = Page::new(vaddr, true, PageType::Mmap);
		page.file = Some(file);
		page.file_offset = offset;
		page.file_length = length;
		self.insert(page)
	}

	/// Creates a lazily-loaded `EXECUTABLE` page; read-only pages are discarded (never swapped)
	/// on eviction, writable ones fall back to swap like a `NORMAL` page.
	pub fn page_create_executable(
		&mut self,
		vaddr: u64,
		file: Arc<dyn BackingFile>,
		offset: u64,
		length: u64,
		writable: bool,
	) -> EResult<PageHandle> {
		let mut page = Page::new(vaddr, writable, PageType::Executable);
		page.file = Some(file);
		page.file_offset = offset;
		page.file_length = length;
		self.insert(page)
	}

	/// Looks up the page covering page-aligned `vaddr`.
	pub fn find(&self, vaddr: u64) -> Option<PageHandle> {
		self.pages.get(&vaddr).cloned()
	}

	/// Removes and returns the page at `vaddr`, if any.
	pub fn take(&mut self, vaddr: u64) -> Option<PageHandle> {
		self.pages.remove(&vaddr)
	}

	/// All pages, for process-exit teardown.
	pub fn drain(&mut self) -> Vec<PageHandle> {
		self.pages.drain().map(|(_, p)| p).collect()
	}
}

/// The page-fault entry point: lazily materializes `page` into a frame.
///
/// A no-op if `page` already has a frame (a spurious/concurrent fault). Reads the content back
/// from swap if it was evicted there, or from `file` for `MMAP`/`EXECUTABLE` pages, zero-filling
/// any remainder of the page past `file_length`.
pub fn try_load(page: &PageHandle, frames: &FrameTable, swap: &Swap, page_size: usize) -> EResult<()> {
	let already_loaded = page.lock().unwrap().frame.is_some();
	if already_loaded {
		return Ok(());
	}
	let swapped = page.lock().unwrap().swapped;
	if swapped {
		let frame = frames.allocate(false)?;
		let swap_sector = page.lock().unwrap().swap_sector;
		frames.read_into(frame, |buf| swap.read(swap_sector, buf))?;
		let mut p = page.lock().unwrap();
		p.frame = Some(frame);
		p.swapped = false;
		p.dirty = true;
		drop(p);
		frames.attach(frame, page.clone());
		return Ok(());
	}
	let (type_, file, offset, length) = {
		let p = page.lock().unwrap();
		(p.type_, p.file.clone(), p.file_offset, p.file_length)
	};
	match type_ {
		PageType::Mmap | PageType::Executable => {
			let frame = frames.allocate(false)?;
			frames.read_into(frame, |buf| {
				buf.fill(0);
				if let Some(file) = &file {
					let n = length.min(page_size as u64) as usize;
					file.read_at(&mut buf[..n], offset)?;
				}
				Ok(())
			})?;
			page.lock().unwrap().frame = Some(frame);
			frames.attach(frame, page.clone());
			Ok(())
		}
		PageType::Normal => {
			// A normal page that is neither swapped nor already framed is a construction bug.
			Err(errno!(EINVAL))
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::cfg::VmConfig;

	struct MemFile(Mutex<Vec<u8>>);
	impl BackingFile for MemFile {
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

	fn fixture() -> (FrameTable, Arc<Swap>, usize) {
		let cfg = VmConfig::default();
		let dev = crate::blockdev::MemBlockDevice::new(
			crate::blockdev::Role::Swap,
			512,
			(cfg.page_size / 512) as u32 * cfg.swap_size_pages as u32,
		);
		let swap = Arc::new(Swap::new(Box::new(dev), cfg.page_size));
		let frames = FrameTable::new(cfg.frame_table_size, cfg.page_size, swap.clone());
		(frames, swap, cfg.page_size)
	}

	#[test]
	fn mmap_page_loads_file_content_and_zero_fills_tail() {
		let (frames, swap, page_size) = fixture();
		let file = Arc::new(MemFile(Mutex::new(b"hello".to_vec())));
		let mut spt = SupplementalPageTable::new();
		let page = spt.page_create_mmap(0x1000, file, 0, 5).unwrap();
		try_load(&page, &frames, &swap, page_size).unwrap();
		let frame = page.lock().unwrap().frame.unwrap();
		let content = frames.snapshot(frame);
		assert_eq!(&content[..5], b"hello");
		assert!(content[5..].iter().all(|&b| b == 0));
	}

	#[test]
	fn already_loaded_page_is_a_no_op() {
		let (frames, swap, page_size) = fixture();
		let mut spt = SupplementalPageTable::new();
		let page = spt.page_create(&frames, 0x2000, true).unwrap();
		assert!(page.lock().unwrap().frame.is_some());
		try_load(&page, &frames, &swap, page_size).unwrap();
	}
}
