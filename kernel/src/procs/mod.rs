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

//! Per-process state: the file descriptor table, the virtual address space, live `mmap`
//! regions, and the exec/wait protocol.
//!
//! The scheduler and ELF loader are out of scope (§1), so `exec` here does not load a binary: it
//! spawns a `std::thread` running a caller-supplied closure and wires it into the same
//! parent/child exit-status protocol the reference `process_execute`/`process_wait` implement
//! with `struct process_info` and a pair of semaphores — a `Mutex<Option<i32>>` plus `Condvar`
//! stand in for the semaphores since blocking here is an ordinary condvar wait, not a scheduler
//! yield.

pub mod fd;

use crate::fs::{Fs, InodeRef};
use crate::vm::frame::FrameTable;
use crate::vm::page::BackingFile;
use crate::vm::swap::Swap;
use crate::vm::VmSpace;
use crate::cfg::VmConfig;
use crate::procs::fd::FileDescriptorTable;
use log::{debug, info};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use utils::errno;
use utils::errno::EResult;

/// Process identifier. Monotonically increasing, never reused.
pub type Pid = u32;

fn next_pid() -> Pid {
	static COUNTER: AtomicU32 = AtomicU32::new(1);
	COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// The parent-observable record for one child: its exit status once known, and a condvar to wake
/// a parent blocked in `wait`. Mirrors the reference `struct process_info` (`alive_sema` ->
/// `Condvar`, `exit_status` field unchanged).
pub struct ProcessInfo {
	pid: Pid,
	name: String,
	exit_status: Mutex<Option<i32>>,
	cv: Condvar,
}

impl ProcessInfo {
	/// The process id this record describes.
	pub fn pid(&self) -> Pid {
		self.pid
	}

	/// The process's name, for diagnostics.
	pub fn name(&self) -> &str {
		&self.name
	}
}

/// A file a user re-opened (its own private `InodeRef`) purely so an `mmap` region can read/write
/// it independently of whatever fd the caller used to request the mapping, exactly as the
/// reference `process_mmap_file` calls `file_reopen` before building `struct mmap_file`.
struct FileBacking {
	fs: Arc<Fs>,
	inode: Mutex<Option<InodeRef>>,
}

impl BackingFile for FileBacking {
	fn read_at(&self, buf: &mut [u8], offset: u64) -> EResult<usize> {
		let guard = self.inode.lock().unwrap();
		let inode = guard.as_ref().ok_or(errno!(EBADF))?;
		self.fs.read_at(inode, buf, offset)
	}

	fn write_at(&self, buf: &[u8], offset: u64) -> EResult<usize> {
		let guard = self.inode.lock().unwrap();
		let inode = guard.as_ref().ok_or(errno!(EBADF))?;
		self.fs.write_at(inode, buf, offset)
	}
}

impl Drop for FileBacking {
	fn drop(&mut self) {
		if let Some(inode) = self.inode.get_mut().unwrap().take() {
			let _ = self.fs.close(inode);
		}
	}
}

/// One live `mmap`: the pages it installed, keyed by the map id returned to the caller. Dropping
/// this drops the last reference to its [`FileBacking`], closing the re-opened inode.
struct MmapRegion {
	vaddrs: Vec<u64>,
	_backing: Arc<FileBacking>,
}

/// Map id returned by [`mmap`], named by the reference's `mapid_t`.
pub type MapId = u32;

/// One process's complete syscall-visible state.
pub struct Process {
	pid: Pid,
	name: String,
	fs: Arc<Fs>,
	cwd: Mutex<InodeRef>,
	fds: Mutex<FileDescriptorTable>,
	vm: Mutex<VmSpace>,
	mmaps: Mutex<HashMap<MapId, MmapRegion>>,
	mmap_counter: AtomicU32,
	this_exec: Mutex<Option<InodeRef>>,
	children: Mutex<Vec<Arc<ProcessInfo>>>,
	info: Arc<ProcessInfo>,
	/// User stack pointer captured on syscall entry, used to judge stack-growth faults (§4.6).
	saved_esp: AtomicU64,
	page_size: u64,
}

impl Process {
	/// Builds the first process of a run (no parent, pid 1), opening `cwd` (normally
	/// `fs.root()`) as its working directory.
	pub fn init(
		fs: Arc<Fs>,
		name: impl Into<String>,
		cwd: InodeRef,
		frames: Arc<FrameTable>,
		swap: Arc<Swap>,
		vm_cfg: &VmConfig,
		stack_top: u64,
	) -> Arc<Self> {
		let pid = next_pid();
		let name = name.into();
		let info = Arc::new(ProcessInfo {
			pid,
			name: name.clone(),
			exit_status: Mutex::new(None),
			cv: Condvar::new(),
		});
		Arc::new(Self {
			pid,
			name,
			fs,
			cwd: Mutex::new(cwd),
			fds: Mutex::new(FileDescriptorTable::default()),
			vm: Mutex::new(VmSpace::new(frames, swap, vm_cfg, stack_top)),
			mmaps: Mutex::new(HashMap::new()),
			mmap_counter: AtomicU32::new(0),
			this_exec: Mutex::new(None),
			children: Mutex::new(Vec::new()),
			info,
			saved_esp: AtomicU64::new(stack_top),
			page_size: vm_cfg.page_size as u64,
		})
	}

	/// Process id.
	pub fn pid(&self) -> Pid {
		self.pid
	}

	/// The thread/process name, whitespace-delimited `argv[0]` used in the exit message.
	pub fn name(&self) -> &str {
		&self.name
	}

	/// The shared filesystem volume.
	pub fn fs(&self) -> &Arc<Fs> {
		&self.fs
	}

	/// The process's current working directory handle.
	pub fn cwd(&self) -> InodeRef {
		self.cwd.lock().unwrap().clone()
	}

	/// Replaces the working directory, closing the old handle. Used by `chdir`.
	pub fn set_cwd(&self, new_cwd: InodeRef) -> EResult<()> {
		let mut cwd = self.cwd.lock().unwrap();
		let old = std::mem::replace(&mut *cwd, new_cwd);
		drop(cwd);
		self.fs.close(old)
	}

	/// The file descriptor table.
	pub fn fds(&self) -> &Mutex<FileDescriptorTable> {
		&self.fds
	}

	/// The virtual address space.
	pub fn vm(&self) -> &Mutex<VmSpace> {
		&self.vm
	}

	/// Records the user stack pointer at syscall entry, consulted by [`VmSpace::fault`].
	pub fn set_saved_esp(&self, esp: u64) {
		self.saved_esp.store(esp, Ordering::Relaxed);
	}

	/// The most recently recorded user stack pointer.
	pub fn saved_esp(&self) -> u64 {
		self.saved_esp.load(Ordering::Relaxed)
	}

	/// Registers `inode` as this process's executable, denying further writes to it for as long
	/// as it stays mapped (T7). Fails if an executable is already registered.
	pub fn set_exec(&self, inode: InodeRef) -> EResult<()> {
		let mut exec = self.this_exec.lock().unwrap();
		if exec.is_some() {
			return Err(errno!(EBUSY));
		}
		self.fs.deny_write(&inode)?;
		*exec = Some(inode);
		Ok(())
	}

	/// Creates a new `mmap` region of `fd`'s file at `addr`, laying out one [`crate::vm::page::Page`]
	/// per page-sized chunk of the file, mirroring `process_mmap_file`: reopens the file so the
	/// mapping survives the caller's `close(fd)`, rejects a zero-length file, and rejects overlap
	/// with any already-mapped page.
	pub fn mmap(&self, fd: u32, addr: u64) -> EResult<MapId> {
		if addr == 0 || !addr.is_multiple_of(self.page_size) {
			return Err(errno!(EINVAL));
		}
		if fd == 0 || fd == 1 {
			return Err(errno!(EINVAL));
		}
		let sector = {
			let fds = self.fds.lock().unwrap();
			let descriptor = fds.get(fd)?;
			let sector = descriptor.handle().lock().unwrap().inode.sector();
			sector
		};
		let reopened = self.fs.open(sector)?;
		let length = reopened.entry().length().max(0) as u64;
		if length == 0 {
			self.fs.close(reopened)?;
			return Err(errno!(EINVAL));
		}
		let backing = Arc::new(FileBacking {
			fs: self.fs.clone(),
			inode: Mutex::new(Some(reopened)),
		});
		let page_count = length.div_ceil(self.page_size);
		let mut vm = self.vm.lock().unwrap();
		for i in 0..page_count {
			if vm.pages.find(addr + i * self.page_size).is_some() {
				return Err(errno!(EINVAL));
			}
		}
		let mut vaddrs = Vec::with_capacity(page_count as usize);
		for i in 0..page_count {
			let vaddr = addr + i * self.page_size;
			let chunk = (length - i * self.page_size).min(self.page_size);
			vm.map_file(vaddr, backing.clone() as Arc<dyn BackingFile>, i * self.page_size, chunk)?;
			vaddrs.push(vaddr);
		}
		drop(vm);
		let mapid = self.mmap_counter.fetch_add(1, Ordering::Relaxed);
		self.mmaps
			.lock()
			.unwrap()
			.insert(mapid, MmapRegion { vaddrs, _backing: backing });
		debug!("process {}: mmap {mapid} at {addr:#x} ({page_count} pages)", self.pid);
		Ok(mapid)
	}

	/// Tears down `mapid`'s region: every installed page is unmapped (writing back dirty content,
	/// per [`VmSpace::unmap`]) and the re-opened file handle is closed. Unknown map ids are
	/// silently ignored, per the syscall table's documented error behavior.
	pub fn munmap(&self, mapid: MapId) -> EResult<()> {
		let Some(region) = self.mmaps.lock().unwrap().remove(&mapid) else {
			return Ok(());
		};
		self.vm.lock().unwrap().unmap(&region.vaddrs)
	}

	/// Spawns a new process sharing this process's filesystem volume and frame table, running
	/// `body` on a dedicated thread; `body` receives the child `Process` and returns its exit
	/// status, which is reported to the parent through [`wait`] exactly as if `exit(status)` had
	/// been called. Registers the child in `self`'s children list (reference: `list_push_back` on
	/// `process_execute`).
	pub fn exec(
		self: &Arc<Self>,
		name: impl Into<String>,
		frames: Arc<FrameTable>,
		swap: Arc<Swap>,
		vm_cfg: VmConfig,
		stack_top: u64,
		body: impl FnOnce(Arc<Process>) -> i32 + Send + 'static,
	) -> EResult<Pid> {
		let name = name.into();
		let pid = next_pid();
		let info = Arc::new(ProcessInfo {
			pid,
			name: name.clone(),
			exit_status: Mutex::new(None),
			cv: Condvar::new(),
		});
		self.children.lock().unwrap().push(info.clone());
		let cwd = self.fs.open(self.cwd.lock().unwrap().sector())?;
		let child = Arc::new(Process {
			pid,
			name,
			fs: self.fs.clone(),
			cwd: Mutex::new(cwd),
			fds: Mutex::new(FileDescriptorTable::default()),
			vm: Mutex::new(VmSpace::new(frames, swap, &vm_cfg, stack_top)),
			mmaps: Mutex::new(HashMap::new()),
			mmap_counter: AtomicU32::new(0),
			this_exec: Mutex::new(None),
			children: Mutex::new(Vec::new()),
			info,
			saved_esp: AtomicU64::new(stack_top),
			page_size: vm_cfg.page_size as u64,
		});
		info!("process {}: exec'd child {pid}", self.pid);
		std::thread::Builder::new()
			.spawn(move || {
				let status = body(child.clone());
				child.terminate(status);
			})
			.map_err(|_| errno!(ENOMEM))?;
		Ok(pid)
	}

	/// Blocks until `pid` (a direct child of `self` that has not already been waited on) exits,
	/// then returns its status and forgets the child. Returns `-1` immediately if `pid` is not
	/// such a child, matching `process_wait`'s documented behavior for an unknown or
	/// already-waited pid.
	pub fn wait(&self, pid: Pid) -> i32 {
		let info = {
			let mut children = self.children.lock().unwrap();
			let idx = children.iter().position(|c| c.pid == pid);
			match idx {
				Some(i) => children.remove(i),
				None => return -1,
			}
		};
		debug!("process {}: waiting on {} ({})", self.pid, info.pid, info.name());
		let mut status = info.exit_status.lock().unwrap();
		while status.is_none() {
			status = info.cv.wait(status).unwrap();
		}
		status.unwrap()
	}

	/// Runs the exit protocol: prints the `"<argv0>: exit(<n>)\n"` message (§6), tears down the
	/// address space, closes every fd and the executable/cwd handles, and wakes a parent blocked
	/// in [`wait`]. Returns `status` unchanged for convenience at the `exec` thread's call site.
	pub fn terminate(self: &Arc<Self>, status: i32) -> i32 {
		let argv0 = self.name.split_whitespace().next().unwrap_or(&self.name);
		println!("{argv0}: exit({status})");
		if let Err(e) = self.vm.lock().unwrap().destroy() {
			debug!("process {}: vm teardown failed: {e}", self.pid);
		}
		if let Err(e) = self.fds.lock().unwrap().close_all(&self.fs) {
			debug!("process {}: fd teardown failed: {e}", self.pid);
		}
		self.mmaps.lock().unwrap().clear();
		if let Some(exec) = self.this_exec.lock().unwrap().take() {
			self.fs.allow_write(&exec);
			let _ = self.fs.close(exec);
		}
		if let Ok(root) = self.fs.root() {
			let old_cwd = std::mem::replace(&mut *self.cwd.lock().unwrap(), root);
			let _ = self.fs.close(old_cwd);
		}
		*self.info.exit_status.lock().unwrap() = Some(status);
		self.info.cv.notify_all();
		status
	}
}

impl Drop for Process {
	fn drop(&mut self) {
		let cwd = self.cwd.get_mut().unwrap().clone();
		let _ = self.fs.close(cwd);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::blockdev::{MemBlockDevice, Role};
	use crate::cfg::FsConfig;

	fn fixture() -> (Arc<Fs>, Arc<FrameTable>, Arc<Swap>, VmConfig) {
		let dev = MemBlockDevice::new(Role::Fs, 512, 256);
		let fs = Arc::new(Fs::format(Box::new(dev), FsConfig::default()).unwrap());
		let vm_cfg = VmConfig {
			page_size: 64,
			frame_table_size: 8,
			swap_size_pages: 8,
		};
		let swap_dev = MemBlockDevice::new(Role::Swap, 512, (vm_cfg.page_size / 512) as u32 * vm_cfg.swap_size_pages as u32);
		let swap = Arc::new(Swap::new(Box::new(swap_dev), vm_cfg.page_size));
		let frames = Arc::new(FrameTable::new(vm_cfg.frame_table_size, vm_cfg.page_size, swap.clone()));
		(fs, frames, swap, vm_cfg)
	}

	#[test]
	fn exec_then_wait_returns_exit_status() {
		let (fs, frames, swap, vm_cfg) = fixture();
		let root = fs.root().unwrap();
		let parent = Process::init(fs, "main", root, frames.clone(), swap.clone(), &vm_cfg, 0x1000);
		let pid = parent
			.exec("child", frames, swap, vm_cfg, 0x1000, |_child| 7)
			.unwrap();
		assert_eq!(parent.wait(pid), 7);
		assert_eq!(parent.wait(pid), -1, "a second wait on the same pid must fail");
	}

	#[test]
	fn wait_on_non_child_fails_immediately() {
		let (fs, frames, swap, vm_cfg) = fixture();
		let root = fs.root().unwrap();
		let parent = Process::init(fs, "main", root, frames, swap, &vm_cfg, 0x1000);
		assert_eq!(parent.wait(999), -1);
	}

	#[test]
	fn mmap_rejects_unaligned_address_and_reserved_fds() {
		let (fs, frames, swap, vm_cfg) = fixture();
		let root = fs.root().unwrap();
		let proc = Process::init(fs, "main", root, frames, swap, &vm_cfg, 0x1000);
		assert_eq!(proc.mmap(2, 1), Err(errno!(EINVAL)));
		assert_eq!(proc.mmap(0, 0x40), Err(errno!(EINVAL)));
	}
}
