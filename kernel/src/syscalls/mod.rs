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

//! The syscall table: thin, synchronized entry points over a [`Process`] and its filesystem.
//!
//! User-pointer validation (the byte-by-byte trap-on-fault walk `get_byte_or_die`/
//! `check_buffer_or_die` performs in the reference handler) is out of scope here — callers already
//! hand in ordinary `&[u8]`/`&mut [u8]` slices, so every function below only has to enforce the
//! filesystem- and descriptor-level checks the reference `syscall.c` bodies perform after that
//! validation.
//!
//! Every syscall that touches the filesystem takes [`crate::fs::Fs::lock`] first and holds it for
//! its whole body — `filesystem_lock` is outermost among the filesystem locks (§5), so nothing
//! else in this crate acquires it while holding another lock.

use crate::fs::path::{self, Mode};
use crate::fs::{dir, InodeRef};
use crate::procs::fd::NewFdConstraint;
use crate::procs::{MapId, Pid, Process};
use crate::vm::frame::FrameTable;
use crate::vm::swap::Swap;
use crate::cfg::VmConfig;
use std::io::{Read as _, Write as _};
use std::sync::Arc;

/// Value returned by `mmap` on failure (`MAP_FAILED`).
pub const MAP_FAILED: i64 = -1;

/// Standard input fd.
pub const STDIN_FILENO: u32 = 0;
/// Standard output fd.
pub const STDOUT_FILENO: u32 = 1;

/// Stand-in for the power-off instruction. Has no observable effect hosted and never returns in
/// the reference design; here it is simply a function that does nothing.
pub fn halt() {}

/// Terminates the process with `status`, running its full exit protocol.
pub fn exit(proc: &Arc<Process>, status: i32) -> i32 {
	proc.terminate(status)
}

/// Spawns a child process running `body`, returning its pid or `-1` on failure.
#[allow(clippy::too_many_arguments)]
pub fn exec(
	proc: &Arc<Process>,
	cmd_line: impl Into<String>,
	frames: Arc<FrameTable>,
	swap: Arc<Swap>,
	vm_cfg: VmConfig,
	stack_top: u64,
	body: impl FnOnce(Arc<Process>) -> i32 + Send + 'static,
) -> i32 {
	match proc.exec(cmd_line, frames, swap, vm_cfg, stack_top, body) {
		Ok(pid) => pid as i32,
		Err(_) => -1,
	}
}

/// Blocks for a child's exit status, or returns `-1` if `pid` is not a waitable child.
pub fn wait(proc: &Process, pid: Pid) -> i32 {
	proc.wait(pid)
}

/// Creates a regular file of `size` bytes at `path`.
pub fn create(proc: &Process, path_str: &str, size: u32) -> bool {
	let _guard = proc.fs().lock();
	let cwd = proc.cwd();
	let result = path::resolve(proc.fs(), &cwd, path_str, Mode::CreateFile, size);
	let ok = result.is_ok();
	if let Ok(inode) = result {
		let _ = proc.fs().close(inode);
	}
	ok
}

/// Removes the file or empty directory named by `path`.
pub fn remove(proc: &Process, path_str: &str) -> bool {
	let _guard = proc.fs().lock();
	let cwd = proc.cwd();
	let Ok((parent, name)) = path::resolve_parent(proc.fs(), &cwd, path_str) else {
		return false;
	};
	let ok = dir::remove(proc.fs(), &parent, name).is_ok();
	let _ = proc.fs().close(parent);
	ok
}

/// Opens `path`, installing it as a new fd. Returns the fd or `-1`.
pub fn open(proc: &Process, path_str: &str) -> i32 {
	let _guard = proc.fs().lock();
	let cwd = proc.cwd();
	let Ok(inode) = path::resolve(proc.fs(), &cwd, path_str, Mode::Open, 0) else {
		return -1;
	};
	match proc.fds().lock().unwrap().create_fd(0, inode) {
		Ok(fd) => fd as i32,
		Err(_) => -1,
	}
}

fn fd_inode(proc: &Process, fd: u32) -> Option<InodeRef> {
	let fds = proc.fds().lock().unwrap();
	let descriptor = fds.get(fd).ok()?;
	let inode = descriptor.handle().lock().unwrap().inode.clone();
	Some(inode)
}

/// Returns the byte length of `fd`'s file, or `-1` for a bad fd or a directory.
pub fn filesize(proc: &Process, fd: u32) -> i32 {
	let _guard = proc.fs().lock();
	match fd_inode(proc, fd) {
		Some(inode) if !inode.entry().is_directory() => inode.entry().length() as i32,
		_ => -1,
	}
}

/// Reads into `buf`, returning the byte count or `-1`. `fd == 0` reads from stdin; a directory fd
/// is rejected.
pub fn read(proc: &Process, fd: u32, buf: &mut [u8]) -> i32 {
	let _guard = proc.fs().lock();
	if fd == STDIN_FILENO {
		return std::io::stdin().read(buf).map(|n| n as i32).unwrap_or(-1);
	}
	let fds = proc.fds().lock().unwrap();
	let Ok(descriptor) = fds.get(fd) else {
		return -1;
	};
	let handle = descriptor.handle().clone();
	drop(fds);
	let mut handle = handle.lock().unwrap();
	if handle.inode.entry().is_directory() {
		return -1;
	}
	match proc.fs().read_at(&handle.inode, buf, handle.position) {
		Ok(n) => {
			handle.position += n as u64;
			n as i32
		}
		Err(_) => -1,
	}
}

/// Writes `buf`, returning the byte count or `-1`. `fd == 1` writes to stdout; a directory fd is
/// rejected.
pub fn write(proc: &Process, fd: u32, buf: &[u8]) -> i32 {
	let _guard = proc.fs().lock();
	if fd == STDOUT_FILENO {
		return std::io::stdout().write_all(buf).map(|_| buf.len() as i32).unwrap_or(-1);
	}
	let fds = proc.fds().lock().unwrap();
	let Ok(descriptor) = fds.get(fd) else {
		return -1;
	};
	let handle = descriptor.handle().clone();
	drop(fds);
	let mut handle = handle.lock().unwrap();
	if handle.inode.entry().is_directory() {
		return -1;
	}
	match proc.fs().write_at(&handle.inode, buf, handle.position) {
		Ok(n) => {
			handle.position += n as u64;
			n as i32
		}
		Err(_) => -1,
	}
}

/// Moves `fd`'s cursor to `position`. A bad fd is silently ignored.
pub fn seek(proc: &Process, fd: u32, position: u64) {
	let _guard = proc.fs().lock();
	let fds = proc.fds().lock().unwrap();
	if let Ok(descriptor) = fds.get(fd) {
		descriptor.handle().lock().unwrap().position = position;
	}
}

/// Returns `fd`'s cursor position, or `-1` for a bad fd.
pub fn tell(proc: &Process, fd: u32) -> i64 {
	let _guard = proc.fs().lock();
	let fds = proc.fds().lock().unwrap();
	match fds.get(fd) {
		Ok(descriptor) => descriptor.handle().lock().unwrap().position as i64,
		Err(_) => -1,
	}
}

/// Closes `fd`. A bad fd is silently ignored.
pub fn close(proc: &Process, fd: u32) {
	let _guard = proc.fs().lock();
	let _ = proc.fds().lock().unwrap().close_fd(proc.fs(), fd);
}

/// Duplicates `fd` under a fresh or constrained id.
pub fn dup(proc: &Process, fd: u32, constraint: NewFdConstraint, cloexec: bool) -> i32 {
	match proc.fds().lock().unwrap().duplicate_fd(fd, constraint, cloexec) {
		Ok(new_fd) => new_fd as i32,
		Err(_) => -1,
	}
}

/// Maps `fd`'s file at `addr`, returning a map id or [`MAP_FAILED`].
pub fn mmap(proc: &Process, fd: u32, addr: u64) -> i64 {
	let _guard = proc.fs().lock();
	match proc.mmap(fd, addr) {
		Ok(mapid) => mapid as i64,
		Err(_) => MAP_FAILED,
	}
}

/// Unmaps `mapid`. An unknown map id is silently ignored.
pub fn munmap(proc: &Process, mapid: MapId) {
	let _guard = proc.fs().lock();
	let _ = proc.munmap(mapid);
}

/// Changes the working directory to `path`, failing if it is not a directory.
pub fn chdir(proc: &Process, path_str: &str) -> bool {
	let _guard = proc.fs().lock();
	let cwd = proc.cwd();
	match path::resolve(proc.fs(), &cwd, path_str, Mode::Open, 0) {
		Ok(inode) if inode.entry().is_directory() => proc.set_cwd(inode).is_ok(),
		Ok(inode) => {
			let _ = proc.fs().close(inode);
			false
		}
		Err(_) => false,
	}
}

/// Creates a directory at `path`.
pub fn mkdir(proc: &Process, path_str: &str) -> bool {
	let _guard = proc.fs().lock();
	let cwd = proc.cwd();
	match path::resolve(proc.fs(), &cwd, path_str, Mode::CreateDir, 0) {
		Ok(inode) => {
			let _ = proc.fs().close(inode);
			true
		}
		Err(_) => false,
	}
}

/// Advances `fd`'s directory cursor, writing the next entry's name into `name`. `fd` must refer to
/// a directory; returns `false` on a bad fd, a non-directory fd, or end of directory.
pub fn readdir(proc: &Process, fd: u32, name: &mut String) -> bool {
	let _guard = proc.fs().lock();
	let Some(inode) = fd_inode(proc, fd) else {
		return false;
	};
	if !inode.entry().is_directory() {
		return false;
	}
	let fds = proc.fds().lock().unwrap();
	let Ok(descriptor) = fds.get(fd) else {
		return false;
	};
	let handle = descriptor.handle().clone();
	drop(fds);
	let mut handle = handle.lock().unwrap();
	let mut pos = handle.position;
	let result = dir::readdir(proc.fs(), &handle.inode, &mut pos);
	handle.position = pos;
	match result {
		Ok(Some(found)) => {
			*name = found;
			true
		}
		_ => false,
	}
}

/// Whether `fd` refers to a directory. `false` for a bad fd.
pub fn isdir(proc: &Process, fd: u32) -> bool {
	let _guard = proc.fs().lock();
	fd_inode(proc, fd).is_some_and(|inode| inode.entry().is_directory())
}

/// Returns the inode sector backing `fd`, or `-1` for a bad fd.
pub fn inumber(proc: &Process, fd: u32) -> i64 {
	let _guard = proc.fs().lock();
	match fd_inode(proc, fd) {
		Some(inode) => inode.sector() as i64,
		None => -1,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::blockdev::{MemBlockDevice, Role};
	use crate::cfg::FsConfig;
	use crate::fs::Fs;
	use crate::vm::frame::FrameTable;

	fn fixture() -> Arc<Process> {
		let dev = MemBlockDevice::new(Role::Fs, 512, 512);
		let fs = Arc::new(Fs::format(Box::new(dev), FsConfig::default()).unwrap());
		let vm_cfg = VmConfig {
			page_size: 64,
			frame_table_size: 8,
			swap_size_pages: 8,
		};
		let swap_dev = MemBlockDevice::new(Role::Swap, 512, (vm_cfg.page_size / 512) as u32 * vm_cfg.swap_size_pages as u32);
		let swap = Arc::new(Swap::new(Box::new(swap_dev), vm_cfg.page_size));
		let frames = Arc::new(FrameTable::new(vm_cfg.frame_table_size, vm_cfg.page_size, swap.clone()));
		let root = fs.root().unwrap();
		Process::init(fs, "main", root, frames, swap, &vm_cfg, 0x1000)
	}

	#[test]
	fn create_open_write_read_roundtrip() {
		let proc = fixture();
		assert!(create(&proc, "/a", 0));
		let fd = open(&proc, "/a");
		assert!(fd >= 0);
		assert_eq!(write(&proc, fd as u32, b"hello"), 5);
		close(&proc, fd as u32);
		let fd2 = open(&proc, "/a");
		assert_eq!(filesize(&proc, fd2 as u32), 5);
		let mut buf = [0u8; 10];
		assert_eq!(read(&proc, fd2 as u32, &mut buf), 5);
		assert_eq!(&buf[..5], b"hello");
		close(&proc, fd2 as u32);
	}

	#[test]
	fn mkdir_chdir_same_name_resolves_across_dotdot() {
		let proc = fixture();
		assert!(mkdir(&proc, "/d"));
		assert!(chdir(&proc, "/d"));
		assert!(create(&proc, "b", 3));
		let fd3 = open(&proc, "./b");
		let fd4 = open(&proc, "../d/b");
		assert!(fd3 >= 0 && fd4 >= 0);
		assert_eq!(inumber(&proc, fd3 as u32), inumber(&proc, fd4 as u32));
		close(&proc, fd3 as u32);
		close(&proc, fd4 as u32);
	}

	#[test]
	fn bad_fd_reads_and_writes_fail_without_panicking() {
		let proc = fixture();
		let mut buf = [0u8; 4];
		assert_eq!(read(&proc, 99, &mut buf), -1);
		assert_eq!(write(&proc, 99, &buf), -1);
		assert_eq!(filesize(&proc, 99), -1);
		assert_eq!(tell(&proc, 99), -1);
		assert_eq!(inumber(&proc, 99), -1);
		assert!(!isdir(&proc, 99));
		close(&proc, 99); // silently ignored
	}

	#[test]
	fn exec_wait_roundtrip_via_syscall_table() {
		let proc = fixture();
		let vm_cfg = VmConfig {
			page_size: 64,
			frame_table_size: 8,
			swap_size_pages: 8,
		};
		let swap_dev = MemBlockDevice::new(Role::Swap, 512, (vm_cfg.page_size / 512) as u32 * vm_cfg.swap_size_pages as u32);
		let swap = Arc::new(Swap::new(Box::new(swap_dev), vm_cfg.page_size));
		let frames = Arc::new(FrameTable::new(vm_cfg.frame_table_size, vm_cfg.page_size, swap.clone()));
		let pid = exec(&proc, "child", frames, swap, vm_cfg, 0x1000, |_child| 7);
		assert!(pid > 0);
		assert_eq!(wait(&proc, pid as Pid), 7);
		assert_eq!(wait(&proc, pid as Pid), -1);
	}
}
