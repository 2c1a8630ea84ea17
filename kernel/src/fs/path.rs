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

//! Path resolution against a process's working directory, with open/create-file/create-dir
//! modes, mirroring `path_get_create_file` in the reference sources.

use crate::fs::dir;
use crate::fs::inode::InodeRef;
use crate::fs::Fs;
use utils::errno;
use utils::errno::EResult;
use utils::limits::MAX_PATH_LENGTH;

/// What the final path component should resolve to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
	/// Resolve to an existing file or directory; fails if it does not exist.
	Open,
	/// Create a regular file at the final component.
	CreateFile,
	/// Create a directory at the final component.
	CreateDir,
}

/// Splits `path` on `/`, skipping empty components (collapsing repeated slashes), and reports
/// whether the original path ended in a separator.
fn split(path: &str) -> (Vec<&str>, bool) {
	let trailing_slash = path.len() > 1 && path.ends_with('/');
	let parts = path.split('/').filter(|s| !s.is_empty()).collect();
	(parts, trailing_slash)
}

/// Resolves `path` against `cwd`, starting from the root instead if `path` is absolute.
///
/// - [`Mode::Open`]: the final component must already exist.
/// - [`Mode::CreateFile`]: the final component is created as a regular file of `size` bytes in
///   its parent.
/// - [`Mode::CreateDir`]: the final component is created as a directory (`size` is ignored); this
///   mode is also forced when the path ends in `/`, matching the reference behavior that a
///   trailing slash requests a directory.
pub fn resolve(fs: &Fs, cwd: &InodeRef, path: &str, mode: Mode, size: u32) -> EResult<InodeRef> {
	if path.is_empty() || path.len() >= MAX_PATH_LENGTH {
		return Err(errno!(ENAMETOOLONG));
	}
	let (parts, trailing_slash) = split(path);
	let mode = if trailing_slash && mode != Mode::Open {
		Mode::CreateDir
	} else {
		mode
	};
	let want_dir = trailing_slash || mode == Mode::CreateDir;

	let start = if path.starts_with('/') {
		fs.root()?
	} else {
		fs.open(cwd.sector())?
	};

	if parts.is_empty() {
		// Bare "/" or "."-equivalent: resolves to the start directory itself.
		return if mode == Mode::Open {
			Ok(start)
		} else {
			fs.close(start)?;
			Err(errno!(EEXIST))
		};
	}

	let mut current = start;
	for part in &parts[..parts.len() - 1] {
		if !current.entry().is_directory() {
			fs.close(current)?;
			return Err(errno!(ENOTDIR));
		}
		let next = match dir::lookup(fs, &current, part) {
			Ok(next) => next,
			Err(e) => {
				fs.close(current)?;
				return Err(e);
			}
		};
		fs.close(current)?;
		current = next;
	}

	let last = parts[parts.len() - 1];
	if !current.entry().is_directory() {
		fs.close(current)?;
		return Err(errno!(ENOTDIR));
	}

	let result = match mode {
		Mode::Open => dir::lookup(fs, &current, last),
		Mode::CreateFile => dir::add(fs, &current, last, false, size).and_then(|s| fs.open(s)),
		Mode::CreateDir => dir::add(fs, &current, last, true, 0).and_then(|s| fs.open(s)),
	};
	fs.close(current)?;
	match result {
		Ok(inode) if want_dir && !inode.entry().is_directory() => {
			fs.close(inode)?;
			Err(errno!(ENOTDIR))
		}
		other => other,
	}
}

/// Resolves all but the final component of `path`, returning the open parent directory and the
/// final component's name. Used by operations that act on a name within its parent (`REMOVE`)
/// rather than opening the target itself.
pub fn resolve_parent<'a>(fs: &Fs, cwd: &InodeRef, path: &'a str) -> EResult<(InodeRef, &'a str)> {
	if path.is_empty() || path.len() >= MAX_PATH_LENGTH {
		return Err(errno!(ENAMETOOLONG));
	}
	let (parts, _trailing_slash) = split(path);
	let start = if path.starts_with('/') {
		fs.root()?
	} else {
		fs.open(cwd.sector())?
	};
	let Some((last, init)) = parts.split_last() else {
		fs.close(start)?;
		return Err(errno!(EINVAL));
	};
	let mut current = start;
	for part in init {
		if !current.entry().is_directory() {
			fs.close(current)?;
			return Err(errno!(ENOTDIR));
		}
		let next = match dir::lookup(fs, &current, part) {
			Ok(next) => next,
			Err(e) => {
				fs.close(current)?;
				return Err(e);
			}
		};
		fs.close(current)?;
		current = next;
	}
	if !current.entry().is_directory() {
		fs.close(current)?;
		return Err(errno!(ENOTDIR));
	}
	Ok((current, last))
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
	fn absolute_create_then_open() {
		let fs = fixture();
		let root = fs.root().unwrap();
		let f = resolve(&fs, &root, "/a", Mode::CreateFile, 0).unwrap();
		fs.close(f).unwrap();
		let f2 = resolve(&fs, &root, "/a", Mode::Open, 0).unwrap();
		assert!(!f2.entry().is_directory());
		fs.close(f2).unwrap();
		fs.close(root).unwrap();
	}

	#[test]
	fn relative_path_honors_working_directory() {
		let fs = fixture();
		let root = fs.root().unwrap();
		let d = resolve(&fs, &root, "/d", Mode::CreateDir, 0).unwrap();
		let b = resolve(&fs, &d, "b", Mode::CreateFile, 0).unwrap();
		fs.close(b).unwrap();
		let via_dotdot = resolve(&fs, &d, "../d/b", Mode::Open, 0).unwrap();
		let via_direct = resolve(&fs, &root, "/d/b", Mode::Open, 0).unwrap();
		assert_eq!(via_dotdot.sector(), via_direct.sector());
		fs.close(via_dotdot).unwrap();
		fs.close(via_direct).unwrap();
		fs.close(d).unwrap();
		fs.close(root).unwrap();
	}

	#[test]
	fn trailing_slash_forces_directory_semantics() {
		let fs = fixture();
		let root = fs.root().unwrap();
		let f = resolve(&fs, &root, "/file", Mode::CreateFile, 0).unwrap();
		fs.close(f).unwrap();
		assert_eq!(resolve(&fs, &root, "/file/", Mode::Open, 0), Err(errno!(ENOTDIR)));
		fs.close(root).unwrap();
	}

	#[test]
	fn overlong_path_fails_fast() {
		let fs = fixture();
		let root = fs.root().unwrap();
		let long = "/".to_string() + &"a".repeat(MAX_PATH_LENGTH);
		assert_eq!(resolve(&fs, &root, &long, Mode::Open, 0), Err(errno!(ENAMETOOLONG)));
		fs.close(root).unwrap();
	}
}
