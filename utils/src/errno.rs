//! POSIX-flavored error codes and the `errno!` construction macro.
//!
//! Every fallible operation in the kernel-core crate returns [`EResult`]. The variants below are
//! restricted to the ones this codebase actually raises; this is not a full libc errno table.

use std::fmt;

/// An error code, named after its POSIX equivalent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(non_camel_case_types)]
pub enum Errno {
	/// Permission denied.
	EPERM,
	/// No such file or directory.
	ENOENT,
	/// I/O error.
	EIO,
	/// Bad file descriptor.
	EBADF,
	/// Out of memory.
	ENOMEM,
	/// Bad address (invalid user pointer).
	EFAULT,
	/// Device or resource busy.
	EBUSY,
	/// File exists.
	EEXIST,
	/// Not a directory.
	ENOTDIR,
	/// Is a directory.
	EISDIR,
	/// Invalid argument.
	EINVAL,
	/// No space left on device.
	ENOSPC,
	/// File name too long.
	ENAMETOOLONG,
	/// Directory not empty.
	ENOTEMPTY,
	/// Too many levels of symbolic links (reused here for path segment overflow).
	ELOOP,
	/// Value too large / would overflow.
	EOVERFLOW,
	/// Out of swap space.
	ENOSWAP,
}

impl fmt::Display for Errno {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let msg = match self {
			Self::EPERM => "operation not permitted",
			Self::ENOENT => "no such file or directory",
			Self::EIO => "I/O error",
			Self::EBADF => "bad file descriptor",
			Self::ENOMEM => "out of memory",
			Self::EFAULT => "bad address",
			Self::EBUSY => "resource busy",
			Self::EEXIST => "file exists",
			Self::ENOTDIR => "not a directory",
			Self::EISDIR => "is a directory",
			Self::EINVAL => "invalid argument",
			Self::ENOSPC => "no space left on device",
			Self::ENAMETOOLONG => "file name too long",
			Self::ENOTEMPTY => "directory not empty",
			Self::ELOOP => "too many levels",
			Self::EOVERFLOW => "value too large",
			Self::ENOSWAP => "out of swap space",
		};
		write!(f, "{msg}")
	}
}

impl std::error::Error for Errno {}

/// Builds an [`Errno`] value from its bare variant name, e.g. `errno!(ENOENT)`.
#[macro_export]
macro_rules! errno {
	($variant:ident) => {
		$crate::errno::Errno::$variant
	};
}

/// The result type returned by every fallible kernel-core operation.
pub type EResult<T> = Result<T, Errno>;
