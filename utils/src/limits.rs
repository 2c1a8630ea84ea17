//! Compile-time default size limits.
//!
//! These mirror the constants fixed by the reference system; [`crate::Errno`] aside, nothing in
//! the kernel-core crate hardcodes them directly — components take an explicit `FsConfig`/
//! `VmConfig` (see `kernel::config`) so tests can shrink them. The values here are only the
//! defaults those configs start from.

/// Default block device sector size in bytes.
pub const SECTOR_SIZE: u32 = 512;
/// Maximum length of a single path component.
pub const NAME_MAX: usize = 14;
/// Maximum length of a whole path.
pub const MAX_PATH_LENGTH: usize = 1024;
/// Virtual memory page size in bytes.
pub const PAGE_SIZE: usize = 4096;
/// Number of direct block pointers stored in an on-disk inode at the reference sector size.
pub const DIRECT_BLOCKS: usize = 122;
/// Maximum number of file descriptors open per process.
pub const OPEN_MAX: u32 = 128;
