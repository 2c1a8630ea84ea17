//! Small support crate shared by the kernel-core crate.
//!
//! Mirrors the role the teacher codebase's `utils` crate plays: error codes, size limits and a
//! handful of arithmetic helpers used throughout the filesystem and virtual-memory code, kept
//! separate so they can be depended on without pulling in the rest of the kernel.

pub mod errno;
pub mod limits;
pub mod math;
