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

//! Core of a teaching-style operating system: demand-paged virtual memory and an indexed
//! on-disk filesystem, plus the process/file-descriptor table that ties both to syscalls.
//!
//! The thread scheduler, interrupts, GDT/TSS, boot loader, ELF loader and syscall trampoline are
//! out of scope; this crate runs hosted on top of `std` instead of bare metal, so a page fault is
//! an ordinary function call and a "thread" is a real `std::thread` only where exercising the
//! exec/wait protocol requires one.

pub mod blockdev;
pub mod cfg;
pub mod fs;
pub mod procs;
pub mod syscalls;
pub mod vm;

pub use utils::errno::{EResult, Errno};
pub use utils::errno;
