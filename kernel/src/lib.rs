//! FerriteOS kernel library
//!
//! A teaching-grade 32-bit x86 kernel: physical and virtual memory
//! management, preemptive multitasking, a block I/O stack with an LRU
//! write-back cache, MBR/GPT partition discovery, a mountable VFS and an
//! ELF32 program loader.
//!
//! The crate builds two ways: `no_std` for the bare-metal target, and
//! against the host `std` for unit tests, where every algorithmic layer is
//! exercised without hardware.

#![no_std]

extern crate alloc;

// Host target: link std and use the system allocator so unit tests can
// allocate normally.
#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

// Bare metal: the block heap of `mm::heap` backs the global allocator once
// `mm::init` has pinned a frame range for it.
#[cfg(target_os = "none")]
#[global_allocator]
static KERNEL_HEAP: mm::heap::LockedBlockHeap = mm::heap::LockedBlockHeap::empty();

pub mod boot;
pub mod drivers;
pub mod elf;
pub mod error;
pub mod fs;
pub mod mm;
pub mod process;
pub mod sched;
pub mod selftest;
pub mod sync;

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub mod arch;
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub mod intrinsics;
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub mod logger;
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub mod serial;

pub use error::{FsError, IoError, KernelError, KernelResult};
