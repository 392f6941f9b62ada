//! The preemptive scheduler, synchronization, buffer cache, inode, and
//! virtual-memory core of an educational x86 teaching kernel.
//!
//! This crate implements the parts of the kernel that are pure logic over
//! data structures — priority scheduling and donation, the MLFQS, a
//! clock-evicted sector cache, an extensible-file inode layer, and
//! demand-paged virtual memory with swap — and leaves hardware-facing
//! concerns (context switching, real page tables, ELF loading, the block
//! device transport, the syscall dispatcher's argument marshalling) to the
//! embedding kernel, behind the traits in [`hal`].
//!
//! [`kernel::Kernel`] wires every subsystem together for callers who want
//! one handle rather than five.

pub mod cache;
pub mod config;
pub mod error;
pub mod fixedpoint;
pub mod fs;
pub mod hal;
pub mod kernel;
pub mod sync;
pub mod thread;
pub mod uaccess;
pub mod vm;

pub use config::KernelConfig;
pub use error::{KernelError, Result};
pub use kernel::Kernel;
