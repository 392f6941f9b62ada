//! Supplemental page table entries.
//!
//! Grounded on `keos`'s `MmStruct<P: Pager>`/`Pager` trait shape: a
//! process's address space is a sparse map from page-aligned virtual
//! address to the metadata needed to service a fault on it, not a dense
//! array. `VmEntryKind` mirrors `original_source`'s three
//! `VM_BIN`/`VM_FILE`/`VM_ANON` page types exactly.

use crate::hal::PhysFrame;

/// A page-aligned virtual address.
pub type VPage = u64;

/// Where a page's content comes from when it is not resident.
#[derive(Debug, Clone)]
pub enum VmEntryKind {
    /// Backed by an executable's segment: `read_bytes` bytes come from the
    /// file at `file_sector`/`file_offset`, the remainder up to one page is
    /// zero-filled. Read-only, unmodified BIN pages are simply dropped on
    /// eviction and reloaded from the file rather than swapped.
    Bin {
        inode_sector: u32,
        file_offset: u64,
        read_bytes: usize,
    },
    /// Backed by a memory-mapped file (`mmap`); `mmap_id` ties it to the
    /// mapping that must be written back on `munmap` or eviction if dirty.
    File {
        inode_sector: u32,
        file_offset: u64,
        read_bytes: usize,
        mmap_id: u32,
    },
    /// Anonymous memory (stack or heap growth): zero-filled on first fault,
    /// backed only by swap thereafter.
    Anon,
}

/// One page's worth of address-space metadata.
#[derive(Debug, Clone)]
pub struct VmEntry {
    pub vpage: VPage,
    pub writable: bool,
    pub kind: VmEntryKind,
    /// The frame currently backing this page, if resident.
    pub frame: Option<PhysFrame>,
    /// The swap slot holding this page's content, if it has ever been
    /// swapped out and not yet swapped back in.
    pub swap_slot: Option<u32>,
}

impl VmEntry {
    pub fn new(vpage: VPage, writable: bool, kind: VmEntryKind) -> Self {
        Self {
            vpage,
            writable,
            kind,
            frame: None,
            swap_slot: None,
        }
    }
}
