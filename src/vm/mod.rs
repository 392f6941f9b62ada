//! Demand-paged virtual memory.
//!
//! Grounded on `keos`'s `MmStruct<P: Pager>`: a process's address space is
//! modeled as a sparse per-page table (here [`VmTable`]) rather than a
//! dense page directory, since only the pages with something interesting
//! to say (lazily loaded, mmap'd, or swappable) need an entry at all.

pub mod entry;
pub mod fault;
pub mod frame;
pub mod mmap;
pub mod swap;

pub use entry::{VmEntry, VmEntryKind, VPage};
pub use frame::FrameTable;
pub use swap::SwapTable;

use crate::hal::{InMemoryPageTable, PAGE_SIZE};
use std::collections::BTreeMap;

/// Rounds `addr` down to the containing page boundary.
pub fn page_align_down(addr: u64) -> u64 {
    addr & !(PAGE_SIZE as u64 - 1)
}

/// A process's virtual address space: its supplemental page table plus the
/// (simulated) hardware page table tracking residency/accessed/dirty bits.
#[derive(Debug)]
pub struct VmTable {
    entries: BTreeMap<VPage, VmEntry>,
    pub page_table: InMemoryPageTable,
    next_mmap_id: u32,
    mmaps: BTreeMap<u32, Vec<VPage>>,
}

impl VmTable {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            page_table: InMemoryPageTable::new(),
            next_mmap_id: 0,
            mmaps: BTreeMap::new(),
        }
    }

    pub fn entry(&self, vpage: VPage) -> Option<&VmEntry> {
        self.entries.get(&vpage)
    }

    pub fn entry_mut(&mut self, vpage: VPage) -> Option<&mut VmEntry> {
        self.entries.get_mut(&vpage)
    }

    /// Inserts a new entry, erroring if one already covers `vpage`.
    pub fn insert_entry(&mut self, entry: VmEntry) -> crate::error::Result<()> {
        if self.entries.contains_key(&entry.vpage) {
            return Err(crate::error::KernelError::AlreadyExists);
        }
        self.entries.insert(entry.vpage, entry);
        Ok(())
    }

    pub fn remove_entry(&mut self, vpage: VPage) -> Option<VmEntry> {
        self.page_table.unmap(vpage);
        self.entries.remove(&vpage)
    }

    /// Registers a fresh mmap id covering `pages`.
    pub fn register_mmap(&mut self, pages: Vec<VPage>) -> u32 {
        let id = self.next_mmap_id;
        self.next_mmap_id += 1;
        self.mmaps.insert(id, pages);
        id
    }

    /// The pages covered by a given mmap id.
    pub fn mmap_pages(&self, id: u32) -> Option<&[VPage]> {
        self.mmaps.get(&id).map(|v| v.as_slice())
    }

    pub fn unregister_mmap(&mut self, id: u32) -> Option<Vec<VPage>> {
        self.mmaps.remove(&id)
    }
}

impl Default for VmTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Installs the lazily-loaded pages for one executable segment.
///
/// ELF parsing itself is out of scope: this is the contract the
/// loader is expected to call once it has already worked out a segment's
/// file range and in-memory size. `read_bytes` come from `inode_sector` at
/// `file_offset`; the remaining bytes up to `read_bytes + zero_bytes`,
/// rounded up to a page, are zero-filled on first fault, matching
/// `original_source`'s `load_segment`.
pub fn load_segment(
    vm_table: &mut VmTable,
    inode_sector: u32,
    file_offset: u64,
    vaddr_start: VPage,
    read_bytes: usize,
    zero_bytes: usize,
    writable: bool,
) -> crate::error::Result<()> {
    let total = read_bytes + zero_bytes;
    let mut done = 0usize;
    let mut page_vaddr = page_align_down(vaddr_start);
    while done < total {
        let page_read_bytes = read_bytes.saturating_sub(done).min(PAGE_SIZE);
        vm_table.insert_entry(VmEntry::new(
            page_vaddr,
            writable,
            VmEntryKind::Bin {
                inode_sector,
                file_offset: file_offset + done as u64,
                read_bytes: page_read_bytes,
            },
        ))?;
        done += PAGE_SIZE;
        page_vaddr += PAGE_SIZE as u64;
    }
    Ok(())
}

/// Installs the initial user stack's single anonymous page, one page
/// below `stack_top` (the address `%esp` is initialized to).
pub fn setup_stack(vm_table: &mut VmTable, stack_top: VPage) -> crate::error::Result<()> {
    let page_vaddr = page_align_down(stack_top - 1);
    vm_table.insert_entry(VmEntry::new(page_vaddr, true, VmEntryKind::Anon))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_segment_spans_multiple_pages_with_zero_tail() {
        let mut vt = VmTable::new();
        load_segment(&mut vt, 5, 0, 0x0804_8000, PAGE_SIZE + 100, 50, false).unwrap();
        assert!(vt.entry(0x0804_8000).is_some());
        assert!(vt.entry(0x0804_8000 + PAGE_SIZE as u64).is_some());
        if let VmEntryKind::Bin { read_bytes, .. } = &vt.entry(0x0804_8000 + PAGE_SIZE as u64).unwrap().kind {
            assert_eq!(*read_bytes, 100);
        } else {
            panic!("expected Bin entry");
        }
    }

    #[test]
    fn setup_stack_installs_one_page_below_top() {
        let mut vt = VmTable::new();
        setup_stack(&mut vt, 0xC000_0000).unwrap();
        assert!(vt.entry(0xC000_0000 - PAGE_SIZE as u64).is_some());
    }
}
