//! Memory-mapped files.
//!
//! Grounded on `original_source/vm/`'s `(struct mmap_file, do_munmap)`
//! flow: `mmap` installs one `VmEntryKind::File` entry per page without
//! touching physical memory (pages are faulted in lazily, same as any
//! other non-resident entry); `munmap` walks those pages back off,
//! flushing any that were modified to the backing inode.

use crate::cache::BufferCache;
use crate::error::{KernelError, Result};
use crate::fs::{FreeMap, InodeTable};
use crate::hal::{BlockDevice, FrameAllocator, PageTable, PAGE_SIZE};
use crate::thread::scheduler::Scheduler;
use crate::thread::Tid;
use crate::vm::entry::{VmEntry, VmEntryKind, VPage};
use crate::vm::frame::FrameTable;
use crate::vm::swap::SwapTable;

/// Maps `length` bytes of the file at `inode_sector`, starting at
/// `file_offset`, into `owner`'s address space beginning at `vaddr`
/// (page-aligned). Returns the new mmap id.
pub fn mmap(
    sched: &mut Scheduler,
    owner: Tid,
    vaddr: VPage,
    inode_sector: u32,
    inode_len: u64,
    file_offset: u64,
    length: usize,
) -> Result<u32> {
    if vaddr % PAGE_SIZE as u64 != 0 || length == 0 {
        return Err(KernelError::InvalidArgument);
    }
    let num_pages = length.div_ceil(PAGE_SIZE);
    let mut pages = Vec::with_capacity(num_pages);
    for i in 0..num_pages {
        let page_vaddr = vaddr + (i * PAGE_SIZE) as u64;
        if sched.thread(owner).vm_table.entry(page_vaddr).is_some() {
            return Err(KernelError::AlreadyExists);
        }
        pages.push(page_vaddr);
    }

    let mmap_id = sched.thread_mut(owner).vm_table.register_mmap(pages.clone());

    for (i, &page_vaddr) in pages.iter().enumerate() {
        let page_offset = file_offset + (i * PAGE_SIZE) as u64;
        let remaining = inode_len.saturating_sub(page_offset);
        let read_bytes = (remaining.min(PAGE_SIZE as u64)) as usize;
        let entry = VmEntry::new(
            page_vaddr,
            true,
            VmEntryKind::File {
                inode_sector,
                file_offset: page_offset,
                read_bytes,
                mmap_id,
            },
        );
        sched.thread_mut(owner).vm_table.insert_entry(entry)?;
    }
    Ok(mmap_id)
}

/// Unmaps a previous `mmap`, writing back any page whose dirty bit is set.
pub fn munmap<D1: BlockDevice, D2: BlockDevice, A: FrameAllocator>(
    sched: &mut Scheduler,
    frames: &mut FrameTable<A>,
    swap: &mut SwapTable<D1>,
    cache: &mut BufferCache<D2>,
    inode_table: &mut InodeTable,
    owner: Tid,
    mmap_id: u32,
) -> Result<()> {
    let pages = sched
        .thread_mut(owner)
        .vm_table
        .unregister_mmap(mmap_id)
        .ok_or(KernelError::NoSuchEntry)?;

    for vpage in pages {
        let dirty = sched.thread(owner).vm_table.page_table.dirty(vpage);
        let frame = sched.thread(owner).vm_table.page_table.frame_of(vpage);
        let entry = sched.thread_mut(owner).vm_table.remove_entry(vpage);
        if let (Some(entry), Some(frame)) = (&entry, frame) {
            if dirty {
                if let VmEntryKind::File {
                    inode_sector,
                    file_offset,
                    read_bytes,
                    ..
                } = entry.kind
                {
                    let data = frames.read_frame(frame);
                    // write_at only grows a file past read_bytes, which can't
                    // happen here (bounded by the file's length at mmap time),
                    // so this freemap is never actually touched.
                    let mut scratch = FreeMap::new(0);
                    inode_table.write_at(
                        cache,
                        sched,
                        &mut scratch,
                        inode_sector,
                        &data[..read_bytes.min(PAGE_SIZE)],
                        file_offset,
                    )?;
                }
            }
        }
        if let Some(frame) = frame {
            frames.free(frame);
        } else if let Some(entry) = entry {
            if let Some(slot) = entry.swap_slot {
                swap.discard(slot);
            }
        }
    }
    Ok(())
}
