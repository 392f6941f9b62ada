//! Global frame table and clock (second-chance) eviction.
//!
//! Grounded on `original_source/vm/frame.c`: one global table shared by
//! every process, evicted by a clock hand that sweeps all resident frames
//! regardless of which process owns them. `original_source` stores frame
//! contents directly in the mapped physical page; since this crate does
//! not model real physical memory (out of scope), [`FrameTable`]
//! keeps each resident frame's bytes itself, the same way
//! [`crate::hal::MemBlockDevice`] stands in for a real disk.

use crate::cache::BufferCache;
use crate::error::{KernelError, Result};
use crate::fs::InodeTable;
use crate::hal::{BlockDevice, FrameAllocator, PageTable, PhysFrame, PAGE_SIZE};
use crate::thread::scheduler::Scheduler;
use crate::thread::Tid;
use crate::vm::entry::{VmEntryKind, VPage};
use crate::vm::swap::SwapTable;
use std::collections::{HashMap, HashSet};

/// Owns physical frame allocation, residency bookkeeping, and clock
/// eviction across every process's address space.
pub struct FrameTable<A> {
    allocator: A,
    content: HashMap<PhysFrame, [u8; PAGE_SIZE]>,
    owners: HashMap<PhysFrame, (Tid, VPage)>,
    clock: Vec<PhysFrame>,
    hand: usize,
    pinned: HashSet<PhysFrame>,
}

impl<A: FrameAllocator> FrameTable<A> {
    pub fn new(allocator: A) -> Self {
        Self {
            allocator,
            content: HashMap::new(),
            owners: HashMap::new(),
            clock: Vec::new(),
            hand: 0,
            pinned: HashSet::new(),
        }
    }

    /// Reads a resident frame's contents.
    pub fn read_frame(&self, frame: PhysFrame) -> [u8; PAGE_SIZE] {
        self.content.get(&frame).copied().unwrap_or([0u8; PAGE_SIZE])
    }

    /// Overwrites a resident frame's contents.
    pub fn write_frame(&mut self, frame: PhysFrame, data: [u8; PAGE_SIZE]) {
        self.content.insert(frame, data);
    }

    /// Pins a frame so it cannot be chosen as an eviction victim, e.g.
    /// while a syscall argument buffer is being copied.
    pub fn pin(&mut self, frame: PhysFrame) {
        self.pinned.insert(frame);
    }

    pub fn unpin(&mut self, frame: PhysFrame) {
        self.pinned.remove(&frame);
    }

    pub fn resident_count(&self) -> usize {
        self.clock.len()
    }

    /// Allocates a frame for `owner`'s `vpage`, evicting a victim if
    /// physical memory is exhausted. `swap`, `cache`, and `inode_table`
    /// back the write-back path a victim eviction may need.
    pub fn alloc_for<D1: BlockDevice, D2: BlockDevice>(
        &mut self,
        sched: &mut Scheduler,
        swap: &mut SwapTable<D1>,
        cache: &mut BufferCache<D2>,
        inode_table: &mut InodeTable,
        owner: Tid,
        vpage: VPage,
    ) -> Result<PhysFrame> {
        let frame = match self.allocator.alloc() {
            Ok(f) => f,
            Err(_) => self.evict_one(sched, swap, cache, inode_table)?,
        };
        self.owners.insert(frame, (owner, vpage));
        self.content.insert(frame, [0u8; PAGE_SIZE]);
        self.clock.push(frame);
        Ok(frame)
    }

    /// Releases `frame` without any write-back, used when a page is
    /// explicitly unmapped (e.g. `munmap`, process exit) rather than
    /// evicted.
    pub fn free(&mut self, frame: PhysFrame) {
        self.owners.remove(&frame);
        self.content.remove(&frame);
        self.clock.retain(|&f| f != frame);
        self.pinned.remove(&frame);
        self.allocator.free(frame);
    }

    fn evict_one<D1: BlockDevice, D2: BlockDevice>(
        &mut self,
        sched: &mut Scheduler,
        swap: &mut SwapTable<D1>,
        cache: &mut BufferCache<D2>,
        inode_table: &mut InodeTable,
    ) -> Result<PhysFrame> {
        let n = self.clock.len();
        if n == 0 {
            return Err(KernelError::ResourceExhausted);
        }
        let mut scanned = 0;
        let victim = loop {
            if scanned >= 2 * n {
                return Err(KernelError::ResourceExhausted);
            }
            let idx = self.hand % n;
            self.hand = (self.hand + 1) % n;
            scanned += 1;
            let frame = self.clock[idx];
            if self.pinned.contains(&frame) {
                continue;
            }
            let (owner, vpage) = self.owners[&frame];
            let accessed = sched.thread(owner).vm_table.page_table.accessed(vpage);
            if accessed {
                sched
                    .thread_mut(owner)
                    .vm_table
                    .page_table
                    .clear_accessed(vpage);
                continue;
            }
            break frame;
        };

        let (owner, vpage) = self.owners[&victim];
        log::debug!("evicting frame {:?} owned by {:?} page {:#x}", victim, owner, vpage);
        let dirty = sched.thread(owner).vm_table.page_table.dirty(vpage);
        let data = self.content[&victim];
        let kind = sched
            .thread(owner)
            .vm_table
            .entry(vpage)
            .map(|e| e.kind.clone())
            .ok_or(KernelError::NoSuchEntry)?;

        match kind {
            VmEntryKind::Bin {
                inode_sector,
                file_offset,
                read_bytes,
            } => {
                if dirty {
                    // Writing back within read_bytes never extends the file,
                    // so this freemap is never actually touched.
                    inode_table.write_at(
                        cache,
                        sched,
                        &mut crate::fs::FreeMap::new(0),
                        inode_sector,
                        &data[..read_bytes.min(PAGE_SIZE)],
                        file_offset,
                    )?;
                }
                // A BIN page is retyped to ANON and swapped regardless of
                // its dirty bit: once evicted it is no longer reloadable
                // byte-for-byte from the executable.
                let slot = swap.swap_out(&data)?;
                let entry = sched
                    .thread_mut(owner)
                    .vm_table
                    .entry_mut(vpage)
                    .ok_or(KernelError::NoSuchEntry)?;
                entry.kind = VmEntryKind::Anon;
                entry.swap_slot = Some(slot);
            }
            VmEntryKind::File {
                inode_sector,
                file_offset,
                read_bytes,
                ..
            } => {
                if dirty {
                    inode_table.write_at(
                        cache,
                        sched,
                        &mut crate::fs::FreeMap::new(0),
                        inode_sector,
                        &data[..read_bytes.min(PAGE_SIZE)],
                        file_offset,
                    )?;
                }
            }
            VmEntryKind::Anon => {
                let slot = swap.swap_out(&data)?;
                sched.thread_mut(owner).vm_table.entry_mut(vpage).unwrap().swap_slot = Some(slot);
            }
        }

        sched
            .thread_mut(owner)
            .vm_table
            .page_table
            .unmap(vpage);
        sched.thread_mut(owner).vm_table.entry_mut(vpage).unwrap().frame = None;
        self.owners.remove(&victim);
        self.content.remove(&victim);
        self.clock.retain(|&f| f != victim);
        self.allocator.free(victim);
        self.allocator.alloc()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{MemBlockDevice, PoolFrameAllocator};
    use crate::vm::entry::VmEntry;

    #[test]
    fn alloc_succeeds_while_frames_available() {
        let mut ft = FrameTable::new(PoolFrameAllocator::new(2));
        let mut sched = Scheduler::new(false);
        let tid = sched.spawn("a", 31);
        let mut swap = SwapTable::new(MemBlockDevice::new(8));
        let mut cache = BufferCache::new(MemBlockDevice::new(8), 4);
        let mut inodes = InodeTable::new();

        sched
            .thread_mut(tid)
            .vm_table
            .insert_entry(VmEntry::new(0x1000, true, VmEntryKind::Anon))
            .unwrap();
        let frame = ft
            .alloc_for(&mut sched, &mut swap, &mut cache, &mut inodes, tid, 0x1000)
            .unwrap();
        sched.thread_mut(tid).vm_table.page_table.map(0x1000, frame, true);
        assert_eq!(ft.resident_count(), 1);
    }

    #[test]
    fn eviction_swaps_out_accessed_anon_page() {
        let mut ft = FrameTable::new(PoolFrameAllocator::new(1));
        let mut sched = Scheduler::new(false);
        let tid = sched.spawn("a", 31);
        let mut swap = SwapTable::new(MemBlockDevice::new(16));
        let mut cache = BufferCache::new(MemBlockDevice::new(8), 4);
        let mut inodes = InodeTable::new();

        sched
            .thread_mut(tid)
            .vm_table
            .insert_entry(VmEntry::new(0x1000, true, VmEntryKind::Anon))
            .unwrap();
        let frame1 = ft
            .alloc_for(&mut sched, &mut swap, &mut cache, &mut inodes, tid, 0x1000)
            .unwrap();
        sched.thread_mut(tid).vm_table.page_table.map(0x1000, frame1, true);
        ft.write_frame(frame1, [9u8; PAGE_SIZE]);

        sched
            .thread_mut(tid)
            .vm_table
            .insert_entry(VmEntry::new(0x2000, true, VmEntryKind::Anon))
            .unwrap();
        // Only one physical frame exists; allocating for the second page
        // must evict the first.
        let frame2 = ft
            .alloc_for(&mut sched, &mut swap, &mut cache, &mut inodes, tid, 0x2000)
            .unwrap();
        sched.thread_mut(tid).vm_table.page_table.map(0x2000, frame2, true);

        assert!(sched.thread(tid).vm_table.entry(0x1000).unwrap().swap_slot.is_some());
        assert!(sched.thread(tid).vm_table.entry(0x1000).unwrap().frame.is_none());
    }
}
