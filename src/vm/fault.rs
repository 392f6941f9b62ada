//! Page fault servicing and stack growth.
//!
//! Grounded on `original_source/userprog/exception.c`'s `page_fault`
//! handler and `vm/page.c`'s `vm_load_page`: resolve the faulting address
//! to a [`crate::vm::VmEntry`], decide whether it is an unmapped stack
//! growth or a real fault, bring the page's content in (from the
//! executable, a mapped file, or swap), and install the mapping.

use crate::cache::BufferCache;
use crate::error::{KernelError, Result};
use crate::fs::InodeTable;
use crate::hal::{BlockDevice, FrameAllocator, PageTable, PAGE_SIZE};
use crate::thread::scheduler::Scheduler;
use crate::thread::Tid;
use crate::vm::entry::VmEntryKind;
use crate::vm::frame::FrameTable;
use crate::vm::page_align_down;
use crate::vm::swap::SwapTable;

/// Maximum stack size, matching `original_source`'s 8MiB limit.
pub const MAX_STACK_SIZE: u64 = 8 * 1024 * 1024;
/// Bytes below the current `%esp` a fault is still considered plausible
/// stack growth, covering the `PUSH`/`PUSHA` instructions that can fault
/// before adjusting `%esp`.
const STACK_GROWTH_FAULT_MARGIN: u64 = 32;

/// The outcome of successfully servicing a fault, telling the caller
/// whether a fresh stack page was allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    Loaded,
    StackGrown,
}

/// Services a page fault at `fault_addr` for `owner`. `stack_base` is the
/// address immediately above the initial stack page (the first byte NOT
/// part of the stack), used to bound growth; `user_esp` is the faulting
/// thread's current stack pointer, used by the growth heuristic.
#[allow(clippy::too_many_arguments)]
pub fn handle_mm_fault<D1: BlockDevice, D2: BlockDevice, A: FrameAllocator>(
    sched: &mut Scheduler,
    frames: &mut FrameTable<A>,
    swap: &mut SwapTable<D1>,
    cache: &mut BufferCache<D2>,
    inode_table: &mut InodeTable,
    owner: Tid,
    fault_addr: u64,
    is_write: bool,
    user_esp: u64,
    stack_base: u64,
) -> Result<FaultOutcome> {
    let vpage = page_align_down(fault_addr);

    if sched.thread(owner).vm_table.entry(vpage).is_none() {
        if is_stack_growth(fault_addr, user_esp, stack_base) {
            sched.thread_mut(owner).vm_table.insert_entry(
                crate::vm::entry::VmEntry::new(vpage, true, VmEntryKind::Anon),
            )?;
        } else {
            return Err(KernelError::BadAddress);
        }
    }

    let entry_writable = sched.thread(owner).vm_table.entry(vpage).unwrap().writable;
    if is_write && !entry_writable {
        return Err(KernelError::WriteDenied);
    }

    if sched.thread(owner).vm_table.page_table.frame_of(vpage).is_some() {
        // Already resident; a write fault here would only happen for a
        // read-only mapping, already rejected above.
        return Ok(FaultOutcome::Loaded);
    }

    let swap_slot = sched.thread(owner).vm_table.entry(vpage).unwrap().swap_slot;
    let frame = frames.alloc_for(sched, swap, cache, inode_table, owner, vpage)?;
    frames.pin(frame);

    let data = if let Some(slot) = swap_slot {
        let mut buf = [0u8; PAGE_SIZE];
        swap.swap_in(slot, &mut buf)?;
        sched.thread_mut(owner).vm_table.entry_mut(vpage).unwrap().swap_slot = None;
        buf
    } else {
        load_initial_content(sched, cache, inode_table, owner, vpage)?
    };
    frames.write_frame(frame, data);
    frames.unpin(frame);

    let writable = sched.thread(owner).vm_table.entry(vpage).unwrap().writable;
    sched.thread_mut(owner).vm_table.page_table.map(vpage, frame, writable);
    sched.thread_mut(owner).vm_table.entry_mut(vpage).unwrap().frame = Some(frame);

    Ok(FaultOutcome::Loaded)
}

fn load_initial_content<D: BlockDevice>(
    sched: &mut Scheduler,
    cache: &mut BufferCache<D>,
    inode_table: &mut InodeTable,
    owner: Tid,
    vpage: u64,
) -> Result<[u8; PAGE_SIZE]> {
    let kind = sched
        .thread(owner)
        .vm_table
        .entry(vpage)
        .ok_or(KernelError::NoSuchEntry)?
        .kind
        .clone();
    let mut buf = [0u8; PAGE_SIZE];
    match kind {
        VmEntryKind::Anon => {}
        VmEntryKind::Bin {
            inode_sector,
            file_offset,
            read_bytes,
        }
        | VmEntryKind::File {
            inode_sector,
            file_offset,
            read_bytes,
            ..
        } => {
            inode_table.read_at(cache, inode_sector, &mut buf[..read_bytes], file_offset)?;
        }
    }
    Ok(buf)
}

/// The stack growth heuristic: a fault counts as growth if it falls
/// within `STACK_GROWTH_FAULT_MARGIN` bytes below the current `%esp` (to
/// tolerate `PUSH`-class instructions that fault before `%esp` moves),
/// does not exceed the stack's maximum size, and is below the stack's
/// current base.
fn is_stack_growth(fault_addr: u64, user_esp: u64, stack_base: u64) -> bool {
    if fault_addr >= stack_base {
        return false;
    }
    if fault_addr + STACK_GROWTH_FAULT_MARGIN < user_esp {
        return false;
    }
    stack_base.saturating_sub(page_align_down(fault_addr)) <= MAX_STACK_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{MemBlockDevice, PoolFrameAllocator};

    fn harness() -> (
        Scheduler,
        FrameTable<PoolFrameAllocator>,
        SwapTable<MemBlockDevice>,
        BufferCache<MemBlockDevice>,
        InodeTable,
        Tid,
    ) {
        let mut sched = Scheduler::new(false);
        let tid = sched.spawn("a", 31);
        let frames = FrameTable::new(PoolFrameAllocator::new(4));
        let swap = SwapTable::new(MemBlockDevice::new(16));
        let cache = BufferCache::new(MemBlockDevice::new(8), 4);
        let inodes = InodeTable::new();
        (sched, frames, swap, cache, inodes, tid)
    }

    #[test]
    fn stack_growth_within_margin_is_allowed() {
        let (mut sched, mut frames, mut swap, mut cache, mut inodes, tid) = harness();
        let stack_base = 0x4000_0000u64;
        let esp = stack_base - PAGE_SIZE as u64;
        let fault_addr = esp - 4;
        let outcome = handle_mm_fault(
            &mut sched, &mut frames, &mut swap, &mut cache, &mut inodes, tid, fault_addr, true, esp,
            stack_base,
        )
        .unwrap();
        assert_eq!(outcome, FaultOutcome::Loaded);
        assert!(sched
            .thread(tid)
            .vm_table
            .entry(page_align_down(fault_addr))
            .is_some());
    }

    #[test]
    fn fault_far_below_esp_is_rejected() {
        let (mut sched, mut frames, mut swap, mut cache, mut inodes, tid) = harness();
        let stack_base = 0x10_0000u64;
        let esp = stack_base - PAGE_SIZE as u64;
        let fault_addr = esp - 10 * PAGE_SIZE as u64;
        let result = handle_mm_fault(
            &mut sched, &mut frames, &mut swap, &mut cache, &mut inodes, tid, fault_addr, true, esp,
            stack_base,
        );
        assert_eq!(result, Err(KernelError::BadAddress));
    }

    #[test]
    fn fault_on_unmapped_non_stack_address_is_rejected() {
        let (mut sched, mut frames, mut swap, mut cache, mut inodes, tid) = harness();
        let result = handle_mm_fault(
            &mut sched, &mut frames, &mut swap, &mut cache, &mut inodes, tid, 0x9999_0000, false,
            0x8000_0000, 0x8000_0000,
        );
        assert_eq!(result, Err(KernelError::BadAddress));
    }
}
