//! User memory access validation.
//!
//! A syscall argument is never dereferenced directly, only through a
//! validated pointer type that proves, at construction, that every page it
//! covers is mapped with the right permissions. The syscall dispatcher
//! itself is not this module's concern; this is the validation and frame
//! pinning layer a dispatcher would sit on top of.

use crate::error::{KernelError, Result};
use crate::hal::{FrameAllocator, PageTable, PhysFrame, PAGE_SIZE};
use crate::vm::frame::FrameTable;
use crate::vm::{page_align_down, VmTable};
use std::marker::PhantomData;

/// Checks that every page in `[addr, addr + len)` is backed by a
/// [`crate::vm::VmEntry`] with sufficient permissions, without faulting
/// any of them in. The pre-write check any syscall must pass before
/// copying to or from user memory.
pub fn access_ok(vm_table: &VmTable, addr: u64, len: usize, require_writable: bool) -> bool {
    if len == 0 {
        return true;
    }
    let last_byte = match addr.checked_add(len as u64 - 1) {
        Some(v) => v,
        None => return false,
    };
    let mut page = page_align_down(addr);
    let end_page = page_align_down(last_byte);
    loop {
        match vm_table.entry(page) {
            Some(e) if !require_writable || e.writable => {}
            _ => return false,
        }
        if page == end_page {
            return true;
        }
        page += PAGE_SIZE as u64;
    }
}

/// A validated read-only pointer into user memory: proof that
/// [`access_ok`] held at construction time.
pub struct UserPtrRO<'a, T> {
    addr: u64,
    _marker: PhantomData<&'a T>,
}

impl<'a, T> UserPtrRO<'a, T> {
    /// Validates `addr` covers `core::mem::size_of::<T>()` readable bytes.
    pub fn new(vm_table: &VmTable, addr: u64) -> Result<Self> {
        if access_ok(vm_table, addr, core::mem::size_of::<T>(), false) {
            Ok(Self {
                addr,
                _marker: PhantomData,
            })
        } else {
            Err(KernelError::BadAddress)
        }
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }
}

/// A validated write-only pointer into user memory.
pub struct UserPtrWO<'a, T> {
    addr: u64,
    _marker: PhantomData<&'a mut T>,
}

impl<'a, T> UserPtrWO<'a, T> {
    /// Validates `addr` covers `core::mem::size_of::<T>()` writable bytes.
    pub fn new(vm_table: &VmTable, addr: u64) -> Result<Self> {
        if access_ok(vm_table, addr, core::mem::size_of::<T>(), true) {
            Ok(Self {
                addr,
                _marker: PhantomData,
            })
        } else {
            Err(KernelError::BadAddress)
        }
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }
}

/// Pins every frame currently backing `[addr, addr + len)` so a
/// concurrent eviction cannot steal a page mid-copy, returning the pinned
/// frames so the caller can unpin them when the copy completes. Pages not
/// yet resident are skipped; the caller is expected to have already
/// faulted them in via [`crate::vm::fault::handle_mm_fault`].
pub fn pin_buffer<A: FrameAllocator>(
    vm_table: &VmTable,
    frames: &mut FrameTable<A>,
    addr: u64,
    len: usize,
) -> Vec<PhysFrame> {
    let mut pinned = Vec::new();
    if len == 0 {
        return pinned;
    }
    let mut page = page_align_down(addr);
    let end_page = page_align_down(addr + len as u64 - 1);
    loop {
        if let Some(frame) = vm_table.page_table.frame_of(page) {
            frames.pin(frame);
            pinned.push(frame);
        }
        if page == end_page {
            break;
        }
        page += PAGE_SIZE as u64;
    }
    pinned
}

/// Unpins frames previously pinned by [`pin_buffer`].
pub fn unpin_buffer<A: FrameAllocator>(frames: &mut FrameTable<A>, pinned: &[PhysFrame]) {
    for &frame in pinned {
        frames.unpin(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::entry::{VmEntry, VmEntryKind};

    #[test]
    fn access_ok_requires_mapped_pages() {
        let vt = VmTable::new();
        assert!(!access_ok(&vt, 0x1000, 4, false));
    }

    #[test]
    fn access_ok_rejects_write_to_read_only_page() {
        let mut vt = VmTable::new();
        vt.insert_entry(VmEntry::new(0x1000, false, VmEntryKind::Anon)).unwrap();
        assert!(access_ok(&vt, 0x1000, 4, false));
        assert!(!access_ok(&vt, 0x1000, 4, true));
    }

    #[test]
    fn user_ptr_validates_full_span() {
        let mut vt = VmTable::new();
        vt.insert_entry(VmEntry::new(0x1000, true, VmEntryKind::Anon)).unwrap();
        assert!(UserPtrRO::<u32>::new(&vt, 0x1000).is_ok());
        assert!(UserPtrWO::<u32>::new(&vt, 0x1000).is_ok());
        assert!(UserPtrRO::<u32>::new(&vt, 0x2000).is_err());
    }
}
