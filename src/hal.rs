//! Boundaries to collaborators this crate treats as external: the
//! block-device driver, the physical frame allocator, and the page-table
//! hardware. Each is a small trait; a real kernel wiring this crate in backs
//! them with device I/O, `palloc_get_page`, and CR3-relative page-table
//! writes respectively. Unit tests back them with in-memory doubles.

use crate::error::{KernelError, Result};

/// Size in bytes of one filesystem/swap sector.
pub const SECTOR_SIZE: usize = 512;
/// Size in bytes of one virtual-memory page.
pub const PAGE_SIZE: usize = 4096;
/// Number of sectors per page, used by the swap layer.
pub const SECTORS_PER_PAGE: usize = PAGE_SIZE / SECTOR_SIZE;

/// A synchronous, sector-addressed block device.
///
/// The block-device driver exposes synchronous 512-byte sector read/write;
/// DMA, queuing, and interrupt completion are the driver's problem, not
/// this crate's.
pub trait BlockDevice {
    /// Reads sector `sector` into `buf`.
    fn read_sector(&self, sector: u32, buf: &mut [u8; SECTOR_SIZE]) -> Result<()>;
    /// Writes `buf` into sector `sector`.
    fn write_sector(&self, sector: u32, buf: &[u8; SECTOR_SIZE]) -> Result<()>;
    /// Total number of addressable sectors on this device.
    fn num_sectors(&self) -> u32;
}

/// A physical page number, opaque to the caller beyond equality/ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysFrame(pub u64);

/// Stands in for `palloc_get_page`/`palloc_free_page`: obtaining and
/// releasing a zeroed physical page. Exhaustion is reported as
/// [`KernelError::ResourceExhausted`], never a panic.
pub trait FrameAllocator {
    /// Allocates one zeroed physical frame.
    fn alloc(&self) -> Result<PhysFrame>;
    /// Frees a frame previously returned by [`FrameAllocator::alloc`].
    fn free(&self, frame: PhysFrame);
}

/// An in-memory block device, for tests and for embedding a RAM-backed
/// filesystem/swap area.
pub struct MemBlockDevice {
    sectors: std::sync::Mutex<Vec<[u8; SECTOR_SIZE]>>,
}

impl MemBlockDevice {
    /// Creates a new device with `num_sectors` zeroed sectors.
    pub fn new(num_sectors: u32) -> Self {
        Self {
            sectors: std::sync::Mutex::new(vec![[0u8; SECTOR_SIZE]; num_sectors as usize]),
        }
    }
}

impl BlockDevice for MemBlockDevice {
    fn read_sector(&self, sector: u32, buf: &mut [u8; SECTOR_SIZE]) -> Result<()> {
        let sectors = self.sectors.lock().unwrap();
        let s = sectors.get(sector as usize).ok_or(KernelError::BadAddress)?;
        buf.copy_from_slice(s);
        Ok(())
    }

    fn write_sector(&self, sector: u32, buf: &[u8; SECTOR_SIZE]) -> Result<()> {
        let mut sectors = self.sectors.lock().unwrap();
        let s = sectors
            .get_mut(sector as usize)
            .ok_or(KernelError::BadAddress)?;
        s.copy_from_slice(buf);
        Ok(())
    }

    fn num_sectors(&self) -> u32 {
        self.sectors.lock().unwrap().len() as u32
    }
}

/// A simple bump/freelist physical frame allocator over a fixed pool, used in
/// tests and as a minimal default.
pub struct PoolFrameAllocator {
    free: std::sync::Mutex<Vec<PhysFrame>>,
}

impl PoolFrameAllocator {
    /// Creates an allocator with `count` frames, numbered `0..count`.
    pub fn new(count: u64) -> Self {
        Self {
            free: std::sync::Mutex::new((0..count).rev().map(PhysFrame).collect()),
        }
    }

    /// Number of frames currently available.
    pub fn available(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

impl FrameAllocator for PoolFrameAllocator {
    fn alloc(&self) -> Result<PhysFrame> {
        self.free
            .lock()
            .unwrap()
            .pop()
            .ok_or(KernelError::ResourceExhausted)
    }

    fn free(&self, frame: PhysFrame) {
        self.free.lock().unwrap().push(frame);
    }
}

/// A per-address-space page table, abstracting over the x86 hardware
/// tables this crate does not model directly (context-switch and real
/// paging are the embedding kernel's job). The eviction algorithm in
/// `crate::vm::frame` only needs the accessed/dirty bits and the ability to
/// map/unmap a page, so that is all this trait exposes.
pub trait PageTable {
    /// Installs a mapping from `vpage` to `frame`.
    fn map(&mut self, vpage: u64, frame: PhysFrame, writable: bool);
    /// Removes any mapping for `vpage`.
    fn unmap(&mut self, vpage: u64);
    /// Whether `vpage` has been accessed (read or written) since the bit
    /// was last cleared.
    fn accessed(&self, vpage: u64) -> bool;
    /// Whether `vpage` has been written since it was mapped.
    fn dirty(&self, vpage: u64) -> bool;
    /// Clears the accessed bit, used by the clock eviction algorithm to
    /// give a page a second chance.
    fn clear_accessed(&mut self, vpage: u64);
    /// Returns the frame `vpage` currently maps to, if mapped.
    fn frame_of(&self, vpage: u64) -> Option<PhysFrame>;
}

/// An in-memory page table, standing in for real x86 page-table hardware.
/// Tests (and a real embedding kernel without MMU access, e.g. for a
/// simulator) drive accessed/dirty bits directly through
/// [`InMemoryPageTable::touch`]/[`InMemoryPageTable::touch_write`].
#[derive(Debug, Default)]
pub struct InMemoryPageTable {
    entries: std::collections::HashMap<u64, (PhysFrame, bool)>,
    accessed: std::collections::HashSet<u64>,
    dirty: std::collections::HashSet<u64>,
}

impl InMemoryPageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates a read access to `vpage`, setting its accessed bit.
    pub fn touch(&mut self, vpage: u64) {
        self.accessed.insert(vpage);
    }

    /// Simulates a write access to `vpage`, setting both accessed and dirty
    /// bits.
    pub fn touch_write(&mut self, vpage: u64) {
        self.accessed.insert(vpage);
        self.dirty.insert(vpage);
    }
}

impl PageTable for InMemoryPageTable {
    fn map(&mut self, vpage: u64, frame: PhysFrame, writable: bool) {
        self.entries.insert(vpage, (frame, writable));
        self.accessed.remove(&vpage);
        self.dirty.remove(&vpage);
    }

    fn unmap(&mut self, vpage: u64) {
        self.entries.remove(&vpage);
        self.accessed.remove(&vpage);
        self.dirty.remove(&vpage);
    }

    fn accessed(&self, vpage: u64) -> bool {
        self.accessed.contains(&vpage)
    }

    fn dirty(&self, vpage: u64) -> bool {
        self.dirty.contains(&vpage)
    }

    fn clear_accessed(&mut self, vpage: u64) {
        self.accessed.remove(&vpage);
    }

    fn frame_of(&self, vpage: u64) -> Option<PhysFrame> {
        self.entries.get(&vpage).map(|&(f, _)| f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_block_device_roundtrip() {
        let dev = MemBlockDevice::new(4);
        let mut buf = [0xAAu8; SECTOR_SIZE];
        dev.write_sector(2, &buf).unwrap();
        buf = [0u8; SECTOR_SIZE];
        dev.read_sector(2, &mut buf).unwrap();
        assert_eq!(buf, [0xAAu8; SECTOR_SIZE]);
    }

    #[test]
    fn mem_block_device_bounds() {
        let dev = MemBlockDevice::new(1);
        let buf = [0u8; SECTOR_SIZE];
        assert_eq!(dev.write_sector(5, &buf), Err(KernelError::BadAddress));
    }

    #[test]
    fn pool_frame_allocator_exhaustion() {
        let pool = PoolFrameAllocator::new(2);
        let a = pool.alloc().unwrap();
        let _b = pool.alloc().unwrap();
        assert_eq!(pool.alloc(), Err(KernelError::ResourceExhausted));
        pool.free(a);
        assert!(pool.alloc().is_ok());
    }
}
