//! Swap space.
//!
//! Grounded on `original_source/vm/swap.c`: a bitmap of page-sized slots
//! over a dedicated block device, `PAGE_SIZE / SECTOR_SIZE` sectors per
//! slot. As with [`crate::fs::FreeMap`], the bitmap primitive is
//! `fixedbitset` rather than a hand-rolled one.

use crate::error::Result;
use crate::fs::FreeMap;
use crate::hal::{BlockDevice, PAGE_SIZE, SECTORS_PER_PAGE, SECTOR_SIZE};

/// Swap space: a block device carved into page-sized slots.
pub struct SwapTable<D> {
    device: D,
    slots: FreeMap,
}

impl<D: BlockDevice> SwapTable<D> {
    /// Creates a swap table over `device`, which must have at least one
    /// full slot's worth of sectors.
    pub fn new(device: D) -> Self {
        let num_slots = device.num_sectors() as usize / SECTORS_PER_PAGE;
        Self {
            device,
            slots: FreeMap::new(num_slots),
        }
    }

    /// Number of free slots remaining.
    pub fn free_slots(&self) -> usize {
        self.slots.free_count()
    }

    /// Writes a full page out to a freshly allocated slot, returning its
    /// index.
    pub fn swap_out(&mut self, page: &[u8; PAGE_SIZE]) -> Result<u32> {
        let slot = self.slots.allocate()?;
        for i in 0..SECTORS_PER_PAGE {
            let mut sector = [0u8; SECTOR_SIZE];
            sector.copy_from_slice(&page[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE]);
            self.device
                .write_sector(slot * SECTORS_PER_PAGE as u32 + i as u32, &sector)?;
        }
        Ok(slot)
    }

    /// Reads slot `slot` back into `page` and frees the slot.
    pub fn swap_in(&mut self, slot: u32, page: &mut [u8; PAGE_SIZE]) -> Result<()> {
        for i in 0..SECTORS_PER_PAGE {
            let mut sector = [0u8; SECTOR_SIZE];
            self.device
                .read_sector(slot * SECTORS_PER_PAGE as u32 + i as u32, &mut sector)?;
            page[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE].copy_from_slice(&sector);
        }
        self.slots.free(slot);
        Ok(())
    }

    /// Frees a slot without reading it back (used when a swapped-out page
    /// is discarded instead of faulted back in, e.g. process exit).
    pub fn discard(&mut self, slot: u32) {
        self.slots.free(slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::MemBlockDevice;

    #[test]
    fn roundtrips_a_full_page() {
        let mut swap = SwapTable::new(MemBlockDevice::new(SECTORS_PER_PAGE as u32 * 4));
        let mut page = [0u8; PAGE_SIZE];
        page[0] = 1;
        page[PAGE_SIZE - 1] = 0xFF;
        let slot = swap.swap_out(&page).unwrap();
        let mut back = [0u8; PAGE_SIZE];
        swap.swap_in(slot, &mut back).unwrap();
        assert_eq!(page, back);
    }

    #[test]
    fn swap_in_frees_the_slot_for_reuse() {
        let mut swap = SwapTable::new(MemBlockDevice::new(SECTORS_PER_PAGE as u32));
        let page = [7u8; PAGE_SIZE];
        let slot = swap.swap_out(&page).unwrap();
        assert_eq!(swap.free_slots(), 0);
        let mut back = [0u8; PAGE_SIZE];
        swap.swap_in(slot, &mut back).unwrap();
        assert_eq!(swap.free_slots(), 1);
    }
}
