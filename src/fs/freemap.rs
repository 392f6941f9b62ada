//! Free-sector tracking for the filesystem, backed by `fixedbitset`.
//!
//! The filesystem needs something to track which sectors are free, the
//! same need the swap layer (`crate::vm::swap`) has for frames. Both use
//! `fixedbitset::FixedBitSet` rather than reinventing a bitset.

use crate::error::{KernelError, Result};
use fixedbitset::FixedBitSet;

/// Tracks which filesystem sectors are in use.
pub struct FreeMap {
    bits: FixedBitSet,
}

impl FreeMap {
    /// Creates a free map for `num_sectors` sectors, all initially free.
    pub fn new(num_sectors: usize) -> Self {
        Self {
            bits: FixedBitSet::with_capacity(num_sectors),
        }
    }

    /// Marks `sector` as reserved (used during filesystem formatting to
    /// reserve the boot/root sectors before normal allocation begins).
    pub fn reserve(&mut self, sector: u32) {
        self.bits.insert(sector as usize);
    }

    /// Allocates the first free sector, marking it used.
    pub fn allocate(&mut self) -> Result<u32> {
        let idx = (0..self.bits.len())
            .find(|&i| !self.bits[i])
            .ok_or(KernelError::ResourceExhausted)?;
        self.bits.insert(idx);
        Ok(idx as u32)
    }

    /// Frees a previously allocated sector.
    pub fn free(&mut self, sector: u32) {
        self.bits.set(sector as usize, false);
    }

    /// Whether `sector` is currently marked in use.
    pub fn is_used(&self, sector: u32) -> bool {
        self.bits[sector as usize]
    }

    /// Count of free sectors remaining.
    pub fn free_count(&self) -> usize {
        self.bits.len() - self.bits.count_ones(..)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_lowest_free_index_first() {
        let mut fm = FreeMap::new(4);
        assert_eq!(fm.allocate().unwrap(), 0);
        assert_eq!(fm.allocate().unwrap(), 1);
        fm.free(0);
        assert_eq!(fm.allocate().unwrap(), 0);
    }

    #[test]
    fn exhaustion_reports_error() {
        let mut fm = FreeMap::new(1);
        fm.allocate().unwrap();
        assert_eq!(fm.allocate(), Err(KernelError::ResourceExhausted));
    }

    #[test]
    fn reserve_removes_sector_from_pool() {
        let mut fm = FreeMap::new(2);
        fm.reserve(0);
        assert_eq!(fm.allocate().unwrap(), 1);
    }
}
