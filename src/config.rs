//! Runtime kernel configuration.
//!
//! The teacher kernel sizes its cache, frame pool, and swap area with
//! compile-time constants (`CACHE_SIZE`, Kconfig-style `cfg!` knobs).
//! Since this crate is meant to be exercised by tests at a much smaller
//! scale than a real 64-entry cache or multi-megabyte swap disk, those
//! sizes are runtime values here instead, gathered into one struct passed
//! to [`crate::kernel::Kernel::new`].

/// Sizing and policy knobs for a [`crate::kernel::Kernel`] instance.
#[derive(Debug, Clone, Copy)]
pub struct KernelConfig {
    /// Number of sectors on the filesystem device, used to size the free
    /// map.
    pub fs_sectors: u32,
    /// Number of slots in the buffer cache (reference sizing: 64).
    pub cache_capacity: usize,
    /// Whether the scheduler uses the MLFQS instead of plain
    /// priority scheduling with donation.
    pub mlfqs: bool,
}

impl KernelConfig {
    /// Reference sizing: a 64-entry cache, MLFQS disabled.
    pub fn reference_default(fs_sectors: u32) -> Self {
        Self {
            fs_sectors,
            cache_capacity: crate::cache::DEFAULT_CACHE_SIZE,
            mlfqs: false,
        }
    }
}
