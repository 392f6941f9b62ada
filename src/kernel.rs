//! Top-level wiring of the five core subsystems: passing a single kernel
//! context by reference rather than threading five separate parameters
//! through every call.
//!
//! Boot order follows the component dependency chain: fixed-point
//! arithmetic is a pure library with nothing to initialize and underlies
//! the scheduler; the scheduler is brought up before the buffer cache,
//! since cache eviction needs a thread context; the cache backs the inode
//! layer; and the inode layer backs the VM layer's file-backed pages.

use crate::cache::BufferCache;
use crate::config::KernelConfig;
use crate::fs::{FreeMap, InodeTable};
use crate::hal::{BlockDevice, FrameAllocator};
use crate::thread::process::ProcessTable;
use crate::thread::scheduler::Scheduler;
use crate::vm::frame::FrameTable;
use crate::vm::swap::SwapTable;

/// Every subsystem this crate implements, wired together. Generic over the
/// concrete filesystem device, swap device, and frame allocator so tests
/// can plug in the in-memory doubles from [`crate::hal`] while a real
/// embedding kernel plugs in actual hardware-backed implementations.
pub struct Kernel<Dfs, Dswap, A> {
    pub scheduler: Scheduler,
    pub cache: BufferCache<Dfs>,
    pub freemap: FreeMap,
    pub inodes: InodeTable,
    pub frames: FrameTable<A>,
    pub swap: SwapTable<Dswap>,
    pub processes: ProcessTable,
}

impl<Dfs: BlockDevice, Dswap: BlockDevice, A: FrameAllocator> Kernel<Dfs, Dswap, A> {
    /// Brings up every subsystem per `config`. Sector 0 of the filesystem
    /// device is reserved for the root-directory inode, matching
    /// `original_source`'s `filesys_format`.
    pub fn new(fs_device: Dfs, swap_device: Dswap, frame_allocator: A, config: KernelConfig) -> Self {
        log::debug!(
            "kernel boot: fs_sectors={} cache_capacity={} mlfqs={}",
            config.fs_sectors,
            config.cache_capacity,
            config.mlfqs
        );
        let mut freemap = FreeMap::new(config.fs_sectors as usize);
        freemap.reserve(0);
        Self {
            scheduler: Scheduler::new(config.mlfqs),
            cache: BufferCache::new(fs_device, config.cache_capacity),
            freemap,
            inodes: InodeTable::new(),
            frames: FrameTable::new(frame_allocator),
            swap: SwapTable::new(swap_device),
            processes: ProcessTable::new(),
        }
    }

    /// Spawns `name` as a child process of `parent` (the `exec` syscall's
    /// contract up to, but not including, ELF loading: see
    /// [`crate::thread::process::ProcessTable::spawn_child`]).
    pub fn exec_child(&mut self, parent: crate::thread::Tid, name: impl Into<String>) -> crate::thread::Tid {
        self.processes.spawn_child(
            &mut self.scheduler,
            parent,
            name,
            crate::thread::PRI_DEFAULT,
        )
    }

    /// Terminates `tid` with `status`, waking any parent blocked in
    /// [`Kernel::wait`] and transitioning the scheduler state. Returns whether the caller should yield.
    pub fn exit_thread(&mut self, tid: crate::thread::Tid, status: i32) -> bool {
        let should_yield = self.processes.signal_exited(&mut self.scheduler, tid, status);
        self.scheduler.exit_thread(tid);
        should_yield
    }

    /// A parent's blocking wait for a child's exit (the `wait` syscall; see
    /// [`crate::thread::process::ProcessTable::wait`]).
    pub fn wait(
        &mut self,
        parent: crate::thread::Tid,
        child: crate::thread::Tid,
    ) -> crate::error::Result<crate::thread::process::WaitOutcome> {
        self.processes.wait(&mut self.scheduler, parent, child)
    }

    /// Advances the clock by one tick; delegates directly to
    /// [`Scheduler::tick`]. Returns whether the caller should yield.
    pub fn tick(&mut self) -> bool {
        self.scheduler.tick()
    }

    /// Services a page fault, gluing the scheduler, frame table, swap, and
    /// filesystem together (see [`crate::vm::fault::handle_mm_fault`]).
    #[allow(clippy::too_many_arguments)]
    pub fn handle_fault(
        &mut self,
        owner: crate::thread::Tid,
        fault_addr: u64,
        is_write: bool,
        user_esp: u64,
        stack_base: u64,
    ) -> crate::error::Result<crate::vm::fault::FaultOutcome> {
        crate::vm::fault::handle_mm_fault(
            &mut self.scheduler,
            &mut self.frames,
            &mut self.swap,
            &mut self.cache,
            &mut self.inodes,
            owner,
            fault_addr,
            is_write,
            user_esp,
            stack_base,
        )
    }

    /// Maps a file into `owner`'s address space (see [`crate::vm::mmap`]).
    pub fn mmap(
        &mut self,
        owner: crate::thread::Tid,
        vaddr: u64,
        inode_sector: u32,
        file_offset: u64,
        length: usize,
    ) -> crate::error::Result<u32> {
        let inode_len = self
            .inodes
            .get(inode_sector)
            .ok_or(crate::error::KernelError::NoSuchEntry)?
            .len();
        crate::vm::mmap::mmap(
            &mut self.scheduler,
            owner,
            vaddr,
            inode_sector,
            inode_len,
            file_offset,
            length,
        )
    }

    /// Unmaps a previous [`Kernel::mmap`] (see [`crate::vm::munmap`]).
    pub fn munmap(&mut self, owner: crate::thread::Tid, mmap_id: u32) -> crate::error::Result<()> {
        crate::vm::mmap::munmap(
            &mut self.scheduler,
            &mut self.frames,
            &mut self.swap,
            &mut self.cache,
            &mut self.inodes,
            owner,
            mmap_id,
        )
    }

    /// Flushes every dirty cache entry to the filesystem device, matching
    /// `filesys_done`'s shutdown sequence.
    pub fn shutdown(&mut self) -> crate::error::Result<()> {
        log::debug!("kernel shutdown: flushing buffer cache");
        self.cache.flush_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{MemBlockDevice, PoolFrameAllocator};

    #[test]
    fn boots_and_spawns_a_thread() {
        let mut kernel = Kernel::new(
            MemBlockDevice::new(64),
            MemBlockDevice::new(64),
            PoolFrameAllocator::new(8),
            KernelConfig {
                fs_sectors: 64,
                cache_capacity: 16,
                mlfqs: false,
            },
        );
        let tid = kernel.scheduler.spawn("main", 31);
        assert_eq!(kernel.scheduler.thread(tid).priority(), 31);
    }

    #[test]
    fn create_open_mmap_and_fault_round_trip() {
        let mut kernel = Kernel::new(
            MemBlockDevice::new(64),
            MemBlockDevice::new(16),
            PoolFrameAllocator::new(8),
            KernelConfig {
                fs_sectors: 64,
                cache_capacity: 16,
                mlfqs: false,
            },
        );
        let tid = kernel.scheduler.spawn("main", 31);
        assert_eq!(kernel.scheduler.next_to_run(), Some(tid));
        kernel.inodes.create(&mut kernel.cache, &mut kernel.freemap, 1, 0).unwrap();
        kernel.inodes.open(&mut kernel.cache, &mut kernel.scheduler, 1).unwrap();
        kernel
            .inodes
            .write_at(&mut kernel.cache, &mut kernel.scheduler, &mut kernel.freemap, 1, b"hi", 0)
            .unwrap();

        let id = kernel.mmap(tid, 0x5000_0000, 1, 0, 2).unwrap();
        let outcome = kernel.handle_fault(tid, 0x5000_0000, false, 0, 0xC000_0000).unwrap();
        assert_eq!(outcome, crate::vm::fault::FaultOutcome::Loaded);
        kernel.munmap(tid, id).unwrap();
    }

    #[test]
    fn exec_wait_exit_lifecycle() {
        let mut kernel = Kernel::new(
            MemBlockDevice::new(64),
            MemBlockDevice::new(16),
            PoolFrameAllocator::new(8),
            KernelConfig {
                fs_sectors: 64,
                cache_capacity: 16,
                mlfqs: false,
            },
        );
        let parent = kernel.scheduler.spawn("main", 31);
        kernel.scheduler.next_to_run();
        let child = kernel.exec_child(parent, "child");

        // wait() blocks since the child has not exited yet.
        assert_eq!(
            kernel.wait(parent, child).unwrap(),
            crate::thread::process::WaitOutcome::Blocked
        );

        let should_yield = kernel.exit_thread(child, 11);
        assert!(should_yield, "waking the blocked parent should request a yield");
        assert_eq!(
            kernel.processes.finish_wait(&mut kernel.scheduler, parent, child).unwrap(),
            11
        );
        kernel.scheduler.reap(child);

        // A second wait on the already-reaped child reports no such entry.
        assert_eq!(
            kernel.wait(parent, child),
            Err(crate::error::KernelError::NoSuchEntry)
        );
    }
}
