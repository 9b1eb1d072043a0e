//! # Page Groups
//!
//! A page group is the currency kernel objects use to hold physical memory:
//! a run-length list of page ranges in allocation order. Holding a group
//! does not by itself keep its pages alive; references are taken and dropped
//! against the owning pool with `open`/`close`.
//!
//! Every block of every group occupies one slot of a shared, bounded
//! [`BlockInfoManager`]. Running out of slots is a resource exhaustion
//! error, not a bug.

use super::pool::PhysicalPagePool;
use crate::{MemError, MemResult};
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};
use guestmem_hal::{PhysAddr, PAGE_BITS, PAGE_SIZE};
use static_assertions::assert_eq_size;
use std::sync::Arc;

/// Bounded pool of block nodes shared by page groups
#[derive(Debug)]
pub struct BlockInfoManager {
    capacity: usize,
    used: AtomicUsize,
}

impl BlockInfoManager {
    /// Create a manager with room for `capacity` blocks
    pub const fn new(capacity: usize) -> Self {
        Self { capacity, used: AtomicUsize::new(0) }
    }

    /// Reserve one block node
    pub fn allocate(&self) -> MemResult<()> {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                (used < self.capacity).then_some(used + 1)
            })
            .map(|_| ())
            .map_err(|_| MemError::OutOfResource)
    }

    /// Release `count` block nodes
    pub fn free(&self, count: usize) {
        let previous = self.used.fetch_sub(count, Ordering::AcqRel);
        assert!(previous >= count, "block info release underflow");
    }

    /// Nodes in use
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    /// Maximum number of nodes
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// One contiguous run of physical pages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalBlock {
    page_index: u32,
    num_pages: u32,
}

assert_eq_size!(PhysicalBlock, u64);

impl PhysicalBlock {
    /// First address of the run
    #[inline]
    pub fn address(&self) -> PhysAddr {
        PhysAddr::new((self.page_index as u64) << PAGE_BITS)
    }

    /// One past the last address of the run
    #[inline]
    pub fn end_address(&self) -> PhysAddr {
        self.address().add(self.size())
    }

    /// Number of pages
    #[inline]
    pub fn num_pages(&self) -> u64 {
        self.num_pages as u64
    }

    /// Size in bytes
    #[inline]
    pub fn size(&self) -> u64 {
        self.num_pages() * PAGE_SIZE
    }

    fn try_concatenate(&mut self, page_index: u32, num_pages: u32) -> bool {
        if self.page_index.checked_add(self.num_pages) != Some(page_index) {
            return false;
        }
        match self.num_pages.checked_add(num_pages) {
            Some(total) => {
                self.num_pages = total;
                true
            }
            None => false,
        }
    }
}

/// Ordered list of physical page runs owned by one kernel object
pub struct PageGroup {
    blocks: Vec<PhysicalBlock>,
    pool: Arc<PhysicalPagePool>,
    block_infos: Arc<BlockInfoManager>,
}

impl PageGroup {
    /// Create an empty group drawing pages from `pool`
    pub fn new(pool: Arc<PhysicalPagePool>, block_infos: Arc<BlockInfoManager>) -> Self {
        Self { blocks: Vec::new(), pool, block_infos }
    }

    /// Append `num_pages` pages at `address`, merging with the last block
    /// when the ranges touch
    pub fn add_block(&mut self, address: PhysAddr, num_pages: u64) -> MemResult<()> {
        if num_pages == 0 {
            return Ok(());
        }
        if !address.is_aligned(PAGE_SIZE) {
            return Err(MemError::NotAligned);
        }
        let page_index = u32::try_from(address.page_index()).map_err(|_| MemError::InvalidAddress)?;
        let num_pages = u32::try_from(num_pages).map_err(|_| MemError::InvalidSize)?;
        page_index.checked_add(num_pages).ok_or(MemError::InvalidMemoryRange)?;

        if let Some(last) = self.blocks.last_mut() {
            if last.try_concatenate(page_index, num_pages) {
                return Ok(());
            }
        }

        self.block_infos.allocate()?;
        self.blocks.push(PhysicalBlock { page_index, num_pages });
        Ok(())
    }

    /// Take the first reference to every page
    pub fn open_first(&self) {
        for block in &self.blocks {
            self.pool.open_first(block.address(), block.num_pages());
        }
    }

    /// Take another reference to every page
    pub fn open(&self) {
        for block in &self.blocks {
            self.pool.open(block.address(), block.num_pages());
        }
    }

    /// Drop one reference to every page
    pub fn close(&self) {
        for block in &self.blocks {
            self.pool.close(block.address(), block.num_pages());
        }
    }

    /// Drop one reference to every page and empty the group
    pub fn close_and_reset(&mut self) {
        self.close();
        self.finalize();
    }

    /// Empty the group without touching reference counts
    pub fn finalize(&mut self) {
        if !self.blocks.is_empty() {
            self.block_infos.free(self.blocks.len());
            self.blocks.clear();
        }
    }

    /// Blocks in append order
    pub fn blocks(&self) -> &[PhysicalBlock] {
        &self.blocks
    }

    /// Check whether the group holds no pages
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Total number of pages
    pub fn num_pages(&self) -> u64 {
        self.blocks.iter().map(PhysicalBlock::num_pages).sum()
    }

    /// Same blocks in the same order
    pub fn is_equivalent_to(&self, other: &PageGroup) -> bool {
        self.blocks == other.blocks
    }

    /// Check whether every page of `[address, address + num_pages)` is in
    /// the group
    pub fn contains_range(&self, address: PhysAddr, num_pages: u64) -> bool {
        let end = address.add(num_pages * PAGE_SIZE);
        let mut covered: Vec<_> = self
            .blocks
            .iter()
            .filter(|block| block.address() < end && block.end_address() > address)
            .map(|block| (block.address(), block.end_address()))
            .collect();
        covered.sort_unstable();

        let mut cursor = address;
        for (start, stop) in covered {
            if start > cursor {
                return false;
            }
            cursor = cursor.max(stop);
        }
        cursor >= end
    }

    /// Pool the pages belong to
    pub fn pool(&self) -> &Arc<PhysicalPagePool> {
        &self.pool
    }
}

impl PartialEq for PageGroup {
    fn eq(&self, other: &Self) -> bool {
        self.is_equivalent_to(other)
    }
}

impl Eq for PageGroup {}

impl Drop for PageGroup {
    fn drop(&mut self) {
        self.finalize();
    }
}

impl fmt::Debug for PageGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.blocks.iter().map(|block| block.address()..block.end_address()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physical::layout::{PoolLayout, PoolRegion};
    use crate::physical::Pool;
    use guestmem_hal::{HostMemory, DRAM_BASE};

    fn pool() -> Arc<PhysicalPagePool> {
        let layout = PoolLayout::new(vec![PoolRegion::new(
            PhysAddr::new(DRAM_BASE),
            64 * PAGE_SIZE,
            Pool::System,
        )])
        .unwrap();
        let host = Arc::new(HostMemory::new(64 * PAGE_SIZE, 0).unwrap());
        Arc::new(PhysicalPagePool::new(&layout, host).unwrap())
    }

    fn page(index: u64) -> PhysAddr {
        PhysAddr::new(DRAM_BASE + index * PAGE_SIZE)
    }

    #[test]
    fn test_adjacent_blocks_coalesce() {
        let infos = Arc::new(BlockInfoManager::new(8));
        let mut group = PageGroup::new(pool(), infos.clone());
        group.add_block(page(4), 2).unwrap();
        group.add_block(page(6), 3).unwrap();
        assert_eq!(group.blocks().len(), 1);
        assert_eq!(group.num_pages(), 5);
        assert_eq!(infos.used(), 1);

        group.add_block(page(20), 1).unwrap();
        assert_eq!(group.blocks().len(), 2);
        assert_eq!(infos.used(), 2);

        group.finalize();
        assert_eq!(infos.used(), 0);
    }

    #[test]
    fn test_equivalence_needs_same_sequence() {
        let pool = pool();
        let infos = Arc::new(BlockInfoManager::new(8));
        let mut a = PageGroup::new(pool.clone(), infos.clone());
        let mut b = PageGroup::new(pool, infos);

        a.add_block(page(0), 1).unwrap();
        a.add_block(page(8), 1).unwrap();
        b.add_block(page(8), 1).unwrap();
        b.add_block(page(0), 1).unwrap();
        assert!(!a.is_equivalent_to(&b));

        b.finalize();
        b.add_block(page(0), 1).unwrap();
        b.add_block(page(8), 1).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_block_info_exhaustion() {
        let infos = Arc::new(BlockInfoManager::new(1));
        let mut group = PageGroup::new(pool(), infos.clone());
        group.add_block(page(0), 1).unwrap();
        group.add_block(page(1), 1).unwrap();
        assert_eq!(group.add_block(page(3), 1), Err(MemError::OutOfResource));
        drop(group);
        assert_eq!(infos.used(), 0);
    }

    #[test]
    fn test_contains_range() {
        let infos = Arc::new(BlockInfoManager::new(8));
        let mut group = PageGroup::new(pool(), infos);
        group.add_block(page(10), 2).unwrap();
        group.add_block(page(4), 6).unwrap();
        assert!(group.contains_range(page(5), 6));
        assert!(group.contains_range(page(4), 8));
        assert!(!group.contains_range(page(3), 2));
        assert!(!group.contains_range(page(11), 2));
    }

    #[test]
    fn test_open_close_through_group() {
        let pool = pool();
        let infos = Arc::new(BlockInfoManager::new(8));
        let address = pool.allocate_and_open_continuous(
            4,
            1,
            crate::physical::AllocationOption::new(Pool::System, crate::physical::Direction::FromFront),
        );
        let mut group = PageGroup::new(pool.clone(), infos);
        group.add_block(address, 4).unwrap();

        group.open();
        assert_eq!(pool.ref_count(address), Some(2));
        group.close();
        group.close_and_reset();
        assert_eq!(pool.ref_count(address), Some(0));
        assert_eq!(pool.free_size(), 64 * PAGE_SIZE);
    }
}
