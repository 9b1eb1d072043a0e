//! # Physical Page Pool
//!
//! The kernel-side allocator for guest physical memory. DRAM is partitioned
//! into four pools; each pool owns an ordered chain of managers, one per
//! layout region. A manager is a buddy heap plus a `u16` reference count for
//! every page it covers and an optimized-memory bitmap.
//!
//! ## Locking
//!
//! Each pool has its own lock guarding its managers' heaps and reference
//! counts. The lock is never held across calls into other components.
//!
//! ## Optimized memory
//!
//! A pool may register one "optimized" process. Pages handed to that
//! process are only filled the first time they reach it; a set bit in the
//! manager's bitmap means the page already belongs to the optimized process
//! and holds data it may see. Allocations for any other process clear the
//! bits so the page is filled again when it comes back. The bitmap is read
//! outside the pool lock while the optimized process fills its pages, so its
//! words are atomics: writers use release read-modify-writes and the
//! unlocked reader uses acquire loads.

use super::layout::{AllocationOption, Direction, Pool, PoolLayout};
use super::page_group::PageGroup;
use super::page_heap::{self, PageHeap};
use crate::{MemError, MemResult};
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use guestmem_hal::{HostMemory, PhysAddr, VirtualBuffer, PAGE_SIZE};
use spin::Mutex;
use std::sync::Arc;

/// Immutable description of one manager
struct ManagerInfo {
    start: PhysAddr,
    end: PhysAddr,
    pool: Pool,
    /// Position in the pool's manager chain
    slot: usize,
    optimize_map: Box<[AtomicU64]>,
}

impl ManagerInfo {
    #[inline]
    fn page_offset(&self, address: PhysAddr) -> usize {
        (address.offset_from(self.start) / PAGE_SIZE) as usize
    }

    #[inline]
    fn pages_to_end(&self, address: PhysAddr) -> u64 {
        self.end.offset_from(address) / PAGE_SIZE
    }

    #[inline]
    fn bit(offset: usize) -> (usize, u64) {
        (offset / 64, 1 << (offset % 64))
    }

    fn track_unoptimized(&self, address: PhysAddr, num_pages: u64) {
        let offset = self.page_offset(address);
        for page in offset..offset + num_pages as usize {
            let (word, bit) = Self::bit(page);
            self.optimize_map[word].fetch_and(!bit, Ordering::Release);
        }
    }

    fn track_optimized(&self, address: PhysAddr, num_pages: u64) {
        let offset = self.page_offset(address);
        for page in offset..offset + num_pages as usize {
            let (word, bit) = Self::bit(page);
            self.optimize_map[word].fetch_or(bit, Ordering::Release);
        }
    }

    /// Fill every page the optimized process has not seen yet. Returns
    /// whether any page was filled.
    fn process_optimized(
        &self,
        host: &HostMemory,
        address: PhysAddr,
        num_pages: u64,
        fill_pattern: u8,
    ) -> MemResult<bool> {
        let offset = self.page_offset(address);
        let mut any_new = false;
        for page in offset..offset + num_pages as usize {
            let (word, bit) = Self::bit(page);
            if self.optimize_map[word].load(Ordering::Acquire) & bit == 0 {
                any_new = true;
                let page_address = self.start.add(page as u64 * PAGE_SIZE);
                host.fill_backing(page_address.dram_offset(), PAGE_SIZE, fill_pattern)?;
            }
        }
        Ok(any_new)
    }

    fn clear_optimize_map(&self) {
        for word in self.optimize_map.iter() {
            word.store(0, Ordering::Release);
        }
    }
}

/// Mutable per-manager state, guarded by the pool lock
struct Manager {
    heap: PageHeap,
    ref_counts: VirtualBuffer<u16>,
}

impl Manager {
    fn open_first(&mut self, info: &ManagerInfo, address: PhysAddr, num_pages: u64) {
        let offset = info.page_offset(address);
        for count in &mut self.ref_counts[offset..offset + num_pages as usize] {
            *count += 1;
            assert_eq!(*count, 1, "first open of page already referenced");
        }
    }

    fn open(&mut self, info: &ManagerInfo, address: PhysAddr, num_pages: u64) {
        let offset = info.page_offset(address);
        for count in &mut self.ref_counts[offset..offset + num_pages as usize] {
            *count = count.checked_add(1).expect("page reference count overflow");
            assert!(*count > 1, "open of unreferenced page");
        }
    }

    fn close(&mut self, info: &ManagerInfo, address: PhysAddr, num_pages: u64) {
        let offset = info.page_offset(address);
        let mut free_start = 0;
        let mut free_count = 0;

        for index in offset..offset + num_pages as usize {
            let count = &mut self.ref_counts[index];
            assert!(*count > 0, "close of unreferenced page");
            *count -= 1;
            if *count != 0 {
                continue;
            }

            if free_count > 0 && free_start + free_count == index {
                free_count += 1;
            } else {
                if free_count > 0 {
                    self.heap.free(Self::address(info, free_start), free_count as u64);
                }
                free_start = index;
                free_count = 1;
            }
        }

        if free_count > 0 {
            self.heap.free(Self::address(info, free_start), free_count as u64);
        }
    }

    #[inline]
    fn address(info: &ManagerInfo, offset: usize) -> PhysAddr {
        info.start.add(offset as u64 * PAGE_SIZE)
    }
}

struct PoolState {
    managers: Vec<Manager>,
    optimized_process: Option<u64>,
}

/// Physical page allocator over all four pools
pub struct PhysicalPagePool {
    host: Arc<HostMemory>,
    /// All managers in address order
    managers: Vec<ManagerInfo>,
    /// Indices into `managers` for each pool's chain, in address order
    chains: [Vec<usize>; Pool::COUNT],
    pools: [Mutex<PoolState>; Pool::COUNT],
}

fn chain_order(count: usize, direction: Direction) -> impl Iterator<Item = usize> {
    (0..count).map(move |index| match direction {
        Direction::FromFront => index,
        Direction::FromBack => count - 1 - index,
    })
}

impl PhysicalPagePool {
    /// Build the pools described by `layout` over `host`'s DRAM backing
    pub fn new(layout: &PoolLayout, host: Arc<HostMemory>) -> MemResult<Self> {
        if layout.end().dram_offset() > host.backing_size() {
            return Err(MemError::InvalidMemoryRange);
        }

        let mut managers = Vec::with_capacity(layout.regions().len());
        let mut chains: [Vec<usize>; Pool::COUNT] = Default::default();
        let mut states: [Vec<Manager>; Pool::COUNT] = Default::default();

        for region in layout.regions() {
            let num_pages = (region.size / PAGE_SIZE) as usize;
            let pool = region.pool.index();

            let mut manager = Manager {
                heap: PageHeap::new(region.start, region.size),
                ref_counts: VirtualBuffer::new(num_pages)?,
            };
            let info = ManagerInfo {
                start: region.start,
                end: region.end(),
                pool: region.pool,
                slot: states[pool].len(),
                optimize_map: (0..num_pages.div_ceil(64)).map(|_| AtomicU64::new(0)).collect(),
            };

            match layout.initial_process() {
                Some((ini_start, ini_size))
                    if region.start <= ini_start && ini_start.add(ini_size) <= region.end() =>
                {
                    let ini_end = ini_start.add(ini_size);
                    manager.heap.free(region.start, ini_start.offset_from(region.start) / PAGE_SIZE);
                    manager.open_first(&info, ini_start, ini_size / PAGE_SIZE);
                    manager.heap.free(ini_end, region.end().offset_from(ini_end) / PAGE_SIZE);
                }
                _ => manager.heap.free(region.start, num_pages as u64),
            }

            chains[pool].push(managers.len());
            states[pool].push(manager);
            managers.push(info);
        }

        let pools = states.map(|managers| Mutex::new(PoolState { managers, optimized_process: None }));

        for pool in Pool::ALL {
            log::info!(
                "{} pool: {} managers, {:#x} bytes",
                pool,
                chains[pool.index()].len(),
                layout.pool_size(pool)
            );
        }

        Ok(Self { host, managers, chains, pools })
    }

    /// Host memory the pool fills pages through
    pub fn host(&self) -> &Arc<HostMemory> {
        &self.host
    }

    fn manager_index(&self, address: PhysAddr) -> Option<usize> {
        let index = self.managers.partition_point(|info| info.end <= address);
        self.managers
            .get(index)
            .filter(|info| info.start <= address)
            .map(|_| index)
    }

    /// Pool owning `address`
    pub fn pool_of(&self, address: PhysAddr) -> Option<Pool> {
        self.manager_index(address).map(|index| self.managers[index].pool)
    }

    /// Split `[address, address + num_pages)` at manager boundaries
    fn for_each_chunk(
        &self,
        mut address: PhysAddr,
        mut num_pages: u64,
        mut f: impl FnMut(&ManagerInfo, PhysAddr, u64),
    ) {
        while num_pages > 0 {
            let index = self
                .manager_index(address)
                .unwrap_or_else(|| panic!("physical address {address:#x} is not managed"));
            let info = &self.managers[index];
            let pages = num_pages.min(info.pages_to_end(address));
            f(info, address, pages);
            num_pages -= pages;
            address = address.add(pages * PAGE_SIZE);
        }
    }

    // =========================================================================
    // Reference Counting
    // =========================================================================

    /// Take the first reference to freshly allocated pages
    pub fn open_first(&self, address: PhysAddr, num_pages: u64) {
        self.for_each_chunk(address, num_pages, |info, address, pages| {
            let mut state = self.pools[info.pool.index()].lock();
            state.managers[info.slot].open_first(info, address, pages);
        });
    }

    /// Take an additional reference to referenced pages
    pub fn open(&self, address: PhysAddr, num_pages: u64) {
        self.for_each_chunk(address, num_pages, |info, address, pages| {
            let mut state = self.pools[info.pool.index()].lock();
            state.managers[info.slot].open(info, address, pages);
        });
    }

    /// Drop a reference; pages reaching zero return to their heap
    pub fn close(&self, address: PhysAddr, num_pages: u64) {
        self.for_each_chunk(address, num_pages, |info, address, pages| {
            let mut state = self.pools[info.pool.index()].lock();
            state.managers[info.slot].close(info, address, pages);
        });
    }

    /// Reference count of the page containing `address`
    pub fn ref_count(&self, address: PhysAddr) -> Option<u16> {
        let info = &self.managers[self.manager_index(address)?];
        let state = self.pools[info.pool.index()].lock();
        Some(state.managers[info.slot].ref_counts[info.page_offset(address)])
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Allocate `num_pages` contiguous pages aligned to `align_pages` and
    /// take the first reference. Returns the null address on failure.
    pub fn allocate_and_open_continuous(
        &self,
        num_pages: u64,
        align_pages: u64,
        option: AllocationOption,
    ) -> PhysAddr {
        if num_pages == 0 {
            return PhysAddr::NULL;
        }
        let Some(index) = page_heap::aligned_block_index(num_pages, align_pages) else {
            return PhysAddr::NULL;
        };

        let pool = option.pool.index();
        let chain = &self.chains[pool];
        let mut state = self.pools[pool].lock();
        let track_unoptimized = state.optimized_process.is_some();

        for slot in chain_order(chain.len(), option.direction) {
            let info = &self.managers[chain[slot]];
            let manager = &mut state.managers[slot];
            if let Some(address) = manager.heap.allocate_aligned(index, num_pages) {
                if track_unoptimized {
                    info.track_unoptimized(address, num_pages);
                }
                manager.open_first(info, address, num_pages);
                log::trace!("Allocated {num_pages} contiguous pages at {address:#x} from {}", option.pool);
                return address;
            }
        }

        log::debug!("{} pool cannot satisfy {num_pages} contiguous pages", option.pool);
        PhysAddr::NULL
    }

    fn allocate_page_group_locked(
        &self,
        state: &mut PoolState,
        out: &mut PageGroup,
        mut num_pages: u64,
        option: AllocationOption,
        track_unoptimized: bool,
        random: bool,
    ) -> MemResult<()> {
        assert!(out.is_empty(), "allocation into a non-empty page group");
        let heap_index = page_heap::block_index(num_pages).ok_or(MemError::OutOfMemory)?;
        let chain = &self.chains[option.pool.index()];

        let result = (|| {
            for index in (0..=heap_index).rev() {
                let pages_per_alloc = page_heap::block_num_pages(index);
                for slot in chain_order(chain.len(), option.direction) {
                    let info = &self.managers[chain[slot]];
                    while num_pages >= pages_per_alloc {
                        let manager = &mut state.managers[slot];
                        let Some(block) = manager.heap.allocate_block(index, random) else {
                            break;
                        };
                        if let Err(err) = out.add_block(block, pages_per_alloc) {
                            manager.heap.free(block, pages_per_alloc);
                            return Err(err);
                        }
                        if track_unoptimized {
                            info.track_unoptimized(block, pages_per_alloc);
                        }
                        num_pages -= pages_per_alloc;
                    }
                }
                if num_pages == 0 {
                    break;
                }
            }
            if num_pages == 0 {
                Ok(())
            } else {
                Err(MemError::OutOfMemory)
            }
        })();

        if let Err(err) = result {
            for block in out.blocks() {
                self.for_each_chunk(block.address(), block.num_pages(), |info, address, pages| {
                    state.managers[info.slot].heap.free(address, pages);
                });
            }
            out.finalize();
            log::debug!("{} pool allocation failed: {err}", option.pool);
            return Err(err);
        }
        Ok(())
    }

    fn open_first_group_locked(&self, state: &mut PoolState, group: &PageGroup) {
        for block in group.blocks() {
            self.for_each_chunk(block.address(), block.num_pages(), |info, address, pages| {
                state.managers[info.slot].open_first(info, address, pages);
            });
        }
    }

    /// Allocate `num_pages` (not necessarily contiguous) into `out` and take
    /// the first reference to each page. Blocks are picked at random.
    pub fn allocate_and_open(
        &self,
        out: &mut PageGroup,
        num_pages: u64,
        option: AllocationOption,
    ) -> MemResult<()> {
        let mut state = self.pools[option.pool.index()].lock();
        let track_unoptimized = state.optimized_process.is_some();
        self.allocate_page_group_locked(&mut state, out, num_pages, option, track_unoptimized, true)?;
        self.open_first_group_locked(&mut state, out);
        Ok(())
    }

    /// Allocate pages for `process_id`, take the first reference, and fill
    /// them with `fill_pattern`. The pool's optimized process only gets the
    /// pages it has not seen before filled.
    pub fn allocate_for_process(
        &self,
        out: &mut PageGroup,
        num_pages: u64,
        option: AllocationOption,
        process_id: u64,
        fill_pattern: u8,
    ) -> MemResult<()> {
        let pool = option.pool.index();
        let optimized = {
            let mut state = self.pools[pool].lock();
            let optimized = state.optimized_process == Some(process_id);
            let track_unoptimized = state.optimized_process.is_some() && !optimized;
            self.allocate_page_group_locked(&mut state, out, num_pages, option, track_unoptimized, false)?;
            self.open_first_group_locked(&mut state, out);
            optimized
        };

        if optimized {
            for block in out.blocks() {
                let mut result = Ok(());
                self.for_each_chunk(block.address(), block.num_pages(), |info, address, pages| {
                    if result.is_err() {
                        return;
                    }
                    match info.process_optimized(&self.host, address, pages, fill_pattern) {
                        Ok(true) => {
                            let _guard = self.pools[pool].lock();
                            info.track_optimized(address, pages);
                        }
                        Ok(false) => {}
                        Err(err) => result = Err(err),
                    }
                });
                result?;
            }
        } else {
            for block in out.blocks() {
                self.host.fill_backing(block.address().dram_offset(), block.size(), fill_pattern)?;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Optimized Memory
    // =========================================================================

    /// Register `process_id` as `pool`'s optimized process
    pub fn initialize_optimized_memory(&self, process_id: u64, pool: Pool) -> MemResult<()> {
        let mut state = self.pools[pool.index()].lock();
        if state.optimized_process.is_some() {
            return Err(MemError::Busy);
        }
        state.optimized_process = Some(process_id);

        for &index in &self.chains[pool.index()] {
            self.managers[index].clear_optimize_map();
        }
        log::debug!("Process {process_id} is the optimized process of the {pool} pool");
        Ok(())
    }

    /// Unregister `process_id` if it is `pool`'s optimized process
    pub fn finalize_optimized_memory(&self, process_id: u64, pool: Pool) {
        let mut state = self.pools[pool.index()].lock();
        if state.optimized_process == Some(process_id) {
            state.optimized_process = None;
        }
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    /// Total bytes managed
    pub fn size(&self) -> u64 {
        self.managers.iter().map(|info| info.end.offset_from(info.start)).sum()
    }

    /// Bytes managed by `pool`
    pub fn pool_size(&self, pool: Pool) -> u64 {
        self.chains[pool.index()]
            .iter()
            .map(|&index| self.managers[index].end.offset_from(self.managers[index].start))
            .sum()
    }

    /// Free bytes across all pools
    pub fn free_size(&self) -> u64 {
        Pool::ALL.iter().map(|&pool| self.pool_free_size(pool)).sum()
    }

    /// Free bytes in `pool`
    pub fn pool_free_size(&self, pool: Pool) -> u64 {
        let state = self.pools[pool.index()].lock();
        state.managers.iter().map(|manager| manager.heap.free_size()).sum()
    }
}

impl fmt::Debug for PhysicalPagePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicalPagePool")
            .field("managers", &self.managers.len())
            .field("size", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physical::layout::PoolRegion;
    use crate::physical::page_group::BlockInfoManager;
    use guestmem_hal::DRAM_BASE;

    const MIB: u64 = 1 << 20;

    struct Fixture {
        pool: Arc<PhysicalPagePool>,
        infos: Arc<BlockInfoManager>,
    }

    impl Fixture {
        fn new() -> Self {
            let base = PhysAddr::new(DRAM_BASE);
            let layout = PoolLayout::new(vec![
                PoolRegion::new(base, 2 * MIB, Pool::System),
                PoolRegion::new(base.add(2 * MIB), MIB, Pool::SystemNonSecure),
                PoolRegion::new(base.add(3 * MIB), MIB, Pool::Applet),
                PoolRegion::new(base.add(4 * MIB), 2 * MIB, Pool::Application),
                PoolRegion::new(base.add(6 * MIB), 2 * MIB, Pool::Application),
            ])
            .unwrap();
            let host = Arc::new(HostMemory::new(8 * MIB, 0).unwrap());
            Self {
                pool: Arc::new(PhysicalPagePool::new(&layout, host).unwrap()),
                infos: Arc::new(BlockInfoManager::new(1024)),
            }
        }

        fn group(&self) -> PageGroup {
            PageGroup::new(self.pool.clone(), self.infos.clone())
        }
    }

    fn option(pool: Pool, direction: Direction) -> AllocationOption {
        AllocationOption::new(pool, direction)
    }

    #[test]
    fn test_sizes() {
        let fixture = Fixture::new();
        assert_eq!(fixture.pool.size(), 8 * MIB);
        assert_eq!(fixture.pool.pool_size(Pool::Application), 4 * MIB);
        assert_eq!(fixture.pool.free_size(), 8 * MIB);
        assert_eq!(fixture.pool.pool_of(PhysAddr::new(DRAM_BASE + 5 * MIB)), Some(Pool::Application));
        assert_eq!(fixture.pool.pool_of(PhysAddr::new(DRAM_BASE + 8 * MIB)), None);
    }

    #[test]
    fn test_continuous_direction() {
        let fixture = Fixture::new();
        let front = fixture.pool.allocate_and_open_continuous(4, 1, option(Pool::Application, Direction::FromFront));
        let back = fixture.pool.allocate_and_open_continuous(4, 1, option(Pool::Application, Direction::FromBack));
        assert!(front.as_u64() < DRAM_BASE + 6 * MIB);
        assert!(back.as_u64() >= DRAM_BASE + 6 * MIB);
        assert_eq!(fixture.pool.ref_count(front), Some(1));
        assert_eq!(fixture.pool.pool_free_size(Pool::Application), 4 * MIB - 8 * PAGE_SIZE);

        fixture.pool.close(front, 4);
        fixture.pool.close(back, 4);
        assert_eq!(fixture.pool.pool_free_size(Pool::Application), 4 * MIB);
    }

    #[test]
    fn test_continuous_alignment_and_failure() {
        let fixture = Fixture::new();
        let address = fixture.pool.allocate_and_open_continuous(3, 16, option(Pool::Applet, Direction::FromFront));
        assert!(address.is_aligned(16 * PAGE_SIZE));
        assert_eq!(fixture.pool.pool_free_size(Pool::Applet), MIB - 3 * PAGE_SIZE);

        let too_big = fixture.pool.allocate_and_open_continuous(512, 1, option(Pool::Applet, Direction::FromFront));
        assert!(too_big.is_null());
    }

    #[test]
    fn test_allocate_rolls_back_on_exhaustion() {
        let fixture = Fixture::new();
        let mut group = fixture.group();
        assert_eq!(
            fixture.pool.allocate_and_open(&mut group, 257, option(Pool::SystemNonSecure, Direction::FromFront)),
            Err(MemError::OutOfMemory)
        );
        assert!(group.is_empty());
        assert_eq!(fixture.pool.pool_free_size(Pool::SystemNonSecure), MIB);
        assert_eq!(fixture.infos.used(), 0);
    }

    #[test]
    fn test_allocate_spans_managers() {
        let fixture = Fixture::new();
        let mut group = fixture.group();
        fixture
            .pool
            .allocate_and_open(&mut group, 1024, option(Pool::Application, Direction::FromFront))
            .unwrap();
        assert_eq!(group.num_pages(), 1024);
        assert_eq!(fixture.pool.pool_free_size(Pool::Application), 0);

        group.close_and_reset();
        assert_eq!(fixture.pool.pool_free_size(Pool::Application), 4 * MIB);
    }

    #[test]
    fn test_allocate_for_process_fills() {
        let fixture = Fixture::new();
        let mut group = fixture.group();
        fixture
            .pool
            .allocate_for_process(&mut group, 3, option(Pool::System, Direction::FromFront), 7, 0x5A)
            .unwrap();

        let host = fixture.pool.host();
        for block in group.blocks() {
            let mut page = vec![0u8; block.size() as usize];
            host.read_backing(block.address().dram_offset(), &mut page).unwrap();
            assert!(page.iter().all(|&byte| byte == 0x5A));
        }
    }

    #[test]
    fn test_optimized_process_fills_once() {
        let fixture = Fixture::new();
        let pool = &fixture.pool;
        let opt = option(Pool::Application, Direction::FromFront);
        pool.initialize_optimized_memory(1, Pool::Application).unwrap();
        assert_eq!(pool.initialize_optimized_memory(2, Pool::Application), Err(MemError::Busy));

        let mut group = fixture.group();
        pool.allocate_for_process(&mut group, 1, opt, 1, 0).unwrap();
        let address = group.blocks()[0].address();

        // Data left behind by the optimized process survives a reallocation to it
        pool.host().write_backing(address.dram_offset(), b"kept").unwrap();
        group.close_and_reset();
        pool.allocate_for_process(&mut group, 1, opt, 1, 0).unwrap();
        assert_eq!(group.blocks()[0].address(), address);
        let mut data = [0u8; 4];
        pool.host().read_backing(address.dram_offset(), &mut data).unwrap();
        assert_eq!(&data, b"kept");

        // Another process touching the page forces a refill
        group.close_and_reset();
        pool.allocate_for_process(&mut group, 1, opt, 2, 0xFF).unwrap();
        group.close_and_reset();
        pool.allocate_for_process(&mut group, 1, opt, 1, 0).unwrap();
        pool.host().read_backing(address.dram_offset(), &mut data).unwrap();
        assert_eq!(data, [0; 4]);

        group.close_and_reset();
        pool.finalize_optimized_memory(2, Pool::Application);
        assert_eq!(pool.initialize_optimized_memory(3, Pool::Application), Err(MemError::Busy));
        pool.finalize_optimized_memory(1, Pool::Application);
        assert!(pool.initialize_optimized_memory(3, Pool::Application).is_ok());
    }

    #[test]
    fn test_initial_process_reserved() {
        let base = PhysAddr::new(DRAM_BASE);
        let layout = PoolLayout::new(vec![PoolRegion::new(base, MIB, Pool::Application)])
            .unwrap()
            .with_initial_process(base.add(16 * PAGE_SIZE), 8 * PAGE_SIZE)
            .unwrap();
        let host = Arc::new(HostMemory::new(MIB, 0).unwrap());
        let pool = PhysicalPagePool::new(&layout, host).unwrap();

        assert_eq!(pool.free_size(), MIB - 8 * PAGE_SIZE);
        assert_eq!(pool.ref_count(base.add(16 * PAGE_SIZE)), Some(1));
        assert_eq!(pool.ref_count(base.add(24 * PAGE_SIZE)), Some(0));
        pool.close(base.add(16 * PAGE_SIZE), 8);
        assert_eq!(pool.free_size(), MIB);
    }

    #[test]
    fn test_randomized_ref_counts_match_shadow() {
        let fixture = Fixture::new();
        let pool = &fixture.pool;
        let base = pool.allocate_and_open_continuous(64, 1, option(Pool::System, Direction::FromFront));
        assert!(!base.is_null());

        let mut shadow = [1u32; 64];
        let mut state = 0x2545_F491_4F6C_DD1Du64;
        let mut next = move || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state
        };

        for _ in 0..2000 {
            let start = (next() % 64) as usize;
            let len = 1 + (next() % (64 - start as u64).min(8)) as usize;
            let address = base.add(start as u64 * PAGE_SIZE);
            let range = start..start + len;

            if next() % 2 == 0 && shadow[range.clone()].iter().all(|&count| count > 0) {
                pool.open(address, len as u64);
                shadow[range].iter_mut().for_each(|count| *count += 1);
            } else if shadow[range.clone()].iter().all(|&count| count > 1) {
                pool.close(address, len as u64);
                shadow[range].iter_mut().for_each(|count| *count -= 1);
            }
        }

        for (page, &count) in shadow.iter().enumerate() {
            assert_eq!(pool.ref_count(base.add(page as u64 * PAGE_SIZE)), Some(count as u16));
        }

        let free_before = pool.pool_free_size(Pool::System);
        for (page, &count) in shadow.iter().enumerate() {
            for _ in 0..count {
                pool.close(base.add(page as u64 * PAGE_SIZE), 1);
            }
        }
        assert_eq!(pool.pool_free_size(Pool::System), free_before + 64 * PAGE_SIZE);
        assert_eq!(pool.pool_free_size(Pool::System), 2 * MIB);
    }

    #[test]
    #[should_panic(expected = "close of unreferenced page")]
    fn test_close_unreferenced_panics() {
        let fixture = Fixture::new();
        fixture.pool.close(PhysAddr::new(DRAM_BASE), 1);
    }
}
