//! # CPU Memory
//!
//! Guest memory as seen by one process's CPU cores. Every access resolves the
//! page table entry and dispatches on its [`PageType`]:
//!
//! | Page type                | Read                          | Write                           |
//! |--------------------------|-------------------------------|---------------------------------|
//! | `Unmapped`               | logged, zero                  | logged, dropped                 |
//! | `Memory` / `DebugMemory` | backing                       | backing                         |
//! | `RasterizerCachedMemory` | GPU download, then backing    | GPU notified and tracked, then backing |
//!
//! With fastmem the same mappings are mirrored into the host view through a
//! [`HeapTracker`], and page type changes reprotect that view so the CPU
//! backend faults into the slow path.

use core::cell::Cell;
use core::fmt;
use std::sync::Arc;

use guestmem_hal::{
    DeviceAddr, HostMemory, HostMemoryBuffer, MemoryPermission, PhysAddr, VirtAddr, DRAM_BASE,
    PAGE_BITS, PAGE_MASK, PAGE_SIZE, VIRTUAL_ADDRESS_MASK,
};
use log::{debug, error, info};
use spin::Mutex;

use super::page_table::{PageEntry, PageTable, PageType};
use crate::device::{DeviceAddressTranslator, DownloadArea, ProcessMemory};
use crate::gpu_dirty::GpuDirtyTracker;
use crate::host::{HeapTracker, HeapTrackerConfig};
use crate::{MemError, MemResult, Scalar};

thread_local! {
    static CURRENT_CORE: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Bind the calling thread to an emulated CPU core; `None` for threads that
/// are not core threads
pub fn set_current_core(core: Option<usize>) {
    CURRENT_CORE.with(|current| current.set(core));
}

/// CPU memory configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuMemoryConfig {
    /// Width of the process address space
    pub address_space_bits: u32,
    /// Mirror mappings into the host view
    pub fastmem: bool,
    /// Number of emulated CPU cores; the last one also serves non-core threads
    pub cpu_cores: usize,
}

impl Default for CpuMemoryConfig {
    fn default() -> Self {
        Self { address_space_bits: 39, fastmem: false, cpu_cores: 4 }
    }
}

#[derive(Debug, Default)]
struct CoreCache {
    read_area: DownloadArea,
    write_page: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CacheOperation {
    Invalidate,
    Store,
    Flush,
}

#[derive(Debug, Clone, Copy)]
enum Backing {
    Unmapped,
    Memory(PhysAddr),
    Rasterizer(PhysAddr),
}

#[derive(Debug, Clone, Copy)]
struct Segment {
    offset: usize,
    len: usize,
    vaddr: u64,
    backing: Backing,
}

/// Page-by-page walk of a guest range; whatever lies past the end of the
/// address space is yielded as one unmapped segment
struct BlockWalk<'a> {
    page_table: &'a PageTable,
    current: u64,
    remaining: u64,
    offset: usize,
}

impl Iterator for BlockWalk<'_> {
    type Item = Segment;

    fn next(&mut self) -> Option<Segment> {
        if self.remaining == 0 {
            return None;
        }
        if self.current >= self.page_table.address_space_size() {
            let segment = Segment {
                offset: self.offset,
                len: self.remaining as usize,
                vaddr: self.current,
                backing: Backing::Unmapped,
            };
            self.remaining = 0;
            return Some(segment);
        }

        let page_offset = self.current & PAGE_MASK;
        let amount = (PAGE_SIZE - page_offset).min(self.remaining);
        let entry = self.page_table.entry(self.current >> PAGE_BITS);
        let backing = match (entry.page_type(), entry.backing()) {
            (PageType::Unmapped, _) | (_, None) => Backing::Unmapped,
            (PageType::RasterizerCachedMemory, Some(page)) => Backing::Rasterizer(page.add(page_offset)),
            (_, Some(page)) => Backing::Memory(page.add(page_offset)),
        };
        let segment = Segment { offset: self.offset, len: amount as usize, vaddr: self.current, backing };

        self.current += amount;
        self.remaining -= amount;
        self.offset += amount as usize;
        Some(segment)
    }
}

/// One process's CPU view of guest memory
pub struct CpuMemory {
    config: CpuMemoryConfig,
    host: Arc<HostMemory>,
    page_table: PageTable,
    heap_tracker: Option<HeapTracker>,
    translator: Arc<DeviceAddressTranslator>,
    dirty_trackers: Box<[GpuDirtyTracker]>,
    core_caches: Box<[Mutex<CoreCache>]>,
}

impl CpuMemory {
    /// Create the CPU view of a process sharing `translator`'s DRAM.
    ///
    /// With fastmem the host view must cover the whole address space.
    pub fn new(
        config: CpuMemoryConfig,
        translator: Arc<DeviceAddressTranslator>,
        heap_config: HeapTrackerConfig,
    ) -> MemResult<Self> {
        if config.cpu_cores == 0 {
            return Err(MemError::InvalidSize);
        }
        let page_table = PageTable::new(config.address_space_bits)?;
        let host = translator.host().clone();

        let heap_tracker = if config.fastmem {
            if host.virtual_size() < page_table.address_space_size() {
                error!(
                    "Host view of {:#x} bytes cannot hold a {}-bit address space",
                    host.virtual_size(),
                    config.address_space_bits
                );
                return Err(MemError::InvalidSize);
            }
            let buffer: Arc<dyn HostMemoryBuffer> = host.clone();
            Some(HeapTracker::new(buffer, heap_config))
        } else {
            None
        };

        info!(
            "CPU memory initialized: {}-bit address space, fastmem {}, {} cores",
            config.address_space_bits,
            if config.fastmem { "on" } else { "off" },
            config.cpu_cores
        );

        Ok(Self {
            config,
            host,
            page_table,
            heap_tracker,
            translator,
            dirty_trackers: (0..config.cpu_cores).map(|_| GpuDirtyTracker::new()).collect(),
            core_caches: (0..config.cpu_cores).map(|_| Mutex::new(CoreCache::default())).collect(),
        })
    }

    /// Configuration
    pub fn config(&self) -> CpuMemoryConfig {
        self.config
    }

    /// Host mapping tracker, when fastmem is enabled
    pub fn heap_tracker(&self) -> Option<&HeapTracker> {
        self.heap_tracker.as_ref()
    }

    /// Page table
    pub fn page_table(&self) -> &PageTable {
        &self.page_table
    }

    fn current_core(&self) -> usize {
        let system_core = self.config.cpu_cores - 1;
        CURRENT_CORE.with(Cell::get).map_or(system_core, |core| core.min(system_core))
    }

    fn walk(&self, vaddr: VirtAddr, size: u64) -> BlockWalk<'_> {
        BlockWalk { page_table: &self.page_table, current: vaddr.as_u64(), remaining: size, offset: 0 }
    }

    // =========================================================================
    // Page Table Management
    // =========================================================================

    fn check_region(&self, vaddr: VirtAddr, size: u64) -> MemResult<()> {
        if !vaddr.is_aligned(PAGE_SIZE) || size & PAGE_MASK != 0 {
            return Err(MemError::NotAligned);
        }
        if !self.page_table.contains(vaddr.as_u64(), size) {
            return Err(MemError::InvalidAddress);
        }
        Ok(())
    }

    /// Map `[vaddr, vaddr + size)` onto physical `[target, target + size)`
    pub fn map_memory_region(
        &self,
        vaddr: VirtAddr,
        size: u64,
        target: PhysAddr,
        perm: MemoryPermission,
        separate_heap: bool,
    ) -> MemResult<()> {
        self.check_region(vaddr, size)?;
        if !target.is_aligned(PAGE_SIZE) {
            return Err(MemError::NotAligned);
        }
        let dram_end = DRAM_BASE + self.host.backing_size();
        if target.as_u64() < DRAM_BASE || target.as_u64().checked_add(size).map_or(true, |end| end > dram_end) {
            error!("Out of bounds map target {:#x}", target);
            return Err(MemError::InvalidAddress);
        }

        let base_page = vaddr.page_index();
        for index in 0..size >> PAGE_BITS {
            let page = base_page + index;
            self.page_table.set_entry(page, PageEntry::new(target.add(index << PAGE_BITS), PageType::Memory));
            self.page_table.set_block(page, Some(base_page));
        }
        if let Some(tracker) = &self.heap_tracker {
            tracker.map(vaddr.as_u64(), target.dram_offset(), size, perm, separate_heap);
        }

        debug!("Mapping {:#x} onto {:#x}-{:#x}", target, vaddr, vaddr.add(size));
        Ok(())
    }

    /// Unmap `[vaddr, vaddr + size)`
    pub fn unmap_region(&self, vaddr: VirtAddr, size: u64, separate_heap: bool) -> MemResult<()> {
        self.check_region(vaddr, size)?;
        let base_page = vaddr.page_index();
        for page in base_page..base_page + (size >> PAGE_BITS) {
            self.page_table.set_entry(page, PageEntry::UNMAPPED);
            self.page_table.set_block(page, None);
        }
        if let Some(tracker) = &self.heap_tracker {
            tracker.unmap(vaddr.as_u64(), size, separate_heap);
        }

        debug!("Unmapping {:#x}-{:#x}", vaddr, vaddr.add(size));
        Ok(())
    }

    /// Reprotect the host view of `[vaddr, vaddr + size)`; rasterizer-cached
    /// pages keep their protection
    pub fn protect_region(&self, vaddr: VirtAddr, size: u64, perm: MemoryPermission) -> MemResult<()> {
        self.check_region(vaddr, size)?;
        let Some(tracker) = &self.heap_tracker else {
            return Ok(());
        };

        let (mut begin, mut bytes) = (0u64, 0u64);
        for address in (vaddr.as_u64()..vaddr.as_u64() + size).step_by(PAGE_SIZE as usize) {
            if self.page_table.entry(address >> PAGE_BITS).page_type() == PageType::RasterizerCachedMemory {
                if bytes > 0 {
                    tracker.protect(begin, bytes, perm);
                    bytes = 0;
                }
                continue;
            }
            if bytes == 0 {
                begin = address;
            }
            bytes += PAGE_SIZE;
        }
        if bytes > 0 {
            tracker.protect(begin, bytes, perm);
        }
        Ok(())
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Type of the page containing `vaddr`
    pub fn page_type(&self, vaddr: VirtAddr) -> PageType {
        self.page_table.entry((vaddr.as_u64() & VIRTUAL_ADDRESS_MASK) >> PAGE_BITS).page_type()
    }

    /// Check whether `vaddr` is backed by anything
    pub fn is_valid_virtual_address(&self, vaddr: VirtAddr) -> bool {
        let address = vaddr.as_u64() & VIRTUAL_ADDRESS_MASK;
        self.page_table.contains(address, 1)
            && self.page_table.entry(address >> PAGE_BITS).page_type() != PageType::Unmapped
    }

    /// Check whether every page of `[vaddr, vaddr + size)` is backed
    pub fn is_valid_virtual_address_range(&self, vaddr: VirtAddr, size: u64) -> bool {
        if size == 0 {
            return self.is_valid_virtual_address(vaddr);
        }
        let address = vaddr.as_u64();
        if !self.page_table.contains(address, size) {
            return false;
        }
        let last = (address + size - 1) >> PAGE_BITS;
        (address >> PAGE_BITS..=last).all(|page| self.page_table.entry(page).page_type() != PageType::Unmapped)
    }

    /// Physical start of `[vaddr, vaddr + size)` when the range lies in a
    /// single mapping call's region of plain memory
    pub fn get_span(&self, vaddr: VirtAddr, size: u64) -> Option<PhysAddr> {
        let address = vaddr.as_u64();
        if size == 0 || !self.page_table.contains(address, size) {
            return None;
        }
        let first = address >> PAGE_BITS;
        let last = (address + size - 1) >> PAGE_BITS;
        let block = self.page_table.block(first)?;
        if self.page_table.block(last) != Some(block) {
            return None;
        }
        let entry = self.page_table.entry(first);
        match entry.page_type() {
            PageType::Memory | PageType::DebugMemory => Some(entry.backing()?.add(address & PAGE_MASK)),
            _ => None,
        }
    }

    fn resolve(&self, address: u64) -> Option<(PageType, PhysAddr)> {
        let entry = self.page_table.entry(address >> PAGE_BITS);
        match entry.page_type() {
            PageType::Unmapped => None,
            page_type => Some((page_type, entry.backing()?.add(address & PAGE_MASK))),
        }
    }

    // =========================================================================
    // Backing Access
    // =========================================================================

    fn read_physical(&self, paddr: PhysAddr, dest: &mut [u8]) {
        if self.host.read_backing(paddr.dram_offset(), dest).is_err() {
            error!("Backing read outside DRAM @ {:#x}", paddr);
            dest.fill(0);
        }
    }

    fn write_physical(&self, paddr: PhysAddr, src: &[u8]) {
        if self.host.write_backing(paddr.dram_offset(), src).is_err() {
            error!("Backing write outside DRAM @ {:#x}", paddr);
        }
    }

    fn fill_physical(&self, paddr: PhysAddr, len: usize) {
        if self.host.fill_backing(paddr.dram_offset(), len as u64, 0).is_err() {
            error!("Backing fill outside DRAM @ {:#x}", paddr);
        }
    }

    // =========================================================================
    // Scalar Accesses
    // =========================================================================

    /// Read one scalar. Misaligned reads are split into byte reads
    pub fn read<T: Scalar>(&self, vaddr: VirtAddr) -> T {
        let address = vaddr.as_u64() & VIRTUAL_ADDRESS_MASK;
        if address % T::SIZE as u64 != 0 {
            let value = (0..T::SIZE as u64).fold(0u64, |value, index| {
                value | (u64::from(self.read::<u8>(VirtAddr::new(address + index))) << (index * 8))
            });
            return T::from_u64(value);
        }

        let mut bytes = [0u8; 8];
        match self.resolve(address) {
            Some((PageType::RasterizerCachedMemory, paddr)) => {
                self.handle_rasterizer_download(paddr, T::SIZE as u64);
                self.read_physical(paddr, &mut bytes[..T::SIZE]);
            }
            Some((_, paddr)) => self.read_physical(paddr, &mut bytes[..T::SIZE]),
            None => error!("Unmapped Read{} @ 0x{:016X}", T::SIZE * 8, address),
        }
        T::from_le_slice(&bytes)
    }

    /// Write one scalar. Misaligned writes are split into byte writes
    pub fn write<T: Scalar>(&self, vaddr: VirtAddr, value: T) {
        let address = vaddr.as_u64() & VIRTUAL_ADDRESS_MASK;
        if address % T::SIZE as u64 != 0 {
            let raw = value.to_u64();
            for index in 0..T::SIZE as u64 {
                self.write::<u8>(VirtAddr::new(address + index), (raw >> (index * 8)) as u8);
            }
            return;
        }

        let mut bytes = [0u8; 8];
        value.write_le(&mut bytes);
        match self.resolve(address) {
            Some((PageType::RasterizerCachedMemory, paddr)) => {
                self.handle_rasterizer_write(paddr, T::SIZE as u64);
                self.write_physical(paddr, &bytes[..T::SIZE]);
            }
            Some((_, paddr)) => self.write_physical(paddr, &bytes[..T::SIZE]),
            None => error!(
                "Unmapped Write{} @ 0x{:016X} = 0x{:016X}",
                T::SIZE * 8,
                address,
                value.to_u64()
            ),
        }
    }

    /// Store `value` only if memory still holds `expected`. Returns whether
    /// the store happened; writes to unmapped memory count as done
    pub fn write_exclusive<T: Scalar>(&self, vaddr: VirtAddr, value: T, expected: T) -> bool {
        let address = vaddr.as_u64() & VIRTUAL_ADDRESS_MASK;
        let paddr = match self.resolve(address) {
            Some((PageType::RasterizerCachedMemory, paddr)) => {
                self.handle_rasterizer_write(paddr, T::SIZE as u64);
                paddr
            }
            Some((_, paddr)) => paddr,
            None => {
                error!(
                    "Unmapped WriteExclusive{} @ 0x{:016X} = 0x{:016X}",
                    T::SIZE * 8,
                    address,
                    value.to_u64()
                );
                return true;
            }
        };

        match self
            .host
            .compare_exchange_backing(paddr.dram_offset(), T::SIZE, expected.to_u64(), value.to_u64())
        {
            Ok(stored) => stored,
            Err(err) => {
                error!("WriteExclusive{} @ 0x{:016X} failed: {}", T::SIZE * 8, address, err);
                false
            }
        }
    }

    /// Read a NUL-terminated string of at most `max_length` bytes
    pub fn read_cstring(&self, vaddr: VirtAddr, max_length: usize) -> String {
        let mut bytes = Vec::new();
        for index in 0..max_length as u64 {
            let byte = self.read::<u8>(vaddr.add(index));
            if byte == 0 {
                break;
            }
            bytes.push(byte);
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }

    // =========================================================================
    // Block Accesses
    // =========================================================================

    fn read_block_impl(&self, vaddr: VirtAddr, dest: &mut [u8], synchronize: bool) -> bool {
        let size = dest.len() as u64;
        let mut accessible = true;
        for segment in self.walk(vaddr, size) {
            let chunk = &mut dest[segment.offset..segment.offset + segment.len];
            match segment.backing {
                Backing::Unmapped => {
                    accessible = false;
                    error!(
                        "Unmapped ReadBlock @ 0x{:016X} (start address = 0x{:016X}, size = {})",
                        segment.vaddr, vaddr, size
                    );
                    chunk.fill(0);
                }
                Backing::Memory(paddr) => self.read_physical(paddr, chunk),
                Backing::Rasterizer(paddr) => {
                    if synchronize {
                        self.handle_rasterizer_download(paddr, segment.len as u64);
                    }
                    self.read_physical(paddr, chunk);
                }
            }
        }
        accessible
    }

    fn write_block_impl(&self, vaddr: VirtAddr, src: &[u8], synchronize: bool) -> bool {
        let size = src.len() as u64;
        let mut accessible = true;
        for segment in self.walk(vaddr, size) {
            let chunk = &src[segment.offset..segment.offset + segment.len];
            match segment.backing {
                Backing::Unmapped => {
                    accessible = false;
                    error!(
                        "Unmapped WriteBlock @ 0x{:016X} (start address = 0x{:016X}, size = {})",
                        segment.vaddr, vaddr, size
                    );
                }
                Backing::Memory(paddr) => self.write_physical(paddr, chunk),
                Backing::Rasterizer(paddr) => {
                    if synchronize {
                        self.handle_rasterizer_write(paddr, segment.len as u64);
                    }
                    self.write_physical(paddr, chunk);
                }
            }
        }
        accessible
    }

    /// Read a block, downloading GPU-cached pages first. Unmapped bytes
    /// read as zero; returns whether every page was mapped
    pub fn read_block(&self, vaddr: VirtAddr, dest: &mut [u8]) -> bool {
        self.read_block_impl(vaddr, dest, true)
    }

    /// Read a block without synchronizing with the GPU
    pub fn read_block_unsafe(&self, vaddr: VirtAddr, dest: &mut [u8]) -> bool {
        self.read_block_impl(vaddr, dest, false)
    }

    /// Write a block, notifying the GPU about cached pages. Unmapped bytes
    /// are dropped; returns whether every page was mapped
    pub fn write_block(&self, vaddr: VirtAddr, src: &[u8]) -> bool {
        self.write_block_impl(vaddr, src, true)
    }

    /// Write a block without notifying the GPU
    pub fn write_block_unsafe(&self, vaddr: VirtAddr, src: &[u8]) -> bool {
        self.write_block_impl(vaddr, src, false)
    }

    /// Zero `[vaddr, vaddr + size)`
    pub fn zero_block(&self, vaddr: VirtAddr, size: u64) -> bool {
        let mut accessible = true;
        for segment in self.walk(vaddr, size) {
            match segment.backing {
                Backing::Unmapped => {
                    accessible = false;
                    error!(
                        "Unmapped ZeroBlock @ 0x{:016X} (start address = 0x{:016X}, size = {})",
                        segment.vaddr, vaddr, size
                    );
                }
                Backing::Memory(paddr) => self.fill_physical(paddr, segment.len),
                Backing::Rasterizer(paddr) => {
                    self.handle_rasterizer_write(paddr, segment.len as u64);
                    self.fill_physical(paddr, segment.len);
                }
            }
        }
        accessible
    }

    /// Copy `size` bytes from `src` to `dest`; unmapped source bytes zero
    /// the destination
    pub fn copy_block(&self, dest: VirtAddr, src: VirtAddr, size: u64) -> bool {
        let mut accessible = true;
        let mut buffer = [0u8; PAGE_SIZE as usize];
        for segment in self.walk(src, size) {
            let target = dest.add(segment.offset as u64);
            let chunk = &mut buffer[..segment.len.min(PAGE_SIZE as usize)];
            match segment.backing {
                Backing::Unmapped => {
                    accessible = false;
                    error!(
                        "Unmapped CopyBlock @ 0x{:016X} (start address = 0x{:016X}, size = {})",
                        segment.vaddr, src, size
                    );
                    self.zero_block(target, segment.len as u64);
                }
                Backing::Memory(paddr) => {
                    self.read_physical(paddr, chunk);
                    self.write_block(target, chunk);
                }
                Backing::Rasterizer(paddr) => {
                    self.handle_rasterizer_download(paddr, segment.len as u64);
                    self.read_physical(paddr, chunk);
                    self.write_block(target, chunk);
                }
            }
        }
        accessible
    }

    // =========================================================================
    // Data Cache Maintenance
    // =========================================================================

    fn perform_cache_operation(&self, vaddr: VirtAddr, size: u64, operation: CacheOperation) -> MemResult<()> {
        let mut result = Ok(());
        for segment in self.walk(vaddr, size) {
            match segment.backing {
                Backing::Unmapped => {
                    error!(
                        "Unmapped cache maintenance @ 0x{:016X} (start address = 0x{:016X}, size = {})",
                        segment.vaddr, vaddr, size
                    );
                    result = Err(MemError::InvalidMemoryRange);
                }
                Backing::Memory(_) => {}
                Backing::Rasterizer(paddr) => match operation {
                    CacheOperation::Invalidate => self.handle_rasterizer_download(paddr, segment.len as u64),
                    CacheOperation::Store | CacheOperation::Flush => {
                        self.handle_rasterizer_write(paddr, segment.len as u64)
                    }
                },
            }
        }
        result
    }

    /// Invalidate to the point of coherency: pull GPU data into memory
    pub fn invalidate_data_cache(&self, vaddr: VirtAddr, size: u64) -> MemResult<()> {
        self.perform_cache_operation(vaddr, size, CacheOperation::Invalidate)
    }

    /// Store to the point of coherency: GPU copies become stale
    pub fn store_data_cache(&self, vaddr: VirtAddr, size: u64) -> MemResult<()> {
        self.perform_cache_operation(vaddr, size, CacheOperation::Store)
    }

    /// Store and invalidate
    pub fn flush_data_cache(&self, vaddr: VirtAddr, size: u64) -> MemResult<()> {
        self.perform_cache_operation(vaddr, size, CacheOperation::Flush)
    }

    // =========================================================================
    // Page Type Changes
    // =========================================================================

    fn pages_of(vaddr: u64, size: u64) -> core::ops::RangeInclusive<u64> {
        (vaddr >> PAGE_BITS)..=((vaddr + size - 1) >> PAGE_BITS)
    }

    /// Mark `[vaddr, vaddr + size)` as watched (or no longer watched) by a
    /// debugger
    pub fn mark_region_debug(&self, vaddr: VirtAddr, size: u64, debug: bool) {
        let address = vaddr.as_u64();
        if address == 0 || size == 0 || !self.page_table.contains(address, size) {
            return;
        }
        if let Some(tracker) = &self.heap_tracker {
            let perm = if debug { MemoryPermission::empty() } else { MemoryPermission::READ_WRITE };
            tracker.protect(address, size, perm);
        }

        for page in Self::pages_of(address, size) {
            self.page_table.update(page, |entry| match (entry.page_type(), debug) {
                (PageType::Unmapped, _) => {
                    error!("Attempted to change debug state of unmapped page 0x{:016X}", page << PAGE_BITS);
                    None
                }
                (PageType::Memory, true) => Some(entry.with_type(PageType::DebugMemory)),
                (PageType::DebugMemory, false) => Some(entry.with_type(PageType::Memory)),
                _ => None,
            });
        }
    }

    /// Move `[vaddr, vaddr + size)` into or out of rasterizer-cached mode
    pub fn rasterizer_mark_region_cached(&self, vaddr: VirtAddr, size: u64, cached: bool) {
        let address = vaddr.as_u64();
        if address == 0 || size == 0 || !self.page_table.contains(address, size) {
            return;
        }
        if let Some(tracker) = &self.heap_tracker {
            let perm = if cached { MemoryPermission::empty() } else { MemoryPermission::READ_WRITE };
            tracker.protect(address, size, perm);
        }
        if cached {
            for cache in self.core_caches.iter() {
                cache.lock().read_area = DownloadArea::default();
            }
        }

        for page in Self::pages_of(address, size) {
            self.page_table.update(page, |entry| match (entry.page_type(), cached) {
                (PageType::Memory | PageType::DebugMemory, true) => {
                    Some(entry.with_type(PageType::RasterizerCachedMemory))
                }
                (PageType::RasterizerCachedMemory, false) => Some(match entry.backing() {
                    Some(_) => entry.with_type(PageType::Memory),
                    None => PageEntry::UNMAPPED,
                }),
                _ => None,
            });
        }
    }

    // =========================================================================
    // GPU Synchronization
    // =========================================================================

    fn handle_rasterizer_download(&self, paddr: PhysAddr, size: u64) {
        let Some(interface) = self.translator.interface() else {
            return;
        };
        let cache = &self.core_caches[self.current_core()];
        self.translator.apply_op_on_paddr(paddr, |address| {
            if cache.lock().read_area.contains(address, size) {
                return;
            }
            let area = interface.on_cpu_read(address, size);
            cache.lock().read_area = area;
        });
    }

    fn handle_rasterizer_write(&self, paddr: PhysAddr, size: u64) {
        let Some(interface) = self.translator.interface() else {
            return;
        };
        let core = self.current_core();
        let cache = &self.core_caches[core];
        self.translator.apply_op_on_paddr(paddr, |address| {
            let page = address.page_index();
            let known = cache.lock().write_page == Some(page);
            if !known {
                if !interface.on_cpu_write(address, size) {
                    return;
                }
                cache.lock().write_page = Some(page);
            }
            self.dirty_trackers[core].collect(address, size);
        });
    }

    fn invalidate_gpu_memory(&self, paddr: PhysAddr, size: u64) {
        let Some(interface) = self.translator.interface() else {
            return;
        };
        self.translator
            .apply_op_on_paddr(paddr, |address| interface.invalidate_region(address, size));
    }

    /// Drain every core's dirty tracker, invoking `callback` per dirty run
    pub fn gather_gpu_dirty_memory(&self, mut callback: impl FnMut(DeviceAddr, u64)) {
        for tracker in self.dirty_trackers.iter() {
            tracker.gather(&mut callback);
        }
    }

    // =========================================================================
    // Host Faults
    // =========================================================================

    /// Host fault in the fastmem view at `host_offset`. Returns whether a
    /// deferred mapping was materialized
    pub fn handle_host_fault(&self, host_offset: u64) -> bool {
        self.heap_tracker
            .as_ref()
            .is_some_and(|tracker| tracker.handle_fault(host_offset))
    }

    /// The CPU backend faulted on `[vaddr, vaddr + size)`: invalidate GPU
    /// copies of cached pages, or materialize a deferred host mapping.
    /// Returns whether the address is mapped
    pub fn invalidate_nce(&self, vaddr: VirtAddr, size: u64) -> bool {
        let address = vaddr.as_u64() & VIRTUAL_ADDRESS_MASK;
        match self.resolve(address) {
            None => {
                error!("Unmapped InvalidateNCE for {} bytes @ {:#x}", size, address);
                false
            }
            Some((PageType::RasterizerCachedMemory, paddr)) => {
                self.invalidate_gpu_memory(paddr, size);
                true
            }
            Some(_) => {
                if let Some(tracker) = &self.heap_tracker {
                    tracker.deferred_map_separate_heap(address);
                }
                true
            }
        }
    }
}

impl ProcessMemory for CpuMemory {
    fn physical_address(&self, vaddr: VirtAddr) -> Option<PhysAddr> {
        let address = vaddr.as_u64() & VIRTUAL_ADDRESS_MASK;
        if !self.page_table.contains(address, 1) {
            return None;
        }
        self.resolve(address).map(|(_, paddr)| paddr)
    }

    fn mark_region_cached(&self, vaddr: VirtAddr, size: u64, cached: bool) {
        self.rasterizer_mark_region_cached(vaddr, size, cached);
    }
}

impl fmt::Debug for CpuMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuMemory")
            .field("config", &self.config)
            .field("page_table", &self.page_table)
            .field("heap_tracker", &self.heap_tracker)
            .finish()
    }
}
