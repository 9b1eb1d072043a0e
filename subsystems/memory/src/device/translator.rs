//! # Device Address Translator
//!
//! Resolves device-virtual addresses (what the emulated GPU issues) to
//! guest-physical pages, and back, across every registered process.
//!
//! ## Tables
//!
//! | Table                | Index               | Entry                                |
//! |----------------------|---------------------|--------------------------------------|
//! | `physical_of_device` | device page         | physical page + 1, 0 when unmapped   |
//! | `device_of_physical` | DRAM page           | device page + 1, or `MULTI_FLAG | id`|
//! | `continuity`         | device page         | contiguous physical pages from here  |
//! | `cpu_backing`        | device page         | `(asid + 1) << 48 | vaddr`, 0 if none |
//! | `cached_pages`       | device page / 8     | eight `u8` cached counters           |
//!
//! Every table is a lazily committed [`VirtualBuffer`], so a 34-bit device
//! space costs nothing until touched.

use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use guestmem_hal::{
    pages_for, DeviceAddr, HostMemory, PhysAddr, VirtAddr, VirtualBuffer, DRAM_BASE, PAGE_BITS,
    PAGE_MASK, PAGE_SIZE, VIRTUAL_ADDRESS_MASK,
};
use log::{debug, error, info, trace, warn};
use spin::{Mutex, RwLock};

use super::address_allocator::DeviceAddressAllocator;
use super::multi_address::MultiAddressContainer;
use super::range_mutex::RangeMutex;
use crate::{MemError, MemResult, Scalar};

const MULTI_FLAG_BITS: u32 = 31;
const MULTI_FLAG: u32 = 1 << MULTI_FLAG_BITS;
const MULTI_MASK: u32 = !MULTI_FLAG;

const ASID_SHIFT: u32 = 48;

const COUNTERS_PER_WORD: u64 = 8;

// =============================================================================
// Collaborator Interfaces
// =============================================================================

/// Identifier of one registered process's device mappings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Asid(pub u32);

/// CPU-side view of a process, as needed by the translator
pub trait ProcessMemory: Send + Sync {
    /// Guest-physical address backing `vaddr`, if mapped
    fn physical_address(&self, vaddr: VirtAddr) -> Option<PhysAddr>;

    /// Switch `[vaddr, vaddr + size)` into or out of rasterizer-cached mode
    fn mark_region_cached(&self, vaddr: VirtAddr, size: u64, cached: bool);
}

/// Device range the GPU has already downloaded for the CPU
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadArea {
    /// First byte of the area
    pub start: DeviceAddr,
    /// One past the last byte
    pub end: DeviceAddr,
    /// Whether the download was issued ahead of the access
    pub preemptive: bool,
}

impl DownloadArea {
    /// Check whether `[address, address + size)` lies inside the area
    #[inline]
    pub fn contains(&self, address: DeviceAddr, size: u64) -> bool {
        self.start <= address && address.add(size) <= self.end
    }
}

/// GPU backend hooks
pub trait DeviceInterface: Send + Sync {
    /// The CPU is about to read `[address, address + size)`; make GPU-side
    /// data visible and report the area now coherent
    fn on_cpu_read(&self, address: DeviceAddr, size: u64) -> DownloadArea;

    /// The CPU is about to write the range. Returns `false` when the write
    /// needs no dirty tracking
    fn on_cpu_write(&self, address: DeviceAddr, size: u64) -> bool;

    /// Drop GPU caches of the range
    fn invalidate_region(&self, address: DeviceAddr, size: u64);

    /// Write GPU caches of the range back to memory
    fn flush_region(&self, address: DeviceAddr, size: u64);
}

/// Translator geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceTranslatorConfig {
    /// Width of the device-virtual address space
    pub device_virtual_bits: u32,
    /// Maximum number of concurrently registered processes
    pub max_processes: usize,
}

impl Default for DeviceTranslatorConfig {
    fn default() -> Self {
        Self { device_virtual_bits: 34, max_processes: 64 }
    }
}

// =============================================================================
// Translator
// =============================================================================

/// Device-virtual to guest-physical translation for every registered process
pub struct DeviceAddressTranslator {
    config: DeviceTranslatorConfig,
    host: Arc<HostMemory>,
    interface: RwLock<Option<Arc<dyn DeviceInterface>>>,

    physical_of_device: VirtualBuffer<AtomicU32>,
    device_of_physical: VirtualBuffer<AtomicU32>,
    continuity: VirtualBuffer<AtomicU32>,
    cpu_backing: VirtualBuffer<AtomicU64>,
    cached_pages: VirtualBuffer<AtomicU64>,

    /// Mapping guard; also serializes `device_of_physical` rewrites
    multi: Mutex<MultiAddressContainer>,
    allocator: Mutex<DeviceAddressAllocator>,
    processes: RwLock<Vec<Option<Weak<dyn ProcessMemory>>>>,
    counter_guard: RangeMutex,
}

#[inline]
fn compress_physical(address: PhysAddr) -> u32 {
    (address.page_index() + 1) as u32
}

#[inline]
fn decompress_physical(entry: u32) -> PhysAddr {
    PhysAddr::new(u64::from(entry - 1) << PAGE_BITS)
}

#[inline]
fn decompress_device(entry: u32) -> DeviceAddr {
    DeviceAddr::new(u64::from(entry - 1) << PAGE_BITS)
}

#[inline]
fn compress_backing(asid: Asid, vaddr: VirtAddr) -> u64 {
    ((u64::from(asid.0) + 1) << ASID_SHIFT) | (vaddr.as_u64() & VIRTUAL_ADDRESS_MASK & !PAGE_MASK)
}

#[inline]
fn decompress_backing(entry: u64) -> Option<(Asid, u64)> {
    let id = entry >> ASID_SHIFT;
    (id != 0).then(|| (Asid((id - 1) as u32), entry & VIRTUAL_ADDRESS_MASK))
}

/// One page of a device block access
#[derive(Debug, Clone, Copy)]
struct DeviceSegment {
    position: usize,
    len: usize,
    address: DeviceAddr,
    physical: Option<PhysAddr>,
}

/// Pending run of CPU pages whose cached state changes together
#[derive(Debug, Clone, Copy)]
struct MarkRun {
    asid: Asid,
    begin: u64,
    bytes: u64,
}

impl MarkRun {
    fn extends(&self, asid: Asid, vaddr: u64) -> bool {
        self.asid == asid && self.begin + self.bytes == vaddr
    }
}

impl DeviceAddressTranslator {
    /// Create a translator over `host`'s DRAM
    pub fn new(config: DeviceTranslatorConfig, host: Arc<HostMemory>) -> MemResult<Self> {
        if config.device_virtual_bits <= PAGE_BITS || config.device_virtual_bits > 40 {
            return Err(MemError::InvalidSize);
        }
        if config.max_processes == 0 || config.max_processes > usize::from(u16::MAX) {
            return Err(MemError::InvalidSize);
        }

        let device_pages = 1usize << (config.device_virtual_bits - PAGE_BITS);
        let dram_pages = (host.backing_size() >> PAGE_BITS) as usize;
        let counter_words = device_pages.div_ceil(COUNTERS_PER_WORD as usize);

        let translator = Self {
            config,
            interface: RwLock::new(None),
            physical_of_device: VirtualBuffer::new(device_pages)?,
            device_of_physical: VirtualBuffer::new(dram_pages)?,
            continuity: VirtualBuffer::new(device_pages)?,
            cpu_backing: VirtualBuffer::new(device_pages)?,
            cached_pages: VirtualBuffer::new(counter_words)?,
            multi: Mutex::new(MultiAddressContainer::new()),
            // Device page 0 stays reserved so a null device address never
            // names a live allocation.
            allocator: Mutex::new(DeviceAddressAllocator::new(
                PAGE_SIZE,
                1u64 << config.device_virtual_bits,
            )),
            processes: RwLock::new(Vec::new()),
            counter_guard: RangeMutex::new(),
            host,
        };

        info!(
            "Device translator initialized: {} device address bits, {} DRAM pages, {} processes max",
            config.device_virtual_bits, dram_pages, config.max_processes
        );

        Ok(translator)
    }

    /// Translator configuration
    pub fn config(&self) -> DeviceTranslatorConfig {
        self.config
    }

    /// DRAM backing shared with the CPU side
    pub fn host(&self) -> &Arc<HostMemory> {
        &self.host
    }

    /// Attach the GPU backend
    pub fn bind_interface(&self, interface: Arc<dyn DeviceInterface>) {
        *self.interface.write() = Some(interface);
    }

    /// Currently bound GPU backend
    pub fn interface(&self) -> Option<Arc<dyn DeviceInterface>> {
        self.interface.read().clone()
    }

    // =========================================================================
    // Processes
    // =========================================================================

    /// Register a process, returning its ASID
    pub fn register_process(&self, process: Weak<dyn ProcessMemory>) -> MemResult<Asid> {
        let mut processes = self.processes.write();
        if let Some(id) = processes.iter().position(Option::is_none) {
            processes[id] = Some(process);
            debug!("Registered device process asid={}", id);
            return Ok(Asid(id as u32));
        }
        if processes.len() >= self.config.max_processes {
            warn!("Device process limit of {} reached", self.config.max_processes);
            return Err(MemError::LimitReached);
        }
        processes.push(Some(process));
        let id = processes.len() - 1;
        debug!("Registered device process asid={}", id);
        Ok(Asid(id as u32))
    }

    /// Release an ASID for reuse
    pub fn unregister_process(&self, asid: Asid) -> MemResult<()> {
        let mut processes = self.processes.write();
        let slot = processes.get_mut(asid.0 as usize).ok_or(MemError::InvalidHandle)?;
        if slot.take().is_none() {
            return Err(MemError::InvalidHandle);
        }
        debug!("Unregistered device process asid={}", asid.0);
        Ok(())
    }

    fn process(&self, asid: Asid) -> Option<Arc<dyn ProcessMemory>> {
        self.processes.read().get(asid.0 as usize)?.as_ref()?.upgrade()
    }

    // =========================================================================
    // Device Address Space
    // =========================================================================

    /// Allocate a device range of at least `size` bytes
    pub fn allocate(&self, size: u64) -> MemResult<DeviceAddr> {
        self.allocator.lock().allocate(size).ok_or(MemError::OutOfMemory)
    }

    /// Claim exactly `[address, address + size)`
    pub fn allocate_fixed(&self, address: DeviceAddr, size: u64) -> MemResult<()> {
        if self.allocator.lock().allocate_fixed(address, size) {
            Ok(())
        } else {
            Err(MemError::Busy)
        }
    }

    /// Release a device range obtained from [`allocate`](Self::allocate)
    pub fn free(&self, address: DeviceAddr, size: u64) {
        self.allocator.lock().free(address, size);
    }

    fn device_pages(&self, address: DeviceAddr, size: u64) -> core::ops::Range<usize> {
        let start = address.page_index() as usize;
        let end = start + pages_for(address.page_offset() + size) as usize;
        assert!(
            end <= self.physical_of_device.len(),
            "device range {:#x}+{:#x} outside the device address space",
            address,
            size
        );
        start..end
    }

    fn physical_slot(&self, address: PhysAddr) -> Option<&AtomicU32> {
        let offset = address.as_u64().checked_sub(DRAM_BASE)?;
        self.device_of_physical.get((offset >> PAGE_BITS) as usize)
    }

    // =========================================================================
    // Mapping
    // =========================================================================

    /// Map `[address, address + size)` onto the pages backing
    /// `[virtual_address, ..)` in process `asid`.
    ///
    /// With `track`, physical continuity is recorded for [`get_span`](Self::get_span).
    pub fn map(&self, address: DeviceAddr, virtual_address: VirtAddr, size: u64, asid: Asid, track: bool) {
        let process = self.process(asid);
        let pages = self.device_pages(address, size);
        let start_page = pages.start;

        let mut multi = self.multi.lock();
        for page in pages.clone() {
            let vaddr = virtual_address.add(((page - start_page) as u64) << PAGE_BITS);
            let resolved = process.as_ref().and_then(|process| process.physical_address(vaddr));
            let Some((paddr, slot)) = resolved.and_then(|paddr| Some((paddr, self.physical_slot(paddr)?)))
            else {
                self.physical_of_device[page].store(0, Ordering::Release);
                self.cpu_backing[page].store(0, Ordering::Relaxed);
                continue;
            };

            self.physical_of_device[page].store(compress_physical(paddr), Ordering::Release);
            self.cpu_backing[page].store(compress_backing(asid, vaddr), Ordering::Relaxed);

            let new_device = page as u32 + 1;
            let base = slot.load(Ordering::Relaxed);
            if base == 0 {
                slot.store(new_device, Ordering::Release);
                continue;
            }
            let start_id = if base & MULTI_FLAG == 0 {
                let id = multi.register(base);
                slot.store(MULTI_FLAG | id, Ordering::Release);
                id
            } else {
                base & MULTI_MASK
            };
            multi.register_with(new_device, start_id);
        }
        drop(multi);

        if track {
            self.track_continuity(pages);
        }
        debug!(
            "Device map {:#x}+{:#x} -> vaddr {:#x} asid={}",
            address, size, virtual_address, asid.0
        );
    }

    fn track_continuity(&self, pages: core::ops::Range<usize>) {
        let mut next_entry = 0u32;
        let mut count = 1u32;
        for page in pages.rev() {
            let entry = self.physical_of_device[page].load(Ordering::Acquire);
            if entry != 0 && entry + 1 == next_entry {
                count += 1;
            } else {
                count = 1;
            }
            next_entry = entry;
            self.continuity[page].store(count, Ordering::Relaxed);
        }
    }

    /// Remove the translations of `[address, address + size)`.
    ///
    /// The GPU drops its caches of the range first. Multi-mapped physical
    /// pages fall back to a direct entry once one device address remains.
    pub fn unmap(&self, address: DeviceAddr, size: u64) {
        if let Some(interface) = self.interface() {
            interface.invalidate_region(address, size);
        }

        let pages = self.device_pages(address, size);
        let mut multi = self.multi.lock();
        for page in pages {
            let entry = self.physical_of_device[page].swap(0, Ordering::AcqRel);
            self.cpu_backing[page].store(0, Ordering::Relaxed);
            self.continuity[page].store(0, Ordering::Relaxed);
            if entry == 0 {
                continue;
            }
            let Some(slot) = self.physical_slot(decompress_physical(entry)) else {
                continue;
            };

            let base = slot.load(Ordering::Relaxed);
            if base & MULTI_FLAG == 0 {
                slot.store(0, Ordering::Release);
                continue;
            }
            let (more_remaining, new_start) = multi.unregister(page as u32 + 1, base & MULTI_MASK);
            if more_remaining {
                slot.store(new_start | MULTI_FLAG, Ordering::Release);
            } else {
                slot.store(multi.release_entry(new_start), Ordering::Release);
            }
        }
        drop(multi);

        debug!("Device unmap {:#x}+{:#x}", address, size);
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    /// Guest-physical address behind a device address
    #[inline]
    pub fn physical_address(&self, address: DeviceAddr) -> Option<PhysAddr> {
        let entry = self.physical_of_device.get(address.page_index() as usize)?.load(Ordering::Acquire);
        if entry == 0 {
            return None;
        }
        Some(decompress_physical(entry).add(address.page_offset()))
    }

    /// Physical start of `[address, address + size)` when the whole range is
    /// physically contiguous and was mapped with tracking
    pub fn get_span(&self, address: DeviceAddr, size: u64) -> Option<PhysAddr> {
        let run = self.continuity.get(address.page_index() as usize)?.load(Ordering::Relaxed);
        if (u64::from(run) << PAGE_BITS) >= size + address.page_offset() {
            self.physical_address(address)
        } else {
            None
        }
    }

    /// Invoke `operation` once for every device address mapping `address`
    pub fn apply_op_on_paddr(&self, address: PhysAddr, mut operation: impl FnMut(DeviceAddr)) {
        let Some(slot) = self.physical_slot(address) else {
            return;
        };
        let offset = address.page_offset();

        let base = slot.load(Ordering::Acquire);
        if base == 0 {
            return;
        }
        if base & MULTI_FLAG == 0 {
            operation(decompress_device(base).add(offset));
            return;
        }

        let mut devices = Vec::new();
        {
            let multi = self.multi.lock();
            let base = slot.load(Ordering::Acquire);
            if base == 0 {
                return;
            }
            if base & MULTI_FLAG == 0 {
                devices.push(base);
            } else {
                multi.gather(base & MULTI_MASK, &mut devices);
            }
        }
        for device in devices {
            operation(decompress_device(device).add(offset));
        }
    }

    // =========================================================================
    // Accesses
    // =========================================================================

    fn segments(&self, address: DeviceAddr, size: u64) -> impl Iterator<Item = DeviceSegment> + '_ {
        let mut current = address;
        let mut remaining = size;
        let mut position = 0usize;
        core::iter::from_fn(move || {
            if remaining == 0 {
                return None;
            }
            let len = (PAGE_SIZE - current.page_offset()).min(remaining);
            let segment = DeviceSegment {
                position,
                len: len as usize,
                address: current,
                physical: self.physical_address(current),
            };
            position += len as usize;
            current = current.add(len);
            remaining -= len;
            Some(segment)
        })
    }

    /// Read one scalar; unmapped addresses read as zero
    pub fn read<T: Scalar>(&self, address: DeviceAddr) -> T {
        let mut bytes = [0u8; 8];
        let bytes = &mut bytes[..T::SIZE];
        if address.page_offset() + T::SIZE as u64 > PAGE_SIZE {
            self.read_block_unsafe(address, bytes);
            return T::from_le_slice(bytes);
        }
        match self.physical_address(address) {
            Some(paddr) if self.host.read_backing(paddr.dram_offset(), bytes).is_ok() => {
                T::from_le_slice(bytes)
            }
            _ => {
                error!("Unmapped Device Read{} @ 0x{:016X}", T::SIZE * 8, address);
                T::default()
            }
        }
    }

    /// Write one scalar; writes to unmapped addresses are dropped
    pub fn write<T: Scalar>(&self, address: DeviceAddr, value: T) {
        let mut bytes = [0u8; 8];
        value.write_le(&mut bytes);
        let bytes = &bytes[..T::SIZE];
        if address.page_offset() + T::SIZE as u64 > PAGE_SIZE {
            self.write_block_unsafe(address, bytes);
            return;
        }
        let written = self
            .physical_address(address)
            .is_some_and(|paddr| self.host.write_backing(paddr.dram_offset(), bytes).is_ok());
        if !written {
            error!(
                "Unmapped Device Write{} @ 0x{:016X} = 0x{:016X}",
                T::SIZE * 8,
                address,
                value.to_u64()
            );
        }
    }

    /// Flush GPU caches of the range, then read it
    pub fn read_block(&self, address: DeviceAddr, dest: &mut [u8]) {
        if let Some(interface) = self.interface() {
            interface.flush_region(address, dest.len() as u64);
        }
        self.read_block_unsafe(address, dest);
    }

    /// Read without touching GPU caches; unmapped bytes read as zero
    pub fn read_block_unsafe(&self, address: DeviceAddr, dest: &mut [u8]) {
        let size = dest.len() as u64;
        for segment in self.segments(address, size) {
            let chunk = &mut dest[segment.position..segment.position + segment.len];
            let Some(paddr) = segment.physical else {
                error!(
                    "Unmapped Device ReadBlock @ 0x{:016X} (start address = 0x{:016X}, size = {})",
                    segment.address, address, size
                );
                chunk.fill(0);
                continue;
            };
            if let Err(err) = self.host.read_backing(paddr.dram_offset(), chunk) {
                error!(
                    "Device ReadBlock @ 0x{:016X} (start address = 0x{:016X}, size = {}) failed: {}",
                    segment.address, address, size, err
                );
                chunk.fill(0);
            }
        }
    }

    /// Write the range, then drop GPU caches of it
    pub fn write_block(&self, address: DeviceAddr, src: &[u8]) {
        self.write_block_unsafe(address, src);
        if let Some(interface) = self.interface() {
            interface.invalidate_region(address, src.len() as u64);
        }
    }

    /// Write without touching GPU caches; unmapped bytes are dropped
    pub fn write_block_unsafe(&self, address: DeviceAddr, src: &[u8]) {
        let size = src.len() as u64;
        for segment in self.segments(address, size) {
            let chunk = &src[segment.position..segment.position + segment.len];
            let Some(paddr) = segment.physical else {
                error!(
                    "Unmapped Device WriteBlock @ 0x{:016X} (start address = 0x{:016X}, size = {})",
                    segment.address, address, size
                );
                continue;
            };
            if let Err(err) = self.host.write_backing(paddr.dram_offset(), chunk) {
                error!(
                    "Device WriteBlock @ 0x{:016X} (start address = 0x{:016X}, size = {}) failed: {}",
                    segment.address, address, size, err
                );
            }
        }
    }

    // =========================================================================
    // Cached Page Counts
    // =========================================================================

    fn counter(&self, page: u64) -> (&AtomicU64, u32) {
        let word = &self.cached_pages[(page / COUNTERS_PER_WORD) as usize];
        (word, ((page % COUNTERS_PER_WORD) * 8) as u32)
    }

    /// Number of GPU caches currently holding the device page at `address`
    pub fn cached_count(&self, address: DeviceAddr) -> u8 {
        let (word, shift) = self.counter(address.page_index());
        (word.load(Ordering::Acquire) >> shift) as u8
    }

    fn flush_mark_run(&self, run: &mut Option<MarkRun>, cached: bool) {
        let Some(run) = run.take() else {
            return;
        };
        if let Some(process) = self.process(run.asid) {
            process.mark_region_cached(VirtAddr::new(run.begin), run.bytes, cached);
        }
    }

    fn extend_mark_run(&self, run: &mut Option<MarkRun>, asid: Asid, vaddr: u64, cached: bool) {
        if let Some(pending) = run.as_mut().filter(|pending| pending.extends(asid, vaddr)) {
            pending.bytes += PAGE_SIZE;
            return;
        }
        self.flush_mark_run(run, cached);
        *run = Some(MarkRun { asid, begin: vaddr, bytes: PAGE_SIZE });
    }

    /// Adjust the cached count of every page in the range by `delta` (+1 or
    /// -1).
    ///
    /// Pages going 0 -> 1 are marked rasterizer-cached in the process backing
    /// them, pages going 1 -> 0 are unmarked. Runs that are contiguous in one
    /// process are batched; pages without a CPU backing are counted but not
    /// marked.
    pub fn update_pages_cached_count(&self, address: DeviceAddr, size: u64, delta: i32) {
        assert!(delta == 1 || delta == -1, "cached count delta must be +1 or -1, got {delta}");
        if size == 0 {
            return;
        }
        let _guard = self.counter_guard.lock(address.as_u64(), size);

        let mut caching: Option<MarkRun> = None;
        let mut uncaching: Option<MarkRun> = None;

        for page in self.device_pages(address, size) {
            let (word, shift) = self.counter(page as u64);
            let current = (word.load(Ordering::Acquire) >> shift) as u8;
            let count = if delta > 0 {
                assert!(current < u8::MAX, "cached count of device page {page:#x} may overflow");
                word.fetch_add(1 << shift, Ordering::AcqRel);
                current + 1
            } else {
                assert!(current > 0, "cached count of device page {page:#x} may underflow");
                word.fetch_sub(1 << shift, Ordering::AcqRel);
                current - 1
            };

            let Some((asid, vaddr)) = decompress_backing(self.cpu_backing[page].load(Ordering::Relaxed)) else {
                self.flush_mark_run(&mut uncaching, false);
                self.flush_mark_run(&mut caching, true);
                continue;
            };

            if count == 0 {
                self.extend_mark_run(&mut uncaching, asid, vaddr, false);
            } else {
                self.flush_mark_run(&mut uncaching, false);
            }

            if count == 1 && delta > 0 {
                self.extend_mark_run(&mut caching, asid, vaddr, true);
            } else {
                self.flush_mark_run(&mut caching, true);
            }
        }

        self.flush_mark_run(&mut uncaching, false);
        self.flush_mark_run(&mut caching, true);
        trace!("Cached count {:+} over {:#x}+{:#x}", delta, address, size);
    }
}

impl fmt::Debug for DeviceAddressTranslator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceAddressTranslator")
            .field("config", &self.config)
            .field("multi_entries", &self.multi.lock().live_entries())
            .field("processes", &self.processes.read().iter().filter(|p| p.is_some()).count())
            .finish()
    }
}
