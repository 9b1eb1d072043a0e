//! # Host Memory
//!
//! Guest DRAM lives in one anonymous host mapping (the *backing*). Guest
//! virtual memory that the CPU backend reaches without translation calls is
//! exposed through a host-virtual *view*: an ordered table of live host
//! mappings, each one pointing at a backing offset with its own permission.
//! The view counts its live regions the way the host kernel counts VMAs, which
//! is the resource the heap tracker keeps under the host ceiling.

use crate::{HalError, HalResult, MemoryPermission, PAGE_SIZE};
use core::fmt;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};
use memmap2::MmapMut;
use spin::RwLock;
use std::collections::BTreeMap;

/// Operations the host mapping layer performs on a host-virtual view.
///
/// Offsets are relative to the start of the view.
pub trait HostMemoryBuffer: Send + Sync {
    /// Size of the view in bytes
    fn virtual_size(&self) -> u64;

    /// Map `length` bytes of backing at `host_offset` to `virtual_offset`
    fn map(&self, virtual_offset: u64, host_offset: u64, length: u64, perm: MemoryPermission);

    /// Remove any mapping in `[virtual_offset, virtual_offset + length)`
    fn unmap(&self, virtual_offset: u64, length: u64);

    /// Change the permission of mapped bytes in the range
    fn protect(&self, virtual_offset: u64, length: u64, perm: MemoryPermission);
}

/// One live host mapping in the view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HostRegion {
    length: u64,
    host_offset: u64,
    perm: MemoryPermission,
}

/// DRAM backing plus host-virtual view
pub struct HostMemory {
    /// Owns the backing mapping; accessed only through `backing_base`
    _backing: MmapMut,
    backing_base: NonNull<u8>,
    backing_size: u64,
    virtual_size: u64,
    regions: RwLock<BTreeMap<u64, HostRegion>>,
}

// SAFETY: the backing is plain guest memory. Concurrent guest accesses are
// racy by nature of the emulated hardware; every access goes through raw
// pointer copies or atomics and never forms Rust references into the backing.
unsafe impl Send for HostMemory {}
// SAFETY: see above.
unsafe impl Sync for HostMemory {}

impl HostMemory {
    /// Reserve `backing_size` bytes of DRAM backing and a view of
    /// `virtual_size` bytes
    pub fn new(backing_size: u64, virtual_size: u64) -> HalResult<Self> {
        if backing_size == 0 || backing_size % PAGE_SIZE != 0 || virtual_size % PAGE_SIZE != 0 {
            return Err(HalError::InvalidParameter);
        }

        let len = usize::try_from(backing_size).map_err(|_| HalError::InvalidParameter)?;
        let mut backing = MmapMut::map_anon(len).map_err(|err| {
            log::error!("Failed to reserve {backing_size:#x} bytes of DRAM backing: {err}");
            HalError::OutOfMemory
        })?;
        let backing_base = NonNull::new(backing.as_mut_ptr()).ok_or(HalError::OutOfMemory)?;

        log::info!(
            "Host memory initialized: {:#x} bytes backing, {:#x} bytes virtual view",
            backing_size,
            virtual_size
        );

        Ok(Self {
            _backing: backing,
            backing_base,
            backing_size,
            virtual_size,
            regions: RwLock::new(BTreeMap::new()),
        })
    }

    /// Size of the DRAM backing
    #[inline]
    pub fn backing_size(&self) -> u64 {
        self.backing_size
    }

    /// Size of the host-virtual view
    #[inline]
    pub fn virtual_size(&self) -> u64 {
        self.virtual_size
    }

    /// Check whether `offset` lies inside the view
    #[inline]
    pub fn is_in_virtual_range(&self, offset: u64) -> bool {
        offset < self.virtual_size
    }

    // =========================================================================
    // Backing Access
    // =========================================================================

    /// Raw host pointer into the backing.
    ///
    /// This is the only place that performs unchecked offset arithmetic; the
    /// caller must keep `offset + len` of its access inside the backing.
    #[inline(always)]
    pub fn backing_pointer(&self, offset: u64) -> *mut u8 {
        debug_assert!(offset <= self.backing_size);
        self.backing_base.as_ptr().wrapping_add(offset as usize)
    }

    #[inline]
    fn check_backing(&self, offset: u64, len: u64) -> bool {
        offset.checked_add(len).is_some_and(|end| end <= self.backing_size)
    }

    /// Copy backing bytes into `dest`
    pub fn read_backing(&self, offset: u64, dest: &mut [u8]) -> HalResult<()> {
        if !self.check_backing(offset, dest.len() as u64) {
            return Err(HalError::InvalidAddress);
        }
        // SAFETY: range checked above; `dest` is a distinct Rust allocation.
        unsafe {
            core::ptr::copy_nonoverlapping(self.backing_pointer(offset), dest.as_mut_ptr(), dest.len());
        }
        Ok(())
    }

    /// Copy `src` into the backing
    pub fn write_backing(&self, offset: u64, src: &[u8]) -> HalResult<()> {
        if !self.check_backing(offset, src.len() as u64) {
            return Err(HalError::InvalidAddress);
        }
        // SAFETY: range checked above; `src` is a distinct Rust allocation.
        unsafe {
            core::ptr::copy_nonoverlapping(src.as_ptr(), self.backing_pointer(offset), src.len());
        }
        Ok(())
    }

    /// Fill `len` backing bytes with `value`
    pub fn fill_backing(&self, offset: u64, len: u64, value: u8) -> HalResult<()> {
        if !self.check_backing(offset, len) {
            return Err(HalError::InvalidAddress);
        }
        // SAFETY: range checked above.
        unsafe {
            core::ptr::write_bytes(self.backing_pointer(offset), value, len as usize);
        }
        Ok(())
    }

    /// Copy `len` bytes between two backing offsets (ranges may overlap)
    pub fn copy_backing(&self, dest: u64, src: u64, len: u64) -> HalResult<()> {
        if !self.check_backing(dest, len) || !self.check_backing(src, len) {
            return Err(HalError::InvalidAddress);
        }
        // SAFETY: both ranges checked above; `copy` tolerates overlap.
        unsafe {
            core::ptr::copy(self.backing_pointer(src), self.backing_pointer(dest), len as usize);
        }
        Ok(())
    }

    /// Atomically replace `size` bytes at `offset` with `new` if they equal
    /// `expected`. Returns whether the store happened.
    ///
    /// Misaligned or oversized accesses are rejected as invalid.
    pub fn compare_exchange_backing(
        &self,
        offset: u64,
        size: usize,
        expected: u64,
        new: u64,
    ) -> HalResult<bool> {
        if !matches!(size, 1 | 2 | 4 | 8) {
            return Err(HalError::InvalidParameter);
        }
        if !self.check_backing(offset, size as u64) || offset % size as u64 != 0 {
            return Err(HalError::InvalidAddress);
        }
        let ptr = self.backing_pointer(offset);

        // SAFETY: the range is inside the backing and naturally aligned for
        // `size`; the backing is never accessed through Rust references.
        let swapped = unsafe {
            match size {
                1 => AtomicU8::from_ptr(ptr)
                    .compare_exchange(expected as u8, new as u8, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok(),
                2 => AtomicU16::from_ptr(ptr.cast())
                    .compare_exchange(expected as u16, new as u16, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok(),
                4 => AtomicU32::from_ptr(ptr.cast())
                    .compare_exchange(expected as u32, new as u32, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok(),
                8 => AtomicU64::from_ptr(ptr.cast())
                    .compare_exchange(expected, new, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok(),
                _ => return Err(HalError::InvalidParameter),
            }
        };
        Ok(swapped)
    }

    // =========================================================================
    // Host-Virtual View
    // =========================================================================

    /// Number of live host mappings in the view
    pub fn mapping_count(&self) -> usize {
        self.regions.read().len()
    }

    /// Resolve a view offset to a backing offset, checking `required` access
    pub fn resolve(&self, virtual_offset: u64, required: MemoryPermission) -> Option<u64> {
        let regions = self.regions.read();
        let (&start, region) = regions.range(..=virtual_offset).next_back()?;
        if virtual_offset >= start + region.length || !region.perm.allows(required) {
            return None;
        }
        Some(region.host_offset + (virtual_offset - start))
    }

    /// Permission of the mapping covering `virtual_offset`, if any
    pub fn permission_at(&self, virtual_offset: u64) -> Option<MemoryPermission> {
        let regions = self.regions.read();
        let (&start, region) = regions.range(..=virtual_offset).next_back()?;
        (virtual_offset < start + region.length).then_some(region.perm)
    }

    /// Split the region straddling `offset` so that a region starts there
    fn split_at(regions: &mut BTreeMap<u64, HostRegion>, offset: u64) {
        let Some((&start, region)) = regions.range_mut(..offset).next_back() else {
            return;
        };
        let end = start + region.length;
        if offset >= end {
            return;
        }

        let left_len = offset - start;
        let right = HostRegion {
            length: region.length - left_len,
            host_offset: region.host_offset + left_len,
            perm: region.perm,
        };
        region.length = left_len;
        regions.insert(offset, right);
    }

    fn carve(regions: &mut BTreeMap<u64, HostRegion>, offset: u64, length: u64) {
        let end = offset + length;
        Self::split_at(regions, offset);
        Self::split_at(regions, end);

        let doomed: Vec<u64> = regions.range(offset..end).map(|(&start, _)| start).collect();
        for start in doomed {
            regions.remove(&start);
        }
    }

    fn check_view(&self, virtual_offset: u64, length: u64) -> bool {
        virtual_offset
            .checked_add(length)
            .is_some_and(|end| end <= self.virtual_size)
    }
}

impl HostMemoryBuffer for HostMemory {
    fn virtual_size(&self) -> u64 {
        self.virtual_size
    }

    fn map(&self, virtual_offset: u64, host_offset: u64, length: u64, perm: MemoryPermission) {
        if length == 0 {
            return;
        }
        assert!(
            self.check_view(virtual_offset, length) && self.check_backing(host_offset, length),
            "host map out of range: virtual {virtual_offset:#x} host {host_offset:#x} length {length:#x}"
        );

        let mut regions = self.regions.write();
        Self::carve(&mut regions, virtual_offset, length);
        regions.insert(virtual_offset, HostRegion { length, host_offset, perm });

        log::trace!(
            "Host map {:#x}-{:#x} -> backing {:#x} ({})",
            virtual_offset,
            virtual_offset + length,
            host_offset,
            perm
        );
    }

    fn unmap(&self, virtual_offset: u64, length: u64) {
        if length == 0 {
            return;
        }
        let mut regions = self.regions.write();
        Self::carve(&mut regions, virtual_offset, length);

        log::trace!("Host unmap {:#x}-{:#x}", virtual_offset, virtual_offset + length);
    }

    fn protect(&self, virtual_offset: u64, length: u64, perm: MemoryPermission) {
        if length == 0 {
            return;
        }
        let end = virtual_offset + length;
        let mut regions = self.regions.write();
        Self::split_at(&mut regions, virtual_offset);
        Self::split_at(&mut regions, end);

        for (_, region) in regions.range_mut(virtual_offset..end) {
            region.perm = perm;
        }

        log::trace!("Host protect {:#x}-{:#x} ({})", virtual_offset, end, perm);
    }
}

impl fmt::Debug for HostMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostMemory")
            .field("backing_size", &self.backing_size)
            .field("virtual_size", &self.virtual_size)
            .field("mappings", &self.mapping_count())
            .finish()
    }
}
