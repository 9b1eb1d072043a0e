//! # GPU Dirty Tracking
//!
//! Records which device ranges the CPU has written so the GPU can drop its
//! stale copies in one batch.
//!
//! Writes are reduced to 2 KiB pages split into 64 units of 32 bytes; one
//! page is accumulated at a time as a `u64` unit mask. The accumulator is
//! two atomics: a tag (`generation << 32 | page + 1`) and the mask. Writers
//! hitting the tagged page only OR into the mask and re-check the tag; any
//! change of page goes through the lock, which bumps the generation so a
//! stale tag can never match again.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use guestmem_hal::DeviceAddr;
use spin::Mutex;

/// Reduced page shift
pub const DIRTY_PAGE_BITS: u32 = 11;
/// Reduced page size
pub const DIRTY_PAGE_SIZE: u64 = 1 << DIRTY_PAGE_BITS;
const DIRTY_PAGE_MASK: u64 = DIRTY_PAGE_SIZE - 1;

/// Tracking unit shift
pub const DIRTY_UNIT_BITS: u32 = 5;
/// Tracking unit size
pub const DIRTY_UNIT_SIZE: u64 = 1 << DIRTY_UNIT_BITS;

const UNITS_PER_PAGE: u32 = 64;
const INVALID_TAG: u64 = 0;

/// One reduced page's accumulated writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TransformAddress {
    page: u32,
    mask: u64,
}

impl TransformAddress {
    fn build(address: u64, size: u64) -> Self {
        let minor = address & DIRTY_PAGE_MASK;
        let low = minor >> DIRTY_UNIT_BITS;
        let high = (minor + size + DIRTY_UNIT_SIZE - 1) >> DIRTY_UNIT_BITS;
        debug_assert!(high <= u64::from(UNITS_PER_PAGE));
        let units = (high - low) as u32;
        let mask = if units >= UNITS_PER_PAGE { u64::MAX } else { ((1u64 << units) - 1) << low };
        Self { page: (address >> DIRTY_PAGE_BITS) as u32, mask }
    }
}

#[inline]
fn tag_page(tag: u64) -> Option<u32> {
    let low = tag as u32;
    (low != 0).then(|| low - 1)
}

struct Pending {
    transforms: Vec<TransformAddress>,
    generation: u32,
}

/// Lock-light collector of CPU-written device ranges
pub struct GpuDirtyTracker {
    tag: AtomicU64,
    mask: AtomicU64,
    pending: Mutex<Pending>,
}

impl Default for GpuDirtyTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuDirtyTracker {
    /// Create an empty tracker
    pub const fn new() -> Self {
        Self {
            tag: AtomicU64::new(INVALID_TAG),
            mask: AtomicU64::new(0),
            pending: Mutex::new(Pending { transforms: Vec::new(), generation: 0 }),
        }
    }

    /// Record a CPU write to `[address, address + size)`
    pub fn collect(&self, address: DeviceAddr, size: u64) {
        let mut current = address.as_u64();
        let end = current + size;
        while current < end {
            let page_end = (current | DIRTY_PAGE_MASK) + 1;
            let chunk = page_end.min(end) - current;
            self.collect_transform(TransformAddress::build(current, chunk));
            current += chunk;
        }
    }

    fn collect_transform(&self, transform: TransformAddress) {
        let tag = self.tag.load(Ordering::Acquire);
        if tag_page(tag) == Some(transform.page) {
            self.mask.fetch_or(transform.mask, Ordering::AcqRel);
            if self.tag.load(Ordering::Acquire) == tag {
                return;
            }
            // Displaced while writing: the bits may now sit under another page.
            self.pending.lock().transforms.push(transform);
            return;
        }
        self.displace(transform);
    }

    fn displace(&self, transform: TransformAddress) {
        let mut pending = self.pending.lock();
        if tag_page(self.tag.load(Ordering::Acquire)) == Some(transform.page) {
            self.mask.fetch_or(transform.mask, Ordering::AcqRel);
            return;
        }
        if let Some(old) = self.take_current(&mut pending) {
            pending.transforms.push(old);
        }
        self.mask.store(transform.mask, Ordering::Release);
        let tag = (u64::from(pending.generation) << 32) | u64::from(transform.page + 1);
        self.tag.store(tag, Ordering::Release);
    }

    fn take_current(&self, pending: &mut Pending) -> Option<TransformAddress> {
        let old_tag = self.tag.swap(INVALID_TAG, Ordering::AcqRel);
        let old_mask = self.mask.swap(0, Ordering::AcqRel);
        pending.generation = pending.generation.wrapping_add(1);
        let page = tag_page(old_tag)?;
        (old_mask != 0).then_some(TransformAddress { page, mask: old_mask })
    }

    /// Drain everything collected so far, invoking `callback` once per
    /// maximal contiguous dirty run as `(address, length)`
    pub fn gather(&self, mut callback: impl FnMut(DeviceAddr, u64)) {
        let transforms = {
            let mut pending = self.pending.lock();
            if let Some(current) = self.take_current(&mut pending) {
                pending.transforms.push(current);
            }
            core::mem::take(&mut pending.transforms)
        };

        for transform in transforms {
            let base = u64::from(transform.page) << DIRTY_PAGE_BITS;
            let mut mask = transform.mask;
            let mut offset = 0u64;
            while mask != 0 {
                let empty = mask.trailing_zeros();
                offset += u64::from(empty) << DIRTY_UNIT_BITS;
                mask >>= empty;
                let run = mask.trailing_ones();
                callback(DeviceAddr::new(base + offset), u64::from(run) << DIRTY_UNIT_BITS);
                mask = if run < UNITS_PER_PAGE { mask >> run } else { 0 };
                offset += u64::from(run) << DIRTY_UNIT_BITS;
            }
        }
    }
}

impl fmt::Debug for GpuDirtyTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuDirtyTracker")
            .field("page", &tag_page(self.tag.load(Ordering::Relaxed)))
            .field("mask", &format_args!("{:#018x}", self.mask.load(Ordering::Relaxed)))
            .field("pending", &self.pending.lock().transforms.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gathered(tracker: &GpuDirtyTracker) -> Vec<(u64, u64)> {
        let mut runs = Vec::new();
        tracker.gather(|address, size| runs.push((address.as_u64(), size)));
        runs.sort_unstable();
        runs
    }

    #[test]
    fn test_two_runs_in_one_page() {
        let tracker = GpuDirtyTracker::new();
        tracker.collect(DeviceAddr::new(0), 10);
        tracker.collect(DeviceAddr::new(70), 10);
        assert_eq!(gathered(&tracker), [(0, 32), (64, 32)]);
        assert!(gathered(&tracker).is_empty());
    }

    #[test]
    fn test_adjacent_units_merge() {
        let tracker = GpuDirtyTracker::new();
        tracker.collect(DeviceAddr::new(0x1000), 0x20);
        tracker.collect(DeviceAddr::new(0x1020), 0x30);
        assert_eq!(gathered(&tracker), [(0x1000, 0x60)]);
    }

    #[test]
    fn test_full_page_and_displacement() {
        let tracker = GpuDirtyTracker::new();
        tracker.collect(DeviceAddr::new(0x800), DIRTY_PAGE_SIZE);
        tracker.collect(DeviceAddr::new(0x4010), 4);
        tracker.collect(DeviceAddr::new(0x800), 1);
        assert_eq!(
            gathered(&tracker),
            [(0x800, 32), (0x800, DIRTY_PAGE_SIZE), (0x4000, 32)]
        );
    }

    #[test]
    fn test_write_spanning_pages_is_split() {
        let tracker = GpuDirtyTracker::new();
        tracker.collect(DeviceAddr::new(DIRTY_PAGE_SIZE - 8), 16);
        assert_eq!(
            gathered(&tracker),
            [(DIRTY_PAGE_SIZE - 32, 32), (DIRTY_PAGE_SIZE, 32)]
        );
    }

    #[test]
    fn test_concurrent_collect_loses_nothing() {
        let tracker = GpuDirtyTracker::new();
        std::thread::scope(|scope| {
            for worker in 0..4u64 {
                let tracker = &tracker;
                scope.spawn(move || {
                    for unit in 0..64u64 {
                        let page = (unit % 3) * DIRTY_PAGE_SIZE;
                        tracker.collect(DeviceAddr::new(page + ((unit + worker) % 64) * 32), 1);
                    }
                });
            }
        });

        let mut covered = [0u64; 3];
        tracker.gather(|address, size| {
            let page = (address.as_u64() / DIRTY_PAGE_SIZE) as usize;
            let first = (address.as_u64() % DIRTY_PAGE_SIZE) / 32;
            for unit in first..first + size / 32 {
                covered[page] |= 1 << unit;
            }
        });

        let mut expected = [0u64; 3];
        for worker in 0..4u64 {
            for unit in 0..64u64 {
                expected[(unit % 3) as usize] |= 1 << ((unit + worker) % 64);
            }
        }
        assert_eq!(covered, expected);
    }
}
