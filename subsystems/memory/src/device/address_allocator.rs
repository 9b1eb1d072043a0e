//! # Device Address Allocator
//!
//! First-fit allocator over the device-virtual address space. Free space is
//! kept as a map of disjoint page-aligned runs, coalesced on free.

use std::collections::BTreeMap;

use guestmem_hal::{align_up, DeviceAddr, PAGE_SIZE};

/// Hands out page-aligned device-virtual ranges
#[derive(Debug)]
pub struct DeviceAddressAllocator {
    /// start -> size
    free: BTreeMap<u64, u64>,
    start: u64,
    end: u64,
}

impl DeviceAddressAllocator {
    /// Allocator over `[start, end)`, initially all free
    pub fn new(start: u64, end: u64) -> Self {
        assert!(start % PAGE_SIZE == 0 && end % PAGE_SIZE == 0 && start < end);
        let mut free = BTreeMap::new();
        free.insert(start, end - start);
        Self { free, start, end }
    }

    /// Allocate `size` bytes (rounded up to pages) at the lowest free address
    pub fn allocate(&mut self, size: u64) -> Option<DeviceAddr> {
        if size == 0 {
            return None;
        }
        let size = align_up(size, PAGE_SIZE);
        let (&run_start, &run_size) = self.free.iter().find(|(_, &run)| run >= size)?;
        self.free.remove(&run_start);
        if run_size > size {
            self.free.insert(run_start + size, run_size - size);
        }
        Some(DeviceAddr::new(run_start))
    }

    /// Reserve exactly `[address, address + size)`; fails if any of it is taken
    pub fn allocate_fixed(&mut self, address: DeviceAddr, size: u64) -> bool {
        let start = address.as_u64();
        if size == 0 || start % PAGE_SIZE != 0 || start < self.start {
            return false;
        }
        let end = start + align_up(size, PAGE_SIZE);
        if end > self.end {
            return false;
        }

        let Some((&run_start, &run_size)) = self.free.range(..=start).next_back() else {
            return false;
        };
        let run_end = run_start + run_size;
        if run_end < end {
            return false;
        }

        self.free.remove(&run_start);
        if run_start < start {
            self.free.insert(run_start, start - run_start);
        }
        if end < run_end {
            self.free.insert(end, run_end - end);
        }
        true
    }

    /// Return `[address, address + size)` to the free space
    pub fn free(&mut self, address: DeviceAddr, size: u64) {
        let mut start = address.as_u64();
        let mut end = start + align_up(size, PAGE_SIZE);
        debug_assert!(start >= self.start && end <= self.end);

        if let Some((&prev_start, &prev_size)) = self.free.range(..start).next_back() {
            debug_assert!(prev_start + prev_size <= start, "double free of device range");
            if prev_start + prev_size == start {
                self.free.remove(&prev_start);
                start = prev_start;
            }
        }
        if let Some(&next_size) = self.free.get(&end) {
            self.free.remove(&end);
            end += next_size;
        }
        self.free.insert(start, end - start);
    }

    /// Total free bytes
    pub fn free_size(&self) -> u64 {
        self.free.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const START: u64 = PAGE_SIZE;
    const END: u64 = 64 * PAGE_SIZE;

    #[test]
    fn test_first_fit() {
        let mut allocator = DeviceAddressAllocator::new(START, END);
        let a = allocator.allocate(PAGE_SIZE).unwrap();
        let b = allocator.allocate(3 * PAGE_SIZE).unwrap();
        assert_eq!(a.as_u64(), START);
        assert_eq!(b.as_u64(), START + PAGE_SIZE);

        allocator.free(a, PAGE_SIZE);
        assert_eq!(allocator.allocate(100).unwrap(), a);
    }

    #[test]
    fn test_exhaustion() {
        let mut allocator = DeviceAddressAllocator::new(START, END);
        assert!(allocator.allocate(END - START).is_some());
        assert!(allocator.allocate(PAGE_SIZE).is_none());
        assert!(allocator.allocate(0).is_none());
    }

    #[test]
    fn test_fixed_splits_and_rejects_overlap() {
        let mut allocator = DeviceAddressAllocator::new(START, END);
        let fixed = DeviceAddr::new(8 * PAGE_SIZE);
        assert!(allocator.allocate_fixed(fixed, 2 * PAGE_SIZE));
        assert!(!allocator.allocate_fixed(DeviceAddr::new(9 * PAGE_SIZE), PAGE_SIZE));
        assert_eq!(allocator.free_size(), END - START - 2 * PAGE_SIZE);

        allocator.free(fixed, 2 * PAGE_SIZE);
        assert_eq!(allocator.free_size(), END - START);
        assert!(allocator.allocate(END - START).is_some());
    }
}
