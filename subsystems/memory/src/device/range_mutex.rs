//! # Range Mutex
//!
//! Lock over address ranges: overlapping ranges serialize, disjoint ranges
//! proceed concurrently. Waiters block on a condition variable instead of
//! spinning since cached-count updates can cover long runs of pages.

use std::sync::{Condvar, Mutex, PoisonError};

/// Lock keyed on `[address, address + size)` spans
#[derive(Debug, Default)]
pub struct RangeMutex {
    held: Mutex<Vec<(u64, u64)>>,
    released: Condvar,
}

/// Holds one range until dropped
#[derive(Debug)]
pub struct RangeGuard<'a> {
    mutex: &'a RangeMutex,
    range: (u64, u64),
}

#[inline]
fn overlaps(a: (u64, u64), b: (u64, u64)) -> bool {
    a.0 < b.1 && b.0 < a.1
}

impl RangeMutex {
    /// Create an unlocked range mutex
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `[address, address + size)` overlaps no held range, then
    /// hold it
    pub fn lock(&self, address: u64, size: u64) -> RangeGuard<'_> {
        let range = (address, address.saturating_add(size.max(1)));
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        while held.iter().any(|&other| overlaps(other, range)) {
            held = self.released.wait(held).unwrap_or_else(PoisonError::into_inner);
        }
        held.push(range);
        RangeGuard { mutex: self, range }
    }

    /// Hold the range only if nothing overlapping is held
    pub fn try_lock(&self, address: u64, size: u64) -> Option<RangeGuard<'_>> {
        let range = (address, address.saturating_add(size.max(1)));
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if held.iter().any(|&other| overlaps(other, range)) {
            return None;
        }
        held.push(range);
        Some(RangeGuard { mutex: self, range })
    }
}

impl Drop for RangeGuard<'_> {
    fn drop(&mut self) {
        let mut held = self.mutex.held.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(position) = held.iter().position(|&range| range == self.range) {
            held.swap_remove(position);
        }
        drop(held);
        self.mutex.released.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_disjoint_ranges_coexist() {
        let mutex = RangeMutex::new();
        let _a = mutex.lock(0, 0x1000);
        let _b = mutex.lock(0x1000, 0x1000);
        assert!(mutex.try_lock(0x800, 0x10).is_none());
        assert!(mutex.try_lock(0x2000, 0x10).is_some());
    }

    #[test]
    fn test_release_allows_relock() {
        let mutex = RangeMutex::new();
        {
            let _guard = mutex.lock(0, 0x100);
            assert!(mutex.try_lock(0x80, 1).is_none());
        }
        assert!(mutex.try_lock(0x80, 1).is_some());
    }

    #[test]
    fn test_overlapping_ranges_serialize() {
        let mutex = RangeMutex::new();
        let inside = AtomicUsize::new(0);
        let max_inside = AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for worker in 0..4u64 {
                let (mutex, inside, max_inside) = (&mutex, &inside, &max_inside);
                scope.spawn(move || {
                    for _ in 0..200 {
                        let _guard = mutex.lock(worker * 0x10, 0x100);
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }
}
