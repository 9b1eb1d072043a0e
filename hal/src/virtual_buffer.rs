//! # Virtual Buffers
//!
//! Large flat tables (page tables, per-page translation entries, counters)
//! are reserved as anonymous host mappings so that untouched entries cost no
//! resident memory.

use crate::{HalError, HalResult};
use core::fmt;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, AtomicU8};
use memmap2::MmapMut;

/// Types for which the all-zero bit pattern is a valid value.
///
/// # Safety
/// Implementors must be valid when every byte is zero and must not need
/// drop glue.
pub unsafe trait ZeroInit: Sized {}

// SAFETY: integers and their atomic wrappers are valid for any bit pattern.
unsafe impl ZeroInit for u8 {}
unsafe impl ZeroInit for u16 {}
unsafe impl ZeroInit for u32 {}
unsafe impl ZeroInit for u64 {}
unsafe impl ZeroInit for AtomicU8 {}
unsafe impl ZeroInit for AtomicU16 {}
unsafe impl ZeroInit for AtomicU32 {}
unsafe impl ZeroInit for AtomicU64 {}

/// Zero-initialised, lazily committed array of `T`
pub struct VirtualBuffer<T: ZeroInit> {
    map: MmapMut,
    len: usize,
    _marker: PhantomData<T>,
}

impl<T: ZeroInit> VirtualBuffer<T> {
    /// Reserve `len` zeroed elements
    pub fn new(len: usize) -> HalResult<Self> {
        let bytes = len
            .checked_mul(core::mem::size_of::<T>())
            .ok_or(HalError::InvalidParameter)?;

        let map = MmapMut::map_anon(bytes.max(1)).map_err(|err| {
            log::error!("Failed to reserve {bytes:#x} bytes of table storage: {err}");
            HalError::OutOfMemory
        })?;

        Ok(Self { map, len, _marker: PhantomData })
    }

    /// Number of elements
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check whether the buffer holds no elements
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<T: ZeroInit> Deref for VirtualBuffer<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        // SAFETY: the mapping is page aligned, at least `len * size_of::<T>()`
        // bytes long, zero filled by the host, and `T: ZeroInit`.
        unsafe { core::slice::from_raw_parts(self.map.as_ptr().cast::<T>(), self.len) }
    }
}

impl<T: ZeroInit> DerefMut for VirtualBuffer<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        // SAFETY: as in `deref`, and `&mut self` guarantees exclusivity.
        unsafe { core::slice::from_raw_parts_mut(self.map.as_mut_ptr().cast::<T>(), self.len) }
    }
}

impl<T: ZeroInit> fmt::Debug for VirtualBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualBuffer")
            .field("len", &self.len)
            .field("element_size", &core::mem::size_of::<T>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::Ordering;

    #[test]
    fn test_zeroed_on_creation() {
        let buffer: VirtualBuffer<AtomicU64> = VirtualBuffer::new(1 << 16).unwrap();
        assert_eq!(buffer.len(), 1 << 16);
        assert_eq!(buffer[0].load(Ordering::Relaxed), 0);
        assert_eq!(buffer[(1 << 16) - 1].load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_writes_are_visible() {
        let mut buffer: VirtualBuffer<u32> = VirtualBuffer::new(16).unwrap();
        buffer[3] = 7;
        assert_eq!(buffer[3], 7);
        assert_eq!(buffer.iter().sum::<u32>(), 7);
    }

    #[test]
    fn test_empty_buffer() {
        let buffer: VirtualBuffer<u8> = VirtualBuffer::new(0).unwrap();
        assert!(buffer.is_empty());
    }
}
