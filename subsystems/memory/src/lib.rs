//! # Guestmem Memory Subsystem
//!
//! The memory subsystem provides:
//! - Physical page pools and page groups for the emulated kernel
//! - Device (GPU) address translation across guest processes
//! - Host mapping pressure management for separate heaps
//! - Lock-light GPU dirty tracking of CPU writes
//! - The per-process CPU memory facade tying these together
//!
//! ## Key Principle
//!
//! Every component is constructed from explicit configuration and talks to
//! its collaborators through traits, so each can be driven in isolation.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

pub mod device;
pub mod gpu_dirty;
pub mod host;
pub mod physical;
pub mod virtual_memory;

#[cfg(test)]
mod tests;

use core::fmt;

use guestmem_hal::HalError;

pub use device::{Asid, DeviceAddressTranslator, DeviceInterface, DownloadArea, ProcessMemory};
pub use gpu_dirty::GpuDirtyTracker;
pub use host::{HeapTracker, HeapTrackerConfig};
pub use physical::{AllocationOption, Direction, PageGroup, PhysicalPagePool, Pool};
pub use virtual_memory::{CpuMemory, CpuMemoryConfig, PageType};

/// Memory subsystem result type
pub type MemResult<T> = Result<T, MemError>;

/// Memory subsystem errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemError {
    /// No physical pages satisfy the request
    OutOfMemory,
    /// A bookkeeping arena (block infos, slots) is exhausted
    OutOfResource,
    /// Invalid address
    InvalidAddress,
    /// Invalid size
    InvalidSize,
    /// Address not aligned
    NotAligned,
    /// Region not mapped
    NotMapped,
    /// Range touches unmapped guest memory
    InvalidMemoryRange,
    /// Resource already claimed
    Busy,
    /// A bounded id pool is exhausted
    LimitReached,
    /// Unknown handle or id
    InvalidHandle,
    /// Internal error
    Internal,
}

impl fmt::Display for MemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            MemError::OutOfMemory => "out of memory",
            MemError::OutOfResource => "out of resource",
            MemError::InvalidAddress => "invalid address",
            MemError::InvalidSize => "invalid size",
            MemError::NotAligned => "address not aligned",
            MemError::NotMapped => "region not mapped",
            MemError::InvalidMemoryRange => "invalid memory range",
            MemError::Busy => "resource busy",
            MemError::LimitReached => "limit reached",
            MemError::InvalidHandle => "invalid handle",
            MemError::Internal => "internal error",
        };
        f.write_str(text)
    }
}

impl std::error::Error for MemError {}

impl From<HalError> for MemError {
    fn from(error: HalError) -> Self {
        match error {
            HalError::OutOfMemory => MemError::OutOfMemory,
            HalError::InvalidAddress => MemError::InvalidAddress,
            HalError::InvalidParameter => MemError::InvalidSize,
        }
    }
}

// =============================================================================
// Scalar Accesses
// =============================================================================

/// Integer widths guest code can load and store in one access
pub trait Scalar: Copy + Default + PartialEq + fmt::Debug + Send + Sync + 'static {
    /// Width in bytes
    const SIZE: usize;

    /// Decode from the first `SIZE` little-endian bytes
    fn from_le_slice(bytes: &[u8]) -> Self;

    /// Encode into the first `SIZE` bytes of `out`, little-endian
    fn write_le(self, out: &mut [u8]);

    /// Zero-extend to 64 bits
    fn to_u64(self) -> u64;

    /// Truncate from 64 bits
    fn from_u64(value: u64) -> Self;
}

macro_rules! impl_scalar {
    ($($ty:ty),*) => {$(
        impl Scalar for $ty {
            const SIZE: usize = core::mem::size_of::<$ty>();

            #[inline]
            fn from_le_slice(bytes: &[u8]) -> Self {
                let mut raw = [0u8; core::mem::size_of::<$ty>()];
                raw.copy_from_slice(&bytes[..Self::SIZE]);
                <$ty>::from_le_bytes(raw)
            }

            #[inline]
            fn write_le(self, out: &mut [u8]) {
                out[..Self::SIZE].copy_from_slice(&self.to_le_bytes());
            }

            #[inline]
            fn to_u64(self) -> u64 {
                self as u64
            }

            #[inline]
            fn from_u64(value: u64) -> Self {
                value as $ty
            }
        }
    )*};
}

impl_scalar!(u8, u16, u32, u64);
