//! # Guestmem HAL - Host Abstraction Layer
//!
//! This crate defines the address types and host-side primitives shared by
//! every guest memory component.
//!
//! ## Design Philosophy
//!
//! The HAL is designed to be:
//! - **Typed**: guest-physical, guest-virtual and device-virtual addresses
//!   never mix silently
//! - **Minimal**: only exposes what the memory core needs
//! - **Safe**: raw host pointers are confined to a single hot accessor

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

pub mod host_memory;
pub mod permission;
pub mod virtual_buffer;

use core::fmt;
use static_assertions::assert_eq_size;

pub use host_memory::{HostMemory, HostMemoryBuffer};
pub use permission::MemoryPermission;
pub use virtual_buffer::{VirtualBuffer, ZeroInit};

/// Result type for HAL operations
pub type HalResult<T> = Result<T, HalError>;

/// Errors that can occur in HAL operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalError {
    /// Invalid parameter provided
    InvalidParameter,
    /// Address is invalid or not aligned
    InvalidAddress,
    /// The host refused to reserve memory
    OutOfMemory,
}

impl fmt::Display for HalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HalError::InvalidParameter => f.write_str("invalid parameter"),
            HalError::InvalidAddress => f.write_str("invalid address"),
            HalError::OutOfMemory => f.write_str("host memory reservation failed"),
        }
    }
}

impl std::error::Error for HalError {}

// =============================================================================
// Page Geometry
// =============================================================================

/// Guest page shift
pub const PAGE_BITS: u32 = 12;

/// Guest page size in bytes
pub const PAGE_SIZE: u64 = 1 << PAGE_BITS;

/// Mask of the in-page offset bits
pub const PAGE_MASK: u64 = PAGE_SIZE - 1;

/// Physical address at which guest DRAM begins
pub const DRAM_BASE: u64 = 0x8000_0000;

/// Guest CPUs mask the upper 16 bits of every virtual access
pub const VIRTUAL_ADDRESS_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

/// Align `value` up to `align` (power of two)
#[inline]
pub const fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

/// Align `value` down to `align` (power of two)
#[inline]
pub const fn align_down(value: u64, align: u64) -> u64 {
    value & !(align - 1)
}

/// Number of pages needed to hold `size` bytes
#[inline]
pub const fn pages_for(size: u64) -> u64 {
    align_up(size, PAGE_SIZE) >> PAGE_BITS
}

// =============================================================================
// Address Types
// =============================================================================

macro_rules! address_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(u64);

        impl $name {
            /// The null address
            pub const NULL: Self = Self(0);

            /// Create a new address
            #[inline]
            pub const fn new(addr: u64) -> Self {
                Self(addr)
            }

            /// Get the raw address value
            #[inline]
            pub const fn as_u64(self) -> u64 {
                self.0
            }

            /// Check whether this is the null address
            #[inline]
            pub const fn is_null(self) -> bool {
                self.0 == 0
            }

            /// Check if the address is aligned to the given alignment
            #[inline]
            pub const fn is_aligned(self, align: u64) -> bool {
                self.0 % align == 0
            }

            /// Align the address up to the given alignment
            #[inline]
            pub const fn align_up(self, align: u64) -> Self {
                Self(align_up(self.0, align))
            }

            /// Align the address down to the given alignment
            #[inline]
            pub const fn align_down(self, align: u64) -> Self {
                Self(align_down(self.0, align))
            }

            /// Add an offset to the address
            #[inline]
            pub const fn add(self, offset: u64) -> Self {
                Self(self.0 + offset)
            }

            /// Subtract an offset from the address
            #[inline]
            pub const fn sub(self, offset: u64) -> Self {
                Self(self.0 - offset)
            }

            /// Byte distance from `base` up to this address
            #[inline]
            pub const fn offset_from(self, base: Self) -> u64 {
                self.0 - base.0
            }

            /// Index of the page containing this address
            #[inline]
            pub const fn page_index(self) -> u64 {
                self.0 >> PAGE_BITS
            }

            /// Offset of this address within its page
            #[inline]
            pub const fn page_offset(self) -> u64 {
                self.0 & PAGE_MASK
            }
        }

        impl fmt::LowerHex for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::LowerHex::fmt(&self.0, f)
            }
        }

        impl fmt::UpperHex for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::UpperHex::fmt(&self.0, f)
            }
        }

        assert_eq_size!($name, u64);
    };
}

address_type! {
    /// Guest-physical address
    PhysAddr
}

address_type! {
    /// Guest-virtual (process) address
    VirtAddr
}

address_type! {
    /// Device-virtual (GPU MMU) address
    DeviceAddr
}

impl PhysAddr {
    /// Offset of this address from the start of DRAM
    #[inline]
    pub const fn dram_offset(self) -> u64 {
        self.0 - DRAM_BASE
    }

    /// Physical address at `offset` bytes into DRAM
    #[inline]
    pub const fn from_dram_offset(offset: u64) -> Self {
        Self(DRAM_BASE + offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment_helpers() {
        assert_eq!(align_up(0x1001, PAGE_SIZE), 0x2000);
        assert_eq!(align_down(0x1fff, PAGE_SIZE), 0x1000);
        assert_eq!(pages_for(1), 1);
        assert_eq!(pages_for(PAGE_SIZE * 3), 3);
        assert_eq!(pages_for(0), 0);
    }

    #[test]
    fn test_address_pages() {
        let addr = VirtAddr::new(0x1234_5678);
        assert_eq!(addr.page_index(), 0x12345);
        assert_eq!(addr.page_offset(), 0x678);
        assert!(addr.align_down(PAGE_SIZE).is_aligned(PAGE_SIZE));
    }

    #[test]
    fn test_dram_offsets() {
        let paddr = PhysAddr::from_dram_offset(0x4000);
        assert_eq!(paddr.as_u64(), DRAM_BASE + 0x4000);
        assert_eq!(paddr.dram_offset(), 0x4000);
    }
}
