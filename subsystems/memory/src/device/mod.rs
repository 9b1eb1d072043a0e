//! # Device Address Translation
//!
//! Lets the emulated GPU resolve device-virtual addresses to guest-physical
//! pages, and the CPU side find every device address that maps a physical
//! page it just touched.
//!
//! ```text
//! SessionManager ──► DeviceAddressTranslator ──► HostMemory (DRAM)
//!                         │        │
//!                         │        └─► MultiAddressContainer
//!                         └─► DeviceAddressAllocator, RangeMutex
//! ```

pub mod address_allocator;
pub mod multi_address;
pub mod range_mutex;
pub mod session;
pub mod translator;

pub use address_allocator::DeviceAddressAllocator;
pub use multi_address::MultiAddressContainer;
pub use range_mutex::{RangeGuard, RangeMutex};
pub use session::{SessionId, SessionManager};
pub use translator::{
    Asid, DeviceAddressTranslator, DeviceInterface, DeviceTranslatorConfig, DownloadArea, ProcessMemory,
};
