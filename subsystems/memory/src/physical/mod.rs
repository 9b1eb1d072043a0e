//! # Physical Memory Management
//!
//! Guest DRAM allocation for the emulated kernel.
//!
//! ```text
//! PoolLayout ──► PhysicalPagePool ──► [Pool; 4] ──► Manager chain
//!                      ▲                               │
//!                      │ open / close                  ▼
//!                  PageGroup                       PageHeap (buddy)
//! ```

pub mod layout;
pub mod page_bitmap;
pub mod page_group;
pub mod page_heap;
pub mod pool;

pub use layout::{AllocationOption, Direction, MemoryArrangement, Pool, PoolLayout, PoolRegion};
pub use page_group::{BlockInfoManager, PageGroup, PhysicalBlock};
pub use page_heap::PageHeap;
pub use pool::PhysicalPagePool;
