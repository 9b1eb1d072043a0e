//! # Host Mapping
//!
//! Management of the host-side mappings that back the fastmem view.

pub mod heap_tracker;

pub use heap_tracker::{HeapTracker, HeapTrackerConfig};
