//! # Virtual Memory Management
//!
//! Per-process guest page tables and the CPU-facing access layer built on
//! them.

pub mod cpu_memory;
pub mod page_table;

pub use cpu_memory::{set_current_core, CpuMemory, CpuMemoryConfig};
pub use page_table::{PageEntry, PageTable, PageType};
