//! # Guest Page Table
//!
//! One atomic entry per guest page holding the backing physical address with
//! the page's [`PageType`] in the low bits, plus a per-page record of the
//! mapping call that produced it.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use guestmem_hal::{PhysAddr, VirtualBuffer, PAGE_BITS, PAGE_MASK};

use crate::{MemError, MemResult};

const TYPE_MASK: u64 = 0b11;

/// How accesses to a guest page are serviced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PageType {
    /// Nothing mapped; reads yield zero, writes are dropped
    Unmapped = 0,
    /// Plain guest memory
    Memory = 1,
    /// Guest memory watched by a debugger; host view is protected
    DebugMemory = 2,
    /// Guest memory the GPU holds a copy of; accesses synchronize first
    RasterizerCachedMemory = 3,
}

impl PageType {
    #[inline]
    const fn from_bits(bits: u64) -> Self {
        match bits & TYPE_MASK {
            1 => PageType::Memory,
            2 => PageType::DebugMemory,
            3 => PageType::RasterizerCachedMemory,
            _ => PageType::Unmapped,
        }
    }
}

/// Packed page table entry
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PageEntry(u64);

impl PageEntry {
    /// Entry of an unmapped page
    pub const UNMAPPED: Self = Self(0);

    /// Entry backed by `backing` (page aligned)
    #[inline]
    pub fn new(backing: PhysAddr, page_type: PageType) -> Self {
        debug_assert_eq!(backing.as_u64() & PAGE_MASK, 0);
        Self(backing.as_u64() | page_type as u64)
    }

    /// Type of the page
    #[inline]
    pub const fn page_type(self) -> PageType {
        PageType::from_bits(self.0)
    }

    /// Backing page, kept across type changes
    #[inline]
    pub const fn backing(self) -> Option<PhysAddr> {
        let address = self.0 & !PAGE_MASK;
        if address == 0 {
            None
        } else {
            Some(PhysAddr::new(address))
        }
    }

    /// Same backing with a different type
    #[inline]
    pub const fn with_type(self, page_type: PageType) -> Self {
        Self((self.0 & !TYPE_MASK) | page_type as u64)
    }
}

impl fmt::Debug for PageEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageEntry")
            .field("type", &self.page_type())
            .field("backing", &self.backing())
            .finish()
    }
}

/// Flat per-process page table
pub struct PageTable {
    address_space_bits: u32,
    entries: VirtualBuffer<AtomicU64>,
    /// First page + 1 of the mapping each page belongs to
    blocks: VirtualBuffer<AtomicU64>,
}

impl PageTable {
    /// Reserve a table covering `1 << address_space_bits` bytes
    pub fn new(address_space_bits: u32) -> MemResult<Self> {
        if address_space_bits <= PAGE_BITS || address_space_bits > 48 {
            return Err(MemError::InvalidSize);
        }
        let pages = 1usize << (address_space_bits - PAGE_BITS);
        Ok(Self {
            address_space_bits,
            entries: VirtualBuffer::new(pages)?,
            blocks: VirtualBuffer::new(pages)?,
        })
    }

    /// Width of the address space
    pub fn address_space_bits(&self) -> u32 {
        self.address_space_bits
    }

    /// Size of the address space in bytes
    pub fn address_space_size(&self) -> u64 {
        1 << self.address_space_bits
    }

    /// Check whether `[address, address + size)` lies inside the address space
    #[inline]
    pub fn contains(&self, address: u64, size: u64) -> bool {
        address
            .checked_add(size)
            .is_some_and(|end| end <= self.address_space_size())
    }

    /// Entry of `page`; pages outside the table read as unmapped
    #[inline]
    pub fn entry(&self, page: u64) -> PageEntry {
        self.entries
            .get(page as usize)
            .map_or(PageEntry::UNMAPPED, |entry| PageEntry(entry.load(Ordering::Acquire)))
    }

    /// Overwrite the entry of `page`
    #[inline]
    pub fn set_entry(&self, page: u64, entry: PageEntry) {
        self.entries[page as usize].store(entry.0, Ordering::Release);
    }

    /// Atomically rewrite the entry of `page` when `f` returns a new one
    pub fn update(&self, page: u64, mut f: impl FnMut(PageEntry) -> Option<PageEntry>) -> Option<PageEntry> {
        self.entries[page as usize]
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| f(PageEntry(raw)).map(|entry| entry.0))
            .ok()
            .map(PageEntry)
    }

    /// Mapping block of `page`, if mapped
    #[inline]
    pub fn block(&self, page: u64) -> Option<u64> {
        let raw = self.blocks.get(page as usize)?.load(Ordering::Relaxed);
        raw.checked_sub(1)
    }

    /// Record that `page` belongs to the mapping starting at `base_page`
    #[inline]
    pub fn set_block(&self, page: u64, base_page: Option<u64>) {
        self.blocks[page as usize].store(base_page.map_or(0, |base| base + 1), Ordering::Relaxed);
    }
}

impl fmt::Debug for PageTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageTable")
            .field("address_space_bits", &self.address_space_bits)
            .field("pages", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guestmem_hal::DRAM_BASE;

    #[test]
    fn test_entry_packing() {
        let backing = PhysAddr::new(DRAM_BASE + 0x5000);
        let entry = PageEntry::new(backing, PageType::Memory);
        assert_eq!(entry.page_type(), PageType::Memory);
        assert_eq!(entry.backing(), Some(backing));

        let cached = entry.with_type(PageType::RasterizerCachedMemory);
        assert_eq!(cached.page_type(), PageType::RasterizerCachedMemory);
        assert_eq!(cached.backing(), Some(backing));
        assert_eq!(PageEntry::UNMAPPED.backing(), None);
    }

    #[test]
    fn test_table_bounds() {
        let table = PageTable::new(24).unwrap();
        assert!(table.contains(0, 1 << 24));
        assert!(!table.contains(1 << 24, 1));
        assert!(!table.contains(u64::MAX, 2));
        assert_eq!(table.entry(1 << 20), PageEntry::UNMAPPED);
        assert!(PageTable::new(PAGE_BITS).is_err());
    }

    #[test]
    fn test_update_and_blocks() {
        let table = PageTable::new(24).unwrap();
        let entry = PageEntry::new(PhysAddr::new(DRAM_BASE), PageType::Memory);
        table.set_entry(3, entry);
        table.set_block(3, Some(0));

        let previous = table.update(3, |entry| {
            (entry.page_type() == PageType::Memory).then(|| entry.with_type(PageType::DebugMemory))
        });
        assert_eq!(previous, Some(entry));
        assert_eq!(table.entry(3).page_type(), PageType::DebugMemory);
        assert!(table.update(3, |_| None).is_none());

        assert_eq!(table.block(3), Some(0));
        assert_eq!(table.block(4), None);
    }
}
