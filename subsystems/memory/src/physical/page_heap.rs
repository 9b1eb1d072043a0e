//! # Page Heap
//!
//! Buddy-style free page heap backing one pool manager.
//!
//! The heap keeps a free bitmap per block class. Freeing a block sets its
//! bit; when every buddy that makes up the enclosing block of the next class
//! is free, the buddies are cleared and the merged block is pushed one class
//! up. Allocation pops a block from the requested class or, failing that,
//! from a larger one and gives the unused tail back.

use super::page_bitmap::{PageBitmap, RandomBitGenerator};
use guestmem_hal::{align_down, align_up, PhysAddr, PAGE_BITS, PAGE_SIZE};

/// Page shifts of the block classes, smallest first
pub const BLOCK_SHIFTS: [u32; 7] = [12, 16, 21, 22, 25, 29, 30];

/// Number of block classes
pub const NUM_BLOCK_CLASSES: usize = BLOCK_SHIFTS.len();

/// Number of pages in a block of class `index`
#[inline]
pub const fn block_num_pages(index: usize) -> u64 {
    1 << (BLOCK_SHIFTS[index] - PAGE_BITS)
}

/// Largest block class not larger than `num_pages`
pub fn block_index(num_pages: u64) -> Option<usize> {
    (0..NUM_BLOCK_CLASSES).rev().find(|&index| num_pages >= block_num_pages(index))
}

/// Smallest block class able to hold `max(num_pages, align_pages)`
pub fn aligned_block_index(num_pages: u64, align_pages: u64) -> Option<usize> {
    let target = num_pages.max(align_pages);
    (0..NUM_BLOCK_CLASSES).find(|&index| target <= block_num_pages(index))
}

#[derive(Debug)]
struct Block {
    bitmap: PageBitmap,
    heap_address: u64,
    block_shift: u32,
    next_block_shift: Option<u32>,
}

impl Block {
    fn new(address: u64, size: u64, block_shift: u32, next_block_shift: Option<u32>) -> Self {
        let align = 1u64 << next_block_shift.unwrap_or(block_shift);
        let start = align_down(address, align);
        let end = align_up(address + size, align);
        Self {
            bitmap: PageBitmap::new(((end - start) >> block_shift) as usize),
            heap_address: start,
            block_shift,
            next_block_shift,
        }
    }

    #[inline]
    fn size(&self) -> u64 {
        1 << self.block_shift
    }

    /// Free one block. Returns the merged block when all of its buddies
    /// are now free.
    fn push_block(&mut self, address: u64) -> Option<u64> {
        let offset = ((address - self.heap_address) >> self.block_shift) as usize;
        self.bitmap.set_bit(offset);

        let next_shift = self.next_block_shift?;
        let diff = 1usize << (next_shift - self.block_shift);
        let group = offset & !(diff - 1);
        self.bitmap
            .clear_range(group, diff)
            .then(|| self.heap_address + ((group as u64) << self.block_shift))
    }

    fn pop_block(&mut self, rng: Option<&mut RandomBitGenerator>) -> Option<u64> {
        let offset = self.bitmap.find_free_block(rng)?;
        self.bitmap.clear_bit(offset);
        Some(self.heap_address + ((offset as u64) << self.block_shift))
    }

    fn free_size(&self) -> u64 {
        self.bitmap.count() as u64 * self.size()
    }
}

/// Buddy heap over one contiguous physical range
#[derive(Debug)]
pub struct PageHeap {
    start: PhysAddr,
    size: u64,
    blocks: Vec<Block>,
    rng: RandomBitGenerator,
}

impl PageHeap {
    /// Create a heap over `[start, start + size)` with every page allocated
    pub fn new(start: PhysAddr, size: u64) -> Self {
        let blocks = BLOCK_SHIFTS
            .iter()
            .enumerate()
            .map(|(index, &shift)| {
                Block::new(start.as_u64(), size, shift, BLOCK_SHIFTS.get(index + 1).copied())
            })
            .collect();

        Self {
            start,
            size,
            blocks,
            rng: RandomBitGenerator::new(start.as_u64() ^ size.rotate_left(17)),
        }
    }

    /// First address of the heap
    #[inline]
    pub fn start(&self) -> PhysAddr {
        self.start
    }

    /// Size of the heap in bytes
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Bytes currently free
    pub fn free_size(&self) -> u64 {
        self.blocks.iter().map(Block::free_size).sum()
    }

    /// Check whether `address` lies inside the heap
    #[inline]
    pub fn contains(&self, address: PhysAddr) -> bool {
        address >= self.start && address.offset_from(self.start) < self.size
    }

    fn free_block(&mut self, mut block: u64, mut index: usize) {
        loop {
            match self.blocks[index].push_block(block) {
                Some(merged) => {
                    block = merged;
                    index += 1;
                }
                None => break,
            }
        }
    }

    /// Pop one block of class `index`, taking a larger one if needed
    pub fn allocate_block(&mut self, index: usize, random: bool) -> Option<PhysAddr> {
        let needed = self.blocks[index].size();

        for class in index..self.blocks.len() {
            let rng = if random { Some(&mut self.rng) } else { None };
            if let Some(address) = self.blocks[class].pop_block(rng) {
                let allocated = self.blocks[class].size();
                if allocated > needed {
                    self.free(PhysAddr::new(address + needed), (allocated - needed) / PAGE_SIZE);
                }
                return Some(PhysAddr::new(address));
            }
        }
        None
    }

    /// Allocate `num_pages` aligned to a block of class `index`; the tail of
    /// the block past `num_pages` is returned to the heap
    pub fn allocate_aligned(&mut self, index: usize, num_pages: u64) -> Option<PhysAddr> {
        let address = self.allocate_block(index, false)?;
        let block_pages = block_num_pages(index);
        if block_pages > num_pages {
            self.free(address.add(num_pages * PAGE_SIZE), block_pages - num_pages);
        }
        Some(address)
    }

    /// Return `num_pages` pages starting at `address` to the heap
    pub fn free(&mut self, address: PhysAddr, num_pages: u64) {
        if num_pages == 0 {
            return;
        }
        assert!(
            self.contains(address) && self.contains(address.add(num_pages * PAGE_SIZE - 1)),
            "free of {num_pages} pages at {address:#x} outside heap"
        );

        let start = address.as_u64();
        let end = start + num_pages * PAGE_SIZE;

        // Free the largest aligned blocks in the middle of the range
        let mut big_index = None;
        let (mut before_end, mut after_start) = (start, end);
        for index in (0..self.blocks.len()).rev() {
            let block_size = self.blocks[index].size();
            let big_start = align_up(start, block_size);
            let big_end = align_down(end, block_size);
            if big_start < big_end {
                let mut block = big_start;
                while block < big_end {
                    self.free_block(block, index);
                    block += block_size;
                }
                before_end = big_start;
                after_start = big_end;
                big_index = Some(index);
                break;
            }
        }
        let big_index = big_index.expect("page run smaller than the smallest block class");

        // Fill in the edges with progressively smaller blocks
        for index in (0..big_index).rev() {
            let block_size = self.blocks[index].size();
            while start + block_size <= before_end {
                before_end -= block_size;
                self.free_block(before_end, index);
            }
        }
        for index in (0..big_index).rev() {
            let block_size = self.blocks[index].size();
            while after_start + block_size <= end {
                self.free_block(after_start, index);
                after_start += block_size;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guestmem_hal::DRAM_BASE;

    const MIB: u64 = 1 << 20;

    fn heap(size: u64) -> PageHeap {
        let mut heap = PageHeap::new(PhysAddr::new(DRAM_BASE), size);
        heap.free(PhysAddr::new(DRAM_BASE), size / PAGE_SIZE);
        heap
    }

    #[test]
    fn test_block_index() {
        assert_eq!(block_index(0), None);
        assert_eq!(block_index(1), Some(0));
        assert_eq!(block_index(15), Some(0));
        assert_eq!(block_index(16), Some(1));
        assert_eq!(block_index(600), Some(2));
        assert_eq!(block_index(1 << 20), Some(6));
    }

    #[test]
    fn test_aligned_block_index() {
        assert_eq!(aligned_block_index(1, 1), Some(0));
        assert_eq!(aligned_block_index(3, 16), Some(1));
        assert_eq!(aligned_block_index(17, 1), Some(2));
        assert_eq!(aligned_block_index(1 << 19, 1), None);
    }

    #[test]
    fn test_free_coalesces_to_large_blocks() {
        let heap = heap(4 * MIB);
        assert_eq!(heap.free_size(), 4 * MIB);
        // 4 MiB aligned at DRAM_BASE collapses into a single 4 MiB block
        assert_eq!(heap.blocks[3].bitmap.count(), 1);
        assert_eq!(heap.blocks[0].bitmap.count(), 0);
    }

    #[test]
    fn test_allocate_splits_and_refrees() {
        let mut heap = heap(2 * MIB);
        let page = heap.allocate_block(0, false).unwrap();
        assert_eq!(page.as_u64(), DRAM_BASE);
        assert_eq!(heap.free_size(), 2 * MIB - PAGE_SIZE);

        heap.free(page, 1);
        assert_eq!(heap.free_size(), 2 * MIB);
        assert_eq!(heap.blocks[2].bitmap.count(), 1);
    }

    #[test]
    fn test_exhaustion() {
        let mut heap = heap(64 * 1024);
        let mut pages = Vec::new();
        while let Some(page) = heap.allocate_block(0, true) {
            pages.push(page);
        }
        assert_eq!(pages.len(), 16);
        assert_eq!(heap.free_size(), 0);

        pages.sort();
        pages.dedup();
        assert_eq!(pages.len(), 16);
        for page in pages {
            heap.free(page, 1);
        }
        assert_eq!(heap.free_size(), 64 * 1024);
        assert_eq!(heap.blocks[1].bitmap.count(), 1);
    }

    #[test]
    fn test_allocate_aligned_frees_tail() {
        let mut heap = heap(2 * MIB);
        let index = aligned_block_index(3, 16).unwrap();
        let address = heap.allocate_aligned(index, 3).unwrap();
        assert!(address.is_aligned(16 * PAGE_SIZE));
        assert_eq!(heap.free_size(), 2 * MIB - 3 * PAGE_SIZE);
    }

    #[test]
    fn test_unaligned_range_free() {
        let mut heap = PageHeap::new(PhysAddr::new(DRAM_BASE), 4 * MIB);
        heap.free(PhysAddr::new(DRAM_BASE + 3 * PAGE_SIZE), 700);
        assert_eq!(heap.free_size(), 700 * PAGE_SIZE);
    }
}
