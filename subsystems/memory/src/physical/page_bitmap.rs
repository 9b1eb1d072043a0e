//! # Page Bitmap
//!
//! Two-level free-block bitmap used by every block class of the page heap.
//! A set bit marks a free block. The summary level keeps one bit per
//! non-empty word so that searching a mostly-empty class stays cheap.

/// Small xorshift generator used for randomized block selection
#[derive(Debug, Clone)]
pub struct RandomBitGenerator {
    state: u64,
}

impl RandomBitGenerator {
    /// Create a generator from a seed (zero is remapped)
    pub const fn new(seed: u64) -> Self {
        Self { state: if seed == 0 { 0x9E37_79B9_7F4A_7C15 } else { seed } }
    }

    /// Next raw value
    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    /// Uniform-ish value in `0..bound`
    pub fn below(&mut self, bound: usize) -> usize {
        debug_assert!(bound > 0);
        (self.next_u64() % bound as u64) as usize
    }
}

/// Free-block bitmap
#[derive(Debug)]
pub struct PageBitmap {
    words: Vec<u64>,
    summary: Vec<u64>,
    num_bits: usize,
    count: usize,
}

impl PageBitmap {
    /// Create an empty bitmap tracking `num_bits` blocks
    pub fn new(num_bits: usize) -> Self {
        let num_words = num_bits.div_ceil(64);
        Self {
            words: vec![0; num_words],
            summary: vec![0; num_words.div_ceil(64).max(1)],
            num_bits,
            count: 0,
        }
    }

    /// Number of tracked blocks
    #[inline]
    pub fn num_bits(&self) -> usize {
        self.num_bits
    }

    /// Number of free blocks
    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    /// Check whether block `index` is free
    #[inline]
    pub fn is_set(&self, index: usize) -> bool {
        index < self.num_bits && self.words[index / 64] & (1 << (index % 64)) != 0
    }

    /// Mark block `index` free
    pub fn set_bit(&mut self, index: usize) {
        assert!(index < self.num_bits, "bitmap index {index} out of range");
        let word = &mut self.words[index / 64];
        let bit = 1u64 << (index % 64);
        if *word & bit == 0 {
            *word |= bit;
            self.count += 1;
            let word_index = index / 64;
            self.summary[word_index / 64] |= 1 << (word_index % 64);
        }
    }

    /// Mark block `index` allocated
    pub fn clear_bit(&mut self, index: usize) {
        assert!(index < self.num_bits, "bitmap index {index} out of range");
        let word_index = index / 64;
        let bit = 1u64 << (index % 64);
        if self.words[word_index] & bit != 0 {
            self.words[word_index] &= !bit;
            self.count -= 1;
            self.sync_summary(word_index);
        }
    }

    /// Clear `count` bits starting at `offset`, but only if every one of
    /// them is set. Returns whether the range was cleared.
    pub fn clear_range(&mut self, offset: usize, count: usize) -> bool {
        if count == 0 || offset + count > self.num_bits {
            return false;
        }

        // Block classes always merge a power-of-two group that sits inside one word
        if offset % 64 + count <= 64 {
            let word_index = offset / 64;
            let mask = if count == 64 { u64::MAX } else { ((1u64 << count) - 1) << (offset % 64) };
            if self.words[word_index] & mask != mask {
                return false;
            }
            self.words[word_index] &= !mask;
            self.count -= count;
            self.sync_summary(word_index);
            return true;
        }

        if !(offset..offset + count).all(|index| self.is_set(index)) {
            return false;
        }
        for index in offset..offset + count {
            self.clear_bit(index);
        }
        true
    }

    /// Find a free block, either the lowest one or a randomly chosen one
    pub fn find_free_block(&self, rng: Option<&mut RandomBitGenerator>) -> Option<usize> {
        if self.count == 0 {
            return None;
        }

        match rng {
            None => {
                let summary_index = self.summary.iter().position(|&word| word != 0)?;
                let word_index =
                    summary_index * 64 + self.summary[summary_index].trailing_zeros() as usize;
                Some(word_index * 64 + self.words[word_index].trailing_zeros() as usize)
            }
            Some(rng) => {
                let start = rng.below(self.summary.len());
                let summary_index = (0..self.summary.len())
                    .map(|step| (start + step) % self.summary.len())
                    .find(|&index| self.summary[index] != 0)?;
                let word_index =
                    summary_index * 64 + Self::pick_bit(self.summary[summary_index], rng);
                Some(word_index * 64 + Self::pick_bit(self.words[word_index], rng))
            }
        }
    }

    fn pick_bit(word: u64, rng: &mut RandomBitGenerator) -> usize {
        let rotation = rng.below(64) as u32;
        ((word.rotate_right(rotation).trailing_zeros() + rotation) % 64) as usize
    }

    fn sync_summary(&mut self, word_index: usize) {
        if self.words[word_index] == 0 {
            self.summary[word_index / 64] &= !(1 << (word_index % 64));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_find_lowest() {
        let mut bitmap = PageBitmap::new(300);
        assert_eq!(bitmap.find_free_block(None), None);

        bitmap.set_bit(200);
        bitmap.set_bit(70);
        assert_eq!(bitmap.count(), 2);
        assert_eq!(bitmap.find_free_block(None), Some(70));

        bitmap.clear_bit(70);
        assert_eq!(bitmap.find_free_block(None), Some(200));
    }

    #[test]
    fn test_set_is_idempotent() {
        let mut bitmap = PageBitmap::new(64);
        bitmap.set_bit(3);
        bitmap.set_bit(3);
        assert_eq!(bitmap.count(), 1);
        bitmap.clear_bit(3);
        bitmap.clear_bit(3);
        assert_eq!(bitmap.count(), 0);
    }

    #[test]
    fn test_clear_range_requires_all_set() {
        let mut bitmap = PageBitmap::new(128);
        for index in 16..31 {
            bitmap.set_bit(index);
        }
        assert!(!bitmap.clear_range(16, 16));
        bitmap.set_bit(31);
        assert!(bitmap.clear_range(16, 16));
        assert_eq!(bitmap.count(), 0);
        assert_eq!(bitmap.find_free_block(None), None);
    }

    #[test]
    fn test_clear_full_word() {
        let mut bitmap = PageBitmap::new(128);
        for index in 64..128 {
            bitmap.set_bit(index);
        }
        assert!(bitmap.clear_range(64, 64));
        assert_eq!(bitmap.count(), 0);
    }

    #[test]
    fn test_random_find_returns_free_block() {
        let mut bitmap = PageBitmap::new(64 * 64 * 3);
        let free = [5usize, 4097, 9000, 12287];
        for &index in &free {
            bitmap.set_bit(index);
        }

        let mut rng = RandomBitGenerator::new(0x1234);
        for _ in 0..64 {
            let found = bitmap.find_free_block(Some(&mut rng)).unwrap();
            assert!(free.contains(&found));
        }
    }
}
