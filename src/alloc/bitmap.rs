//! Bitmap Free-Space Index
//!
//! One bit per arena unit. A set bit means the unit belongs to a used block.
//!
//! # Design
//!
//! - `u64` words; fully-set words are skipped whole when scanning
//! - `set` toggles, so the allocator calls it once on alloc and once on free
//!   for the same range

const WORD_BITS: usize = 64;

/// Fixed-length bit index
#[derive(Debug, Clone)]
pub struct Bitmap {
    words: Vec<u64>,
    len: usize,
}

impl Bitmap {
    /// Create a bitmap of `len` bits, all unset
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(WORD_BITS)],
            len,
        }
    }

    /// Number of bits
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if the bitmap holds no bits at all
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Test a single bit
    pub fn is_set(&self, index: usize) -> bool {
        assert!(index < self.len, "bit {} out of range {}", index, self.len);
        self.words[index / WORD_BITS] & (1 << (index % WORD_BITS)) != 0
    }

    /// Number of set bits
    pub fn count_set(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Toggle every bit in `[lo, hi)`.
    ///
    /// Whole words are flipped at once; only the partial words at either end
    /// are masked.
    pub fn set(&mut self, lo: usize, hi: usize) {
        assert!(lo <= hi && hi <= self.len, "range {}..{} out of {}", lo, hi, self.len);
        if lo == hi {
            return;
        }

        let first = lo / WORD_BITS;
        let last = (hi - 1) / WORD_BITS;

        for w in first..=last {
            let start = if w == first { lo % WORD_BITS } else { 0 };
            let end = if w == last { (hi - 1) % WORD_BITS + 1 } else { WORD_BITS };
            self.words[w] ^= mask(start, end);
        }
    }

    /// Lowest unset bit at or after `from`, or `None` if every bit in
    /// `[from, len)` is set.
    pub fn first_unset(&self, from: usize) -> Option<usize> {
        if from >= self.len {
            return None;
        }

        let mut w = from / WORD_BITS;
        // Pretend bits below `from` are set in the first word
        let mut word = self.words[w] | mask(0, from % WORD_BITS);

        loop {
            if word != u64::MAX {
                let index = w * WORD_BITS + (!word).trailing_zeros() as usize;
                return (index < self.len).then_some(index);
            }
            w += 1;
            if w >= self.words.len() {
                return None;
            }
            word = self.words[w];
        }
    }
}

/// Mask with bits `[start, end)` set, `0 <= start <= end <= 64`
#[inline]
fn mask(start: usize, end: usize) -> u64 {
    if start >= end {
        return 0;
    }
    let width = end - start;
    let ones = if width == WORD_BITS { u64::MAX } else { (1u64 << width) - 1 };
    ones << start
}

// =============================================================================
// Tests
// =============================================================================
