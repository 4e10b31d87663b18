//! Buddy Arena
//!
//! A single fixed-size byte arena carved into power-of-two blocks.
//!
//! # Design
//!
//! - The arena is `2^order` units of `block_size` bytes, allocated once
//! - `blocks` is kept sorted by start unit and always partitions the arena
//! - Each block records its split ancestry as a base-3 path (1 = left, 2 = right)
//!   so `free` knows which neighbour is its buddy
//! - The [`Bitmap`] mirrors used units so `alloc` can jump straight to free space
//!
//! The arena is not synchronized. Wrap it in a lock if more than one caller
//! can reach it.
//!
//! # Example
//!
//! ```
//! use tiercache::alloc::Arena;
//!
//! let mut arena = Arena::new(4); // 16 units of 256 bytes
//! let (handle, buf) = arena.alloc(300).unwrap();
//! buf.copy_from_slice(&[7u8; 300]);
//! assert_eq!(handle.units(), 2);
//! arena.free(handle);
//! assert_eq!(arena.blocks().len(), 1);
//! ```

use uuid::Uuid;

use super::bitmap::Bitmap;
use super::DEFAULT_BLOCK_SIZE;

const SIDE_LEFT: u64 = 1;
const SIDE_RIGHT: u64 = 2;

/// Deepest path the ternary encoding can hold without overflow
const MAX_PATH: u64 = 1 << 60;

// =============================================================================
// Block Path
// =============================================================================

/// Ternary-encoded left/right ancestry of a block. The root is `0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockPath(u64);

impl BlockPath {
    fn push(self, side: u64) -> Self {
        assert!(self.0 <= MAX_PATH, "block path too deep");
        BlockPath(self.0 * 3 + side)
    }

    fn last(self) -> u64 {
        self.0 % 3
    }

    fn pop(self) -> Self {
        BlockPath(self.0 / 3)
    }

    /// Split depth of the block (0 for the root)
    pub fn depth(self) -> u32 {
        let mut v = self.0;
        let mut depth = 0;
        while v > 0 {
            v /= 3;
            depth += 1;
        }
        depth
    }
}

// =============================================================================
// Block
// =============================================================================

/// Block descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    /// Whether the block is handed out
    pub used: bool,
    /// Size in units, always a power of two
    pub size: u32,
    /// First unit of the block
    pub start: u32,
    /// Split ancestry
    pub path: BlockPath,
}

impl Block {
    /// One past the last unit
    pub fn end(&self) -> u32 {
        self.start + self.size
    }
}

impl std::fmt::Display for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}-{}{}]", self.start, self.end(), if self.used { "*" } else { "" })
    }
}

// =============================================================================
// Block Handle
// =============================================================================

/// Token proving ownership of an allocated block.
///
/// Returned by [`Arena::alloc`] and consumed by [`Arena::free`]. It is not
/// `Clone`, so a block cannot be freed twice through the same handle.
#[derive(Debug, PartialEq, Eq)]
pub struct BlockHandle {
    arena: Uuid,
    start: u32,
    units: u32,
    len: usize,
}

impl BlockHandle {
    /// Requested length in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// True for a zero-length request
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size of the backing block in units
    pub fn units(&self) -> u32 {
        self.units
    }

    /// First unit of the backing block
    pub fn start(&self) -> u32 {
        self.start
    }
}

// =============================================================================
// Arena
// =============================================================================

/// Buddy allocator over one fixed byte arena
pub struct Arena {
    id: Uuid,
    block_size: usize,
    blocks: Vec<Block>,
    bitmap: Bitmap,
    buf: Box<[u8]>,
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("id", &self.id)
            .field("block_size", &self.block_size)
            .field("total_units", &self.total_units())
            .field("used_units", &self.used_units())
            .field("blocks", &self.blocks.len())
            .finish()
    }
}

impl Arena {
    /// Create an arena of `2^order` units of the default block size
    pub fn new(order: u32) -> Self {
        Self::with_block_size(order, DEFAULT_BLOCK_SIZE)
    }

    /// Create an arena of `2^order` units of `block_size` bytes
    pub fn with_block_size(order: u32, block_size: usize) -> Self {
        assert!(order < 32, "arena order {} too large", order);
        assert!(block_size > 0, "block size must be positive");

        let units = 1u32 << order;
        Self {
            id: Uuid::new_v4(),
            block_size,
            blocks: vec![Block {
                used: false,
                size: units,
                start: 0,
                path: BlockPath::default(),
            }],
            bitmap: Bitmap::new(units as usize),
            buf: vec![0u8; units as usize * block_size].into_boxed_slice(),
        }
    }

    /// Unit size in bytes
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Total units in the arena
    pub fn total_units(&self) -> u32 {
        self.bitmap.len() as u32
    }

    /// Arena size in bytes
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Units currently handed out
    pub fn used_units(&self) -> u32 {
        self.bitmap.count_set() as u32
    }

    /// Units currently free
    pub fn free_units(&self) -> u32 {
        self.total_units() - self.used_units()
    }

    /// Current block list, ordered by start unit
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Allocate `bytes` bytes.
    ///
    /// Returns the handle and the region truncated to exactly `bytes`, or
    /// `None` when no free block is large enough. Zero-byte requests still
    /// occupy one unit.
    pub fn alloc(&mut self, bytes: usize) -> Option<(BlockHandle, &mut [u8])> {
        let units = bytes.div_ceil(self.block_size).max(1);
        if units > self.total_units() as usize {
            return None;
        }
        let units = units as u32;

        let mut unit = self.bitmap.first_unset(0)?;
        let mut i = self.block_index_at(unit as u32);

        loop {
            let block = self.blocks[i];

            if block.used || block.size < units {
                unit = self.bitmap.first_unset(block.end() as usize)?;
                i = self.block_index_at(unit as u32);
                continue;
            }

            if block.size == units || block.size / 2 < units {
                self.blocks[i].used = true;
                self.bitmap.set(block.start as usize, block.end() as usize);

                let handle = BlockHandle {
                    arena: self.id,
                    start: block.start,
                    units: block.size,
                    len: bytes,
                };
                let offset = block.start as usize * self.block_size;
                return Some((handle, &mut self.buf[offset..offset + bytes]));
            }

            self.split_at(i);
        }
    }

    /// Return a block to the arena and coalesce it with free buddies.
    ///
    /// # Panics
    ///
    /// Panics if the handle was issued by another arena or does not match a
    /// used block. Either means the caller has corrupted its bookkeeping.
    pub fn free(&mut self, handle: BlockHandle) {
        if handle.arena != self.id {
            panic!(
                "not my buffer: handle from arena {} freed into arena {}",
                handle.arena, self.id
            );
        }

        let i = match self.blocks.binary_search_by_key(&handle.start, |b| b.start) {
            Ok(i) => i,
            Err(_) => panic!("not my buffer: no block starts at unit {}", handle.start),
        };

        let block = self.blocks[i];
        if !block.used || block.size != handle.units {
            panic!(
                "arena invariant violated: handle {}+{} does not match block {}",
                handle.start, handle.units, block
            );
        }

        self.bitmap.set(block.start as usize, block.end() as usize);
        self.blocks[i].used = false;
        self.merge_at(i);
    }

    /// Read access to an allocated region
    pub fn get(&self, handle: &BlockHandle) -> &[u8] {
        self.check_owner(handle);
        let offset = handle.start as usize * self.block_size;
        &self.buf[offset..offset + handle.len]
    }

    /// Write access to an allocated region
    pub fn get_mut(&mut self, handle: &BlockHandle) -> &mut [u8] {
        self.check_owner(handle);
        let offset = handle.start as usize * self.block_size;
        &mut self.buf[offset..offset + handle.len]
    }

    fn check_owner(&self, handle: &BlockHandle) {
        assert!(handle.arena == self.id, "not my buffer: foreign handle");
    }

    /// Index of the block containing `unit`
    fn block_index_at(&self, unit: u32) -> usize {
        self.blocks.partition_point(|b| b.start <= unit) - 1
    }

    fn split_at(&mut self, i: usize) {
        let parent = self.blocks[i];
        assert!(parent.size > 1, "cannot split a single-unit block");

        let half = parent.size / 2;
        self.blocks[i] = Block {
            used: false,
            size: half,
            start: parent.start,
            path: parent.path.push(SIDE_LEFT),
        };
        self.blocks.insert(
            i + 1,
            Block {
                used: false,
                size: half,
                start: parent.start + half,
                path: parent.path.push(SIDE_RIGHT),
            },
        );
    }

    fn merge_at(&mut self, mut i: usize) {
        loop {
            let block = self.blocks[i];
            match block.path.last() {
                SIDE_LEFT => {
                    let buddy = self
                        .blocks
                        .get(i + 1)
                        .copied()
                        .unwrap_or_else(|| panic!("left block {} has no right neighbour", block));
                    if buddy.used || buddy.size != block.size {
                        return;
                    }
                    self.blocks.remove(i + 1);
                }
                SIDE_RIGHT => {
                    assert!(i > 0, "right block {} has no left neighbour", block);
                    let buddy = self.blocks[i - 1];
                    if buddy.used || buddy.size != block.size {
                        return;
                    }
                    self.blocks.remove(i);
                    i -= 1;
                }
                _ => return,
            }

            let merged = &mut self.blocks[i];
            merged.size *= 2;
            merged.path = merged.path.pop();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_arena_single_root() {
        let arena = Arena::new(4);
        assert_eq!(arena.total_units(), 16);
        assert_eq!(arena.capacity(), 16 * DEFAULT_BLOCK_SIZE);
        assert_eq!(arena.blocks().len(), 1);
        assert_eq!(arena.free_units(), 16);
    }

    #[test]
    fn test_alloc_exact_length() {
        let mut arena = Arena::with_block_size(4, 16);
        let (handle, buf) = arena.alloc(20).unwrap();
        assert_eq!(buf.len(), 20);
        assert_eq!(handle.len(), 20);
        assert_eq!(handle.units(), 2);
        assert_eq!(arena.used_units(), 2);
    }

    #[test]
    fn test_alloc_rounds_to_power_of_two() {
        let mut arena = Arena::with_block_size(5, 1);
        let (handle, _) = arena.alloc(3).unwrap();
        assert_eq!(handle.units(), 4);
        let (handle, _) = arena.alloc(5).unwrap();
        assert_eq!(handle.units(), 8);
        let (handle, _) = arena.alloc(1).unwrap();
        assert_eq!(handle.units(), 1);
    }

    #[test]
    fn test_split_records_sides() {
        let mut arena = Arena::with_block_size(2, 1);
        let (_h, _) = arena.alloc(1).unwrap();
        let blocks = arena.blocks();
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].size, 1);
        assert_eq!(blocks[0].path.depth(), 2);
        assert_eq!(blocks[1].size, 1);
        assert_eq!(blocks[2].size, 2);
        assert_eq!(blocks[2].path.depth(), 1);
    }

    #[test]
    fn test_zero_byte_alloc_takes_one_unit() {
        let mut arena = Arena::with_block_size(2, 8);
        let (handle, buf) = arena.alloc(0).unwrap();
        assert!(buf.is_empty());
        assert!(handle.is_empty());
        assert_eq!(arena.used_units(), 1);
        arena.free(handle);
        assert_eq!(arena.used_units(), 0);
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let mut arena = Arena::with_block_size(3, 1);
        let (_a, _) = arena.alloc(4).unwrap();
        let (_b, _) = arena.alloc(2).unwrap();
        let (_c, _) = arena.alloc(2).unwrap();
        assert!(arena.alloc(1).is_none());
        assert_eq!(arena.free_units(), 0);
    }

    #[test]
    fn test_too_large_returns_none() {
        let mut arena = Arena::with_block_size(3, 1);
        assert!(arena.alloc(9).is_none());
        assert_eq!(arena.blocks().len(), 1);
    }

    #[test]
    fn test_fragmented_arena_refuses_large_request() {
        let mut arena = Arena::with_block_size(3, 1);
        let (a, _) = arena.alloc(2).unwrap();
        let (_b, _) = arena.alloc(2).unwrap();
        let (c, _) = arena.alloc(2).unwrap();
        let (_d, _) = arena.alloc(2).unwrap();
        arena.free(a);
        arena.free(c);
        // 4 free units, but no free block of 4
        assert_eq!(arena.free_units(), 4);
        assert!(arena.alloc(4).is_none());
        assert!(arena.alloc(2).is_some());
    }

    #[test]
    fn test_free_coalesces_to_root() {
        let mut arena = Arena::with_block_size(4, 1);
        let handles: Vec<_> = (0..16).map(|_| arena.alloc(1).unwrap().0).collect();
        assert_eq!(arena.blocks().len(), 16);

        // Free in an interleaved order
        let (even, odd): (Vec<_>, Vec<_>) = handles
            .into_iter()
            .enumerate()
            .partition(|(i, _)| i % 2 == 0);
        for (_, h) in odd.into_iter().rev() {
            arena.free(h);
        }
        for (_, h) in even {
            arena.free(h);
        }

        assert_eq!(arena.blocks().len(), 1);
        assert_eq!(arena.blocks()[0].size, 16);
        assert!(!arena.blocks()[0].used);
        assert_eq!(arena.free_units(), 16);
    }

    #[test]
    fn test_data_isolated_between_blocks() {
        let mut arena = Arena::with_block_size(4, 8);
        let (a, buf) = arena.alloc(8).unwrap();
        buf.fill(0xAA);
        let (b, buf) = arena.alloc(16).unwrap();
        buf.fill(0xBB);

        assert!(arena.get(&a).iter().all(|&x| x == 0xAA));
        assert!(arena.get(&b).iter().all(|&x| x == 0xBB));

        arena.get_mut(&a)[0] = 1;
        assert_eq!(arena.get(&a)[0], 1);
        assert!(arena.get(&b).iter().all(|&x| x == 0xBB));
    }

    #[test]
    fn test_reuse_after_free() {
        let mut arena = Arena::with_block_size(2, 1);
        let (a, _) = arena.alloc(4).unwrap();
        assert!(arena.alloc(1).is_none());
        arena.free(a);
        assert!(arena.alloc(4).is_some());
    }

    #[test]
    #[should_panic(expected = "not my buffer")]
    fn test_free_foreign_handle_panics() {
        let mut a = Arena::new(2);
        let mut b = Arena::new(2);
        let (handle, _) = a.alloc(10).unwrap();
        b.free(handle);
    }

    #[test]
    #[should_panic(expected = "not my buffer")]
    fn test_get_foreign_handle_panics() {
        let mut a = Arena::new(2);
        let b = Arena::new(2);
        let (handle, _) = a.alloc(10).unwrap();
        let _ = b.get(&handle);
    }

    #[test]
    fn test_display_block() {
        let arena = Arena::new(3);
        assert_eq!(arena.blocks()[0].to_string(), "[0-8]");
    }
}
