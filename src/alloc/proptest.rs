//! Property-Based Tests for the Buddy Arena
//!
//! # Test Properties
//!
//! 1. **Conservation**: live blocks never overlap and never exceed the arena
//! 2. **Partition**: the block list always tiles the arena with power-of-two blocks
//! 3. **Full Coalescence**: freeing everything leaves one free root block
//! 4. **Granularity**: every allocation gets the smallest sufficient block
//! 5. **Integrity**: bytes written to one allocation survive unrelated traffic

#![cfg(test)]

use proptest::prelude::*;

use super::arena::{Arena, BlockHandle};

// =============================================================================
// Property Strategies
// =============================================================================

#[derive(Debug, Clone)]
enum Op {
    Alloc(usize),
    /// Free the live allocation at `index % live.len()`
    Free(usize),
}

fn op_strategy(max_bytes: usize) -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (1..=max_bytes).prop_map(Op::Alloc),
        2 => any::<usize>().prop_map(Op::Free),
    ]
}

/// Check the structural invariants of the block list
fn assert_partition(arena: &Arena) -> Result<(), TestCaseError> {
    let mut expected_start = 0u32;
    let mut used_units = 0u32;

    for block in arena.blocks() {
        prop_assert!(block.size.is_power_of_two(), "block {} not a power of two", block);
        prop_assert_eq!(block.start, expected_start, "gap or overlap at {}", block);
        prop_assert_eq!(block.start % block.size, 0, "block {} misaligned", block);
        if block.used {
            used_units += block.size;
        }
        expected_start = block.end();
    }

    prop_assert_eq!(expected_start, arena.total_units());
    prop_assert_eq!(used_units, arena.used_units());
    Ok(())
}

/// No two adjacent free buddies may survive a free
fn assert_coalesced(arena: &Arena) -> Result<(), TestCaseError> {
    for pair in arena.blocks().windows(2) {
        let (a, b) = (pair[0], pair[1]);
        let buddies = a.size == b.size && a.start % (a.size * 2) == 0;
        prop_assert!(
            !(buddies && !a.used && !b.used),
            "uncoalesced buddies {} {}",
            a,
            b
        );
    }
    Ok(())
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: arbitrary alloc/free interleavings keep the arena consistent
    /// and allocated bytes intact.
    #[test]
    fn prop_interleaved_alloc_free(
        order in 4u32..=10,
        ops in prop::collection::vec(op_strategy(2048), 1..200),
    ) {
        let mut arena = Arena::with_block_size(order, 16);
        let mut live: Vec<(BlockHandle, u8)> = Vec::new();
        let mut tag: u8 = 0;

        for op in ops {
            match op {
                Op::Alloc(bytes) => {
                    if let Some((handle, buf)) = arena.alloc(bytes) {
                        tag = tag.wrapping_add(1);
                        prop_assert_eq!(buf.len(), bytes);
                        buf.fill(tag);

                        let units = bytes.div_ceil(16) as u32;
                        prop_assert_eq!(handle.units(), units.next_power_of_two());
                        live.push((handle, tag));
                    }
                }
                Op::Free(index) => {
                    if !live.is_empty() {
                        let (handle, _) = live.swap_remove(index % live.len());
                        arena.free(handle);
                        assert_coalesced(&arena)?;
                    }
                }
            }
            assert_partition(&arena)?;
        }

        for (handle, tag) in &live {
            prop_assert!(arena.get(handle).iter().all(|b| b == tag));
        }

        for (handle, _) in live {
            arena.free(handle);
        }

        prop_assert_eq!(arena.blocks().len(), 1);
        prop_assert!(!arena.blocks()[0].used);
        prop_assert_eq!(arena.blocks()[0].size, arena.total_units());
    }

    /// Property: allocation only fails when no free block is large enough.
    #[test]
    fn prop_alloc_fails_only_without_fit(
        sizes in prop::collection::vec(1usize..=64, 1..100),
    ) {
        let mut arena = Arena::with_block_size(6, 1);
        let mut live = Vec::new();

        for bytes in sizes {
            let need = (bytes as u32).next_power_of_two();
            let fits = arena.blocks().iter().any(|b| !b.used && b.size >= need);
            match arena.alloc(bytes) {
                Some((handle, _)) => {
                    prop_assert!(fits);
                    live.push(handle);
                }
                None => prop_assert!(!fits),
            }
        }

        let live_units: u32 = live.iter().map(|h| h.units()).sum();
        prop_assert!(live_units <= arena.total_units());
    }
}
