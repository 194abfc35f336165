//! Direct-mapped cache of synthesized call stacks
//!
//! Synthesizing the stack of a deeply nested activity recurses through all of
//! its creators, and the same (activity, raw stack) pairs come up over and
//! over again as samples accumulate. This cache remembers recent results.
//! Losing an entry only costs a recomputation.

use crate::{activity::ActivityIndex, trace::RawStackIndex};
use asylum::CallStackIndex;

/// Query whose result is cached
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub struct CacheKey {
    /// Activity whose stack was synthesized
    pub activity: ActivityIndex,

    /// Raw stack that was synthesized on top of it
    pub raw_stack: Option<RawStackIndex>,
}
//
impl CacheKey {
    /// Slot that this key maps into, for a cache of 2^`size_log2` slots
    fn slot(&self, size_log2: u8) -> usize {
        let raw = self.raw_stack.map_or(u32::MAX, |stack| stack.index() as u32);
        let mixed = (self.activity.index() as u64)
            .wrapping_mul(0x9E37_79B9_7F4A_7C15)
            .rotate_left(17)
            ^ u64::from(raw).wrapping_mul(0xC2B2_AE3D_27D4_EB4F);
        (mixed >> (64 - u32::from(size_log2))) as usize
    }
}

/// Cache slot
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
struct CacheEntry {
    /// Query
    key: CacheKey,

    /// Result
    stack: CallStackIndex,

    /// Number of evictions this entry will resist
    age: u8,
}

/// Fixed-size direct-mapped cache with aging-based eviction
///
/// Most entries are evicted by the next colliding insertion, but every 4th
/// insertion is protected against 10 collisions, and every 64th one against
/// 50 collisions, so that a few hot entries outlive bursts of one-off queries.
#[derive(Clone, Debug, PartialEq)]
pub struct StackCache {
    /// Slots, 2^size_log2 of them
    slots: Box<[Option<CacheEntry>]>,

    /// Base-2 logarithm of the number of slots
    size_log2: u8,

    /// Number of insertions so far
    num_inserts: u64,
}
//
impl StackCache {
    /// Smallest supported cache size
    pub const MIN_SIZE_LOG2: u8 = 4;

    /// Largest supported cache size
    pub const MAX_SIZE_LOG2: u8 = 24;

    /// Set up a cache with 2^`size_log2` slots (clamped to a sane range)
    pub fn new(size_log2: u8) -> Self {
        let size_log2 = size_log2.clamp(Self::MIN_SIZE_LOG2, Self::MAX_SIZE_LOG2);
        Self {
            slots: vec![None; 1 << size_log2].into_boxed_slice(),
            size_log2,
            num_inserts: 0,
        }
    }

    /// Number of slots
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Look up a previous result
    pub fn get(&self, key: CacheKey) -> Option<CallStackIndex> {
        self.slots[key.slot(self.size_log2)]
            .filter(|entry| entry.key == key)
            .map(|entry| entry.stack)
    }

    /// Record a result, unless the target slot holds a protected entry
    pub fn insert(&mut self, key: CacheKey, stack: CallStackIndex) {
        let slot = &mut self.slots[key.slot(self.size_log2)];
        if let Some(entry) = slot {
            if entry.key != key && entry.age > 0 {
                entry.age -= 1;
                return;
            }
        }
        self.num_inserts += 1;
        let age = if self.num_inserts % 64 == 0 {
            50
        } else if self.num_inserts % 4 == 0 {
            10
        } else {
            0
        };
        *slot = Some(CacheEntry { key, stack, age });
    }

    /// Forget everything
    pub fn clear(&mut self) {
        self.slots.fill(None);
    }
}
//
impl Default for StackCache {
    fn default() -> Self {
        Self::new(10)
    }
}
