//! Fake column-value token pool (spec.md §4.7, §3 "Fake column-value token").
//!
//! The host API contract says `column_value` returns an opaque pointer whose type is queried
//! later through separate accessor calls. When the row backing that pointer lives in our own
//! result cache rather than the embedded library's row buffer, there's no real embedded-side
//! pointer to hand back — so this pool mints fake ones: fixed-size, cyclic, recognized by a
//! magic word plus containment in the pool's address range rather than by a registry lookup
//! (a lookup would have to run on every `value_*` call, including the overwhelming majority
//! that target real embedded-library pointers).

use crate::config::FAKE_VALUE_POOL_SIZE;
use crate::types::HostHandle;

const MAGIC: u32 = 0x5348_494d; // "SHIM" as big-endian bytes, arbitrary but stable.

#[derive(Debug, Clone, Copy)]
struct Token {
    magic: u32,
    statement: HostHandle,
    column: usize,
    row: usize,
    /// Bumped every time this slot is reused, so a stale `FakeValueRef` minted before a
    /// wrap-around is rejected instead of silently reading the wrong row.
    generation: u32,
}

/// A reference to a slot in the pool, opaque to callers — the pointer-range/magic-word
/// recognition spec.md describes is modeled here as "does this ref come from this pool and is
/// its generation still current" rather than literal pointer arithmetic, since Rust code
/// holding an index has no reason to reconstruct a pointer just to compare ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FakeValueRef {
    index: usize,
    generation: u32,
}

/// High bit set on every encoded token, never set on a real heap pointer on any target this
/// shim runs on (userspace virtual address space sits well below 2^63 on every supported
/// platform) — this is the ABI layer's tagged-pointer stand-in for spec.md's "magic word plus
/// address-range containment" recognition scheme, chosen because Rust code here never
/// allocates the pool's backing storage at a fixed address it could safely compare against.
const FAKE_TOKEN_TAG: usize = 1 << 63;

impl FakeValueRef {
    /// Pack this ref into a tagged `usize` suitable for handing to a C caller as an opaque
    /// pointer-sized value.
    pub fn encode(self) -> usize {
        FAKE_TOKEN_TAG | ((self.index as usize) << 32) | (self.generation as usize)
    }

    /// Recover a ref from a tagged `usize`, or `None` if the tag bit isn't set (i.e. `bits` is
    /// a real pointer, not one of ours).
    pub fn decode(bits: usize) -> Option<Self> {
        if bits & FAKE_TOKEN_TAG == 0 {
            return None;
        }
        let index = (bits >> 32) & 0xFFFF_FFFF;
        let generation = (bits & 0xFFFF_FFFF) as u32;
        Some(FakeValueRef { index, generation })
    }
}

pub struct FakeValuePool {
    slots: Vec<Option<Token>>,
    cursor: usize,
}

impl FakeValuePool {
    pub fn new() -> Self {
        assert!(FAKE_VALUE_POOL_SIZE.is_power_of_two());
        FakeValuePool {
            slots: vec![None; FAKE_VALUE_POOL_SIZE],
            cursor: 0,
        }
    }

    fn mask(&self) -> usize {
        FAKE_VALUE_POOL_SIZE - 1
    }

    /// Mint a token for `(statement, column, row)`, advancing the cyclic cursor. Per spec.md
    /// §4.7, tokens have a bounded lifetime — at least `FAKE_VALUE_POOL_SIZE` allocations
    /// later, this slot is recycled out from under any ref still pointing at it.
    pub fn allocate(&mut self, statement: HostHandle, column: usize, row: usize) -> FakeValueRef {
        let idx = self.cursor;
        self.cursor = (self.cursor + 1) & self.mask();
        let generation = self.slots[idx].map(|t| t.generation.wrapping_add(1)).unwrap_or(0);
        self.slots[idx] = Some(Token {
            magic: MAGIC,
            statement,
            column,
            row,
            generation,
        });
        FakeValueRef { index: idx, generation }
    }

    /// Resolve a ref back to its `(statement, column, row)` triple, or `None` if the slot has
    /// since wrapped around to a newer generation (a genuinely stale ref) or never held a
    /// token matching the magic word (not one of ours).
    pub fn resolve(&self, value_ref: FakeValueRef) -> Option<(HostHandle, usize, usize)> {
        let token = self.slots.get(value_ref.index)?.as_ref()?;
        if token.magic != MAGIC || token.generation != value_ref.generation {
            return None;
        }
        Some((token.statement, token.column, token.row))
    }

    /// Drop every outstanding token for `statement` — called when a statement is reset or
    /// finalized so stale refs resolve to nothing rather than a recycled row that happens to
    /// belong to a different statement.
    pub fn invalidate_statement(&mut self, statement: HostHandle) {
        for slot in &mut self.slots {
            if matches!(slot, Some(t) if t.statement == statement) {
                *slot = None;
            }
        }
    }
}

impl Default for FakeValuePool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_then_resolve_round_trips() {
        let mut pool = FakeValuePool::new();
        let r = pool.allocate(HostHandle(1), 2, 3);
        let (stmt, col, row) = pool.resolve(r).unwrap();
        assert_eq!(stmt, HostHandle(1));
        assert_eq!(col, 2);
        assert_eq!(row, 3);
    }

    #[test]
    fn stale_ref_after_wraparound_is_rejected() {
        let mut pool = FakeValuePool::new();
        let first = pool.allocate(HostHandle(1), 0, 0);
        for i in 0..FAKE_VALUE_POOL_SIZE {
            pool.allocate(HostHandle(2), 0, i);
        }
        assert!(pool.resolve(first).is_none());
    }

    #[test]
    fn invalidate_statement_clears_its_tokens() {
        let mut pool = FakeValuePool::new();
        let r = pool.allocate(HostHandle(9), 0, 0);
        pool.invalidate_statement(HostHandle(9));
        assert!(pool.resolve(r).is_none());
    }

    #[test]
    fn encode_decode_round_trips_and_rejects_untagged_bits() {
        let mut pool = FakeValuePool::new();
        let r = pool.allocate(HostHandle(3), 1, 2);
        let bits = r.encode();
        assert_eq!(FakeValueRef::decode(bits), Some(r));
        assert_eq!(FakeValueRef::decode(0x1234), None);
    }

    #[test]
    fn unrelated_index_with_wrong_generation_is_not_confused_with_a_real_token() {
        let pool = FakeValuePool::new();
        let bogus = FakeValueRef { index: 0, generation: 999 };
        assert!(pool.resolve(bogus).is_none());
    }
}
