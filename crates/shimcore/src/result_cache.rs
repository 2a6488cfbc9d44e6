//! Per-thread result cache (spec.md §4.5).
//!
//! Thread-local, so lookups and inserts need no lock; the one piece of real concurrency is
//! that a cached result's refcount is atomic, because a step call can hand a borrowed pointer
//! to the same entry to code running later on the same thread (a nested call, a callback) and
//! eviction must not free an entry still in use.

use crate::config::{RESULT_CACHE_BYTE_CAP, RESULT_CACHE_ROW_CAP, RESULT_CACHE_SIZE, RESULT_CACHE_TTL_MS};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One column's worth of metadata carried alongside a cached result (spec.md §3 "Cached
/// result": "column types and names").
#[derive(Debug, Clone)]
pub struct ColumnMeta {
    pub name: String,
    /// Postgres type OID, as returned by the remote driver.
    pub type_oid: u32,
}

/// A materialized snapshot of a result set (spec.md §3 "Cached result").
pub struct CachedResult {
    pub columns: Vec<ColumnMeta>,
    /// Row-major cell storage; `None` marks SQL NULL.
    pub rows: Vec<Vec<Option<Vec<u8>>>>,
    pub created_at: Instant,
    pub hit_count: u32,
    refcount: Arc<AtomicU32>,
}

impl CachedResult {
    pub fn new(columns: Vec<ColumnMeta>, rows: Vec<Vec<Option<Vec<u8>>>>) -> Self {
        CachedResult {
            columns,
            rows,
            created_at: Instant::now(),
            hit_count: 0,
            refcount: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn byte_size(&self) -> usize {
        self.rows
            .iter()
            .flat_map(|row| row.iter())
            .map(|cell| cell.as_ref().map(|v| v.len()).unwrap_or(0))
            .sum()
    }

    /// A live handle a statement can hold onto; dropping it releases the refcount.
    pub fn pin(&self) -> ResultHandle {
        self.refcount.fetch_add(1, Ordering::AcqRel);
        ResultHandle {
            refcount: self.refcount.clone(),
        }
    }

    fn is_in_use(&self) -> bool {
        self.refcount.load(Ordering::Acquire) > 0
    }
}

/// RAII pin on a cached result; releases the refcount on drop.
pub struct ResultHandle {
    refcount: Arc<AtomicU32>,
}

impl Drop for ResultHandle {
    fn drop(&mut self) {
        self.refcount.fetch_sub(1, Ordering::AcqRel);
    }
}

struct Entry {
    fingerprint: u64,
    result: CachedResult,
}

pub struct ResultCache {
    slots: Vec<Option<Entry>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    RefusedTooManyRows,
    RefusedTooManyBytes,
    RefusedEmpty,
    SlotBusySkipped,
}

impl ResultCache {
    pub fn new() -> Self {
        ResultCache {
            slots: (0..RESULT_CACHE_SIZE).map(|_| None).collect(),
        }
    }

    fn mask(&self) -> usize {
        RESULT_CACHE_SIZE - 1
    }

    pub fn get(&self, fingerprint: u64) -> Option<&CachedResult> {
        let idx = (fingerprint as usize) & self.mask();
        match &self.slots[idx] {
            Some(entry) if entry.fingerprint == fingerprint => {
                if entry.result.created_at.elapsed() > Duration::from_millis(RESULT_CACHE_TTL_MS) {
                    None
                } else {
                    Some(&entry.result)
                }
            }
            _ => None,
        }
    }

    pub fn record_hit(&mut self, fingerprint: u64) {
        let idx = (fingerprint as usize) & self.mask();
        if let Some(entry) = &mut self.slots[idx] {
            if entry.fingerprint == fingerprint {
                entry.result.hit_count += 1;
            }
        }
    }

    /// Drop the cached entry for `fingerprint`, if one is still there under that exact key
    /// (a slot can have been overwritten by a colliding fingerprint since).
    pub fn remove(&mut self, fingerprint: u64) {
        let idx = (fingerprint as usize) & self.mask();
        if matches!(&self.slots[idx], Some(entry) if entry.fingerprint == fingerprint) {
            self.slots[idx] = None;
        }
    }

    pub fn insert(&mut self, fingerprint: u64, result: CachedResult) -> InsertOutcome {
        if result.rows.is_empty() {
            return InsertOutcome::RefusedEmpty;
        }
        if result.rows.len() > RESULT_CACHE_ROW_CAP {
            return InsertOutcome::RefusedTooManyRows;
        }
        if result.byte_size() > RESULT_CACHE_BYTE_CAP {
            return InsertOutcome::RefusedTooManyBytes;
        }

        let idx = (fingerprint as usize) & self.mask();
        if let Some(entry) = &self.slots[idx] {
            if entry.fingerprint != fingerprint && entry.result.is_in_use() {
                return InsertOutcome::SlotBusySkipped;
            }
        }
        self.slots[idx] = Some(Entry { fingerprint, result });
        InsertOutcome::Inserted
    }
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new()
    }
}

thread_local! {
    pub static RESULT_CACHE: std::cell::RefCell<ResultCache> = std::cell::RefCell::new(ResultCache::new());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(rows: usize) -> CachedResult {
        CachedResult::new(
            vec![ColumnMeta {
                name: "id".to_string(),
                type_oid: 23,
            }],
            (0..rows).map(|i| vec![Some(i.to_be_bytes().to_vec())]).collect(),
        )
    }

    #[test]
    fn empty_results_are_refused() {
        let mut cache = ResultCache::new();
        assert_eq!(cache.insert(1, sample(0)), InsertOutcome::RefusedEmpty);
    }

    #[test]
    fn oversized_row_count_is_refused() {
        let mut cache = ResultCache::new();
        assert_eq!(
            cache.insert(1, sample(RESULT_CACHE_ROW_CAP + 1)),
            InsertOutcome::RefusedTooManyRows
        );
    }

    #[test]
    fn insert_then_get_round_trips() {
        let mut cache = ResultCache::new();
        assert_eq!(cache.insert(42, sample(3)), InsertOutcome::Inserted);
        let hit = cache.get(42).unwrap();
        assert_eq!(hit.rows.len(), 3);
    }

    #[test]
    fn busy_slot_is_not_evicted() {
        let mut cache = ResultCache::new();
        cache.insert(5, sample(1));
        let pin = cache.get(5).unwrap().pin();
        // Same fingerprint still replaces (it's a refresh, not a collision); a different
        // fingerprint hashing into the same slot is what must be refused.
        let colliding_fp = 5 + RESULT_CACHE_SIZE as u64;
        let outcome = cache.insert(colliding_fp, sample(1));
        assert_eq!(outcome, InsertOutcome::SlotBusySkipped);
        drop(pin);
    }
}
