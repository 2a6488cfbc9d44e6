//! Per-thread translation cache (spec.md §3 "Translation-cache entry", §4.1 closing
//! paragraph: "a thread-local cache keyed by a fingerprint of the source SQL avoids re-
//! running the pipeline for statements a connection prepares repeatedly").
//!
//! Fixed-size, open-addressed with linear probing, no synchronization needed since each
//! thread owns its instance outright — the same one-cache-per-thread shape as the result
//! cache (`result_cache.rs`) and the recent-statement cache (`registries.rs`).

use crate::config::{TRANSLATION_CACHE_PROBE_LIMIT, TRANSLATION_CACHE_SIZE};
use crate::helpers::fnv1a;
use crate::translator::Translation;

struct Slot {
    fingerprint: u64,
    source: String,
    translation: Translation,
    last_probe: u64,
}

pub struct TranslationCache {
    slots: Vec<Option<Slot>>,
    clock: u64,
}

impl TranslationCache {
    pub fn new() -> Self {
        assert!(TRANSLATION_CACHE_SIZE.is_power_of_two());
        TranslationCache {
            slots: (0..TRANSLATION_CACHE_SIZE).map(|_| None).collect(),
            clock: 0,
        }
    }

    fn mask(&self) -> usize {
        TRANSLATION_CACHE_SIZE - 1
    }

    /// Look up a cached translation for `source`, verifying the exact string to rule out an
    /// FNV-1a collision.
    pub fn get(&mut self, source: &str) -> Option<Translation> {
        let fp = fnv1a(source.as_bytes());
        let mut idx = (fp as usize) & self.mask();
        for _ in 0..TRANSLATION_CACHE_PROBE_LIMIT {
            match &mut self.slots[idx] {
                Some(slot) if slot.fingerprint == fp && slot.source == source => {
                    self.clock += 1;
                    slot.last_probe = self.clock;
                    return Some(slot.translation.clone());
                }
                Some(_) => {
                    idx = (idx + 1) & self.mask();
                }
                None => return None,
            }
        }
        None
    }

    /// Insert a translation, evicting the least-recently-probed entry within the probe
    /// sequence if every slot in it is occupied.
    pub fn put(&mut self, source: &str, translation: Translation) {
        let fp = fnv1a(source.as_bytes());
        let mut idx = (fp as usize) & self.mask();
        self.clock += 1;
        let now = self.clock;

        let mut lru_idx = idx;
        let mut lru_probe = u64::MAX;
        for _ in 0..TRANSLATION_CACHE_PROBE_LIMIT {
            match &self.slots[idx] {
                None => {
                    self.slots[idx] = Some(Slot {
                        fingerprint: fp,
                        source: source.to_string(),
                        translation,
                        last_probe: now,
                    });
                    return;
                }
                Some(slot) if slot.fingerprint == fp && slot.source == source => {
                    self.slots[idx] = Some(Slot {
                        fingerprint: fp,
                        source: source.to_string(),
                        translation,
                        last_probe: now,
                    });
                    return;
                }
                Some(slot) => {
                    if slot.last_probe < lru_probe {
                        lru_probe = slot.last_probe;
                        lru_idx = idx;
                    }
                    idx = (idx + 1) & self.mask();
                }
            }
        }
        self.slots[lru_idx] = Some(Slot {
            fingerprint: fp,
            source: source.to_string(),
            translation,
            last_probe: now,
        });
    }
}

impl Default for TranslationCache {
    fn default() -> Self {
        Self::new()
    }
}

thread_local! {
    static CACHE: std::cell::RefCell<TranslationCache> = std::cell::RefCell::new(TranslationCache::new());
}

/// Translate `source` under `ctx`, consulting and populating this thread's cache.
///
/// `ctx` is not part of the cache key: `redirected_write` only affects pass 8's RETURNING
/// injection, and a prepared statement's redirect status is fixed for the connection's
/// lifetime, so within one thread the same source SQL is never translated under two
/// different contexts in practice. Keying on source alone keeps the cache simple; if that
/// invariant ever changes this needs `ctx` folded into the fingerprint.
pub fn translate_cached(source: &str, ctx: super::PassContext) -> Translation {
    if let Some(hit) = CACHE.with(|c| c.borrow_mut().get(source)) {
        return hit;
    }
    let translation = super::translate(source, ctx);
    CACHE.with(|c| c.borrow_mut().put(source, translation.clone()));
    translation
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translator::PassContext;

    fn ctx() -> PassContext {
        PassContext { redirected_write: false }
    }

    #[test]
    fn put_then_get_round_trips() {
        let mut cache = TranslationCache::new();
        let t = super::super::translate("SELECT 1", ctx());
        cache.put("SELECT 1", t.clone());
        let hit = cache.get("SELECT 1").unwrap();
        assert_eq!(hit.translated_sql, t.translated_sql);
    }

    #[test]
    fn miss_on_unseen_source() {
        let mut cache = TranslationCache::new();
        assert!(cache.get("SELECT 2").is_none());
    }

    #[test]
    fn fingerprint_collision_falls_back_to_string_check() {
        let mut cache = TranslationCache::new();
        // Two distinct sources that happen to land in the same slot still need independent
        // entries; simulate by inserting many distinct sources and confirming each one that
        // survives eviction still returns its own translation.
        for i in 0..8 {
            let sql = format!("SELECT {}", i);
            let t = super::super::translate(&sql, ctx());
            cache.put(&sql, t);
        }
        for i in 0..8 {
            let sql = format!("SELECT {}", i);
            if let Some(hit) = cache.get(&sql) {
                assert!(hit.translated_sql.contains(&i.to_string()));
            }
        }
    }

    #[test]
    fn thread_local_helper_translates_and_caches() {
        let first = translate_cached("SELECT 1 FROM t", ctx());
        let second = translate_cached("SELECT 1 FROM t", ctx());
        assert_eq!(first.translated_sql, second.translated_sql);
    }
}
