//! Session-scoped memoisation of suggestion results.
//!
//! Entries are keyed by channel and normalised input text, so `"Toothache"` and
//! `"  toothache  "` share one entry. The cache is bounded: when full, the least recently
//! used entry is evicted.

use crate::suggest::{SuggestionChannel, SuggestionResult};
use moka::notification::RemovalCause;
use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use std::num::NonZeroUsize;
use std::sync::Arc;
use visit_types::NormalisedText;

/// Cache identity of one suggestion request.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    channel: SuggestionChannel,
    text: NormalisedText,
}

impl CacheKey {
    pub fn new(channel: SuggestionChannel, text: NormalisedText) -> Self {
        Self { channel, text }
    }

    pub fn channel(&self) -> &SuggestionChannel {
        &self.channel
    }

    pub fn text(&self) -> &NormalisedText {
        &self.text
    }
}

/// Bounded LRU map from [`CacheKey`] to [`SuggestionResult`].
///
/// Cloning yields another handle to the same entries.
#[derive(Clone)]
pub struct SuggestionCache {
    capacity: NonZeroUsize,
    entries: Cache<CacheKey, SuggestionResult>,
}

impl SuggestionCache {
    pub fn new(capacity: NonZeroUsize) -> Self {
        let entries = Cache::builder()
            .max_capacity(capacity.get() as u64)
            .eviction_policy(EvictionPolicy::lru())
            .eviction_listener(|key: Arc<CacheKey>, _, cause: RemovalCause| {
                if cause.was_evicted() {
                    tracing::debug!(channel = %key.channel, "evicted suggestion cache entry");
                }
            })
            .build();
        Self { capacity, entries }
    }

    /// Look up a result, marking it most recently used.
    pub fn get(&self, key: &CacheKey) -> Option<SuggestionResult> {
        self.entries.get(key)
    }

    /// Store a result. Once the cache is over capacity the least recently used entry is
    /// evicted.
    pub fn put(&self, key: CacheKey, value: SuggestionResult) {
        self.entries.insert(key, value);
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of entries after pending evictions have been applied.
    pub fn len(&self) -> usize {
        self.entries.run_pending_tasks();
        self.entries.entry_count() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> NonZeroUsize {
        self.capacity
    }
}

impl std::fmt::Debug for SuggestionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuggestionCache")
            .field("capacity", &self.capacity)
            .field("entries", &self.entries.entry_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(channel: SuggestionChannel, text: &str) -> CacheKey {
        CacheKey::new(channel, NormalisedText::new(text).unwrap())
    }

    fn result(code: &str) -> SuggestionResult {
        SuggestionResult::default().with_field("icdCode", json!(code))
    }

    fn cache(capacity: usize) -> SuggestionCache {
        SuggestionCache::new(NonZeroUsize::new(capacity).unwrap())
    }

    #[test]
    fn case_and_whitespace_variants_share_an_entry() {
        let cache = cache(8);
        cache.put(
            key(SuggestionChannel::CodedSuggestion, "Toothache"),
            result("K08.8"),
        );

        let hit = cache.get(&key(SuggestionChannel::CodedSuggestion, "  toothache  "));
        assert_eq!(hit, Some(result("K08.8")));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn channels_do_not_share_entries() {
        let cache = cache(8);
        cache.put(
            key(SuggestionChannel::CodedSuggestion, "toothache"),
            result("K08.8"),
        );
        assert!(cache
            .get(&key(SuggestionChannel::ClinicalAnalysis, "toothache"))
            .is_none());
    }

    #[test]
    fn evicts_least_recently_used_when_full() {
        let cache = cache(2);
        let a = key(SuggestionChannel::CodedSuggestion, "a");
        let b = key(SuggestionChannel::CodedSuggestion, "b");
        let c = key(SuggestionChannel::CodedSuggestion, "c");

        cache.put(a.clone(), result("A"));
        cache.put(b.clone(), result("B"));
        assert_eq!(cache.len(), 2);
        // touch a so b becomes the oldest
        assert!(cache.get(&a).is_some());
        assert_eq!(cache.len(), 2);
        cache.put(c.clone(), result("C"));

        assert_eq!(cache.len(), 2);
        assert!(cache.contains(&a));
        assert!(!cache.contains(&b));
        assert!(cache.contains(&c));
    }

    #[test]
    fn overwriting_existing_key_does_not_evict() {
        let cache = cache(2);
        let a = key(SuggestionChannel::CodedSuggestion, "a");
        let b = key(SuggestionChannel::CodedSuggestion, "b");

        cache.put(a.clone(), result("A"));
        cache.put(b.clone(), result("B"));
        cache.put(a.clone(), result("A2"));

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&a), Some(result("A2")));
        assert!(cache.contains(&b));
    }
}
