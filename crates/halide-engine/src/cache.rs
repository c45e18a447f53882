//! Bounded result cache keyed by [`Fingerprint`].
//!
//! Eviction is by insertion order, not access order: once an insert
//! pushes the cache past `max_entries`, the oldest-inserted entries go
//! first until `clean_threshold` remain. Evicted assets are handed back
//! to the caller, which owns releasing them.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use halide_pipeline::Fingerprint;
use tracing::debug;

use crate::config::CacheLimits;
use crate::host::AssetUrl;

/// One cached render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// The produced asset.
    pub asset: AssetUrl,
    /// Host time of insertion.
    pub inserted_at: Duration,
    /// Monotonic insertion sequence (eviction order).
    pub sequence: u64,
}

/// Insertion-ordered, size-bounded map from fingerprint to asset.
#[derive(Debug)]
pub struct ResultCache {
    limits: CacheLimits,
    entries: HashMap<Fingerprint, CacheEntry>,
    order: BTreeMap<u64, Fingerprint>,
    next_sequence: u64,
}

impl ResultCache {
    /// Create an empty cache.
    ///
    /// A `clean_threshold` above `max_entries` is clamped down to it.
    #[must_use]
    pub fn new(limits: CacheLimits) -> Self {
        let limits = CacheLimits {
            clean_threshold: limits.clean_threshold.min(limits.max_entries),
            ..limits
        };
        Self {
            limits,
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_sequence: 0,
        }
    }

    /// Cached entry for `fingerprint`.
    #[must_use]
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<&CacheEntry> {
        self.entries.get(fingerprint)
    }

    /// Insert or replace the entry for `fingerprint`.
    ///
    /// Replacing moves the entry to the newest position. Returns the
    /// assets that are no longer referenced by the cache: the replaced
    /// asset (if it differs) followed by any evicted ones.
    pub fn put(&mut self, fingerprint: Fingerprint, asset: AssetUrl, now: Duration) -> Vec<AssetUrl> {
        let mut released = Vec::new();
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        self.order.insert(sequence, fingerprint.clone());
        let entry = CacheEntry {
            asset,
            inserted_at: now,
            sequence,
        };
        if let Some(previous) = self.entries.insert(fingerprint, entry) {
            self.order.remove(&previous.sequence);
            if !self.entries.values().any(|e| e.asset == previous.asset) {
                released.push(previous.asset);
            }
        }

        if self.entries.len() > self.limits.max_entries {
            released.extend(self.evict_to(self.limits.clean_threshold));
        }
        released
    }

    /// Remove every entry and return the assets for release.
    pub fn clear(&mut self) -> Vec<AssetUrl> {
        self.order.clear();
        let released: Vec<AssetUrl> = self.entries.drain().map(|(_, e)| e.asset).collect();
        if !released.is_empty() {
            debug!(count = released.len(), "cache cleared");
        }
        released
    }

    /// Number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns `true` if some entry references `asset`.
    #[must_use]
    pub fn holds(&self, asset: &AssetUrl) -> bool {
        self.entries.values().any(|e| &e.asset == asset)
    }

    fn evict_to(&mut self, target: usize) -> Vec<AssetUrl> {
        let mut evicted = Vec::new();
        while self.entries.len() > target {
            let Some((_, fingerprint)) = self.order.pop_first() else {
                break;
            };
            if let Some(entry) = self.entries.remove(&fingerprint) {
                debug!(%fingerprint, "evicted from cache");
                evicted.push(entry.asset);
            }
        }
        evicted
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use halide_pipeline::Settings;

    use super::*;

    fn fp(source: &str, grain: bool) -> Fingerprint {
        Fingerprint::new(
            source,
            &Settings {
                preset_id: "p".into(),
                grain_enabled: grain,
                ..Settings::default()
            },
        )
    }

    fn asset(n: usize) -> AssetUrl {
        AssetUrl(format!("blob:{n}"))
    }

    fn cache(max_entries: usize, clean_threshold: usize) -> ResultCache {
        ResultCache::new(CacheLimits {
            max_entries,
            clean_threshold,
        })
    }

    #[test]
    fn get_after_put() {
        let mut cache = cache(4, 2);
        assert!(cache.put(fp("a", false), asset(1), Duration::ZERO).is_empty());
        assert_eq!(cache.get(&fp("a", false)).unwrap().asset, asset(1));
        assert!(cache.get(&fp("a", true)).is_none());
    }

    #[test]
    fn grain_flag_yields_independent_entries() {
        let mut cache = cache(4, 2);
        cache.put(fp("a", false), asset(1), Duration::ZERO);
        cache.put(fp("a", true), asset(2), Duration::ZERO);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&fp("a", false)).unwrap().asset, asset(1));
        assert_eq!(cache.get(&fp("a", true)).unwrap().asset, asset(2));
    }

    #[test]
    fn overflow_evicts_oldest_inserted_down_to_threshold() {
        let mut cache = cache(5, 3);
        for n in 0..5 {
            assert!(cache.put(fp(&n.to_string(), false), asset(n), Duration::ZERO).is_empty());
        }
        // Reading does not refresh position.
        assert!(cache.get(&fp("0", false)).is_some());

        let evicted = cache.put(fp("5", false), asset(5), Duration::ZERO);
        assert_eq!(evicted, vec![asset(0), asset(1), asset(2)]);
        assert_eq!(cache.len(), 3);
        for n in 3..=5 {
            assert!(cache.get(&fp(&n.to_string(), false)).is_some());
        }
    }

    #[test]
    fn size_never_exceeds_max_after_many_inserts() {
        let mut cache = cache(10, 7);
        for n in 0..100 {
            cache.put(fp(&n.to_string(), n % 2 == 0), asset(n), Duration::ZERO);
            assert!(cache.len() <= 10);
        }
        assert!(cache.get(&fp("99", false)).is_some());
    }

    #[test]
    fn replacing_refreshes_position_and_releases_old_asset() {
        let mut cache = cache(3, 2);
        cache.put(fp("a", false), asset(1), Duration::ZERO);
        cache.put(fp("b", false), asset(2), Duration::ZERO);
        let released = cache.put(fp("a", false), asset(3), Duration::ZERO);
        assert_eq!(released, vec![asset(1)]);
        assert_eq!(cache.len(), 2);

        cache.put(fp("c", false), asset(4), Duration::ZERO);
        let evicted = cache.put(fp("d", false), asset(5), Duration::ZERO);
        // "b" is now oldest, then the refreshed "a".
        assert_eq!(evicted, vec![asset(2), asset(3)]);
    }

    #[test]
    fn clear_returns_every_asset() {
        let mut cache = cache(8, 4);
        cache.put(fp("a", false), asset(1), Duration::ZERO);
        cache.put(fp("b", true), asset(2), Duration::ZERO);
        let mut released = cache.clear();
        released.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(released, vec![asset(1), asset(2)]);
        assert!(cache.is_empty());
    }

    #[test]
    fn threshold_above_max_is_clamped() {
        let mut cache = cache(2, 9);
        for n in 0..3 {
            cache.put(fp(&n.to_string(), false), asset(n), Duration::ZERO);
        }
        assert_eq!(cache.len(), 2);
    }
}
