//! TTL result cache for expensive aggregates.
//!
//! Values are stored as JSON text with an absolute expiry computed at write
//! time. Reads past expiry are misses; callers recompute and `set` again.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::clock::Clock;
use crate::error::PulseError;
use crate::metrics::{MetricsSink, CACHE_REQUESTS};

#[derive(Debug, Clone)]
struct CacheEntry {
    json: String,
    expires_at: DateTime<Utc>,
}

pub struct TtlCache {
    entries: DashMap<String, CacheEntry>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
}

impl TtlCache {
    pub fn new(clock: Arc<dyn Clock>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            metrics,
        }
    }

    /// Fetch and decode a value. Expired entries are removed and reported as a miss.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, PulseError> {
        let now = self.clock.now();
        let json = match self.entries.get(key) {
            Some(entry) if entry.expires_at > now => Some(entry.json.clone()),
            Some(_) => None,
            None => None,
        };

        let Some(json) = json else {
            self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
            self.metrics.increment(CACHE_REQUESTS, &[("result", "miss")]);
            log::debug!("Cache: miss for {}", key);
            return Ok(None);
        };

        self.metrics.increment(CACHE_REQUESTS, &[("result", "hit")]);
        Ok(Some(serde_json::from_str(&json)?))
    }

    /// Replace any prior value and reset its expiry
    pub fn set<T: Serialize>(&self, key: &str, value: &T, ttl_minutes: i64) -> Result<(), PulseError> {
        let json = serde_json::to_string(value)?;
        let expires_at = self.clock.now() + Duration::minutes(ttl_minutes);
        self.entries
            .insert(key.to_string(), CacheEntry { json, expires_at });
        Ok(())
    }

    pub fn delete(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Drop every expired entry, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::metrics::MetricsRecorder;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Summary {
        total: u32,
    }

    fn cache() -> (TtlCache, Arc<ManualClock>, Arc<MetricsRecorder>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let metrics = Arc::new(MetricsRecorder::new());
        (TtlCache::new(clock.clone(), metrics.clone()), clock, metrics)
    }

    #[test]
    fn test_get_after_set_hits() {
        let (cache, _, metrics) = cache();
        cache.set("analytics_summary", &Summary { total: 7 }, 15).unwrap();
        let got: Option<Summary> = cache.get("analytics_summary").unwrap();
        assert_eq!(got, Some(Summary { total: 7 }));
        assert_eq!(metrics.counter(CACHE_REQUESTS, &[("result", "hit")]), 1);
    }

    #[test]
    fn test_expired_entry_is_a_miss() {
        let (cache, clock, metrics) = cache();
        cache.set("k", &Summary { total: 1 }, 15).unwrap();
        clock.advance(Duration::minutes(15));
        let got: Option<Summary> = cache.get("k").unwrap();
        assert_eq!(got, None);
        assert!(cache.is_empty());
        assert_eq!(metrics.counter(CACHE_REQUESTS, &[("result", "miss")]), 1);
    }

    #[test]
    fn test_set_replaces_value_and_resets_expiry() {
        let (cache, clock, _) = cache();
        cache.set("k", &Summary { total: 1 }, 5).unwrap();
        clock.advance(Duration::minutes(4));
        cache.set("k", &Summary { total: 2 }, 5).unwrap();
        clock.advance(Duration::minutes(4));
        let got: Option<Summary> = cache.get("k").unwrap();
        assert_eq!(got, Some(Summary { total: 2 }));
    }

    #[test]
    fn test_delete_and_purge() {
        let (cache, clock, _) = cache();
        cache.set("a", &1u32, 1).unwrap();
        cache.set("b", &2u32, 10).unwrap();
        cache.set("c", &3u32, 10).unwrap();
        cache.delete("c");
        clock.advance(Duration::minutes(2));
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get::<u32>("b").unwrap(), Some(2));
    }

    #[test]
    fn test_type_mismatch_is_a_serialization_error() {
        let (cache, _, _) = cache();
        cache.set("k", &"text", 5).unwrap();
        let err = cache.get::<Summary>("k").unwrap_err();
        assert_eq!(err.outcome_label(), "serialization");
    }
}
