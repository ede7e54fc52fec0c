//! Stream Cache (§4.6): per-key, time-ordered retention with TTL, size
//! caps, and filtered query.
//!
//! The teacher has no analogous component (it is push-through, no
//! retention); this is grounded in the teacher's metrics module instead —
//! `metrics.rs`'s atomic-counter-plus-periodic-task shape is reused here
//! for the cache's own metrics and sweeper.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::clock::Clock;
use crate::config::CachePolicy;
use crate::record::CanonicalRecord;

/// A rough per-record memory estimate: the JSON encoding is a reasonable
/// proxy for "bytes this record would cost to hold or ship" without
/// pulling in a heap-profiling dependency.
fn estimate_size(record: &CanonicalRecord) -> usize {
    serde_json::to_vec(record).map(|v| v.len()).unwrap_or(256)
}

struct Entry {
    record: CanonicalRecord,
    inserted_at_ms: i64,
    size: usize,
}

struct KeyBucket {
    entries: Vec<Entry>,
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct KeyStats {
    pub count: usize,
    pub oldest_event_ts: Option<i64>,
    pub newest_event_ts: Option<i64>,
    pub size_bytes: usize,
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct CacheMetrics {
    pub puts: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub memory_estimate_bytes: u64,
    pub last_cleanup_ms: i64,
}

#[derive(Debug, Default, Clone, Copy, serde::Serialize)]
pub struct CacheQuery {
    pub limit: Option<usize>,
    pub from_ts: Option<i64>,
    pub to_ts: Option<i64>,
}

pub struct StreamCache {
    clock: Arc<dyn Clock>,
    policy: CachePolicy,
    buckets: RwLock<HashMap<String, KeyBucket>>,
    puts: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    memory_estimate: AtomicUsize,
    last_cleanup_ms: AtomicI64,
}

impl StreamCache {
    pub fn new(clock: Arc<dyn Clock>, policy: CachePolicy) -> Arc<Self> {
        let now = clock.now_ms();
        Arc::new(Self {
            clock,
            policy,
            buckets: RwLock::new(HashMap::new()),
            puts: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            memory_estimate: AtomicUsize::new(0),
            last_cleanup_ms: AtomicI64::new(now),
        })
    }

    /// `put(key, record)`: O(1) amortized append, then per-key size-cap
    /// eviction and an opportunistic global memory-cap sweep (§4.6 rules 1, 3).
    pub async fn put(&self, key: &str, record: CanonicalRecord) {
        let size = estimate_size(&record);
        let now = self.clock.now_ms();
        let mut buckets = self.buckets.write().await;
        let bucket = buckets.entry(key.to_string()).or_insert_with(|| KeyBucket { entries: Vec::new() });
        bucket.entries.push(Entry { record, inserted_at_ms: now, size });
        self.memory_estimate.fetch_add(size, Ordering::Relaxed);
        self.puts.fetch_add(1, Ordering::Relaxed);

        if bucket.entries.len() > self.policy.max_entries {
            bucket.entries.sort_by_key(|e| e.record.event_timestamp);
            while bucket.entries.len() > self.policy.max_entries {
                let evicted = bucket.entries.remove(0);
                self.memory_estimate.fetch_sub(evicted.size, Ordering::Relaxed);
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }

        if self.memory_estimate.load(Ordering::Relaxed) > self.policy.memory_cap_bytes {
            drop(buckets);
            self.sweep_expired().await;
        }
    }

    /// `get(key, {limit, from_ts, to_ts}) → records`, newest-first, with
    /// lazy TTL filtering on read (§4.6 rule 2).
    pub async fn get(&self, key: &str, query: CacheQuery) -> Vec<CanonicalRecord> {
        let now = self.clock.now_ms();
        let buckets = self.buckets.read().await;
        let Some(bucket) = buckets.get(key) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Vec::new();
        };

        let mut records: Vec<&CanonicalRecord> = bucket
            .entries
            .iter()
            .filter(|e| now - e.inserted_at_ms < self.policy.ttl_ms)
            .map(|e| &e.record)
            .filter(|r| query.from_ts.is_none_or(|from| r.event_timestamp >= from))
            .filter(|r| query.to_ts.is_none_or(|to| r.event_timestamp <= to))
            .collect();

        records.sort_by(|a, b| b.event_timestamp.cmp(&a.event_timestamp));
        if let Some(limit) = query.limit {
            records.truncate(limit);
        }

        if records.is_empty() {
            self.misses.fetch_add(1, Ordering::Relaxed);
        } else {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        records.into_iter().cloned().collect()
    }

    pub async fn latest(&self, key: &str) -> Option<CanonicalRecord> {
        self.get(key, CacheQuery { limit: Some(1), ..Default::default() }).await.into_iter().next()
    }

    pub async fn has(&self, key: &str) -> bool {
        self.buckets.read().await.contains_key(key)
    }

    pub async fn keys(&self) -> Vec<String> {
        self.buckets.read().await.keys().cloned().collect()
    }

    pub async fn key_stats(&self, key: &str) -> Option<KeyStats> {
        let buckets = self.buckets.read().await;
        let bucket = buckets.get(key)?;
        let size_bytes = bucket.entries.iter().map(|e| e.size).sum();
        let oldest = bucket.entries.iter().map(|e| e.record.event_timestamp).min();
        let newest = bucket.entries.iter().map(|e| e.record.event_timestamp).max();
        Some(KeyStats { count: bucket.entries.len(), oldest_event_ts: oldest, newest_event_ts: newest, size_bytes })
    }

    pub async fn delete(&self, key: &str) {
        if let Some(bucket) = self.buckets.write().await.remove(key) {
            let freed: usize = bucket.entries.iter().map(|e| e.size).sum();
            self.memory_estimate.fetch_sub(freed, Ordering::Relaxed);
        }
    }

    pub async fn clear(&self) {
        self.buckets.write().await.clear();
        self.memory_estimate.store(0, Ordering::Relaxed);
    }

    pub fn metrics(&self) -> CacheMetrics {
        CacheMetrics {
            puts: self.puts.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            memory_estimate_bytes: self.memory_estimate.load(Ordering::Relaxed) as u64,
            last_cleanup_ms: self.last_cleanup_ms.load(Ordering::Relaxed),
        }
    }

    /// Healthy iff estimated memory stays under the soft cap and no key has
    /// exceeded `max_entries * 0.9` for more than one sweep (§4.6 Health).
    pub async fn healthy(&self) -> bool {
        const SOFT_CAP_BYTES: usize = 100 * 1024 * 1024;
        if self.memory_estimate.load(Ordering::Relaxed) >= SOFT_CAP_BYTES {
            return false;
        }
        let threshold = (self.policy.max_entries as f64 * 0.9) as usize;
        let buckets = self.buckets.read().await;
        buckets.values().all(|b| b.entries.len() <= threshold)
    }

    async fn sweep_expired(&self) {
        let now = self.clock.now_ms();
        let ttl = self.policy.ttl_ms;
        let mut buckets = self.buckets.write().await;
        for bucket in buckets.values_mut() {
            let before = bucket.entries.len();
            bucket.entries.retain(|e| now - e.inserted_at_ms < ttl);
            let removed = before - bucket.entries.len();
            if removed > 0 {
                self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
            }
        }
        let total: usize = buckets.values().flat_map(|b| b.entries.iter()).map(|e| e.size).sum();
        self.memory_estimate.store(total, Ordering::Relaxed);
        self.last_cleanup_ms.store(now, Ordering::Relaxed);
    }

    /// Spawns the periodic TTL sweeper (§5 "one sweeper task in the Stream Cache").
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        let interval_ms = self.policy.cleanup_interval_ms;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            loop {
                ticker.tick().await;
                cache.sweep_expired().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::record::{DataType, Payload, Side, Trade};
    use rust_decimal::Decimal;

    fn record_at(ts: i64) -> CanonicalRecord {
        CanonicalRecord {
            exchange: "binance".into(),
            symbol: "BTC/USDT".into(),
            data_type: DataType::Trade,
            event_timestamp: ts,
            received_timestamp: ts,
            payload: Payload::Trade(Trade {
                id: ts.to_string(),
                price: Decimal::new(1, 0),
                quantity: Decimal::new(1, 0),
                side: Side::Buy,
                trade_time: ts,
            }),
        }
    }

    fn policy() -> CachePolicy {
        CachePolicy { max_entries: 3, ttl_ms: 60_000, cleanup_interval_ms: 30_000, memory_cap_bytes: 10_000_000 }
    }

    #[tokio::test]
    async fn put_evicts_oldest_beyond_max_entries() {
        let clock = TestClock::new(0);
        let cache = StreamCache::new(clock.clone(), policy());
        for i in 0..5 {
            clock.advance(1);
            cache.put("binance:BTC/USDT:trade", record_at(i)).await;
        }
        let stats = cache.key_stats("binance:BTC/USDT:trade").await.unwrap();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.oldest_event_ts, Some(2));
        assert_eq!(stats.newest_event_ts, Some(4));
    }

    #[tokio::test]
    async fn put_evicts_oldest_by_event_timestamp_even_when_arriving_out_of_order() {
        let clock = TestClock::new(0);
        let cache = StreamCache::new(clock.clone(), policy());
        for ts in [10, 5, 20, 1, 15] {
            clock.advance(1);
            cache.put("binance:BTC/USDT:trade", record_at(ts)).await;
        }
        let stats = cache.key_stats("binance:BTC/USDT:trade").await.unwrap();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.oldest_event_ts, Some(10));
        assert_eq!(stats.newest_event_ts, Some(20));
    }

    #[tokio::test]
    async fn get_returns_newest_first_and_respects_limit() {
        let clock = TestClock::new(0);
        let cache = StreamCache::new(clock, policy());
        for i in 0..3 {
            cache.put("k", record_at(i)).await;
        }
        let rows = cache.get("k", CacheQuery { limit: Some(2), ..Default::default() }).await;
        assert_eq!(rows.iter().map(|r| r.event_timestamp).collect::<Vec<_>>(), vec![2, 1]);
    }

    #[tokio::test]
    async fn expired_entries_are_excluded_on_read() {
        let clock = TestClock::new(0);
        let cache = StreamCache::new(clock.clone(), CachePolicy { ttl_ms: 100, ..policy() });
        cache.put("k", record_at(0)).await;
        clock.advance(200);
        assert!(cache.get("k", CacheQuery::default()).await.is_empty());
    }
}
