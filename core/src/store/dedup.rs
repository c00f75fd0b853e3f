// Dedup: two-tier "have I processed this id?" engine
//
// Tier 1: exact LRU of recent ids (authoritative for what it holds).
// Tier 2: Bloom filter pre-check. A negative means definitely new; a
// positive is reported as a likely duplicate. The worst a false positive
// can do is suppress one redundant forward.

use super::bloom::BloomFilter;
use crate::config::DedupConfig;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use tracing::{debug, trace};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupRecord {
    pub id: String,
    pub last_seen_at: u64,
    /// Hop count of the copy that was recorded
    pub hop: u8,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DedupStats {
    pub lru_len: usize,
    pub lru_capacity: usize,
    pub bloom_inserted: u64,
    pub bloom_fill_ratio: f64,
    pub bloom_estimated_fp_rate: f64,
    pub checks: u64,
    pub duplicates: u64,
    pub bloom_hits: u64,
    pub swept: u64,
    pub bloom_rebuilds: u64,
}

pub struct DedupEngine {
    lru: LruCache<String, DedupRecord>,
    bloom: BloomFilter,
    config: DedupConfig,
    checks: u64,
    duplicates: u64,
    bloom_hits: u64,
    swept: u64,
    bloom_rebuilds: u64,
}

impl DedupEngine {
    pub fn new(config: DedupConfig) -> Self {
        let cap = NonZeroUsize::new(config.lru_capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            lru: LruCache::new(cap),
            bloom: BloomFilter::new(config.bloom_capacity, config.bloom_fp_rate),
            config,
            checks: 0,
            duplicates: 0,
            bloom_hits: 0,
            swept: 0,
            bloom_rebuilds: 0,
        }
    }

    /// Check without recording.
    pub fn seen(&self, id: &str) -> bool {
        self.lru.contains(id) || self.bloom.might_contain(id.as_bytes())
    }

    /// Check and record. The first call for an id returns false.
    pub fn is_duplicate(&mut self, id: &str, now: u64) -> bool {
        self.checks += 1;

        if let Some(record) = self.lru.get_mut(id) {
            record.last_seen_at = now;
            self.duplicates += 1;
            trace!(id, "duplicate (lru)");
            return true;
        }

        if self.bloom.might_contain(id.as_bytes()) {
            self.duplicates += 1;
            self.bloom_hits += 1;
            trace!(id, "likely duplicate (bloom)");
            return true;
        }

        self.record(id, 0, now);
        false
    }

    /// Record an id as processed, e.g. our own outbound message.
    pub fn mark_seen(&mut self, id: &str, hop: u8, now: u64) {
        if let Some(record) = self.lru.get_mut(id) {
            record.last_seen_at = now;
            record.hop = record.hop.min(hop);
            return;
        }
        self.record(id, hop, now);
    }

    fn record(&mut self, id: &str, hop: u8, now: u64) {
        self.lru.put(
            id.to_string(),
            DedupRecord {
                id: id.to_string(),
                last_seen_at: now,
                hop,
            },
        );
        self.bloom.insert(id.as_bytes());

        if self.bloom.inserted() > self.config.bloom_capacity as u64 {
            self.rebuild_bloom();
        }
    }

    /// Replace the filter with one holding only what the LRU still knows.
    fn rebuild_bloom(&mut self) {
        let mut fresh = BloomFilter::new(self.config.bloom_capacity, self.config.bloom_fp_rate);
        for (id, _) in self.lru.iter() {
            fresh.insert(id.as_bytes());
        }
        debug!(
            retained = fresh.inserted(),
            "bloom filter over capacity, rebuilt from lru"
        );
        self.bloom = fresh;
        self.bloom_rebuilds += 1;
    }

    /// Purge LRU entries older than the retention window. Returns how many.
    pub fn sweep(&mut self, now: u64) -> usize {
        let cutoff = now.saturating_sub(self.config.retention_ms);
        let stale: Vec<String> = self
            .lru
            .iter()
            .filter(|(_, r)| r.last_seen_at < cutoff)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &stale {
            self.lru.pop(id);
        }
        if !stale.is_empty() {
            debug!(count = stale.len(), "swept stale dedup records");
        }
        self.swept += stale.len() as u64;
        stale.len()
    }

    /// Forget everything; the filter is rebuilt empty, not shrunk.
    pub fn clear(&mut self) {
        self.lru.clear();
        self.bloom = BloomFilter::new(self.config.bloom_capacity, self.config.bloom_fp_rate);
    }

    pub fn len(&self) -> usize {
        self.lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lru.is_empty()
    }

    pub fn stats(&self) -> DedupStats {
        DedupStats {
            lru_len: self.lru.len(),
            lru_capacity: self.lru.cap().get(),
            bloom_inserted: self.bloom.inserted(),
            bloom_fill_ratio: self.bloom.fill_ratio(),
            bloom_estimated_fp_rate: self.bloom.estimated_fp_rate(),
            checks: self.checks,
            duplicates: self.duplicates,
            bloom_hits: self.bloom_hits,
            swept: self.swept,
            bloom_rebuilds: self.bloom_rebuilds,
        }
    }

    /// LRU contents, least recently used first, so restoring in order
    /// reproduces the recency ranking.
    pub fn records(&self) -> Vec<DedupRecord> {
        self.lru.iter().rev().map(|(_, r)| r.clone()).collect()
    }

    pub fn bloom(&self) -> &BloomFilter {
        &self.bloom
    }

    /// Rebuild from persisted parts. Without a usable filter, one is
    /// derived from the records.
    pub fn restore(&mut self, records: Vec<DedupRecord>, bloom: Option<BloomFilter>) {
        self.lru.clear();
        let restore_bloom = bloom.is_none();
        self.bloom = bloom.unwrap_or_else(|| {
            BloomFilter::new(self.config.bloom_capacity, self.config.bloom_fp_rate)
        });
        for record in records {
            if restore_bloom {
                self.bloom.insert(record.id.as_bytes());
            }
            self.lru.put(record.id.clone(), record);
        }
    }
}
