//! Statistics about statistics.
//!
//! [`EngineStats`] records operational events the engine itself generates:
//! dropped buckets, pull delays, guardrail hits. It is an explicit
//! process-scoped object handed to constructors so tests can substitute a
//! local instance; nothing in the crate reaches for a hidden singleton.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use dashmap::DashMap;

/// Default dimension soft limit before the stats sink is notified.
pub const DEFAULT_DIMENSION_SOFT_LIMIT: usize = 500;

/// Default dimension hard limit; new dimensions beyond it are dropped.
pub const DEFAULT_DIMENSION_HARD_LIMIT: usize = 750;

/// Default maximum tolerated pull latency.
pub const DEFAULT_MAX_PULL_DELAY_NS: i64 = 10 * crate::clock::NS_PER_SEC;

/// Per-pulled-tag counters.
#[derive(Debug, Default, Clone)]
pub struct PullTagStats {
    pub pulls: u64,
    pub pull_failures: u64,
    pub total_delay_ns: i64,
    pub max_delay_ns: i64,
    pub exceed_max_delay: u64,
}

/// Per-metric dimension accounting.
#[derive(Debug, Default, Clone)]
pub struct DimensionStats {
    /// Times the soft limit was crossed on insertion.
    pub soft_limit_notes: u64,
    /// Largest tuple count observed at a soft-limit note.
    pub max_tuple_count: usize,
    /// Times the hard limit was first reached within a bucket.
    pub hard_limit_hits: u64,
}

/// Process-wide operational counters for the engine.
#[derive(Default)]
pub struct EngineStats {
    events_dispatched: AtomicU64,
    configs_rejected: AtomicU64,
    bucket_counts: DashMap<i64, u64>,
    bucket_drops: DashMap<i64, u64>,
    dimension_stats: DashMap<i64, DimensionStats>,
    pull_stats: DashMap<i32, PullTagStats>,
}

impl EngineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn note_event_dispatched(&self) {
        self.events_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_config_rejected(&self) {
        self.configs_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// A bucket was finalized for the metric.
    pub fn note_bucket_count(&self, metric_id: i64) {
        *self.bucket_counts.entry(metric_id).or_insert(0) += 1;
    }

    /// Past buckets were dropped for the metric (memory pressure or drop request).
    pub fn note_bucket_dropped(&self, metric_id: i64) {
        *self.bucket_drops.entry(metric_id).or_insert(0) += 1;
    }

    /// The metric crossed its dimension soft limit; `tuple_count` is the
    /// would-be size including the new dimension.
    pub fn note_metric_dimension_size(&self, metric_id: i64, tuple_count: usize) {
        let mut entry = self.dimension_stats.entry(metric_id).or_default();
        entry.soft_limit_notes += 1;
        if tuple_count > entry.max_tuple_count {
            entry.max_tuple_count = tuple_count;
        }
    }

    /// The metric hit its dimension hard limit this bucket.
    pub fn note_hard_dimension_limit_reached(&self, metric_id: i64) {
        self.dimension_stats.entry(metric_id).or_default().hard_limit_hits += 1;
    }

    pub fn note_pull(&self, tag_id: i32) {
        self.pull_stats.entry(tag_id).or_default().pulls += 1;
    }

    pub fn note_pull_failed(&self, tag_id: i32) {
        self.pull_stats.entry(tag_id).or_default().pull_failures += 1;
    }

    pub fn note_pull_delay(&self, tag_id: i32, delay_ns: i64) {
        let mut entry = self.pull_stats.entry(tag_id).or_default();
        entry.total_delay_ns += delay_ns;
        if delay_ns > entry.max_delay_ns {
            entry.max_delay_ns = delay_ns;
        }
    }

    pub fn note_pull_exceed_max_delay(&self, tag_id: i32) {
        self.pull_stats.entry(tag_id).or_default().exceed_max_delay += 1;
    }

    /// Point-in-time copy of all counters.
    pub fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            events_dispatched: self.events_dispatched.load(Ordering::Relaxed),
            configs_rejected: self.configs_rejected.load(Ordering::Relaxed),
            bucket_counts: self
                .bucket_counts
                .iter()
                .map(|e| (*e.key(), *e.value()))
                .collect(),
            bucket_drops: self
                .bucket_drops
                .iter()
                .map(|e| (*e.key(), *e.value()))
                .collect(),
            dimension_stats: self
                .dimension_stats
                .iter()
                .map(|e| (*e.key(), e.value().clone()))
                .collect(),
            pull_stats: self
                .pull_stats
                .iter()
                .map(|e| (*e.key(), e.value().clone()))
                .collect(),
        }
    }
}

/// Point-in-time view of [`EngineStats`].
#[derive(Debug, Default, Clone)]
pub struct EngineStatsSnapshot {
    pub events_dispatched: u64,
    pub configs_rejected: u64,
    pub bucket_counts: HashMap<i64, u64>,
    pub bucket_drops: HashMap<i64, u64>,
    pub dimension_stats: HashMap<i64, DimensionStats>,
    pub pull_stats: HashMap<i32, PullTagStats>,
}

/// Provides the process-wide shard offset mixed into sampled-dimension
/// hashing, so sampled shards differ across devices but not across runs
/// on the same device.
#[derive(Default)]
pub struct ShardOffsetProvider {
    offset: AtomicU32,
}

impl ShardOffsetProvider {
    pub fn new(offset: u32) -> Self {
        Self {
            offset: AtomicU32::new(offset),
        }
    }

    pub fn shard_offset(&self) -> u32 {
        self.offset.load(Ordering::Relaxed)
    }

    pub fn set_shard_offset(&self, offset: u32) {
        self.offset.store(offset, Ordering::Relaxed);
    }
}

/// FNV-1a over a byte string. Stable across runs and platforms, which the
/// sampled-sharding contract requires; std's SipHash is randomly keyed.
pub fn hash64(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut h = OFFSET;
    for &b in bytes {
        h ^= u64::from(b);
        h = h.wrapping_mul(PRIME);
    }
    h
}
