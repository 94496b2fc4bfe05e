//! Progress reporting and per-run statistics.
//!
//! Progress events are observational only: a caller-owned UI may display
//! them, but nothing in the pipeline depends on whether a callback is set.
//! Counters are atomic because resolver workers update them concurrently;
//! they are per-run values, never process-wide state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Coarse progress events emitted as the pipeline advances.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// Raw records normalized into canonical points.
    PointsNormalized { points: usize, dropped_fields: usize },
    /// Stay/transit segmentation finished.
    SegmentsDetected { stays: usize, transits: usize },
    /// Cache pre-pass finished for this run.
    CacheChecked { hits: u64, misses: u64 },
    /// One geocode batch finished.
    BatchCompleted { completed: usize, total: usize },
    /// All stays have a place (resolved or marked unknown).
    StaysResolved { resolved: usize, unresolved: usize },
    /// Aggregation produced the final report.
    ReportReady { jumps: usize },
}

/// Progress callback type.
pub type ProgressCallback = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// Thread-safe counters for one pipeline run.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub api_calls: AtomicU64,
    pub retries: AtomicU64,
    pub unresolved: AtomicU64,
    pub batches_completed: AtomicU64,
    pub records_dropped_fields: AtomicU64,
    pub points_discarded_low_confidence: AtomicU64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_api_call(&self) {
        self.api_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unresolved(&self) {
        self.unresolved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_completed(&self) {
        self.batches_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a plain-value snapshot suitable for serialization.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            api_calls: self.api_calls.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            unresolved: self.unresolved.load(Ordering::Relaxed),
            batches_completed: self.batches_completed.load(Ordering::Relaxed),
            records_dropped_fields: self.records_dropped_fields.load(Ordering::Relaxed),
            points_discarded_low_confidence: self
                .points_discarded_low_confidence
                .load(Ordering::Relaxed),
        }
    }
}

/// Plain-value view of [`PipelineStats`] at one instant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub api_calls: u64,
    pub retries: u64,
    pub unresolved: u64,
    pub batches_completed: u64,
    pub records_dropped_fields: u64,
    pub points_discarded_low_confidence: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_snapshot() {
        let stats = PipelineStats::new();
        stats.record_cache_hit();
        stats.record_cache_hit();
        stats.record_cache_miss();
        stats.record_api_call();
        stats.record_retry();
        stats.record_batch_completed();

        let snap = stats.snapshot();
        assert_eq!(snap.cache_hits, 2);
        assert_eq!(snap.cache_misses, 1);
        assert_eq!(snap.api_calls, 1);
        assert_eq!(snap.retries, 1);
        assert_eq!(snap.batches_completed, 1);
        assert_eq!(snap.unresolved, 0);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let stats = PipelineStats::new();
        stats.record_unresolved();
        let snap = stats.snapshot();
        let json = serde_json::to_string(&snap).unwrap();
        let back: StatsSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snap);
    }
}
