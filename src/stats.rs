//! Process-wide pipeline counters
//!
//! Counters are telemetry only. Nothing reads them to make a decision.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

/// Confidence is accumulated in millionths so it fits an atomic integer
const CONFIDENCE_SCALE: f64 = 1_000_000.0;

/// Lock-free counters shared by every engine and stage
#[derive(Debug, Default)]
pub struct PipelineStats {
    rule_errors: AtomicU64,

    semantic_calls: AtomicU64,
    semantic_errors: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,

    llm_calls: AtomicU64,
    llm_skipped: AtomicU64,
    llm_timeouts: AtomicU64,
    llm_transient_errors: AtomicU64,
    llm_retries: AtomicU64,
    llm_failures: AtomicU64,
    llm_integrity_violations: AtomicU64,

    semaphore_capacity: AtomicUsize,
    llm_in_flight: AtomicUsize,
    llm_peak_in_flight: AtomicUsize,

    confidence_sum_micros: AtomicU64,
    points_processed: AtomicU64,
    points_degraded: AtomicU64,
    categories_failed: AtomicU64,
    calls_succeeded: AtomicU64,
    calls_failed: AtomicU64,
}

/// Decrements the in-flight gauge when an LLM attempt ends
pub struct InFlightGuard<'a> {
    stats: &'a PipelineStats,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.stats.llm_in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_rule_error(&self) {
        self.rule_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_semantic_call(&self) {
        self.semantic_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_semantic_error(&self) {
        self.semantic_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hits(&self, n: u64) {
        self.cache_hits.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_cache_misses(&self, n: u64) {
        self.cache_misses.fetch_add(n, Ordering::Relaxed);
    }

    /// One LLM attempt, counted when a permit has been acquired
    pub fn record_llm_call(&self) {
        self.llm_calls.fetch_add(1, Ordering::Relaxed);
    }

    /// Prior confidence was outside the uncertain band
    pub fn record_llm_skipped(&self) {
        self.llm_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_llm_timeout(&self) {
        self.llm_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_llm_transient(&self) {
        self.llm_transient_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_llm_retry(&self) {
        self.llm_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Validation gave up without a usable answer
    pub fn record_llm_failure(&self) {
        self.llm_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_integrity_violation(&self) {
        self.llm_integrity_violations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_semaphore_capacity(&self, permits: usize) {
        self.semaphore_capacity.store(permits, Ordering::Relaxed);
    }

    /// Mark an LLM attempt as in flight until the guard drops
    pub fn enter_llm(&self) -> InFlightGuard<'_> {
        let now = self.llm_in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        self.llm_peak_in_flight.fetch_max(now, Ordering::Relaxed);
        InFlightGuard { stats: self }
    }

    /// Count a finished point and its final confidence
    pub fn record_point(&self, final_confidence: f64, degraded: bool) {
        self.points_processed.fetch_add(1, Ordering::Relaxed);
        if degraded {
            self.points_degraded.fetch_add(1, Ordering::Relaxed);
        }
        let micros = (final_confidence.clamp(0.0, 1.0) * CONFIDENCE_SCALE).round() as u64;
        self.confidence_sum_micros.fetch_add(micros, Ordering::Relaxed);
    }

    pub fn record_category_failure(&self) {
        self.categories_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_call(&self, succeeded: bool) {
        if succeeded {
            self.calls_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.calls_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Get current statistics
    pub fn snapshot(&self) -> StatsSnapshot {
        let points_processed = self.points_processed.load(Ordering::Relaxed);
        let confidence_sum =
            self.confidence_sum_micros.load(Ordering::Relaxed) as f64 / CONFIDENCE_SCALE;
        let capacity = self.semaphore_capacity.load(Ordering::Relaxed);
        let peak = self.llm_peak_in_flight.load(Ordering::Relaxed);

        StatsSnapshot {
            rule_errors: self.rule_errors.load(Ordering::Relaxed),
            semantic_calls: self.semantic_calls.load(Ordering::Relaxed),
            semantic_errors: self.semantic_errors.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            llm_calls: self.llm_calls.load(Ordering::Relaxed),
            llm_skipped: self.llm_skipped.load(Ordering::Relaxed),
            llm_timeouts: self.llm_timeouts.load(Ordering::Relaxed),
            llm_transient_errors: self.llm_transient_errors.load(Ordering::Relaxed),
            llm_retries: self.llm_retries.load(Ordering::Relaxed),
            llm_failures: self.llm_failures.load(Ordering::Relaxed),
            llm_integrity_violations: self.llm_integrity_violations.load(Ordering::Relaxed),
            semaphore_capacity: capacity,
            semaphore_peak_in_flight: peak,
            semaphore_peak_utilization: if capacity > 0 {
                peak as f64 / capacity as f64
            } else {
                0.0
            },
            points_processed,
            points_degraded: self.points_degraded.load(Ordering::Relaxed),
            average_confidence: if points_processed > 0 {
                confidence_sum / points_processed as f64
            } else {
                0.0
            },
            categories_failed: self.categories_failed.load(Ordering::Relaxed),
            calls_succeeded: self.calls_succeeded.load(Ordering::Relaxed),
            calls_failed: self.calls_failed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`PipelineStats`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub rule_errors: u64,
    pub semantic_calls: u64,
    pub semantic_errors: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub llm_calls: u64,
    pub llm_skipped: u64,
    pub llm_timeouts: u64,
    pub llm_transient_errors: u64,
    pub llm_retries: u64,
    pub llm_failures: u64,
    pub llm_integrity_violations: u64,
    pub semaphore_capacity: usize,
    pub semaphore_peak_in_flight: usize,
    /// Peak in-flight attempts over permits
    pub semaphore_peak_utilization: f64,
    pub points_processed: u64,
    pub points_degraded: u64,
    pub average_confidence: f64,
    pub categories_failed: u64,
    pub calls_succeeded: u64,
    pub calls_failed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_confidence() {
        let stats = PipelineStats::new();
        stats.record_point(0.5, false);
        stats.record_point(1.0, false);
        stats.record_point(0.0, true);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.points_processed, 3);
        assert_eq!(snapshot.points_degraded, 1);
        assert!((snapshot.average_confidence - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_in_flight_peak() {
        let stats = PipelineStats::new();
        stats.set_semaphore_capacity(2);
        {
            let _a = stats.enter_llm();
            let _b = stats.enter_llm();
        }
        let _c = stats.enter_llm();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.semaphore_peak_in_flight, 2);
        assert_eq!(snapshot.semaphore_peak_utilization, 1.0);
        assert_eq!(stats.llm_in_flight.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_empty_snapshot() {
        let snapshot = PipelineStats::new().snapshot();
        assert_eq!(snapshot.average_confidence, 0.0);
        assert_eq!(snapshot.semaphore_peak_utilization, 0.0);
        assert_eq!(snapshot.calls_failed, 0);
    }
}
