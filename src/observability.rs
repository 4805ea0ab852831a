use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{info, warn};

/// Counters for one steward process
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    pub cycles: AtomicU64,
    pub clusters_planned: AtomicU64,
    pub fast_path_resolutions: AtomicU64,
    pub auto_resolutions: AtomicU64,
    pub escalations: AtomicU64,
    pub queue_merges: AtomicU64,
    pub queue_rebases: AtomicU64,
    pub rollbacks: AtomicU64,
    pub oracle_calls: AtomicU64,
    pub classification_cache_hits: AtomicU64,
    pub classification_cache_misses: AtomicU64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_cycle(&self) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_clusters(&self, count: usize) {
        self.clusters_planned.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_fast_path(&self) {
        self.fast_path_resolutions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_auto_resolution(&self) {
        self.auto_resolutions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_escalation(&self, reason_code: &str) {
        self.escalations.fetch_add(1, Ordering::Relaxed);
        info!(reason = reason_code, "Cluster escalated to a human");
    }

    pub fn record_merge(&self) {
        self.queue_merges.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rebase(&self) {
        self.queue_rebases.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rollback(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
        warn!("Rollback applied to the integration branch");
    }

    pub fn record_oracle_call(&self) {
        self.oracle_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.classification_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.classification_cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_stats(&self) -> PipelineStats {
        PipelineStats {
            cycles: self.cycles.load(Ordering::Relaxed),
            clusters_planned: self.clusters_planned.load(Ordering::Relaxed),
            fast_path_resolutions: self.fast_path_resolutions.load(Ordering::Relaxed),
            auto_resolutions: self.auto_resolutions.load(Ordering::Relaxed),
            escalations: self.escalations.load(Ordering::Relaxed),
            queue_merges: self.queue_merges.load(Ordering::Relaxed),
            queue_rebases: self.queue_rebases.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
            oracle_calls: self.oracle_calls.load(Ordering::Relaxed),
            classification_cache_hits: self.classification_cache_hits.load(Ordering::Relaxed),
            classification_cache_misses: self.classification_cache_misses.load(Ordering::Relaxed),
        }
    }

    pub fn log_stats(&self) {
        let stats = self.get_stats();
        info!(
            cycles = stats.cycles,
            clusters = stats.clusters_planned,
            fast_path = stats.fast_path_resolutions,
            auto_resolved = stats.auto_resolutions,
            escalated = stats.escalations,
            merged = stats.queue_merges,
            rebased = stats.queue_rebases,
            rollbacks = stats.rollbacks,
            oracle_calls = stats.oracle_calls,
            cache_hits = stats.classification_cache_hits,
            cache_misses = stats.classification_cache_misses,
            "Pipeline metrics"
        );
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub cycles: u64,
    pub clusters_planned: u64,
    pub fast_path_resolutions: u64,
    pub auto_resolutions: u64,
    pub escalations: u64,
    pub queue_merges: u64,
    pub queue_rebases: u64,
    pub rollbacks: u64,
    pub oracle_calls: u64,
    pub classification_cache_hits: u64,
    pub classification_cache_misses: u64,
}

static PIPELINE_METRICS: std::sync::LazyLock<PipelineMetrics> =
    std::sync::LazyLock::new(PipelineMetrics::new);

pub fn pipeline_metrics() -> &'static PipelineMetrics {
    &PIPELINE_METRICS
}

/// Time an operation and log its duration on finish
pub struct OperationTimer {
    operation: String,
    start: Instant,
}

impl OperationTimer {
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    pub fn finish(self) -> u64 {
        let duration_ms = self.elapsed_ms();
        info!(
            operation = %self.operation,
            duration_ms = duration_ms,
            "Operation completed"
        );
        duration_ms
    }
}

#[macro_export]
macro_rules! time_operation {
    ($operation:expr) => {
        let _timer = $crate::observability::OperationTimer::new($operation);
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = PipelineMetrics::new();
        metrics.record_clusters(3);
        metrics.record_clusters(2);
        metrics.record_escalation("low_confidence");
        metrics.record_cache_hit();

        let stats = metrics.get_stats();
        assert_eq!(stats.clusters_planned, 5);
        assert_eq!(stats.escalations, 1);
        assert_eq!(stats.classification_cache_hits, 1);
        assert_eq!(stats.classification_cache_misses, 0);
    }
}
