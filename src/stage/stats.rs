//! Per-stage counters.

use crate::memory::PoolStats;
use crate::observability::StageMetrics;
use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of a stage's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageStats {
    /// Frames published downstream.
    pub produced: u64,
    /// Frames pulled from the producer.
    pub consumed: u64,
    /// Frames dropped (non-fatal errors, late frames, rejections, queue overflow).
    pub dropped: u64,
    /// Backend errors, fatal or not.
    pub errors: u64,
    /// Frames waiting in the input queue.
    pub queued: usize,
    /// Pool usage, for stages that own a pool.
    pub pool: Option<PoolStats>,
}

/// Live counters, mirrored to the metrics facade.
pub(crate) struct StatCounters {
    produced: AtomicU64,
    consumed: AtomicU64,
    dropped: AtomicU64,
    errors: AtomicU64,
    metrics: StageMetrics,
}

impl StatCounters {
    pub(crate) fn new(metrics: StageMetrics) -> Self {
        Self {
            produced: AtomicU64::new(0),
            consumed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            metrics,
        }
    }

    #[inline]
    pub(crate) fn produced(&self) {
        self.produced.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_produced();
    }

    #[inline]
    pub(crate) fn consumed(&self) {
        self.consumed.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_consumed();
    }

    #[inline]
    pub(crate) fn dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_dropped();
    }

    #[inline]
    pub(crate) fn error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_error();
    }

    pub(crate) fn metrics(&self) -> &StageMetrics {
        &self.metrics
    }

    /// Counters plus the input queue's own drops.
    pub(crate) fn snapshot(&self, queue_dropped: u64, queued: usize, pool: Option<PoolStats>) -> StageStats {
        StageStats {
            produced: self.produced.load(Ordering::Relaxed),
            consumed: self.consumed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed) + queue_dropped,
            errors: self.errors.load(Ordering::Relaxed),
            queued,
            pool,
        }
    }
}
