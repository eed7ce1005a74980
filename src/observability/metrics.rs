//! Metrics collection using metrics-rs.

use metrics::{Counter, Histogram, Unit, counter, gauge, histogram};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Whether metrics have been initialized.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

// Metric names as constants for consistency
const BUFFERS_PRODUCED: &str = "stagegraph_buffers_produced";
const BUFFERS_CONSUMED: &str = "stagegraph_buffers_consumed";
const BUFFERS_DROPPED: &str = "stagegraph_buffers_dropped";
const STAGE_ERRORS: &str = "stagegraph_errors";
const PROCESSING_TIME_NS: &str = "stagegraph_processing_time_ns";
const POOL_FREE: &str = "stagegraph_pool_free";

/// Initialize metrics descriptions.
///
/// Call this once at application startup, after installing a recorder.
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    metrics::describe_counter!(
        BUFFERS_PRODUCED,
        Unit::Count,
        "Buffers published by a stage"
    );
    metrics::describe_counter!(
        BUFFERS_CONSUMED,
        Unit::Count,
        "Buffers pulled from a stage's producer"
    );
    metrics::describe_counter!(
        BUFFERS_DROPPED,
        Unit::Count,
        "Buffers dropped (backend error, late frame, rejected acquisition, queue overflow)"
    );
    metrics::describe_counter!(STAGE_ERRORS, Unit::Count, "Backend errors reported by a stage");
    metrics::describe_histogram!(
        PROCESSING_TIME_NS,
        Unit::Nanoseconds,
        "Time spent in a backend's process call"
    );
    metrics::describe_gauge!(POOL_FREE, Unit::Count, "Free buffers in a stage's pool");
}

/// Record the free buffer count of a pool.
#[inline]
pub fn record_pool_free(pool: &str, free: usize) {
    gauge!(POOL_FREE, "pool" => pool.to_string()).set(free as f64);
}

/// Metric handles for one stage, labeled with its name and kind.
#[derive(Clone)]
pub struct StageMetrics {
    stage: String,
    produced: Counter,
    consumed: Counter,
    dropped: Counter,
    errors: Counter,
    processing_time: Histogram,
}

impl StageMetrics {
    /// Register the handles for a stage.
    pub fn new(stage: &str, kind: &str) -> Self {
        Self {
            stage: stage.to_string(),
            produced: counter!(BUFFERS_PRODUCED, "stage" => stage.to_string(), "kind" => kind.to_string()),
            consumed: counter!(BUFFERS_CONSUMED, "stage" => stage.to_string(), "kind" => kind.to_string()),
            dropped: counter!(BUFFERS_DROPPED, "stage" => stage.to_string(), "kind" => kind.to_string()),
            errors: counter!(STAGE_ERRORS, "stage" => stage.to_string(), "kind" => kind.to_string()),
            processing_time: histogram!(
                PROCESSING_TIME_NS,
                "stage" => stage.to_string(),
                "kind" => kind.to_string()
            ),
        }
    }

    #[inline]
    pub fn record_produced(&self) {
        self.produced.increment(1);
    }

    #[inline]
    pub fn record_consumed(&self) {
        self.consumed.increment(1);
    }

    #[inline]
    pub fn record_dropped(&self) {
        self.dropped.increment(1);
    }

    #[inline]
    pub fn record_error(&self) {
        self.errors.increment(1);
    }

    /// Record processing time.
    #[inline]
    pub fn record_time(&self, duration: Duration) {
        self.processing_time.record(duration.as_nanos() as f64);
    }

    /// Start a timer and return a guard that records on drop.
    pub fn start_timer(&self) -> TimerGuard<'_> {
        TimerGuard {
            start: Instant::now(),
            metrics: self,
        }
    }

    /// The stage label.
    pub fn stage(&self) -> &str {
        &self.stage
    }
}

impl std::fmt::Debug for StageMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageMetrics").field("stage", &self.stage).finish()
    }
}

/// Guard that records processing time when dropped.
pub struct TimerGuard<'a> {
    start: Instant,
    metrics: &'a StageMetrics,
}

impl Drop for TimerGuard<'_> {
    fn drop(&mut self) {
        self.metrics.record_time(self.start.elapsed());
    }
}
