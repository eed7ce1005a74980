//! Observability features: metrics and tracing.
//!
//! - **Metrics**: Counters, gauges, and histograms via `metrics-rs`
//! - **Tracing**: Structured logging and spans via `tracing`
//!
//! ## Metrics
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `stagegraph_buffers_produced` | Counter | Buffers published by a stage |
//! | `stagegraph_buffers_consumed` | Counter | Buffers pulled from a producer |
//! | `stagegraph_buffers_dropped` | Counter | Buffers dropped |
//! | `stagegraph_errors` | Counter | Backend errors |
//! | `stagegraph_processing_time_ns` | Histogram | Backend processing time per buffer |
//! | `stagegraph_pool_free` | Gauge | Free buffers in a stage pool |
//!
//! Every counter also has an in-process twin in [`StageStats`](crate::stage::StageStats),
//! which is what [`dump_pipe_summary`](crate::stage::Stage::dump_pipe_summary)
//! renders, so diagnostics work without an exporter.
//!
//! ## Tracing
//!
//! The library never installs a subscriber. Stage workers run inside a
//! `stage` span; assembly runs inside a `pipeline` span.

mod metrics;
mod tracing_support;

pub use metrics::{StageMetrics, TimerGuard, init_metrics, record_pool_free};
pub use tracing_support::{
    TracingConfig, span_pipeline, span_stage, trace_eos, trace_error, trace_frame_consumed,
    trace_frame_dropped, trace_frame_produced, trace_state_change,
};
