//! Tracing integration for structured logging and spans.

use tracing::{Level, Span, span};

/// Configuration for tracing behavior.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Whether to create a span around pipeline assembly.
    pub pipeline_spans: bool,
    /// Whether stage workers run inside a stage span.
    pub stage_spans: bool,
    /// Whether to emit an event per published frame.
    pub frame_events: bool,
    /// Default span level.
    pub level: Level,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            pipeline_spans: true,
            stage_spans: true,
            frame_events: false, // one event per frame per stage
            level: Level::INFO,
        }
    }
}

impl TracingConfig {
    /// Everything enabled.
    pub fn all() -> Self {
        Self {
            pipeline_spans: true,
            stage_spans: true,
            frame_events: true,
            level: Level::DEBUG,
        }
    }

    /// Create a minimal config (pipeline spans only).
    pub fn minimal() -> Self {
        Self {
            pipeline_spans: true,
            stage_spans: false,
            frame_events: false,
            level: Level::INFO,
        }
    }

    /// Disable all spans.
    pub fn none() -> Self {
        Self {
            pipeline_spans: false,
            stage_spans: false,
            frame_events: false,
            level: Level::INFO,
        }
    }
}

/// Create a span for one assembled pipeline instance.
///
/// # Example
///
/// ```rust
/// use stagegraph::observability::span_pipeline;
///
/// let span = span_pipeline("camera-0");
/// let _guard = span.enter();
/// ```
#[inline]
pub fn span_pipeline(name: &str) -> Span {
    span!(Level::INFO, "pipeline", name = %name)
}

/// Create the span a stage worker runs in.
#[inline]
pub fn span_stage(stage: &str, kind: &str) -> Span {
    span!(Level::DEBUG, "stage", stage = %stage, kind = %kind)
}

/// Log a frame published by a stage.
#[inline]
pub fn trace_frame_produced(stage: &str, size: usize, sequence: u64, pts: Option<i64>) {
    tracing::trace!(
        stage = %stage,
        size = size,
        sequence = sequence,
        pts = ?pts,
        "frame produced"
    );
}

/// Log a frame pulled from a producer.
#[inline]
pub fn trace_frame_consumed(stage: &str, size: usize, sequence: u64) {
    tracing::trace!(
        stage = %stage,
        size = size,
        sequence = sequence,
        "frame consumed"
    );
}

/// Log a dropped frame.
#[inline]
pub fn trace_frame_dropped(stage: &str, sequence: u64, reason: &str) {
    tracing::debug!(
        stage = %stage,
        sequence = sequence,
        reason = %reason,
        "frame dropped"
    );
}

/// Log an error.
#[inline]
pub fn trace_error(stage: &str, error: &dyn std::error::Error) {
    tracing::error!(
        stage = %stage,
        error = %error,
        "processing error"
    );
}

/// Log end-of-stream.
#[inline]
pub fn trace_eos(stage: &str) {
    tracing::info!(stage = %stage, "end of stream");
}

/// Log a stage state change.
#[inline]
pub fn trace_state_change(stage: &str, from: &str, to: &str) {
    tracing::info!(
        stage = %stage,
        from = %from,
        to = %to,
        "stage state changed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracing_config_presets() {
        let config = TracingConfig::default();
        assert!(config.pipeline_spans && config.stage_spans);
        assert!(!config.frame_events);

        let config = TracingConfig::all();
        assert!(config.frame_events);
        assert_eq!(config.level, Level::DEBUG);

        let config = TracingConfig::minimal();
        assert!(config.pipeline_spans && !config.stage_spans);

        let config = TracingConfig::none();
        assert!(!config.pipeline_spans && !config.stage_spans && !config.frame_events);
    }

    #[test]
    fn test_trace_functions() {
        // These should not panic even without a subscriber
        let _guard = span_pipeline("test").entered();
        let _stage = span_stage("src", "source").entered();
        trace_frame_produced("src", 100, 0, Some(0));
        trace_frame_consumed("sink", 100, 0);
        trace_frame_dropped("sink", 1, "late");
        trace_error("sink", &crate::error::Error::backend("bad frame"));
        trace_eos("src");
        trace_state_change("src", "Initialized", "Running");
    }
}
