//! Per-stage configuration.

use super::queue::QueuePolicy;
use crate::memory::PoolMode;
use crate::observability::TracingConfig;

/// Pool size used when a stage is created without options.
pub const DEFAULT_BUFFER_COUNT: usize = 4;

/// Settings read by a stage at `init()` and `start()`.
#[derive(Debug, Clone)]
pub struct StageOptions {
    /// Number of buffers in the stage's own pool.
    ///
    /// 0 makes the stage pass-through: it publishes its input or consumes it.
    pub buffer_count: usize,

    /// What an exhausted pool does.
    pub pool_mode: PoolMode,

    /// How the stage's input queue handles a backlog.
    pub queue_policy: QueuePolicy,

    /// Consecutive idle intervals a source tolerates before stopping with a
    /// timeout. 0 disables the limit.
    pub max_timeout_count: u32,

    /// Span and event settings for the worker.
    pub tracing: TracingConfig,
}

impl Default for StageOptions {
    fn default() -> Self {
        Self {
            buffer_count: DEFAULT_BUFFER_COUNT,
            pool_mode: PoolMode::Block,
            queue_policy: QueuePolicy::Unbounded,
            max_timeout_count: 0,
            tracing: TracingConfig::default(),
        }
    }
}

impl StageOptions {
    /// Options for a pass-through stage (no pool).
    pub fn pass_through() -> Self {
        Self {
            buffer_count: 0,
            ..Default::default()
        }
    }

    pub fn with_buffer_count(mut self, buffer_count: usize) -> Self {
        self.buffer_count = buffer_count;
        self
    }

    pub fn with_pool_mode(mut self, pool_mode: PoolMode) -> Self {
        self.pool_mode = pool_mode;
        self
    }

    pub fn with_queue_policy(mut self, queue_policy: QueuePolicy) -> Self {
        self.queue_policy = queue_policy;
        self
    }

    pub fn with_max_timeout_count(mut self, max_timeout_count: u32) -> Self {
        self.max_timeout_count = max_timeout_count;
        self
    }

    pub fn with_tracing(mut self, tracing: TracingConfig) -> Self {
        self.tracing = tracing;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = StageOptions::default();
        assert_eq!(options.buffer_count, DEFAULT_BUFFER_COUNT);
        assert_eq!(options.pool_mode, PoolMode::Block);
        assert_eq!(options.max_timeout_count, 0);
        assert_eq!(StageOptions::pass_through().buffer_count, 0);
    }

    #[test]
    fn test_builder() {
        let options = StageOptions::default()
            .with_buffer_count(2)
            .with_pool_mode(PoolMode::Reject)
            .with_queue_policy(QueuePolicy::DropOldest(1))
            .with_max_timeout_count(50);
        assert_eq!(options.buffer_count, 2);
        assert_eq!(options.pool_mode, PoolMode::Reject);
        assert_eq!(options.queue_policy, QueuePolicy::DropOldest(1));
        assert_eq!(options.max_timeout_count, 50);
    }
}
