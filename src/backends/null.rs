//! Terminal stage that counts and discards frames.

use crate::error::{Error, Result};
use crate::format::StreamPara;
use crate::stage::{Flow, ProcessContext, StageBackend, StageKind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// A sink that discards every frame it consumes.
///
/// Useful for:
/// - terminating a branch in tests and benchmarks
/// - standing in for a display or network stage without the hardware
/// - forwarding frames unchanged (see [`forwarding`](Self::forwarding))
///
/// # Example
///
/// ```rust
/// use stagegraph::backends::NullSink;
/// use std::sync::atomic::Ordering;
///
/// let sink = NullSink::new();
/// let count = sink.counter();
/// // ... hand `sink` to a stage and run it ...
/// assert_eq!(count.load(Ordering::Relaxed), 0);
/// ```
pub struct NullSink {
    kind: StageKind,
    forward: bool,
    delay: Option<Duration>,
    count: Arc<AtomicU64>,
}

impl NullSink {
    pub fn new() -> Self {
        Self {
            kind: StageKind::Sink,
            forward: false,
            delay: None,
            count: Arc::new(AtomicU64::new(0)),
        }
    }

    /// A sink that republishes its input unchanged.
    pub fn forwarding() -> Self {
        Self {
            forward: true,
            ..Self::new()
        }
    }

    /// Report a different role, e.g. to stand in for a display.
    pub fn with_kind(mut self, kind: StageKind) -> Self {
        self.kind = kind;
        self
    }

    /// Sleep this long per frame, to simulate a slow consumer.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Shared count of frames seen, readable after the sink moves into a
    /// stage.
    pub fn counter(&self) -> Arc<AtomicU64> {
        self.count.clone()
    }
}

impl Default for NullSink {
    fn default() -> Self {
        Self::new()
    }
}

impl StageBackend for NullSink {
    fn kind(&self) -> StageKind {
        self.kind
    }

    fn negotiate(&mut self, input: Option<&StreamPara>) -> Result<StreamPara> {
        input
            .copied()
            .ok_or_else(|| Error::config("null sink needs a producer"))
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> Result<Flow> {
        if ctx.input().is_none() {
            return Ok(Flow::Skip);
        }
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        Ok(if self.forward {
            Flow::Forward
        } else {
            Flow::Consumed
        })
    }
}
