//! The stage abstraction.
//!
//! A [`Stage`] is one processing unit in the graph: it pulls from zero or one
//! producer, optionally owns a [`FramePool`], runs its [`StageBackend`] on a
//! dedicated thread and publishes to any number of consumers and external
//! observers.
//!
//! # Lifecycle
//!
//! ```text
//! Created --init()--> Initialized --start()--> Running --stop()--> Stopped
//!    |                                                                ^
//!    +--init() fails--> Failed              (end of stream, fatal error)
//! ```
//!
//! - Linking ([`set_productor`](Stage::set_productor)) is only allowed in
//!   `Created`; rebuild the graph to change it.
//! - `init()` needs the producer to be initialized first.
//! - `stop()` is idempotent and safe on stages that never started.
//!
//! # Ownership
//!
//! A consumer holds a strong reference to its producer, the producer only a
//! weak one back, so a producer outlives everything that reads from it.
//!
//! # Example
//!
//! ```rust
//! use stagegraph::backends::{NullSink, PatternSource};
//! use stagegraph::format::{ImagePara, PixelFormat};
//! use stagegraph::stage::{Stage, StageOptions};
//!
//! let source = Stage::new(
//!     "camera",
//!     PatternSource::new(ImagePara::new(64, 48, PixelFormat::Rgb24)).with_frame_limit(5),
//! );
//! let sink = Stage::with_options("sink", NullSink::new(), StageOptions::pass_through());
//! sink.set_productor(&source).unwrap();
//!
//! source.init().unwrap();
//! sink.init().unwrap();
//! source.start_pipe().unwrap();
//! # source.stop_pipe();
//! ```

mod backend;
mod external;
mod options;
mod queue;
mod stats;
mod worker;

pub use backend::{DEFAULT_AUDIO_BLOCK, Flow, ProcessContext, StageBackend, StageKind};
pub use external::{DEFAULT_EXTERNAL_DEPTH, ExternalConsumer};
pub use options::{DEFAULT_BUFFER_COUNT, StageOptions};
pub use queue::{QueuePolicy, QueueStats};
pub use stats::StageStats;

use crate::buffer::Frame;
use crate::error::{Error, Result};
use crate::format::{ImagePara, StreamPara};
use crate::memory::{FramePool, PoolMode, PoolStats};
use crate::observability::{StageMetrics, trace_frame_produced, trace_state_change};
use crate::pipeline::Topology;
use crate::synchronize::Synchronizer;
use bytes::Bytes;
use external::ExternalSlot;
use queue::FrameQueue;
use smallvec::SmallVec;
use stats::StatCounters;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};
use std::thread::{self, JoinHandle};
use worker::{Exit, Worker};

static NEXT_STAGE_ID: AtomicU64 = AtomicU64::new(1);

/// Closure invoked once per published frame, on the stage's worker thread.
pub type OutputCallback = Arc<dyn Fn(&Frame) + Send + Sync>;

// ============================================================================
// StageState
// ============================================================================

/// Lifecycle state of a stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StageState {
    Created,
    Initialized,
    Running,
    Stopped,
    /// `init()` failed; terminal.
    Failed,
}

impl StageState {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::Initialized => "Initialized",
            Self::Running => "Running",
            Self::Stopped => "Stopped",
            Self::Failed => "Failed",
        }
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Internals
// ============================================================================

/// What `init()` settled on.
struct Negotiated {
    para: StreamPara,
    pool: Option<FramePool>,
    video_extra: Option<Bytes>,
    audio_extra: Option<Bytes>,
}

/// A consumer as seen by its producer.
struct Downstream {
    id: u64,
    stage: Weak<StageInner>,
    inbox: Arc<FrameQueue>,
}

pub(crate) struct StageInner {
    id: u64,
    name: String,
    kind: StageKind,
    options: Mutex<StageOptions>,
    sync: Mutex<Option<Arc<Synchronizer>>>,
    callback: RwLock<Option<OutputCallback>>,
    producer: Mutex<Option<Stage>>,
    consumers: Mutex<SmallVec<[Downstream; 4]>>,
    externals: Mutex<Vec<Arc<ExternalSlot>>>,
    inbox: Arc<FrameQueue>,
    state: Mutex<StageState>,
    negotiated: OnceLock<Negotiated>,
    backend: Mutex<Option<Box<dyn StageBackend>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    shutdown: AtomicBool,
    stats: StatCounters,
    last_error: Mutex<Option<String>>,
}

impl StageInner {
    fn pool(&self) -> Option<&FramePool> {
        self.negotiated.get().and_then(|n| n.pool.as_ref())
    }

    /// Negotiate, allocate the pool and run the backend's setup.
    fn initialize(&self) -> Result<()> {
        let producer = self.producer.lock().unwrap().clone();
        let input = match (producer, self.kind.has_input()) {
            (Some(producer), true) => Some(producer.output_para().map_err(|_| {
                Error::config(format!(
                    "producer '{}' of '{}' is not initialized",
                    producer.name(),
                    self.name
                ))
            })?),
            (None, true) => {
                return Err(Error::config(format!("stage '{}' has no producer", self.name)));
            }
            (Some(_), false) => {
                return Err(Error::config(format!(
                    "source stage '{}' cannot have a producer",
                    self.name
                )));
            }
            (None, false) => None,
        };

        let options = self.options.lock().unwrap().clone();
        let mut slot = self.backend.lock().unwrap();
        let backend = slot
            .as_mut()
            .ok_or_else(|| Error::InvalidState(format!("stage '{}' has no backend", self.name)))?;

        let para = backend.negotiate(input.as_ref())?;
        para.validate()?;

        let pool = if options.buffer_count > 0 {
            let size = backend.buffer_size(&para);
            if size == 0 {
                return Err(Error::config(format!(
                    "stage '{}' requests {} buffers but its output ({para}) has no size",
                    self.name, options.buffer_count
                )));
            }
            Some(FramePool::with_mode(
                &self.name,
                size,
                options.buffer_count,
                options.pool_mode,
            ))
        } else {
            None
        };

        backend.setup()?;

        self.inbox.set_policy(options.queue_policy);
        let negotiated = Negotiated {
            para,
            pool,
            video_extra: backend.video_extra_data(),
            audio_extra: backend.audio_extra_data(),
        };
        if self.negotiated.set(negotiated).is_err() {
            return Err(Error::InvalidState(format!(
                "stage '{}' is already negotiated",
                self.name
            )));
        }
        tracing::debug!(stage = %self.name, para = %para, "negotiated");
        Ok(())
    }

    /// Hand one reference to every consumer and external slot, then run the
    /// callback. The caller's reference drops on return.
    fn publish(&self, frame: Frame, frame_events: bool) {
        for consumer in self.consumers.lock().unwrap().iter() {
            consumer.inbox.push(frame.clone());
        }
        for slot in self.externals.lock().unwrap().iter() {
            if !slot.offer(frame.clone()) {
                tracing::debug!(stage = %self.name, slot = %slot.name(), "external slot full");
            }
        }
        let callback = self.callback.read().unwrap().clone();
        if let Some(callback) = callback {
            callback(&frame);
        }

        self.stats.produced();
        if frame_events {
            trace_frame_produced(&self.name, frame.active_size(), frame.sequence(), frame.pts());
        }
    }

    fn signal_eos(&self) {
        for consumer in self.consumers.lock().unwrap().iter() {
            consumer.inbox.push_eos();
        }
    }

    /// Called by the worker thread on its way out.
    fn finish_worker(&self, exit: Exit) {
        if let Exit::Failed(error) = &exit {
            *self.last_error.lock().unwrap() = Some(error.to_string());
        }
        {
            let mut state = self.state.lock().unwrap();
            if *state == StageState::Running {
                *state = StageState::Stopped;
                trace_state_change(&self.name, StageState::Running.name(), StageState::Stopped.name());
            }
        }
        self.signal_eos();
    }

    fn detach_consumer(&self, id: u64) {
        self.consumers.lock().unwrap().retain(|c| c.id != id);
    }
}

// ============================================================================
// Stage
// ============================================================================

/// Shared handle to a stage.
///
/// Cloning is cheap; all clones refer to the same stage.
#[derive(Clone)]
pub struct Stage {
    inner: Arc<StageInner>,
}

impl Stage {
    /// Create a stage with default options.
    pub fn new(name: impl Into<String>, backend: impl StageBackend) -> Self {
        Self::with_options(name, backend, StageOptions::default())
    }

    /// Create a stage with explicit options.
    pub fn with_options(
        name: impl Into<String>,
        backend: impl StageBackend,
        options: StageOptions,
    ) -> Self {
        let name = name.into();
        let kind = backend.kind();
        Self {
            inner: Arc::new(StageInner {
                id: NEXT_STAGE_ID.fetch_add(1, Ordering::Relaxed),
                stats: StatCounters::new(StageMetrics::new(&name, kind.name())),
                name,
                kind,
                options: Mutex::new(options),
                sync: Mutex::new(None),
                callback: RwLock::new(None),
                producer: Mutex::new(None),
                consumers: Mutex::new(SmallVec::new()),
                externals: Mutex::new(Vec::new()),
                inbox: Arc::new(FrameQueue::new()),
                state: Mutex::new(StageState::Created),
                negotiated: OnceLock::new(),
                backend: Mutex::new(Some(Box::new(backend))),
                worker: Mutex::new(None),
                shutdown: AtomicBool::new(false),
                last_error: Mutex::new(None),
            }),
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    #[inline]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[inline]
    pub fn kind(&self) -> StageKind {
        self.inner.kind
    }

    /// Unique id of this stage within the process.
    #[inline]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn state(&self) -> StageState {
        *self.inner.state.lock().unwrap()
    }

    /// Negotiated output description. Valid only after `init()`.
    pub fn output_para(&self) -> Result<StreamPara> {
        self.inner
            .negotiated
            .get()
            .map(|n| n.para)
            .ok_or_else(|| {
                Error::InvalidState(format!("stage '{}' is not initialized", self.inner.name))
            })
    }

    /// Negotiated output geometry. Valid only after `init()` of a video stage.
    pub fn output_image_para(&self) -> Result<ImagePara> {
        match self.output_para()? {
            StreamPara::Video(image) => Ok(image),
            other => Err(Error::InvalidState(format!(
                "stage '{}' outputs {other}, not video",
                self.inner.name
            ))),
        }
    }

    /// Codec configuration captured from the backend at `init()`.
    pub fn video_extra_data(&self) -> Option<Bytes> {
        self.inner.negotiated.get()?.video_extra.clone()
    }

    /// Audio codec configuration captured from the backend at `init()`.
    pub fn audio_extra_data(&self) -> Option<Bytes> {
        self.inner.negotiated.get()?.audio_extra.clone()
    }

    pub fn producer(&self) -> Option<Stage> {
        self.inner.producer.lock().unwrap().clone()
    }

    /// Live consumers, in link order.
    pub fn consumers(&self) -> Vec<Stage> {
        self.inner
            .consumers
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| c.stage.upgrade().map(|inner| Stage { inner }))
            .collect()
    }

    pub fn synchronizer(&self) -> Option<Arc<Synchronizer>> {
        self.inner.sync.lock().unwrap().clone()
    }

    /// The configured options.
    pub fn options(&self) -> StageOptions {
        self.inner.options.lock().unwrap().clone()
    }

    /// Pool statistics, for stages that own a pool.
    pub fn pool_stats(&self) -> Option<PoolStats> {
        self.inner.pool().map(FramePool::stats)
    }

    /// Counter snapshot.
    pub fn stats(&self) -> StageStats {
        let queue = self.inner.inbox.stats();
        self.inner
            .stats
            .snapshot(queue.total_dropped, queue.current, self.pool_stats())
    }

    /// Input queue statistics.
    pub fn queue_stats(&self) -> QueueStats {
        self.inner.inbox.stats()
    }

    /// Message of the error that stopped the worker or failed `init()`.
    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error.lock().unwrap().clone()
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    /// Link this stage after `upstream`.
    ///
    /// Only allowed before `init()`. Fails if it would create a cycle.
    /// Replaces any previous producer.
    pub fn set_productor(&self, upstream: &Stage) -> Result<()> {
        let state = self.inner.state.lock().unwrap();
        if *state != StageState::Created {
            return Err(Error::config(format!(
                "cannot link '{}' to '{}': stage is {}",
                self.inner.name, upstream.inner.name, *state
            )));
        }
        if !self.inner.kind.has_input() {
            return Err(Error::config(format!(
                "source stage '{}' cannot have a producer",
                self.inner.name
            )));
        }

        let mut cursor = Some(upstream.clone());
        while let Some(stage) = cursor {
            if Arc::ptr_eq(&stage.inner, &self.inner) {
                return Err(Error::config(format!(
                    "linking '{}' after '{}' would create a cycle",
                    self.inner.name, upstream.inner.name
                )));
            }
            cursor = stage.producer();
        }

        let mut producer = self.inner.producer.lock().unwrap();
        if let Some(previous) = producer.take() {
            previous.inner.detach_consumer(self.inner.id);
        }
        upstream.inner.consumers.lock().unwrap().push(Downstream {
            id: self.inner.id,
            stage: Arc::downgrade(&self.inner),
            inbox: self.inner.inbox.clone(),
        });
        *producer = Some(upstream.clone());

        tracing::debug!(stage = %self.inner.name, producer = %upstream.inner.name, "linked");
        Ok(())
    }

    /// Remove this stage from its producer's consumer list.
    ///
    /// Used when a stage is torn down while its producer keeps running (a
    /// shared source). Does nothing for a stage without a producer.
    pub fn unlink(&self) {
        let previous = self.inner.producer.lock().unwrap().take();
        if let Some(previous) = previous {
            previous.inner.detach_consumer(self.inner.id);
            tracing::debug!(stage = %self.inner.name, producer = %previous.inner.name, "unlinked");
        }
    }

    /// Entries on the consumer list, including ones whose stage is gone.
    #[cfg(test)]
    pub(crate) fn downstream_len(&self) -> usize {
        self.inner.consumers.lock().unwrap().len()
    }

    /// Number of buffers in the stage's own pool; 0 makes it pass-through.
    /// Takes effect at `init()`.
    pub fn set_buffer_count(&self, count: usize) {
        self.inner.options.lock().unwrap().buffer_count = count;
    }

    /// Blocking or rejecting pool. Takes effect at `init()`.
    pub fn set_pool_mode(&self, mode: PoolMode) {
        self.inner.options.lock().unwrap().pool_mode = mode;
    }

    /// Input queue policy. Takes effect at `init()`.
    pub fn set_queue_policy(&self, policy: QueuePolicy) {
        self.inner.options.lock().unwrap().queue_policy = policy;
    }

    /// Consecutive idle intervals tolerated before a timeout stop. Takes
    /// effect at `start()`.
    pub fn set_max_timeout_count(&self, count: u32) {
        self.inner.options.lock().unwrap().max_timeout_count = count;
    }

    /// Attach a clock: used for source timestamps and, on consuming stages,
    /// for presentation pacing. Takes effect at `start()`.
    pub fn set_synchronize(&self, sync: Arc<Synchronizer>) {
        *self.inner.sync.lock().unwrap() = Some(sync);
    }

    /// Run `callback` on every published frame. Replaces any earlier callback.
    pub fn set_output_data_callback<F>(&self, callback: F)
    where
        F: Fn(&Frame) + Send + Sync + 'static,
    {
        *self.inner.callback.write().unwrap() = Some(Arc::new(callback));
    }

    /// Register an external observer on this stage's output.
    pub fn add_external_consumer(&self, name: &str) -> ExternalConsumer {
        self.add_external_consumer_with_depth(name, DEFAULT_EXTERNAL_DEPTH)
    }

    /// Register an external observer holding at most `depth` frames.
    pub fn add_external_consumer_with_depth(&self, name: &str, depth: usize) -> ExternalConsumer {
        let slot = ExternalSlot::new(name, depth);
        self.inner.externals.lock().unwrap().push(slot.clone());
        ExternalConsumer::new(slot)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Negotiate the output, allocate the pool and set the backend up.
    ///
    /// The producer must already be initialized. On failure the stage moves
    /// to [`StageState::Failed`].
    pub fn init(&self) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        if *state != StageState::Created {
            return Err(Error::InvalidState(format!(
                "cannot init stage '{}': it is {}",
                self.inner.name, *state
            )));
        }

        match self.inner.initialize() {
            Ok(()) => {
                *state = StageState::Initialized;
                trace_state_change(
                    &self.inner.name,
                    StageState::Created.name(),
                    StageState::Initialized.name(),
                );
                Ok(())
            }
            Err(error) => {
                *state = StageState::Failed;
                *self.inner.last_error.lock().unwrap() = Some(error.to_string());
                tracing::warn!(stage = %self.inner.name, error = %error, "init failed");
                Err(error)
            }
        }
    }

    /// Spawn the worker thread.
    pub fn start(&self) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        match *state {
            StageState::Initialized => {}
            StageState::Running => {
                return Err(Error::InvalidState(format!(
                    "stage '{}' is already running",
                    self.inner.name
                )));
            }
            other => {
                return Err(Error::InvalidState(format!(
                    "cannot start stage '{}': it is {other}",
                    self.inner.name
                )));
            }
        }

        let negotiated = self.inner.negotiated.get().ok_or_else(|| {
            Error::InvalidState(format!("stage '{}' is not negotiated", self.inner.name))
        })?;
        let backend = self.inner.backend.lock().unwrap().take().ok_or_else(|| {
            Error::InvalidState(format!("stage '{}' has no backend", self.inner.name))
        })?;

        let worker = Worker::new(
            self.inner.clone(),
            backend,
            negotiated.para,
            negotiated.pool.clone(),
            self.synchronizer(),
        );
        let handle = thread::Builder::new()
            .name(self.inner.name.clone())
            .spawn(move || worker.run())
            .inspect_err(|_| *state = StageState::Failed)?;

        *self.inner.worker.lock().unwrap() = Some(handle);
        *state = StageState::Running;
        trace_state_change(
            &self.inner.name,
            StageState::Initialized.name(),
            StageState::Running.name(),
        );
        Ok(())
    }

    /// Halt the worker, drain queued input back to the producer's pool,
    /// release the pool and signal end-of-stream downstream.
    ///
    /// Idempotent; safe on stages that never started.
    pub fn stop(&self) {
        let previous = {
            let mut state = self.inner.state.lock().unwrap();
            let previous = *state;
            if previous != StageState::Failed {
                *state = StageState::Stopped;
            }
            previous
        };

        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.inbox.set_flushing();
        if let Some(pool) = self.inner.pool() {
            pool.close();
        }

        let handle = self.inner.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                tracing::warn!(stage = %self.inner.name, "stop() called from the stage's own worker");
            } else if handle.join().is_err() {
                tracing::error!(stage = %self.inner.name, "worker panicked");
            }
        }

        // A stage that never started still owns its backend.
        if let Some(mut backend) = self.inner.backend.lock().unwrap().take() {
            if previous == StageState::Initialized {
                backend.teardown();
            }
        }

        let drained = self.inner.inbox.drain();
        let cleared: usize = self
            .inner
            .externals
            .lock()
            .unwrap()
            .iter()
            .map(|slot| slot.clear())
            .sum();
        self.inner.signal_eos();

        if !matches!(previous, StageState::Stopped | StageState::Failed) {
            trace_state_change(&self.inner.name, previous.name(), StageState::Stopped.name());
            tracing::debug!(stage = %self.inner.name, drained, cleared, "stopped");
        }
    }

    // ========================================================================
    // Whole-pipe operations
    // ========================================================================

    /// Start every stage reachable downstream of this one, consumers first.
    ///
    /// Stages already running (a shared source) are left alone. If a start
    /// fails, the stages started by this call are stopped again.
    pub fn start_pipe(&self) -> Result<()> {
        let order = Topology::from_root(self).start_order();
        let mut started: Vec<Stage> = Vec::new();
        for stage in order {
            if stage.state() == StageState::Running {
                continue;
            }
            if let Err(error) = stage.start() {
                for stage in started.iter().rev() {
                    stage.stop();
                }
                return Err(error);
            }
            started.push(stage);
        }
        Ok(())
    }

    /// Stop every stage reachable downstream of this one, producers first.
    pub fn stop_pipe(&self) {
        for stage in Topology::from_root(self).stop_order() {
            stage.stop();
        }
    }

    /// Render the topology below this stage as a tree.
    pub fn dump_pipe(&self) -> String {
        Topology::from_root(self).render_tree()
    }

    /// Render per-stage counters and pool usage for the topology below this
    /// stage.
    pub fn dump_pipe_summary(&self) -> String {
        Topology::from_root(self).render_summary()
    }
}

impl PartialEq for Stage {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Stage {}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.inner.name)
            .field("kind", &self.inner.kind)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{NullSink, PatternSource};
    use crate::format::PixelFormat;
    use std::time::Duration;

    fn source(frames: u64) -> Stage {
        Stage::new(
            "src",
            PatternSource::new(ImagePara::new(16, 8, PixelFormat::Gray8)).with_frame_limit(frames),
        )
    }

    fn wait_for(mut done: impl FnMut() -> bool) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(std::time::Instant::now() < deadline, "timed out");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_lifecycle_states() {
        let stage = source(1);
        assert_eq!(stage.state(), StageState::Created);
        assert!(stage.output_para().is_err());
        assert!(matches!(stage.start(), Err(Error::InvalidState(_))));

        stage.init().unwrap();
        assert_eq!(stage.state(), StageState::Initialized);
        assert!(matches!(stage.init(), Err(Error::InvalidState(_))));
        assert_eq!(stage.output_image_para().unwrap().width, 16);

        stage.start().unwrap();
        stage.stop();
        assert_eq!(stage.state(), StageState::Stopped);
        stage.stop();
        assert_eq!(stage.state(), StageState::Stopped);
        assert!(stage.start().is_err());
    }

    #[test]
    fn test_stop_never_started() {
        let stage = source(1);
        stage.stop();
        assert_eq!(stage.state(), StageState::Stopped);

        let stage = source(1);
        stage.init().unwrap();
        stage.stop();
        assert_eq!(stage.state(), StageState::Stopped);
    }

    #[test]
    fn test_start_twice() {
        let stage = source(0);
        stage.init().unwrap();
        stage.start().unwrap();
        assert!(matches!(stage.start(), Err(Error::InvalidState(_))));
        stage.stop();
    }

    #[test]
    fn test_link_rules() {
        let src = source(1);
        let a = Stage::with_options("a", NullSink::new(), StageOptions::pass_through());
        let b = Stage::with_options("b", NullSink::new(), StageOptions::pass_through());

        // Sources take no producer.
        assert!(src.set_productor(&a).is_err());

        a.set_productor(&src).unwrap();
        b.set_productor(&a).unwrap();
        // a -> b -> a would loop.
        assert!(a.set_productor(&b).is_err());
        assert!(a.set_productor(&a).is_err());

        assert_eq!(src.consumers(), vec![a.clone()]);
        assert_eq!(b.producer(), Some(a.clone()));

        src.init().unwrap();
        a.init().unwrap();
        let c = Stage::with_options("c", NullSink::new(), StageOptions::pass_through());
        assert!(a.set_productor(&src).is_err());
        c.set_productor(&a).unwrap();
    }

    #[test]
    fn test_unlink_detaches_from_producer() {
        let src = source(1);
        let a = Stage::with_options("a", NullSink::new(), StageOptions::pass_through());
        let b = Stage::with_options("b", NullSink::new(), StageOptions::pass_through());
        a.set_productor(&src).unwrap();
        b.set_productor(&src).unwrap();
        assert_eq!(src.downstream_len(), 2);

        a.unlink();
        assert!(a.producer().is_none());
        assert_eq!(src.downstream_len(), 1);
        assert_eq!(src.consumers(), vec![b.clone()]);

        // Already unlinked; nothing left to remove.
        a.unlink();
        assert_eq!(src.downstream_len(), 1);
    }

    #[test]
    fn test_init_requires_initialized_producer() {
        let src = source(1);
        let sink = Stage::with_options("sink", NullSink::new(), StageOptions::pass_through());
        sink.set_productor(&src).unwrap();

        assert!(matches!(sink.init(), Err(Error::Configuration(_))));
        assert_eq!(sink.state(), StageState::Failed);
        assert!(sink.last_error().is_some());
        assert!(sink.start().is_err());
    }

    #[test]
    fn test_consumer_without_producer_fails() {
        let sink = Stage::with_options("sink", NullSink::new(), StageOptions::pass_through());
        assert!(sink.init().is_err());
        assert_eq!(sink.state(), StageState::Failed);
    }

    #[test]
    fn test_eos_stops_chain() {
        let src = source(3);
        let sink_backend = NullSink::new();
        let counter = sink_backend.counter();
        let sink = Stage::with_options("sink", sink_backend, StageOptions::pass_through());
        sink.set_productor(&src).unwrap();
        src.init().unwrap();
        sink.init().unwrap();
        src.start_pipe().unwrap();

        wait_for(|| sink.state() == StageState::Stopped);
        assert_eq!(src.state(), StageState::Stopped);
        assert_eq!(counter.load(Ordering::Relaxed), 3);
        assert_eq!(src.stats().produced, 3);
        assert_eq!(sink.stats().consumed, 3);

        src.stop_pipe();
        assert_eq!(src.pool_stats().unwrap().free, DEFAULT_BUFFER_COUNT);
    }

    #[test]
    fn test_output_callback_and_external() {
        let src = source(4);
        let seen = Arc::new(AtomicU64::new(0));
        let s = seen.clone();
        src.set_output_data_callback(move |_frame| {
            s.fetch_add(1, Ordering::Relaxed);
        });
        let observer = src.add_external_consumer("tap");

        src.init().unwrap();
        src.start().unwrap();

        let mut received = 0;
        while received < 4 {
            assert!(observer.wait(Duration::from_secs(5)));
            let frame = observer.get_output_buffer().unwrap();
            assert_eq!(frame.sequence(), received);
            drop(frame);
            observer.consume_buffer();
            received += 1;
        }

        wait_for(|| src.state() == StageState::Stopped);
        assert_eq!(seen.load(Ordering::Relaxed), 4);
        src.stop();
        assert_eq!(src.pool_stats().unwrap().in_flight, 0);
    }
}
