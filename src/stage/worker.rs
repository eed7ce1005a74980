//! The per-stage worker loop.
//!
//! One OS thread per running stage. Each iteration:
//!
//! 1. acquire a free buffer from the stage's pool (blocking or rejecting)
//! 2. pull the next input from the producer
//! 3. run the backend
//! 4. stamp the output's timestamp and sequence number
//! 5. publish to every consumer and external slot, run the callback
//!
//! The working references drop at the end of the iteration.

use super::StageInner;
use super::backend::{Flow, ProcessContext, StageBackend};
use super::queue::Pulled;
use crate::buffer::{Frame, PooledFrame};
use crate::error::Error;
use crate::format::{MediaType, StreamPara};
use crate::memory::FramePool;
use crate::observability::{
    span_stage, trace_eos, trace_error, trace_frame_consumed, trace_frame_dropped,
};
use crate::synchronize::{SyncAction, SynchronizeType, Synchronizer};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tracing::Span;

/// Slice used when holding a frame, so a stop request is noticed quickly.
const HOLD_SLICE: Duration = Duration::from_millis(10);

/// Why the loop ended.
pub(crate) enum Exit {
    /// `stop()` was called.
    Shutdown,
    /// The backend or the producer reached end-of-stream.
    Eos,
    /// Fatal backend error, protocol error or inactivity timeout.
    Failed(Error),
}

pub(crate) struct Worker {
    stage: Arc<StageInner>,
    backend: Box<dyn StageBackend>,
    para: StreamPara,
    pool: Option<FramePool>,
    sync: Option<Arc<Synchronizer>>,
    max_timeout_count: u32,
    stage_span: bool,
    frame_events: bool,
    started: Instant,
    sequence: u64,
    idle: u32,
}

impl Worker {
    pub(crate) fn new(
        stage: Arc<StageInner>,
        backend: Box<dyn StageBackend>,
        para: StreamPara,
        pool: Option<FramePool>,
        sync: Option<Arc<Synchronizer>>,
    ) -> Self {
        let options = stage.options.lock().unwrap().clone();
        Self {
            stage,
            backend,
            para,
            pool,
            sync,
            max_timeout_count: options.max_timeout_count,
            stage_span: options.tracing.stage_spans,
            frame_events: options.tracing.frame_events,
            started: Instant::now(),
            sequence: 0,
            idle: 0,
        }
    }

    pub(crate) fn run(mut self) {
        let span = if self.stage_span {
            span_stage(&self.stage.name, self.stage.kind.name())
        } else {
            Span::none()
        };
        let _guard = span.enter();
        tracing::debug!(para = %self.para, "worker started");

        let exit = loop {
            if let ControlFlow::Break(exit) = self.step() {
                break exit;
            }
        };

        self.backend.teardown();
        match &exit {
            Exit::Shutdown => tracing::debug!("worker stopped"),
            Exit::Eos => trace_eos(&self.stage.name),
            Exit::Failed(error) => trace_error(&self.stage.name, error),
        }
        self.stage.finish_worker(exit);
    }

    fn step(&mut self) -> ControlFlow<Exit> {
        if self.stage.shutdown.load(Ordering::Acquire) {
            return ControlFlow::Break(Exit::Shutdown);
        }

        let mut output = match &self.pool {
            None => None,
            Some(pool) => match pool.acquire() {
                Ok(buffer) => Some(buffer),
                Err(Error::PoolClosed(_)) => return ControlFlow::Break(Exit::Shutdown),
                // Rejecting pool: the backend sees no output buffer.
                Err(_) => None,
            },
        };
        let rejected = self.pool.is_some() && output.is_none();

        let mut input = if self.stage.kind.has_input() {
            match self.stage.inbox.pop(None) {
                Pulled::Frame(frame) => {
                    self.stage.stats.consumed();
                    if self.frame_events {
                        trace_frame_consumed(&self.stage.name, frame.active_size(), frame.sequence());
                    }
                    Some(frame)
                }
                Pulled::Eos => return ControlFlow::Break(Exit::Eos),
                Pulled::Flushing => return ControlFlow::Break(Exit::Shutdown),
                Pulled::Empty => return ControlFlow::Continue(()),
            }
        } else {
            None
        };

        if let (Some(sync), Some(frame)) = (self.sync.clone(), input.as_ref()) {
            if !self.pace(&sync, frame) {
                self.drop_frame(frame.sequence(), "late");
                return ControlFlow::Continue(());
            }
        }

        let result = {
            let _timer = self.stage.stats.metrics().start_timer();
            let mut ctx = ProcessContext {
                input: input.as_ref(),
                output: output.as_mut(),
                para: &self.para,
                sequence: self.sequence,
                sync: self.sync.as_deref(),
            };
            self.backend.process(&mut ctx)
        };

        if !matches!(result, Ok(Flow::Idle)) {
            self.idle = 0;
        }

        match result {
            Ok(Flow::Ready) => match output.take() {
                Some(mut buffer) => {
                    self.stamp(&mut buffer, input.as_ref());
                    self.stage.publish(buffer.into_shared(), self.frame_events);
                }
                None => {
                    tracing::warn!("backend reported output without an output buffer");
                    self.drop_frame(self.sequence, "no buffer");
                }
            },
            Ok(Flow::Forward) => match input.take() {
                Some(frame) => self.stage.publish(frame, self.frame_events),
                None => self.drop_frame(self.sequence, "nothing to forward"),
            },
            Ok(Flow::Consumed) => {}
            Ok(Flow::Skip) => {
                let sequence = input.as_ref().map_or(self.sequence, Frame::sequence);
                self.drop_frame(sequence, if rejected { "no buffer" } else { "skipped" });
            }
            Ok(Flow::Idle) => {
                self.idle += 1;
                if self.max_timeout_count > 0 && self.idle > self.max_timeout_count {
                    return ControlFlow::Break(Exit::Failed(Error::Timeout(format!(
                        "stage '{}' saw no data for {} intervals",
                        self.stage.name, self.idle
                    ))));
                }
            }
            Ok(Flow::Eos) => return ControlFlow::Break(Exit::Eos),
            Err(error) if !error.is_fatal() => {
                self.stage.stats.error();
                tracing::warn!(error = %error, "frame dropped after backend error");
                let sequence = input.as_ref().map_or(self.sequence, Frame::sequence);
                self.drop_frame(sequence, "backend error");
            }
            Err(error) => {
                self.stage.stats.error();
                return ControlFlow::Break(Exit::Failed(error));
            }
        }

        ControlFlow::Continue(())
    }

    /// Apply the clock to an input frame. Returns false if it should be dropped.
    fn pace(&self, sync: &Synchronizer, frame: &Frame) -> bool {
        let Some(pts) = frame.pts() else {
            return true;
        };

        match frame.media_type() {
            MediaType::Video => {
                let delay = sync.update_video(pts, frame.duration());
                match Synchronizer::decide(delay, frame.duration()) {
                    SyncAction::Emit => true,
                    SyncAction::Hold(wait) => {
                        self.hold(wait);
                        true
                    }
                    SyncAction::Drop => false,
                }
            }
            MediaType::Audio => {
                if let Some(audio) = frame.audio_para() {
                    sync.update_audio_by_bytes_size(
                        frame.active_size() as u32,
                        audio.sample_rate,
                        audio.channels as u32,
                        audio.sample_format.bits_per_sample(),
                        pts,
                    );
                }
                true
            }
            MediaType::Other => true,
        }
    }

    /// Sleep for `wait`, returning early on stop.
    fn hold(&self, wait: Duration) {
        let deadline = Instant::now() + wait;
        loop {
            if self.stage.shutdown.load(Ordering::Acquire) {
                return;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return;
            }
            std::thread::sleep(remaining.min(HOLD_SLICE));
        }
    }

    /// Fill in what the backend left unset: sequence, geometry, timestamp.
    fn stamp(&mut self, buffer: &mut PooledFrame, input: Option<&Frame>) {
        let meta = buffer.meta_mut();
        meta.sequence = self.sequence;
        self.sequence += 1;

        match &self.para {
            StreamPara::Video(image) => {
                meta.media_type = MediaType::Video;
                meta.image.get_or_insert(*image);
            }
            StreamPara::Audio(audio) => {
                meta.media_type = MediaType::Audio;
                meta.audio.get_or_insert(*audio);
            }
            StreamPara::Opaque => {}
        }

        if let Some(input) = input {
            if meta.pts.is_none() {
                meta.pts = input.pts();
            }
            if meta.duration == 0 {
                meta.duration = input.duration();
            }
        }

        if meta.pts.is_none() {
            meta.pts = Some(match &self.sync {
                Some(sync) => sync.clock_time(&sync.clock(SynchronizeType::Absolute)),
                None => self.started.elapsed().as_micros() as i64,
            });
        }
    }

    fn drop_frame(&self, sequence: u64, reason: &str) {
        self.stage.stats.dropped();
        trace_frame_dropped(&self.stage.name, sequence, reason);
    }
}
