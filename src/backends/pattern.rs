//! Synthetic raw-video source.
//!
//! Generates frames without any capture hardware, for exercising graphs in
//! tests and on the bench.

use crate::error::{Error, Result};
use crate::format::{ImagePara, MediaType, StreamPara};
use crate::stage::{Flow, ProcessContext, StageBackend, StageKind};
use crate::synchronize::SynchronizeType;
use std::time::{Duration, Instant};

/// What the generated frames look like.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Pattern {
    /// All zeros.
    Black,
    /// Incrementing bytes (0, 1, 2, ..., 255, 0, 1, ...).
    #[default]
    Counter,
    /// Every byte set to the low byte of the frame's sequence number.
    Sequence,
    /// Vertical bars, eight across the frame.
    Bars,
}

/// A source stage backend producing raw video frames.
///
/// # Example
///
/// ```rust
/// use stagegraph::backends::{Pattern, PatternSource};
/// use stagegraph::format::{ImagePara, PixelFormat};
///
/// // 100 frames of NV12 color bars at 30 fps.
/// let source = PatternSource::new(ImagePara::new(640, 480, PixelFormat::Nv12))
///     .with_pattern(Pattern::Bars)
///     .with_frame_rate(30)
///     .with_frame_limit(100);
/// ```
pub struct PatternSource {
    para: ImagePara,
    pattern: Pattern,
    frame_limit: Option<u64>,
    frame_interval: Option<Duration>,
    produced: u64,
    next_deadline: Option<Instant>,
}

impl PatternSource {
    /// Free-running, unlimited source of `para` frames.
    pub fn new(para: ImagePara) -> Self {
        Self {
            para,
            pattern: Pattern::default(),
            frame_limit: None,
            frame_interval: None,
            produced: 0,
            next_deadline: None,
        }
    }

    pub fn with_pattern(mut self, pattern: Pattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// Stop with end-of-stream after `limit` frames.
    pub fn with_frame_limit(mut self, limit: u64) -> Self {
        self.frame_limit = Some(limit);
        self
    }

    /// Pace output to `fps` frames per second. 0 means free-running.
    pub fn with_frame_rate(mut self, fps: u32) -> Self {
        self.frame_interval = (fps > 0).then(|| Duration::from_micros(1_000_000 / fps as u64));
        self
    }

    /// Frames handed to the stage so far.
    pub fn frames_produced(&self) -> u64 {
        self.produced
    }

    fn pace(&mut self) {
        let Some(interval) = self.frame_interval else {
            return;
        };
        let now = Instant::now();
        match self.next_deadline {
            Some(deadline) if deadline > now => {
                std::thread::sleep(deadline - now);
                self.next_deadline = Some(deadline + interval);
            }
            _ => self.next_deadline = Some(now + interval),
        }
    }

    fn fill(&self, data: &mut [u8]) {
        match self.pattern {
            Pattern::Black => data.fill(0),
            Pattern::Counter => {
                for (i, byte) in data.iter_mut().enumerate() {
                    *byte = i as u8;
                }
            }
            Pattern::Sequence => data.fill(self.produced as u8),
            Pattern::Bars => {
                let row = self.para.hstride.max(1) as usize;
                let bar = (row / 8).max(1);
                for (i, byte) in data.iter_mut().enumerate() {
                    *byte = ((i % row) / bar * 32) as u8;
                }
            }
        }
    }
}

impl StageBackend for PatternSource {
    fn kind(&self) -> StageKind {
        StageKind::Source
    }

    fn negotiate(&mut self, input: Option<&StreamPara>) -> Result<StreamPara> {
        if input.is_some() {
            return Err(Error::config("pattern source takes no input"));
        }
        if self.para.format.is_compressed() {
            return Err(Error::config(format!(
                "pattern source cannot generate {}",
                self.para.format
            )));
        }
        Ok(StreamPara::Video(self.para))
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> Result<Flow> {
        if self.frame_limit.is_some_and(|limit| self.produced >= limit) {
            return Ok(Flow::Eos);
        }
        self.pace();

        let timestamp = ctx
            .synchronizer()
            .map(|sync| sync.clock_time(&sync.clock(SynchronizeType::Absolute)));
        let duration = self.frame_interval.map_or(0, |d| d.as_micros() as i64);

        let size = self.para.frame_size();
        let Some(output) = ctx.output() else {
            // Rejecting pool with nothing free: this frame is lost.
            self.produced += 1;
            return Ok(Flow::Skip);
        };
        if output.capacity() < size {
            return Err(Error::fatal(format!(
                "buffer of {} bytes cannot hold a {size} byte frame",
                output.capacity()
            )));
        }

        self.fill(&mut output.data_mut()[..size]);
        output.set_len(size);
        let meta = output.meta_mut();
        meta.media_type = MediaType::Video;
        meta.image = Some(self.para);
        meta.keyframe = true;
        meta.duration = duration;
        meta.pts = timestamp.or_else(|| {
            self.frame_interval
                .map(|_| self.produced as i64 * duration)
        });

        self.produced += 1;
        Ok(Flow::Ready)
    }
}
