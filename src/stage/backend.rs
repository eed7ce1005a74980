//! Stage backend contract.
//!
//! A [`Stage`](super::Stage) owns the graph plumbing (pool, input queue,
//! worker thread, publishing) and delegates the actual work to a
//! [`StageBackend`]. Hardware codecs, the 2D accelerator, display planes and
//! network servers all plug in here; the graph never looks at the concrete
//! backend type.

use crate::buffer::{Frame, PooledFrame};
use crate::error::Result;
use crate::format::StreamPara;
use crate::synchronize::Synchronizer;
use bytes::Bytes;
use std::fmt;

/// Number of audio sample frames a default audio buffer holds.
pub const DEFAULT_AUDIO_BLOCK: usize = 1024;

// ============================================================================
// StageKind
// ============================================================================

/// The closed set of stage roles.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StageKind {
    /// Camera, file reader or network client; has no producer.
    Source,
    /// Compressed video to raw frames.
    Decoder,
    /// Scale, rotate, mirror or convert raw frames.
    Transform,
    /// Raw frames to compressed video.
    Encoder,
    /// Presents frames on a display plane.
    Display,
    /// Writes payloads to a file.
    FileWriter,
    /// Streams payloads to network clients.
    Server,
    /// Compressed audio to PCM.
    AudioDecoder,
    /// Any other terminal stage.
    Sink,
}

impl StageKind {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Source => "source",
            Self::Decoder => "decoder",
            Self::Transform => "transform",
            Self::Encoder => "encoder",
            Self::Display => "display",
            Self::FileWriter => "file-writer",
            Self::Server => "server",
            Self::AudioDecoder => "audio-decoder",
            Self::Sink => "sink",
        }
    }

    /// Whether stages of this kind pull from a producer.
    pub const fn has_input(&self) -> bool {
        !matches!(self, Self::Source)
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Flow
// ============================================================================

/// What a backend did with one iteration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    /// The output buffer was filled; publish it.
    Ready,
    /// Publish the input frame unchanged (zero-copy pass-through).
    Forward,
    /// The input was used up; nothing to publish (terminal stages).
    Consumed,
    /// The frame is dropped.
    Skip,
    /// No data arrived this interval (sources only).
    Idle,
    /// The stream ended; the stage stops.
    Eos,
}

// ============================================================================
// ProcessContext
// ============================================================================

/// Everything a backend sees for one iteration.
pub struct ProcessContext<'a> {
    pub(crate) input: Option<&'a Frame>,
    pub(crate) output: Option<&'a mut PooledFrame>,
    pub(crate) para: &'a StreamPara,
    pub(crate) sequence: u64,
    pub(crate) sync: Option<&'a Synchronizer>,
}

impl<'a> ProcessContext<'a> {
    /// Build a context by hand, for driving a backend outside a stage.
    pub fn new(
        input: Option<&'a Frame>,
        output: Option<&'a mut PooledFrame>,
        para: &'a StreamPara,
    ) -> Self {
        Self {
            input,
            output,
            para,
            sequence: 0,
            sync: None,
        }
    }

    /// The frame pulled from the producer; `None` for sources.
    #[inline]
    pub fn input(&self) -> Option<&'a Frame> {
        self.input
    }

    /// The buffer to write into.
    ///
    /// `None` for pass-through stages, and when a rejecting pool had no free
    /// buffer; a backend that needs one returns [`Flow::Skip`].
    #[inline]
    pub fn output(&mut self) -> Option<&mut PooledFrame> {
        self.output.as_deref_mut()
    }

    /// The stage's negotiated output description.
    #[inline]
    pub fn output_para(&self) -> &StreamPara {
        self.para
    }

    /// Sequence number the output will carry if published.
    #[inline]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// The clock attached to the stage, if any.
    #[inline]
    pub fn synchronizer(&self) -> Option<&'a Synchronizer> {
        self.sync
    }
}

// ============================================================================
// StageBackend
// ============================================================================

/// The work a stage delegates.
///
/// # Lifecycle
///
/// 1. [`negotiate`](Self::negotiate) and [`setup`](Self::setup) run on the
///    caller's thread during `init()`.
/// 2. [`process`](Self::process) runs on the stage worker, once per iteration.
/// 3. [`teardown`](Self::teardown) runs when the stage stops.
///
/// # Example
///
/// ```rust
/// use stagegraph::error::Result;
/// use stagegraph::format::StreamPara;
/// use stagegraph::stage::{Flow, ProcessContext, StageBackend, StageKind};
///
/// /// Counts frames and lets them through unchanged.
/// struct Tap(u64);
///
/// impl StageBackend for Tap {
///     fn kind(&self) -> StageKind {
///         StageKind::Sink
///     }
///
///     fn negotiate(&mut self, input: Option<&StreamPara>) -> Result<StreamPara> {
///         Ok(input.copied().unwrap_or(StreamPara::Opaque))
///     }
///
///     fn process(&mut self, _ctx: &mut ProcessContext<'_>) -> Result<Flow> {
///         self.0 += 1;
///         Ok(Flow::Forward)
///     }
/// }
/// ```
pub trait StageBackend: Send + 'static {
    /// Role of the stage.
    fn kind(&self) -> StageKind;

    /// Decide the output description from the producer's output (`None` for
    /// sources).
    ///
    /// Errors here fail `init()` with the stage moving to `Failed`.
    fn negotiate(&mut self, input: Option<&StreamPara>) -> Result<StreamPara>;

    /// Bytes per pool buffer for the negotiated output.
    fn buffer_size(&self, para: &StreamPara) -> usize {
        match para {
            StreamPara::Video(image) => image.frame_size(),
            StreamPara::Audio(audio) => audio.bytes_per_frame() * DEFAULT_AUDIO_BLOCK,
            StreamPara::Opaque => 0,
        }
    }

    /// Acquire devices or open files.
    fn setup(&mut self) -> Result<()> {
        Ok(())
    }

    /// Release what `setup` acquired.
    fn teardown(&mut self) {}

    /// Run one iteration.
    ///
    /// Non-fatal errors ([`Error::backend`](crate::error::Error::backend))
    /// drop the current frame; any other error stops the stage.
    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> Result<Flow>;

    /// Codec configuration for the video stream (SPS/PPS and the like).
    fn video_extra_data(&self) -> Option<Bytes> {
        None
    }

    /// Codec configuration for the audio stream.
    fn audio_extra_data(&self) -> Option<Bytes> {
        None
    }
}

impl<B: StageBackend + ?Sized> StageBackend for Box<B> {
    fn kind(&self) -> StageKind {
        (**self).kind()
    }

    fn negotiate(&mut self, input: Option<&StreamPara>) -> Result<StreamPara> {
        (**self).negotiate(input)
    }

    fn buffer_size(&self, para: &StreamPara) -> usize {
        (**self).buffer_size(para)
    }

    fn setup(&mut self) -> Result<()> {
        (**self).setup()
    }

    fn teardown(&mut self) {
        (**self).teardown()
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> Result<Flow> {
        (**self).process(ctx)
    }

    fn video_extra_data(&self) -> Option<Bytes> {
        (**self).video_extra_data()
    }

    fn audio_extra_data(&self) -> Option<Bytes> {
        (**self).audio_extra_data()
    }
}
