//! # stagegraph
//!
//! A stage-graph framework for real-time audio/video pipelines on embedded
//! devices.
//!
//! Capture, decode, transform, encode, display and network stages are chained
//! into a directed acyclic graph. Every stage runs on its own thread, writes
//! into its own bounded buffer pool and hands frames downstream by reference,
//! so memory stays bounded and a slow consumer slows its producer instead of
//! growing a queue.
//!
//! ## Features
//!
//! - **Bounded, zero-copy buffers**: per-stage pools, reference-counted frames
//! - **Backpressure**: blocking or rejecting pools, drop-oldest input queues
//! - **A/V sync**: audio, video or wall-clock master timelines
//! - **Assembly from intent**: decode and scale/rotate stages inserted from a
//!   declared target, replicated across instances
//! - **Pluggable backends**: hardware codecs, displays and servers behind one trait
//!
//! ## Quick Start
//!
//! ```rust
//! use stagegraph::prelude::*;
//! use stagegraph::backends::{NullSink, PatternSource, SoftwareTransform};
//!
//! let source = Stage::new(
//!     "source",
//!     PatternSource::new(ImagePara::new(64, 48, PixelFormat::Rgb24)).with_frame_limit(10),
//! );
//! let rotate = Stage::new(
//!     "rotate",
//!     SoftwareTransform::new(ImagePara::new(48, 64, PixelFormat::Rgb24), Rotation::Rotate90),
//! );
//! let sink = Stage::with_options("sink", NullSink::new(), StageOptions::pass_through());
//! rotate.set_productor(&source)?;
//! sink.set_productor(&rotate)?;
//!
//! for stage in [&source, &rotate, &sink] {
//!     stage.init()?;
//! }
//! source.start_pipe()?;
//! println!("{}", source.dump_pipe());
//! source.stop_pipe();
//! # Ok::<(), stagegraph::Error>(())
//! ```

#![warn(clippy::all)]

pub mod backends;
pub mod buffer;
pub mod clock;
pub mod error;
pub mod format;
pub mod memory;
pub mod observability;
pub mod pipeline;
pub mod stage;
pub mod synchronize;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::buffer::{Frame, FrameMeta, PooledFrame};
    pub use crate::error::{Error, Result};
    pub use crate::format::{ImagePara, MediaType, PixelFormat, Rotation, StreamPara};
    pub use crate::memory::{FramePool, PoolMode};
    pub use crate::pipeline::{Assembler, BackendFactory, PipelineConfig};
    pub use crate::stage::{Flow, ProcessContext, Stage, StageBackend, StageKind, StageOptions, StageState};
    pub use crate::synchronize::{SynchronizeType, Synchronizer};
}

pub use error::{Error, Result};
