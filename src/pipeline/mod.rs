//! Pipeline assembly and topology.
//!
//! This module provides:
//!
//! - [`PipelineConfig`]: declarative description of input, output and destinations
//! - [`Assembler`]: builds and initializes the stage chain for each instance
//! - [`BackendFactory`]: the seam where platform backends plug in
//! - [`SourceRegistry`]: sources shared between instances
//! - [`Topology`]: read-only snapshot of a stage graph, used for ordering and dumps
//! - negotiation helpers ([`resolve_target`], [`plan_transform`], [`TileLayout`])
//!
//! # Example
//!
//! ```rust,no_run
//! use stagegraph::format::{PixelFormat, Rotation};
//! use stagegraph::pipeline::{Assembler, PipelineConfig, ReferenceFactory};
//!
//! let config = PipelineConfig::new("/dev/video0")
//!     .with_output(1280, 720, PixelFormat::Nv12)
//!     .with_rotation(Rotation::Rotate90)
//!     .with_file_output("/tmp/out.yuv", 100);
//!
//! let assembly = Assembler::new(ReferenceFactory).assemble_all(&config);
//! for (index, error) in &assembly.failures {
//!     eprintln!("instance {index}: {error}");
//! }
//! assembly.start_all();
//! ```

mod assembler;
mod config;
mod factory;
mod graph;
mod negotiate;
mod source;

pub use assembler::{
    AUDIO_DECODER_BUFFERS, Assembler, Assembly, AssemblyReport, DECODER_BUFFERS, DISPLAY_BUFFERS,
    ENCODER_BUFFERS, Instance, TRANSFORM_BUFFERS,
};
pub use config::{
    DEFAULT_INACTIVITY_TIMEOUT_COUNT, DisplayConfig, PipelineConfig, PushConfig, PushProtocol,
    RtspTransport,
};
pub use factory::{BackendFactory, BoxedBackend, ReferenceFactory, SourceSpec};
pub use graph::Topology;
pub use negotiate::{TileLayout, WindowRect, needs_decode, plan_transform, resolve_target};
pub use source::{SourceKind, SourceRegistry, classify};
