//! Reference stage backends in portable Rust.
//!
//! | Backend | Kind | Purpose |
//! |---------|------|---------|
//! | [`PatternSource`] | source | Synthetic raw video, paced or free-running |
//! | [`SoftwareTransform`] | transform | CPU scale, rotate, mirror, RGB/BGR and NV12→gray |
//! | [`FileSink`] | file writer | Raw stream to a file, optional frame limit |
//! | [`NullSink`] | sink | Count and discard, or forward unchanged |
//!
//! Hardware codecs, display planes and network servers plug in through
//! [`BackendFactory`](crate::pipeline::BackendFactory).

mod file;
mod null;
mod pattern;
mod transform;

pub use file::FileSink;
pub use null::NullSink;
pub use pattern::{Pattern, PatternSource};
pub use transform::SoftwareTransform;
