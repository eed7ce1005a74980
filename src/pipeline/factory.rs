//! Backend factory for the assembler.
//!
//! The assembler decides *which* stages a pipeline needs; a
//! [`BackendFactory`] decides *what* runs inside them. Platform integrations
//! (hardware codecs, display planes, streaming servers) implement the trait
//! and override the constructors they support.

use super::config::{DisplayConfig, PushConfig, RtspTransport};
use super::negotiate::WindowRect;
use super::source::SourceKind;
use crate::backends::{FileSink, SoftwareTransform};
use crate::error::{Error, Result};
use crate::format::{ImagePara, Rotation, VideoCodec};
use crate::stage::StageBackend;
use bytes::Bytes;
use std::path::Path;

/// A boxed backend ready to put in a stage.
pub type BoxedBackend = Box<dyn StageBackend>;

/// What the assembler knows about the input when asking for a source.
#[derive(Debug, Clone)]
pub struct SourceSpec<'a> {
    /// Device node, file path or URL.
    pub input: &'a str,
    pub kind: SourceKind,
    /// Requested geometry and format; zero size lets the backend pick.
    pub para: ImagePara,
    pub rtsp_transport: RtspTransport,
}

/// Creates the backends the assembler inserts.
///
/// Only [`transform`](Self::transform) and
/// [`file_writer`](Self::file_writer) have working defaults (the portable
/// reference backends). Every other constructor fails with a configuration
/// error naming the missing backend, so a pipeline that needs it aborts at
/// assembly.
pub trait BackendFactory: Send + Sync {
    fn source(&self, spec: &SourceSpec<'_>) -> Result<BoxedBackend> {
        Err(missing(&format!("{} source for '{}'", spec.kind, spec.input)))
    }

    /// Decoder for compressed `input` frames.
    fn decoder(&self, input: &ImagePara) -> Result<BoxedBackend> {
        Err(missing(&format!("{} decoder", input.format)))
    }

    /// Scale/rotate/convert to `target` (the post-rotation geometry).
    fn transform(&self, target: ImagePara, rotation: Rotation) -> Result<BoxedBackend> {
        Ok(Box::new(SoftwareTransform::new(target, rotation)))
    }

    fn encoder(&self, codec: VideoCodec, input: &ImagePara) -> Result<BoxedBackend> {
        Err(missing(&format!("{codec:?} encoder for {input}")))
    }

    /// Display showing frames in `window` of the configured plane.
    fn display(&self, config: &DisplayConfig, _window: WindowRect) -> Result<BoxedBackend> {
        Err(missing(&format!("display on plane {}", config.plane_id)))
    }

    /// File writer; `header` is the producer's codec configuration.
    fn file_writer(&self, path: &Path, header: Option<Bytes>, max_frames: u64) -> Result<BoxedBackend> {
        Ok(Box::new(
            FileSink::new(path)
                .with_header(header)
                .with_max_frames(max_frames),
        ))
    }

    /// Streaming server publishing at `path` (e.g. `/live/0`).
    fn push_server(&self, config: &PushConfig, path: &str) -> Result<BoxedBackend> {
        Err(missing(&format!("{} server for {path}", config.protocol)))
    }

    /// Audio decoder and player for `device`, configured with the source's
    /// audio codec data.
    fn audio_decoder(&self, device: &str, _extra_data: Option<Bytes>) -> Result<BoxedBackend> {
        Err(missing(&format!("audio decoder for device '{device}'")))
    }
}

fn missing(what: &str) -> Error {
    Error::config(format!("no backend available: {what}"))
}

/// A factory with only the reference backends.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReferenceFactory;

impl BackendFactory for ReferenceFactory {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::PixelFormat;
    use crate::stage::StageKind;

    #[test]
    fn test_reference_defaults() {
        let factory = ReferenceFactory;
        let transform = factory
            .transform(ImagePara::new(8, 8, PixelFormat::Gray8), Rotation::None)
            .unwrap();
        assert_eq!(transform.kind(), StageKind::Transform);

        let writer = factory.file_writer(Path::new("out.raw"), None, 0).unwrap();
        assert_eq!(writer.kind(), StageKind::FileWriter);
    }

    #[test]
    fn test_missing_backends_name_themselves() {
        let factory = ReferenceFactory;
        let err = factory
            .decoder(&ImagePara::new(8, 8, PixelFormat::H264))
            .err()
            .unwrap();
        assert!(matches!(&err, Error::Configuration(m) if m.contains("h264 decoder")));

        let err = factory
            .push_server(&PushConfig::rtmp(1935), "/live/0")
            .err()
            .unwrap();
        assert!(err.to_string().contains("rtmp server for /live/0"));
        assert!(factory.audio_decoder("default", None).is_err());
    }
}
