//! Declarative pipeline configuration.
//!
//! What a front end hands the [`Assembler`](super::Assembler): the input, the
//! output geometry and the optional destinations. Every value that a command
//! line would carry parses from a string.

use crate::error::{Error, Result};
use crate::format::{DIMENSION_ALIGNMENT, ImagePara, PixelFormat, Rotation, VideoCodec, checked_align};
use crate::observability::TracingConfig;
use crate::synchronize::SynchronizeType;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

// ============================================================================
// Display
// ============================================================================

/// Display plane settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayConfig {
    /// Plane to use; 0 lets the backend pick one.
    pub plane_id: u32,
    /// Plane z-order; `None` lets the backend pick.
    pub zpos: Option<u32>,
    /// Surface width that instances are tiled across.
    pub width: u32,
    /// Surface height that instances are tiled across.
    pub height: u32,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            plane_id: 0,
            zpos: None,
            width: 1920,
            height: 1080,
        }
    }
}

impl DisplayConfig {
    pub fn with_plane(mut self, plane_id: u32) -> Self {
        self.plane_id = plane_id;
        self
    }

    pub fn with_zpos(mut self, zpos: u32) -> Self {
        self.zpos = Some(zpos);
        self
    }

    pub fn with_surface(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }
}

// ============================================================================
// Push
// ============================================================================

/// Network protocol of the push server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PushProtocol {
    #[default]
    Rtsp,
    Rtmp,
}

impl PushProtocol {
    pub const fn scheme(&self) -> &'static str {
        match self {
            Self::Rtsp => "rtsp",
            Self::Rtmp => "rtmp",
        }
    }
}

impl fmt::Display for PushProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

impl FromStr for PushProtocol {
    type Err = Error;

    /// Accepts `rtsp`/`0` and `rtmp`/`1`.
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rtsp" | "0" => Ok(Self::Rtsp),
            "rtmp" | "1" => Ok(Self::Rtmp),
            other => Err(Error::config(format!("push type '{other}' is not supported"))),
        }
    }
}

/// Push server settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushConfig {
    pub port: u16,
    pub protocol: PushProtocol,
}

impl PushConfig {
    pub fn rtsp(port: u16) -> Self {
        Self {
            port,
            protocol: PushProtocol::Rtsp,
        }
    }

    pub fn rtmp(port: u16) -> Self {
        Self {
            port,
            protocol: PushProtocol::Rtmp,
        }
    }

    /// Stream path served for instance `index`.
    pub fn path(index: usize) -> String {
        format!("/live/{index}")
    }
}

/// Transport requested from an RTSP client source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RtspTransport {
    #[default]
    Udp,
    Tcp,
}

impl FromStr for RtspTransport {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "udp" => Ok(Self::Udp),
            "tcp" => Ok(Self::Tcp),
            other => Err(Error::config(format!("rtsp transport '{other}' is not supported"))),
        }
    }
}

// ============================================================================
// PipelineConfig
// ============================================================================

/// Idle intervals a network source tolerates before it stops.
pub const DEFAULT_INACTIVITY_TIMEOUT_COUNT: u32 = 10;

/// Everything needed to assemble one or more pipeline instances.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Device node, file path or `rtsp://` / `rtmp://` URL.
    pub input: String,

    /// Requested capture geometry and format. Zero size lets the source pick.
    pub input_para: ImagePara,

    /// Requested output size. Zero size means "same as the source".
    pub output_para: ImagePara,

    /// Requested output format; `None` keeps the decoded format.
    pub output_format: Option<PixelFormat>,

    pub rotation: Rotation,

    /// Encode the output with this codec.
    pub encoder: Option<VideoCodec>,

    /// Show the output on a display plane.
    pub display: Option<DisplayConfig>,

    /// Serve the encoded stream over the network.
    pub push: Option<PushConfig>,

    /// Write the encoded stream to this file.
    pub file_output: Option<PathBuf>,

    /// Stop the file writer after this many frames. 0 means no limit.
    pub max_frames: u64,

    /// Write raw source frames to this file.
    pub dump_file: Option<PathBuf>,

    /// Play the source's audio track on this device.
    pub audio_device: Option<String>,

    /// Attach a synchronizer with this master clock.
    pub sync: Option<SynchronizeType>,

    /// Transport for `rtsp://` inputs.
    pub rtsp_transport: RtspTransport,

    /// Consecutive idle intervals after which a network source stops with a
    /// timeout. 0 disables the limit.
    pub inactivity_timeout_count: u32,

    /// Number of replicated instances.
    pub instance_count: usize,

    /// Let all instances read from a single source stage.
    pub shared_source: bool,

    /// Span and event settings applied to every stage.
    pub tracing: TracingConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input: String::new(),
            input_para: ImagePara::new(0, 0, PixelFormat::Mjpeg),
            output_para: ImagePara::new(0, 0, PixelFormat::Nv12),
            output_format: None,
            rotation: Rotation::None,
            encoder: None,
            display: None,
            push: None,
            file_output: None,
            max_frames: 0,
            dump_file: None,
            audio_device: None,
            sync: None,
            rtsp_transport: RtspTransport::Udp,
            inactivity_timeout_count: DEFAULT_INACTIVITY_TIMEOUT_COUNT,
            instance_count: 1,
            shared_source: false,
            tracing: TracingConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Configuration reading from `input`, everything else at defaults.
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            ..Default::default()
        }
    }

    pub fn with_input_para(mut self, para: ImagePara) -> Self {
        self.input_para = para;
        self
    }

    /// Requested output size and format.
    pub fn with_output(mut self, width: u32, height: u32, format: PixelFormat) -> Self {
        self.output_para = ImagePara::new(width, height, format);
        self.output_format = Some(format);
        self
    }

    pub fn with_output_format(mut self, format: PixelFormat) -> Self {
        self.output_para.format = format;
        self.output_format = Some(format);
        self
    }

    pub fn with_rotation(mut self, rotation: Rotation) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_encoder(mut self, codec: VideoCodec) -> Self {
        self.encoder = Some(codec);
        self
    }

    pub fn with_display(mut self, display: DisplayConfig) -> Self {
        self.display = Some(display);
        self
    }

    pub fn with_push(mut self, push: PushConfig) -> Self {
        self.push = Some(push);
        self
    }

    pub fn with_file_output(mut self, path: impl Into<PathBuf>, max_frames: u64) -> Self {
        self.file_output = Some(path.into());
        self.max_frames = max_frames;
        self
    }

    pub fn with_dump_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.dump_file = Some(path.into());
        self
    }

    pub fn with_audio_device(mut self, device: impl Into<String>) -> Self {
        self.audio_device = Some(device.into());
        self
    }

    pub fn with_sync(mut self, sync: SynchronizeType) -> Self {
        self.sync = Some(sync);
        self
    }

    pub fn with_rtsp_transport(mut self, transport: RtspTransport) -> Self {
        self.rtsp_transport = transport;
        self
    }

    pub fn with_inactivity_timeout_count(mut self, count: u32) -> Self {
        self.inactivity_timeout_count = count;
        self
    }

    pub fn with_instances(mut self, count: usize) -> Self {
        self.instance_count = count;
        self
    }

    pub fn with_shared_source(mut self, shared: bool) -> Self {
        self.shared_source = shared;
        self
    }

    pub fn with_tracing(mut self, tracing: TracingConfig) -> Self {
        self.tracing = tracing;
        self
    }

    /// Check the values that do not depend on the input.
    pub fn validate(&self) -> Result<()> {
        if self.input.trim().is_empty() {
            return Err(Error::config("no input source given"));
        }
        if self.instance_count == 0 {
            return Err(Error::config("instance count must be at least 1"));
        }
        if (self.output_para.width == 0) != (self.output_para.height == 0) {
            return Err(Error::config(format!(
                "output size {}x{} must give both dimensions or neither",
                self.output_para.width, self.output_para.height
            )));
        }
        for (what, para) in [("input", &self.input_para), ("output", &self.output_para)] {
            let fits = checked_align(para.width, DIMENSION_ALIGNMENT).is_some()
                && checked_align(para.height, DIMENSION_ALIGNMENT).is_some();
            if !fits {
                return Err(Error::config(format!(
                    "{what} size {}x{} is out of range",
                    para.width, para.height
                )));
            }
        }
        if self.push.is_some() && self.encoder.is_none() {
            return Err(Error::config("push needs an encoder"));
        }
        if let Some(format) = self.output_format {
            if format.is_compressed() {
                return Err(Error::config(format!(
                    "output format {format} is compressed; request an encoder instead"
                )));
            }
        }
        Ok(())
    }

    /// Whether any destination consumes the transformed output.
    pub fn has_destination(&self) -> bool {
        self.display.is_some()
            || self.encoder.is_some()
            || self.file_output.is_some()
            || self.push.is_some()
    }

    /// File name for instance `index`: `name_NN.ext` when more than one
    /// instance is built, `path` unchanged otherwise.
    pub fn instance_path(&self, path: &Path, index: usize) -> PathBuf {
        if self.instance_count <= 1 {
            return path.to_path_buf();
        }
        let stem = path.file_stem().map(|s| s.to_string_lossy()).unwrap_or_default();
        let name = match path.extension() {
            Some(ext) => format!("{stem}_{index:02}.{}", ext.to_string_lossy()),
            None => format!("{stem}_{index:02}"),
        };
        path.with_file_name(name)
    }
}
