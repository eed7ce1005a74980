//! Media format descriptors shared by every stage.
//!
//! This module provides:
//! - [`PixelFormat`]: the closed set of raw and compressed video formats
//! - [`ImagePara`]: negotiated frame geometry (size, strides, format)
//! - [`SampleFormat`] / [`AudioPara`]: audio sample layout
//! - [`StreamPara`]: what a stage declares it outputs after negotiation
//! - [`Rotation`] and [`VideoCodec`]: transform and encode targets

use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// Hardware alignment required by downstream accelerators.
pub const DIMENSION_ALIGNMENT: u32 = 8;

/// Round `value` up to the next multiple of `alignment`, or `None` if that
/// does not fit in a `u32`.
///
/// `alignment` must be a power of two.
///
/// ```rust
/// use stagegraph::format::checked_align;
///
/// assert_eq!(checked_align(637, 8), Some(640));
/// assert_eq!(checked_align(u32::MAX - 2, 8), None);
/// ```
#[inline]
pub const fn checked_align(value: u32, alignment: u32) -> Option<u32> {
    match value.checked_add(alignment - 1) {
        Some(v) => Some(v & !(alignment - 1)),
        None => None,
    }
}

/// Round `value` up to the next multiple of `alignment`, saturating at the
/// largest multiple that fits in a `u32`.
///
/// `alignment` must be a power of two.
///
/// ```rust
/// use stagegraph::format::align;
///
/// assert_eq!(align(637, 8), 640);
/// assert_eq!(align(640, 8), 640);
/// ```
#[inline]
pub const fn align(value: u32, alignment: u32) -> u32 {
    match checked_align(value, alignment) {
        Some(v) => v,
        None => u32::MAX & !(alignment - 1),
    }
}

const fn fourcc(code: &[u8; 4]) -> u32 {
    (code[0] as u32) | ((code[1] as u32) << 8) | ((code[2] as u32) << 16) | ((code[3] as u32) << 24)
}

// ============================================================================
// Media type
// ============================================================================

/// What kind of payload a frame buffer carries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum MediaType {
    /// Video frames, raw or compressed.
    #[default]
    Video,
    /// Audio samples, raw or compressed.
    Audio,
    /// Anything else (metadata, inference tensors).
    Other,
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Video => f.write_str("video"),
            Self::Audio => f.write_str("audio"),
            Self::Other => f.write_str("other"),
        }
    }
}

// ============================================================================
// Pixel formats
// ============================================================================

/// Pixel or compressed format code shared by all stages.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PixelFormat {
    // ========================================================================
    // YUV formats
    // ========================================================================
    /// YUV 4:2:0 semi-planar (Y plane, then interleaved UV).
    /// Native output of most hardware decoders.
    #[default]
    Nv12 = 0,
    /// YUV 4:2:0 semi-planar with VU ordering.
    Nv21,
    /// YUV 4:2:2 semi-planar.
    Nv16,
    /// YUV 4:2:0 planar.
    I420,
    /// YUV 4:2:2 packed (Y0 U Y1 V).
    Yuyv,
    /// YUV 4:2:2 packed (U Y0 V Y1).
    Uyvy,

    // ========================================================================
    // RGB / gray formats
    // ========================================================================
    /// RGB 8-bit per channel, packed (24 bits/pixel).
    Rgb24,
    /// BGR 8-bit per channel, packed (24 bits/pixel).
    Bgr24,
    /// RGBA 8-bit per channel, packed (32 bits/pixel).
    Rgba,
    /// BGRA 8-bit per channel, packed (32 bits/pixel).
    Bgra,
    /// ARGB 8-bit per channel, packed (32 bits/pixel).
    Argb,
    /// 8-bit grayscale.
    Gray8,

    // ========================================================================
    // Compressed formats
    // ========================================================================
    /// Motion JPEG.
    Mjpeg,
    /// H.264 / AVC elementary stream.
    H264,
    /// H.265 / HEVC elementary stream.
    H265,
}

impl PixelFormat {
    /// Every format in the enumeration.
    pub const ALL: [PixelFormat; 15] = [
        Self::Nv12,
        Self::Nv21,
        Self::Nv16,
        Self::I420,
        Self::Yuyv,
        Self::Uyvy,
        Self::Rgb24,
        Self::Bgr24,
        Self::Rgba,
        Self::Bgra,
        Self::Argb,
        Self::Gray8,
        Self::Mjpeg,
        Self::H264,
        Self::H265,
    ];

    /// Lower-case name, as accepted by [`FromStr`].
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Nv12 => "nv12",
            Self::Nv21 => "nv21",
            Self::Nv16 => "nv16",
            Self::I420 => "i420",
            Self::Yuyv => "yuyv",
            Self::Uyvy => "uyvy",
            Self::Rgb24 => "rgb24",
            Self::Bgr24 => "bgr24",
            Self::Rgba => "rgba",
            Self::Bgra => "bgra",
            Self::Argb => "argb",
            Self::Gray8 => "gray8",
            Self::Mjpeg => "mjpeg",
            Self::H264 => "h264",
            Self::H265 => "h265",
        }
    }

    /// V4L2 fourcc code.
    pub const fn fourcc(&self) -> u32 {
        match self {
            Self::Nv12 => fourcc(b"NV12"),
            Self::Nv21 => fourcc(b"NV21"),
            Self::Nv16 => fourcc(b"NV16"),
            Self::I420 => fourcc(b"YU12"),
            Self::Yuyv => fourcc(b"YUYV"),
            Self::Uyvy => fourcc(b"UYVY"),
            Self::Rgb24 => fourcc(b"RGB3"),
            Self::Bgr24 => fourcc(b"BGR3"),
            Self::Rgba => fourcc(b"AB24"),
            Self::Bgra => fourcc(b"RA24"),
            Self::Argb => fourcc(b"BA24"),
            Self::Gray8 => fourcc(b"GREY"),
            Self::Mjpeg => fourcc(b"MJPG"),
            Self::H264 => fourcc(b"H264"),
            Self::H265 => fourcc(b"HEVC"),
        }
    }

    /// Look a format up by its V4L2 fourcc.
    pub fn from_fourcc(code: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.fourcc() == code)
    }

    /// Whether frames in this format are a compressed bitstream.
    pub const fn is_compressed(&self) -> bool {
        matches!(self, Self::Mjpeg | Self::H264 | Self::H265)
    }

    /// Whether the format stores luma and chroma in separate planes.
    pub const fn is_semi_planar(&self) -> bool {
        matches!(self, Self::Nv12 | Self::Nv21 | Self::Nv16)
    }

    /// Bytes per pixel for packed formats, `None` for planar or compressed.
    pub const fn packed_bytes_per_pixel(&self) -> Option<usize> {
        match self {
            Self::Gray8 => Some(1),
            Self::Yuyv | Self::Uyvy => Some(2),
            Self::Rgb24 | Self::Bgr24 => Some(3),
            Self::Rgba | Self::Bgra | Self::Argb => Some(4),
            _ => None,
        }
    }

    /// Bytes needed for one frame with the given strides.
    ///
    /// For compressed formats this is an upper bound used to size pool slots.
    pub const fn frame_size(&self, hstride: u32, vstride: u32) -> usize {
        let pixels = hstride as usize * vstride as usize;
        match self {
            Self::Nv12 | Self::Nv21 | Self::I420 => pixels * 3 / 2,
            Self::Nv16 | Self::Yuyv | Self::Uyvy => pixels * 2,
            Self::Rgb24 | Self::Bgr24 => pixels * 3,
            Self::Rgba | Self::Bgra | Self::Argb => pixels * 4,
            Self::Gray8 => pixels,
            Self::Mjpeg | Self::H264 | Self::H265 => {
                let bound = pixels * 3 / 2;
                if bound < 4096 { 4096 } else { bound }
            }
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PixelFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_ascii_lowercase();
        let alias = match lower.as_str() {
            "rgb" | "rgb888" => "rgb24",
            "bgr" | "bgr888" => "bgr24",
            "gray" | "grey" | "y8" => "gray8",
            "yuv420p" | "yu12" => "i420",
            "jpeg" | "mjpg" => "mjpeg",
            "avc" => "h264",
            "hevc" => "h265",
            other => other,
        };
        Self::ALL
            .into_iter()
            .find(|f| f.name() == alias)
            .ok_or_else(|| Error::config(format!("format '{s}' is not supported")))
    }
}

// ============================================================================
// ImagePara
// ============================================================================

/// Negotiated frame geometry and format.
///
/// Invariant: `hstride >= width` and `vstride >= height`. Immutable once the
/// stage that produced it is initialized.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ImagePara {
    /// Visible width in pixels.
    pub width: u32,
    /// Visible height in pixels.
    pub height: u32,
    /// Horizontal stride (row pitch in pixels).
    pub hstride: u32,
    /// Vertical stride (rows allocated per plane).
    pub vstride: u32,
    /// Pixel or compressed format.
    pub format: PixelFormat,
}

impl ImagePara {
    /// Create a descriptor with strides equal to the dimensions.
    pub const fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            hstride: width,
            vstride: height,
            format,
        }
    }

    /// Create a descriptor with explicit strides.
    pub const fn with_strides(
        width: u32,
        height: u32,
        hstride: u32,
        vstride: u32,
        format: PixelFormat,
    ) -> Self {
        Self {
            width,
            height,
            hstride,
            vstride,
            format,
        }
    }

    /// Whether width or height is left unspecified (zero).
    pub const fn is_unsized(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Width and height aligned up to [`DIMENSION_ALIGNMENT`], strides equal to
    /// the aligned dimensions.
    pub const fn aligned(&self) -> Self {
        let width = align(self.width, DIMENSION_ALIGNMENT);
        let height = align(self.height, DIMENSION_ALIGNMENT);
        Self::new(width, height, self.format)
    }

    /// Width/height and hstride/vstride exchanged (90°/270° rotation).
    pub const fn swapped(&self) -> Self {
        Self {
            width: self.height,
            height: self.width,
            hstride: self.vstride,
            vstride: self.hstride,
            format: self.format,
        }
    }

    /// Whether two descriptors differ in width, height or format.
    pub fn differs_from(&self, other: &ImagePara) -> bool {
        self.width != other.width || self.height != other.height || self.format != other.format
    }

    /// Bytes needed for one frame.
    pub const fn frame_size(&self) -> usize {
        self.format.frame_size(self.hstride, self.vstride)
    }

    /// Check the stride invariant and that the frame is non-empty.
    pub fn validate(&self) -> Result<()> {
        if self.is_unsized() {
            return Err(Error::config(format!(
                "image size {}x{} is not set",
                self.width, self.height
            )));
        }
        if self.hstride < self.width || self.vstride < self.height {
            return Err(Error::config(format!(
                "stride {}x{} is smaller than image {}x{}",
                self.hstride, self.vstride, self.width, self.height
            )));
        }
        Ok(())
    }
}

impl fmt::Display for ImagePara {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{} ({}x{}) {}",
            self.width, self.height, self.hstride, self.vstride, self.format
        )
    }
}

/// Parse a `WIDTHxHEIGHT` size, strides equal to the size, format left at
/// its default.
pub fn parse_size(s: &str) -> Result<(u32, u32)> {
    let (w, h) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| Error::config(format!("size '{s}' must look like 640x480")))?;
    let parse = |v: &str| {
        v.trim()
            .parse::<u32>()
            .map_err(|_| Error::config(format!("size '{s}' must look like 640x480")))
    };
    Ok((parse(w)?, parse(h)?))
}

// ============================================================================
// Audio
// ============================================================================

/// Audio sample formats.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SampleFormat {
    /// Unsigned 8-bit interleaved.
    U8 = 0,
    /// Signed 16-bit interleaved (most common).
    #[default]
    S16,
    /// Signed 32-bit interleaved.
    S32,
    /// 32-bit float interleaved.
    Flt,
    /// Unsigned 8-bit planar.
    U8P,
    /// Signed 16-bit planar.
    S16P,
    /// Signed 32-bit planar.
    S32P,
    /// 32-bit float planar.
    FltP,
    /// G.711 A-law.
    G711A,
    /// G.711 µ-law.
    G711U,
}

impl SampleFormat {
    /// Bits per sample.
    pub const fn bits_per_sample(&self) -> u32 {
        match self {
            Self::U8 | Self::U8P | Self::G711A | Self::G711U => 8,
            Self::S16 | Self::S16P => 16,
            Self::S32 | Self::S32P | Self::Flt | Self::FltP => 32,
        }
    }

    /// Whether channels are stored in separate planes.
    pub const fn is_planar(&self) -> bool {
        matches!(self, Self::U8P | Self::S16P | Self::S32P | Self::FltP)
    }
}

/// Audio stream layout.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct AudioPara {
    /// Sample format.
    pub sample_format: SampleFormat,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Number of channels.
    pub channels: u16,
}

impl AudioPara {
    /// Create a new audio layout.
    pub const fn new(sample_format: SampleFormat, sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_format,
            sample_rate,
            channels,
        }
    }

    /// Bytes per interleaved sample frame (all channels).
    pub const fn bytes_per_frame(&self) -> usize {
        self.channels as usize * (self.sample_format.bits_per_sample() as usize / 8)
    }

    /// Check that rate and channel count are usable.
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 || self.channels == 0 {
            return Err(Error::config(format!(
                "audio layout {} Hz / {} channels is not valid",
                self.sample_rate, self.channels
            )));
        }
        Ok(())
    }
}

// ============================================================================
// StreamPara
// ============================================================================

/// Output description a stage publishes after negotiation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamPara {
    /// Video frames with the given geometry.
    Video(ImagePara),
    /// Audio blocks with the given layout.
    Audio(AudioPara),
    /// Payload without declared geometry (pass-through sinks, servers).
    Opaque,
}

impl StreamPara {
    /// The image parameters, if this is a video stream.
    pub fn image(&self) -> Option<&ImagePara> {
        match self {
            Self::Video(para) => Some(para),
            _ => None,
        }
    }

    /// The audio parameters, if this is an audio stream.
    pub fn audio(&self) -> Option<&AudioPara> {
        match self {
            Self::Audio(para) => Some(para),
            _ => None,
        }
    }

    /// Media type of buffers carrying this stream.
    pub fn media_type(&self) -> MediaType {
        match self {
            Self::Video(_) => MediaType::Video,
            Self::Audio(_) => MediaType::Audio,
            Self::Opaque => MediaType::Other,
        }
    }

    /// Validate the contained parameters.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Video(para) => para.validate(),
            Self::Audio(para) => para.validate(),
            Self::Opaque => Ok(()),
        }
    }
}

impl fmt::Display for StreamPara {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Video(para) => write!(f, "video {para}"),
            Self::Audio(para) => write!(
                f,
                "audio {:?} {}Hz {}ch",
                para.sample_format, para.sample_rate, para.channels
            ),
            Self::Opaque => f.write_str("opaque"),
        }
    }
}

// ============================================================================
// Rotation
// ============================================================================

/// Rotation or mirror applied by a transform stage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Rotation {
    /// No rotation.
    #[default]
    None,
    /// 90 degrees clockwise.
    Rotate90,
    /// 180 degrees.
    Rotate180,
    /// 270 degrees clockwise.
    Rotate270,
    /// Vertical mirror (top/bottom flip).
    VFlip,
    /// Horizontal mirror (left/right flip).
    HFlip,
}

impl Rotation {
    /// Whether the output frame's width and height are exchanged.
    pub const fn swaps_dimensions(&self) -> bool {
        matches!(self, Self::Rotate90 | Self::Rotate270)
    }
}

impl FromStr for Rotation {
    type Err = Error;

    /// Accepts the command-line codes: `0`, `1` (vertical mirror),
    /// `2` (horizontal mirror), `90`, `180`, `270`.
    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "0" => Ok(Self::None),
            "1" => Ok(Self::VFlip),
            "2" => Ok(Self::HFlip),
            "90" => Ok(Self::Rotate90),
            "180" => Ok(Self::Rotate180),
            "270" => Ok(Self::Rotate270),
            other => Err(Error::config(format!("rotation '{other}' is not supported"))),
        }
    }
}

// ============================================================================
// Video codecs
// ============================================================================

/// Encoder output codecs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum VideoCodec {
    /// H.264 / AVC.
    #[default]
    H264,
    /// H.265 / HEVC.
    H265,
    /// Motion JPEG.
    Mjpeg,
}

impl VideoCodec {
    /// Compressed pixel format produced by this codec.
    pub const fn pixel_format(&self) -> PixelFormat {
        match self {
            Self::H264 => PixelFormat::H264,
            Self::H265 => PixelFormat::H265,
            Self::Mjpeg => PixelFormat::Mjpeg,
        }
    }
}

impl FromStr for VideoCodec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.to_ascii_lowercase();
        if lower.contains("264") {
            Ok(Self::H264)
        } else if lower.contains("265") {
            Ok(Self::H265)
        } else if lower.contains("jpeg") {
            Ok(Self::Mjpeg)
        } else {
            Err(Error::config(format!("encode type '{s}' is not supported")))
        }
    }
}
