//! CPU scale, rotate and mirror.
//!
//! Nearest-neighbour sampling over each plane, with the rotation folded into
//! the coordinate mapping so one pass does both. Handles packed RGB/gray
//! formats, YUYV/UYVY, NV12/NV21 and I420, plus RGB24↔BGR24 and NV12→GRAY8
//! conversion.

use crate::error::{Error, Result};
use crate::format::{ImagePara, MediaType, PixelFormat, Rotation, StreamPara};
use crate::stage::{Flow, ProcessContext, StageBackend, StageKind};

/// Software transform stage backend.
pub struct SoftwareTransform {
    target: ImagePara,
    rotation: Rotation,
    input: Option<ImagePara>,
}

impl SoftwareTransform {
    /// Produce `target` frames, rotated by `rotation`.
    ///
    /// `target` describes the output frame after rotation, so a 90° rotation
    /// of 640x480 input without scaling has a 480x640 target. Zero width or
    /// height takes the (rotated) input size.
    pub fn new(target: ImagePara, rotation: Rotation) -> Self {
        Self {
            target,
            rotation,
            input: None,
        }
    }

    pub fn rotation(&self) -> Rotation {
        self.rotation
    }

    fn check_conversion(from: PixelFormat, to: PixelFormat) -> Result<()> {
        let supported = (from == to && !from.is_compressed())
            || matches!(
                (from, to),
                (PixelFormat::Rgb24, PixelFormat::Bgr24)
                    | (PixelFormat::Bgr24, PixelFormat::Rgb24)
                    | (PixelFormat::Nv12, PixelFormat::Gray8)
                    | (PixelFormat::Nv21, PixelFormat::Gray8)
            );
        if supported {
            Ok(())
        } else {
            Err(Error::config(format!(
                "software transform cannot convert {from} to {to}"
            )))
        }
    }
}

impl StageBackend for SoftwareTransform {
    fn kind(&self) -> StageKind {
        StageKind::Transform
    }

    fn negotiate(&mut self, input: Option<&StreamPara>) -> Result<StreamPara> {
        let input = match input {
            Some(StreamPara::Video(image)) => *image,
            Some(other) => {
                return Err(Error::config(format!("transform needs video input, got {other}")));
            }
            None => return Err(Error::config("transform needs a producer")),
        };
        Self::check_conversion(input.format, self.target.format)?;

        let mut target = self.target;
        if target.is_unsized() {
            let (width, height) = if self.rotation.swaps_dimensions() {
                (input.height, input.width)
            } else {
                (input.width, input.height)
            };
            target = ImagePara::new(width, height, target.format);
        }
        let subsampled = target.format.is_semi_planar() || target.format == PixelFormat::I420;
        if subsampled && (target.width % 2 != 0 || target.height % 2 != 0) {
            return Err(Error::config(format!(
                "{} output needs even dimensions, got {}x{}",
                target.format, target.width, target.height
            )));
        }

        self.input = Some(input);
        self.target = target;
        Ok(StreamPara::Video(target))
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> Result<Flow> {
        let Some(frame) = ctx.input() else {
            return Ok(Flow::Skip);
        };
        let input = frame
            .image_para()
            .copied()
            .or(self.input)
            .ok_or_else(|| Error::backend("input frame carries no geometry"))?;
        if input.format.is_compressed() {
            return Err(Error::backend(format!("cannot transform {} frames", input.format)));
        }
        let needed = input.frame_size();
        if frame.active_size() < needed {
            return Err(Error::backend(format!(
                "input frame holds {} bytes, {needed} expected",
                frame.active_size()
            )));
        }

        let target = self.target;
        let rotation = self.rotation;
        let Some(output) = ctx.output() else {
            return Ok(Flow::Skip);
        };
        let size = target.frame_size();
        if output.capacity() < size {
            return Err(Error::fatal(format!(
                "buffer of {} bytes cannot hold a {size} byte frame",
                output.capacity()
            )));
        }

        transform_frame(frame.active_data(), &input, &mut output.data_mut()[..size], &target, rotation);
        output.set_len(size);
        let meta = output.meta_mut();
        meta.media_type = MediaType::Video;
        meta.image = Some(target);
        meta.keyframe = frame.is_keyframe();
        Ok(Flow::Ready)
    }
}

// ============================================================================
// Pixel mapping
// ============================================================================

/// A plane within a frame buffer.
#[derive(Clone, Copy)]
struct Plane {
    offset: usize,
    width: usize,
    height: usize,
    /// Row pitch in bytes.
    pitch: usize,
    bytes_per_pixel: usize,
}

/// Planes of a frame; chroma planes are subsampled.
fn planes(para: &ImagePara) -> Vec<Plane> {
    let w = para.width as usize;
    let h = para.height as usize;
    let hs = para.hstride as usize;
    let vs = para.vstride as usize;
    let luma_size = hs * vs;
    match para.format {
        PixelFormat::Nv12 | PixelFormat::Nv21 => vec![
            plane(0, w, h, hs, 1),
            plane(luma_size, w / 2, h / 2, hs, 2),
        ],
        PixelFormat::Nv16 => vec![plane(0, w, h, hs, 1), plane(luma_size, w / 2, h, hs, 2)],
        PixelFormat::I420 => {
            let chroma = (hs / 2) * (vs / 2);
            vec![
                plane(0, w, h, hs, 1),
                plane(luma_size, w / 2, h / 2, hs / 2, 1),
                plane(luma_size + chroma, w / 2, h / 2, hs / 2, 1),
            ]
        }
        // Macro-pixels of two pixels in four bytes.
        PixelFormat::Yuyv | PixelFormat::Uyvy => vec![plane(0, w / 2, h, hs * 2, 4)],
        other => {
            let bpp = other.packed_bytes_per_pixel().unwrap_or(1);
            vec![plane(0, w, h, hs * bpp, bpp)]
        }
    }
}

const fn plane(offset: usize, width: usize, height: usize, pitch: usize, bytes_per_pixel: usize) -> Plane {
    Plane {
        offset,
        width,
        height,
        pitch,
        bytes_per_pixel,
    }
}

/// Source coordinate for output pixel `(x, y)`.
///
/// The output is the source scaled to `out` dimensions and then rotated, so
/// the inverse rotation runs first, in the unrotated output space.
fn source_coord(rotation: Rotation, x: usize, y: usize, out: &Plane, src: &Plane) -> (usize, usize) {
    let (uw, uh) = if rotation.swaps_dimensions() {
        (out.height, out.width)
    } else {
        (out.width, out.height)
    };
    let (ux, uy) = match rotation {
        Rotation::None => (x, y),
        Rotation::Rotate90 => (y, uh - 1 - x),
        Rotation::Rotate180 => (uw - 1 - x, uh - 1 - y),
        Rotation::Rotate270 => (uw - 1 - y, x),
        Rotation::HFlip => (uw - 1 - x, y),
        Rotation::VFlip => (x, uh - 1 - y),
    };
    let sx = (ux * src.width / uw).min(src.width - 1);
    let sy = (uy * src.height / uh).min(src.height - 1);
    (sx, sy)
}

fn map_plane(input: &[u8], src: &Plane, output: &mut [u8], out: &Plane, rotation: Rotation, swap_rb: bool) {
    if src.width == 0 || src.height == 0 || out.width == 0 || out.height == 0 {
        return;
    }
    let bpp = out.bytes_per_pixel;
    for y in 0..out.height {
        let row = out.offset + y * out.pitch;
        for x in 0..out.width {
            let (sx, sy) = source_coord(rotation, x, y, out, src);
            let from = src.offset + sy * src.pitch + sx * src.bytes_per_pixel;
            let to = row + x * bpp;
            output[to..to + bpp].copy_from_slice(&input[from..from + bpp]);
            if swap_rb {
                output.swap(to, to + 2);
            }
        }
    }
}

/// Write `input` (described by `from`) into `output` as `to`.
fn transform_frame(input: &[u8], from: &ImagePara, output: &mut [u8], to: &ImagePara, rotation: Rotation) {
    let src_planes = planes(from);
    let dst_planes = planes(to);
    let swap_rb = matches!(
        (from.format, to.format),
        (PixelFormat::Rgb24, PixelFormat::Bgr24) | (PixelFormat::Bgr24, PixelFormat::Rgb24)
    );
    // Gray output from NV12 keeps the luma plane only.
    for (src, dst) in src_planes.iter().zip(dst_planes.iter()) {
        map_plane(input, src, output, dst, rotation, swap_rb);
    }
}
