//! Format negotiation: which stages go between a source and a target.
//!
//! Pure functions over [`ImagePara`]; the assembler calls them with the
//! parameters each stage negotiated at `init()`.

use crate::format::{ImagePara, PixelFormat, Rotation};

/// Whether frames in `format` need a decoder before raw processing.
pub fn needs_decode(format: PixelFormat) -> bool {
    format.is_compressed()
}

/// The output geometry requested by `target`, resolved against `source`.
///
/// Unsized targets (width or height 0) take the source geometry, strides
/// included. Sized targets are aligned up to 8 with strides equal to the
/// aligned dimensions. `format: None` keeps the source format.
pub fn resolve_target(source: &ImagePara, target: &ImagePara, format: Option<PixelFormat>) -> ImagePara {
    let format = format.unwrap_or(source.format);
    if target.is_unsized() {
        ImagePara { format, ..*source }
    } else {
        ImagePara::new(target.width, target.height, format).aligned()
    }
}

/// Decide whether a transform stage is needed and what it must produce.
///
/// For 90°/270° the target dimensions and strides are swapped first, since
/// rotation changes the output frame's orientation; the comparison against
/// `current` then runs on the swapped target. Any rotation or mirror always
/// needs a transform.
pub fn plan_transform(current: &ImagePara, target: &ImagePara, rotation: Rotation) -> Option<ImagePara> {
    let target = if rotation.swaps_dimensions() {
        target.swapped()
    } else {
        *target
    };
    (rotation != Rotation::None || target.differs_from(current)).then_some(target)
}

// ============================================================================
// Tiling
// ============================================================================

/// A window on a display surface.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct WindowRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Near-square grid of cells for instances sharing one display surface.
///
/// `columns` is `ceil(sqrt(n))`; `rows` is the smallest count with
/// `rows * columns >= n`.
///
/// ```rust
/// use stagegraph::pipeline::TileLayout;
///
/// let layout = TileLayout::for_count(5);
/// assert_eq!((layout.columns, layout.rows), (3, 2));
/// assert_eq!(layout.cell(4), (1, 1));
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TileLayout {
    pub columns: u32,
    pub rows: u32,
}

impl TileLayout {
    pub fn for_count(count: usize) -> Self {
        let n = count.max(1) as u32;
        let s = n.isqrt();
        if s * s >= n {
            return Self { columns: s, rows: s };
        }
        let rows = if s * (s + 1) < n { s + 1 } else { s };
        Self {
            columns: s + 1,
            rows,
        }
    }

    /// `(column, row)` of instance `index`.
    pub fn cell(&self, index: usize) -> (u32, u32) {
        let index = index as u32;
        (index % self.columns, index / self.columns)
    }

    /// Window for instance `index` on a `surface_width` x `surface_height`
    /// surface: the frame, clipped to its cell, centered in the cell.
    pub fn window(&self, index: usize, surface_width: u32, surface_height: u32, frame: &ImagePara) -> WindowRect {
        let (column, row) = self.cell(index);
        let cell_width = surface_width / self.columns;
        let cell_height = surface_height / self.rows;
        let width = cell_width.min(frame.width);
        let height = cell_height.min(frame.height);
        WindowRect {
            x: (cell_width - width) / 2 + column * cell_width,
            y: (cell_height - height) / 2 + row * cell_height,
            width,
            height,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_needs_decode() {
        assert!(needs_decode(PixelFormat::H264));
        assert!(needs_decode(PixelFormat::H265));
        assert!(needs_decode(PixelFormat::Mjpeg));
        assert!(!needs_decode(PixelFormat::Nv12));
    }

    #[test]
    fn test_resolve_unsized_takes_source() {
        let source = ImagePara::with_strides(1920, 1080, 1920, 1088, PixelFormat::Nv12);
        let resolved = resolve_target(&source, &ImagePara::default(), None);
        assert_eq!(resolved, source);

        let resolved = resolve_target(&source, &ImagePara::default(), Some(PixelFormat::Rgb24));
        assert_eq!(resolved.format, PixelFormat::Rgb24);
        assert_eq!(resolved.vstride, 1088);
    }

    #[test]
    fn test_resolve_aligns() {
        let source = ImagePara::new(1920, 1080, PixelFormat::Nv12);
        let target = ImagePara::new(637, 479, PixelFormat::Nv12);
        let resolved = resolve_target(&source, &target, None);
        assert_eq!(resolved, ImagePara::new(640, 480, PixelFormat::Nv12));
        assert_eq!(resolve_target(&source, &resolved, None), resolved);
    }

    #[test]
    fn test_rotation_geometry() {
        let source = ImagePara::new(1920, 1080, PixelFormat::Nv12);
        let target = resolve_target(&source, &ImagePara::new(1920, 1080, PixelFormat::Nv12), None);
        let planned = plan_transform(&source, &target, Rotation::Rotate90).unwrap();
        assert_eq!(planned.width, 1080);
        assert_eq!(planned.height, 1920);
        assert_eq!(planned.hstride, 1080);
        assert_eq!(planned.vstride, 1920);
    }

    #[test]
    fn test_no_transform_when_equal() {
        let source = ImagePara::new(640, 480, PixelFormat::Nv12);
        assert_eq!(plan_transform(&source, &source, Rotation::None), None);
    }

    #[test]
    fn test_transform_on_difference() {
        let source = ImagePara::new(640, 480, PixelFormat::Nv12);
        let scaled = ImagePara::new(320, 240, PixelFormat::Nv12);
        assert_eq!(plan_transform(&source, &scaled, Rotation::None), Some(scaled));

        let converted = ImagePara::new(640, 480, PixelFormat::Rgb24);
        assert_eq!(plan_transform(&source, &converted, Rotation::None), Some(converted));

        // A mirror keeps the geometry but still needs the transform.
        assert_eq!(plan_transform(&source, &source, Rotation::HFlip), Some(source));
    }

    #[test]
    fn test_square_source_rotation_still_transforms() {
        let source = ImagePara::new(480, 480, PixelFormat::Nv12);
        assert_eq!(plan_transform(&source, &source, Rotation::Rotate270), Some(source));
    }

    #[test]
    fn test_tile_layout() {
        let cases = [(1, 1, 1), (2, 2, 1), (3, 2, 2), (4, 2, 2), (5, 3, 2), (7, 3, 3), (9, 3, 3), (10, 4, 3)];
        for (n, columns, rows) in cases {
            let layout = TileLayout::for_count(n);
            assert_eq!((layout.columns, layout.rows), (columns, rows), "n = {n}");
            assert!(layout.columns * layout.rows >= n as u32);
        }
    }

    #[test]
    fn test_tile_for_five() {
        let layout = TileLayout::for_count(5);
        assert_eq!(layout.cell(4), (1, 1));
        assert_eq!(layout.cell(2), (2, 0));
        assert_eq!(layout.cell(3), (0, 1));
    }

    #[test]
    fn test_window_centered_in_cell() {
        let layout = TileLayout::for_count(4);
        // 1920x1080 surface, 2x2 cells of 960x540.
        let small = ImagePara::new(640, 480, PixelFormat::Nv12);
        let rect = layout.window(3, 1920, 1080, &small);
        assert_eq!(
            rect,
            WindowRect {
                x: 960 + 160,
                y: 540 + 30,
                width: 640,
                height: 480
            }
        );

        // A frame larger than its cell is clipped to the cell.
        let large = ImagePara::new(1920, 1080, PixelFormat::Nv12);
        let rect = layout.window(1, 1920, 1080, &large);
        assert_eq!(
            rect,
            WindowRect {
                x: 960,
                y: 0,
                width: 960,
                height: 540
            }
        );
    }
}
