// ============================================================================
// CANVAS TRANSFORMS — flip, rotate, crop, resize for every layer at once
// ============================================================================
//
// A transform maps one canvas-sized buffer to another.  The same transform is
// applied to each layer's pixels and mask, so the stack stays consistent.
// Undo keeps the layers from before (see `LayerOperation::Canvas`).

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use image::{ImageBuffer, Luma, Pixel, imageops};
use rayon::prelude::*;

use crate::error::{EngineError, Result};
use crate::io::MAX_CANVAS_DIM;
use crate::layer::Layer;
use crate::pixels::{CHANNELS, CoverageBuffer, MAX_PIXELS, PixelBuffer, Rect};

/// Interpolation method for image scaling.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Interpolation {
    Nearest,
    #[default]
    Bilinear,
    Bicubic,
    Lanczos3,
}

impl Interpolation {
    pub fn all() -> &'static [Interpolation] {
        &[
            Interpolation::Nearest,
            Interpolation::Bilinear,
            Interpolation::Bicubic,
            Interpolation::Lanczos3,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Interpolation::Nearest => "nearest",
            Interpolation::Bilinear => "bilinear",
            Interpolation::Bicubic => "bicubic",
            Interpolation::Lanczos3 => "lanczos3",
        }
    }

    pub fn to_filter(&self) -> imageops::FilterType {
        match self {
            Interpolation::Nearest => imageops::FilterType::Nearest,
            Interpolation::Bilinear => imageops::FilterType::Triangle,
            Interpolation::Bicubic => imageops::FilterType::CatmullRom,
            Interpolation::Lanczos3 => imageops::FilterType::Lanczos3,
        }
    }
}

/// Where the old content sits on a resized canvas.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Anchor {
    TopLeft,
    Top,
    TopRight,
    Left,
    #[default]
    Center,
    Right,
    BottomLeft,
    Bottom,
    BottomRight,
}

impl Anchor {
    pub fn all() -> &'static [Anchor] {
        &[
            Anchor::TopLeft,
            Anchor::Top,
            Anchor::TopRight,
            Anchor::Left,
            Anchor::Center,
            Anchor::Right,
            Anchor::BottomLeft,
            Anchor::Bottom,
            Anchor::BottomRight,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Anchor::TopLeft => "top-left",
            Anchor::Top => "top",
            Anchor::TopRight => "top-right",
            Anchor::Left => "left",
            Anchor::Center => "center",
            Anchor::Right => "right",
            Anchor::BottomLeft => "bottom-left",
            Anchor::Bottom => "bottom",
            Anchor::BottomRight => "bottom-right",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        let wanted = name.trim().to_lowercase().replace('_', "-");
        Anchor::all()
            .iter()
            .copied()
            .find(|a| a.name() == wanted)
            .ok_or_else(|| EngineError::unsupported(format!("anchor '{}'", name)))
    }

    /// Column / row placement: 0 start, 1 centre, 2 end.
    fn grid(&self) -> (u8, u8) {
        match self {
            Anchor::TopLeft => (0, 0),
            Anchor::Top => (1, 0),
            Anchor::TopRight => (2, 0),
            Anchor::Left => (0, 1),
            Anchor::Center => (1, 1),
            Anchor::Right => (2, 1),
            Anchor::BottomLeft => (0, 2),
            Anchor::Bottom => (1, 2),
            Anchor::BottomRight => (2, 2),
        }
    }

    /// Offset of the old canvas's top-left corner inside the new one.
    pub fn offset(&self, old: (u32, u32), new: (u32, u32)) -> (i64, i64) {
        let place = |slot: u8, old: u32, new: u32| -> i64 {
            let diff = new as i64 - old as i64;
            match slot {
                0 => 0,
                1 => diff / 2,
                _ => diff,
            }
        };
        let (gx, gy) = self.grid();
        (place(gx, old.0, new.0), place(gy, old.1, new.1))
    }
}

/// A geometry change applied to the whole canvas.
#[derive(Clone, Debug, PartialEq)]
pub enum CanvasTransform {
    FlipHorizontal,
    FlipVertical,
    /// Quarter turn clockwise; swaps width and height.
    Rotate90,
    Rotate180,
    /// Quarter turn counter-clockwise; swaps width and height.
    Rotate270,
    /// Free rotation about the centre, positive is counter-clockwise.  The
    /// canvas keeps its size; uncovered pixels become transparent.
    Rotate { degrees: f32 },
    /// Keep only `rect`, clamped to the canvas.
    Crop(Rect),
    /// Change the canvas size without scaling; new area is transparent.
    ResizeCanvas { width: u32, height: u32, anchor: Anchor },
    /// Resample every layer to a new size.
    Scale {
        width: u32,
        height: u32,
        interpolation: Interpolation,
    },
}

fn check_dims(width: u32, height: u32) -> Result<()> {
    if width == 0 || height == 0 || width > MAX_CANVAS_DIM || height > MAX_CANVAS_DIM {
        return Err(EngineError::out_of_range(format!(
            "canvas {}×{} outside 1..={} per side",
            width, height, MAX_CANVAS_DIM
        )));
    }
    if width as u64 * height as u64 > MAX_PIXELS {
        return Err(EngineError::ResourceExhausted(format!(
            "{}×{} exceeds the {} pixel limit",
            width, height, MAX_PIXELS
        )));
    }
    Ok(())
}

impl CanvasTransform {
    /// Canvas size after the transform, or why it cannot be applied to a
    /// `width`×`height` canvas.
    pub fn output_size(&self, width: u32, height: u32) -> Result<(u32, u32)> {
        let size = match self {
            CanvasTransform::FlipHorizontal | CanvasTransform::FlipVertical | CanvasTransform::Rotate180 => {
                (width, height)
            }
            CanvasTransform::Rotate90 | CanvasTransform::Rotate270 => (height, width),
            CanvasTransform::Rotate { degrees } => {
                if !degrees.is_finite() {
                    return Err(EngineError::out_of_range(format!(
                        "rotation must be finite, got {}",
                        degrees
                    )));
                }
                (width, height)
            }
            CanvasTransform::Crop(rect) => {
                let clamped = clamp_crop(*rect, width, height);
                if clamped.is_empty() {
                    return Err(EngineError::out_of_range(format!(
                        "crop {:?} misses the {}×{} canvas",
                        rect, width, height
                    )));
                }
                (clamped.width, clamped.height)
            }
            CanvasTransform::ResizeCanvas { width: w, height: h, .. }
            | CanvasTransform::Scale { width: w, height: h, .. } => (*w, *h),
        };
        check_dims(size.0, size.1)?;
        Ok(size)
    }

    pub fn apply_to_pixels(&self, src: &PixelBuffer) -> Result<PixelBuffer> {
        let (w, h) = src.dimensions();
        let (nw, nh) = self.output_size(w, h)?;
        match self {
            CanvasTransform::Crop(rect) => src.crop(clamp_crop(*rect, w, h)),
            CanvasTransform::ResizeCanvas { anchor, .. } => {
                let mut out = PixelBuffer::new(nw, nh)?;
                let offset = anchor.offset((w, h), (nw, nh));
                place(src.as_raw(), (w, h), out.as_raw_mut(), (nw, nh), CHANNELS, offset);
                Ok(out)
            }
            CanvasTransform::Rotate { degrees } => {
                let mut out = PixelBuffer::new(w, h)?;
                rotate_samples(
                    src.as_raw(),
                    (w, h),
                    CHANNELS,
                    *degrees,
                    out.as_raw_mut(),
                    |v: u8| v as f32,
                    |v: f32| v.round().clamp(0.0, 255.0) as u8,
                );
                Ok(out)
            }
            _ => Ok(PixelBuffer::from_rgba_image(self.remap_image(&src.to_rgba_image()))),
        }
    }

    /// Same geometry for a layer mask or selection.
    pub fn apply_to_coverage(&self, src: &CoverageBuffer) -> Result<CoverageBuffer> {
        let (w, h) = src.dimensions();
        let (nw, nh) = self.output_size(w, h)?;
        match self {
            CanvasTransform::Crop(rect) => src.crop(clamp_crop(*rect, w, h)),
            CanvasTransform::ResizeCanvas { anchor, .. } => {
                let mut out = CoverageBuffer::new(nw, nh)?;
                let offset = anchor.offset((w, h), (nw, nh));
                place(src.as_raw(), (w, h), out.data_mut(), (nw, nh), 1, offset);
                Ok(out)
            }
            CanvasTransform::Rotate { degrees } => {
                let mut out = CoverageBuffer::new(w, h)?;
                rotate_samples(src.as_raw(), (w, h), 1, *degrees, out.data_mut(), |v: f32| v, |v: f32| v);
                Ok(out)
            }
            _ => {
                let plane: ImageBuffer<Luma<f32>, Vec<f32>> = ImageBuffer::from_raw(w, h, src.as_raw().to_vec())
                    .ok_or_else(|| EngineError::invalid_state("coverage length does not match its size"))?;
                let out = self.remap_image(&plane);
                CoverageBuffer::from_raw(nw, nh, out.into_raw())
            }
        }
    }

    /// Flips, quarter turns and scaling through `imageops`.
    fn remap_image<P>(&self, img: &ImageBuffer<P, Vec<P::Subpixel>>) -> ImageBuffer<P, Vec<P::Subpixel>>
    where
        P: Pixel + 'static,
        P::Subpixel: 'static,
    {
        match self {
            CanvasTransform::FlipHorizontal => imageops::flip_horizontal(img),
            CanvasTransform::FlipVertical => imageops::flip_vertical(img),
            CanvasTransform::Rotate90 => imageops::rotate90(img),
            CanvasTransform::Rotate180 => imageops::rotate180(img),
            CanvasTransform::Rotate270 => imageops::rotate270(img),
            CanvasTransform::Scale {
                width,
                height,
                interpolation,
            } => imageops::resize(img, *width, *height, interpolation.to_filter()),
            CanvasTransform::Rotate { .. } | CanvasTransform::Crop(_) | CanvasTransform::ResizeCanvas { .. } => {
                img.clone()
            }
        }
    }

    /// History label.
    pub fn label(&self) -> String {
        match self {
            CanvasTransform::FlipHorizontal => "Flip Canvas Horizontal".to_string(),
            CanvasTransform::FlipVertical => "Flip Canvas Vertical".to_string(),
            CanvasTransform::Rotate90 => "Rotate Canvas 90° CW".to_string(),
            CanvasTransform::Rotate180 => "Rotate Canvas 180°".to_string(),
            CanvasTransform::Rotate270 => "Rotate Canvas 90° CCW".to_string(),
            CanvasTransform::Rotate { degrees } => format!("Rotate Canvas {}°", degrees),
            CanvasTransform::Crop(r) => format!("Crop: {}×{}", r.width, r.height),
            CanvasTransform::ResizeCanvas { width, height, .. } => {
                format!("Resize Canvas: {}×{}", width, height)
            }
            CanvasTransform::Scale { width, height, .. } => format!("Resize Image: {}×{}", width, height),
        }
    }
}

fn clamp_crop(rect: Rect, width: u32, height: u32) -> Rect {
    let x = rect.x.min(width);
    let y = rect.y.min(height);
    let right = rect.x.saturating_add(rect.width).min(width);
    let bottom = rect.y.saturating_add(rect.height).min(height);
    Rect::new(x, y, right - x, bottom - y)
}

/// Copy the overlap of `src` into `dst` with `src`'s origin at `offset`.
fn place<T: Copy>(src: &[T], src_dims: (u32, u32), dst: &mut [T], dst_dims: (u32, u32), channels: usize, offset: (i64, i64)) {
    let (sw, sh) = (src_dims.0 as i64, src_dims.1 as i64);
    let (dw, dh) = (dst_dims.0 as i64, dst_dims.1 as i64);
    let x0 = offset.0.max(0);
    let x1 = (offset.0 + sw).min(dw);
    if x0 >= x1 {
        return;
    }
    let run = (x1 - x0) as usize * channels;
    for dy in offset.1.max(0)..(offset.1 + sh).min(dh) {
        let sy = dy - offset.1;
        let si = ((sy * sw + (x0 - offset.0)) as usize) * channels;
        let di = ((dy * dw + x0) as usize) * channels;
        dst[di..di + run].copy_from_slice(&src[si..si + run]);
    }
}

/// Bilinear rotation about the canvas centre.  Samples outside the source
/// contribute zero.
fn rotate_samples<T, In, Out>(
    src: &[T],
    dims: (u32, u32),
    channels: usize,
    degrees: f32,
    dst: &mut [T],
    to_f: In,
    from_f: Out,
) where
    T: Copy + Send + Sync,
    In: Fn(T) -> f32 + Sync,
    Out: Fn(f32) -> T + Sync,
{
    let (w, h) = (dims.0 as usize, dims.1 as usize);
    if w == 0 || h == 0 {
        return;
    }
    let (sin, cos) = degrees.to_radians().sin_cos();
    let cx = w as f32 / 2.0;
    let cy = h as f32 / 2.0;
    // Land exactly on source pixels for right angles.
    let snap = |v: f32| if (v - v.round()).abs() < 1e-4 { v.round() } else { v };

    dst.par_chunks_mut(w * channels).enumerate().for_each(|(y, row)| {
        let dy = y as f32 + 0.5 - cy;
        for x in 0..w {
            let dx = x as f32 + 0.5 - cx;
            let sx = snap(cos * dx - sin * dy + cx - 0.5);
            let sy = snap(sin * dx + cos * dy + cy - 0.5);
            let (x0, y0) = (sx.floor(), sy.floor());
            let (fx, fy) = (sx - x0, sy - y0);
            let taps = [
                (0i64, 0i64, (1.0 - fx) * (1.0 - fy)),
                (1, 0, fx * (1.0 - fy)),
                (0, 1, (1.0 - fx) * fy),
                (1, 1, fx * fy),
            ];
            let mut acc = [0.0f32; CHANNELS];
            for (ox, oy, weight) in taps {
                if weight <= 0.0 {
                    continue;
                }
                let px = x0 as i64 + ox;
                let py = y0 as i64 + oy;
                if px < 0 || py < 0 || px >= w as i64 || py >= h as i64 {
                    continue;
                }
                let i = (py as usize * w + px as usize) * channels;
                for c in 0..channels {
                    acc[c] += to_f(src[i + c]) * weight;
                }
            }
            let o = x * channels;
            for c in 0..channels {
                row[o + c] = from_f(acc[c]);
            }
        }
    });
}

/// The layer with its pixels (and mask) run through `transform`.  Id and
/// metadata are kept; the revision moves on.
pub(crate) fn transform_layer(layer: &Layer, transform: &CanvasTransform) -> Result<Layer> {
    let mut out = layer.clone();
    out.set_pixels(Arc::new(transform.apply_to_pixels(layer.pixels())?));
    if let Some(mask) = layer.mask() {
        out.set_mask(Some(Arc::new(transform.apply_to_coverage(mask)?)));
    }
    Ok(out)
}

/// Transform every layer in parallel.
pub(crate) fn transform_layers(layers: &[Layer], transform: &CanvasTransform) -> Result<Vec<Layer>> {
    layers
        .par_iter()
        .map(|layer| transform_layer(layer, transform))
        .collect()
}

fn parse_dims(kind: &str, args: &[&str]) -> Result<(u32, u32)> {
    let num = |i: usize| -> Result<u32> {
        let raw = args
            .get(i)
            .ok_or_else(|| EngineError::out_of_range(format!("{} needs width,height", kind)))?;
        raw.trim()
            .parse::<u32>()
            .map_err(|e| EngineError::out_of_range(format!("{}: bad size '{}': {}", kind, raw, e)))
    };
    Ok((num(0)?, num(1)?))
}

/// `flip_h` | `flip_v` | `rotate_cw` | `rotate_ccw` | `rotate_180` |
/// `rotate:deg` | `crop:x,y,w,h` | `canvas:w,h[,anchor]` | `scale:w,h[,interp]`
impl FromStr for CanvasTransform {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        let (kind, rest) = s.trim().split_once(':').unwrap_or((s.trim(), ""));
        let kind = kind.trim().to_lowercase().replace('-', "_");
        let args: Vec<&str> = if rest.is_empty() { Vec::new() } else { rest.split(',').collect() };
        let transform = match kind.as_str() {
            "flip_h" | "flip_horizontal" => CanvasTransform::FlipHorizontal,
            "flip_v" | "flip_vertical" => CanvasTransform::FlipVertical,
            "rotate_cw" | "rotate_90" => CanvasTransform::Rotate90,
            "rotate_180" => CanvasTransform::Rotate180,
            "rotate_ccw" | "rotate_270" => CanvasTransform::Rotate270,
            "rotate" => {
                let raw = args.first().ok_or_else(|| EngineError::out_of_range("rotate needs degrees"))?;
                let degrees = raw
                    .trim()
                    .parse::<f32>()
                    .map_err(|e| EngineError::out_of_range(format!("rotate: bad angle '{}': {}", raw, e)))?;
                CanvasTransform::Rotate { degrees }
            }
            "crop" => {
                if args.len() != 4 {
                    return Err(EngineError::out_of_range("crop needs x,y,w,h"));
                }
                let (x, y) = parse_dims("crop", &args[0..2])?;
                let (w, h) = parse_dims("crop", &args[2..4])?;
                CanvasTransform::Crop(Rect::new(x, y, w, h))
            }
            "canvas" | "resize_canvas" => {
                let (width, height) = parse_dims("canvas", &args)?;
                let anchor = match args.get(2) {
                    Some(name) => Anchor::from_name(name)?,
                    None => Anchor::Center,
                };
                CanvasTransform::ResizeCanvas { width, height, anchor }
            }
            "scale" | "resize" => {
                let (width, height) = parse_dims("scale", &args)?;
                let interpolation = match args.get(2) {
                    Some(name) => {
                        let wanted = name.trim().to_lowercase();
                        Interpolation::all()
                            .iter()
                            .copied()
                            .find(|i| i.name() == wanted)
                            .ok_or_else(|| EngineError::unsupported(format!("interpolation '{}'", name)))?
                    }
                    None => Interpolation::default(),
                };
                CanvasTransform::Scale {
                    width,
                    height,
                    interpolation,
                }
            }
            other => return Err(EngineError::unsupported(format!("transform '{}'", other))),
        };
        Ok(transform)
    }
}

impl fmt::Display for CanvasTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CanvasTransform::FlipHorizontal => f.write_str("flip_h"),
            CanvasTransform::FlipVertical => f.write_str("flip_v"),
            CanvasTransform::Rotate90 => f.write_str("rotate_cw"),
            CanvasTransform::Rotate180 => f.write_str("rotate_180"),
            CanvasTransform::Rotate270 => f.write_str("rotate_ccw"),
            CanvasTransform::Rotate { degrees } => write!(f, "rotate:{}", degrees),
            CanvasTransform::Crop(r) => write!(f, "crop:{},{},{},{}", r.x, r.y, r.width, r.height),
            CanvasTransform::ResizeCanvas { width, height, anchor } => {
                write!(f, "canvas:{},{},{}", width, height, anchor.name())
            }
            CanvasTransform::Scale {
                width,
                height,
                interpolation,
            } => write!(f, "scale:{},{},{}", width, height, interpolation.name()),
        }
    }
}
