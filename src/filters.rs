// ============================================================================
// FILTERS — pure pixel transforms, banded over rayon, selection-aware
// ============================================================================
//
// Every filter reads an immutable source buffer and writes a fresh one.
// Output rows are grouped into bands of `ComputeCtx::tile_rows`; the cancel
// token is checked between bands and the rows of one band run in parallel.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::error::{EngineError, Result};
use crate::pixels::{CHANNELS, CoverageBuffer, PixelBuffer, Rect, try_alloc};

// ============================================================================
// FILTER SPEC
// ============================================================================

#[derive(Clone, Debug, PartialEq)]
pub enum FilterSpec {
    /// Gaussian blur; `radius` is the standard deviation in pixels.
    Blur { radius: f32 },
    Sharpen,
    EdgeHighlight,
    Grayscale,
    /// Uniform noise of ±`level`×255 on RGB, reproducible from `seed`.
    Noise { level: f32, seed: u64 },
    /// `delta` in -1..=1, added as a fraction of full scale.
    Brightness { delta: f32 },
    /// `delta` in -1..=1; 0 is identity, -1 flattens to mid grey.
    Contrast { delta: f32 },
    /// `delta` in -1..=1; -1 is fully desaturated.
    Saturation { delta: f32 },
    HueRotate { degrees: f32 },
    Invert,
    Sepia,
    Posterize { levels: u32 },
    /// Luminance cut in 0..=1; brighter pixels become white.
    Threshold { level: f32 },
    Emboss,
    Pixelate { size: u32 },
    /// Edge darkening strength in 0..=1.
    Vignette { amount: f32 },
    /// Input range remap, gamma, output range; values on the 0..=255 scale.
    Levels {
        in_black: f32,
        in_white: f32,
        gamma: f32,
        out_black: f32,
        out_white: f32,
    },
    /// Tone curve through `(input, output)` control points, x strictly
    /// increasing.  Monotone cubic between points, flat beyond the ends.
    Curves { points: Vec<(u8, u8)> },
    /// Named pixel map looked up in a [`FilterRegistry`].
    Extension { name: String, params: Vec<f32> },
}

/// How far a filter reads around each output pixel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reach {
    /// Output depends on source pixels within `pad` of the same position.
    Local(u32),
    /// Output depends on absolute position (noise, pixel grid, vignette).
    Global,
}

fn check_finite(name: &str, v: f32) -> Result<()> {
    if v.is_finite() {
        Ok(())
    } else {
        Err(EngineError::out_of_range(format!("{} must be finite, got {}", name, v)))
    }
}

/// Largest accepted blur radius.  The kernel spans ±3σ, so this caps a
/// single kernel at 6001 taps.
pub const MAX_BLUR_RADIUS: f32 = 1000.0;

fn check_level(name: &str, v: f32) -> Result<()> {
    check_finite(name, v)?;
    if !(0.0..=255.0).contains(&v) {
        return Err(EngineError::out_of_range(format!("{} {} outside 0..=255", name, v)));
    }
    Ok(())
}

fn check_unit(name: &str, v: f32, lo: f32) -> Result<()> {
    check_finite(name, v)?;
    if v < lo || v > 1.0 {
        return Err(EngineError::out_of_range(format!(
            "{} {} outside {}..=1",
            name, v, lo
        )));
    }
    Ok(())
}

impl FilterSpec {
    pub fn name(&self) -> &str {
        match self {
            FilterSpec::Blur { .. } => "blur",
            FilterSpec::Sharpen => "sharpen",
            FilterSpec::EdgeHighlight => "edge_highlight",
            FilterSpec::Grayscale => "grayscale",
            FilterSpec::Noise { .. } => "noise",
            FilterSpec::Brightness { .. } => "brightness",
            FilterSpec::Contrast { .. } => "contrast",
            FilterSpec::Saturation { .. } => "saturation",
            FilterSpec::HueRotate { .. } => "hue_rotate",
            FilterSpec::Invert => "invert",
            FilterSpec::Sepia => "sepia",
            FilterSpec::Posterize { .. } => "posterize",
            FilterSpec::Threshold { .. } => "threshold",
            FilterSpec::Emboss => "emboss",
            FilterSpec::Pixelate { .. } => "pixelate",
            FilterSpec::Vignette { .. } => "vignette",
            FilterSpec::Levels { .. } => "levels",
            FilterSpec::Curves { .. } => "curves",
            FilterSpec::Extension { name, .. } => name,
        }
    }

    /// Reject parameter values no filter can honour.
    pub fn validate(&self) -> Result<()> {
        match self {
            FilterSpec::Blur { radius } => check_blur_radius(*radius)?,
            FilterSpec::Noise { level, .. } => check_unit("noise level", *level, 0.0)?,
            FilterSpec::Brightness { delta } => check_unit("brightness delta", *delta, -1.0)?,
            FilterSpec::Contrast { delta } => check_unit("contrast delta", *delta, -1.0)?,
            FilterSpec::Saturation { delta } => check_unit("saturation delta", *delta, -1.0)?,
            FilterSpec::HueRotate { degrees } => check_finite("hue rotation", *degrees)?,
            FilterSpec::Posterize { levels } => {
                if !(2..=256).contains(levels) {
                    return Err(EngineError::out_of_range(format!(
                        "posterize levels {} outside 2..=256",
                        levels
                    )));
                }
            }
            FilterSpec::Threshold { level } => check_unit("threshold level", *level, 0.0)?,
            FilterSpec::Pixelate { size } => {
                if *size == 0 {
                    return Err(EngineError::out_of_range("pixelate size must be at least 1"));
                }
            }
            FilterSpec::Vignette { amount } => check_unit("vignette amount", *amount, 0.0)?,
            FilterSpec::Levels {
                in_black,
                in_white,
                gamma,
                out_black,
                out_white,
            } => {
                check_level("levels input black", *in_black)?;
                check_level("levels input white", *in_white)?;
                check_level("levels output black", *out_black)?;
                check_level("levels output white", *out_white)?;
                if in_black >= in_white {
                    return Err(EngineError::out_of_range(format!(
                        "levels input black {} must be below input white {}",
                        in_black, in_white
                    )));
                }
                check_finite("levels gamma", *gamma)?;
                if !(MIN_GAMMA..=MAX_GAMMA).contains(gamma) {
                    return Err(EngineError::out_of_range(format!(
                        "levels gamma {} outside {}..={}",
                        gamma, MIN_GAMMA, MAX_GAMMA
                    )));
                }
            }
            FilterSpec::Curves { points } => {
                if points.len() < 2 {
                    return Err(EngineError::out_of_range("curves need at least two points"));
                }
                if points.windows(2).any(|w| w[0].0 >= w[1].0) {
                    return Err(EngineError::out_of_range(
                        "curve points must have strictly increasing inputs",
                    ));
                }
            }
            FilterSpec::Extension { name, params } => {
                if name.is_empty() {
                    return Err(EngineError::unsupported("extension filter without a name"));
                }
                for p in params {
                    check_finite("extension parameter", *p)?;
                }
            }
            FilterSpec::Sharpen
            | FilterSpec::EdgeHighlight
            | FilterSpec::Grayscale
            | FilterSpec::Invert
            | FilterSpec::Sepia
            | FilterSpec::Emboss => {}
        }
        Ok(())
    }

    pub fn reach(&self) -> Reach {
        match self {
            FilterSpec::Blur { radius } => {
                Reach::Local(u32::try_from(kernel_radius(*radius)).unwrap_or(u32::MAX))
            }
            FilterSpec::Sharpen | FilterSpec::EdgeHighlight | FilterSpec::Emboss => Reach::Local(1),
            FilterSpec::Noise { .. } | FilterSpec::Pixelate { .. } | FilterSpec::Vignette { .. } => {
                Reach::Global
            }
            FilterSpec::Grayscale
            | FilterSpec::Brightness { .. }
            | FilterSpec::Contrast { .. }
            | FilterSpec::Saturation { .. }
            | FilterSpec::HueRotate { .. }
            | FilterSpec::Invert
            | FilterSpec::Sepia
            | FilterSpec::Posterize { .. }
            | FilterSpec::Threshold { .. }
            | FilterSpec::Levels { .. }
            | FilterSpec::Curves { .. }
            | FilterSpec::Extension { .. } => Reach::Local(0),
        }
    }

    /// Same filter with spatial parameters scaled for a resized image
    /// (previews run on a downsampled copy).
    pub fn scaled(&self, factor: f32) -> FilterSpec {
        match self {
            FilterSpec::Blur { radius } => FilterSpec::Blur {
                radius: radius * factor,
            },
            FilterSpec::Pixelate { size } => FilterSpec::Pixelate {
                size: ((*size as f32 * factor).round() as u32).max(1),
            },
            other => other.clone(),
        }
    }
}

/// Text form used on the command line: `kind[:param[:param…]]`,
/// e.g. `blur:5`, `noise:0.2:7`, `ext:solarize:0.5`.
impl FromStr for FilterSpec {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.trim().split(':');
        let kind = parts.next().unwrap_or_default().trim().to_lowercase().replace('-', "_");
        let args: Vec<&str> = parts.map(str::trim).collect();

        let float = |i: usize| -> Result<f32> {
            let raw = args
                .get(i)
                .ok_or_else(|| EngineError::out_of_range(format!("{} needs parameter {}", kind, i + 1)))?;
            raw.parse::<f32>()
                .map_err(|e| EngineError::out_of_range(format!("{}: bad number '{}': {}", kind, raw, e)))
        };
        let uint = |i: usize| -> Result<u32> {
            let raw = args
                .get(i)
                .ok_or_else(|| EngineError::out_of_range(format!("{} needs parameter {}", kind, i + 1)))?;
            raw.parse::<u32>()
                .map_err(|e| EngineError::out_of_range(format!("{}: bad integer '{}': {}", kind, raw, e)))
        };

        let spec = match kind.as_str() {
            "blur" => FilterSpec::Blur { radius: float(0)? },
            "sharpen" => FilterSpec::Sharpen,
            "edge_highlight" | "edge" => FilterSpec::EdgeHighlight,
            "grayscale" | "greyscale" | "gray" => FilterSpec::Grayscale,
            "noise" => {
                let seed = match args.get(1) {
                    Some(raw) => raw.parse::<u64>().map_err(|e| {
                        EngineError::out_of_range(format!("noise: bad seed '{}': {}", raw, e))
                    })?,
                    None => 0,
                };
                FilterSpec::Noise {
                    level: float(0)?,
                    seed,
                }
            }
            "brightness" => FilterSpec::Brightness { delta: float(0)? },
            "contrast" => FilterSpec::Contrast { delta: float(0)? },
            "saturation" => FilterSpec::Saturation { delta: float(0)? },
            "hue_rotate" | "hue" => FilterSpec::HueRotate { degrees: float(0)? },
            "invert" => FilterSpec::Invert,
            "sepia" => FilterSpec::Sepia,
            "posterize" => FilterSpec::Posterize { levels: uint(0)? },
            "threshold" | "bw" => FilterSpec::Threshold { level: float(0)? },
            "emboss" => FilterSpec::Emboss,
            "pixelate" => FilterSpec::Pixelate { size: uint(0)? },
            "vignette" => FilterSpec::Vignette { amount: float(0)? },
            "levels" => FilterSpec::Levels {
                in_black: float(0)?,
                in_white: float(1)?,
                gamma: if args.len() > 2 { float(2)? } else { 1.0 },
                out_black: if args.len() > 3 { float(3)? } else { 0.0 },
                out_white: if args.len() > 4 { float(4)? } else { 255.0 },
            },
            "curves" => {
                let points = args
                    .iter()
                    .map(|raw| parse_curve_point(raw))
                    .collect::<Result<Vec<_>>>()?;
                FilterSpec::Curves { points }
            }
            "ext" => {
                let name = args
                    .first()
                    .filter(|n| !n.is_empty())
                    .ok_or_else(|| EngineError::unsupported("ext filter needs a name"))?
                    .to_string();
                let params = (1..args.len()).map(float).collect::<Result<Vec<_>>>()?;
                FilterSpec::Extension { name, params }
            }
            other => return Err(EngineError::unsupported(format!("filter '{}'", other))),
        };
        spec.validate()?;
        Ok(spec)
    }
}

/// `x,y` on the 0..=255 scale.
fn parse_curve_point(raw: &str) -> Result<(u8, u8)> {
    let (x, y) = raw
        .split_once(',')
        .ok_or_else(|| EngineError::out_of_range(format!("curves: point '{}' is not x,y", raw)))?;
    let coord = |v: &str| {
        v.trim()
            .parse::<u8>()
            .map_err(|e| EngineError::out_of_range(format!("curves: bad coordinate '{}': {}", v, e)))
    };
    Ok((coord(x)?, coord(y)?))
}

const MIN_GAMMA: f32 = 0.1;
const MAX_GAMMA: f32 = 10.0;

fn check_blur_radius(radius: f32) -> Result<()> {
    check_finite("blur radius", radius)?;
    if !(0.0..=MAX_BLUR_RADIUS).contains(&radius) {
        return Err(EngineError::out_of_range(format!(
            "blur radius {} outside 0..={}",
            radius, MAX_BLUR_RADIUS
        )));
    }
    Ok(())
}

impl fmt::Display for FilterSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterSpec::Blur { radius } => write!(f, "blur:{}", radius),
            FilterSpec::Noise { level, seed } => write!(f, "noise:{}:{}", level, seed),
            FilterSpec::Brightness { delta } => write!(f, "brightness:{}", delta),
            FilterSpec::Contrast { delta } => write!(f, "contrast:{}", delta),
            FilterSpec::Saturation { delta } => write!(f, "saturation:{}", delta),
            FilterSpec::HueRotate { degrees } => write!(f, "hue_rotate:{}", degrees),
            FilterSpec::Posterize { levels } => write!(f, "posterize:{}", levels),
            FilterSpec::Threshold { level } => write!(f, "threshold:{}", level),
            FilterSpec::Pixelate { size } => write!(f, "pixelate:{}", size),
            FilterSpec::Vignette { amount } => write!(f, "vignette:{}", amount),
            FilterSpec::Levels {
                in_black,
                in_white,
                gamma,
                out_black,
                out_white,
            } => write!(
                f,
                "levels:{}:{}:{}:{}:{}",
                in_black, in_white, gamma, out_black, out_white
            ),
            FilterSpec::Curves { points } => {
                f.write_str("curves")?;
                for (x, y) in points {
                    write!(f, ":{},{}", x, y)?;
                }
                Ok(())
            }
            FilterSpec::Extension { name, params } => {
                write!(f, "ext:{}", name)?;
                for p in params {
                    write!(f, ":{}", p)?;
                }
                Ok(())
            }
            other => f.write_str(other.name()),
        }
    }
}

// ============================================================================
// EXTENSION REGISTRY
// ============================================================================

/// A pure per-pixel map registered under a name.
pub trait PixelMap: Send + Sync {
    fn map(&self, px: [u8; 4], params: &[f32]) -> [u8; 4];

    fn validate(&self, _params: &[f32]) -> Result<()> {
        Ok(())
    }
}

impl<F> PixelMap for F
where
    F: Fn([u8; 4], &[f32]) -> [u8; 4] + Send + Sync,
{
    fn map(&self, px: [u8; 4], params: &[f32]) -> [u8; 4] {
        self(px, params)
    }
}

#[derive(Clone, Default)]
pub struct FilterRegistry {
    maps: HashMap<String, Arc<dyn PixelMap>>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the stock extension maps.
    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        reg.register("channel_swap", |px: [u8; 4], _: &[f32]| [px[2], px[1], px[0], px[3]]);
        reg.register("solarize", Solarize);
        reg
    }

    pub fn register(&mut self, name: impl Into<String>, map: impl PixelMap + 'static) {
        self.maps.insert(name.into(), Arc::new(map));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.maps.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.maps.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn PixelMap>> {
        self.maps
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::unsupported(format!("no extension filter named '{}'", name)))
    }
}

impl fmt::Debug for FilterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterRegistry").field("maps", &self.names()).finish()
    }
}

/// Inverts channels above a threshold (param 0, 0..=1, default 0.5).
struct Solarize;

impl PixelMap for Solarize {
    fn map(&self, px: [u8; 4], params: &[f32]) -> [u8; 4] {
        let cut = (params.first().copied().unwrap_or(0.5) * 255.0).round() as u8;
        let s = |v: u8| if v >= cut { 255 - v } else { v };
        [s(px[0]), s(px[1]), s(px[2]), px[3]]
    }

    fn validate(&self, params: &[f32]) -> Result<()> {
        match params.first() {
            Some(v) => check_unit("solarize threshold", *v, 0.0),
            None => Ok(()),
        }
    }
}

// ============================================================================
// CANCELLATION & COMPUTE CONTEXT
// ============================================================================

/// Cooperative cancel flag shared between the requester and a worker.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

pub const DEFAULT_TILE_ROWS: usize = 64;

#[derive(Clone, Debug)]
pub struct ComputeCtx {
    pub tile_rows: usize,
    pub cancel: CancelToken,
}

impl Default for ComputeCtx {
    fn default() -> Self {
        Self {
            tile_rows: DEFAULT_TILE_ROWS,
            cancel: CancelToken::new(),
        }
    }
}

impl ComputeCtx {
    pub fn new(tile_rows: usize, cancel: CancelToken) -> Self {
        Self {
            tile_rows: tile_rows.max(1),
            cancel,
        }
    }
}

/// Run `f(y, row)` for every row of `data`, band by band.
fn for_each_band<T, F>(data: &mut [T], row_len: usize, ctx: &ComputeCtx, f: F) -> Result<()>
where
    T: Send,
    F: Fn(usize, &mut [T]) + Sync,
{
    if row_len == 0 {
        return Ok(());
    }
    let rows_per_band = ctx.tile_rows.max(1);
    for (band, chunk) in data.chunks_mut(rows_per_band * row_len).enumerate() {
        ctx.cancel.check()?;
        let y0 = band * rows_per_band;
        chunk
            .par_chunks_mut(row_len)
            .enumerate()
            .for_each(|(dy, row)| f(y0 + dy, row));
    }
    ctx.cancel.check()
}

/// Fresh buffer whose rows are produced by `f(y, row_out)`.
fn render_rows<F>(w: u32, h: u32, ctx: &ComputeCtx, f: F) -> Result<PixelBuffer>
where
    F: Fn(usize, &mut [u8]) + Sync,
{
    let mut out = PixelBuffer::new(w, h)?;
    let stride = out.stride();
    for_each_band(out.as_raw_mut(), stride, ctx, f)?;
    Ok(out)
}

#[inline]
fn to_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

/// Per-pixel transform on (r, g, b, a) as 0..255 floats.
fn map_pixels<F>(src: &PixelBuffer, ctx: &ComputeCtx, transform: F) -> Result<PixelBuffer>
where
    F: Fn([f32; 4]) -> [f32; 4] + Sync,
{
    let stride = src.stride();
    let raw = src.as_raw();
    render_rows(src.width(), src.height(), ctx, |y, row_out| {
        let row_in = &raw[y * stride..(y + 1) * stride];
        for (o, i) in row_out.chunks_exact_mut(CHANNELS).zip(row_in.chunks_exact(CHANNELS)) {
            let px = transform([i[0] as f32, i[1] as f32, i[2] as f32, i[3] as f32]);
            o[0] = to_u8(px[0]);
            o[1] = to_u8(px[1]);
            o[2] = to_u8(px[2]);
            o[3] = to_u8(px[3]);
        }
    })
}

// ============================================================================
// KERNELS
// ============================================================================

/// Half-width of the Gaussian kernel: truncated at ceil(3σ).  Saturates
/// for absurd σ; callers bound σ first.
fn kernel_radius(sigma: f32) -> usize {
    (sigma * 3.0).ceil().max(0.0) as usize
}

fn build_gaussian_kernel(sigma: f32) -> Result<Vec<f32>> {
    check_blur_radius(sigma)?;
    let radius = kernel_radius(sigma);
    if radius == 0 || sigma <= 0.0 {
        return Ok(vec![1.0]);
    }
    let len = radius
        .checked_mul(2)
        .and_then(|n| n.checked_add(1))
        .ok_or_else(|| EngineError::ResourceExhausted(format!("blur kernel for sigma {}", sigma)))?;
    let mut kernel = Vec::new();
    kernel.try_reserve_exact(len).map_err(|e| {
        EngineError::ResourceExhausted(format!("cannot allocate {}-tap blur kernel: {}", len, e))
    })?;
    let s2 = 2.0 * sigma * sigma;
    kernel.extend((0..len).map(|i| {
        let x = i as f32 - radius as f32;
        (-x * x / s2).exp()
    }));
    let inv = 1.0 / kernel.iter().sum::<f32>();
    for v in &mut kernel {
        *v *= inv;
    }
    Ok(kernel)
}

/// Separable Gaussian blur with edge clamping.  σ above
/// [`MAX_BLUR_RADIUS`] is `OutOfRange`.
pub fn gaussian_blur(src: &PixelBuffer, sigma: f32, ctx: &ComputeCtx) -> Result<PixelBuffer> {
    let (w, h) = src.dimensions();
    let kernel = build_gaussian_kernel(sigma)?;
    if kernel.len() == 1 || w == 0 || h == 0 {
        return Ok(src.clone());
    }
    let radius = (kernel.len() / 2) as isize;
    let (wu, hu) = (w as usize, h as usize);
    let stride = wu * CHANNELS;
    let raw = src.as_raw();

    // Horizontal pass into an f32 buffer.
    let mut horiz = try_alloc(w, h, CHANNELS, 0.0f32)?;
    for_each_band(&mut horiz, stride, ctx, |y, row_out| {
        let row_in = &raw[y * stride..(y + 1) * stride];
        for x in 0..wu {
            let mut acc = [0.0f32; 4];
            for (ki, &kv) in kernel.iter().enumerate() {
                let sx = (x as isize + ki as isize - radius).clamp(0, wu as isize - 1) as usize;
                let idx = sx * CHANNELS;
                for c in 0..CHANNELS {
                    acc[c] += row_in[idx + c] as f32 * kv;
                }
            }
            row_out[x * CHANNELS..(x + 1) * CHANNELS].copy_from_slice(&acc);
        }
    })?;

    // Vertical pass straight to u8.
    render_rows(w, h, ctx, |y, row_out| {
        for x in 0..wu {
            let mut acc = [0.0f32; 4];
            for (ki, &kv) in kernel.iter().enumerate() {
                let sy = (y as isize + ki as isize - radius).clamp(0, hu as isize - 1) as usize;
                let idx = sy * stride + x * CHANNELS;
                for c in 0..CHANNELS {
                    acc[c] += horiz[idx + c] * kv;
                }
            }
            for c in 0..CHANNELS {
                row_out[x * CHANNELS + c] = to_u8(acc[c]);
            }
        }
    })
}

const SHARPEN_KERNEL: [f32; 9] = [0.0, -1.0, 0.0, -1.0, 5.0, -1.0, 0.0, -1.0, 0.0];
const EDGE_HIGHLIGHT_KERNEL: [f32; 9] = [-1.0, -1.0, -1.0, -1.0, 10.0, -1.0, -1.0, -1.0, -1.0];
const EMBOSS_KERNEL: [f32; 9] = [-1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0];

/// 3×3 convolution on RGB with edge clamping; alpha is carried through.
/// Each channel becomes `sum / scale + offset`.
fn convolve3x3(
    src: &PixelBuffer,
    kernel: &[f32; 9],
    scale: f32,
    offset: f32,
    ctx: &ComputeCtx,
) -> Result<PixelBuffer> {
    let (w, h) = (src.width() as isize, src.height() as isize);
    let stride = src.stride();
    let raw = src.as_raw();
    render_rows(src.width(), src.height(), ctx, |y, row_out| {
        for x in 0..w {
            let mut acc = [0.0f32; 3];
            for ky in 0..3isize {
                let sy = (y as isize + ky - 1).clamp(0, h - 1) as usize;
                for kx in 0..3isize {
                    let sx = (x + kx - 1).clamp(0, w - 1) as usize;
                    let kv = kernel[(ky * 3 + kx) as usize];
                    let idx = sy * stride + sx * CHANNELS;
                    acc[0] += raw[idx] as f32 * kv;
                    acc[1] += raw[idx + 1] as f32 * kv;
                    acc[2] += raw[idx + 2] as f32 * kv;
                }
            }
            let o = x as usize * CHANNELS;
            row_out[o] = to_u8(acc[0] / scale + offset);
            row_out[o + 1] = to_u8(acc[1] / scale + offset);
            row_out[o + 2] = to_u8(acc[2] / scale + offset);
            row_out[o + 3] = raw[y * stride + o + 3];
        }
    })
}

/// Every pixel of a `size`×`size` block takes the block centre's colour.
fn pixelate(src: &PixelBuffer, size: u32, ctx: &ComputeCtx) -> Result<PixelBuffer> {
    if size <= 1 {
        return Ok(src.clone());
    }
    let (w, h) = src.dimensions();
    let stride = src.stride();
    let raw = src.as_raw();
    render_rows(w, h, ctx, |y, row_out| {
        let sy = ((y as u32 / size) * size + size / 2).min(h - 1) as usize;
        for x in 0..w {
            let sx = ((x / size) * size + size / 2).min(w - 1) as usize;
            let si = sy * stride + sx * CHANNELS;
            let o = x as usize * CHANNELS;
            row_out[o..o + CHANNELS].copy_from_slice(&raw[si..si + CHANNELS]);
        }
    })
}

fn vignette(src: &PixelBuffer, amount: f32, ctx: &ComputeCtx) -> Result<PixelBuffer> {
    let (w, h) = src.dimensions();
    let cx = w as f32 / 2.0;
    let cy = h as f32 / 2.0;
    let max_dist = (cx * cx + cy * cy).sqrt().max(f32::EPSILON);
    let stride = src.stride();
    let raw = src.as_raw();
    render_rows(w, h, ctx, |y, row_out| {
        let row_in = &raw[y * stride..(y + 1) * stride];
        let dy = y as f32 + 0.5 - cy;
        for x in 0..w as usize {
            let dx = x as f32 + 0.5 - cx;
            let dist = ((dx * dx + dy * dy).sqrt() / max_dist).min(1.0);
            let vf = (1.0 - amount * dist * dist).clamp(0.0, 1.0);
            let o = x * CHANNELS;
            row_out[o] = to_u8(row_in[o] as f32 * vf);
            row_out[o + 1] = to_u8(row_in[o + 1] as f32 * vf);
            row_out[o + 2] = to_u8(row_in[o + 2] as f32 * vf);
            row_out[o + 3] = row_in[o + 3];
        }
    })
}

/// Each row draws from its own generator seeded by (seed, y), so the result
/// does not depend on band size or thread scheduling.
fn add_noise(src: &PixelBuffer, level: f32, seed: u64, ctx: &ComputeCtx) -> Result<PixelBuffer> {
    if level <= 0.0 {
        return Ok(src.clone());
    }
    let amp = level * 255.0;
    let stride = src.stride();
    let raw = src.as_raw();
    render_rows(src.width(), src.height(), ctx, |y, row_out| {
        let mut rng = StdRng::seed_from_u64(seed ^ (y as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
        let row_in = &raw[y * stride..(y + 1) * stride];
        for (o, i) in row_out.chunks_exact_mut(CHANNELS).zip(row_in.chunks_exact(CHANNELS)) {
            for c in 0..3 {
                o[c] = to_u8(i[c] as f32 + rng.random_range(-amp..=amp));
            }
            o[3] = i[3];
        }
    })
}

// ============================================================================
// COLOUR HELPERS
// ============================================================================

/// BT.709 luma on 0..255 values.
#[inline]
fn luma(r: f32, g: f32, b: f32) -> f32 {
    0.2126 * r + 0.7152 * g + 0.0722 * b
}

/// RGB (0..1) → HSL (all 0..1)
fn rgb_to_hsl(r: f32, g: f32, b: f32) -> (f32, f32, f32) {
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let l = (max + min) / 2.0;
    if (max - min).abs() < 1e-6 {
        return (0.0, 0.0, l);
    }
    let d = max - min;
    let s = if l > 0.5 { d / (2.0 - max - min) } else { d / (max + min) };
    let h = if (max - r).abs() < 1e-6 {
        let mut h = (g - b) / d;
        if h < 0.0 {
            h += 6.0;
        }
        h / 6.0
    } else if (max - g).abs() < 1e-6 {
        ((b - r) / d + 2.0) / 6.0
    } else {
        ((r - g) / d + 4.0) / 6.0
    };
    (h, s, l)
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s.abs() < 1e-6 {
        return (l, l, l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

// ============================================================================
// TONE LOOKUP TABLES
// ============================================================================

fn build_levels_lut(in_black: f32, in_white: f32, gamma: f32, out_black: f32, out_white: f32) -> [u8; 256] {
    let mut lut = [0u8; 256];
    let in_range = (in_white - in_black).max(1.0);
    let out_range = out_white - out_black;
    let inv_gamma = 1.0 / gamma;
    for (i, slot) in lut.iter_mut().enumerate() {
        let normalized = ((i as f32 - in_black) / in_range).clamp(0.0, 1.0);
        *slot = to_u8(out_black + normalized.powf(inv_gamma) * out_range);
    }
    lut
}

/// Fritsch-Carlson monotone cubic through `points` (x strictly increasing).
fn build_curves_lut(points: &[(u8, u8)]) -> [u8; 256] {
    let mut lut = [0u8; 256];
    for (i, slot) in lut.iter_mut().enumerate() {
        *slot = i as u8;
    }
    let n = points.len();
    if n < 2 {
        return lut;
    }
    let xs: Vec<f32> = points.iter().map(|p| p.0 as f32).collect();
    let ys: Vec<f32> = points.iter().map(|p| p.1 as f32).collect();

    let delta: Vec<f32> = (0..n - 1).map(|i| (ys[i + 1] - ys[i]) / (xs[i + 1] - xs[i])).collect();
    let mut m = vec![0.0f32; n];
    m[0] = delta[0];
    m[n - 1] = delta[n - 2];
    for i in 1..n - 1 {
        if delta[i - 1] * delta[i] > 0.0 {
            m[i] = (delta[i - 1] + delta[i]) / 2.0;
        }
    }
    for i in 0..n - 1 {
        if delta[i].abs() < 1e-6 {
            m[i] = 0.0;
            m[i + 1] = 0.0;
            continue;
        }
        let alpha = m[i] / delta[i];
        let beta = m[i + 1] / delta[i];
        let s = alpha * alpha + beta * beta;
        if s > 9.0 {
            let tau = 3.0 / s.sqrt();
            m[i] = tau * alpha * delta[i];
            m[i + 1] = tau * beta * delta[i];
        }
    }

    for (i, slot) in lut.iter_mut().enumerate() {
        let x = i as f32;
        if x <= xs[0] {
            *slot = points[0].1;
            continue;
        }
        if x >= xs[n - 1] {
            *slot = points[n - 1].1;
            continue;
        }
        let seg = (0..n - 1).rev().find(|&j| x >= xs[j]).unwrap_or(0);
        let h = xs[seg + 1] - xs[seg];
        let t = (x - xs[seg]) / h;
        let (t2, t3) = (t * t, t * t * t);
        let val = (2.0 * t3 - 3.0 * t2 + 1.0) * ys[seg]
            + (t3 - 2.0 * t2 + t) * h * m[seg]
            + (-2.0 * t3 + 3.0 * t2) * ys[seg + 1]
            + (t3 - t2) * h * m[seg + 1];
        *slot = to_u8(val);
    }
    lut
}

/// RGB through `lut`; alpha is carried through.
fn map_lut(src: &PixelBuffer, lut: [u8; 256], ctx: &ComputeCtx) -> Result<PixelBuffer> {
    map_pixels(src, ctx, move |[r, g, b, a]| {
        let l = |v: f32| lut[v as usize] as f32;
        [l(r), l(g), l(b), a]
    })
}

// ============================================================================
// DISPATCH
// ============================================================================

/// Run `spec` over the whole of `src`.  `ext` is the resolved map for
/// extension filters.
fn run_full(
    src: &PixelBuffer,
    spec: &FilterSpec,
    ext: Option<&dyn PixelMap>,
    ctx: &ComputeCtx,
) -> Result<PixelBuffer> {
    match spec {
        FilterSpec::Blur { radius } => gaussian_blur(src, *radius, ctx),
        FilterSpec::Sharpen => convolve3x3(src, &SHARPEN_KERNEL, 1.0, 0.0, ctx),
        FilterSpec::EdgeHighlight => convolve3x3(src, &EDGE_HIGHLIGHT_KERNEL, 2.0, 0.0, ctx),
        FilterSpec::Emboss => convolve3x3(src, &EMBOSS_KERNEL, 1.0, 128.0, ctx),
        FilterSpec::Grayscale => map_pixels(src, ctx, |[r, g, b, a]| {
            let l = luma(r, g, b);
            [l, l, l, a]
        }),
        FilterSpec::Noise { level, seed } => add_noise(src, *level, *seed, ctx),
        FilterSpec::Brightness { delta } => {
            let off = delta * 255.0;
            map_pixels(src, ctx, move |[r, g, b, a]| [r + off, g + off, b + off, a])
        }
        FilterSpec::Contrast { delta } => {
            let factor = 1.0 + delta;
            let c = move |v: f32| (v - 128.0) * factor + 128.0;
            map_pixels(src, ctx, move |[r, g, b, a]| [c(r), c(g), c(b), a])
        }
        FilterSpec::Saturation { delta } => {
            let factor = 1.0 + delta;
            map_pixels(src, ctx, move |[r, g, b, a]| {
                let l = luma(r, g, b);
                [
                    l + (r - l) * factor,
                    l + (g - l) * factor,
                    l + (b - l) * factor,
                    a,
                ]
            })
        }
        FilterSpec::HueRotate { degrees } => {
            let shift = degrees.rem_euclid(360.0) / 360.0;
            map_pixels(src, ctx, move |[r, g, b, a]| {
                let (h, s, l) = rgb_to_hsl(r / 255.0, g / 255.0, b / 255.0);
                let (nr, ng, nb) = hsl_to_rgb((h + shift).fract(), s, l);
                [nr * 255.0, ng * 255.0, nb * 255.0, a]
            })
        }
        FilterSpec::Invert => map_pixels(src, ctx, |[r, g, b, a]| [255.0 - r, 255.0 - g, 255.0 - b, a]),
        FilterSpec::Sepia => map_pixels(src, ctx, |[r, g, b, a]| {
            [
                0.393 * r + 0.769 * g + 0.189 * b,
                0.349 * r + 0.686 * g + 0.168 * b,
                0.272 * r + 0.534 * g + 0.131 * b,
                a,
            ]
        }),
        FilterSpec::Posterize { levels } => {
            let steps = (*levels - 1) as f32;
            let p = move |v: f32| (v / 255.0 * steps).round() / steps * 255.0;
            map_pixels(src, ctx, move |[r, g, b, a]| [p(r), p(g), p(b), a])
        }
        FilterSpec::Threshold { level } => {
            let cut = level * 255.0;
            map_pixels(src, ctx, move |[r, g, b, a]| {
                let v = if luma(r, g, b) >= cut { 255.0 } else { 0.0 };
                [v, v, v, a]
            })
        }
        FilterSpec::Pixelate { size } => pixelate(src, *size, ctx),
        FilterSpec::Vignette { amount } => vignette(src, *amount, ctx),
        FilterSpec::Levels {
            in_black,
            in_white,
            gamma,
            out_black,
            out_white,
        } => map_lut(
            src,
            build_levels_lut(*in_black, *in_white, *gamma, *out_black, *out_white),
            ctx,
        ),
        FilterSpec::Curves { points } => map_lut(src, build_curves_lut(points), ctx),
        FilterSpec::Extension { name, params } => {
            let map = ext.ok_or_else(|| {
                EngineError::unsupported(format!("extension filter '{}' not resolved", name))
            })?;
            map_pixels(src, ctx, |[r, g, b, a]| {
                let out = map.map([r as u8, g as u8, b as u8, a as u8], params);
                [out[0] as f32, out[1] as f32, out[2] as f32, out[3] as f32]
            })
        }
    }
}

/// `original` with `filtered` mixed in by coverage:
/// `new = lerp(original, filtered, coverage)`.  `filtered` covers `window`
/// of the original; only pixels inside `bbox` (⊆ window) are considered.
fn blend_window(
    original: &PixelBuffer,
    filtered: &PixelBuffer,
    window: Rect,
    coverage: &CoverageBuffer,
    bbox: Rect,
) -> PixelBuffer {
    let mut out = original.clone();
    let stride = out.stride();
    let f_stride = filtered.stride();
    let f_raw = filtered.as_raw();
    out.as_raw_mut()
        .par_chunks_mut(stride)
        .enumerate()
        .filter(|(y, _)| *y as u32 >= bbox.y && (*y as u32) < bbox.bottom())
        .for_each(|(y, row)| {
            let cov_row = coverage.row(y);
            let fy = y - window.y as usize;
            for x in bbox.x as usize..bbox.right() as usize {
                let c = cov_row[x];
                if c <= 0.0 {
                    continue;
                }
                let o = x * CHANNELS;
                let fi = fy * f_stride + (x - window.x as usize) * CHANNELS;
                for ch in 0..CHANNELS {
                    let orig = row[o + ch] as f32;
                    let new = f_raw[fi + ch] as f32;
                    row[o + ch] = to_u8(orig + (new - orig) * c);
                }
            }
        });
    out
}

/// Mix a full-size filtered buffer into `original` through `coverage`.
/// Pixels with zero coverage stay bit-identical.
pub fn blend_with_coverage(
    original: &PixelBuffer,
    filtered: &PixelBuffer,
    coverage: &CoverageBuffer,
) -> Result<PixelBuffer> {
    if original.dimensions() != filtered.dimensions() || original.dimensions() != coverage.dimensions() {
        return Err(EngineError::out_of_range("blend inputs differ in size"));
    }
    Ok(match coverage.bounds() {
        Some(bbox) => blend_window(original, filtered, original.bounds(), coverage, bbox),
        None => original.clone(),
    })
}

/// Apply `spec` to `src`, restricted to `region` when given.
///
/// Local filters with a region only process the region's bounding box plus
/// the kernel's reach.  Unknown extension names fail with `Unsupported`
/// even when the region is empty.
pub fn apply_filter(
    src: &PixelBuffer,
    spec: &FilterSpec,
    region: Option<&CoverageBuffer>,
    registry: &FilterRegistry,
    ctx: &ComputeCtx,
) -> Result<PixelBuffer> {
    spec.validate()?;
    let ext = match spec {
        FilterSpec::Extension { name, params } => {
            let map = registry.resolve(name)?;
            map.validate(params)?;
            Some(map)
        }
        _ => None,
    };
    let ext = ext.as_deref();

    let Some(coverage) = region else {
        return run_full(src, spec, ext, ctx);
    };
    if coverage.dimensions() != src.dimensions() {
        return Err(EngineError::out_of_range(format!(
            "selection is {}×{}, layer is {}×{}",
            coverage.width(),
            coverage.height(),
            src.width(),
            src.height()
        )));
    }
    let Some(bbox) = coverage.bounds() else {
        return Ok(src.clone());
    };
    let (window, filtered) = match spec.reach() {
        Reach::Local(pad) => {
            let window = bbox.expand_clamped(pad, src.width(), src.height());
            let sub = src.crop(window)?;
            (window, run_full(&sub, spec, ext, ctx)?)
        }
        Reach::Global => (src.bounds(), run_full(src, spec, ext, ctx)?),
    };
    Ok(blend_window(src, &filtered, window, coverage, bbox))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn gradient(w: u32, h: u32) -> PixelBuffer {
        let mut buf = PixelBuffer::new(w, h).unwrap();
        for y in 0..h {
            for x in 0..w {
                buf.put_pixel(x, y, [(x * 7 % 256) as u8, (y * 13 % 256) as u8, ((x * y) % 256) as u8, 255]);
            }
        }
        buf
    }

    fn run(src: &PixelBuffer, spec: FilterSpec) -> PixelBuffer {
        apply_filter(src, &spec, None, &FilterRegistry::with_builtins(), &ComputeCtx::default()).unwrap()
    }

    #[test]
    fn parses_text_specs() {
        assert_eq!("blur:5".parse::<FilterSpec>().unwrap(), FilterSpec::Blur { radius: 5.0 });
        assert_eq!(
            "noise:0.2:7".parse::<FilterSpec>().unwrap(),
            FilterSpec::Noise { level: 0.2, seed: 7 }
        );
        assert_eq!("Grayscale".parse::<FilterSpec>().unwrap(), FilterSpec::Grayscale);
        assert_eq!(
            "ext:solarize:0.4".parse::<FilterSpec>().unwrap(),
            FilterSpec::Extension {
                name: "solarize".into(),
                params: vec![0.4]
            }
        );
        assert_eq!("warp:1".parse::<FilterSpec>().unwrap_err().kind(), ErrorKind::Unsupported);
        assert_eq!("blur".parse::<FilterSpec>().unwrap_err().kind(), ErrorKind::OutOfRange);
        assert_eq!("blur:-1".parse::<FilterSpec>().unwrap_err().kind(), ErrorKind::OutOfRange);
        let spec: FilterSpec = "hue_rotate:90".parse().unwrap();
        assert_eq!(spec.to_string().parse::<FilterSpec>().unwrap(), spec);
    }

    #[test]
    fn invalid_parameters_are_out_of_range() {
        let bad = [
            FilterSpec::Brightness { delta: f32::NAN },
            FilterSpec::Contrast { delta: 1.5 },
            FilterSpec::Posterize { levels: 1 },
            FilterSpec::Pixelate { size: 0 },
            FilterSpec::Noise { level: -0.1, seed: 0 },
        ];
        for spec in bad {
            assert_eq!(spec.validate().unwrap_err().kind(), ErrorKind::OutOfRange, "{:?}", spec);
        }
    }

    #[test]
    fn grayscale_uses_bt709() {
        let src = PixelBuffer::filled(2, 2, [255, 0, 0, 200]).unwrap();
        let out = run(&src, FilterSpec::Grayscale);
        assert_eq!(out.get_pixel(0, 0), [54, 54, 54, 200]);
    }

    #[test]
    fn blur_of_flat_image_is_identity_and_zero_radius_copies() {
        let flat = PixelBuffer::filled(16, 16, [90, 30, 200, 255]).unwrap();
        assert_eq!(run(&flat, FilterSpec::Blur { radius: 3.0 }), flat);
        let g = gradient(10, 10);
        assert_eq!(run(&g, FilterSpec::Blur { radius: 0.0 }), g);
        assert_ne!(run(&g, FilterSpec::Blur { radius: 2.0 }), g);
    }

    #[test]
    fn band_size_does_not_change_results() {
        let g = gradient(33, 29);
        let registry = FilterRegistry::new();
        for spec in [
            FilterSpec::Blur { radius: 1.5 },
            FilterSpec::Noise { level: 0.3, seed: 11 },
            FilterSpec::Emboss,
        ] {
            let a = apply_filter(&g, &spec, None, &registry, &ComputeCtx::new(1, CancelToken::new())).unwrap();
            let b = apply_filter(&g, &spec, None, &registry, &ComputeCtx::new(64, CancelToken::new())).unwrap();
            assert_eq!(a, b, "{}", spec);
        }
    }

    #[test]
    fn noise_is_seeded() {
        let g = gradient(20, 20);
        let a = run(&g, FilterSpec::Noise { level: 0.5, seed: 1 });
        let b = run(&g, FilterSpec::Noise { level: 0.5, seed: 1 });
        let c = run(&g, FilterSpec::Noise { level: 0.5, seed: 2 });
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(run(&g, FilterSpec::Noise { level: 0.0, seed: 9 }), g);
    }

    #[test]
    fn region_leaves_uncovered_pixels_untouched() {
        let g = gradient(30, 30);
        let mut cov = CoverageBuffer::new(30, 30).unwrap();
        for y in 10..20 {
            for x in 10..20 {
                cov.set(x, y, 1.0);
            }
        }
        cov.set(20, 15, 0.5);
        let out = apply_filter(
            &g,
            &FilterSpec::Invert,
            Some(&cov),
            &FilterRegistry::new(),
            &ComputeCtx::default(),
        )
        .unwrap();
        for y in 0..30 {
            for x in 0..30 {
                let c = cov.get(x, y);
                let o = g.get_pixel(x, y);
                let n = out.get_pixel(x, y);
                if c == 0.0 {
                    assert_eq!(n, o);
                } else if c == 1.0 {
                    assert_eq!(n, [255 - o[0], 255 - o[1], 255 - o[2], o[3]]);
                }
            }
        }
        let half = out.get_pixel(20, 15);
        let o = g.get_pixel(20, 15);
        let expect = ((o[0] as f32 + (255.0 - 2.0 * o[0] as f32) * 0.5).round()) as u8;
        assert_eq!(half[0], expect);
    }

    #[test]
    fn cropped_blur_matches_full_blur_inside_region() {
        let g = gradient(40, 40);
        let mut cov = CoverageBuffer::new(40, 40).unwrap();
        cov.set(20, 20, 1.0);
        let spec = FilterSpec::Blur { radius: 2.0 };
        let reg = FilterRegistry::new();
        let ctx = ComputeCtx::default();
        let full = apply_filter(&g, &spec, None, &reg, &ctx).unwrap();
        let local = apply_filter(&g, &spec, Some(&cov), &reg, &ctx).unwrap();
        assert_eq!(local.get_pixel(20, 20), full.get_pixel(20, 20));
        assert_eq!(local.get_pixel(21, 20), g.get_pixel(21, 20));
    }

    #[test]
    fn region_size_mismatch_is_out_of_range() {
        let g = gradient(4, 4);
        let cov = CoverageBuffer::filled(3, 4, 1.0).unwrap();
        let err = apply_filter(&g, &FilterSpec::Sepia, Some(&cov), &FilterRegistry::new(), &ComputeCtx::default())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfRange);
    }

    #[test]
    fn extensions_resolve_through_registry() {
        let g = PixelBuffer::filled(2, 2, [10, 20, 30, 40]).unwrap();
        let swapped = run(
            &g,
            FilterSpec::Extension {
                name: "channel_swap".into(),
                params: vec![],
            },
        );
        assert_eq!(swapped.get_pixel(0, 0), [30, 20, 10, 40]);
        let err = apply_filter(
            &g,
            &FilterSpec::Extension {
                name: "nope".into(),
                params: vec![],
            },
            None,
            &FilterRegistry::with_builtins(),
            &ComputeCtx::default(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
    }

    #[test]
    fn kernel_filters_keep_alpha() {
        let mut g = gradient(8, 8);
        g.put_pixel(3, 3, [1, 2, 3, 17]);
        for spec in [FilterSpec::Sharpen, FilterSpec::EdgeHighlight, FilterSpec::Emboss] {
            let out = run(&g, spec);
            assert_eq!(out.get_pixel(3, 3)[3], 17);
        }
    }

    #[test]
    fn cancelled_token_aborts() {
        let g = gradient(8, 8);
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = apply_filter(
            &g,
            &FilterSpec::Grayscale,
            None,
            &FilterRegistry::new(),
            &ComputeCtx::new(2, cancel),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn point_filters_behave() {
        let px = PixelBuffer::filled(1, 1, [100, 150, 200, 255]).unwrap();
        assert_eq!(run(&px, FilterSpec::Invert).get_pixel(0, 0), [155, 105, 55, 255]);
        assert_eq!(
            run(&px, FilterSpec::Brightness { delta: 0.2 }).get_pixel(0, 0),
            [151, 201, 251, 255]
        );
        assert_eq!(
            run(&px, FilterSpec::Contrast { delta: -1.0 }).get_pixel(0, 0),
            [128, 128, 128, 255]
        );
        let desat = run(&px, FilterSpec::Saturation { delta: -1.0 }).get_pixel(0, 0);
        assert!(desat[0] == desat[1] && desat[1] == desat[2]);
        assert_eq!(run(&px, FilterSpec::HueRotate { degrees: 360.0 }).get_pixel(0, 0), [100, 150, 200, 255]);
        assert_eq!(run(&px, FilterSpec::Threshold { level: 0.5 }).get_pixel(0, 0), [255, 255, 255, 255]);
        assert_eq!(run(&px, FilterSpec::Posterize { levels: 2 }).get_pixel(0, 0), [0, 255, 255, 255]);
    }

    #[test]
    fn huge_blur_radius_is_rejected_not_allocated() {
        assert_eq!("blur:1e19".parse::<FilterSpec>().unwrap_err().kind(), ErrorKind::OutOfRange);
        let g = gradient(4, 4);
        let ctx = ComputeCtx::default();
        let spec = FilterSpec::Blur { radius: 1e19 };
        let err = apply_filter(&g, &spec, None, &FilterRegistry::new(), &ctx).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfRange);
        assert_eq!(gaussian_blur(&g, 1e9, &ctx).unwrap_err().kind(), ErrorKind::OutOfRange);
        assert_eq!(spec.reach(), Reach::Local(u32::MAX));
        assert_eq!(run(&g, FilterSpec::Blur { radius: MAX_BLUR_RADIUS }).dimensions(), (4, 4));
    }

    #[test]
    fn levels_remap_input_range() {
        let mut src = PixelBuffer::new(3, 1).unwrap();
        src.put_pixel(0, 0, [50, 50, 50, 9]);
        src.put_pixel(1, 0, [125, 200, 250, 9]);
        src.put_pixel(2, 0, [10, 20, 30, 9]);
        let out = run(&src, "levels:50:200".parse().unwrap());
        assert_eq!(out.get_pixel(0, 0), [0, 0, 0, 9]);
        assert_eq!(out.get_pixel(1, 0), [128, 255, 255, 9]);
        assert_eq!(out.get_pixel(2, 0), [0, 0, 0, 9]);

        let g = gradient(8, 8);
        assert_eq!(run(&g, "levels:0:255:1:0:255".parse().unwrap()), g);
        let inverted = run(&g, "levels:0:255:1:255:0".parse().unwrap());
        assert_eq!(inverted, run(&g, FilterSpec::Invert));
    }

    #[test]
    fn levels_and_curves_validate() {
        for text in ["levels:200:50", "levels:0:300", "levels:0:255:0", "curves:0,0", "curves:10,0:10,255"] {
            assert_eq!(text.parse::<FilterSpec>().unwrap_err().kind(), ErrorKind::OutOfRange, "{}", text);
        }
        assert_eq!("curves:0;0:255,255".parse::<FilterSpec>().unwrap_err().kind(), ErrorKind::OutOfRange);
        let spec: FilterSpec = "curves:0,0:128,200:255,255".parse().unwrap();
        assert_eq!(spec.to_string().parse::<FilterSpec>().unwrap(), spec);
        let spec: FilterSpec = "levels:10:240:1.5".parse().unwrap();
        assert_eq!(spec.to_string().parse::<FilterSpec>().unwrap(), spec);
    }

    #[test]
    fn curves_are_monotone_through_points() {
        let identity = build_curves_lut(&[(0, 0), (255, 255)]);
        assert!(identity.iter().enumerate().all(|(i, v)| *v as usize == i));
        let flipped = build_curves_lut(&[(0, 255), (255, 0)]);
        assert!(flipped.iter().enumerate().all(|(i, v)| *v as usize == 255 - i));

        let lifted = build_curves_lut(&[(0, 0), (128, 200), (255, 255)]);
        assert_eq!(lifted[128], 200);
        assert!(lifted.windows(2).all(|w| w[0] <= w[1]));

        let clipped = build_curves_lut(&[(64, 10), (192, 240)]);
        assert_eq!(clipped[0], 10);
        assert_eq!(clipped[255], 240);

        let src = PixelBuffer::filled(2, 2, [128, 0, 255, 77]).unwrap();
        let out = run(&src, FilterSpec::Curves { points: vec![(0, 0), (128, 200), (255, 255)] });
        assert_eq!(out.get_pixel(1, 1), [200, 0, 255, 77]);
    }
}
