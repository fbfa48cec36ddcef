// ============================================================================
// SELECTION SYSTEM — soft-edged coverage masks built from shapes
// ============================================================================

use std::str::FromStr;

use crate::error::{EngineError, Result};
use crate::pixels::{CoverageBuffer, Rect};

/// How a new selection shape interacts with the existing mask.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SelectionMode {
    /// Clear any existing selection, then set the new shape.
    #[default]
    Replace,
    /// Union: keep the larger coverage.
    Add,
    /// Difference: remove the shape's coverage from the mask.
    Subtract,
    /// Keep only pixels present in both the existing mask and the new shape.
    Intersect,
}

impl SelectionMode {
    pub fn all() -> &'static [SelectionMode] {
        &[
            SelectionMode::Replace,
            SelectionMode::Add,
            SelectionMode::Subtract,
            SelectionMode::Intersect,
        ]
    }
}

/// Which kind of shape produced the current mask.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SelectionKind {
    Rectangle,
    Ellipse,
    Polygon,
    /// Built from several shapes via add/subtract/intersect, or inverted.
    Combined,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SelectionShape {
    Rectangle(Rect),
    /// Centre and radii in pixel coordinates.
    Ellipse { cx: f32, cy: f32, rx: f32, ry: f32 },
    /// Closed outline; filled with the even-odd rule.
    Polygon(Vec<(f32, f32)>),
}

/// Sub-samples per axis for antialiased polygon edges.
const POLY_SUPERSAMPLE: usize = 4;

impl SelectionShape {
    pub fn kind(&self) -> SelectionKind {
        match self {
            SelectionShape::Rectangle(_) => SelectionKind::Rectangle,
            SelectionShape::Ellipse { .. } => SelectionKind::Ellipse,
            SelectionShape::Polygon(_) => SelectionKind::Polygon,
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            SelectionShape::Rectangle(r) => {
                if r.is_empty() {
                    return Err(EngineError::out_of_range("selection rectangle is empty"));
                }
            }
            SelectionShape::Ellipse { cx, cy, rx, ry } => {
                let finite = [cx, cy, rx, ry].iter().all(|v| v.is_finite());
                if !finite || *rx <= 0.0 || *ry <= 0.0 {
                    return Err(EngineError::out_of_range(format!(
                        "ellipse radii must be positive, got {}×{}",
                        rx, ry
                    )));
                }
            }
            SelectionShape::Polygon(points) => {
                if points.len() < 3 {
                    return Err(EngineError::out_of_range(format!(
                        "polygon needs at least 3 points, got {}",
                        points.len()
                    )));
                }
                if points.iter().any(|(x, y)| !x.is_finite() || !y.is_finite()) {
                    return Err(EngineError::out_of_range("polygon point is not finite"));
                }
            }
        }
        Ok(())
    }

    /// Pixel-space bounding box clamped to the canvas.  `None` if the shape
    /// lies entirely outside it.
    pub fn bounds(&self, canvas_w: u32, canvas_h: u32) -> Option<Rect> {
        let (x0, y0, x1, y1) = match self {
            SelectionShape::Rectangle(r) => (
                r.x as f32,
                r.y as f32,
                r.right() as f32 - 1.0,
                r.bottom() as f32 - 1.0,
            ),
            SelectionShape::Ellipse { cx, cy, rx, ry } => (cx - rx, cy - ry, cx + rx, cy + ry),
            SelectionShape::Polygon(points) => points.iter().fold(
                (f32::MAX, f32::MAX, f32::MIN, f32::MIN),
                |(a, b, c, d), &(x, y)| (a.min(x), b.min(y), c.max(x), d.max(y)),
            ),
        };
        if canvas_w == 0 || canvas_h == 0 || x1 < 0.0 || y1 < 0.0 {
            return None;
        }
        let min_x = x0.max(0.0).floor() as u32;
        let min_y = y0.max(0.0).floor() as u32;
        let max_x = (x1.ceil() as u32).min(canvas_w - 1);
        let max_y = (y1.ceil() as u32).min(canvas_h - 1);
        if min_x > max_x || min_y > max_y {
            return None;
        }
        Some(Rect::from_min_max(min_x, min_y, max_x, max_y))
    }

    /// Coverage of pixel (x, y) in `0.0..=1.0`.
    pub fn coverage_at(&self, x: u32, y: u32, antialias: bool) -> f32 {
        match self {
            SelectionShape::Rectangle(r) => {
                if r.contains(x, y) {
                    1.0
                } else {
                    0.0
                }
            }
            SelectionShape::Ellipse { cx, cy, rx, ry } => {
                let dx = (x as f32 - cx) / rx;
                let dy = (y as f32 - cy) / ry;
                let n = (dx * dx + dy * dy).sqrt();
                if n >= 1.0 {
                    return 0.0;
                }
                if !antialias {
                    return 1.0;
                }
                // One-pixel ramp just inside the outline; zero on and beyond it.
                ((1.0 - n) * rx.min(*ry)).clamp(0.0, 1.0)
            }
            SelectionShape::Polygon(points) => {
                if !antialias {
                    return if point_in_polygon(points, x as f32 + 0.5, y as f32 + 0.5) {
                        1.0
                    } else {
                        0.0
                    };
                }
                let step = 1.0 / POLY_SUPERSAMPLE as f32;
                let mut hits = 0usize;
                for sy in 0..POLY_SUPERSAMPLE {
                    for sx in 0..POLY_SUPERSAMPLE {
                        let px = x as f32 + (sx as f32 + 0.5) * step;
                        let py = y as f32 + (sy as f32 + 0.5) * step;
                        if point_in_polygon(points, px, py) {
                            hits += 1;
                        }
                    }
                }
                hits as f32 / (POLY_SUPERSAMPLE * POLY_SUPERSAMPLE) as f32
            }
        }
    }
}

fn point_in_polygon(points: &[(f32, f32)], px: f32, py: f32) -> bool {
    let mut inside = false;
    let mut j = points.len() - 1;
    for i in 0..points.len() {
        let (xi, yi) = points[i];
        let (xj, yj) = points[j];
        if (yi > py) != (yj > py) && px < (xj - xi) * (py - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}

fn parse_numbers(text: &str, expected: usize) -> Result<Vec<f32>> {
    let values: Vec<f32> = text
        .split(',')
        .map(|s| s.trim().parse::<f32>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| EngineError::out_of_range(format!("bad selection number in '{}': {}", text, e)))?;
    if values.len() != expected {
        return Err(EngineError::out_of_range(format!(
            "expected {} numbers, got {} in '{}'",
            expected,
            values.len(),
            text
        )));
    }
    Ok(values)
}

/// `rect:x,y,w,h` | `ellipse:cx,cy,rx,ry` | `poly:x0,y0,x1,y1,…`
impl FromStr for SelectionShape {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        let (kind, args) = s
            .split_once(':')
            .ok_or_else(|| EngineError::unsupported(format!("selection '{}' has no shape prefix", s)))?;
        let shape = match kind.trim().to_lowercase().as_str() {
            "rect" | "rectangle" => {
                let v = parse_numbers(args, 4)?;
                if v.iter().any(|n| *n < 0.0) {
                    return Err(EngineError::out_of_range("rectangle values must be non-negative"));
                }
                SelectionShape::Rectangle(Rect::new(v[0] as u32, v[1] as u32, v[2] as u32, v[3] as u32))
            }
            "ellipse" | "circle" => {
                let v = parse_numbers(args, 4)?;
                SelectionShape::Ellipse {
                    cx: v[0],
                    cy: v[1],
                    rx: v[2],
                    ry: v[3],
                }
            }
            "poly" | "polygon" => {
                let count = args.split(',').count();
                if count % 2 != 0 {
                    return Err(EngineError::out_of_range("polygon needs x,y pairs"));
                }
                let v = parse_numbers(args, count)?;
                SelectionShape::Polygon(v.chunks_exact(2).map(|p| (p[0], p[1])).collect())
            }
            other => return Err(EngineError::unsupported(format!("selection shape '{}'", other))),
        };
        shape.validate()?;
        Ok(shape)
    }
}

/// Per-pixel selection coverage for one canvas.  Session state only.
#[derive(Clone, Debug, PartialEq)]
pub struct SelectionMask {
    kind: SelectionKind,
    coverage: CoverageBuffer,
}

impl SelectionMask {
    /// Mask holding a single shape.
    pub fn from_shape(width: u32, height: u32, shape: &SelectionShape, antialias: bool) -> Result<Self> {
        shape.validate()?;
        let mut coverage = CoverageBuffer::new(width, height)?;
        if let Some(b) = shape.bounds(width, height) {
            let w = width as usize;
            let data = coverage.data_mut();
            for y in b.y..b.bottom() {
                for x in b.x..b.right() {
                    data[y as usize * w + x as usize] = shape.coverage_at(x, y, antialias);
                }
            }
        }
        Ok(Self {
            kind: shape.kind(),
            coverage,
        })
    }

    pub fn rectangle(width: u32, height: u32, rect: Rect) -> Result<Self> {
        Self::from_shape(width, height, &SelectionShape::Rectangle(rect), false)
    }

    /// Antialiased ellipse.
    pub fn ellipse(width: u32, height: u32, cx: f32, cy: f32, rx: f32, ry: f32) -> Result<Self> {
        Self::from_shape(width, height, &SelectionShape::Ellipse { cx, cy, rx, ry }, true)
    }

    /// Antialiased polygon.
    pub fn polygon(width: u32, height: u32, points: Vec<(f32, f32)>) -> Result<Self> {
        Self::from_shape(width, height, &SelectionShape::Polygon(points), true)
    }

    /// Wrap an existing coverage buffer (e.g. a layer mask turned selection).
    pub fn from_coverage(coverage: CoverageBuffer) -> Self {
        Self {
            kind: SelectionKind::Combined,
            coverage,
        }
    }

    pub fn kind(&self) -> SelectionKind {
        self.kind
    }

    pub fn coverage(&self) -> &CoverageBuffer {
        &self.coverage
    }

    pub fn into_coverage(self) -> CoverageBuffer {
        self.coverage
    }

    pub fn width(&self) -> u32 {
        self.coverage.width()
    }

    pub fn height(&self) -> u32 {
        self.coverage.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.coverage.dimensions()
    }

    pub fn get(&self, x: u32, y: u32) -> f32 {
        self.coverage.get(x, y)
    }

    /// Bounding box of all pixels with coverage > 0.
    pub fn bounds(&self) -> Option<Rect> {
        self.coverage.bounds()
    }

    pub fn is_empty(&self) -> bool {
        self.coverage.as_raw().iter().all(|&c| c <= 0.0)
    }

    /// Merge a new shape into the mask according to `mode`.
    pub fn apply(&mut self, shape: &SelectionShape, mode: SelectionMode, antialias: bool) -> Result<()> {
        let (w, h) = self.dimensions();
        if mode == SelectionMode::Replace {
            *self = Self::from_shape(w, h, shape, antialias)?;
            return Ok(());
        }
        let other = Self::from_shape(w, h, shape, antialias)?;
        let combine: fn(f32, f32) -> f32 = match mode {
            SelectionMode::Add => |old, new| old.max(new),
            SelectionMode::Subtract => |old, new| (old - new).max(0.0),
            SelectionMode::Intersect => |old, new| old.min(new),
            SelectionMode::Replace => |_, new| new,
        };
        for (old, &new) in self.coverage.data_mut().iter_mut().zip(other.coverage.as_raw()) {
            *old = combine(*old, new);
        }
        self.kind = SelectionKind::Combined;
        Ok(())
    }

    pub fn invert(&mut self) {
        for c in self.coverage.data_mut() {
            *c = 1.0 - *c;
        }
        self.kind = SelectionKind::Combined;
    }
}
