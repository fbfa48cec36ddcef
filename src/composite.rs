// ============================================================================
// COMPOSITE ENGINE — flatten a LayerStack into one displayable buffer
// ============================================================================

use std::sync::Arc;

use rayon::prelude::*;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::layer::{BlendMode, Layer, LayerId};
use crate::pixels::{CHANNELS, CoverageBuffer, PixelBuffer};
use crate::stack::LayerStack;

/// One layer's contribution, borrowed for the duration of a composite.
struct Plane<'a> {
    pixels: &'a PixelBuffer,
    mask: Option<&'a CoverageBuffer>,
    opacity: f32,
    mode: BlendMode,
}

impl<'a> Plane<'a> {
    fn of(layer: &'a Layer) -> Self {
        Self {
            pixels: layer.pixels(),
            mask: layer.mask(),
            opacity: layer.opacity(),
            mode: layer.blend_mode(),
        }
    }
}

/// Blend `top` over `base`.  `alpha_scale` is layer opacity × mask coverage.
/// Colours are straight (non-premultiplied); results are rounded to nearest.
pub fn blend_pixel(base: [u8; 4], top: [u8; 4], mode: BlendMode, alpha_scale: f32) -> [u8; 4] {
    let alpha_scale = alpha_scale.clamp(0.0, 1.0);
    if top[3] == 0 || alpha_scale <= 0.0 {
        return base;
    }
    // Opaque normal paint replaces the destination outright.
    if mode == BlendMode::Normal && alpha_scale >= 1.0 && top[3] == 255 {
        return top;
    }

    let base_r = base[0] as f32 / 255.0;
    let base_g = base[1] as f32 / 255.0;
    let base_b = base[2] as f32 / 255.0;
    let base_a = base[3] as f32 / 255.0;

    let top_r = top[0] as f32 / 255.0;
    let top_g = top[1] as f32 / 255.0;
    let top_b = top[2] as f32 / 255.0;
    let top_a = (top[3] as f32 / 255.0) * alpha_scale;

    let (br, bg, bb) = match mode {
        BlendMode::Normal => (top_r, top_g, top_b),
        BlendMode::Multiply => (base_r * top_r, base_g * top_g, base_b * top_b),
        BlendMode::Screen => (
            screen_channel(base_r, top_r),
            screen_channel(base_g, top_g),
            screen_channel(base_b, top_b),
        ),
        BlendMode::Overlay => (
            overlay_channel(base_r, top_r),
            overlay_channel(base_g, top_g),
            overlay_channel(base_b, top_b),
        ),
        BlendMode::Darken => (base_r.min(top_r), base_g.min(top_g), base_b.min(top_b)),
        BlendMode::Lighten => (base_r.max(top_r), base_g.max(top_g), base_b.max(top_b)),
        BlendMode::Difference => (
            (base_r - top_r).abs(),
            (base_g - top_g).abs(),
            (base_b - top_b).abs(),
        ),
        BlendMode::Additive => (
            (base_r + top_r).min(1.0),
            (base_g + top_g).min(1.0),
            (base_b + top_b).min(1.0),
        ),
        BlendMode::HardLight => (
            overlay_channel(top_r, base_r),
            overlay_channel(top_g, base_g),
            overlay_channel(top_b, base_b),
        ),
        BlendMode::SoftLight => (
            soft_light_channel(base_r, top_r),
            soft_light_channel(base_g, top_g),
            soft_light_channel(base_b, top_b),
        ),
        BlendMode::Exclusion => (
            base_r + top_r - 2.0 * base_r * top_r,
            base_g + top_g - 2.0 * base_g * top_g,
            base_b + top_b - 2.0 * base_b * top_b,
        ),
    };

    // Where the backdrop is transparent the blend function has nothing to
    // act on, so the source colour shows through unchanged.
    let r = (1.0 - base_a) * top_r + base_a * br;
    let g = (1.0 - base_a) * top_g + base_a * bg;
    let b = (1.0 - base_a) * top_b + base_a * bb;

    let out_a = top_a + base_a * (1.0 - top_a);
    if out_a <= 0.0 {
        return [0, 0, 0, 0];
    }

    let out_r = (r * top_a + base_r * base_a * (1.0 - top_a)) / out_a;
    let out_g = (g * top_a + base_g * base_a * (1.0 - top_a)) / out_a;
    let out_b = (b * top_a + base_b * base_a * (1.0 - top_a)) / out_a;

    [to_u8(out_r), to_u8(out_g), to_u8(out_b), to_u8(out_a)]
}

#[inline]
fn to_u8(v: f32) -> u8 {
    (v * 255.0).round().clamp(0.0, 255.0) as u8
}

fn screen_channel(base: f32, top: f32) -> f32 {
    1.0 - (1.0 - base) * (1.0 - top)
}

fn overlay_channel(base: f32, top: f32) -> f32 {
    if base < 0.5 {
        2.0 * base * top
    } else {
        1.0 - 2.0 * (1.0 - base) * (1.0 - top)
    }
}

/// W3C Soft Light formula.
fn soft_light_channel(base: f32, top: f32) -> f32 {
    if top <= 0.5 {
        base - (1.0 - 2.0 * top) * base * (1.0 - base)
    } else {
        let d = if base <= 0.25 {
            ((16.0 * base - 12.0) * base + 4.0) * base
        } else {
            base.sqrt()
        };
        base + (2.0 * top - 1.0) * (d - base)
    }
}

/// Composite planes bottom→top onto a transparent `w`×`h` canvas.
/// Rows are independent and processed in parallel.
fn composite_planes(planes: &[Plane<'_>], w: u32, h: u32) -> Result<PixelBuffer> {
    let mut out = PixelBuffer::new(w, h)?;
    let stride = out.stride();
    if stride == 0 {
        return Ok(out);
    }
    out.as_raw_mut()
        .par_chunks_mut(stride)
        .enumerate()
        .for_each(|(y, row_out)| {
            for plane in planes {
                let src_row = &plane.pixels.as_raw()[y * stride..(y + 1) * stride];
                let mask_row = plane.mask.map(|m| m.row(y));
                for x in 0..w as usize {
                    let o = x * CHANNELS;
                    let coverage = mask_row.map_or(1.0, |m| m[x]);
                    let top = [src_row[o], src_row[o + 1], src_row[o + 2], src_row[o + 3]];
                    let base = [row_out[o], row_out[o + 1], row_out[o + 2], row_out[o + 3]];
                    let px = blend_pixel(base, top, plane.mode, plane.opacity * coverage);
                    row_out[o..o + CHANNELS].copy_from_slice(&px);
                }
            }
        });
    Ok(out)
}

/// Flatten the given layers (already in paint order) into one buffer.
/// Invisible and zero-opacity layers are skipped.
pub fn flatten<'a>(layers: impl IntoIterator<Item = &'a Layer>, w: u32, h: u32) -> Result<PixelBuffer> {
    let planes: Vec<Plane<'a>> = layers
        .into_iter()
        .filter(|l| l.is_rendered())
        .map(Plane::of)
        .collect();
    composite_planes(&planes, w, h)
}

struct CachedComposite {
    stack_uid: Uuid,
    version: u64,
    image: Arc<PixelBuffer>,
}

/// Produces the flattened view of a stack, recomputing only when the stack's
/// version moved since the last call.
#[derive(Default)]
pub struct CompositeEngine {
    cache: Option<CachedComposite>,
    recomputes: u64,
    hits: u64,
}

impl CompositeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn composite(&mut self, stack: &LayerStack) -> Result<Arc<PixelBuffer>> {
        let (w, h) = stack.canvas_size()?;
        if let Some(cached) = &self.cache {
            if cached.stack_uid == stack.uid() && cached.version == stack.version() {
                self.hits += 1;
                return Ok(Arc::clone(&cached.image));
            }
        }
        let image = Arc::new(flatten(stack.layers(), w, h)?);
        self.recomputes += 1;
        self.cache = Some(CachedComposite {
            stack_uid: stack.uid(),
            version: stack.version(),
            image: Arc::clone(&image),
        });
        Ok(image)
    }

    /// Composite with `layer_id`'s pixels replaced by `pixels`, e.g. a filter
    /// preview shown in context.  Never touches the cache.
    pub fn composite_with_override(
        &self,
        stack: &LayerStack,
        layer_id: LayerId,
        pixels: &PixelBuffer,
    ) -> Result<PixelBuffer> {
        let (w, h) = stack.canvas_size()?;
        if pixels.dimensions() != (w, h) {
            return Err(EngineError::out_of_range(format!(
                "override buffer is {}×{}, canvas is {}×{}",
                pixels.width(),
                pixels.height(),
                w,
                h
            )));
        }
        stack.index_of(layer_id)?;
        let planes: Vec<Plane<'_>> = stack
            .layers()
            .iter()
            .filter(|l| l.is_rendered())
            .map(|l| {
                let mut plane = Plane::of(l);
                if l.id() == layer_id {
                    plane.pixels = pixels;
                }
                plane
            })
            .collect();
        composite_planes(&planes, w, h)
    }

    pub fn invalidate(&mut self) {
        self.cache = None;
    }

    /// Number of full recomputes performed so far.
    pub fn recompute_count(&self) -> u64 {
        self.recomputes
    }

    pub fn cache_hits(&self) -> u64 {
        self.hits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(stack: &mut LayerStack, name: &str, color: [u8; 4]) -> LayerId {
        let layer = stack.new_layer(name, color).unwrap();
        let id = layer.id();
        let at = stack.len();
        stack.add_layer(at, layer).unwrap();
        id
    }

    #[test]
    fn half_opacity_blue_over_red() {
        let mut stack = LayerStack::new(100, 100).unwrap();
        solid(&mut stack, "A", [255, 0, 0, 255]);
        let b = solid(&mut stack, "B", [0, 0, 255, 255]);
        stack.set_opacity(b, 0.5).unwrap();
        let out = CompositeEngine::new().composite(&stack).unwrap();
        for px in out.as_raw().chunks_exact(4) {
            assert!(px[0] == 127 || px[0] == 128, "red {}", px[0]);
            assert_eq!(px[1], 0);
            assert!(px[2] == 127 || px[2] == 128, "blue {}", px[2]);
            assert_eq!(px[3], 255);
        }
    }

    #[test]
    fn opaque_top_layer_wins() {
        let mut stack = LayerStack::new(8, 8).unwrap();
        solid(&mut stack, "a", [10, 20, 30, 255]);
        solid(&mut stack, "b", [40, 50, 60, 255]);
        solid(&mut stack, "c", [70, 80, 90, 255]);
        let out = CompositeEngine::new().composite(&stack).unwrap();
        assert!(out.as_raw().chunks_exact(4).all(|p| p == [70, 80, 90, 255]));
    }

    #[test]
    fn hidden_and_transparent_layers_are_skipped() {
        let mut stack = LayerStack::new(4, 4).unwrap();
        solid(&mut stack, "base", [0, 255, 0, 255]);
        let hidden = solid(&mut stack, "hidden", [255, 0, 0, 255]);
        let clear = solid(&mut stack, "clear", [0, 0, 255, 255]);
        stack.set_visibility(hidden, false).unwrap();
        stack.set_opacity(clear, 0.0).unwrap();
        let out = CompositeEngine::new().composite(&stack).unwrap();
        assert_eq!(out.get_pixel(1, 1), [0, 255, 0, 255]);
    }

    #[test]
    fn mask_coverage_scales_alpha() {
        let mut stack = LayerStack::new(2, 1).unwrap();
        solid(&mut stack, "base", [0, 0, 0, 255]);
        let top = solid(&mut stack, "top", [255, 255, 255, 255]);
        let mask = CoverageBuffer::from_raw(2, 1, vec![0.0, 1.0]).unwrap();
        stack.set_mask(top, Some(mask)).unwrap();
        let out = CompositeEngine::new().composite(&stack).unwrap();
        assert_eq!(out.get_pixel(0, 0), [0, 0, 0, 255]);
        assert_eq!(out.get_pixel(1, 0), [255, 255, 255, 255]);
    }

    #[test]
    fn blend_formulas() {
        let base = [128, 64, 255, 255];
        let top = [128, 255, 0, 255];
        assert_eq!(blend_pixel(base, top, BlendMode::Multiply, 1.0), [64, 64, 0, 255]);
        assert_eq!(blend_pixel(base, top, BlendMode::Screen, 1.0), [192, 255, 255, 255]);
        // overlay: base 64/255 < 0.5 → 2ab ; base 255 ≥ 0.5 → screen-like
        let ov = blend_pixel(base, top, BlendMode::Overlay, 1.0);
        assert_eq!(ov[1], 128);
        assert_eq!(ov[2], 255);
        // transparent backdrop: blend modes degrade to plain source colour
        assert_eq!(
            blend_pixel([0, 0, 0, 0], [200, 100, 50, 255], BlendMode::Multiply, 1.0),
            [200, 100, 50, 255]
        );
    }

    #[test]
    fn cache_reused_until_stack_changes() {
        let mut stack = LayerStack::new(4, 4).unwrap();
        let id = solid(&mut stack, "a", [1, 2, 3, 255]);
        let mut engine = CompositeEngine::new();
        let first = engine.composite(&stack).unwrap();
        let second = engine.composite(&stack).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(engine.recompute_count(), 1);
        assert_eq!(engine.cache_hits(), 1);
        stack.set_visibility(id, false).unwrap();
        let third = engine.composite(&stack).unwrap();
        assert_eq!(engine.recompute_count(), 2);
        assert_eq!(third.get_pixel(0, 0), [0, 0, 0, 0]);
    }

    #[test]
    fn override_substitutes_one_layer() {
        let mut stack = LayerStack::new(3, 3).unwrap();
        let id = solid(&mut stack, "a", [9, 9, 9, 255]);
        let engine = CompositeEngine::new();
        let replacement = PixelBuffer::filled(3, 3, [200, 0, 0, 255]).unwrap();
        let out = engine.composite_with_override(&stack, id, &replacement).unwrap();
        assert_eq!(out.get_pixel(2, 2), [200, 0, 0, 255]);
        assert_eq!(stack.get(id).unwrap().pixels().get_pixel(2, 2), [9, 9, 9, 255]);
    }

    #[test]
    fn unloaded_stack_cannot_composite() {
        let stack = LayerStack::unloaded();
        let err = CompositeEngine::new().composite(&stack).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidState);
    }
}
