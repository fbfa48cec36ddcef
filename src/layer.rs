// ============================================================================
// LAYER — one pixel buffer plus compositing metadata
// ============================================================================

use std::sync::Arc;

use crate::error::{EngineError, Result};
use crate::pixels::{CoverageBuffer, PixelBuffer};

/// Stable identifier, unique within a stack for the layer's lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerId(pub u64);

impl std::fmt::Display for LayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum BlendMode {
    #[default]
    Normal,
    Multiply,
    Screen,
    Overlay,
    Darken,
    Lighten,
    Difference,
    Additive,
    HardLight,
    SoftLight,
    Exclusion,
}

impl BlendMode {
    pub fn all() -> &'static [BlendMode] {
        &[
            BlendMode::Normal,
            BlendMode::Multiply,
            BlendMode::Screen,
            BlendMode::Overlay,
            BlendMode::Darken,
            BlendMode::Lighten,
            BlendMode::Difference,
            BlendMode::Additive,
            BlendMode::HardLight,
            BlendMode::SoftLight,
            BlendMode::Exclusion,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            BlendMode::Normal => "normal",
            BlendMode::Multiply => "multiply",
            BlendMode::Screen => "screen",
            BlendMode::Overlay => "overlay",
            BlendMode::Darken => "darken",
            BlendMode::Lighten => "lighten",
            BlendMode::Difference => "difference",
            BlendMode::Additive => "additive",
            BlendMode::HardLight => "hard_light",
            BlendMode::SoftLight => "soft_light",
            BlendMode::Exclusion => "exclusion",
        }
    }

    /// Stable id for binary serialization.
    pub fn to_u8(&self) -> u8 {
        match self {
            BlendMode::Normal => 0,
            BlendMode::Multiply => 1,
            BlendMode::Screen => 2,
            BlendMode::Overlay => 3,
            BlendMode::Darken => 4,
            BlendMode::Lighten => 5,
            BlendMode::Difference => 6,
            BlendMode::Additive => 7,
            BlendMode::HardLight => 8,
            BlendMode::SoftLight => 9,
            BlendMode::Exclusion => 10,
        }
    }

    pub fn from_u8(v: u8) -> Result<Self> {
        BlendMode::all()
            .iter()
            .copied()
            .find(|m| m.to_u8() == v)
            .ok_or_else(|| EngineError::unsupported(format!("blend mode id {}", v)))
    }

    pub fn from_name(name: &str) -> Result<Self> {
        let wanted = name.trim().to_lowercase().replace(['-', ' '], "_");
        BlendMode::all()
            .iter()
            .copied()
            .find(|m| m.name() == wanted)
            .ok_or_else(|| EngineError::unsupported(format!("blend mode '{}'", name)))
    }
}

/// A single layer.  Fields are private so that every mutation bumps
/// `revision`, which the compositor and the commit path rely on.
#[derive(Clone, Debug)]
pub struct Layer {
    id: LayerId,
    name: String,
    pixels: Arc<PixelBuffer>,
    opacity: f32,
    blend_mode: BlendMode,
    visible: bool,
    mask: Option<Arc<CoverageBuffer>>,
    revision: u64,
}

impl Layer {
    pub fn new(id: LayerId, name: impl Into<String>, pixels: PixelBuffer) -> Self {
        Self {
            id,
            name: name.into(),
            pixels: Arc::new(pixels),
            opacity: 1.0,
            blend_mode: BlendMode::Normal,
            visible: true,
            mask: None,
            revision: 0,
        }
    }

    pub fn with_opacity(mut self, opacity: f32) -> Self {
        self.opacity = opacity.clamp(0.0, 1.0);
        self
    }

    pub fn with_blend_mode(mut self, mode: BlendMode) -> Self {
        self.blend_mode = mode;
        self
    }

    pub fn with_visible(mut self, visible: bool) -> Self {
        self.visible = visible;
        self
    }

    pub fn id(&self) -> LayerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pixels(&self) -> &PixelBuffer {
        &self.pixels
    }

    /// Shared handle to the pixels; workers read from this without locking.
    pub fn pixels_arc(&self) -> Arc<PixelBuffer> {
        Arc::clone(&self.pixels)
    }

    pub fn opacity(&self) -> f32 {
        self.opacity
    }

    pub fn blend_mode(&self) -> BlendMode {
        self.blend_mode
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn mask(&self) -> Option<&CoverageBuffer> {
        self.mask.as_deref()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    /// Contributes to the composite at all?
    pub fn is_rendered(&self) -> bool {
        self.visible && self.opacity > 0.0
    }

    fn touch(&mut self) {
        self.revision = self.revision.wrapping_add(1);
    }

    /// Copy-on-write access: a snapshot still held by history or a worker is
    /// left untouched.
    pub(crate) fn pixels_mut(&mut self) -> &mut PixelBuffer {
        self.touch();
        Arc::make_mut(&mut self.pixels)
    }

    pub(crate) fn set_pixels(&mut self, pixels: Arc<PixelBuffer>) {
        self.touch();
        self.pixels = pixels;
    }

    pub(crate) fn set_name(&mut self, name: String) {
        self.touch();
        self.name = name;
    }

    pub(crate) fn set_opacity(&mut self, opacity: f32) {
        self.touch();
        self.opacity = opacity;
    }

    pub(crate) fn set_visible(&mut self, visible: bool) {
        self.touch();
        self.visible = visible;
    }

    pub(crate) fn set_blend_mode(&mut self, mode: BlendMode) {
        self.touch();
        self.blend_mode = mode;
    }

    pub(crate) fn set_mask(&mut self, mask: Option<Arc<CoverageBuffer>>) {
        self.touch();
        self.mask = mask;
    }

    pub(crate) fn mask_arc(&self) -> Option<Arc<CoverageBuffer>> {
        self.mask.clone()
    }

    /// Copy with a fresh id and name; pixels stay shared until written.
    pub(crate) fn duplicate_as(&self, id: LayerId, name: String) -> Layer {
        Layer {
            id,
            name,
            pixels: Arc::clone(&self.pixels),
            opacity: self.opacity,
            blend_mode: self.blend_mode,
            visible: self.visible,
            mask: self.mask.clone(),
            revision: 0,
        }
    }

    /// Approximate bytes owned by this layer (pixels + mask + name).
    pub fn memory_bytes(&self) -> usize {
        self.pixels.memory_bytes()
            + self.mask.as_ref().map_or(0, |m| m.memory_bytes())
            + self.name.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blend_mode_ids_round_trip_and_reject_unknown() {
        for mode in BlendMode::all() {
            assert_eq!(BlendMode::from_u8(mode.to_u8()).unwrap(), *mode);
            assert_eq!(BlendMode::from_name(mode.name()).unwrap(), *mode);
        }
        assert_eq!(
            BlendMode::from_u8(200).unwrap_err().kind(),
            crate::error::ErrorKind::Unsupported
        );
        assert_eq!(BlendMode::from_name("Hard Light").unwrap(), BlendMode::HardLight);
        assert!(BlendMode::from_name("dissolve").is_err());
    }

    #[test]
    fn mutation_bumps_revision_and_copies_on_write() {
        let buf = PixelBuffer::filled(4, 4, [10, 20, 30, 255]).unwrap();
        let mut layer = Layer::new(LayerId(1), "L", buf);
        let snapshot = layer.pixels_arc();
        let r0 = layer.revision();
        layer.pixels_mut().put_pixel(0, 0, [0, 0, 0, 0]);
        assert!(layer.revision() > r0);
        assert_eq!(snapshot.get_pixel(0, 0), [10, 20, 30, 255]);
        assert_eq!(layer.pixels().get_pixel(0, 0), [0, 0, 0, 0]);
    }

    #[test]
    fn duplicate_shares_pixels_with_new_identity() {
        let layer = Layer::new(LayerId(3), "Base", PixelBuffer::new(2, 2).unwrap()).with_opacity(0.4);
        let copy = layer.duplicate_as(LayerId(9), "Base copy".into());
        assert_eq!(copy.id(), LayerId(9));
        assert_eq!(copy.opacity(), 0.4);
        assert!(Arc::ptr_eq(&layer.pixels_arc(), &copy.pixels_arc()));
    }
}
