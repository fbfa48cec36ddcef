// ============================================================================
// LAYER STACK — ordered layers (bottom → top) and the operations on them
// ============================================================================
//
// Every method here mutates directly.  Undoable versions of the same
// operations live in `history` (as commands) and are exposed on `Project`.

use std::sync::Arc;

use uuid::Uuid;

use crate::composite;
use crate::error::{EngineError, Result};
use crate::events::{ChangeEvent, EventBus};
use crate::layer::{BlendMode, Layer, LayerId};
use crate::pixels::{CoverageBuffer, PixelBuffer, Rect};
use crate::transform::{self, CanvasTransform};

/// Everything needed to perform a visible-layer merge and to take it back.
#[derive(Clone, Debug)]
pub struct MergePlan {
    /// Merged layers with their original indices, ascending.
    pub removed: Vec<(usize, Layer)>,
    pub merged: Layer,
    /// Index the merged layer takes once the others are gone.
    pub insert_at: usize,
}

/// Canvas size plus the full layer list at one moment.  Pixels are shared
/// with the stack through `Arc`.
#[derive(Clone, Debug)]
pub struct CanvasSnapshot {
    pub width: u32,
    pub height: u32,
    pub layers: Vec<Layer>,
}

impl CanvasSnapshot {
    pub fn memory_bytes(&self) -> usize {
        self.layers.iter().map(Layer::memory_bytes).sum()
    }
}

/// A canvas transform with the states on either side of it.
#[derive(Clone, Debug)]
pub struct CanvasPlan {
    pub transform: CanvasTransform,
    pub before: CanvasSnapshot,
    pub after: CanvasSnapshot,
}

#[derive(Debug)]
pub struct LayerStack {
    uid: Uuid,
    /// `None` until an image is loaded.
    canvas: Option<(u32, u32)>,
    layers: Vec<Layer>,
    next_id: u64,
    version: u64,
    events: EventBus,
}

impl LayerStack {
    /// Empty stack over a `width`×`height` canvas.
    pub fn new(width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(EngineError::out_of_range(format!(
                "canvas {}×{} has no pixels",
                width, height
            )));
        }
        Ok(Self {
            uid: Uuid::new_v4(),
            canvas: Some((width, height)),
            layers: Vec::new(),
            next_id: 1,
            version: 0,
            events: EventBus::new(),
        })
    }

    /// Canvas with a single filled "Background" layer.
    pub fn with_background(width: u32, height: u32, color: [u8; 4]) -> Result<Self> {
        let mut stack = Self::new(width, height)?;
        let bg = stack.new_layer("Background", color)?;
        stack.add_layer(0, bg)?;
        Ok(stack)
    }

    /// "No image loaded": every layer operation is rejected.
    pub fn unloaded() -> Self {
        Self {
            uid: Uuid::new_v4(),
            canvas: None,
            layers: Vec::new(),
            next_id: 1,
            version: 0,
            events: EventBus::new(),
        }
    }

    pub fn set_events(&mut self, events: EventBus) {
        self.events = events;
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn uid(&self) -> Uuid {
        self.uid
    }

    /// Bumped by every mutation, including pixel writes.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_loaded(&self) -> bool {
        self.canvas.is_some()
    }

    pub fn canvas_size(&self) -> Result<(u32, u32)> {
        self.canvas
            .ok_or_else(|| EngineError::invalid_state("no image loaded"))
    }

    pub fn width(&self) -> u32 {
        self.canvas.map_or(0, |c| c.0)
    }

    pub fn height(&self) -> u32 {
        self.canvas.map_or(0, |c| c.1)
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Loaded but layer-less (e.g. after removing the only layer).
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Bottom → top.
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn iter(&self) -> impl Iterator<Item = &Layer> {
        self.layers.iter()
    }

    pub fn get(&self, id: LayerId) -> Option<&Layer> {
        self.layers.iter().find(|l| l.id() == id)
    }

    pub fn layer_at(&self, index: usize) -> Option<&Layer> {
        self.layers.get(index)
    }

    pub fn top(&self) -> Option<&Layer> {
        self.layers.last()
    }

    pub fn index_of(&self, id: LayerId) -> Result<usize> {
        self.layers
            .iter()
            .position(|l| l.id() == id)
            .ok_or_else(|| EngineError::out_of_range(format!("layer {} not in stack", id)))
    }

    pub fn visible_count(&self) -> usize {
        self.layers.iter().filter(|l| l.is_visible()).count()
    }

    pub fn allocate_id(&mut self) -> LayerId {
        let id = LayerId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Fresh canvas-sized layer with a new id.  Not inserted.
    pub fn new_layer(&mut self, name: impl Into<String>, fill: [u8; 4]) -> Result<Layer> {
        let (w, h) = self.canvas_size()?;
        let pixels = PixelBuffer::filled(w, h, fill)?;
        Ok(Layer::new(self.allocate_id(), name, pixels))
    }

    /// Canvas-sized layer wrapping existing pixels (image import).
    pub fn layer_from_pixels(&mut self, name: impl Into<String>, pixels: PixelBuffer) -> Result<Layer> {
        let (w, h) = self.canvas_size()?;
        if pixels.dimensions() != (w, h) {
            return Err(EngineError::out_of_range(format!(
                "image is {}×{}, canvas is {}×{}",
                pixels.width(),
                pixels.height(),
                w,
                h
            )));
        }
        Ok(Layer::new(self.allocate_id(), name, pixels))
    }

    fn bump(&mut self) {
        self.version = self.version.wrapping_add(1);
    }

    fn emit(&self, event: ChangeEvent) {
        self.events.emit(event);
    }

    fn find_mut(&mut self, id: LayerId) -> Result<&mut Layer> {
        self.canvas_size()?;
        self.layers
            .iter_mut()
            .find(|l| l.id() == id)
            .ok_or_else(|| EngineError::out_of_range(format!("layer {} not in stack", id)))
    }

    // ------------------------------------------------------------------------
    // Structural operations
    // ------------------------------------------------------------------------

    pub fn add_layer(&mut self, at_index: usize, layer: Layer) -> Result<()> {
        let (w, h) = self.canvas_size()?;
        if self.get(layer.id()).is_some() {
            return Err(EngineError::invalid_state(format!(
                "layer id {} already present",
                layer.id()
            )));
        }
        if at_index > self.layers.len() {
            return Err(EngineError::out_of_range(format!(
                "insert index {} beyond stack of {}",
                at_index,
                self.layers.len()
            )));
        }
        if (layer.width(), layer.height()) != (w, h) {
            return Err(EngineError::out_of_range(format!(
                "layer is {}×{}, canvas is {}×{}",
                layer.width(),
                layer.height(),
                w,
                h
            )));
        }
        if let Some(mask) = layer.mask() {
            if mask.dimensions() != (w, h) {
                return Err(EngineError::out_of_range("layer mask does not match canvas"));
            }
        }
        let id = layer.id();
        self.next_id = self.next_id.max(id.0 + 1);
        self.layers.insert(at_index, layer);
        self.bump();
        self.emit(ChangeEvent::LayerAdded { id, index: at_index });
        Ok(())
    }

    /// Remove and return the layer.  Removing the last one leaves an empty
    /// (still loaded) stack.
    pub fn remove_layer(&mut self, id: LayerId) -> Result<Layer> {
        self.canvas_size()?;
        let index = self.index_of(id)?;
        let layer = self.layers.remove(index);
        self.bump();
        self.emit(ChangeEvent::LayerRemoved { id });
        Ok(layer)
    }

    /// Returns the index the layer came from.
    pub fn move_layer(&mut self, id: LayerId, new_index: usize) -> Result<usize> {
        self.canvas_size()?;
        let from = self.index_of(id)?;
        if new_index >= self.layers.len() {
            return Err(EngineError::out_of_range(format!(
                "move target {} beyond stack of {}",
                new_index,
                self.layers.len()
            )));
        }
        if from != new_index {
            let layer = self.layers.remove(from);
            self.layers.insert(new_index, layer);
            self.bump();
            self.emit(ChangeEvent::LayerMoved { id, from, to: new_index });
        }
        Ok(from)
    }

    /// Copy placed directly above the source.  Returns the new id.
    pub fn duplicate_layer(&mut self, id: LayerId) -> Result<LayerId> {
        let (index, copy) = self.plan_duplicate(id)?;
        let new_id = copy.id();
        self.add_layer(index, copy)?;
        Ok(new_id)
    }

    pub(crate) fn plan_duplicate(&mut self, id: LayerId) -> Result<(usize, Layer)> {
        self.canvas_size()?;
        let index = self.index_of(id)?;
        let new_id = self.allocate_id();
        let source = &self.layers[index];
        let copy = source.duplicate_as(new_id, format!("{} copy", source.name()));
        Ok((index + 1, copy))
    }

    /// Flatten every visible layer into one layer at the z-position of the
    /// topmost merged layer.  Hidden layers keep their place.
    pub fn merge_visible(&mut self) -> Result<LayerId> {
        let plan = self.plan_merge()?;
        self.apply_merge(&plan)?;
        Ok(plan.merged.id())
    }

    /// Compute the merge without touching the stack (apart from reserving
    /// an id for the merged layer).
    pub(crate) fn plan_merge(&mut self) -> Result<MergePlan> {
        let (w, h) = self.canvas_size()?;
        let removed: Vec<(usize, Layer)> = self
            .layers
            .iter()
            .enumerate()
            .filter(|(_, l)| l.is_visible())
            .map(|(i, l)| (i, l.clone()))
            .collect();
        let Some((top_index, _)) = removed.last() else {
            return Err(EngineError::invalid_state("no visible layers to merge"));
        };
        let insert_at = top_index + 1 - removed.len();
        let merged_id = self.allocate_id();
        let merged = if let [(_, only)] = removed.as_slice() {
            // Single visible layer: exact copy, metadata included.
            only.duplicate_as(merged_id, only.name().to_string())
        } else {
            let pixels = composite::flatten(removed.iter().map(|(_, l)| l), w, h)?;
            Layer::new(merged_id, "Merged", pixels)
        };
        Ok(MergePlan {
            removed,
            merged,
            insert_at,
        })
    }

    pub(crate) fn apply_merge(&mut self, plan: &MergePlan) -> Result<()> {
        for (_, layer) in &plan.removed {
            self.index_of(layer.id())?;
        }
        for (_, layer) in &plan.removed {
            self.remove_layer(layer.id())?;
        }
        self.add_layer(plan.insert_at, plan.merged.clone())
    }

    pub(crate) fn revert_merge(&mut self, plan: &MergePlan) -> Result<()> {
        self.remove_layer(plan.merged.id())?;
        for (index, layer) in &plan.removed {
            self.add_layer(*index, layer.clone())?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Metadata: each setter returns the previous value
    // ------------------------------------------------------------------------

    pub fn set_visibility(&mut self, id: LayerId, visible: bool) -> Result<bool> {
        let layer = self.find_mut(id)?;
        let old = layer.is_visible();
        layer.set_visible(visible);
        self.bump();
        self.emit(ChangeEvent::LayerChanged { id });
        Ok(old)
    }

    pub fn set_opacity(&mut self, id: LayerId, opacity: f32) -> Result<f32> {
        if !opacity.is_finite() || !(0.0..=1.0).contains(&opacity) {
            return Err(EngineError::out_of_range(format!(
                "opacity {} outside 0..=1",
                opacity
            )));
        }
        let layer = self.find_mut(id)?;
        let old = layer.opacity();
        layer.set_opacity(opacity);
        self.bump();
        self.emit(ChangeEvent::LayerChanged { id });
        Ok(old)
    }

    pub fn rename_layer(&mut self, id: LayerId, name: impl Into<String>) -> Result<String> {
        let layer = self.find_mut(id)?;
        let old = layer.name().to_string();
        layer.set_name(name.into());
        self.bump();
        self.emit(ChangeEvent::LayerChanged { id });
        Ok(old)
    }

    pub fn set_blend_mode(&mut self, id: LayerId, mode: BlendMode) -> Result<BlendMode> {
        let layer = self.find_mut(id)?;
        let old = layer.blend_mode();
        layer.set_blend_mode(mode);
        self.bump();
        self.emit(ChangeEvent::LayerChanged { id });
        Ok(old)
    }

    pub fn set_mask(
        &mut self,
        id: LayerId,
        mask: Option<CoverageBuffer>,
    ) -> Result<Option<Arc<CoverageBuffer>>> {
        self.replace_mask(id, mask.map(Arc::new))
    }

    pub(crate) fn replace_mask(
        &mut self,
        id: LayerId,
        mask: Option<Arc<CoverageBuffer>>,
    ) -> Result<Option<Arc<CoverageBuffer>>> {
        let (w, h) = self.canvas_size()?;
        if let Some(m) = &mask {
            if m.dimensions() != (w, h) {
                return Err(EngineError::out_of_range(format!(
                    "mask is {}×{}, canvas is {}×{}",
                    m.width(),
                    m.height(),
                    w,
                    h
                )));
            }
        }
        let layer = self.find_mut(id)?;
        let old = layer.mask_arc();
        layer.set_mask(mask);
        self.bump();
        self.emit(ChangeEvent::LayerChanged { id });
        Ok(old)
    }

    // ------------------------------------------------------------------------
    // Pixel access
    // ------------------------------------------------------------------------

    /// Write a packed RGBA patch into one layer.
    pub(crate) fn write_patch(&mut self, id: LayerId, rect: Rect, data: &[u8]) -> Result<()> {
        let layer = self.find_mut(id)?;
        if !rect.fits_within(layer.width(), layer.height()) {
            return Err(EngineError::out_of_range(format!("patch {:?} outside layer", rect)));
        }
        layer.pixels_mut().blit_region(rect, data)?;
        self.bump();
        self.emit(ChangeEvent::LayerChanged { id });
        Ok(())
    }

    /// Swap in an entire pixel buffer (shared, no copy).
    pub(crate) fn replace_pixels(&mut self, id: LayerId, pixels: Arc<PixelBuffer>) -> Result<()> {
        let (w, h) = self.canvas_size()?;
        if pixels.dimensions() != (w, h) {
            return Err(EngineError::out_of_range("replacement pixels do not match canvas"));
        }
        let layer = self.find_mut(id)?;
        layer.set_pixels(pixels);
        self.bump();
        self.emit(ChangeEvent::LayerChanged { id });
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Canvas geometry
    // ------------------------------------------------------------------------

    /// Flip, rotate, crop or resize every layer (and mask) at once.
    pub fn transform_canvas(&mut self, transform: &CanvasTransform) -> Result<()> {
        let plan = self.plan_transform(transform)?;
        self.restore_canvas(&plan.after)
    }

    /// Compute the transformed layers without touching the stack.
    pub(crate) fn plan_transform(&self, transform: &CanvasTransform) -> Result<CanvasPlan> {
        let before = self.snapshot()?;
        let (width, height) = transform.output_size(before.width, before.height)?;
        let layers = transform::transform_layers(&before.layers, transform)?;
        Ok(CanvasPlan {
            transform: transform.clone(),
            before,
            after: CanvasSnapshot { width, height, layers },
        })
    }

    pub fn snapshot(&self) -> Result<CanvasSnapshot> {
        let (width, height) = self.canvas_size()?;
        Ok(CanvasSnapshot {
            width,
            height,
            layers: self.layers.clone(),
        })
    }

    /// Put back a canvas size and layer list.  Layer ids are kept.
    pub(crate) fn restore_canvas(&mut self, snapshot: &CanvasSnapshot) -> Result<()> {
        self.canvas_size()?;
        let dims = (snapshot.width, snapshot.height);
        for layer in &snapshot.layers {
            if (layer.width(), layer.height()) != dims || layer.mask().is_some_and(|m| m.dimensions() != dims) {
                return Err(EngineError::out_of_range(format!(
                    "layer {} does not match the {}×{} canvas",
                    layer.id(),
                    dims.0,
                    dims.1
                )));
            }
        }
        self.canvas = Some(dims);
        self.layers = snapshot.layers.clone();
        if let Some(max) = self.layers.iter().map(|l| l.id().0).max() {
            self.next_id = self.next_id.max(max + 1);
        }
        self.bump();
        self.emit(ChangeEvent::CanvasChanged {
            width: dims.0,
            height: dims.1,
        });
        Ok(())
    }

    /// Replace canvas and contents wholesale (project load).
    pub fn replace_all(&mut self, width: u32, height: u32, layers: Vec<Layer>) -> Result<()> {
        let mut fresh = LayerStack::new(width, height)?;
        for layer in layers {
            let at = fresh.len();
            fresh.add_layer(at, layer)?;
        }
        self.canvas = fresh.canvas;
        self.layers = fresh.layers;
        self.next_id = self.next_id.max(fresh.next_id);
        self.bump();
        self.emit(ChangeEvent::StackReplaced);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn push(stack: &mut LayerStack, name: &str, color: [u8; 4]) -> LayerId {
        let layer = stack.new_layer(name, color).unwrap();
        let id = layer.id();
        let at = stack.len();
        stack.add_layer(at, layer).unwrap();
        id
    }

    fn order(stack: &LayerStack) -> Vec<LayerId> {
        stack.iter().map(|l| l.id()).collect()
    }

    #[test]
    fn unloaded_stack_rejects_layer_operations() {
        let mut stack = LayerStack::unloaded();
        assert_eq!(stack.new_layer("x", [0; 4]).unwrap_err().kind(), ErrorKind::InvalidState);
        assert_eq!(
            stack.remove_layer(LayerId(1)).unwrap_err().kind(),
            ErrorKind::InvalidState
        );
        assert_eq!(stack.merge_visible().unwrap_err().kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut stack = LayerStack::new(2, 2).unwrap();
        let id = push(&mut stack, "a", [0; 4]);
        let clash = Layer::new(id, "b", PixelBuffer::new(2, 2).unwrap());
        assert_eq!(stack.add_layer(0, clash).unwrap_err().kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn wrong_size_and_bad_index_are_out_of_range() {
        let mut stack = LayerStack::new(2, 2).unwrap();
        let small = Layer::new(LayerId(50), "s", PixelBuffer::new(1, 1).unwrap());
        assert_eq!(stack.add_layer(0, small).unwrap_err().kind(), ErrorKind::OutOfRange);
        let ok = Layer::new(LayerId(51), "o", PixelBuffer::new(2, 2).unwrap());
        assert_eq!(stack.add_layer(3, ok).unwrap_err().kind(), ErrorKind::OutOfRange);
    }

    #[test]
    fn removing_last_layer_leaves_empty_loaded_stack() {
        let mut stack = LayerStack::with_background(3, 3, [255; 4]).unwrap();
        let id = stack.top().unwrap().id();
        stack.remove_layer(id).unwrap();
        assert!(stack.is_empty());
        assert!(stack.is_loaded());
        assert_eq!(stack.remove_layer(id).unwrap_err().kind(), ErrorKind::OutOfRange);
        push(&mut stack, "again", [0; 4]);
        assert_eq!(stack.len(), 1);
    }

    #[test]
    fn move_reorders_and_reports_origin() {
        let mut stack = LayerStack::new(2, 2).unwrap();
        let a = push(&mut stack, "a", [0; 4]);
        let b = push(&mut stack, "b", [0; 4]);
        let c = push(&mut stack, "c", [0; 4]);
        assert_eq!(stack.move_layer(a, 2).unwrap(), 0);
        assert_eq!(order(&stack), vec![b, c, a]);
        assert_eq!(stack.move_layer(a, 3).unwrap_err().kind(), ErrorKind::OutOfRange);
    }

    #[test]
    fn opacity_must_be_in_unit_range() {
        let mut stack = LayerStack::new(2, 2).unwrap();
        let a = push(&mut stack, "a", [0; 4]);
        assert_eq!(stack.set_opacity(a, 1.5).unwrap_err().kind(), ErrorKind::OutOfRange);
        assert_eq!(stack.set_opacity(a, f32::NAN).unwrap_err().kind(), ErrorKind::OutOfRange);
        assert_eq!(stack.set_opacity(a, 0.25).unwrap(), 1.0);
        assert_eq!(stack.get(a).unwrap().opacity(), 0.25);
    }

    #[test]
    fn duplicate_goes_above_source() {
        let mut stack = LayerStack::new(2, 2).unwrap();
        let a = push(&mut stack, "a", [1, 2, 3, 4]);
        let b = push(&mut stack, "b", [0; 4]);
        let copy = stack.duplicate_layer(a).unwrap();
        assert_eq!(order(&stack), vec![a, copy, b]);
        assert_eq!(stack.get(copy).unwrap().name(), "a copy");
        assert_eq!(stack.get(copy).unwrap().pixels(), stack.get(a).unwrap().pixels());
    }

    #[test]
    fn merge_single_visible_layer_is_pixel_identical() {
        let mut stack = LayerStack::new(4, 4).unwrap();
        let hidden = push(&mut stack, "hidden", [9, 9, 9, 255]);
        let only = push(&mut stack, "only", [10, 100, 200, 77]);
        stack.set_visibility(hidden, false).unwrap();
        let before = stack.get(only).unwrap().pixels().clone();
        let merged = stack.merge_visible().unwrap();
        assert_eq!(stack.len(), 2);
        assert_eq!(stack.get(merged).unwrap().pixels(), &before);
        assert!(stack.get(hidden).is_some());
    }

    #[test]
    fn merge_lands_at_topmost_merged_position() {
        let mut stack = LayerStack::new(2, 2).unwrap();
        let a = push(&mut stack, "a", [255, 0, 0, 255]);
        let h = push(&mut stack, "h", [0; 4]);
        let b = push(&mut stack, "b", [0, 255, 0, 255]);
        let top_hidden = push(&mut stack, "t", [0; 4]);
        stack.set_visibility(h, false).unwrap();
        stack.set_visibility(top_hidden, false).unwrap();
        let merged = stack.merge_visible().unwrap();
        assert_eq!(order(&stack), vec![h, merged, top_hidden]);
        let m = stack.get(merged).unwrap();
        assert_eq!(m.opacity(), 1.0);
        assert_eq!(m.pixels().get_pixel(0, 0), [0, 255, 0, 255]);
        assert!(stack.get(a).is_none() && stack.get(b).is_none());
    }

    #[test]
    fn merge_without_visible_layers_is_invalid() {
        let mut stack = LayerStack::new(2, 2).unwrap();
        let a = push(&mut stack, "a", [0; 4]);
        stack.set_visibility(a, false).unwrap();
        assert_eq!(stack.merge_visible().unwrap_err().kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn mutations_bump_version_and_emit_events() {
        let mut stack = LayerStack::new(2, 2).unwrap();
        let rx = stack.events().subscribe();
        let v0 = stack.version();
        let a = push(&mut stack, "a", [0; 4]);
        stack.rename_layer(a, "renamed").unwrap();
        assert!(stack.version() > v0);
        assert_eq!(rx.try_recv().unwrap(), ChangeEvent::LayerAdded { id: a, index: 0 });
        assert_eq!(rx.try_recv().unwrap(), ChangeEvent::LayerChanged { id: a });
    }

    #[test]
    fn canvas_transform_keeps_ids_and_masks_in_step() {
        let mut stack = LayerStack::new(4, 2).unwrap();
        let a = push(&mut stack, "a", [1, 2, 3, 255]);
        stack.set_mask(a, Some(CoverageBuffer::filled(4, 2, 0.5).unwrap())).unwrap();
        let rx = stack.events().subscribe();
        let revision = stack.get(a).unwrap().revision();

        stack.transform_canvas(&CanvasTransform::Rotate90).unwrap();
        assert_eq!(stack.canvas_size().unwrap(), (2, 4));
        let layer = stack.get(a).unwrap();
        assert_eq!(layer.pixels().dimensions(), (2, 4));
        assert_eq!(layer.mask().unwrap().dimensions(), (2, 4));
        assert!(layer.revision() > revision);
        assert_eq!(rx.try_recv().unwrap(), ChangeEvent::CanvasChanged { width: 2, height: 4 });

        let b = push(&mut stack, "b", [0; 4]);
        assert_ne!(a, b);
    }

    #[test]
    fn canvas_transform_needs_loaded_stack() {
        let mut stack = LayerStack::unloaded();
        let err = stack.transform_canvas(&CanvasTransform::FlipHorizontal).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }
}
