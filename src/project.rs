use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use uuid::Uuid;

use crate::composite::CompositeEngine;
use crate::error::{EngineError, Result};
use crate::events::{ChangeEvent, EventBus};
use crate::filters::{CancelToken, FilterSpec};
use crate::history::{Command, HistoryManager, LayerOpCommand, LayerOperation, PixelCommand};
use crate::io::{self, PixelCodec};
use crate::layer::{BlendMode, Layer, LayerId};
use crate::logger::{self, SharedTelemetry};
use crate::pipeline::FilterPipeline;
use crate::pixels::{CoverageBuffer, PixelBuffer};
use crate::selection::{SelectionMask, SelectionMode, SelectionShape};
use crate::settings::EngineSettings;
use crate::stack::LayerStack;
use crate::transform::CanvasTransform;
use crate::{log_info, log_warn};

/// Everything a background filter job needs, snapshotted from the project.
#[derive(Clone, Debug)]
pub struct FilterTarget {
    pub layer: LayerId,
    pub pixels: Arc<PixelBuffer>,
    pub revision: u64,
    pub region: Option<Arc<CoverageBuffer>>,
}

/// Single open document.
pub struct Project {
    pub id: Uuid,
    /// Display name (derived from path or "Untitled-X")
    pub name: String,
    /// `None` for unsaved/untitled documents.
    pub path: Option<PathBuf>,
    is_dirty: bool,
    stack: LayerStack,
    history: HistoryManager,
    engine: CompositeEngine,
    pipeline: FilterPipeline,
    selection: Option<SelectionMask>,
    active: Option<LayerId>,
    events: EventBus,
    telemetry: SharedTelemetry,
}

impl Project {
    /// Document around an existing stack.  History starts empty.
    pub fn from_stack(name: impl Into<String>, stack: LayerStack, settings: &EngineSettings) -> Self {
        let mut project = Self {
            id: Uuid::new_v4(),
            name: name.into(),
            path: None,
            is_dirty: false,
            stack,
            history: HistoryManager::new(settings.max_undo_steps),
            engine: CompositeEngine::new(),
            pipeline: FilterPipeline::new(settings.preview_max_edge, settings.tile_rows),
            selection: None,
            active: None,
            events: EventBus::new(),
            telemetry: logger::null(),
        };
        project.history.set_memory_limit(settings.history_byte_limit());
        project.stack.set_events(project.events.clone());
        project.history.set_events(project.events.clone());
        project.active = project.stack.top().map(|l| l.id());
        project
    }

    /// New document with an opaque white "Background" layer.
    pub fn new_untitled(untitled_counter: usize, width: u32, height: u32, settings: &EngineSettings) -> Result<Self> {
        let stack = LayerStack::with_background(width, height, [255, 255, 255, 255])?;
        Ok(Self::from_stack(format!("Untitled-{}", untitled_counter), stack, settings))
    }

    /// Editor state before any image is loaded.
    pub fn unloaded(settings: &EngineSettings) -> Self {
        Self::from_stack("Untitled", LayerStack::unloaded(), settings)
    }

    /// Open a `.pcp` project file.
    pub fn open(path: &Path, settings: &EngineSettings) -> Result<Self> {
        let stack = io::load_project(path)?;
        let mut project = Self::from_stack(display_name(path), stack, settings);
        project.path = Some(path.to_path_buf());
        Ok(project)
    }

    /// Open a raster image as a single-layer document.
    pub fn open_image(path: &Path, codec: &dyn PixelCodec, settings: &EngineSettings) -> Result<Self> {
        let pixels = io::read_image(codec, path)?;
        let (w, h) = pixels.dimensions();
        let mut stack = LayerStack::new(w, h)?;
        let layer = stack.layer_from_pixels("Background", pixels)?;
        stack.add_layer(0, layer)?;
        let mut project = Self::from_stack(display_name(path), stack, settings);
        project.path = Some(path.to_path_buf());
        Ok(project)
    }

    pub fn set_telemetry(&mut self, telemetry: SharedTelemetry) {
        self.history.set_telemetry(Arc::clone(&telemetry));
        self.pipeline.set_telemetry(Arc::clone(&telemetry));
        self.telemetry = telemetry;
    }

    pub fn apply_settings(&mut self, settings: &EngineSettings) -> Result<()> {
        self.history.set_capacity(settings.max_undo_steps)?;
        self.history.set_memory_limit(settings.history_byte_limit());
        self.pipeline.set_preview_max_edge(settings.preview_max_edge);
        self.pipeline.set_tile_rows(settings.tile_rows);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn stack(&self) -> &LayerStack {
        &self.stack
    }

    pub fn history(&self) -> &HistoryManager {
        &self.history
    }

    pub fn pipeline(&self) -> &FilterPipeline {
        &self.pipeline
    }

    pub fn pipeline_mut(&mut self) -> &mut FilterPipeline {
        &mut self.pipeline
    }

    pub fn engine(&self) -> &CompositeEngine {
        &self.engine
    }

    /// Subscribe to model changes.  The receiver is read-only by construction.
    pub fn subscribe(&self) -> std::sync::mpsc::Receiver<ChangeEvent> {
        self.events.subscribe()
    }

    pub fn is_dirty(&self) -> bool {
        self.is_dirty
    }

    pub fn mark_dirty(&mut self) {
        self.is_dirty = true;
    }

    pub fn mark_clean(&mut self) {
        self.is_dirty = false;
    }

    /// Get the display title (name with dirty indicator)
    pub fn display_title(&self) -> String {
        if self.is_dirty {
            format!("{}*", self.name)
        } else {
            self.name.clone()
        }
    }

    pub fn active_layer(&self) -> Option<LayerId> {
        self.active
    }

    pub fn set_active_layer(&mut self, id: LayerId) -> Result<()> {
        self.stack.index_of(id)?;
        self.active = Some(id);
        Ok(())
    }

    fn active_or_err(&self) -> Result<LayerId> {
        self.stack.canvas_size()?;
        self.active
            .filter(|id| self.stack.get(*id).is_some())
            .ok_or_else(|| EngineError::invalid_state("no active layer"))
    }

    fn layer(&self, id: LayerId) -> Result<&Layer> {
        self.stack.canvas_size()?;
        self.stack
            .get(id)
            .ok_or_else(|| EngineError::out_of_range(format!("layer {} not in stack", id)))
    }

    // ------------------------------------------------------------------------
    // History
    // ------------------------------------------------------------------------

    /// Run a command through history.  All undoable edits end up here.
    pub fn execute(&mut self, command: Box<dyn Command>) -> Result<()> {
        self.history.execute(command, &mut self.stack)?;
        self.after_change();
        Ok(())
    }

    pub fn undo(&mut self) -> Result<String> {
        let description = self.history.undo(&mut self.stack)?;
        self.after_change();
        Ok(description)
    }

    pub fn redo(&mut self) -> Result<String> {
        let description = self.history.redo(&mut self.stack)?;
        self.after_change();
        Ok(description)
    }

    /// Undo `steps` commands.  The document is only touched (and marked
    /// dirty) when at least one step ran.
    pub fn undo_to(&mut self, steps: usize) -> Result<()> {
        let version = self.stack.version();
        let result = self.history.undo_to(steps, &mut self.stack);
        if self.stack.version() != version {
            self.after_change();
        }
        result
    }

    fn after_change(&mut self) {
        self.mark_dirty();
        let still_there = self.active.is_some_and(|id| self.stack.get(id).is_some());
        if !still_there {
            self.active = self.stack.top().map(|l| l.id());
        }
        // A canvas change (or its undo) leaves the old selection misaligned.
        let stale = self
            .selection
            .as_ref()
            .is_some_and(|m| Some(m.dimensions()) != self.stack.canvas_size().ok());
        if stale {
            self.clear_selection();
        }
    }

    fn execute_op(&mut self, op: LayerOperation) -> Result<()> {
        self.execute(Box::new(LayerOpCommand::new(op)))
    }

    // ------------------------------------------------------------------------
    // Undoable layer operations
    // ------------------------------------------------------------------------

    /// New layer filled with `fill`, placed on top and made active.
    pub fn add_layer(&mut self, name: impl Into<String>, fill: [u8; 4]) -> Result<LayerId> {
        let layer = self.stack.new_layer(name, fill)?;
        let index = self.stack.len();
        self.insert_layer(index, layer)
    }

    pub fn insert_layer(&mut self, index: usize, layer: Layer) -> Result<LayerId> {
        let id = layer.id();
        self.execute_op(LayerOperation::Add { index, layer })?;
        self.active = Some(id);
        Ok(id)
    }

    pub fn remove_layer(&mut self, id: LayerId) -> Result<()> {
        let index = self.stack.index_of(id)?;
        let layer = self.layer(id)?.clone();
        self.execute_op(LayerOperation::Remove { index, layer })
    }

    pub fn move_layer(&mut self, id: LayerId, new_index: usize) -> Result<()> {
        let from = self.stack.index_of(id)?;
        self.execute_op(LayerOperation::Move {
            id,
            from,
            to: new_index,
        })
    }

    pub fn set_visibility(&mut self, id: LayerId, visible: bool) -> Result<()> {
        let old = self.layer(id)?.is_visible();
        self.execute_op(LayerOperation::Visibility { id, old, new: visible })
    }

    pub fn set_opacity(&mut self, id: LayerId, opacity: f32) -> Result<()> {
        let old = self.layer(id)?.opacity();
        self.execute_op(LayerOperation::Opacity { id, old, new: opacity })
    }

    pub fn rename_layer(&mut self, id: LayerId, name: impl Into<String>) -> Result<()> {
        let old = self.layer(id)?.name().to_string();
        self.execute_op(LayerOperation::Rename {
            id,
            old,
            new: name.into(),
        })
    }

    pub fn set_blend_mode(&mut self, id: LayerId, mode: BlendMode) -> Result<()> {
        let old = self.layer(id)?.blend_mode();
        self.execute_op(LayerOperation::BlendMode { id, old, new: mode })
    }

    pub fn set_mask(&mut self, id: LayerId, mask: Option<CoverageBuffer>) -> Result<()> {
        let old = self.layer(id)?.mask_arc();
        self.execute_op(LayerOperation::Mask {
            id,
            old,
            new: mask.map(Arc::new),
        })
    }

    pub fn duplicate_layer(&mut self, id: LayerId) -> Result<LayerId> {
        let (index, layer) = self.stack.plan_duplicate(id)?;
        let new_id = layer.id();
        self.execute_op(LayerOperation::Duplicate {
            source: id,
            index,
            layer,
        })?;
        self.active = Some(new_id);
        Ok(new_id)
    }

    pub fn merge_visible(&mut self) -> Result<LayerId> {
        let plan = self.stack.plan_merge()?;
        let merged = plan.merged.id();
        self.execute_op(LayerOperation::Merge(plan))?;
        self.active = Some(merged);
        Ok(merged)
    }

    /// Flip, rotate, crop or resize the whole canvas (undoable).
    pub fn transform_canvas(&mut self, transform: &CanvasTransform) -> Result<()> {
        let plan = self.stack.plan_transform(transform)?;
        self.execute_op(LayerOperation::Canvas(plan))?;
        log_info!(self.telemetry, "canvas: {}", transform.label());
        Ok(())
    }

    /// Crop the canvas to the selection's bounding box.
    pub fn crop_to_selection(&mut self) -> Result<()> {
        let bounds = self
            .selection
            .as_ref()
            .ok_or_else(|| EngineError::invalid_state("no selection to crop to"))?
            .bounds()
            .ok_or_else(|| EngineError::invalid_state("selection is empty"))?;
        self.transform_canvas(&CanvasTransform::Crop(bounds))
    }

    /// Decode an image and add it as a new top layer (undoable).
    pub fn import_image(&mut self, path: &Path, codec: &dyn PixelCodec) -> Result<LayerId> {
        let pixels = io::read_image(codec, path)?;
        let layer = self.stack.layer_from_pixels(display_name(path), pixels)?;
        let index = self.stack.len();
        self.insert_layer(index, layer)
    }

    // ------------------------------------------------------------------------
    // Selection (session state, never undone or saved)
    // ------------------------------------------------------------------------

    pub fn selection(&self) -> Option<&SelectionMask> {
        self.selection.as_ref()
    }

    pub fn set_selection(&mut self, mask: Option<SelectionMask>) -> Result<()> {
        if let Some(m) = &mask {
            let canvas = self.stack.canvas_size()?;
            if m.dimensions() != canvas {
                return Err(EngineError::out_of_range(format!(
                    "selection is {}×{}, canvas is {}×{}",
                    m.width(),
                    m.height(),
                    canvas.0,
                    canvas.1
                )));
            }
        }
        self.selection = mask;
        self.events.emit(ChangeEvent::SelectionChanged);
        Ok(())
    }

    /// Combine `shape` into the current selection.
    pub fn select(&mut self, shape: &SelectionShape, mode: SelectionMode, antialias: bool) -> Result<()> {
        let (w, h) = self.stack.canvas_size()?;
        let mut mask = match self.selection.take() {
            Some(m) => m,
            None => SelectionMask::from_coverage(CoverageBuffer::new(w, h)?),
        };
        let result = mask.apply(shape, mode, antialias);
        self.selection = Some(mask);
        result?;
        self.events.emit(ChangeEvent::SelectionChanged);
        Ok(())
    }

    pub fn invert_selection(&mut self) -> Result<()> {
        let (w, h) = self.stack.canvas_size()?;
        let mut mask = match self.selection.take() {
            Some(m) => m,
            None => SelectionMask::from_coverage(CoverageBuffer::new(w, h)?),
        };
        mask.invert();
        self.selection = Some(mask);
        self.events.emit(ChangeEvent::SelectionChanged);
        Ok(())
    }

    pub fn clear_selection(&mut self) {
        if self.selection.take().is_some() {
            self.events.emit(ChangeEvent::SelectionChanged);
        }
    }

    // ------------------------------------------------------------------------
    // Filters and compositing
    // ------------------------------------------------------------------------

    pub fn composite(&mut self) -> Result<Arc<PixelBuffer>> {
        self.engine.composite(&self.stack)
    }

    /// Read-only preview of `spec` on the active layer, downsampled.  On
    /// failure the caller keeps its last composite; a `PreviewFailed` event
    /// and a warning are emitted.
    pub fn preview_filter(&self, spec: &FilterSpec) -> Result<PixelBuffer> {
        let result = self
            .active_or_err()
            .and_then(|id| self.layer(id))
            .and_then(|layer| self.pipeline.preview(layer, spec, self.selection.as_ref()));
        self.report_preview(result)
    }

    /// Full-resolution composite with the filtered active layer swapped in.
    /// Nothing in the model changes.
    pub fn preview_composite(&self, spec: &FilterSpec) -> Result<PixelBuffer> {
        let result = self.active_or_err().and_then(|id| {
            let layer = self.layer(id)?;
            let filtered = self.pipeline.render(
                layer.pixels(),
                spec,
                self.selection.as_ref().map(|m| m.coverage()),
                &CancelToken::new(),
            )?;
            self.engine.composite_with_override(&self.stack, id, &filtered)
        });
        self.report_preview(result)
    }

    fn report_preview(&self, result: Result<PixelBuffer>) -> Result<PixelBuffer> {
        if let Err(e) = &result {
            log_warn!(self.telemetry, "preview failed: {}", e);
            self.events.emit(ChangeEvent::PreviewFailed { message: e.to_string() });
        }
        result
    }

    /// Apply `spec` to the active layer (inside the selection, if any) and
    /// record it.  Returns `false` when the filter changed nothing.
    pub fn apply_filter(&mut self, spec: &FilterSpec) -> Result<bool> {
        let id = self.active_or_err()?;
        let command = self
            .pipeline
            .commit(self.layer(id)?, spec, self.selection.as_ref())?;
        self.publish(command)
    }

    /// Snapshot for a background commit or preview job.
    pub fn filter_target(&self) -> Result<FilterTarget> {
        let id = self.active_or_err()?;
        let layer = self.layer(id)?;
        Ok(FilterTarget {
            layer: id,
            pixels: layer.pixels_arc(),
            revision: layer.revision(),
            region: self.selection.as_ref().map(|m| Arc::new(m.coverage().clone())),
        })
    }

    /// Record a computed pixel command.  Rejected with `InvalidState` when the
    /// layer changed since the command's source snapshot was taken.  Empty
    /// commands are dropped and `false` returned.
    pub fn publish(&mut self, command: PixelCommand) -> Result<bool> {
        let layer = self.layer(command.layer())?;
        if layer.revision() != command.source_revision() {
            return Err(EngineError::invalid_state(format!(
                "layer {} changed since the filter started (revision {} → {})",
                command.layer(),
                command.source_revision(),
                layer.revision()
            )));
        }
        if command.is_noop() {
            log_info!(self.telemetry, "'{}' changed no pixels", command.description());
            return Ok(false);
        }
        self.execute(Box::new(command))?;
        Ok(true)
    }

    // ------------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------------

    pub fn save(&mut self, path: &Path) -> Result<()> {
        io::save_project(&self.stack, path)?;
        self.path = Some(path.to_path_buf());
        self.name = display_name(path);
        self.mark_clean();
        log_info!(self.telemetry, "saved '{}'", path.display());
        Ok(())
    }

    /// Flatten and encode to an image file; format from the extension.
    pub fn export(&mut self, path: &Path, codec: &dyn PixelCodec) -> Result<()> {
        let image = self.composite()?;
        io::write_image(codec, &image, path)
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "Unknown".to_string())
}

/// The project behind one mutation lock.  Worker results are published
/// through here; nothing else hands out `&mut` access.
#[derive(Clone)]
pub struct SharedProject(Arc<Mutex<Project>>);

impl SharedProject {
    pub fn new(project: Project) -> Self {
        Self(Arc::new(Mutex::new(project)))
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, Project>> {
        self.0
            .lock()
            .map_err(|_| EngineError::invalid_state("project lock poisoned"))
    }

    pub fn publish(&self, command: PixelCommand) -> Result<bool> {
        self.lock()?.publish(command)
    }

    pub fn filter_target(&self) -> Result<FilterTarget> {
        self.lock()?.filter_target()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::logger::Level;
    use crate::logger::tests::MemoryTelemetry;
    use crate::filters::ComputeCtx;
    use crate::pipeline::ComputeBackend;
    use crate::pixels::Rect;
    use crate::transform::{Anchor, Interpolation};

    fn project(w: u32, h: u32) -> Project {
        Project::new_untitled(1, w, h, &EngineSettings::default()).unwrap()
    }

    /// Project with an asymmetric masked layer on top of the background.
    fn painted(w: u32, h: u32) -> Project {
        let mut p = project(w, h);
        let mut px = PixelBuffer::new(w, h).unwrap();
        for y in 0..h {
            for x in 0..w {
                px.put_pixel(x, y, [(x * 40) as u8, (y * 30) as u8, (x + y) as u8, 255]);
            }
        }
        let layer = p.stack.layer_from_pixels("Ink", px).unwrap();
        let id = p.insert_layer(1, layer).unwrap();
        p.set_mask(id, Some(CoverageBuffer::filled(w, h, 0.5).unwrap())).unwrap();
        p
    }

    fn layer_bytes(p: &Project) -> Vec<Vec<u8>> {
        p.stack().layers().iter().map(|l| l.pixels().as_raw().to_vec()).collect()
    }

    /// Cancels the shared token mid-run and reports a device failure, so the
    /// CPU fallback starts on an already cancelled job.
    struct CancellingBackend;

    impl ComputeBackend for CancellingBackend {
        fn name(&self) -> &str {
            "cancelling"
        }

        fn supports(&self, _spec: &FilterSpec, _has_region: bool) -> bool {
            true
        }

        fn run(
            &self,
            _src: &PixelBuffer,
            _spec: &FilterSpec,
            _region: Option<&CoverageBuffer>,
            ctx: &ComputeCtx,
        ) -> Result<PixelBuffer> {
            ctx.cancel.cancel();
            Err(EngineError::ResourceExhausted("device lost".into()))
        }
    }

    #[test]
    fn new_project_has_background() {
        let p = project(8, 8);
        assert_eq!(p.stack().len(), 1);
        assert_eq!(p.stack().layers()[0].name(), "Background");
        assert_eq!(p.active_layer(), p.stack().top().map(|l| l.id()));
        assert!(!p.is_dirty());
        assert_eq!(p.display_title(), "Untitled-1");
    }

    #[test]
    fn every_layer_op_is_undoable() {
        let mut p = project(4, 4);
        let bg = p.active_layer().unwrap();
        let top = p.add_layer("Top", [1, 2, 3, 255]).unwrap();
        p.set_opacity(top, 0.25).unwrap();
        p.set_visibility(bg, false).unwrap();
        p.rename_layer(top, "Renamed").unwrap();
        p.set_blend_mode(top, BlendMode::Multiply).unwrap();
        p.set_mask(top, Some(CoverageBuffer::filled(4, 4, 0.5).unwrap())).unwrap();
        let dup = p.duplicate_layer(top).unwrap();
        p.move_layer(dup, 0).unwrap();
        p.remove_layer(bg).unwrap();
        p.merge_visible().unwrap();
        assert_eq!(p.history().undo_count(), 10);
        assert!(p.is_dirty());

        p.undo_to(10).unwrap();
        assert_eq!(p.stack().len(), 1);
        assert_eq!(p.stack().layers()[0].id(), bg);
        assert!(p.stack().layers()[0].is_visible());
        assert_eq!(p.active_layer(), Some(bg));
    }

    #[test]
    fn filter_commit_and_undo_restore_bytes() {
        let mut p = project(6, 6);
        let id = p.add_layer("Paint", [200, 30, 60, 255]).unwrap();
        let before = p.stack().get(id).unwrap().pixels().clone();
        assert!(p.apply_filter(&FilterSpec::Grayscale).unwrap());
        assert_ne!(p.stack().get(id).unwrap().pixels(), &before);
        assert_eq!(p.undo().unwrap(), "Filter: grayscale");
        assert_eq!(p.stack().get(id).unwrap().pixels(), &before);
    }

    #[test]
    fn stale_commit_rejected() {
        let mut p = project(6, 6);
        let id = p.active_layer().unwrap();
        let target = p.filter_target().unwrap();
        let command = p
            .pipeline()
            .commit_pixels(id, &target.pixels, target.revision, &FilterSpec::Invert, None, &CancelToken::new())
            .unwrap();
        p.set_opacity(id, 0.5).unwrap();
        let err = p.publish(command).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert_eq!(p.history().undo_count(), 1);
    }

    #[test]
    fn noop_filter_is_not_recorded() {
        let mut p = project(4, 4);
        p.set_selection(Some(SelectionMask::from_coverage(CoverageBuffer::new(4, 4).unwrap())))
            .unwrap();
        assert!(!p.apply_filter(&FilterSpec::Invert).unwrap());
        assert!(!p.history().can_undo());
    }

    #[test]
    fn failed_preview_emits_event_and_warning() {
        let mut p = project(4, 4);
        let sink = Arc::new(MemoryTelemetry::default());
        p.set_telemetry(sink.clone());
        let rx = p.subscribe();
        let err = p
            .preview_filter(&FilterSpec::Extension {
                name: "nope".into(),
                params: vec![],
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
        assert!(matches!(rx.try_recv(), Ok(ChangeEvent::PreviewFailed { .. })));
        let lines = sink.lines.lock().unwrap();
        assert!(lines.iter().any(|(lvl, _)| *lvl == Level::Warn));
    }

    #[test]
    fn preview_composite_leaves_model_alone() {
        let mut p = project(5, 5);
        let version = p.stack().version();
        let out = p.preview_composite(&FilterSpec::Invert).unwrap();
        assert_eq!(out.get_pixel(2, 2), [0, 0, 0, 255]);
        assert_eq!(p.stack().version(), version);
        assert_eq!(p.composite().unwrap().get_pixel(2, 2), [255, 255, 255, 255]);
    }

    #[test]
    fn selection_must_match_canvas() {
        let mut p = project(4, 4);
        let wrong = SelectionMask::rectangle(5, 4, Rect::new(0, 0, 1, 1)).unwrap();
        assert_eq!(p.set_selection(Some(wrong)).unwrap_err().kind(), ErrorKind::OutOfRange);
        p.select(&SelectionShape::Rectangle(Rect::new(1, 1, 2, 2)), SelectionMode::Replace, false)
            .unwrap();
        assert_eq!(p.selection().unwrap().bounds(), Some(Rect::new(1, 1, 2, 2)));
        p.clear_selection();
        assert!(p.selection().is_none());
    }

    #[test]
    fn unloaded_project_rejects_edits() {
        let mut p = Project::unloaded(&EngineSettings::default());
        assert_eq!(p.add_layer("x", [0; 4]).unwrap_err().kind(), ErrorKind::InvalidState);
        assert_eq!(p.apply_filter(&FilterSpec::Invert).unwrap_err().kind(), ErrorKind::InvalidState);
        assert_eq!(p.undo().unwrap_err().kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn save_and_open_keep_layers() {
        let dir = std::env::temp_dir().join(format!("paintcore-project-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("doc.pcp");
        let mut p = project(3, 3);
        let id = p.add_layer("Ink", [9, 8, 7, 255]).unwrap();
        p.set_opacity(id, 0.75).unwrap();
        p.save(&path).unwrap();
        assert!(!p.is_dirty());
        assert_eq!(p.name, "doc.pcp");

        let back = Project::open(&path, &EngineSettings::default()).unwrap();
        assert_eq!(back.stack().len(), 2);
        assert_eq!(back.stack().layers()[1].name(), "Ink");
        assert_eq!(back.stack().layers()[1].opacity(), 0.75);
        assert!(!back.history().can_undo());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn shared_project_publishes_under_lock() {
        let shared = SharedProject::new(project(4, 4));
        let target = shared.filter_target().unwrap();
        let command = FilterPipeline::default()
            .commit_pixels(target.layer, &target.pixels, target.revision, &FilterSpec::Invert, None, &CancelToken::new())
            .unwrap();
        assert!(shared.publish(command).unwrap());
        assert!(shared.lock().unwrap().history().can_undo());
    }

    #[test]
    fn failed_commit_leaves_project_untouched() {
        let mut p = painted(6, 5);
        let id = p.active_layer().unwrap();
        let bytes = layer_bytes(&p);
        let version = p.stack().version();
        let undo_count = p.history().undo_count();
        let revision = p.stack().get(id).unwrap().revision();
        p.mark_clean();

        p.pipeline_mut().set_backend(Some(Arc::new(CancellingBackend)));
        let err = p.apply_filter(&FilterSpec::Blur { radius: 2.0 }).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);

        assert_eq!(layer_bytes(&p), bytes);
        assert_eq!(p.stack().version(), version);
        assert_eq!(p.history().undo_count(), undo_count);
        assert_eq!(p.stack().get(id).unwrap().revision(), revision);
        assert!(!p.is_dirty());

        // Same project still commits once the backend is gone.
        p.pipeline_mut().set_backend(None);
        assert!(p.apply_filter(&FilterSpec::Invert).unwrap());
        assert_eq!(p.history().undo_count(), undo_count + 1);
    }

    #[test]
    fn failed_undo_to_keeps_project_clean() {
        let mut p = project(4, 4);
        let rx = p.subscribe();
        let version = p.stack().version();
        assert_eq!(p.undo_to(3).unwrap_err().kind(), ErrorKind::OutOfRange);
        assert!(!p.is_dirty());
        assert_eq!(p.stack().version(), version);
        assert!(rx.try_recv().is_err());

        p.add_layer("Top", [1, 1, 1, 255]).unwrap();
        p.mark_clean();
        assert!(p.undo_to(2).is_err());
        assert!(!p.is_dirty());
        assert_eq!(p.stack().len(), 2);
        p.undo_to(1).unwrap();
        assert!(p.is_dirty());
        assert_eq!(p.stack().len(), 1);
    }

    #[test]
    fn canvas_transforms_undo_and_redo_exactly() {
        let transforms = [
            CanvasTransform::FlipHorizontal,
            CanvasTransform::FlipVertical,
            CanvasTransform::Rotate90,
            CanvasTransform::Rotate180,
            CanvasTransform::Rotate270,
            CanvasTransform::Rotate { degrees: 30.0 },
            CanvasTransform::Crop(Rect::new(1, 1, 3, 2)),
            CanvasTransform::ResizeCanvas {
                width: 9,
                height: 4,
                anchor: Anchor::BottomRight,
            },
            CanvasTransform::Scale {
                width: 12,
                height: 10,
                interpolation: Interpolation::Bicubic,
            },
        ];
        for t in &transforms {
            let mut p = painted(6, 5);
            let before = layer_bytes(&p);
            p.transform_canvas(t).unwrap();
            let after = layer_bytes(&p);
            let size = p.stack().canvas_size().unwrap();
            assert_eq!(size, t.output_size(6, 5).unwrap(), "{}", t);
            for layer in p.stack().layers() {
                assert_eq!(layer.pixels().dimensions(), size, "{}", t);
                if let Some(mask) = layer.mask() {
                    assert_eq!(mask.dimensions(), size, "{}", t);
                }
            }

            assert_eq!(p.undo().unwrap(), t.label());
            assert_eq!(p.stack().canvas_size().unwrap(), (6, 5), "{}", t);
            assert_eq!(layer_bytes(&p), before, "{}", t);

            p.redo().unwrap();
            assert_eq!(p.stack().canvas_size().unwrap(), size, "{}", t);
            assert_eq!(layer_bytes(&p), after, "{}", t);
        }
    }

    #[test]
    fn quarter_turns_compose_back_to_the_original() {
        let mut p = painted(6, 5);
        let before = layer_bytes(&p);
        for _ in 0..4 {
            p.transform_canvas(&CanvasTransform::Rotate90).unwrap();
        }
        assert_eq!(layer_bytes(&p), before);
        p.transform_canvas(&CanvasTransform::FlipVertical).unwrap();
        p.transform_canvas(&CanvasTransform::Rotate180).unwrap();
        p.transform_canvas(&CanvasTransform::FlipHorizontal).unwrap();
        assert_eq!(layer_bytes(&p), before);
        assert_eq!(p.history().undo_count(), 2 + 7);
    }

    #[test]
    fn crop_to_selection_drops_stale_selection() {
        let mut p = painted(6, 5);
        assert_eq!(p.crop_to_selection().unwrap_err().kind(), ErrorKind::InvalidState);
        p.select(&SelectionShape::Rectangle(Rect::new(2, 1, 3, 3)), SelectionMode::Replace, false)
            .unwrap();
        let id = p.active_layer().unwrap();
        let expected = p.stack().get(id).unwrap().pixels().get_pixel(2, 1);
        p.crop_to_selection().unwrap();
        assert_eq!(p.stack().canvas_size().unwrap(), (3, 3));
        assert_eq!(p.stack().get(id).unwrap().pixels().get_pixel(0, 0), expected);
        assert!(p.selection().is_none());
        assert_eq!(p.active_layer(), Some(id));

        p.undo().unwrap();
        assert_eq!(p.stack().canvas_size().unwrap(), (6, 5));
        assert!(p.set_selection(Some(SelectionMask::rectangle(6, 5, Rect::new(0, 0, 1, 1)).unwrap())).is_ok());
    }

    #[test]
    fn stale_commit_rejected_after_canvas_transform() {
        let mut p = painted(6, 5);
        let id = p.active_layer().unwrap();
        let target = p.filter_target().unwrap();
        let command = p
            .pipeline()
            .commit_pixels(id, &target.pixels, target.revision, &FilterSpec::Invert, None, &CancelToken::new())
            .unwrap();
        p.transform_canvas(&CanvasTransform::FlipHorizontal).unwrap();
        assert_eq!(p.publish(command).unwrap_err().kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn invalid_canvas_transform_records_nothing() {
        let mut p = painted(6, 5);
        let count = p.history().undo_count();
        let err = p
            .transform_canvas(&CanvasTransform::ResizeCanvas {
                width: 0,
                height: 4,
                anchor: Anchor::Center,
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfRange);
        let err = p
            .transform_canvas(&CanvasTransform::Crop(Rect::new(10, 10, 2, 2)))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfRange);
        assert_eq!(p.history().undo_count(), count);
        assert_eq!(p.stack().canvas_size().unwrap(), (6, 5));
    }
}
