use std::collections::VecDeque;
use std::sync::Arc;
use std::time::SystemTime;

use crate::error::{EngineError, Result};
use crate::events::{ChangeEvent, EventBus};
use crate::layer::{BlendMode, Layer, LayerId};
use crate::logger::{self, SharedTelemetry};
use crate::pixels::{CoverageBuffer, PixelBuffer, Rect};
use crate::stack::{CanvasPlan, LayerStack, MergePlan};
use crate::{log_err, log_info, log_warn};

// ============================================================================
// COMMAND TRAIT
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandKind {
    /// Pixel edit on one layer.
    Pixels,
    /// Layer metadata (opacity, visibility, name, blend mode, mask).
    Metadata,
    /// Stack structure (add, remove, move, duplicate, merge).
    Structure,
    /// Canvas geometry (flip, rotate, crop, resize) across all layers.
    Canvas,
}

/// A reversible mutation of a [`LayerStack`].  `apply` after `revert`
/// restores exactly the post-apply state and vice versa.
pub trait Command: Send + Sync {
    fn apply(&self, stack: &mut LayerStack) -> Result<()>;
    fn revert(&self, stack: &mut LayerStack) -> Result<()>;
    fn description(&self) -> String;
    fn memory_size(&self) -> usize;
    fn kind(&self) -> CommandKind;
    /// Layer the command targets, `None` for stack-level commands.
    fn target(&self) -> Option<LayerId>;
}

// ============================================================================
// PIXEL COMMAND — patch-based undo for pixel edits
// ============================================================================

/// A rectangular patch of tightly packed RGBA bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PixelPatch {
    pub rect: Rect,
    pub data: Vec<u8>,
}

impl PixelPatch {
    pub fn capture(buffer: &PixelBuffer, rect: Rect) -> Result<Self> {
        Ok(Self {
            rect,
            data: buffer.extract_region(rect)?,
        })
    }

    pub fn memory_size(&self) -> usize {
        self.data.len()
    }
}

/// Before/after patches over the bounding box of changed pixels.
#[derive(Clone, Debug)]
pub struct PixelCommand {
    description: String,
    layer: LayerId,
    before: PixelPatch,
    after: PixelPatch,
    /// Layer revision the edit was computed from.
    source_revision: u64,
}

impl PixelCommand {
    /// Diff two full-size buffers and keep only the changed box.  Identical
    /// buffers give an empty (no-op) patch.
    pub fn from_buffers(
        description: impl Into<String>,
        layer: LayerId,
        before: &PixelBuffer,
        after: &PixelBuffer,
        source_revision: u64,
    ) -> Result<Self> {
        let rect = before.diff_bounds(after)?.unwrap_or_default();
        Ok(Self {
            description: description.into(),
            layer,
            before: PixelPatch::capture(before, rect)?,
            after: PixelPatch::capture(after, rect)?,
            source_revision,
        })
    }

    pub fn layer(&self) -> LayerId {
        self.layer
    }

    /// Changed box (empty for a no-op).
    pub fn rect(&self) -> Rect {
        self.after.rect
    }

    pub fn source_revision(&self) -> u64 {
        self.source_revision
    }

    pub fn is_noop(&self) -> bool {
        self.after.rect.is_empty()
    }

    pub fn before(&self) -> &PixelPatch {
        &self.before
    }

    pub fn after(&self) -> &PixelPatch {
        &self.after
    }
}

impl Command for PixelCommand {
    fn apply(&self, stack: &mut LayerStack) -> Result<()> {
        stack.write_patch(self.layer, self.after.rect, &self.after.data)
    }

    fn revert(&self, stack: &mut LayerStack) -> Result<()> {
        stack.write_patch(self.layer, self.before.rect, &self.before.data)
    }

    fn description(&self) -> String {
        self.description.clone()
    }

    fn memory_size(&self) -> usize {
        self.before.memory_size() + self.after.memory_size()
    }

    fn kind(&self) -> CommandKind {
        CommandKind::Pixels
    }

    fn target(&self) -> Option<LayerId> {
        Some(self.layer)
    }
}

// ============================================================================
// LAYER OPERATION COMMAND
// ============================================================================

/// Layer operations that can be undone/redone.  Structural variants keep
/// whole layers; their pixels are shared with the stack through `Arc`.
#[derive(Clone, Debug)]
pub enum LayerOperation {
    Add { index: usize, layer: Layer },
    Remove { index: usize, layer: Layer },
    Move { id: LayerId, from: usize, to: usize },
    Opacity { id: LayerId, old: f32, new: f32 },
    Visibility { id: LayerId, old: bool, new: bool },
    Rename { id: LayerId, old: String, new: String },
    BlendMode { id: LayerId, old: BlendMode, new: BlendMode },
    Mask {
        id: LayerId,
        old: Option<Arc<CoverageBuffer>>,
        new: Option<Arc<CoverageBuffer>>,
    },
    Duplicate { source: LayerId, index: usize, layer: Layer },
    Merge(MergePlan),
    Canvas(CanvasPlan),
}

#[derive(Clone, Debug)]
pub struct LayerOpCommand {
    operation: LayerOperation,
}

impl LayerOpCommand {
    pub fn new(operation: LayerOperation) -> Self {
        Self { operation }
    }

    pub fn operation(&self) -> &LayerOperation {
        &self.operation
    }
}

impl Command for LayerOpCommand {
    fn apply(&self, stack: &mut LayerStack) -> Result<()> {
        match &self.operation {
            LayerOperation::Add { index, layer } | LayerOperation::Duplicate { index, layer, .. } => {
                stack.add_layer(*index, layer.clone())
            }
            LayerOperation::Remove { layer, .. } => stack.remove_layer(layer.id()).map(|_| ()),
            LayerOperation::Move { id, to, .. } => stack.move_layer(*id, *to).map(|_| ()),
            LayerOperation::Opacity { id, new, .. } => stack.set_opacity(*id, *new).map(|_| ()),
            LayerOperation::Visibility { id, new, .. } => stack.set_visibility(*id, *new).map(|_| ()),
            LayerOperation::Rename { id, new, .. } => stack.rename_layer(*id, new.clone()).map(|_| ()),
            LayerOperation::BlendMode { id, new, .. } => stack.set_blend_mode(*id, *new).map(|_| ()),
            LayerOperation::Mask { id, new, .. } => stack.replace_mask(*id, new.clone()).map(|_| ()),
            LayerOperation::Merge(plan) => stack.apply_merge(plan),
            LayerOperation::Canvas(plan) => stack.restore_canvas(&plan.after),
        }
    }

    fn revert(&self, stack: &mut LayerStack) -> Result<()> {
        match &self.operation {
            LayerOperation::Add { layer, .. } | LayerOperation::Duplicate { layer, .. } => {
                stack.remove_layer(layer.id()).map(|_| ())
            }
            LayerOperation::Remove { index, layer } => stack.add_layer(*index, layer.clone()),
            LayerOperation::Move { id, from, .. } => stack.move_layer(*id, *from).map(|_| ()),
            LayerOperation::Opacity { id, old, .. } => stack.set_opacity(*id, *old).map(|_| ()),
            LayerOperation::Visibility { id, old, .. } => stack.set_visibility(*id, *old).map(|_| ()),
            LayerOperation::Rename { id, old, .. } => stack.rename_layer(*id, old.clone()).map(|_| ()),
            LayerOperation::BlendMode { id, old, .. } => stack.set_blend_mode(*id, *old).map(|_| ()),
            LayerOperation::Mask { id, old, .. } => stack.replace_mask(*id, old.clone()).map(|_| ()),
            LayerOperation::Merge(plan) => stack.revert_merge(plan),
            LayerOperation::Canvas(plan) => stack.restore_canvas(&plan.before),
        }
    }

    fn description(&self) -> String {
        match &self.operation {
            LayerOperation::Add { layer, .. } => format!("Add Layer: {}", layer.name()),
            LayerOperation::Remove { layer, .. } => format!("Delete Layer: {}", layer.name()),
            LayerOperation::Move { id, from, to } => format!("Move Layer {}: {} → {}", id, from, to),
            LayerOperation::Opacity { id, new, .. } => {
                format!("Layer {} Opacity: {:.0}%", id, new * 100.0)
            }
            LayerOperation::Visibility { id, new, .. } => {
                if *new {
                    format!("Show Layer {}", id)
                } else {
                    format!("Hide Layer {}", id)
                }
            }
            LayerOperation::Rename { old, new, .. } => format!("Rename: {} → {}", old, new),
            LayerOperation::BlendMode { id, new, .. } => {
                format!("Layer {} Blend: {}", id, new.name())
            }
            LayerOperation::Mask { id, new, .. } => match new {
                Some(_) => format!("Set Mask on Layer {}", id),
                None => format!("Clear Mask on Layer {}", id),
            },
            LayerOperation::Duplicate { layer, .. } => format!("Duplicate: {}", layer.name()),
            LayerOperation::Merge(plan) => format!("Merge {} Visible Layers", plan.removed.len()),
            LayerOperation::Canvas(plan) => plan.transform.label(),
        }
    }

    fn memory_size(&self) -> usize {
        match &self.operation {
            LayerOperation::Add { layer, .. }
            | LayerOperation::Remove { layer, .. }
            | LayerOperation::Duplicate { layer, .. } => layer.memory_bytes(),
            LayerOperation::Rename { old, new, .. } => old.len() + new.len(),
            LayerOperation::Mask { old, new, .. } => {
                old.as_ref().map_or(0, |m| m.memory_bytes()) + new.as_ref().map_or(0, |m| m.memory_bytes())
            }
            LayerOperation::Merge(plan) => {
                plan.merged.memory_bytes() + plan.removed.iter().map(|(_, l)| l.memory_bytes()).sum::<usize>()
            }
            LayerOperation::Canvas(plan) => plan.before.memory_bytes() + plan.after.memory_bytes(),
            _ => std::mem::size_of::<LayerOperation>(),
        }
    }

    fn kind(&self) -> CommandKind {
        match &self.operation {
            LayerOperation::Add { .. }
            | LayerOperation::Remove { .. }
            | LayerOperation::Move { .. }
            | LayerOperation::Duplicate { .. }
            | LayerOperation::Merge(_) => CommandKind::Structure,
            LayerOperation::Canvas(_) => CommandKind::Canvas,
            _ => CommandKind::Metadata,
        }
    }

    fn target(&self) -> Option<LayerId> {
        match &self.operation {
            LayerOperation::Add { layer, .. }
            | LayerOperation::Remove { layer, .. }
            | LayerOperation::Duplicate { layer, .. } => Some(layer.id()),
            LayerOperation::Move { id, .. }
            | LayerOperation::Opacity { id, .. }
            | LayerOperation::Visibility { id, .. }
            | LayerOperation::Rename { id, .. }
            | LayerOperation::BlendMode { id, .. }
            | LayerOperation::Mask { id, .. } => Some(*id),
            LayerOperation::Merge(_) | LayerOperation::Canvas(_) => None,
        }
    }
}

// ============================================================================
// HISTORY MANAGER — undo/redo stacks with count and memory limits
// ============================================================================

pub const DEFAULT_MAX_HISTORY: usize = 20;
pub const DEFAULT_MAX_HISTORY_BYTES: usize = 100 * 1024 * 1024;

/// One executed command plus its bookkeeping.
pub struct HistoryEntry {
    seq: u64,
    timestamp: SystemTime,
    command: Box<dyn Command>,
}

impl HistoryEntry {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    pub fn command(&self) -> &dyn Command {
        self.command.as_ref()
    }
}

pub struct HistoryManager {
    undo_stack: VecDeque<HistoryEntry>,
    redo_stack: VecDeque<HistoryEntry>,
    max_history_size: usize,
    /// Optional memory cap in bytes.
    max_memory_bytes: Option<usize>,
    /// Running memory total across both stacks.
    total_memory: usize,
    next_seq: u64,
    events: EventBus,
    telemetry: SharedTelemetry,
}

impl Default for HistoryManager {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HISTORY)
    }
}

impl HistoryManager {
    /// `max_history_size` of 0 is raised to 1.
    pub fn new(max_history_size: usize) -> Self {
        Self {
            undo_stack: VecDeque::new(),
            redo_stack: VecDeque::new(),
            max_history_size: max_history_size.max(1),
            max_memory_bytes: Some(DEFAULT_MAX_HISTORY_BYTES),
            total_memory: 0,
            next_seq: 1,
            events: EventBus::new(),
            telemetry: logger::null(),
        }
    }

    pub fn set_events(&mut self, events: EventBus) {
        self.events = events;
    }

    pub fn set_telemetry(&mut self, telemetry: SharedTelemetry) {
        self.telemetry = telemetry;
    }

    /// Apply `command`, then record it.  A command that fails to apply is
    /// dropped and the redo stack is left alone.
    pub fn execute(&mut self, command: Box<dyn Command>, stack: &mut LayerStack) -> Result<()> {
        if let Err(e) = command.apply(stack) {
            log_err!(self.telemetry, "'{}' failed: {}", command.description(), e);
            return Err(e);
        }
        log_info!(self.telemetry, "executed '{}'", command.description());

        for entry in self.redo_stack.drain(..) {
            self.total_memory = self.total_memory.saturating_sub(entry.command.memory_size());
        }
        self.total_memory += command.memory_size();
        self.undo_stack.push_back(HistoryEntry {
            seq: self.next_seq,
            timestamp: SystemTime::now(),
            command,
        });
        self.next_seq += 1;
        self.prune();
        self.notify();
        Ok(())
    }

    /// Revert the newest command.  Returns its description.
    pub fn undo(&mut self, stack: &mut LayerStack) -> Result<String> {
        let entry = self
            .undo_stack
            .pop_back()
            .ok_or_else(|| EngineError::invalid_state("nothing to undo"))?;
        let description = entry.command.description();
        if let Err(e) = entry.command.revert(stack) {
            log_err!(self.telemetry, "undo of '{}' failed: {}", description, e);
            self.undo_stack.push_back(entry);
            return Err(e);
        }
        log_info!(self.telemetry, "undo '{}'", description);
        self.redo_stack.push_back(entry);
        self.notify();
        Ok(description)
    }

    /// Re-apply the newest undone command.  Returns its description.
    pub fn redo(&mut self, stack: &mut LayerStack) -> Result<String> {
        let entry = self
            .redo_stack
            .pop_back()
            .ok_or_else(|| EngineError::invalid_state("nothing to redo"))?;
        let description = entry.command.description();
        if let Err(e) = entry.command.apply(stack) {
            log_err!(self.telemetry, "redo of '{}' failed: {}", description, e);
            self.redo_stack.push_back(entry);
            return Err(e);
        }
        log_info!(self.telemetry, "redo '{}'", description);
        self.undo_stack.push_back(entry);
        self.notify();
        Ok(description)
    }

    /// Undo `steps` commands in one go (0 = none).  `OutOfRange` if fewer
    /// than `steps` are available; nothing is undone in that case.
    pub fn undo_to(&mut self, steps: usize, stack: &mut LayerStack) -> Result<()> {
        if steps > self.undo_stack.len() {
            return Err(EngineError::out_of_range(format!(
                "cannot undo {} steps, only {} recorded",
                steps,
                self.undo_stack.len()
            )));
        }
        for _ in 0..steps {
            self.undo(stack)?;
        }
        Ok(())
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn undo_description(&self) -> Option<String> {
        self.undo_stack.back().map(|e| e.command.description())
    }

    pub fn redo_description(&self) -> Option<String> {
        self.redo_stack.back().map(|e| e.command.description())
    }

    /// All undo descriptions, most recent first.
    pub fn undo_history(&self) -> Vec<String> {
        self.undo_stack.iter().rev().map(|e| e.command.description()).collect()
    }

    /// Undo entries, most recent first.
    pub fn undo_entries(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.undo_stack.iter().rev()
    }

    /// Running byte total across both stacks.
    pub fn memory_usage(&self) -> usize {
        self.total_memory
    }

    pub fn capacity(&self) -> usize {
        self.max_history_size
    }

    pub fn set_capacity(&mut self, capacity: usize) -> Result<()> {
        if capacity == 0 {
            return Err(EngineError::out_of_range("history capacity must be at least 1"));
        }
        self.max_history_size = capacity;
        self.prune();
        self.notify();
        Ok(())
    }

    pub fn memory_limit(&self) -> Option<usize> {
        self.max_memory_bytes
    }

    pub fn set_memory_limit(&mut self, max_bytes: Option<usize>) {
        self.max_memory_bytes = max_bytes;
        self.prune();
        self.notify();
    }

    fn prune(&mut self) {
        while self.undo_stack.len() > self.max_history_size {
            if let Some(removed) = self.undo_stack.pop_front() {
                self.total_memory = self.total_memory.saturating_sub(removed.command.memory_size());
            }
        }

        // The most recent entry always survives.
        if let Some(max_bytes) = self.max_memory_bytes {
            while self.total_memory > max_bytes && self.undo_stack.len() > 1 {
                if let Some(removed) = self.undo_stack.pop_front() {
                    self.total_memory = self.total_memory.saturating_sub(removed.command.memory_size());
                    log_warn!(
                        self.telemetry,
                        "history over {} bytes, dropped '{}'",
                        max_bytes,
                        removed.command.description()
                    );
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
        self.total_memory = 0;
        self.notify();
    }

    pub fn undo_count(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn redo_count(&self) -> usize {
        self.redo_stack.len()
    }

    /// Sequence number the next executed command will get.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    fn notify(&self) {
        self.events.emit(ChangeEvent::HistoryChanged {
            undo: self.undo_stack.len(),
            redo: self.redo_stack.len(),
        });
    }
}
