// ============================================================================
// FILTER PIPELINE — preview (downsampled, pure) and commit (full-res command)
// ============================================================================

use std::sync::Arc;

use crate::error::{EngineError, Result};
use crate::filters::{self, CancelToken, ComputeCtx, DEFAULT_TILE_ROWS, FilterRegistry, FilterSpec};
use crate::history::PixelCommand;
use crate::layer::{Layer, LayerId};
use crate::logger::{self, SharedTelemetry};
use crate::pixels::{CoverageBuffer, PixelBuffer};
use crate::selection::SelectionMask;
use crate::{log_info, log_warn};

pub const DEFAULT_PREVIEW_MAX_EDGE: u32 = 1024;

/// An accelerated implementation of the filter contract.  Results must match
/// the CPU path; any error makes the pipeline fall back to the CPU.
pub trait ComputeBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this backend handles `spec` (with or without a selection).
    fn supports(&self, spec: &FilterSpec, has_region: bool) -> bool;

    fn run(
        &self,
        src: &PixelBuffer,
        spec: &FilterSpec,
        region: Option<&CoverageBuffer>,
        ctx: &ComputeCtx,
    ) -> Result<PixelBuffer>;
}

#[derive(Clone)]
pub struct FilterPipeline {
    registry: FilterRegistry,
    backend: Option<Arc<dyn ComputeBackend>>,
    preview_max_edge: u32,
    tile_rows: usize,
    telemetry: SharedTelemetry,
}

impl Default for FilterPipeline {
    fn default() -> Self {
        Self::new(DEFAULT_PREVIEW_MAX_EDGE, DEFAULT_TILE_ROWS)
    }
}

impl FilterPipeline {
    pub fn new(preview_max_edge: u32, tile_rows: usize) -> Self {
        Self {
            registry: FilterRegistry::with_builtins(),
            backend: None,
            preview_max_edge: preview_max_edge.max(1),
            tile_rows: tile_rows.max(1),
            telemetry: logger::null(),
        }
    }

    pub fn registry(&self) -> &FilterRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut FilterRegistry {
        &mut self.registry
    }

    pub fn set_backend(&mut self, backend: Option<Arc<dyn ComputeBackend>>) {
        self.backend = backend;
    }

    pub fn backend_name(&self) -> Option<&str> {
        self.backend.as_deref().map(|b| b.name())
    }

    pub fn set_telemetry(&mut self, telemetry: SharedTelemetry) {
        self.telemetry = telemetry;
    }

    pub fn preview_max_edge(&self) -> u32 {
        self.preview_max_edge
    }

    pub fn set_preview_max_edge(&mut self, max_edge: u32) {
        self.preview_max_edge = max_edge.max(1);
    }

    pub fn tile_rows(&self) -> usize {
        self.tile_rows
    }

    pub fn set_tile_rows(&mut self, rows: usize) {
        self.tile_rows = rows.max(1);
    }

    /// Full filter run: backend first when it claims the job, CPU otherwise
    /// or when the backend fails.
    pub fn render(
        &self,
        src: &PixelBuffer,
        spec: &FilterSpec,
        region: Option<&CoverageBuffer>,
        cancel: &CancelToken,
    ) -> Result<PixelBuffer> {
        spec.validate()?;
        let ctx = ComputeCtx::new(self.tile_rows, cancel.clone());
        if let Some(backend) = &self.backend {
            if backend.supports(spec, region.is_some()) {
                match backend.run(src, spec, region, &ctx) {
                    Ok(out) if out.dimensions() == src.dimensions() => return Ok(out),
                    Ok(out) => log_warn!(
                        self.telemetry,
                        "backend '{}' returned {}×{} for {}×{}, using CPU",
                        backend.name(),
                        out.width(),
                        out.height(),
                        src.width(),
                        src.height()
                    ),
                    Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
                    Err(e) => log_warn!(
                        self.telemetry,
                        "backend '{}' failed on {}: {}; using CPU",
                        backend.name(),
                        spec,
                        e
                    ),
                }
            }
        }
        filters::apply_filter(src, spec, region, &self.registry, &ctx)
    }

    /// Low-resolution preview of `spec` on `layer`.  Never mutates anything.
    pub fn preview(&self, layer: &Layer, spec: &FilterSpec, region: Option<&SelectionMask>) -> Result<PixelBuffer> {
        self.preview_pixels(layer.pixels(), spec, region.map(|m| m.coverage()), &CancelToken::new())
    }

    /// Preview over raw pixels; `region` is at full resolution.
    pub fn preview_pixels(
        &self,
        pixels: &PixelBuffer,
        spec: &FilterSpec,
        region: Option<&CoverageBuffer>,
        cancel: &CancelToken,
    ) -> Result<PixelBuffer> {
        check_region(pixels, region)?;
        let small = pixels.downsample(self.preview_max_edge);
        let (sw, sh) = small.dimensions();
        let factor = sw as f32 / pixels.width().max(1) as f32;
        let small_region = region.map(|c| c.resample(sw, sh));
        self.render(&small, &spec.scaled(factor), small_region.as_ref(), cancel)
    }

    /// Full-resolution run turned into a command holding the changed box.
    /// Nothing is mutated; the caller executes the command.
    pub fn commit(&self, layer: &Layer, spec: &FilterSpec, region: Option<&SelectionMask>) -> Result<PixelCommand> {
        self.commit_pixels(
            layer.id(),
            layer.pixels(),
            layer.revision(),
            spec,
            region.map(|m| m.coverage()),
            &CancelToken::new(),
        )
    }

    pub fn commit_pixels(
        &self,
        layer_id: LayerId,
        pixels: &PixelBuffer,
        source_revision: u64,
        spec: &FilterSpec,
        region: Option<&CoverageBuffer>,
        cancel: &CancelToken,
    ) -> Result<PixelCommand> {
        check_region(pixels, region)?;
        let after = self.render(pixels, spec, region, cancel)?;
        let command = PixelCommand::from_buffers(format!("Filter: {}", spec), layer_id, pixels, &after, source_revision)?;
        log_info!(
            self.telemetry,
            "{} on layer {} changed {:?}",
            spec,
            layer_id,
            command.rect()
        );
        Ok(command)
    }
}

fn check_region(pixels: &PixelBuffer, region: Option<&CoverageBuffer>) -> Result<()> {
    match region {
        Some(c) if c.dimensions() != pixels.dimensions() => Err(EngineError::out_of_range(format!(
            "selection is {}×{}, layer is {}×{}",
            c.width(),
            c.height(),
            pixels.width(),
            pixels.height()
        ))),
        _ => Ok(()),
    }
}
