//! Layer-based raster compositing with command-driven undo/redo and a
//! filter pipeline that previews without touching the document.
//!
//! A [`Project`] ties the pieces together: a [`LayerStack`], the
//! [`HistoryManager`] every edit goes through, a caching [`CompositeEngine`]
//! and a [`FilterPipeline`].  Observers subscribe to [`ChangeEvent`]s and
//! never get mutable access back into the model.

#![allow(clippy::too_many_arguments)]

pub mod logger;

pub mod cli;
pub mod composite;
pub mod error;
pub mod events;
pub mod filters;
pub mod history;
pub mod io;
pub mod layer;
pub mod pipeline;
pub mod pixels;
pub mod project;
pub mod selection;
pub mod settings;
pub mod stack;
pub mod transform;
pub mod worker;

pub use composite::CompositeEngine;
pub use error::{EngineError, ErrorKind, Result};
pub use events::{ChangeEvent, EventBus};
pub use filters::{CancelToken, FilterRegistry, FilterSpec};
pub use history::{Command, HistoryManager, LayerOpCommand, LayerOperation, PixelCommand};
pub use layer::{BlendMode, Layer, LayerId};
pub use pipeline::{ComputeBackend, FilterPipeline};
pub use pixels::{CoverageBuffer, PixelBuffer, Rect};
pub use project::{Project, SharedProject};
pub use selection::{SelectionMask, SelectionMode, SelectionShape};
pub use settings::EngineSettings;
pub use stack::{CanvasSnapshot, LayerStack};
pub use transform::{Anchor, CanvasTransform, Interpolation};
pub use worker::{FilterJobs, JobOutcome};
