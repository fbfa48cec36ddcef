// ============================================================================
// CHANGE EVENTS — one-way notifications from the core to whoever is watching
// ============================================================================

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

use crate::layer::LayerId;

/// What changed.  Subscribers re-read the model; events carry no mutation
/// rights back into it.
#[derive(Clone, Debug, PartialEq)]
pub enum ChangeEvent {
    LayerAdded { id: LayerId, index: usize },
    LayerRemoved { id: LayerId },
    LayerMoved { id: LayerId, from: usize, to: usize },
    /// Pixels or metadata of one layer changed.
    LayerChanged { id: LayerId },
    /// The stack was replaced wholesale (project load).
    StackReplaced,
    /// Every layer went through a geometry change; the canvas is now
    /// `width`×`height`.
    CanvasChanged { width: u32, height: u32 },
    HistoryChanged { undo: usize, redo: usize },
    SelectionChanged,
    /// A preview computation failed; the last good composite stays on screen.
    PreviewFailed { message: String },
}

/// Fan-out of [`ChangeEvent`]s over `mpsc` channels.  Cloning shares the
/// subscriber list.  Disconnected receivers are pruned on the next emit.
#[derive(Clone, Debug, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Sender<ChangeEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<ChangeEvent> {
        let (tx, rx) = mpsc::channel();
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }
        rx
    }

    pub fn emit(&self, event: ChangeEvent) {
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }
}
