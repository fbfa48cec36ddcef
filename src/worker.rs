// ============================================================================
// FILTER JOBS — background preview/commit computations on a rayon pool
// ============================================================================
//
// Jobs read `Arc` snapshots and report back over an mpsc channel; the
// coordinating thread polls.  Each preview carries a token from a monotonic
// counter.  Starting a preview cancels the one before it, and results whose
// token is not the current one are dropped on receipt.

use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::error::{EngineError, Result};
use crate::filters::{CancelToken, FilterSpec};
use crate::history::PixelCommand;
use crate::layer::LayerId;
use crate::logger::{self, SharedTelemetry};
use crate::pipeline::FilterPipeline;
use crate::pixels::{CoverageBuffer, PixelBuffer};
use crate::settings::EngineSettings;
use crate::{log_err, log_info};

/// What a finished job hands back.
#[derive(Debug)]
pub enum JobOutcome {
    Preview {
        token: u64,
        layer: LayerId,
        pixels: PixelBuffer,
    },
    Commit {
        command: PixelCommand,
    },
    /// `token` is 0 for commit jobs.
    Failed {
        token: u64,
        description: String,
        error: EngineError,
    },
}

impl JobOutcome {
    fn token(&self) -> u64 {
        match self {
            JobOutcome::Preview { token, .. } | JobOutcome::Failed { token, .. } => *token,
            JobOutcome::Commit { .. } => 0,
        }
    }
}

pub struct FilterJobs {
    pool: Arc<ThreadPool>,
    sender: Sender<JobOutcome>,
    receiver: Receiver<JobOutcome>,
    preview_token: u64,
    preview_cancel: Option<CancelToken>,
    pending: usize,
    telemetry: SharedTelemetry,
}

impl FilterJobs {
    /// `threads == 0` lets rayon pick (one per core).
    pub fn new(threads: usize) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("paintcore-filter-{}", i))
            .build()
            .map_err(|e| EngineError::ResourceExhausted(format!("filter pool: {}", e)))?;
        let (sender, receiver) = mpsc::channel();
        Ok(Self {
            pool: Arc::new(pool),
            sender,
            receiver,
            preview_token: 0,
            preview_cancel: None,
            pending: 0,
            telemetry: logger::null(),
        })
    }

    /// Pool sized by `worker_threads`.
    pub fn from_settings(settings: &EngineSettings) -> Result<Self> {
        Self::new(settings.worker_threads)
    }

    pub fn set_telemetry(&mut self, telemetry: SharedTelemetry) {
        self.telemetry = telemetry;
    }

    pub fn thread_count(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Token of the most recent preview; 0 before the first one.
    pub fn current_preview(&self) -> u64 {
        self.preview_token
    }

    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Queue a preview.  Cancels the preview in flight, if any.
    pub fn spawn_preview(
        &mut self,
        pipeline: &FilterPipeline,
        layer: LayerId,
        pixels: Arc<PixelBuffer>,
        spec: FilterSpec,
        region: Option<Arc<CoverageBuffer>>,
    ) -> u64 {
        self.cancel_preview();
        self.preview_token = self.preview_token.wrapping_add(1).max(1);
        let token = self.preview_token;
        let cancel = CancelToken::new();
        self.preview_cancel = Some(cancel.clone());

        let pipeline = pipeline.clone();
        let description = format!("Preview: {}", spec);
        self.run(token, description, move || {
            let out = pipeline.preview_pixels(&pixels, &spec, region.as_deref(), &cancel)?;
            Ok(JobOutcome::Preview {
                token,
                layer,
                pixels: out,
            })
        });
        token
    }

    /// Queue a full-resolution commit.  The resulting command still has to be
    /// published; nothing is mutated here.
    pub fn spawn_commit(
        &mut self,
        pipeline: &FilterPipeline,
        layer: LayerId,
        pixels: Arc<PixelBuffer>,
        source_revision: u64,
        spec: FilterSpec,
        region: Option<Arc<CoverageBuffer>>,
    ) {
        let pipeline = pipeline.clone();
        let description = format!("Filter: {}", spec);
        self.run(0, description, move || {
            let command = pipeline.commit_pixels(
                layer,
                &pixels,
                source_revision,
                &spec,
                region.as_deref(),
                &CancelToken::new(),
            )?;
            Ok(JobOutcome::Commit { command })
        });
    }

    pub fn cancel_preview(&mut self) {
        if let Some(cancel) = self.preview_cancel.take() {
            cancel.cancel();
        }
    }

    /// Drain finished jobs without blocking.  Stale previews are dropped.
    pub fn poll(&mut self) -> Vec<JobOutcome> {
        let mut out = Vec::new();
        while let Ok(outcome) = self.receiver.try_recv() {
            if let Some(outcome) = self.accept(outcome) {
                out.push(outcome);
            }
        }
        out
    }

    /// Block until a current outcome arrives or `timeout` elapses.
    pub fn wait(&mut self, timeout: Duration) -> Option<JobOutcome> {
        let deadline = Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.receiver.recv_timeout(left) {
                Ok(outcome) => {
                    if let Some(outcome) = self.accept(outcome) {
                        return Some(outcome);
                    }
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    fn accept(&mut self, outcome: JobOutcome) -> Option<JobOutcome> {
        self.pending = self.pending.saturating_sub(1);
        let token = outcome.token();
        if token != 0 && token != self.preview_token {
            return None;
        }
        Some(outcome)
    }

    fn run<F>(&mut self, token: u64, description: String, job: F)
    where
        F: FnOnce() -> Result<JobOutcome> + Send + 'static,
    {
        let sender = self.sender.clone();
        let telemetry = Arc::clone(&self.telemetry);
        self.pending += 1;
        self.pool.spawn(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(job));
            let outcome = match result {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(EngineError::Cancelled)) => {
                    log_info!(telemetry, "{} cancelled", description);
                    JobOutcome::Failed {
                        token,
                        description,
                        error: EngineError::Cancelled,
                    }
                }
                Ok(Err(error)) => JobOutcome::Failed {
                    token,
                    description,
                    error,
                },
                Err(panic_info) => {
                    let msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                        s.to_string()
                    } else if let Some(s) = panic_info.downcast_ref::<String>() {
                        s.clone()
                    } else {
                        "unknown panic payload".to_string()
                    };
                    log_err!(telemetry, "'{}' panicked: {}", description, msg);
                    JobOutcome::Failed {
                        token,
                        description,
                        error: EngineError::invalid_state(format!("filter panicked: {}", msg)),
                    }
                }
            };
            let _ = sender.send(outcome);
        });
    }
}
