//! Per-run pipeline state.
//!
//! A [`PipelineContext`] is created once per indexing run and threaded
//! through every phase. It owns the counters, the phase-tagged error list,
//! the progress reporter, and the cancellation signal.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{IndexError, Phase, PhaseError};
use crate::progress::{NoProgress, ProgressEvent, ProgressReporter};

/// Caller options for one run.
#[derive(Clone, Debug, Default)]
pub struct IndexOptions {
    /// Skip the summarize phase.
    pub skip_llm: bool,
    /// Re-process every file regardless of stored fingerprints.
    pub force: bool,
    /// Stop after the diff phase and report counts only.
    pub dry_run: bool,
    /// Log per-file detail at `info` instead of `debug`.
    pub verbose: bool,
    /// Reserved; phases run sequentially.
    pub concurrency: Option<usize>,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub abort: Option<CancellationToken>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub files_processed: u64,
    pub files_added: u64,
    pub files_modified: u64,
    pub files_removed: u64,
    pub chunks_created: u64,
    pub summaries_generated: u64,
    pub embeddings_generated: u64,
}

/// Outcome of a run that was not cancelled.
#[derive(Clone, Debug, Serialize)]
pub struct IndexResult {
    #[serde(flatten)]
    pub stats: IndexStats,
    #[serde(rename = "elapsed_ms", serialize_with = "serialize_millis")]
    pub elapsed: Duration,
    pub success: bool,
    pub dry_run: bool,
    pub errors: Vec<PhaseError>,
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

pub struct PipelineContext {
    pub source_id: String,
    pub root: PathBuf,
    pub options: IndexOptions,
    pub stats: IndexStats,
    errors: Vec<PhaseError>,
    run_failed: bool,
    started: Instant,
    progress: Arc<dyn ProgressReporter>,
}

impl PipelineContext {
    pub fn new(source_id: impl Into<String>, root: impl Into<PathBuf>, options: IndexOptions) -> Self {
        Self {
            source_id: source_id.into(),
            root: root.into(),
            options,
            stats: IndexStats::default(),
            errors: Vec::new(),
            run_failed: false,
            started: Instant::now(),
            progress: Arc::new(NoProgress),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Record a file-scoped error; the run continues.
    pub fn record_error(&mut self, phase: Phase, file: Option<&str>, message: impl Into<String>) {
        let error = PhaseError {
            phase,
            file: file.map(str::to_string),
            message: message.into(),
        };
        warn!(source = %self.source_id, "{}", error);
        self.errors.push(error);
    }

    /// Record an error that marks the whole run unsuccessful.
    pub fn record_run_failure(
        &mut self,
        phase: Phase,
        file: Option<&str>,
        message: impl Into<String>,
    ) {
        self.record_error(phase, file, message);
        self.run_failed = true;
    }

    pub fn errors(&self) -> &[PhaseError] {
        &self.errors
    }

    pub fn has_failed(&self) -> bool {
        self.run_failed
    }

    pub fn report(&self, phase: Phase, current: u64, total: u64, file: Option<&str>) {
        let mut event = ProgressEvent::new(phase, current, total);
        event.current_file = file.map(str::to_string);
        self.progress.report(event);
    }

    pub fn is_cancelled(&self) -> bool {
        self.options
            .abort
            .as_ref()
            .map(|token| token.is_cancelled())
            .unwrap_or(false)
    }

    /// Cancellation checkpoint before entering `phase`.
    pub fn checkpoint(&self, phase: Phase) -> Result<(), IndexError> {
        if self.is_cancelled() {
            info!(source = %self.source_id, phase = %phase, "indexing cancelled");
            return Err(IndexError::Cancelled(phase));
        }
        Ok(())
    }

    /// Per-file log line; `verbose` promotes it to `info`.
    pub fn log_file(&self, file: &str, message: &str) {
        if self.options.verbose {
            info!(source = %self.source_id, file, "{}", message);
        } else {
            debug!(source = %self.source_id, file, "{}", message);
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn finish(self) -> IndexResult {
        IndexResult {
            elapsed: self.started.elapsed(),
            success: !self.run_failed,
            dry_run: self.options.dry_run,
            stats: self.stats,
            errors: self.errors,
        }
    }
}
