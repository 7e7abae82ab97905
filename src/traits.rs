//! Collaborator contracts.
//!
//! The indexing pipeline, the generation drivers, and the task processor
//! talk to the outside world only through the traits in this module. Each
//! is injected as an `Arc<dyn Trait>` at construction, so the same core
//! runs against SQLite in the CLI and against in-memory fakes in tests.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │               TaskProcessor                  │
//! │   JobStore · SourceStore · RepositoryFetcher │
//! └──────────────┬───────────────────────────────┘
//!                ▼
//! ┌──────────────────────────────────────────────┐
//! │  IndexingPipeline        Snippet/Wiki drivers│
//! │  MetadataStore           SnippetGenerator    │
//! │  VectorStore             WikiGenerator       │
//! │  Summarizer · Embedder                       │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! All methods return `anyhow::Result`; a collaborator that stops because it
//! observed cancellation should return [`crate::error::Cancelled`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::language::Language;
use crate::models::{
    FileMetadata, Job, JobLogLine, JobProgress, JobStatus, NewJob, NewSource, Source,
    StatusField, SubjectStatus, VectorRecord,
};

// ═══════════════════════════════════════════════════════════════════════
// Enrichment
// ═══════════════════════════════════════════════════════════════════════

/// What the summarizer knows about the chunk it is describing.
#[derive(Debug, Clone)]
pub struct SummaryContext {
    pub language: Language,
    pub symbol_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Summary {
    pub summary: String,
    pub keywords: Vec<String>,
}

/// Produces a natural-language summary and keywords for a chunk.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, content: &str, context: &SummaryContext) -> Result<Summary>;
}

/// Turns text into vectors.
///
/// `embed_batch` must return exactly one vector per input, in input order.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier, for logs.
    fn model_name(&self) -> &str;

    /// Vector dimensionality.
    fn dims(&self) -> usize;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| anyhow::anyhow!("Embedder returned no vector"))
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Stores
// ═══════════════════════════════════════════════════════════════════════

/// Chunk vectors with their structural payload.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or overwrite records by id.
    async fn upsert(&self, records: &[VectorRecord]) -> Result<()>;

    async fn delete_by_source_id(&self, source_id: &str) -> Result<u64>;

    async fn delete_by_file_paths(&self, source_id: &str, paths: &[String]) -> Result<u64>;

    async fn count(&self, source_id: &str) -> Result<u64>;
}

/// Per-file fingerprints and bookkeeping from the last successful index.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// `{relative path → fingerprint}` for every stored file of a source.
    async fn fingerprints(&self, source_id: &str) -> Result<HashMap<String, String>>;

    async fn upsert_file(&self, metadata: &FileMetadata) -> Result<()>;

    async fn find_file(&self, source_id: &str, path: &str) -> Result<Option<FileMetadata>>;

    async fn delete_files(&self, source_id: &str, paths: &[String]) -> Result<u64>;

    async fn delete_source(&self, source_id: &str) -> Result<u64>;
}

/// Durable job queue with a status state machine.
///
/// ```text
/// PENDING ──try_claim──▶ RUNNING ──▶ COMPLETED | FAILED | CANCELLED
///    └──────request_cancel──────────────────────▶ CANCELLED
/// ```
///
/// `complete_job` and `fail_job` only move RUNNING jobs, so an external
/// cancel that lands first is never overwritten.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, job: NewJob) -> Result<Job>;

    async fn get_job(&self, id: &str) -> Result<Option<Job>>;

    /// Most recent first, optionally filtered by status.
    async fn list_jobs(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>>;

    /// Oldest PENDING jobs first, skipping ids in `exclude`.
    async fn list_pending(&self, limit: usize, exclude: &[String]) -> Result<Vec<Job>>;

    /// Atomically move PENDING → RUNNING. `false` means another worker won.
    async fn try_claim(&self, id: &str) -> Result<bool>;

    async fn update_progress(&self, id: &str, progress: &JobProgress) -> Result<()>;

    async fn complete_job(&self, id: &str, result_json: &str) -> Result<()>;

    async fn fail_job(&self, id: &str, error: &str) -> Result<()>;

    /// Mark a job CANCELLED from the worker side and stamp `finished_at`.
    async fn cancel_job(&self, id: &str) -> Result<()>;

    /// External cancel request. Returns `false` when the job is already terminal.
    async fn request_cancel(&self, id: &str) -> Result<bool>;

    async fn append_log(&self, id: &str, level: &str, message: &str) -> Result<()>;

    async fn job_logs(&self, id: &str) -> Result<Vec<JobLogLine>>;

    /// Cancel every RUNNING job; used for crash recovery at startup.
    async fn cancel_all_running(&self) -> Result<u64>;

    async fn is_cancelled(&self, id: &str) -> Result<bool>;
}

/// Registered repositories and their per-subject statuses.
#[async_trait]
pub trait SourceStore: Send + Sync {
    async fn create_source(&self, source: NewSource) -> Result<Source>;

    async fn get_source(&self, id: &str) -> Result<Option<Source>>;

    async fn find_source_by_name(&self, name: &str) -> Result<Option<Source>>;

    async fn list_sources(&self) -> Result<Vec<Source>>;

    async fn set_status(&self, id: &str, field: StatusField, status: SubjectStatus) -> Result<()>;

    /// Returns `false` when no source had that id.
    async fn remove_source(&self, id: &str) -> Result<bool>;

    /// Move every `running` status back to `pending`.
    async fn reset_running_statuses(&self) -> Result<u64>;
}

// ═══════════════════════════════════════════════════════════════════════
// Checkout & generation
// ═══════════════════════════════════════════════════════════════════════

/// Materializes a source as a local directory.
#[async_trait]
pub trait RepositoryFetcher: Send + Sync {
    async fn checkout(&self, source: &Source) -> Result<PathBuf>;
}

/// Generates code snippets for a source.
#[async_trait]
pub trait SnippetGenerator: Send + Sync {
    /// Returns the number of snippets generated.
    async fn generate(&self, source: &Source, root: &Path, cancel: &CancellationToken)
        -> Result<u64>;
}

/// A page the wiki generator plans to write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WikiPage {
    pub slug: String,
    pub title: String,
}

/// Plans and writes wiki pages for a source.
#[async_trait]
pub trait WikiGenerator: Send + Sync {
    async fn plan_pages(&self, source: &Source, root: &Path) -> Result<Vec<WikiPage>>;

    async fn generate_page(
        &self,
        source: &Source,
        root: &Path,
        page: &WikiPage,
        cancel: &CancellationToken,
    ) -> Result<()>;
}
