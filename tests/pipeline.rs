use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use index_harness::context::IndexOptions;
use index_harness::error::{Cancelled, IndexError, Phase};
use index_harness::ingest::{IndexingPipeline, PipelineServices, PipelineSettings};
use index_harness::memory::{InMemoryMetadataStore, InMemoryVectorStore};
use index_harness::progress::{NoProgress, ProgressEvent, ProgressReporter};
use index_harness::traits::{
    Embedder, MetadataStore, Summarizer, Summary, SummaryContext, VectorStore,
};

const SOURCE: &str = "src-1";

/// Records every text it embeds and returns a constant vector for each.
#[derive(Default)]
struct RecordingEmbedder {
    texts: Mutex<Vec<String>>,
}

impl RecordingEmbedder {
    fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.texts.lock().unwrap())
    }
}

#[async_trait]
impl Embedder for RecordingEmbedder {
    fn model_name(&self) -> &str {
        "recording"
    }

    fn dims(&self) -> usize {
        4
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.texts.lock().unwrap().extend(texts.iter().cloned());
        Ok(texts.iter().map(|_| vec![0.5; 4]).collect())
    }
}

struct BrokenEmbedder;

#[async_trait]
impl Embedder for BrokenEmbedder {
    fn model_name(&self) -> &str {
        "broken"
    }

    fn dims(&self) -> usize {
        4
    }

    async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        bail!("embedding service unavailable")
    }
}

#[derive(Default)]
struct CountingSummarizer {
    calls: AtomicUsize,
}

#[async_trait]
impl Summarizer for CountingSummarizer {
    async fn summarize(&self, content: &str, context: &SummaryContext) -> Result<Summary> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if content.contains("summarize_fails") {
            bail!("model refused");
        }
        Ok(Summary {
            summary: format!("{} code", context.language.as_str()),
            keywords: vec!["test".to_string()],
        })
    }
}

/// Embeds normally for `limit` calls, then either cancels `token` or
/// reports cancellation itself.
struct CancellingEmbedder {
    calls: AtomicUsize,
    limit: usize,
    token: Option<CancellationToken>,
}

#[async_trait]
impl Embedder for CancellingEmbedder {
    fn model_name(&self) -> &str {
        "cancelling"
    }

    fn dims(&self) -> usize {
        4
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call > self.limit {
            match &self.token {
                Some(token) => token.cancel(),
                None => return Err(anyhow::Error::new(Cancelled).context("embedding request")),
            }
        }
        Ok(texts.iter().map(|_| vec![0.25; 4]).collect())
    }
}

/// Summarizes `limit` chunks, then reports that it was cancelled.
struct CancellingSummarizer {
    calls: AtomicUsize,
    limit: usize,
}

#[async_trait]
impl Summarizer for CancellingSummarizer {
    async fn summarize(&self, _content: &str, _context: &SummaryContext) -> Result<Summary> {
        if self.calls.fetch_add(1, Ordering::SeqCst) >= self.limit {
            return Err(anyhow::Error::new(Cancelled).context("summary request"));
        }
        Ok(Summary {
            summary: "ok".to_string(),
            keywords: Vec::new(),
        })
    }
}

/// Cancels `token` once it sees `phase` reach `at`.
struct CancelAt {
    token: CancellationToken,
    phase: Phase,
    at: u64,
}

impl ProgressReporter for CancelAt {
    fn report(&self, event: ProgressEvent) {
        if event.phase == self.phase && event.current >= self.at {
            self.token.cancel();
        }
    }
}

struct Harness {
    metadata: Arc<InMemoryMetadataStore>,
    vectors: Arc<InMemoryVectorStore>,
    pipeline: IndexingPipeline,
}

fn harness(embedder: Option<Arc<dyn Embedder>>, summarizer: Option<Arc<dyn Summarizer>>) -> Harness {
    harness_with(embedder, summarizer, PipelineSettings::default())
}

fn harness_with(
    embedder: Option<Arc<dyn Embedder>>,
    summarizer: Option<Arc<dyn Summarizer>>,
    settings: PipelineSettings,
) -> Harness {
    let metadata = Arc::new(InMemoryMetadataStore::new());
    let vectors = Arc::new(InMemoryVectorStore::new());
    let services = PipelineServices {
        metadata: metadata.clone(),
        vectors: vectors.clone(),
        summarizer,
        embedder,
    };
    Harness {
        metadata,
        vectors,
        pipeline: IndexingPipeline::new(services, settings),
    }
}

fn write_repo(root: &Path) {
    fs::write(
        root.join("a.py"),
        "def alpha_marker():\n    return 1\n",
    )
    .unwrap();
    fs::write(
        root.join("b.rs"),
        "pub fn beta_marker() -> u32 {\n    2\n}\n",
    )
    .unwrap();
    fs::write(
        root.join("c.js"),
        "function gamma_marker() {\n  return 3;\n}\n",
    )
    .unwrap();
}

async fn run_cancellable(
    h: &Harness,
    root: &Path,
    token: &CancellationToken,
    progress: Arc<dyn ProgressReporter>,
) -> Result<index_harness::context::IndexResult, IndexError> {
    let options = IndexOptions {
        abort: Some(token.clone()),
        ..Default::default()
    };
    h.pipeline.run(SOURCE, root, options, progress).await
}

async fn assert_nothing_stored(h: &Harness) {
    assert!(h.metadata.is_empty());
    assert_eq!(h.vectors.count(SOURCE).await.unwrap(), 0);
}

async fn run(h: &Harness, root: &Path, options: IndexOptions) -> Result<index_harness::context::IndexResult, IndexError> {
    h.pipeline
        .run(SOURCE, root, options, Arc::new(NoProgress))
        .await
}

#[tokio::test]
async fn test_first_run_indexes_everything() {
    let tmp = TempDir::new().unwrap();
    write_repo(tmp.path());
    let embedder = Arc::new(RecordingEmbedder::default());
    let h = harness(Some(embedder.clone()), None);

    let result = run(&h, tmp.path(), IndexOptions::default()).await.unwrap();
    assert!(result.success);
    assert_eq!(result.stats.files_added, 3);
    assert_eq!(result.stats.files_processed, 3);
    assert!(result.stats.chunks_created >= 3);
    assert_eq!(result.stats.embeddings_generated, result.stats.chunks_created);

    assert_eq!(h.metadata.len(), 3);
    let stored = h.vectors.count(SOURCE).await.unwrap();
    assert_eq!(stored, result.stats.chunks_created);

    let meta = h.metadata.find_file(SOURCE, "b.rs").await.unwrap().unwrap();
    assert_eq!(meta.language, "rust");
    assert!(meta.chunk_count > 0);
    assert!(!meta.has_summary);
}

#[tokio::test]
async fn test_reindex_unchanged_is_noop() {
    let tmp = TempDir::new().unwrap();
    write_repo(tmp.path());
    let embedder = Arc::new(RecordingEmbedder::default());
    let h = harness(Some(embedder.clone()), None);

    run(&h, tmp.path(), IndexOptions::default()).await.unwrap();
    let before = h.vectors.count(SOURCE).await.unwrap();
    embedder.take();

    let result = run(&h, tmp.path(), IndexOptions::default()).await.unwrap();
    assert!(result.success);
    assert_eq!(result.stats.files_added, 0);
    assert_eq!(result.stats.files_modified, 0);
    assert_eq!(result.stats.files_removed, 0);
    assert_eq!(result.stats.files_processed, 0);
    assert!(embedder.take().is_empty());
    assert_eq!(h.vectors.count(SOURCE).await.unwrap(), before);
}

#[tokio::test]
async fn test_add_keep_delete() {
    let tmp = TempDir::new().unwrap();
    fs::write(tmp.path().join("b.rs"), "pub fn beta_marker() -> u32 {\n    2\n}\n").unwrap();
    fs::write(tmp.path().join("c.js"), "function gamma_marker() {\n  return 3;\n}\n").unwrap();

    let embedder = Arc::new(RecordingEmbedder::default());
    let h = harness(Some(embedder.clone()), None);
    run(&h, tmp.path(), IndexOptions::default()).await.unwrap();
    let b_records: Vec<String> = h
        .vectors
        .records_for_file(SOURCE, "b.rs")
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert!(!b_records.is_empty());
    embedder.take();

    fs::write(tmp.path().join("a.py"), "def alpha_marker():\n    return 1\n").unwrap();
    fs::remove_file(tmp.path().join("c.js")).unwrap();

    let result = run(&h, tmp.path(), IndexOptions::default()).await.unwrap();
    assert!(result.success);
    assert_eq!(result.stats.files_added, 1);
    assert_eq!(result.stats.files_modified, 0);
    assert_eq!(result.stats.files_removed, 1);
    assert_eq!(result.stats.files_processed, 1);

    // only a.py went through parse and embed
    let texts = embedder.take();
    assert!(!texts.is_empty());
    assert!(texts.iter().all(|t| !t.contains("beta_marker")));
    assert!(texts.iter().any(|t| t.contains("alpha_marker")));

    let b_after: Vec<String> = h
        .vectors
        .records_for_file(SOURCE, "b.rs")
        .into_iter()
        .map(|r| r.id)
        .collect();
    let mut sorted_before = b_records.clone();
    let mut sorted_after = b_after.clone();
    sorted_before.sort();
    sorted_after.sort();
    assert_eq!(sorted_before, sorted_after);

    assert!(h.vectors.records_for_file(SOURCE, "c.js").is_empty());
    assert!(h.metadata.find_file(SOURCE, "c.js").await.unwrap().is_none());
    assert!(h.metadata.find_file(SOURCE, "a.py").await.unwrap().is_some());
}

#[tokio::test]
async fn test_modified_file_replaces_vectors() {
    let tmp = TempDir::new().unwrap();
    write_repo(tmp.path());
    let h = harness(Some(Arc::new(RecordingEmbedder::default())), None);
    run(&h, tmp.path(), IndexOptions::default()).await.unwrap();

    fs::write(
        tmp.path().join("a.py"),
        "def alpha_marker():\n    return 1\n\n\ndef delta_marker():\n    return 4\n",
    )
    .unwrap();
    let result = run(&h, tmp.path(), IndexOptions::default()).await.unwrap();
    assert_eq!(result.stats.files_modified, 1);

    let records = h.vectors.records_for_file(SOURCE, "a.py");
    let meta = h.metadata.find_file(SOURCE, "a.py").await.unwrap().unwrap();
    assert_eq!(records.len() as u64, meta.chunk_count);
}

#[tokio::test]
async fn test_cancel_before_collect_writes_nothing() {
    let tmp = TempDir::new().unwrap();
    write_repo(tmp.path());
    let h = harness(Some(Arc::new(RecordingEmbedder::default())), None);

    let token = CancellationToken::new();
    token.cancel();
    let options = IndexOptions {
        abort: Some(token),
        ..Default::default()
    };
    let err = run(&h, tmp.path(), options).await.unwrap_err();
    assert!(matches!(err, IndexError::Cancelled(Phase::Collect)));
    assert!(h.metadata.is_empty());
    assert_eq!(h.vectors.count(SOURCE).await.unwrap(), 0);
}

#[tokio::test]
async fn test_dry_run_writes_nothing() {
    let tmp = TempDir::new().unwrap();
    write_repo(tmp.path());
    let embedder = Arc::new(RecordingEmbedder::default());
    let h = harness(Some(embedder.clone()), None);

    let options = IndexOptions {
        dry_run: true,
        ..Default::default()
    };
    let result = run(&h, tmp.path(), options).await.unwrap();
    assert!(result.success);
    assert!(result.dry_run);
    assert_eq!(result.stats.files_added, 3);
    assert_eq!(result.stats.files_processed, 0);
    assert!(embedder.take().is_empty());
    assert!(h.metadata.is_empty());
    assert_eq!(h.vectors.count(SOURCE).await.unwrap(), 0);
}

#[tokio::test]
async fn test_embed_failure_fails_run_and_skips_store() {
    let tmp = TempDir::new().unwrap();
    write_repo(tmp.path());
    let h = harness(Some(Arc::new(BrokenEmbedder)), None);

    let result = run(&h, tmp.path(), IndexOptions::default()).await.unwrap();
    assert!(!result.success);
    assert!(result
        .errors
        .iter()
        .any(|e| e.phase == Phase::Embed && e.message.contains("unavailable")));
    assert!(h.metadata.is_empty());

    // nothing was recorded, so the next run retries every file
    let h2_result = run(&h, tmp.path(), IndexOptions::default()).await.unwrap();
    assert_eq!(h2_result.stats.files_added, 3);
}

#[tokio::test]
async fn test_force_reprocesses_all_files() {
    let tmp = TempDir::new().unwrap();
    write_repo(tmp.path());
    let embedder = Arc::new(RecordingEmbedder::default());
    let h = harness(Some(embedder.clone()), None);
    run(&h, tmp.path(), IndexOptions::default()).await.unwrap();
    let before = h.vectors.count(SOURCE).await.unwrap();
    embedder.take();

    let options = IndexOptions {
        force: true,
        ..Default::default()
    };
    let result = run(&h, tmp.path(), options).await.unwrap();
    assert!(result.success);
    assert_eq!(result.stats.files_processed, 3);
    assert!(!embedder.take().is_empty());
    // re-stored, not duplicated
    assert_eq!(h.vectors.count(SOURCE).await.unwrap(), before);
}

#[tokio::test]
async fn test_summaries_and_skip_llm() {
    let tmp = TempDir::new().unwrap();
    fs::write(tmp.path().join("a.py"), "def alpha_marker():\n    return 1\n").unwrap();
    fs::write(tmp.path().join("bad.py"), "def summarize_fails():\n    return 0\n").unwrap();
    let summarizer = Arc::new(CountingSummarizer::default());
    let h = harness(None, Some(summarizer.clone()));

    let skipped = IndexOptions {
        skip_llm: true,
        dry_run: false,
        ..Default::default()
    };
    let result = run(&h, tmp.path(), skipped).await.unwrap();
    assert_eq!(summarizer.calls.load(Ordering::SeqCst), 0);
    assert_eq!(result.stats.summaries_generated, 0);

    fs::write(tmp.path().join("a.py"), "def alpha_marker():\n    return 2\n").unwrap();
    fs::write(tmp.path().join("bad.py"), "def summarize_fails():\n    return 1\n").unwrap();
    let result = run(&h, tmp.path(), IndexOptions::default()).await.unwrap();
    assert!(summarizer.calls.load(Ordering::SeqCst) > 0);
    assert!(result.stats.summaries_generated > 0);
    // a summary failure is file-scoped, the run still succeeds
    assert!(result.success);
    assert!(result.errors.iter().any(|e| e.phase == Phase::Summarize));

    let meta = h.metadata.find_file(SOURCE, "a.py").await.unwrap().unwrap();
    assert!(meta.has_summary);
}

#[tokio::test]
async fn test_missing_root_is_an_error() {
    let h = harness(None, None);
    let err = run(&h, Path::new("/definitely/not/here"), IndexOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, IndexError::MissingRoot(_)));
}

#[tokio::test]
async fn test_cancel_between_files_stops_parse() {
    let tmp = TempDir::new().unwrap();
    write_repo(tmp.path());
    let embedder = Arc::new(RecordingEmbedder::default());
    let h = harness(Some(embedder.clone()), None);

    let token = CancellationToken::new();
    let progress = Arc::new(CancelAt {
        token: token.clone(),
        phase: Phase::Parse,
        at: 2,
    });
    let err = run_cancellable(&h, tmp.path(), &token, progress).await.unwrap_err();
    assert!(matches!(err, IndexError::Cancelled(Phase::Parse)), "{:?}", err);
    assert!(embedder.take().is_empty());
    assert_nothing_stored(&h).await;
}

#[tokio::test]
async fn test_cancel_between_chunks_stops_summarize() {
    let tmp = TempDir::new().unwrap();
    write_repo(tmp.path());
    let summarizer = Arc::new(CountingSummarizer::default());
    let h = harness(Some(Arc::new(RecordingEmbedder::default())), Some(summarizer.clone()));

    let token = CancellationToken::new();
    let progress = Arc::new(CancelAt {
        token: token.clone(),
        phase: Phase::Summarize,
        at: 1,
    });
    let err = run_cancellable(&h, tmp.path(), &token, progress).await.unwrap_err();
    assert!(matches!(err, IndexError::Cancelled(Phase::Summarize)), "{:?}", err);
    // the chunk in flight when the token fired still finished
    assert_eq!(summarizer.calls.load(Ordering::SeqCst), 1);
    assert_nothing_stored(&h).await;
}

#[tokio::test]
async fn test_summarizer_reporting_cancellation_ends_run() {
    let tmp = TempDir::new().unwrap();
    write_repo(tmp.path());
    let summarizer = Arc::new(CancellingSummarizer {
        calls: AtomicUsize::new(0),
        limit: 1,
    });
    let h = harness(Some(Arc::new(RecordingEmbedder::default())), Some(summarizer.clone()));

    let err = run(&h, tmp.path(), IndexOptions::default()).await.unwrap_err();
    assert!(matches!(err, IndexError::Cancelled(Phase::Summarize)), "{:?}", err);
    assert_eq!(summarizer.calls.load(Ordering::SeqCst), 2);
    assert_nothing_stored(&h).await;
}

#[tokio::test]
async fn test_cancel_between_batches_stops_embed() {
    let tmp = TempDir::new().unwrap();
    write_repo(tmp.path());
    let token = CancellationToken::new();
    let embedder = Arc::new(CancellingEmbedder {
        calls: AtomicUsize::new(0),
        limit: 0,
        token: Some(token.clone()),
    });
    let settings = PipelineSettings {
        embed_batch_size: 1,
        ..Default::default()
    };
    let h = harness_with(Some(embedder.clone()), None, settings);

    let err = run_cancellable(&h, tmp.path(), &token, Arc::new(NoProgress))
        .await
        .unwrap_err();
    assert!(matches!(err, IndexError::Cancelled(Phase::Embed)), "{:?}", err);
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
    assert_nothing_stored(&h).await;
}

#[tokio::test]
async fn test_embedder_reporting_cancellation_ends_run() {
    let tmp = TempDir::new().unwrap();
    write_repo(tmp.path());
    let embedder = Arc::new(CancellingEmbedder {
        calls: AtomicUsize::new(0),
        limit: 1,
        token: None,
    });
    let settings = PipelineSettings {
        embed_batch_size: 1,
        ..Default::default()
    };
    let h = harness_with(Some(embedder.clone()), None, settings);

    let err = run(&h, tmp.path(), IndexOptions::default()).await.unwrap_err();
    assert!(matches!(err, IndexError::Cancelled(Phase::Embed)), "{:?}", err);
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 2);
    assert_nothing_stored(&h).await;
}

#[tokio::test]
async fn test_cancel_after_embedding_skips_store() {
    let tmp = TempDir::new().unwrap();
    write_repo(tmp.path());
    let embedder = Arc::new(RecordingEmbedder::default());
    let h = harness(Some(embedder.clone()), None);

    let token = CancellationToken::new();
    let progress = Arc::new(CancelAt {
        token: token.clone(),
        phase: Phase::Embed,
        at: 1,
    });
    let err = run_cancellable(&h, tmp.path(), &token, progress).await.unwrap_err();
    assert!(matches!(err, IndexError::Cancelled(Phase::Store)), "{:?}", err);
    assert!(!embedder.take().is_empty());
    assert_nothing_stored(&h).await;
}

/// Fails with text that mentions aborting, which is still a failure.
struct AbortedTextEmbedder;

#[async_trait]
impl Embedder for AbortedTextEmbedder {
    fn model_name(&self) -> &str {
        "aborted-text"
    }

    fn dims(&self) -> usize {
        4
    }

    async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        bail!("HTTP 400: request aborted: input for src/cancelled.py too long")
    }
}

#[tokio::test]
async fn test_failure_mentioning_abort_is_not_cancellation() {
    let tmp = TempDir::new().unwrap();
    write_repo(tmp.path());
    let h = harness(Some(Arc::new(AbortedTextEmbedder)), None);

    let result = run(&h, tmp.path(), IndexOptions::default()).await.unwrap();
    assert!(!result.success);
    assert!(result
        .errors
        .iter()
        .any(|e| e.phase == Phase::Embed && e.message.contains("request aborted")));
}

/// Records whether a concurrently spawned task had run by each event.
struct SawOtherTask {
    flag: Arc<AtomicBool>,
    seen: Mutex<Vec<(Phase, bool)>>,
}

impl ProgressReporter for SawOtherTask {
    fn report(&self, event: ProgressEvent) {
        let ran = self.flag.load(Ordering::SeqCst);
        self.seen.lock().unwrap().push((event.phase, ran));
    }
}

#[tokio::test(flavor = "current_thread")]
async fn test_file_work_yields_the_executor() {
    let tmp = TempDir::new().unwrap();
    write_repo(tmp.path());
    let h = harness(Some(Arc::new(RecordingEmbedder::default())), None);

    let flag = Arc::new(AtomicBool::new(false));
    let setter = flag.clone();
    tokio::spawn(async move {
        setter.store(true, Ordering::SeqCst);
    });
    let progress = Arc::new(SawOtherTask {
        flag,
        seen: Mutex::new(Vec::new()),
    });

    let result = h
        .pipeline
        .run(SOURCE, tmp.path(), IndexOptions::default(), progress.clone())
        .await
        .unwrap();
    assert!(result.success);

    // the walk and parse await the blocking pool, so the single-threaded
    // runtime gets to run the other task before any file is parsed
    let seen = progress.seen.lock().unwrap();
    let parse: Vec<bool> = seen
        .iter()
        .filter(|(phase, _)| *phase == Phase::Parse)
        .map(|(_, ran)| *ran)
        .collect();
    assert_eq!(parse.len(), 3);
    assert!(parse.iter().all(|ran| *ran));
}
