//! Indexing pipeline orchestration.
//!
//! Runs the phases of one indexing pass, strictly in order:
//!
//! 1. **collect**: list eligible paths under the root
//! 2. **diff**: classify against stored fingerprints, apply removals
//! 3. **dry-run**: stop here and report counts when requested
//! 4. **parse**: extract symbols and cut the chunk tree per file
//! 5. **summarize**: optional per-chunk summaries
//! 6. **embed**: optional batched embeddings
//! 7. **store**: replace vectors for re-processed files, then upsert metadata
//!
//! File-scoped failures (parse, summarize) are recorded on the
//! [`PipelineContext`] and the run continues. A failed embedding batch ends
//! the run before the store phase so the affected files stay re-indexable.
//! Cancellation is checked before phase 1, before each file in phase 4,
//! before each chunk in phases 5 and 6, and before phase 7.
//!
//! Walking, hashing, and tree-sitter parsing run on the blocking pool.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use crate::changes::{detect_changes, ChangeSet};
use crate::chunk::{chunk_file, ChunkerOptions};
use crate::collector::FileCollector;
use crate::config::Config;
use crate::context::{IndexOptions, IndexResult, PipelineContext};
use crate::embedding::create_embedder;
use crate::error::{is_cancellation, IndexError, Phase};
use crate::filter::PathFilter;
use crate::git::GitFetcher;
use crate::models::{
    CodeChunk, CollectedFile, ExtractedSymbol, FileMetadata, StatusField, SubjectStatus,
    VectorRecord,
};
use crate::progress::{ProgressMode, ProgressReporter};
use crate::sources::resolve_source;
use crate::sqlite_store::SqliteStore;
use crate::symbols::SymbolExtractor;
use crate::traits::{
    Embedder, MetadataStore, RepositoryFetcher, SourceStore, Summarizer, SummaryContext,
    VectorStore,
};

/// Collaborators the pipeline writes to and enriches through.
#[derive(Clone)]
pub struct PipelineServices {
    pub metadata: Arc<dyn MetadataStore>,
    pub vectors: Arc<dyn VectorStore>,
    pub summarizer: Option<Arc<dyn Summarizer>>,
    pub embedder: Option<Arc<dyn Embedder>>,
}

/// Tunables that come from configuration rather than per-run options.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub chunker: ChunkerOptions,
    pub ignore_files: Vec<String>,
    pub exclude_globs: Vec<String>,
    pub follow_symlinks: bool,
    pub embed_batch_size: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            chunker: ChunkerOptions::default(),
            ignore_files: vec![".gitignore".to_string(), ".indexignore".to_string()],
            exclude_globs: Vec::new(),
            follow_symlinks: false,
            embed_batch_size: 64,
        }
    }
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            chunker: ChunkerOptions {
                max_tokens: config.indexing.max_tokens,
                overlap_lines: config.indexing.overlap_lines,
            },
            ignore_files: config.indexing.ignore_files.clone(),
            exclude_globs: config.indexing.exclude_globs.clone(),
            follow_symlinks: config.indexing.follow_symlinks,
            embed_batch_size: config.embedding.batch_size,
        }
    }
}

/// A file that made it through the parse phase.
struct ProcessedFile {
    file: CollectedFile,
    chunks: Vec<CodeChunk>,
    previously_stored: bool,
}

/// Read (unless the diff already did), extract symbols, and chunk one file.
fn parse_file(
    collector: &FileCollector,
    extractor: &mut SymbolExtractor,
    taken: Option<CollectedFile>,
    path: &str,
    source_id: &str,
    chunker: &ChunkerOptions,
) -> anyhow::Result<(CollectedFile, usize, Vec<CodeChunk>)> {
    let file = match taken {
        Some(file) => file,
        None => collector.read_file(path)?,
    };
    let symbols: Vec<ExtractedSymbol> = extractor.extract(&file.content, file.language)?;
    let chunks = chunk_file(source_id, &file, &symbols, chunker);
    Ok((file, symbols.len(), chunks))
}

pub struct IndexingPipeline {
    services: PipelineServices,
    settings: PipelineSettings,
}

impl IndexingPipeline {
    pub fn new(services: PipelineServices, settings: PipelineSettings) -> Self {
        Self { services, settings }
    }

    pub fn services(&self) -> &PipelineServices {
        &self.services
    }

    /// Run one indexing pass over `root` for `source_id`.
    ///
    /// Returns `Err` for setup failures (missing root, bad globs) and for
    /// cancellation; every other failure is reported inside the result.
    pub async fn run(
        &self,
        source_id: &str,
        root: &Path,
        options: IndexOptions,
        progress: Arc<dyn ProgressReporter>,
    ) -> Result<IndexResult, IndexError> {
        let mut exclude = self.settings.exclude_globs.clone();
        exclude.extend(options.exclude.iter().cloned());
        let filter = PathFilter::new(root, &self.settings.ignore_files, &options.include, &exclude)?;
        let collector =
            Arc::new(FileCollector::new(root, filter).follow_symlinks(self.settings.follow_symlinks));
        collector.check_root()?;

        let mut ctx = PipelineContext::new(source_id, root, options).with_progress(progress);
        info!(
            source = %source_id,
            root = %root.display(),
            force = ctx.options.force,
            dry_run = ctx.options.dry_run,
            "indexing started"
        );

        // 1. collect
        ctx.checkpoint(Phase::Collect)?;
        ctx.report(Phase::Collect, 0, 0, None);
        let lister = collector.clone();
        let current = match tokio::task::spawn_blocking(move || lister.list_paths()).await {
            Ok(Ok(paths)) => paths,
            Ok(Err(e)) => {
                ctx.record_run_failure(Phase::Collect, None, e.to_string());
                return Ok(ctx.finish());
            }
            Err(e) => {
                ctx.record_run_failure(Phase::Collect, None, format!("walk task failed: {}", e));
                return Ok(ctx.finish());
            }
        };
        let listed = current.len() as u64;
        ctx.report(Phase::Collect, listed, listed, None);

        // 2. diff
        let stored = self
            .services
            .metadata
            .fingerprints(source_id)
            .await
            .map_err(IndexError::Store)?;
        let (mut changes, stored) = if ctx.options.force {
            (ChangeSet::forced(&stored, &current), stored)
        } else {
            let reader = collector.clone();
            let diffed = tokio::task::spawn_blocking(move || {
                let changes = detect_changes(&reader, &stored, &current);
                (changes, stored)
            })
            .await;
            match diffed {
                Ok(diffed) => diffed,
                Err(e) => {
                    ctx.record_run_failure(Phase::Diff, None, format!("diff task failed: {}", e));
                    return Ok(ctx.finish());
                }
            }
        };
        ctx.stats.files_added = changes.added.len() as u64;
        ctx.stats.files_modified = changes.modified.len() as u64;
        ctx.stats.files_removed = changes.removed.len() as u64;
        info!(
            source = %source_id,
            added = ctx.stats.files_added,
            modified = ctx.stats.files_modified,
            removed = ctx.stats.files_removed,
            unchanged = changes.unchanged.len(),
            "diff complete"
        );

        // 3. dry-run short-circuit, before anything is written
        if ctx.options.dry_run {
            return Ok(ctx.finish());
        }

        if !changes.removed.is_empty() {
            if let Err(e) = self.apply_removals(source_id, &changes.removed).await {
                ctx.record_run_failure(Phase::Store, None, format!("removing deleted files: {:#}", e));
                return Ok(ctx.finish());
            }
        }

        // 4. parse + chunk
        let mut processed = self
            .parse_phase(&mut ctx, &collector, &mut changes, &stored)
            .await?;

        // 5. summarize
        if !ctx.options.skip_llm {
            if let Some(summarizer) = self.services.summarizer.clone() {
                self.summarize_phase(&mut ctx, summarizer.as_ref(), &mut processed)
                    .await?;
            }
        }

        // 6. embed
        if let Some(embedder) = self.services.embedder.clone() {
            self.embed_phase(&mut ctx, embedder.as_ref(), &mut processed)
                .await?;
            if ctx.has_failed() {
                return Ok(ctx.finish());
            }
        }

        // 7. store
        ctx.checkpoint(Phase::Store)?;
        self.store_phase(&mut ctx, &processed).await;

        let result = ctx.finish();
        info!(
            source = %source_id,
            files = result.stats.files_processed,
            chunks = result.stats.chunks_created,
            errors = result.errors.len(),
            elapsed_ms = result.elapsed.as_millis() as u64,
            "indexing finished"
        );
        Ok(result)
    }

    /// Drop everything stored for a source.
    pub async fn purge(&self, source_id: &str) -> anyhow::Result<(u64, u64)> {
        let vectors = self.services.vectors.delete_by_source_id(source_id).await?;
        let files = self.services.metadata.delete_source(source_id).await?;
        Ok((files, vectors))
    }

    async fn apply_removals(&self, source_id: &str, removed: &[String]) -> anyhow::Result<()> {
        self.services
            .vectors
            .delete_by_file_paths(source_id, removed)
            .await?;
        self.services.metadata.delete_files(source_id, removed).await?;
        Ok(())
    }

    async fn parse_phase(
        &self,
        ctx: &mut PipelineContext,
        collector: &Arc<FileCollector>,
        changes: &mut ChangeSet,
        stored: &HashMap<String, String>,
    ) -> Result<Vec<ProcessedFile>, IndexError> {
        let paths: Vec<String> = changes.to_process().into_iter().map(str::to_string).collect();
        let total = paths.len() as u64;
        let mut extractor = SymbolExtractor::new();
        let mut processed = Vec::with_capacity(paths.len());

        for (i, path) in paths.into_iter().enumerate() {
            ctx.checkpoint(Phase::Parse)?;
            ctx.report(Phase::Parse, i as u64 + 1, total, Some(path.as_str()));

            let taken = changes.take_file(&path);
            let reader = collector.clone();
            let source_id = ctx.source_id.clone();
            let chunker = self.settings.chunker;
            let rel = path.clone();
            let joined = tokio::task::spawn_blocking(move || {
                let parsed = parse_file(&reader, &mut extractor, taken, &rel, &source_id, &chunker);
                (extractor, parsed)
            })
            .await;

            let parsed = match joined {
                Ok((returned, parsed)) => {
                    extractor = returned;
                    parsed
                }
                Err(e) => {
                    // the parser went down with the task
                    extractor = SymbolExtractor::new();
                    Err(anyhow::anyhow!("parse task failed: {}", e))
                }
            };
            let (file, symbol_count, chunks) = match parsed {
                Ok(parsed) => parsed,
                Err(e) => {
                    ctx.record_error(Phase::Parse, Some(path.as_str()), format!("{:#}", e));
                    continue;
                }
            };

            ctx.log_file(
                &path,
                &format!("{} symbols, {} chunks", symbol_count, chunks.len()),
            );
            ctx.stats.files_processed += 1;
            ctx.stats.chunks_created += chunks.len() as u64;
            processed.push(ProcessedFile {
                previously_stored: stored.contains_key(&path),
                file,
                chunks,
            });
        }

        Ok(processed)
    }

    async fn summarize_phase(
        &self,
        ctx: &mut PipelineContext,
        summarizer: &dyn Summarizer,
        processed: &mut [ProcessedFile],
    ) -> Result<(), IndexError> {
        let total: u64 = processed.iter().map(|p| p.chunks.len() as u64).sum();
        let mut done = 0u64;

        for entry in processed.iter_mut() {
            for chunk in entry.chunks.iter_mut() {
                ctx.checkpoint(Phase::Summarize)?;
                done += 1;
                ctx.report(Phase::Summarize, done, total, Some(chunk.file_path.as_str()));

                let context = SummaryContext {
                    language: chunk.language,
                    symbol_name: chunk.symbol_name.clone(),
                };
                match summarizer.summarize(&chunk.content, &context).await {
                    Ok(summary) => {
                        chunk.summary = Some(summary.summary);
                        chunk.keywords = summary.keywords;
                        ctx.stats.summaries_generated += 1;
                    }
                    Err(e) if is_cancellation(&e) => {
                        return Err(IndexError::Cancelled(Phase::Summarize));
                    }
                    Err(e) => {
                        let file = chunk.file_path.clone();
                        ctx.record_error(Phase::Summarize, Some(&file), format!("{:#}", e));
                    }
                }
            }
        }
        Ok(())
    }

    async fn embed_phase(
        &self,
        ctx: &mut PipelineContext,
        embedder: &dyn Embedder,
        processed: &mut [ProcessedFile],
    ) -> Result<(), IndexError> {
        let positions: Vec<(usize, usize)> = processed
            .iter()
            .enumerate()
            .flat_map(|(f, p)| (0..p.chunks.len()).map(move |c| (f, c)))
            .collect();
        let total = positions.len() as u64;
        let batch_size = self.settings.embed_batch_size.max(1);
        let mut done = 0u64;

        for batch in positions.chunks(batch_size) {
            let mut texts = Vec::with_capacity(batch.len());
            for &(f, c) in batch {
                ctx.checkpoint(Phase::Embed)?;
                texts.push(embedding_text(&processed[f].chunks[c]));
            }

            match embedder.embed_batch(&texts).await {
                Ok(vectors) if vectors.len() == batch.len() => {
                    for (&(f, c), vector) in batch.iter().zip(vectors) {
                        processed[f].chunks[c].embedding = Some(vector);
                    }
                    done += batch.len() as u64;
                    ctx.stats.embeddings_generated += batch.len() as u64;
                    ctx.report(Phase::Embed, done, total, None);
                }
                Ok(vectors) => {
                    ctx.record_run_failure(
                        Phase::Embed,
                        None,
                        format!(
                            "embedding batch returned {} vectors for {} inputs",
                            vectors.len(),
                            batch.len()
                        ),
                    );
                    return Ok(());
                }
                Err(e) if is_cancellation(&e) => return Err(IndexError::Cancelled(Phase::Embed)),
                Err(e) => {
                    ctx.record_run_failure(Phase::Embed, None, format!("{:#}", e));
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    async fn store_phase(&self, ctx: &mut PipelineContext, processed: &[ProcessedFile]) {
        let source_id = ctx.source_id.clone();
        let stale: Vec<String> = processed
            .iter()
            .filter(|p| p.previously_stored)
            .map(|p| p.file.relative_path.clone())
            .collect();
        if !stale.is_empty() {
            if let Err(e) = self.services.vectors.delete_by_file_paths(&source_id, &stale).await {
                ctx.record_run_failure(Phase::Store, None, format!("deleting stale vectors: {:#}", e));
                return;
            }
        }

        let total = processed.len() as u64;
        for (i, entry) in processed.iter().enumerate() {
            let path = entry.file.relative_path.as_str();
            ctx.report(Phase::Store, i as u64 + 1, total, Some(path));

            let records: Vec<VectorRecord> = entry
                .chunks
                .iter()
                .filter_map(|chunk| {
                    chunk
                        .embedding
                        .as_ref()
                        .map(|v| VectorRecord::from_chunk(chunk, v.clone()))
                })
                .collect();
            if !records.is_empty() {
                if let Err(e) = self.services.vectors.upsert(&records).await {
                    ctx.record_run_failure(Phase::Store, Some(path), format!("{:#}", e));
                    continue;
                }
            }

            let metadata = FileMetadata {
                source_id: source_id.clone(),
                file_path: entry.file.relative_path.clone(),
                fingerprint: entry.file.fingerprint.clone(),
                size: entry.file.size,
                language: entry.file.language.as_str().to_string(),
                chunk_count: entry.chunks.len() as u64,
                has_summary: entry.chunks.iter().any(|c| c.summary.is_some()),
                indexed_at: Utc::now(),
            };
            if let Err(e) = self.services.metadata.upsert_file(&metadata).await {
                ctx.record_run_failure(Phase::Store, Some(path), format!("{:#}", e));
            }
        }
    }
}

/// Text sent to the embedder: summary first when one exists.
fn embedding_text(chunk: &CodeChunk) -> String {
    match &chunk.summary {
        Some(summary) => format!("{}\n\n{}", summary, chunk.content),
        None => chunk.content.clone(),
    }
}

/// Wire the pipeline to the SQLite store and the configured embedder.
pub fn build_pipeline(
    config: &Config,
    store: Arc<SqliteStore>,
) -> anyhow::Result<IndexingPipeline> {
    let embedder = create_embedder(&config.embedding, &config.retry)?;
    let services = PipelineServices {
        metadata: store.clone(),
        vectors: store,
        summarizer: None,
        embedder,
    };
    Ok(IndexingPipeline::new(
        services,
        PipelineSettings::from_config(config),
    ))
}

/// `ixh index`: run one pass inline and print the result.
pub async fn run_index(
    config: &Config,
    source: &str,
    options: IndexOptions,
    mode: ProgressMode,
) -> anyhow::Result<()> {
    let store = Arc::new(SqliteStore::open(config).await?);
    let source = resolve_source(store.as_ref(), source).await?;
    let root = GitFetcher::new(&config.worker.checkout_dir)
        .checkout(&source)
        .await?;
    let pipeline = build_pipeline(config, store.clone())?;
    let dry_run = options.dry_run;

    if !dry_run {
        store
            .set_status(&source.id, StatusField::Index, SubjectStatus::Running)
            .await?;
    }
    let outcome = pipeline
        .run(&source.id, &root, options, Arc::from(mode.reporter()))
        .await;
    if !dry_run {
        let status = match &outcome {
            Ok(result) if result.success => SubjectStatus::Ready,
            Err(IndexError::Cancelled(_)) => SubjectStatus::Pending,
            _ => SubjectStatus::Error,
        };
        store.set_status(&source.id, StatusField::Index, status).await?;
    }
    let result = outcome?;

    if mode == ProgressMode::Json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&source.name, &result);
    }

    if !result.success {
        anyhow::bail!("Indexing '{}' failed", source.name);
    }
    Ok(())
}

fn print_result(name: &str, result: &IndexResult) {
    let stats = &result.stats;
    let label = if result.dry_run { "Dry run" } else { "Indexed" };
    println!("{} '{}'", label, name);
    println!("  added:      {}", stats.files_added);
    println!("  modified:   {}", stats.files_modified);
    println!("  removed:    {}", stats.files_removed);
    if !result.dry_run {
        println!("  processed:  {}", stats.files_processed);
        println!("  chunks:     {}", stats.chunks_created);
        println!("  summaries:  {}", stats.summaries_generated);
        println!("  embeddings: {}", stats.embeddings_generated);
    }
    println!("  elapsed:    {}ms", result.elapsed.as_millis());
    for error in &result.errors {
        println!("  error: {}", error);
    }
}
