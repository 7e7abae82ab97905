//! Background task processor.
//!
//! A [`TaskProcessor`] polls the job store on a fixed tick, claims as many
//! PENDING jobs as it has free slots, and runs each one as its own tokio
//! task. A job's lifecycle:
//!
//! ```text
//! claim ─▶ resolve source ─▶ status: running ─▶ dispatch
//!    ├─ ok        ─▶ COMPLETED, status ready   (full-index enqueues snippet + wiki)
//!    ├─ cancelled ─▶ CANCELLED, status pending
//!    └─ error     ─▶ FAILED,    status error
//! ```
//!
//! On startup every RUNNING job left by a previous process is cancelled and
//! every `running` source status is reset to `pending`. On shutdown the
//! processor stops claiming and waits for active jobs to finish.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cancel::JobCancellation;
use crate::config::Config;
use crate::context::IndexOptions;
use crate::error::{is_cancellation, Cancelled, IndexError};
use crate::generate::{generate_snippets, WikiDriver};
use crate::git::GitFetcher;
use crate::ingest::{build_pipeline, IndexingPipeline};
use crate::models::{Job, JobProgress, JobStatus, JobType, NewJob, StatusField, SubjectStatus};
use crate::progress::{ChannelProgress, ProgressEvent};
use crate::retry::RetryPolicy;
use crate::sqlite_store::SqliteStore;
use crate::traits::{JobStore, RepositoryFetcher, SnippetGenerator, SourceStore, WikiGenerator};

/// Collaborators a worker drives.
#[derive(Clone)]
pub struct WorkerServices {
    pub jobs: Arc<dyn JobStore>,
    pub sources: Arc<dyn SourceStore>,
    pub fetcher: Arc<dyn RepositoryFetcher>,
    pub pipeline: Arc<IndexingPipeline>,
    pub snippets: Option<Arc<dyn SnippetGenerator>>,
    pub wiki: Option<Arc<dyn WikiGenerator>>,
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub max_concurrency: usize,
    pub poll_interval: Duration,
    pub cancel_poll_interval: Duration,
    pub wiki_concurrency: usize,
    pub retry: RetryPolicy,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 2,
            poll_interval: Duration::from_millis(2000),
            cancel_poll_interval: Duration::from_millis(1000),
            wiki_concurrency: 3,
            retry: RetryPolicy::default(),
        }
    }
}

impl WorkerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_concurrency: config.worker.max_concurrency,
            poll_interval: Duration::from_millis(config.worker.poll_interval_ms),
            cancel_poll_interval: Duration::from_millis(config.worker.cancel_poll_interval_ms),
            wiki_concurrency: config.worker.wiki_concurrency,
            retry: RetryPolicy::from(&config.retry),
        }
    }
}

/// A job this processor has claimed and not yet finished.
#[derive(Debug, Clone)]
pub struct ActiveJob {
    pub job_type: JobType,
    pub source_id: String,
    pub started: Instant,
}

struct Inner {
    services: WorkerServices,
    settings: WorkerSettings,
    active: Mutex<HashMap<String, ActiveJob>>,
    active_count: watch::Sender<usize>,
}

pub struct TaskProcessor {
    inner: Arc<Inner>,
}

/// Removes a job from the active map when its task ends, panics included.
struct ActiveGuard {
    inner: Arc<Inner>,
    job_id: String,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let mut active = self.inner.lock_active();
        active.remove(&self.job_id);
        self.inner.active_count.send_replace(active.len());
    }
}

enum Outcome {
    Completed(serde_json::Value),
    Cancelled,
    Failed(String),
}

impl TaskProcessor {
    pub fn new(services: WorkerServices, settings: WorkerSettings) -> Self {
        let (active_count, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                services,
                settings,
                active: Mutex::new(HashMap::new()),
                active_count,
            }),
        }
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock_active().len()
    }

    /// Snapshot of claimed, unfinished jobs by id.
    pub fn active_jobs(&self) -> HashMap<String, ActiveJob> {
        self.inner.lock_active().clone()
    }

    /// Crash recovery: cancel orphaned RUNNING jobs and reset `running` statuses.
    pub async fn recover(&self) -> Result<(u64, u64)> {
        let jobs = self.inner.services.jobs.cancel_all_running().await?;
        let statuses = self.inner.services.sources.reset_running_statuses().await?;
        if jobs > 0 || statuses > 0 {
            warn!(jobs, statuses, "recovered state from a previous worker");
        }
        Ok((jobs, statuses))
    }

    /// Run until `shutdown` fires, then wait for active jobs.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        self.recover().await?;
        info!(
            max_concurrency = self.inner.settings.max_concurrency,
            poll_ms = self.inner.settings.poll_interval.as_millis() as u64,
            "worker started"
        );

        let mut ticker = tokio::time::interval(self.inner.settings.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.tick().await {
                warn!(error = %format!("{:#}", e), "worker tick failed");
            }
        }

        let remaining = self.active_count();
        if remaining > 0 {
            info!(remaining, "worker stopping, waiting for active jobs");
        }
        self.drain().await;
        info!("worker stopped");
        Ok(())
    }

    /// One scheduling pass. Returns how many jobs were started.
    pub async fn tick(&self) -> Result<usize> {
        let (slots, exclude) = {
            let active = self.inner.lock_active();
            let slots = self.inner.settings.max_concurrency.saturating_sub(active.len());
            (slots, active.keys().cloned().collect::<Vec<_>>())
        };
        if slots == 0 {
            return Ok(0);
        }

        let jobs = &self.inner.services.jobs;
        let pending = jobs.list_pending(slots, &exclude).await?;
        let mut started = 0;
        for job in pending {
            if !jobs.try_claim(&job.id).await? {
                debug!(job = %job.id, "claim lost to another worker");
                continue;
            }
            self.spawn_job(job)?;
            started += 1;
        }
        Ok(started)
    }

    /// Wait until no job is active.
    pub async fn drain(&self) {
        let mut rx = self.inner.active_count.subscribe();
        let _ = rx.wait_for(|count| *count == 0).await;
    }

    fn spawn_job(&self, job: Job) -> Result<()> {
        {
            let mut active = self.inner.lock_active();
            active.insert(
                job.id.clone(),
                ActiveJob {
                    job_type: job.job_type,
                    source_id: job.source_id.clone(),
                    started: Instant::now(),
                },
            );
            self.inner.active_count.send_replace(active.len());
        }

        let guard = ActiveGuard {
            inner: self.inner.clone(),
            job_id: job.id.clone(),
        };
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let _guard = guard;
            inner.execute(job).await;
        });
        Ok(())
    }
}

impl Inner {
    /// The active map. A panic while it was held leaves the map itself
    /// consistent, so poisoning is ignored.
    fn lock_active(&self) -> MutexGuard<'_, HashMap<String, ActiveJob>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn execute(&self, job: Job) {
        let started = Instant::now();
        info!(job = %job.id, job_type = job.job_type.as_str(), source = %job.source_id, "job started");
        self.log(&job.id, "info", &format!("Job started: {}", job.job_type.as_str()))
            .await;

        let cancellation = JobCancellation::start(
            &job.id,
            self.services.jobs.clone(),
            self.settings.cancel_poll_interval,
        );
        let outcome = match self.dispatch(&job, &cancellation).await {
            Ok(result) => Outcome::Completed(result),
            Err(e) if is_cancellation(&e) || cancellation.is_cancelled() => Outcome::Cancelled,
            Err(e) => Outcome::Failed(format!("{:#}", e)),
        };
        cancellation.stop();

        let field = job.job_type.status_field();
        match outcome {
            Outcome::Completed(result) => self.finish_completed(&job, field, result).await,
            Outcome::Cancelled => self.finish_cancelled(&job, field).await,
            Outcome::Failed(message) => self.finish_failed(&job, field, &message).await,
        }
        debug!(job = %job.id, elapsed_ms = started.elapsed().as_millis() as u64, "job finished");
    }

    async fn dispatch(&self, job: &Job, cancellation: &JobCancellation) -> Result<serde_json::Value> {
        let source = self
            .services
            .sources
            .get_source(&job.source_id)
            .await?
            .ok_or_else(|| IndexError::UnknownSource(job.source_id.clone()))?;
        self.services
            .sources
            .set_status(&source.id, job.job_type.status_field(), SubjectStatus::Running)
            .await?;

        let root = self.services.fetcher.checkout(&source).await?;
        if cancellation.is_cancelled() {
            return Err(Cancelled.into());
        }
        self.log(
            &job.id,
            "info",
            &format!(
                "Dispatching {} for source '{}' at {}",
                job.job_type.as_str(),
                source.name,
                root.display()
            ),
        )
        .await;

        let token = cancellation.token();
        match job.job_type {
            JobType::FullIndex | JobType::Incremental => {
                let options = IndexOptions {
                    force: job.job_type == JobType::FullIndex,
                    abort: Some(token),
                    ..Default::default()
                };
                let (tx, rx) = mpsc::unbounded_channel();
                let forwarder = tokio::spawn(forward_progress(
                    self.services.jobs.clone(),
                    job.id.clone(),
                    rx,
                ));
                let run = self
                    .services
                    .pipeline
                    .run(&source.id, &root, options, Arc::new(ChannelProgress::new(tx)))
                    .await;
                // The reporter is dropped with the run, which closes the channel.
                let _ = forwarder.await;

                let result = run?;
                for err in &result.errors {
                    self.log(&job.id, "warn", &err.to_string()).await;
                }
                if !result.success {
                    let summary: Vec<String> = result.errors.iter().map(|e| e.to_string()).collect();
                    bail!("Indexing failed: {}", summary.join("; "));
                }
                Ok(serde_json::to_value(&result)?)
            }
            JobType::SnippetGenerate => {
                let generator = self
                    .services
                    .snippets
                    .as_ref()
                    .ok_or_else(|| anyhow!("No snippet generator configured"))?;
                let result = generate_snippets(generator.as_ref(), &source, &root, &token).await?;
                Ok(serde_json::to_value(&result)?)
            }
            JobType::WikiGenerate => {
                let generator = self
                    .services
                    .wiki
                    .clone()
                    .ok_or_else(|| anyhow!("No wiki generator configured"))?;
                let driver = WikiDriver::new(
                    generator,
                    self.settings.wiki_concurrency,
                    self.settings.retry.clone(),
                );
                let result = driver.generate(&source, &root, &token).await?;
                for err in &result.errors {
                    self.log(&job.id, "warn", err).await;
                }
                Ok(serde_json::to_value(&result)?)
            }
        }
    }

    async fn finish_completed(&self, job: &Job, field: StatusField, result: serde_json::Value) {
        let jobs = &self.services.jobs;
        if let Err(e) = jobs.complete_job(&job.id, &result.to_string()).await {
            error!(job = %job.id, error = %e, "failed to mark job completed");
            return;
        }

        // An external cancel that landed first wins; complete_job left it alone.
        let status = jobs.get_job(&job.id).await.ok().flatten().map(|j| j.status);
        if status == Some(JobStatus::Cancelled) {
            self.finish_cancelled(job, field).await;
            return;
        }

        self.set_status(&job.source_id, field, SubjectStatus::Ready).await;
        info!(job = %job.id, job_type = job.job_type.as_str(), "job completed");
        self.log(&job.id, "info", "Job completed").await;

        if job.job_type == JobType::FullIndex {
            for follow_up in [JobType::SnippetGenerate, JobType::WikiGenerate] {
                let new = NewJob {
                    source_id: job.source_id.clone(),
                    source_kind: job.source_kind,
                    job_type: follow_up,
                };
                match jobs.create_job(new).await {
                    Ok(created) => {
                        self.log(
                            &job.id,
                            "info",
                            &format!("Enqueued {} job {}", follow_up.as_str(), created.id),
                        )
                        .await
                    }
                    Err(e) => warn!(job = %job.id, error = %e, "failed to enqueue {}", follow_up.as_str()),
                }
            }
        }
    }

    async fn finish_cancelled(&self, job: &Job, field: StatusField) {
        if let Err(e) = self.services.jobs.cancel_job(&job.id).await {
            error!(job = %job.id, error = %e, "failed to mark job cancelled");
        }
        self.set_status(&job.source_id, field, SubjectStatus::Pending).await;
        info!(job = %job.id, "job cancelled");
        self.log(&job.id, "info", "Job cancelled").await;
    }

    async fn finish_failed(&self, job: &Job, field: StatusField, message: &str) {
        if let Err(e) = self.services.jobs.fail_job(&job.id, message).await {
            error!(job = %job.id, error = %e, "failed to mark job failed");
        }
        self.set_status(&job.source_id, field, SubjectStatus::Error).await;
        warn!(job = %job.id, error = %message, "job failed");
        self.log(&job.id, "error", &format!("Job failed: {}", message)).await;
    }

    async fn set_status(&self, source_id: &str, field: StatusField, status: SubjectStatus) {
        if let Err(e) = self.services.sources.set_status(source_id, field, status).await {
            warn!(source = %source_id, error = %e, "failed to update {}", field.column());
        }
    }

    async fn log(&self, job_id: &str, level: &str, message: &str) {
        if let Err(e) = self.services.jobs.append_log(job_id, level, message).await {
            debug!(job = %job_id, error = %e, "failed to append job log");
        }
    }
}

/// `ixh worker`: process jobs until Ctrl-C, then drain.
pub async fn run_worker(config: &Config) -> Result<()> {
    let store = Arc::new(SqliteStore::open(config).await?);
    let pipeline = Arc::new(build_pipeline(config, store.clone())?);
    let services = WorkerServices {
        jobs: store.clone(),
        sources: store,
        fetcher: Arc::new(GitFetcher::new(&config.worker.checkout_dir)),
        pipeline,
        snippets: None,
        wiki: None,
    };
    let processor = TaskProcessor::new(services, WorkerSettings::from_config(config));

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
        }
        signal.cancel();
    });

    processor.run(shutdown).await
}

/// Push pipeline progress into the job store, collapsing bursts to the latest event.
async fn forward_progress(
    jobs: Arc<dyn JobStore>,
    job_id: String,
    mut rx: mpsc::UnboundedReceiver<ProgressEvent>,
) {
    while let Some(mut latest) = rx.recv().await {
        while let Ok(next) = rx.try_recv() {
            latest = next;
        }
        let progress = JobProgress {
            phase: Some(latest.phase.as_str().to_string()),
            current: latest.current,
            total: latest.total,
        };
        if let Err(e) = jobs.update_progress(&job_id, &progress).await {
            debug!(job = %job_id, error = %e, "progress update failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{PipelineServices, PipelineSettings};
    use crate::memory::{
        InMemoryJobStore, InMemoryMetadataStore, InMemorySourceStore, InMemoryVectorStore,
    };
    use crate::models::Source;
    use async_trait::async_trait;
    use std::path::PathBuf;

    struct NoCheckout;

    #[async_trait]
    impl RepositoryFetcher for NoCheckout {
        async fn checkout(&self, _source: &Source) -> Result<PathBuf> {
            bail!("no checkouts in this test")
        }
    }

    fn processor() -> TaskProcessor {
        let pipeline = IndexingPipeline::new(
            PipelineServices {
                metadata: Arc::new(InMemoryMetadataStore::new()),
                vectors: Arc::new(InMemoryVectorStore::new()),
                summarizer: None,
                embedder: None,
            },
            PipelineSettings::default(),
        );
        let services = WorkerServices {
            jobs: Arc::new(InMemoryJobStore::new()),
            sources: Arc::new(InMemorySourceStore::new()),
            fetcher: Arc::new(NoCheckout),
            pipeline: Arc::new(pipeline),
            snippets: None,
            wiki: None,
        };
        TaskProcessor::new(services, WorkerSettings::default())
    }

    #[tokio::test]
    async fn test_guard_releases_slot_after_poisoned_lock() {
        let processor = processor();
        processor.inner.lock_active().insert(
            "job-1".to_string(),
            ActiveJob {
                job_type: JobType::Incremental,
                source_id: "src-1".to_string(),
                started: Instant::now(),
            },
        );
        processor.inner.active_count.send_replace(1);
        let guard = ActiveGuard {
            inner: processor.inner.clone(),
            job_id: "job-1".to_string(),
        };

        let inner = processor.inner.clone();
        let panicked = std::thread::spawn(move || {
            let _held = inner.active.lock().unwrap();
            panic!("job task panicked while holding the active map");
        })
        .join();
        assert!(panicked.is_err());
        assert!(processor.inner.active.is_poisoned());

        drop(guard);
        assert_eq!(processor.active_count(), 0);
        assert!(processor.active_jobs().is_empty());
        tokio::time::timeout(Duration::from_secs(1), processor.drain())
            .await
            .unwrap();
        // scheduling keeps working on the recovered map
        assert_eq!(processor.tick().await.unwrap(), 0);
    }
}
