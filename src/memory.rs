//! In-memory store implementations for tests and ad hoc runs.
//!
//! Uses `Vec` and `HashMap` behind `std::sync::RwLock`. Job order is
//! insertion order, which doubles as creation order.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::models::{
    FileMetadata, Job, JobLogLine, JobProgress, JobStatus, NewJob, NewSource, Source,
    StatusField, SubjectStatus, VectorRecord,
};
use crate::traits::{JobStore, MetadataStore, SourceStore, VectorStore};

// ============ Jobs ============

pub struct InMemoryJobStore {
    jobs: RwLock<Vec<Job>>,
    logs: RwLock<Vec<JobLogLine>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(Vec::new()),
            logs: RwLock::new(Vec::new()),
        }
    }

    /// Apply `f` to the job with `id`, if any.
    fn with_job<R>(&self, id: &str, f: impl FnOnce(&mut Job) -> R) -> Option<R> {
        let mut jobs = self.jobs.write().unwrap();
        jobs.iter_mut().find(|j| j.id == id).map(f)
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_job(&self, new: NewJob) -> Result<Job> {
        let job = Job {
            id: Uuid::new_v4().to_string(),
            source_id: new.source_id,
            source_kind: new.source_kind,
            job_type: new.job_type,
            status: JobStatus::Pending,
            progress: JobProgress::default(),
            error: None,
            result_json: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };
        self.jobs.write().unwrap().push(job.clone());
        Ok(job)
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let jobs = self.jobs.read().unwrap();
        Ok(jobs.iter().find(|j| j.id == id).cloned())
    }

    async fn list_jobs(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>> {
        let jobs = self.jobs.read().unwrap();
        Ok(jobs
            .iter()
            .rev()
            .filter(|j| status.map_or(true, |s| j.status == s))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn list_pending(&self, limit: usize, exclude: &[String]) -> Result<Vec<Job>> {
        let jobs = self.jobs.read().unwrap();
        Ok(jobs
            .iter()
            .filter(|j| j.status == JobStatus::Pending && !exclude.contains(&j.id))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn try_claim(&self, id: &str) -> Result<bool> {
        Ok(self
            .with_job(id, |job| {
                if job.status != JobStatus::Pending {
                    return false;
                }
                job.status = JobStatus::Running;
                job.started_at = Some(Utc::now());
                true
            })
            .unwrap_or(false))
    }

    async fn update_progress(&self, id: &str, progress: &JobProgress) -> Result<()> {
        self.with_job(id, |job| job.progress = progress.clone());
        Ok(())
    }

    async fn complete_job(&self, id: &str, result_json: &str) -> Result<()> {
        self.with_job(id, |job| {
            if job.status == JobStatus::Running {
                job.status = JobStatus::Completed;
                job.result_json = Some(result_json.to_string());
                job.finished_at = Some(Utc::now());
            }
        });
        Ok(())
    }

    async fn fail_job(&self, id: &str, error: &str) -> Result<()> {
        self.with_job(id, |job| {
            if job.status == JobStatus::Running {
                job.status = JobStatus::Failed;
                job.error = Some(error.to_string());
                job.finished_at = Some(Utc::now());
            }
        });
        Ok(())
    }

    async fn cancel_job(&self, id: &str) -> Result<()> {
        self.with_job(id, |job| {
            if !matches!(job.status, JobStatus::Completed | JobStatus::Failed) {
                job.status = JobStatus::Cancelled;
                job.finished_at.get_or_insert_with(Utc::now);
            }
        });
        Ok(())
    }

    async fn request_cancel(&self, id: &str) -> Result<bool> {
        match self.with_job(id, |job| {
            if job.status.is_terminal() {
                return false;
            }
            if job.status == JobStatus::Pending {
                job.finished_at = Some(Utc::now());
            }
            job.status = JobStatus::Cancelled;
            true
        }) {
            Some(changed) => Ok(changed),
            None => bail!("Job not found: {}", id),
        }
    }

    async fn append_log(&self, id: &str, level: &str, message: &str) -> Result<()> {
        self.logs.write().unwrap().push(JobLogLine {
            job_id: id.to_string(),
            level: level.to_string(),
            message: message.to_string(),
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn job_logs(&self, id: &str) -> Result<Vec<JobLogLine>> {
        let logs = self.logs.read().unwrap();
        Ok(logs.iter().filter(|l| l.job_id == id).cloned().collect())
    }

    async fn cancel_all_running(&self) -> Result<u64> {
        let mut jobs = self.jobs.write().unwrap();
        let mut count = 0;
        for job in jobs.iter_mut().filter(|j| j.status == JobStatus::Running) {
            job.status = JobStatus::Cancelled;
            job.error = Some("Worker restarted while job was running".to_string());
            job.finished_at = Some(Utc::now());
            count += 1;
        }
        Ok(count)
    }

    async fn is_cancelled(&self, id: &str) -> Result<bool> {
        let jobs = self.jobs.read().unwrap();
        Ok(jobs
            .iter()
            .find(|j| j.id == id)
            .map(|j| j.status == JobStatus::Cancelled)
            .unwrap_or(false))
    }
}

// ============ Sources ============

pub struct InMemorySourceStore {
    sources: RwLock<Vec<Source>>,
}

impl InMemorySourceStore {
    pub fn new() -> Self {
        Self {
            sources: RwLock::new(Vec::new()),
        }
    }
}

impl Default for InMemorySourceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SourceStore for InMemorySourceStore {
    async fn create_source(&self, new: NewSource) -> Result<Source> {
        let mut sources = self.sources.write().unwrap();
        if sources.iter().any(|s| s.name == new.name) {
            bail!("Source '{}' already exists", new.name);
        }
        let source = Source {
            id: Uuid::new_v4().to_string(),
            name: new.name,
            kind: new.kind,
            location: new.location,
            branch: new.branch,
            index_status: SubjectStatus::Pending,
            snippet_status: SubjectStatus::Pending,
            wiki_status: SubjectStatus::Pending,
            created_at: Utc::now(),
        };
        sources.push(source.clone());
        Ok(source)
    }

    async fn get_source(&self, id: &str) -> Result<Option<Source>> {
        let sources = self.sources.read().unwrap();
        Ok(sources.iter().find(|s| s.id == id).cloned())
    }

    async fn find_source_by_name(&self, name: &str) -> Result<Option<Source>> {
        let sources = self.sources.read().unwrap();
        Ok(sources.iter().find(|s| s.name == name).cloned())
    }

    async fn list_sources(&self) -> Result<Vec<Source>> {
        let mut sources = self.sources.read().unwrap().clone();
        sources.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(sources)
    }

    async fn set_status(&self, id: &str, field: StatusField, status: SubjectStatus) -> Result<()> {
        let mut sources = self.sources.write().unwrap();
        match sources.iter_mut().find(|s| s.id == id) {
            Some(source) => {
                source.set_status(field, status);
                Ok(())
            }
            None => bail!("Source not found: {}", id),
        }
    }

    async fn remove_source(&self, id: &str) -> Result<bool> {
        let mut sources = self.sources.write().unwrap();
        let before = sources.len();
        sources.retain(|s| s.id != id);
        Ok(sources.len() < before)
    }

    async fn reset_running_statuses(&self) -> Result<u64> {
        let mut sources = self.sources.write().unwrap();
        let mut count = 0;
        for source in sources.iter_mut() {
            for field in StatusField::all() {
                if source.status(field) == SubjectStatus::Running {
                    source.set_status(field, SubjectStatus::Pending);
                    count += 1;
                }
            }
        }
        Ok(count)
    }
}

// ============ File metadata ============

/// Keyed by `(source_id, file_path)`.
pub struct InMemoryMetadataStore {
    files: RwLock<HashMap<(String, String), FileMetadata>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self {
            files: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.files.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryMetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn fingerprints(&self, source_id: &str) -> Result<HashMap<String, String>> {
        let files = self.files.read().unwrap();
        Ok(files
            .values()
            .filter(|m| m.source_id == source_id)
            .map(|m| (m.file_path.clone(), m.fingerprint.clone()))
            .collect())
    }

    async fn upsert_file(&self, metadata: &FileMetadata) -> Result<()> {
        let key = (metadata.source_id.clone(), metadata.file_path.clone());
        self.files.write().unwrap().insert(key, metadata.clone());
        Ok(())
    }

    async fn find_file(&self, source_id: &str, path: &str) -> Result<Option<FileMetadata>> {
        let files = self.files.read().unwrap();
        Ok(files
            .get(&(source_id.to_string(), path.to_string()))
            .cloned())
    }

    async fn delete_files(&self, source_id: &str, paths: &[String]) -> Result<u64> {
        let mut files = self.files.write().unwrap();
        let mut removed = 0;
        for path in paths {
            if files.remove(&(source_id.to_string(), path.clone())).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn delete_source(&self, source_id: &str) -> Result<u64> {
        let mut files = self.files.write().unwrap();
        let before = files.len();
        files.retain(|(sid, _), _| sid != source_id);
        Ok((before - files.len()) as u64)
    }
}

// ============ Vectors ============

pub struct InMemoryVectorStore {
    records: RwLock<HashMap<String, VectorRecord>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }

    /// All stored records for one file, for assertions.
    pub fn records_for_file(&self, source_id: &str, path: &str) -> Vec<VectorRecord> {
        let records = self.records.read().unwrap();
        records
            .values()
            .filter(|r| r.source_id() == Some(source_id) && r.file_path() == Some(path))
            .cloned()
            .collect()
    }
}

impl Default for InMemoryVectorStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert(&self, records: &[VectorRecord]) -> Result<()> {
        let mut stored = self.records.write().unwrap();
        for record in records {
            stored.insert(record.id.clone(), record.clone());
        }
        Ok(())
    }

    async fn delete_by_source_id(&self, source_id: &str) -> Result<u64> {
        let mut stored = self.records.write().unwrap();
        let before = stored.len();
        stored.retain(|_, r| r.source_id() != Some(source_id));
        Ok((before - stored.len()) as u64)
    }

    async fn delete_by_file_paths(&self, source_id: &str, paths: &[String]) -> Result<u64> {
        let mut stored = self.records.write().unwrap();
        let before = stored.len();
        stored.retain(|_, r| {
            !(r.source_id() == Some(source_id)
                && r.file_path().map_or(false, |p| paths.iter().any(|x| x == p)))
        });
        Ok((before - stored.len()) as u64)
    }

    async fn count(&self, source_id: &str) -> Result<u64> {
        let stored = self.records.read().unwrap();
        Ok(stored
            .values()
            .filter(|r| r.source_id() == Some(source_id))
            .count() as u64)
    }
}
