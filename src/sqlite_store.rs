//! SQLite-backed implementation of every store trait.
//!
//! One [`SqliteStore`] wraps a shared `SqlitePool` and serves as the
//! [`JobStore`], [`SourceStore`], [`MetadataStore`], and [`VectorStore`]
//! for the CLI and the worker. Timestamps are stored as unix milliseconds.
//! Job claims and cancel requests are single conditional `UPDATE`s, so two
//! workers sharing one database never run the same job.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::config::Config;
use crate::db;
use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::migrate;
use crate::models::{
    FileMetadata, Job, JobLogLine, JobProgress, JobStatus, NewJob, NewSource, Source,
    StatusField, SubjectStatus, VectorRecord,
};
use crate::traits::{JobStore, MetadataStore, SourceStore, VectorStore};

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to the configured database and bring the schema up to date.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::migrate_pool(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Stored vector for one chunk id.
    pub async fn get_vector(&self, id: &str) -> Result<Option<VectorRecord>> {
        let row = sqlx::query("SELECT id, vector, payload_json FROM chunk_vectors WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| -> Result<VectorRecord> {
            let blob: Vec<u8> = row.get("vector");
            let payload: String = row.get("payload_json");
            Ok(VectorRecord {
                id: row.get("id"),
                vector: blob_to_vec(&blob),
                payload: serde_json::from_str(&payload)?,
            })
        })
        .transpose()
    }
}

fn millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}

fn job_from_row(row: &SqliteRow) -> Result<Job> {
    let source_kind: String = row.get("source_kind");
    let job_type: String = row.get("job_type");
    let status: String = row.get("status");
    let current: i64 = row.get("progress_current");
    let total: i64 = row.get("progress_total");
    let created_at: i64 = row.get("created_at");
    let started_at: Option<i64> = row.get("started_at");
    let finished_at: Option<i64> = row.get("finished_at");

    Ok(Job {
        id: row.get("id"),
        source_id: row.get("source_id"),
        source_kind: source_kind.parse()?,
        job_type: job_type.parse()?,
        status: status.parse()?,
        progress: JobProgress {
            phase: row.get("progress_phase"),
            current: current.max(0) as u64,
            total: total.max(0) as u64,
        },
        error: row.get("error"),
        result_json: row.get("result_json"),
        created_at: from_millis(created_at),
        started_at: started_at.map(from_millis),
        finished_at: finished_at.map(from_millis),
    })
}

fn source_from_row(row: &SqliteRow) -> Result<Source> {
    let kind: String = row.get("kind");
    let index_status: String = row.get("index_status");
    let snippet_status: String = row.get("snippet_status");
    let wiki_status: String = row.get("wiki_status");
    let created_at: i64 = row.get("created_at");

    Ok(Source {
        id: row.get("id"),
        name: row.get("name"),
        kind: kind.parse()?,
        location: row.get("location"),
        branch: row.get("branch"),
        index_status: index_status.parse()?,
        snippet_status: snippet_status.parse()?,
        wiki_status: wiki_status.parse()?,
        created_at: from_millis(created_at),
    })
}

fn metadata_from_row(row: &SqliteRow) -> FileMetadata {
    let size: i64 = row.get("size");
    let chunk_count: i64 = row.get("chunk_count");
    let has_summary: i64 = row.get("has_summary");
    let indexed_at: i64 = row.get("indexed_at");
    FileMetadata {
        source_id: row.get("source_id"),
        file_path: row.get("file_path"),
        fingerprint: row.get("fingerprint"),
        size: size.max(0) as u64,
        language: row.get("language"),
        chunk_count: chunk_count.max(0) as u64,
        has_summary: has_summary != 0,
        indexed_at: from_millis(indexed_at),
    }
}

const JOB_COLUMNS: &str = "id, source_id, source_kind, job_type, status, progress_phase, \
     progress_current, progress_total, error, result_json, created_at, started_at, finished_at";

// ============ Jobs ============

#[async_trait]
impl JobStore for SqliteStore {
    async fn create_job(&self, new: NewJob) -> Result<Job> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO jobs (id, source_id, source_kind, job_type, status, created_at)
             VALUES (?, ?, ?, ?, 'PENDING', ?)",
        )
        .bind(&id)
        .bind(&new.source_id)
        .bind(new.source_kind.as_str())
        .bind(new.job_type.as_str())
        .bind(millis(now))
        .execute(&self.pool)
        .await
        .context("Failed to create job")?;

        self.get_job(&id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Job vanished after insert: {}", id))
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn list_jobs(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>> {
        let rows = match status {
            Some(status) => {
                sqlx::query(&format!(
                    "SELECT {} FROM jobs WHERE status = ?
                     ORDER BY created_at DESC, rowid DESC LIMIT ?",
                    JOB_COLUMNS
                ))
                .bind(status.as_str())
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {} FROM jobs ORDER BY created_at DESC, rowid DESC LIMIT ?",
                    JOB_COLUMNS
                ))
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(job_from_row).collect()
    }

    async fn list_pending(&self, limit: usize, exclude: &[String]) -> Result<Vec<Job>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(&format!(
            "SELECT {} FROM jobs WHERE status = 'PENDING'
             ORDER BY created_at ASC, rowid ASC LIMIT ?",
            JOB_COLUMNS
        ))
        .bind((limit + exclude.len()) as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut jobs = Vec::new();
        for row in &rows {
            let job = job_from_row(row)?;
            if !exclude.contains(&job.id) {
                jobs.push(job);
            }
            if jobs.len() == limit {
                break;
            }
        }
        Ok(jobs)
    }

    async fn try_claim(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'RUNNING', started_at = ?
             WHERE id = ? AND status = 'PENDING'",
        )
        .bind(millis(Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn update_progress(&self, id: &str, progress: &JobProgress) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET progress_phase = ?, progress_current = ?, progress_total = ?
             WHERE id = ?",
        )
        .bind(&progress.phase)
        .bind(progress.current as i64)
        .bind(progress.total as i64)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete_job(&self, id: &str, result_json: &str) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET status = 'COMPLETED', result_json = ?, finished_at = ?
             WHERE id = ? AND status = 'RUNNING'",
        )
        .bind(result_json)
        .bind(millis(Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail_job(&self, id: &str, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET status = 'FAILED', error = ?, finished_at = ?
             WHERE id = ? AND status = 'RUNNING'",
        )
        .bind(error)
        .bind(millis(Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn cancel_job(&self, id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET status = 'CANCELLED', finished_at = COALESCE(finished_at, ?)
             WHERE id = ? AND status NOT IN ('COMPLETED', 'FAILED')",
        )
        .bind(millis(Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn request_cancel(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'CANCELLED',
                 finished_at = CASE WHEN status = 'PENDING' THEN ? ELSE finished_at END
             WHERE id = ? AND status IN ('PENDING', 'RUNNING')",
        )
        .bind(millis(Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 1 {
            return Ok(true);
        }
        if self.get_job(id).await?.is_none() {
            bail!("Job not found: {}", id);
        }
        Ok(false)
    }

    async fn append_log(&self, id: &str, level: &str, message: &str) -> Result<()> {
        sqlx::query("INSERT INTO job_logs (job_id, level, message, created_at) VALUES (?, ?, ?, ?)")
            .bind(id)
            .bind(level)
            .bind(message)
            .bind(millis(Utc::now()))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn job_logs(&self, id: &str) -> Result<Vec<JobLogLine>> {
        let rows = sqlx::query(
            "SELECT job_id, level, message, created_at FROM job_logs
             WHERE job_id = ? ORDER BY id ASC",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| {
                let created_at: i64 = row.get("created_at");
                JobLogLine {
                    job_id: row.get("job_id"),
                    level: row.get("level"),
                    message: row.get("message"),
                    created_at: from_millis(created_at),
                }
            })
            .collect())
    }

    async fn cancel_all_running(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'CANCELLED', finished_at = ?,
                 error = 'Worker restarted while job was running'
             WHERE status = 'RUNNING'",
        )
        .bind(millis(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn is_cancelled(&self, id: &str) -> Result<bool> {
        let status: Option<String> = sqlx::query_scalar("SELECT status FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(status.as_deref() == Some(JobStatus::Cancelled.as_str()))
    }
}

// ============ Sources ============

#[async_trait]
impl SourceStore for SqliteStore {
    async fn create_source(&self, new: NewSource) -> Result<Source> {
        if self.find_source_by_name(&new.name).await?.is_some() {
            bail!("Source '{}' already exists", new.name);
        }
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO sources (id, name, kind, location, branch, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&new.name)
        .bind(new.kind.as_str())
        .bind(&new.location)
        .bind(&new.branch)
        .bind(millis(Utc::now()))
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to create source '{}'", new.name))?;

        self.get_source(&id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Source vanished after insert: {}", id))
    }

    async fn get_source(&self, id: &str) -> Result<Option<Source>> {
        let row = sqlx::query("SELECT * FROM sources WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(source_from_row).transpose()
    }

    async fn find_source_by_name(&self, name: &str) -> Result<Option<Source>> {
        let row = sqlx::query("SELECT * FROM sources WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(source_from_row).transpose()
    }

    async fn list_sources(&self) -> Result<Vec<Source>> {
        let rows = sqlx::query("SELECT * FROM sources ORDER BY name ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(source_from_row).collect()
    }

    async fn set_status(&self, id: &str, field: StatusField, status: SubjectStatus) -> Result<()> {
        // Column names come from a closed enum, never from input.
        let result = sqlx::query(&format!("UPDATE sources SET {} = ? WHERE id = ?", field.column()))
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            bail!("Source not found: {}", id);
        }
        Ok(())
    }

    async fn remove_source(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM sources WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn reset_running_statuses(&self) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut count = 0;
        for field in StatusField::all() {
            let column = field.column();
            let result = sqlx::query(&format!(
                "UPDATE sources SET {} = 'pending' WHERE {} = 'running'",
                column, column
            ))
            .execute(&mut *tx)
            .await?;
            count += result.rows_affected();
        }
        tx.commit().await?;
        Ok(count)
    }
}

// ============ File metadata ============

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn fingerprints(&self, source_id: &str) -> Result<HashMap<String, String>> {
        let rows = sqlx::query("SELECT file_path, fingerprint FROM file_metadata WHERE source_id = ?")
            .bind(source_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| {
                (
                    row.get::<String, _>("file_path"),
                    row.get::<String, _>("fingerprint"),
                )
            })
            .collect())
    }

    async fn upsert_file(&self, metadata: &FileMetadata) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO file_metadata
                (source_id, file_path, fingerprint, size, language, chunk_count, has_summary, indexed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(source_id, file_path) DO UPDATE SET
                fingerprint = excluded.fingerprint,
                size = excluded.size,
                language = excluded.language,
                chunk_count = excluded.chunk_count,
                has_summary = excluded.has_summary,
                indexed_at = excluded.indexed_at
            "#,
        )
        .bind(&metadata.source_id)
        .bind(&metadata.file_path)
        .bind(&metadata.fingerprint)
        .bind(metadata.size as i64)
        .bind(&metadata.language)
        .bind(metadata.chunk_count as i64)
        .bind(metadata.has_summary as i64)
        .bind(millis(metadata.indexed_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_file(&self, source_id: &str, path: &str) -> Result<Option<FileMetadata>> {
        let row = sqlx::query("SELECT * FROM file_metadata WHERE source_id = ? AND file_path = ?")
            .bind(source_id)
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(metadata_from_row))
    }

    async fn delete_files(&self, source_id: &str, paths: &[String]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut removed = 0;
        for path in paths {
            let result =
                sqlx::query("DELETE FROM file_metadata WHERE source_id = ? AND file_path = ?")
                    .bind(source_id)
                    .bind(path)
                    .execute(&mut *tx)
                    .await?;
            removed += result.rows_affected();
        }
        tx.commit().await?;
        Ok(removed)
    }

    async fn delete_source(&self, source_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM file_metadata WHERE source_id = ?")
            .bind(source_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

// ============ Vectors ============

#[async_trait]
impl VectorStore for SqliteStore {
    async fn upsert(&self, records: &[VectorRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            let source_id = record
                .source_id()
                .ok_or_else(|| anyhow::anyhow!("Vector {} has no source_id", record.id))?;
            let file_path = record
                .file_path()
                .ok_or_else(|| anyhow::anyhow!("Vector {} has no file_path", record.id))?;
            sqlx::query(
                r#"
                INSERT INTO chunk_vectors (id, source_id, file_path, dims, vector, payload_json)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    source_id = excluded.source_id,
                    file_path = excluded.file_path,
                    dims = excluded.dims,
                    vector = excluded.vector,
                    payload_json = excluded.payload_json
                "#,
            )
            .bind(&record.id)
            .bind(source_id)
            .bind(file_path)
            .bind(record.vector.len() as i64)
            .bind(vec_to_blob(&record.vector))
            .bind(record.payload.to_string())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete_by_source_id(&self, source_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM chunk_vectors WHERE source_id = ?")
            .bind(source_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_by_file_paths(&self, source_id: &str, paths: &[String]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut removed = 0;
        for path in paths {
            let result =
                sqlx::query("DELETE FROM chunk_vectors WHERE source_id = ? AND file_path = ?")
                    .bind(source_id)
                    .bind(path)
                    .execute(&mut *tx)
                    .await?;
            removed += result.rows_affected();
        }
        tx.commit().await?;
        Ok(removed)
    }

    async fn count(&self, source_id: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors WHERE source_id = ?")
            .bind(source_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}
