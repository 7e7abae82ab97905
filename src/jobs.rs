use anyhow::{bail, Result};

use crate::config::Config;
use crate::models::{JobStatus, JobType, NewJob};
use crate::sources::resolve_source;
use crate::sqlite_store::SqliteStore;
use crate::traits::JobStore;

pub async fn enqueue_job(config: &Config, source: &str, job_type: JobType) -> Result<()> {
    let store = SqliteStore::open(config).await?;
    let source = resolve_source(&store, source).await?;
    let job = store
        .create_job(NewJob {
            source_id: source.id.clone(),
            source_kind: source.kind,
            job_type,
        })
        .await?;
    println!("{}", job.id);
    Ok(())
}

pub async fn cancel_job(config: &Config, id: &str) -> Result<()> {
    let store = SqliteStore::open(config).await?;
    if store.request_cancel(id).await? {
        println!("Cancellation requested for job {}", id);
        return Ok(());
    }
    match store.get_job(id).await? {
        Some(job) => bail!("Job {} is already {}", id, job.status.as_str()),
        None => bail!("Job not found: {}", id),
    }
}

pub async fn list_jobs(config: &Config, status: Option<JobStatus>, limit: usize) -> Result<()> {
    let store = SqliteStore::open(config).await?;
    let jobs = store.list_jobs(status, limit).await?;
    if jobs.is_empty() {
        println!("No jobs.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<16} {:<9} {:<20} {:<19}",
        "ID", "TYPE", "STATUS", "PROGRESS", "CREATED"
    );
    for job in jobs {
        let progress = match &job.progress.phase {
            Some(phase) => format!("{} {}/{}", phase, job.progress.current, job.progress.total),
            None => "-".to_string(),
        };
        println!(
            "{:<36}  {:<16} {:<9} {:<20} {:<19}",
            job.id,
            job.job_type.as_str(),
            job.status.as_str(),
            progress,
            job.created_at.format("%Y-%m-%d %H:%M:%S")
        );
        if let Some(error) = &job.error {
            println!("    error: {}", error);
        }
    }
    Ok(())
}

pub async fn show_logs(config: &Config, id: &str) -> Result<()> {
    let store = SqliteStore::open(config).await?;
    if store.get_job(id).await?.is_none() {
        bail!("Job not found: {}", id);
    }
    for line in store.job_logs(id).await? {
        println!(
            "{} {:<5} {}",
            line.created_at.format("%Y-%m-%d %H:%M:%S"),
            line.level.to_uppercase(),
            line.message
        );
    }
    Ok(())
}
