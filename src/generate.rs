//! Snippet and wiki generation drivers.
//!
//! Both delegate the actual writing to collaborator traits. The wiki driver
//! fans pages out under a [`ConcurrencyLimiter`], retries transient
//! failures per page, and keeps one page's failure from sinking the rest.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Result};
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{is_cancellation, Cancelled};
use crate::limiter::ConcurrencyLimiter;
use crate::models::Source;
use crate::retry::{with_retry, RetryPolicy};
use crate::traits::{SnippetGenerator, WikiGenerator, WikiPage};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SnippetResult {
    pub snippets_generated: u64,
}

pub async fn generate_snippets(
    generator: &dyn SnippetGenerator,
    source: &Source,
    root: &Path,
    cancel: &CancellationToken,
) -> Result<SnippetResult> {
    if cancel.is_cancelled() {
        return Err(Cancelled.into());
    }
    let snippets_generated = generator.generate(source, root, cancel).await?;
    info!(source = %source.name, snippets_generated, "snippets generated");
    Ok(SnippetResult { snippets_generated })
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WikiResult {
    pub pages_generated: u64,
    pub pages_failed: u64,
    pub errors: Vec<String>,
}

enum PageOutcome {
    Generated,
    Failed(String),
    Skipped,
}

pub struct WikiDriver {
    generator: Arc<dyn WikiGenerator>,
    limiter: ConcurrencyLimiter,
    policy: RetryPolicy,
}

impl WikiDriver {
    pub fn new(generator: Arc<dyn WikiGenerator>, concurrency: usize, policy: RetryPolicy) -> Self {
        Self {
            generator,
            limiter: ConcurrencyLimiter::new(concurrency),
            policy,
        }
    }

    /// Plan and write every page for `source`.
    ///
    /// Returns [`Cancelled`] if the token fired before all pages finished,
    /// and an error if every planned page failed.
    pub async fn generate(
        &self,
        source: &Source,
        root: &Path,
        cancel: &CancellationToken,
    ) -> Result<WikiResult> {
        if cancel.is_cancelled() {
            return Err(Cancelled.into());
        }
        let pages = self.generator.plan_pages(source, root).await?;
        info!(source = %source.name, pages = pages.len(), "wiki pages planned");

        let mut tasks = JoinSet::new();
        for (index, page) in pages.iter().cloned().enumerate() {
            let generator = self.generator.clone();
            let limiter = self.limiter.clone();
            let policy = self.policy.clone();
            let source = source.clone();
            let root: PathBuf = root.to_path_buf();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let outcome = limiter
                    .run(generate_page(&*generator, &policy, &source, &root, &page, &cancel))
                    .await;
                (index, outcome)
            });
        }

        let mut outcomes = Vec::with_capacity(pages.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(entry) => outcomes.push(entry),
                Err(e) => bail!("Wiki page task failed: {}", e),
            }
        }
        outcomes.sort_by_key(|(index, _)| *index);

        if cancel.is_cancelled() {
            return Err(Cancelled.into());
        }

        let mut result = WikiResult::default();
        for (_, outcome) in outcomes {
            match outcome {
                PageOutcome::Generated => result.pages_generated += 1,
                PageOutcome::Failed(message) => {
                    result.pages_failed += 1;
                    result.errors.push(message);
                }
                PageOutcome::Skipped => {}
            }
        }

        if !pages.is_empty() && result.pages_failed == pages.len() as u64 {
            bail!(
                "All {} wiki pages failed: {}",
                pages.len(),
                result.errors.join("; ")
            );
        }
        info!(
            source = %source.name,
            generated = result.pages_generated,
            failed = result.pages_failed,
            "wiki generated"
        );
        Ok(result)
    }
}

async fn generate_page(
    generator: &dyn WikiGenerator,
    policy: &RetryPolicy,
    source: &Source,
    root: &Path,
    page: &WikiPage,
    cancel: &CancellationToken,
) -> PageOutcome {
    if cancel.is_cancelled() {
        return PageOutcome::Skipped;
    }
    let attempt = with_retry(
        policy,
        || generator.generate_page(source, root, page, cancel),
        None,
    )
    .await;
    match attempt {
        Ok(()) => PageOutcome::Generated,
        Err(e) if is_cancellation(&e) => PageOutcome::Skipped,
        Err(e) => {
            warn!(page = %page.slug, error = %format!("{:#}", e), "wiki page failed");
            PageOutcome::Failed(format!("{}: {:#}", page.slug, e))
        }
    }
}
