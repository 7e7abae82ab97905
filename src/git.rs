//! Git-backed [`RepositoryFetcher`].
//!
//! Local sources resolve to their directory as-is. Remote sources are cloned
//! once into `<checkout_dir>/<name>-<url hash>` and updated in place with
//! `git fetch` + `git reset --hard` on later checkouts.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::process::Command;
use tracing::{debug, info};

use crate::models::{Source, SourceKind};
use crate::traits::RepositoryFetcher;

pub struct GitFetcher {
    checkout_dir: PathBuf,
    shallow: bool,
}

impl GitFetcher {
    pub fn new(checkout_dir: impl Into<PathBuf>) -> Self {
        Self {
            checkout_dir: checkout_dir.into(),
            shallow: true,
        }
    }

    pub fn shallow(mut self, shallow: bool) -> Self {
        self.shallow = shallow;
        self
    }

    /// Where a remote source lives on disk.
    pub fn checkout_path(&self, source: &Source) -> PathBuf {
        let name: String = source
            .name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.checkout_dir
            .join(format!("{}-{}", name, short_hash(&source.location)))
    }

    async fn clone_repo(&self, url: &str, branch: Option<&str>, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.with_context(|| {
                format!("Failed to create checkout directory: {}", parent.display())
            })?;
        }

        let mut cmd = Command::new("git");
        cmd.arg("clone");
        if let Some(branch) = branch {
            cmd.args(["--branch", branch, "--single-branch"]);
        }
        if self.shallow {
            cmd.args(["--depth", "1"]);
        }
        cmd.arg(url).arg(dest);
        run_git(cmd, "clone").await
    }

    async fn update_repo(&self, repo_dir: &Path, branch: Option<&str>) -> Result<()> {
        let mut fetch = Command::new("git");
        fetch.arg("fetch");
        if self.shallow {
            fetch.args(["--depth", "1"]);
        }
        fetch.arg("origin");
        if let Some(branch) = branch {
            fetch.arg(branch);
        }
        fetch.current_dir(repo_dir);
        run_git(fetch, "fetch").await?;

        let target = match branch {
            Some(branch) => format!("origin/{}", branch),
            None => "FETCH_HEAD".to_string(),
        };
        let mut reset = Command::new("git");
        reset
            .args(["reset", "--hard", &target])
            .current_dir(repo_dir);
        run_git(reset, "reset").await
    }
}

#[async_trait]
impl RepositoryFetcher for GitFetcher {
    async fn checkout(&self, source: &Source) -> Result<PathBuf> {
        match source.kind {
            SourceKind::Local => {
                let path = PathBuf::from(&source.location);
                if !path.is_dir() {
                    bail!("Source path does not exist: {}", path.display());
                }
                Ok(path)
            }
            SourceKind::Remote => {
                let dest = self.checkout_path(source);
                let branch = source.branch.as_deref();
                if dest.join(".git").exists() {
                    debug!(source = %source.name, path = %dest.display(), "updating checkout");
                    self.update_repo(&dest, branch).await?;
                } else {
                    info!(source = %source.name, url = %source.location, "cloning");
                    self.clone_repo(&source.location, branch, &dest).await?;
                }
                Ok(dest)
            }
        }
    }
}

async fn run_git(mut cmd: Command, action: &str) -> Result<()> {
    let output = cmd
        .output()
        .await
        .with_context(|| format!("Failed to execute 'git {}'. Is git installed?", action))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("git {} failed: {}", action, stderr.trim());
    }
    Ok(())
}

fn short_hash(s: &str) -> String {
    let digest = Sha256::digest(s.as_bytes());
    hex::encode(&digest[..6])
}
