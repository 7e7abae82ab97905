//! Filesystem walk and content fingerprinting.
//!
//! The collector walks a source root with `walkdir`, pruning directories the
//! [`PathFilter`] rejects before descending into them. Listing is cheap (no
//! content reads); collecting reads content, stats, and computes a SHA-256
//! fingerprint of the raw bytes.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::IndexError;
use crate::filter::PathFilter;
use crate::models::CollectedFile;

/// SHA-256 hex digest of `bytes`.
pub fn fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

pub struct FileCollector {
    root: PathBuf,
    filter: PathFilter,
    follow_symlinks: bool,
}

impl FileCollector {
    pub fn new(root: impl Into<PathBuf>, filter: PathFilter) -> Self {
        Self {
            root: root.into(),
            filter,
            follow_symlinks: false,
        }
    }

    pub fn follow_symlinks(mut self, follow: bool) -> Self {
        self.follow_symlinks = follow;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn filter(&self) -> &PathFilter {
        &self.filter
    }

    /// Fail early when the root is missing or cannot be listed.
    pub fn check_root(&self) -> Result<(), IndexError> {
        if !self.root.exists() {
            return Err(IndexError::MissingRoot(self.root.clone()));
        }
        std::fs::read_dir(&self.root).map_err(|source| IndexError::UnreadableRoot {
            path: self.root.clone(),
            source,
        })?;
        Ok(())
    }

    /// Eligible relative paths under the root, sorted. Reads no content.
    pub fn list_paths(&self) -> Result<Vec<String>, IndexError> {
        self.check_root()?;

        let root = &self.root;
        let filter = &self.filter;
        let walker = WalkDir::new(root)
            .follow_links(self.follow_symlinks)
            .into_iter()
            .filter_entry(|entry| {
                if entry.depth() == 0 || !entry.file_type().is_dir() {
                    return true;
                }
                filter.allows_dir(&relative_str(root, entry.path()))
            });

        let mut paths = Vec::new();
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = relative_str(root, entry.path());
            if filter.is_eligible(&rel) {
                paths.push(rel);
            }
        }

        paths.sort();
        Ok(paths)
    }

    /// Read and fingerprint the given relative paths. Unreadable or
    /// non-UTF-8 files are logged and left out.
    pub fn collect_paths(&self, paths: &[String]) -> Vec<CollectedFile> {
        let mut files: Vec<CollectedFile> = paths
            .iter()
            .filter_map(|rel| match self.read_file(rel) {
                Ok(file) => Some(file),
                Err(e) => {
                    warn!(file = %rel, error = %e, "skipping unreadable file");
                    None
                }
            })
            .collect();
        files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        files
    }

    /// List and read every eligible file.
    pub fn collect(&self) -> Result<Vec<CollectedFile>, IndexError> {
        let paths = self.list_paths()?;
        Ok(self.collect_paths(&paths))
    }

    /// Read one file relative to the root.
    pub fn read_file(&self, rel_path: &str) -> anyhow::Result<CollectedFile> {
        let language = self
            .filter
            .language_for(rel_path)
            .ok_or_else(|| anyhow::anyhow!("not an indexable path"))?;
        let absolute_path = self.root.join(rel_path);
        let bytes = std::fs::read(&absolute_path)?;
        let metadata = std::fs::metadata(&absolute_path)?;
        let modified_at: DateTime<Utc> = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        let fingerprint = fingerprint(&bytes);
        let size = bytes.len() as u64;
        let content = String::from_utf8(bytes)
            .map_err(|_| anyhow::anyhow!("file is not valid UTF-8"))?;

        debug!(file = %rel_path, size, "collected");
        Ok(CollectedFile {
            relative_path: rel_path.to_string(),
            absolute_path,
            content,
            size,
            language,
            modified_at,
            fingerprint,
        })
    }
}

fn relative_str(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
