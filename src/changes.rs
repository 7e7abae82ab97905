//! Change detection against stored fingerprints.
//!
//! Every current path is read and hashed at most once. The collected files
//! are kept in the [`ChangeSet`] so the parse phase does not read them again.

use std::collections::{BTreeSet, HashMap};

use tracing::{debug, warn};

use crate::collector::FileCollector;
use crate::models::{ChangeStatus, CollectedFile, FileChangeRecord};

/// The four-way partition of a source's files for one run.
#[derive(Debug, Default)]
pub struct ChangeSet {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub removed: Vec<String>,
    pub unchanged: Vec<String>,
    files: HashMap<String, CollectedFile>,
}

impl ChangeSet {
    /// Treat every current path as added without reading anything. Stored
    /// paths that no longer exist are still reported as removed.
    pub fn forced(stored: &HashMap<String, String>, current: &[String]) -> Self {
        let present: BTreeSet<&str> = current.iter().map(String::as_str).collect();
        let mut removed: Vec<String> = stored
            .keys()
            .filter(|p| !present.contains(p.as_str()))
            .cloned()
            .collect();
        removed.sort();
        Self {
            added: current.to_vec(),
            removed,
            ..Self::default()
        }
    }

    /// Paths that need to be parsed, chunked, and stored, in order.
    pub fn to_process(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = self
            .added
            .iter()
            .chain(self.modified.iter())
            .map(String::as_str)
            .collect();
        paths.sort_unstable();
        paths
    }

    /// Take the already-read file for `path`, if the detector read it.
    pub fn take_file(&mut self, path: &str) -> Option<CollectedFile> {
        self.files.remove(path)
    }

    pub fn has_changes(&self) -> bool {
        !(self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty())
    }

    pub fn records(&self) -> Vec<FileChangeRecord> {
        let mut records = Vec::new();
        for (paths, status) in [
            (&self.added, ChangeStatus::Added),
            (&self.modified, ChangeStatus::Modified),
        ] {
            for path in paths {
                let file = self.files.get(path);
                records.push(FileChangeRecord {
                    path: path.clone(),
                    status,
                    fingerprint: file.map(|f| f.fingerprint.clone()),
                    size: file.map(|f| f.size),
                    language: file.map(|f| f.language),
                });
            }
        }
        for path in &self.removed {
            records.push(FileChangeRecord {
                path: path.clone(),
                status: ChangeStatus::Removed,
                fingerprint: None,
                size: None,
                language: None,
            });
        }
        records
    }
}

/// Classify `current` paths against `stored` fingerprints.
///
/// A path that cannot be read is dropped from every bucket; it is neither
/// re-indexed nor treated as removed.
pub fn detect_changes(
    collector: &FileCollector,
    stored: &HashMap<String, String>,
    current: &[String],
) -> ChangeSet {
    let mut set = ChangeSet::default();

    for path in current {
        let file = match collector.read_file(path) {
            Ok(file) => file,
            Err(e) => {
                warn!(file = %path, error = %e, "file became unreadable, skipping");
                continue;
            }
        };
        match stored.get(path) {
            None => {
                set.added.push(path.clone());
                set.files.insert(path.clone(), file);
            }
            Some(previous) if *previous != file.fingerprint => {
                set.modified.push(path.clone());
                set.files.insert(path.clone(), file);
            }
            Some(_) => set.unchanged.push(path.clone()),
        }
    }

    let present: BTreeSet<&str> = current.iter().map(String::as_str).collect();
    set.removed = stored
        .keys()
        .filter(|p| !present.contains(p.as_str()))
        .cloned()
        .collect();
    set.removed.sort();

    debug!(
        added = set.added.len(),
        modified = set.modified.len(),
        removed = set.removed.len(),
        unchanged = set.unchanged.len(),
        "change detection complete"
    );
    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::fingerprint;
    use crate::filter::PathFilter;
    use std::fs;
    use tempfile::TempDir;

    fn setup() -> (TempDir, FileCollector) {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.py"), "def a(): pass\n").unwrap();
        fs::write(tmp.path().join("b.py"), "def b(): pass\n").unwrap();
        fs::write(tmp.path().join("c.py"), "def c(): return 2\n").unwrap();
        let collector = FileCollector::new(tmp.path(), PathFilter::builtin().unwrap());
        (tmp, collector)
    }

    #[test]
    fn test_four_way_partition() {
        let (_tmp, collector) = setup();
        let mut stored = HashMap::new();
        stored.insert("b.py".to_string(), fingerprint(b"def b(): pass\n"));
        stored.insert("c.py".to_string(), fingerprint(b"def c(): return 1\n"));
        stored.insert("gone.py".to_string(), "deadbeef".to_string());

        let current = collector.list_paths().unwrap();
        let mut set = detect_changes(&collector, &stored, &current);

        assert_eq!(set.added, vec!["a.py"]);
        assert_eq!(set.modified, vec!["c.py"]);
        assert_eq!(set.unchanged, vec!["b.py"]);
        assert_eq!(set.removed, vec!["gone.py"]);

        let mut all: Vec<&String> = set
            .added
            .iter()
            .chain(&set.modified)
            .chain(&set.unchanged)
            .chain(&set.removed)
            .collect();
        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), total);

        // content for changed files is already in hand; unchanged is not kept
        assert!(set.take_file("a.py").is_some());
        assert!(set.take_file("b.py").is_none());
    }

    #[test]
    fn test_records_for_removed_have_no_fingerprint() {
        let (_tmp, collector) = setup();
        let mut stored = HashMap::new();
        stored.insert("old.rs".to_string(), "x".to_string());
        let current = collector.list_paths().unwrap();
        let set = detect_changes(&collector, &stored, &current);
        let removed: Vec<_> = set
            .records()
            .into_iter()
            .filter(|r| r.status == ChangeStatus::Removed)
            .collect();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].fingerprint, None);
        assert_eq!(removed[0].language, None);
    }

    #[test]
    fn test_forced_marks_all_added() {
        let mut stored = HashMap::new();
        stored.insert("a.py".to_string(), "x".to_string());
        stored.insert("gone.py".to_string(), "y".to_string());
        let current = vec!["a.py".to_string(), "b.py".to_string()];
        let set = ChangeSet::forced(&stored, &current);
        assert_eq!(set.added, current);
        assert!(set.modified.is_empty());
        assert_eq!(set.removed, vec!["gone.py"]);
        assert!(set.has_changes());
    }

    #[test]
    fn test_no_changes() {
        let (_tmp, collector) = setup();
        let current = collector.list_paths().unwrap();
        let stored: HashMap<String, String> = collector
            .collect_paths(&current)
            .into_iter()
            .map(|f| (f.relative_path, f.fingerprint))
            .collect();
        let set = detect_changes(&collector, &stored, &current);
        assert!(!set.has_changes());
        assert_eq!(set.unchanged.len(), 3);
    }
}
