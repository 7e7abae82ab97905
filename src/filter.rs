//! Path eligibility rules.
//!
//! A [`PathFilter`] answers one question: should this file be indexed? It
//! combines, in order:
//!
//! 1. gitignore rules: a built-in exclude list, then the root's ignore files,
//! 2. the extension allow-list in [`Language`],
//! 3. caller include globs (at least one must match, when given),
//! 4. caller exclude globs.
//!
//! Include and exclude globs are compiled with `literal_separator`, so `*`
//! stays inside one path segment and `**` spans any depth.

use std::path::Path;

use globset::{Glob, GlobBuilder, GlobSet, GlobSetBuilder};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use tracing::debug;

use crate::error::IndexError;
use crate::language::Language;

/// Directories, build output, VCS metadata, lockfiles, and editor/OS debris.
const BUILTIN_EXCLUDES: &[&str] = &[
    "node_modules/",
    "bower_components/",
    "vendor/",
    ".venv/",
    "venv/",
    "__pycache__/",
    "site-packages/",
    "target/",
    "dist/",
    "build/",
    "out/",
    ".next/",
    ".nuxt/",
    "coverage/",
    ".git/",
    ".hg/",
    ".svn/",
    ".idea/",
    ".vscode/",
    "*.min.js",
    "*.map",
    "*.d.ts",
    "package-lock.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    "Cargo.lock",
    "poetry.lock",
    "Pipfile.lock",
    ".DS_Store",
    "Thumbs.db",
    "*.swp",
    "*~",
];

/// Compile the built-in excludes followed by the lines of each ignore file
/// found under `root`. Later lines override earlier ones.
fn build_ignore(root: &Path, ignore_files: &[String]) -> Result<Gitignore, IndexError> {
    let mut builder = GitignoreBuilder::new(root);
    for line in BUILTIN_EXCLUDES {
        builder.add_line(None, line)?;
    }
    for name in ignore_files {
        let path = root.join(name);
        match std::fs::read_to_string(&path) {
            Ok(text) => {
                debug!(file = %path.display(), "loaded ignore rules");
                for line in text.lines() {
                    builder.add_line(Some(path.clone()), line)?;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => debug!(file = %path.display(), error = %e, "skipping unreadable ignore file"),
        }
    }
    Ok(builder.build()?)
}

fn literal_glob(pattern: &str) -> Result<Glob, globset::Error> {
    GlobBuilder::new(pattern).literal_separator(true).build()
}

fn build_globset(patterns: &[String]) -> Result<Option<GlobSet>, IndexError> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(literal_glob(pattern)?);
    }
    Ok(Some(builder.build()?))
}

/// Decides which files under a root are eligible for indexing.
#[derive(Debug)]
pub struct PathFilter {
    ignore: Gitignore,
    include: Option<GlobSet>,
    exclude: Option<GlobSet>,
}

impl PathFilter {
    /// Build a filter for `root`, reading whichever of `ignore_files` exist.
    pub fn new(
        root: &Path,
        ignore_files: &[String],
        include: &[String],
        exclude: &[String],
    ) -> Result<Self, IndexError> {
        Ok(Self {
            ignore: build_ignore(root, ignore_files)?,
            include: build_globset(include)?,
            exclude: build_globset(exclude)?,
        })
    }

    /// A filter with only the built-in rules, for tests and ad hoc checks.
    pub fn builtin() -> Result<Self, IndexError> {
        Ok(Self {
            ignore: build_ignore(Path::new("."), &[])?,
            include: None,
            exclude: None,
        })
    }

    /// Whether a directory should be descended into during a walk.
    pub fn allows_dir(&self, rel_dir: &str) -> bool {
        if rel_dir.is_empty() {
            return true;
        }
        let dir = rel_dir.trim_end_matches('/');
        !self.is_ignored(dir, true)
    }

    fn is_ignored(&self, rel_path: &str, is_dir: bool) -> bool {
        self.ignore
            .matched_path_or_any_parents(rel_path, is_dir)
            .is_ignore()
    }

    /// Whether the file at `rel_path` (relative, `/`-separated) is eligible.
    pub fn is_eligible(&self, rel_path: &str) -> bool {
        self.language_for(rel_path).is_some()
    }

    /// The language tag for an eligible path, `None` when filtered out.
    pub fn language_for(&self, rel_path: &str) -> Option<Language> {
        if self.is_ignored(rel_path, false) {
            return None;
        }
        let language = Language::from_path(rel_path)?;
        if let Some(include) = &self.include {
            if !include.is_match(rel_path) {
                return None;
            }
        }
        if let Some(exclude) = &self.exclude {
            if exclude.is_match(rel_path) {
                return None;
            }
        }
        Some(language)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn filter_with(ignore: &str, include: &[&str], exclude: &[&str]) -> (TempDir, PathFilter) {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(".gitignore"), ignore).unwrap();
        let include: Vec<String> = include.iter().map(|s| s.to_string()).collect();
        let exclude: Vec<String> = exclude.iter().map(|s| s.to_string()).collect();
        let filter =
            PathFilter::new(tmp.path(), &[".gitignore".to_string()], &include, &exclude).unwrap();
        (tmp, filter)
    }

    #[test]
    fn test_builtin_excludes() {
        let filter = PathFilter::builtin().unwrap();
        assert!(filter.is_eligible("src/main.rs"));
        assert!(!filter.is_eligible("node_modules/react/index.js"));
        assert!(!filter.is_eligible("web/node_modules/x/y.ts"));
        assert!(!filter.is_eligible("target/debug/build.rs"));
        assert!(!filter.is_eligible(".git/hooks/pre-commit.py"));
        assert!(!filter.is_eligible("static/app.min.js"));
        assert!(!filter.is_eligible("types/index.d.ts"));
    }

    #[test]
    fn test_extension_allow_list() {
        let filter = PathFilter::builtin().unwrap();
        assert_eq!(filter.language_for("a/b.py"), Some(Language::Python));
        assert_eq!(filter.language_for("README.md"), None);
        assert_eq!(filter.language_for("Makefile"), None);
    }

    #[test]
    fn test_ignore_file_semantics() {
        let (_tmp, filter) = filter_with(
            "# generated\n/scripts/\ngen/\n*.test.ts\n!keep.test.ts\n",
            &[],
            &[],
        );
        // anchored directory
        assert!(!filter.is_eligible("scripts/run.py"));
        assert!(filter.is_eligible("tools/scripts/run.py"));
        // unanchored directory matches at any depth
        assert!(!filter.is_eligible("gen/a.rs"));
        assert!(!filter.is_eligible("pkg/gen/a.rs"));
        // basename pattern with negation
        assert!(!filter.is_eligible("src/util.test.ts"));
        assert!(filter.is_eligible("src/keep.test.ts"));
    }

    #[test]
    fn test_negation_and_anchoring_in_nested_paths() {
        let (_tmp, filter) = filter_with(
            "logs/\n*.generated.py\n!src/api.generated.py\n/build.py\ndocs/**/*.js\n",
            &[],
            &[],
        );
        assert!(!filter.is_eligible("logs/app.py"));
        assert!(!filter.is_eligible("svc/logs/deep/x.rs"));
        assert!(!filter.allows_dir("svc/logs"));
        assert!(!filter.is_eligible("lib/models.generated.py"));
        assert!(filter.is_eligible("src/api.generated.py"));
        // a leading slash anchors to the root
        assert!(!filter.is_eligible("build.py"));
        assert!(filter.is_eligible("tools/build.py"));
        assert!(!filter.is_eligible("docs/a/b/c.js"));
        assert!(filter.is_eligible("src/docs.js"));
    }

    #[test]
    fn test_ignore_file_can_reinclude_builtin_exclude() {
        let (_tmp, filter) = filter_with("!Cargo.lock\n!*.min.js\n", &[], &[]);
        assert!(filter.is_eligible("static/app.min.js"));
        // directory excludes still prune the whole subtree
        assert!(!filter.is_eligible("node_modules/a/index.js"));
    }

    #[test]
    fn test_single_star_stays_in_segment() {
        let (_tmp, filter) = filter_with("", &["src/*.py"], &[]);
        assert!(filter.is_eligible("src/a.py"));
        assert!(!filter.is_eligible("src/deep/a.py"));

        let (_tmp, filter) = filter_with("", &["src/**/*.py"], &[]);
        assert!(filter.is_eligible("src/a.py"));
        assert!(filter.is_eligible("src/deep/er/a.py"));
    }

    #[test]
    fn test_include_and_exclude_globs() {
        let (_tmp, filter) = filter_with("", &["app/**"], &["**/legacy/**"]);
        assert!(filter.is_eligible("app/main.ts"));
        assert!(!filter.is_eligible("lib/main.ts"));
        assert!(!filter.is_eligible("app/legacy/old.ts"));
    }

    #[test]
    fn test_allows_dir() {
        let filter = PathFilter::builtin().unwrap();
        assert!(filter.allows_dir(""));
        assert!(filter.allows_dir("src"));
        assert!(!filter.allows_dir("node_modules"));
        assert!(!filter.allows_dir("packages/app/node_modules"));
    }

    #[test]
    fn test_missing_ignore_file_is_fine() {
        let tmp = TempDir::new().unwrap();
        let filter = PathFilter::new(tmp.path(), &[".indexignore".to_string()], &[], &[]).unwrap();
        assert!(filter.is_eligible("lib.rs"));
    }
}
