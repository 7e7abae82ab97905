//! Error types for the indexing pipeline and its collaborators.

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// Pipeline phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Collect,
    Diff,
    Parse,
    Summarize,
    Embed,
    Store,
}

impl Phase {
    /// Name used in progress events.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Collect => "collect",
            Self::Diff => "diff",
            Self::Parse => "parse",
            Self::Summarize => "summarize",
            Self::Embed => "embed",
            Self::Store => "store",
        }
    }

    /// Tag used when an error is attributed to this phase.
    pub fn error_tag(&self) -> &'static str {
        match self {
            Self::Collect | Self::Diff => "collect",
            Self::Parse => "parse",
            Self::Summarize => "llm",
            Self::Embed => "embed",
            Self::Store => "store",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recoverable error recorded during a run, tagged with where it happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseError {
    #[serde(serialize_with = "serialize_phase_tag")]
    pub phase: Phase,
    pub file: Option<String>,
    pub message: String,
}

fn serialize_phase_tag<S: serde::Serializer>(phase: &Phase, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(phase.error_tag())
}

impl std::fmt::Display for PhaseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.file {
            Some(file) => write!(f, "[{}] {}: {}", self.phase.error_tag(), file, self.message),
            None => write!(f, "[{}] {}", self.phase.error_tag(), self.message),
        }
    }
}

/// Errors that end an indexing run without a structured result.
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Source root does not exist: {0}")]
    MissingRoot(PathBuf),

    #[error("Source root is not readable: {path}: {source}")]
    UnreadableRoot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unknown source: {0}")]
    UnknownSource(String),

    #[error("Invalid glob pattern: {0}")]
    InvalidPattern(#[from] globset::Error),

    #[error("Invalid ignore rule: {0}")]
    InvalidIgnore(#[from] ignore::Error),

    #[error("Indexing cancelled before {0} phase")]
    Cancelled(Phase),

    #[error("Store error: {0}")]
    Store(#[source] anyhow::Error),
}

/// Marker error a collaborator returns when it stopped because of cancellation.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Whether an error chain represents cancellation rather than failure.
///
/// Only the typed markers count; message text is never inspected, since
/// failure messages carry file paths and provider text.
pub fn is_cancellation(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause.downcast_ref::<Cancelled>().is_some()
            || matches!(
                cause.downcast_ref::<IndexError>(),
                Some(IndexError::Cancelled(_))
            )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_error_tags() {
        assert_eq!(Phase::Summarize.error_tag(), "llm");
        assert_eq!(Phase::Diff.error_tag(), "collect");
        assert_eq!(Phase::Store.error_tag(), "store");
    }

    #[test]
    fn test_phase_error_display() {
        let err = PhaseError {
            phase: Phase::Parse,
            file: Some("src/a.py".to_string()),
            message: "bad syntax".to_string(),
        };
        assert_eq!(err.to_string(), "[parse] src/a.py: bad syntax");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["phase"], "parse");
    }

    #[test]
    fn test_is_cancellation() {
        let err = anyhow::Error::new(IndexError::Cancelled(Phase::Parse)).context("job abc");
        assert!(is_cancellation(&err));

        let err = Err::<(), _>(Cancelled).context("wiki page").unwrap_err();
        assert!(is_cancellation(&err));

        let err = anyhow::anyhow!("disk full");
        assert!(!is_cancellation(&err));
    }

    #[test]
    fn test_failure_text_is_not_cancellation() {
        let err = anyhow::anyhow!(
            "Indexing failed: [store] src/orders/cancelled.py: database is locked"
        );
        assert!(!is_cancellation(&err));

        let err = anyhow::anyhow!("HTTP 400: request aborted: prompt too long");
        assert!(!is_cancellation(&err));

        let err = anyhow::anyhow!("operation cancelled").context("job abc");
        assert!(!is_cancellation(&err));
    }
}
