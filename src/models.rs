//! Core data models used throughout the indexer.
//!
//! These types represent the files, symbols, chunks, sources, and jobs that
//! flow through the indexing pipeline and the task processor.

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Error};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::language::Language;

// ============ Files ============

/// A file read from disk during one collection pass.
#[derive(Debug, Clone)]
pub struct CollectedFile {
    /// Path relative to the indexing root, `/`-separated.
    pub relative_path: String,
    pub absolute_path: PathBuf,
    pub content: String,
    pub size: u64,
    pub language: Language,
    pub modified_at: DateTime<Utc>,
    /// SHA-256 hex of the raw bytes.
    pub fingerprint: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeStatus {
    Added,
    Modified,
    Removed,
}

impl ChangeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Modified => "modified",
            Self::Removed => "removed",
        }
    }
}

/// One file's classification from a change-detection pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChangeRecord {
    pub path: String,
    pub status: ChangeStatus,
    pub fingerprint: Option<String>,
    pub size: Option<u64>,
    pub language: Option<Language>,
}

/// Per-file record persisted by the metadata store.
#[derive(Debug, Clone, PartialEq)]
pub struct FileMetadata {
    pub source_id: String,
    pub file_path: String,
    pub fingerprint: String,
    pub size: u64,
    pub language: String,
    pub chunk_count: u64,
    pub has_summary: bool,
    pub indexed_at: DateTime<Utc>,
}

// ============ Symbols ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolKind {
    Function,
    Class,
    Method,
    Interface,
    TypeAlias,
}

impl SymbolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Class => "class",
            Self::Method => "method",
            Self::Interface => "interface",
            Self::TypeAlias => "type_alias",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Private,
    Protected,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Private => "private",
            Self::Protected => "protected",
        }
    }
}

/// A declaration found by the symbol extractor. Lines are 1-indexed,
/// columns 0-indexed.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedSymbol {
    pub name: String,
    pub kind: SymbolKind,
    pub signature: String,
    pub docstring: Option<String>,
    pub start_line: usize,
    pub start_column: usize,
    pub end_line: usize,
    pub end_column: usize,
    pub body_start_line: usize,
    pub decorators: Vec<String>,
    pub visibility: Visibility,
    pub parent: Option<String>,
}

// ============ Chunks ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkLevel {
    Summary,
    Implementation,
}

impl ChunkLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Summary => "summary",
            Self::Implementation => "implementation",
        }
    }
}

/// What a chunk describes: a whole file or one symbol kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    File,
    Symbol(SymbolKind),
}

impl ChunkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Symbol(kind) => kind.as_str(),
        }
    }
}

/// A unit of code text stored for retrieval.
#[derive(Debug, Clone)]
pub struct CodeChunk {
    pub id: String,
    pub source_id: String,
    pub level: ChunkLevel,
    pub chunk_type: ChunkKind,
    pub language: Language,
    pub content: String,
    pub signature: Option<String>,
    pub symbol_name: Option<String>,
    pub file_path: String,
    pub start_line: usize,
    pub end_line: usize,
    /// Fingerprint of the whole file when the chunk was cut.
    pub file_hash: String,
    /// SHA-256 hex of `content`.
    pub content_hash: String,
    pub imports: Vec<String>,
    pub exports: Vec<String>,
    pub parent_id: Option<String>,
    pub child_ids: Vec<String>,
    pub summary: Option<String>,
    pub keywords: Vec<String>,
    pub embedding: Option<Vec<f32>>,
}

/// A vector plus its structural payload, as handed to the vector store.
#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: serde_json::Value,
}

impl VectorRecord {
    pub fn from_chunk(chunk: &CodeChunk, vector: Vec<f32>) -> Self {
        let payload = serde_json::json!({
            "source_id": chunk.source_id,
            "file_path": chunk.file_path,
            "level": chunk.level.as_str(),
            "chunk_type": chunk.chunk_type.as_str(),
            "language": chunk.language.as_str(),
            "symbol_name": chunk.symbol_name,
            "signature": chunk.signature,
            "start_line": chunk.start_line,
            "end_line": chunk.end_line,
            "parent_id": chunk.parent_id,
            "content_hash": chunk.content_hash,
            "summary": chunk.summary,
            "keywords": chunk.keywords,
        });
        Self {
            id: chunk.id.clone(),
            vector,
            payload,
        }
    }

    pub fn file_path(&self) -> Option<&str> {
        self.payload.get("file_path").and_then(|v| v.as_str())
    }

    pub fn source_id(&self) -> Option<&str> {
        self.payload.get("source_id").and_then(|v| v.as_str())
    }
}

// ============ Sources ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Local,
    Remote,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }
}

impl FromStr for SourceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Self::Local),
            "remote" => Ok(Self::Remote),
            other => Err(anyhow!("Unknown source kind: '{}'", other)),
        }
    }
}

/// Which of a source's status columns a job drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusField {
    Index,
    Snippet,
    Wiki,
}

impl StatusField {
    pub fn column(&self) -> &'static str {
        match self {
            Self::Index => "index_status",
            Self::Snippet => "snippet_status",
            Self::Wiki => "wiki_status",
        }
    }

    pub fn all() -> [StatusField; 3] {
        [Self::Index, Self::Snippet, Self::Wiki]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubjectStatus {
    Pending,
    Running,
    Ready,
    Error,
}

impl SubjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Ready => "ready",
            Self::Error => "error",
        }
    }
}

impl FromStr for SubjectStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "ready" => Ok(Self::Ready),
            "error" => Ok(Self::Error),
            other => Err(anyhow!("Unknown source status: '{}'", other)),
        }
    }
}

/// A registered repository: a local directory or a remote git URL.
#[derive(Debug, Clone, PartialEq)]
pub struct Source {
    pub id: String,
    pub name: String,
    pub kind: SourceKind,
    /// Local path for `Local`, clone URL for `Remote`.
    pub location: String,
    pub branch: Option<String>,
    pub index_status: SubjectStatus,
    pub snippet_status: SubjectStatus,
    pub wiki_status: SubjectStatus,
    pub created_at: DateTime<Utc>,
}

impl Source {
    pub fn status(&self, field: StatusField) -> SubjectStatus {
        match field {
            StatusField::Index => self.index_status,
            StatusField::Snippet => self.snippet_status,
            StatusField::Wiki => self.wiki_status,
        }
    }

    pub fn set_status(&mut self, field: StatusField, status: SubjectStatus) {
        match field {
            StatusField::Index => self.index_status = status,
            StatusField::Snippet => self.snippet_status = status,
            StatusField::Wiki => self.wiki_status = status,
        }
    }
}

/// Fields needed to register a source.
#[derive(Debug, Clone)]
pub struct NewSource {
    pub name: String,
    pub kind: SourceKind,
    pub location: String,
    pub branch: Option<String>,
}

// ============ Jobs ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    FullIndex,
    Incremental,
    SnippetGenerate,
    WikiGenerate,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FullIndex => "full-index",
            Self::Incremental => "incremental",
            Self::SnippetGenerate => "snippet-generate",
            Self::WikiGenerate => "wiki-generate",
        }
    }

    /// The source status column this job type moves through its lifecycle.
    pub fn status_field(&self) -> StatusField {
        match self {
            Self::FullIndex | Self::Incremental => StatusField::Index,
            Self::SnippetGenerate => StatusField::Snippet,
            Self::WikiGenerate => StatusField::Wiki,
        }
    }
}

impl FromStr for JobType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full-index" => Ok(Self::FullIndex),
            "incremental" => Ok(Self::Incremental),
            "snippet-generate" => Ok(Self::SnippetGenerate),
            "wiki-generate" => Ok(Self::WikiGenerate),
            other => Err(anyhow!(
                "Unknown job type: '{}'. Must be full-index, incremental, snippet-generate, or wiki-generate.",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(anyhow!("Unknown job status: '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub phase: Option<String>,
    pub current: u64,
    pub total: u64,
}

/// A durable unit of scheduled work.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: String,
    pub source_id: String,
    pub source_kind: SourceKind,
    pub job_type: JobType,
    pub status: JobStatus,
    pub progress: JobProgress,
    pub error: Option<String>,
    /// Final counters as JSON, set on completion.
    pub result_json: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub source_id: String,
    pub source_kind: SourceKind,
    pub job_type: JobType,
}

/// One line of a job's log.
#[derive(Debug, Clone)]
pub struct JobLogLine {
    pub job_id: String,
    pub level: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}
