//! # Index Harness
//!
//! Incremental, symbol-aware code indexing with a crash-safe job worker.
//!
//! Index Harness walks a repository, detects which files changed since the
//! last pass by SHA-256 fingerprint, extracts symbols with tree-sitter, cuts
//! a summary/implementation chunk tree per file, optionally summarizes and
//! embeds the chunks, and stores vectors plus per-file metadata. A durable
//! job queue drives full and incremental passes, and snippet and wiki
//! generation, with cooperative cancellation and startup recovery.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌──────────────┐   ┌──────────┐
//! │ PathFilter  │──▶│ FileCollector│──▶│ChangeDetector│──▶│ Symbols  │
//! │ ignore+glob │   │  SHA-256     │   │ add/mod/rm   │   │tree-sitter│
//! └─────────────┘   └──────────────┘   └──────────────┘   └────┬─────┘
//!                                                              ▼
//!   ┌──────────┐    ┌──────────┐    ┌──────────┐        ┌──────────┐
//!   │  Store   │◀───│  Embed   │◀───│Summarize │◀───────│ Chunker  │
//!   │ vec+meta │    │ batched  │    │ optional │        │ 2 levels │
//!   └──────────┘    └──────────┘    └──────────┘        └──────────┘
//!
//!   TaskProcessor ── claims jobs ──▶ IndexingPipeline | Snippet/Wiki drivers
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! ixh init                                  # create database
//! ixh source add app --path ./app           # register a repository
//! ixh index app                             # index inline
//! ixh job enqueue app --type full-index     # or queue it
//! ixh worker                                # and process the queue
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`filter`] | Built-in excludes, ignore files, include/exclude globs |
//! | [`collector`] | File walking and fingerprints |
//! | [`changes`] | Change detection against stored fingerprints |
//! | [`symbols`] | Tree-sitter symbol extraction |
//! | [`chunk`] | Hierarchical chunking |
//! | [`context`] | Per-run pipeline state |
//! | [`ingest`] | The indexing pipeline |
//! | [`cancel`] | Store-backed cancellation tokens |
//! | [`retry`] | Backoff with jitter |
//! | [`limiter`] | Bounded concurrency |
//! | [`generate`] | Snippet and wiki drivers |
//! | [`worker`] | The task processor |
//! | [`traits`] | Collaborator contracts |
//! | [`sqlite_store`] | SQLite implementation of every store |
//! | [`memory`] | In-memory stores |

pub mod cancel;
pub mod changes;
pub mod chunk;
pub mod collector;
pub mod config;
pub mod context;
pub mod db;
pub mod embedding;
pub mod error;
pub mod filter;
pub mod generate;
pub mod git;
pub mod ingest;
pub mod jobs;
pub mod language;
pub mod limiter;
pub mod memory;
pub mod migrate;
pub mod models;
pub mod progress;
pub mod retry;
pub mod sources;
pub mod sqlite_store;
pub mod symbols;
pub mod traits;
pub mod worker;
