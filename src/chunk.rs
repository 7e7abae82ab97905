//! Symbol-aware hierarchical chunker.
//!
//! Turns a file and its extracted symbols into a two-level chunk tree:
//!
//! - one file-level summary chunk (header, language, symbol count, signatures),
//! - per symbol, one summary chunk (docstring + signature, never split),
//! - per symbol, one or more implementation chunks holding the symbol's
//!   source lines. Bodies over `max_tokens` are split into overlapping
//!   line windows that all share the symbol's summary chunk as parent.
//!
//! Chunk ids are UUIDv5 values derived from the chunk's position, so a
//! re-run produces the same ids and overwrites rather than accumulates.

use once_cell::sync::Lazy;
use regex::Regex;
use uuid::Uuid;

use crate::collector::fingerprint;
use crate::language::Language;
use crate::models::{
    ChunkKind, ChunkLevel, CodeChunk, CollectedFile, ExtractedSymbol, Visibility,
};

/// Approximate chars-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// Lines per split window are `max_tokens / LINES_PER_TOKEN_DIVISOR`.
pub const LINES_PER_TOKEN_DIVISOR: usize = 10;

static PY_IMPORT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*(?:from\s+([\w.]+)\s+import\b|import\s+([\w.]+))").unwrap()
});
static JS_IMPORT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?m)^\s*import\s+(?:[^'";]*?\s+from\s+)?['"]([^'"]+)['"]"#).unwrap()
});
static JS_REQUIRE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"require\(\s*['"]([^'"]+)['"]\s*\)"#).unwrap());
static JS_EXPORT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?m)^\s*export\s+(?:default\s+)?(?:declare\s+)?(?:async\s+)?(?:abstract\s+)?(?:function\*?|class|const|let|var|interface|type|enum)\s+([A-Za-z_$][\w$]*)",
    )
    .unwrap()
});
static RUST_USE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*(?:pub(?:\([^)]*\))?\s+)?use\s+([^;{]+)").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkerOptions {
    pub max_tokens: usize,
    pub overlap_lines: usize,
}

impl Default for ChunkerOptions {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            overlap_lines: 5,
        }
    }
}

impl ChunkerOptions {
    /// Lines per split window, at least one.
    pub fn window_lines(&self) -> usize {
        (self.max_tokens / LINES_PER_TOKEN_DIVISOR).max(1)
    }

    /// Overlap clamped strictly below the window so splitting always advances.
    pub fn effective_overlap(&self) -> usize {
        self.overlap_lines.min(self.window_lines() - 1)
    }
}

/// Rough token estimate used for split decisions.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / CHARS_PER_TOKEN
}

/// Deterministic chunk id.
pub fn chunk_id(
    source_id: &str,
    file_path: &str,
    level: ChunkLevel,
    symbol_name: Option<&str>,
    start_line: usize,
    part: usize,
) -> String {
    let key = format!(
        "{}\u{0}{}\u{0}{}\u{0}{}\u{0}{}\u{0}{}",
        source_id,
        file_path,
        level.as_str(),
        symbol_name.unwrap_or(""),
        start_line,
        part
    );
    Uuid::new_v5(&Uuid::NAMESPACE_URL, key.as_bytes()).to_string()
}

/// Build the chunk tree for one file. Zero symbols produce zero chunks.
pub fn chunk_file(
    source_id: &str,
    file: &CollectedFile,
    symbols: &[ExtractedSymbol],
    options: &ChunkerOptions,
) -> Vec<CodeChunk> {
    if symbols.is_empty() {
        return Vec::new();
    }

    let lines: Vec<&str> = file.content.lines().collect();
    let imports = extract_imports(&file.content, file.language);
    let exports = extract_exports(&file.content, file.language, symbols);

    let base = ChunkBase {
        source_id,
        file,
        imports: &imports,
        exports: &exports,
    };

    let mut chunks = Vec::with_capacity(symbols.len() * 2 + 1);
    chunks.push(file_summary_chunk(&base, symbols, lines.len()));

    for symbol in symbols {
        let mut summary = summary_chunk(&base, symbol);
        let implementations = implementation_chunks(&base, symbol, &lines, &summary.id, options);
        summary.child_ids = implementations.iter().map(|c| c.id.clone()).collect();
        chunks.push(summary);
        chunks.extend(implementations);
    }

    chunks
}

struct ChunkBase<'a> {
    source_id: &'a str,
    file: &'a CollectedFile,
    imports: &'a [String],
    exports: &'a [String],
}

impl ChunkBase<'_> {
    #[allow(clippy::too_many_arguments)]
    fn make(
        &self,
        level: ChunkLevel,
        chunk_type: ChunkKind,
        content: String,
        signature: Option<String>,
        symbol_name: Option<String>,
        start_line: usize,
        end_line: usize,
        part: usize,
        parent_id: Option<String>,
    ) -> CodeChunk {
        CodeChunk {
            id: chunk_id(
                self.source_id,
                &self.file.relative_path,
                level,
                symbol_name.as_deref(),
                start_line,
                part,
            ),
            source_id: self.source_id.to_string(),
            level,
            chunk_type,
            language: self.file.language,
            content_hash: fingerprint(content.as_bytes()),
            content,
            signature,
            symbol_name,
            file_path: self.file.relative_path.clone(),
            start_line,
            end_line,
            file_hash: self.file.fingerprint.clone(),
            imports: self.imports.to_vec(),
            exports: self.exports.to_vec(),
            parent_id,
            child_ids: Vec::new(),
            summary: None,
            keywords: Vec::new(),
            embedding: None,
        }
    }
}

fn file_summary_chunk(base: &ChunkBase, symbols: &[ExtractedSymbol], line_count: usize) -> CodeChunk {
    let mut content = format!(
        "File: {}\nLanguage: {}\nSymbols: {}\n",
        base.file.relative_path,
        base.file.language,
        symbols.len()
    );
    if !symbols.is_empty() {
        content.push('\n');
        for symbol in symbols {
            content.push_str(&symbol.signature);
            content.push('\n');
        }
    }
    base.make(
        ChunkLevel::Summary,
        ChunkKind::File,
        content.trim_end().to_string(),
        None,
        None,
        1,
        line_count.max(1),
        0,
        None,
    )
}

fn summary_chunk(base: &ChunkBase, symbol: &ExtractedSymbol) -> CodeChunk {
    let content = match &symbol.docstring {
        Some(doc) if !doc.is_empty() => format!("{}\n\n{}", doc, symbol.signature),
        _ => symbol.signature.clone(),
    };
    base.make(
        ChunkLevel::Summary,
        ChunkKind::Symbol(symbol.kind),
        content,
        Some(symbol.signature.clone()),
        Some(symbol.name.clone()),
        symbol.start_line,
        symbol.end_line,
        0,
        None,
    )
}

fn implementation_chunks(
    base: &ChunkBase,
    symbol: &ExtractedSymbol,
    lines: &[&str],
    parent_id: &str,
    options: &ChunkerOptions,
) -> Vec<CodeChunk> {
    let first = symbol.start_line.saturating_sub(1).min(lines.len());
    let last = symbol.end_line.min(lines.len()).max(first);
    let body = &lines[first..last];
    let content = body.join("\n");

    if estimate_tokens(&content) <= options.max_tokens || body.len() <= 1 {
        return vec![base.make(
            ChunkLevel::Implementation,
            ChunkKind::Symbol(symbol.kind),
            content,
            Some(symbol.signature.clone()),
            Some(symbol.name.clone()),
            symbol.start_line,
            symbol.end_line,
            0,
            Some(parent_id.to_string()),
        )];
    }

    let windows = split_windows(body.len(), options.window_lines(), options.effective_overlap());
    let total = windows.len();
    windows
        .into_iter()
        .enumerate()
        .map(|(i, (start, end))| {
            base.make(
                ChunkLevel::Implementation,
                ChunkKind::Symbol(symbol.kind),
                body[start..end].join("\n"),
                Some(format!("{} (part {}/{})", symbol.signature, i + 1, total)),
                Some(symbol.name.clone()),
                first + start + 1,
                first + end,
                i + 1,
                Some(parent_id.to_string()),
            )
        })
        .collect()
}

/// Half-open line windows over `len` lines; consecutive windows share `overlap` lines.
pub fn split_windows(len: usize, window: usize, overlap: usize) -> Vec<(usize, usize)> {
    let window = window.max(1);
    let step = window - overlap.min(window - 1);
    let mut windows = Vec::new();
    let mut start = 0;
    while start < len {
        let end = (start + window).min(len);
        windows.push((start, end));
        if end == len {
            break;
        }
        start += step;
    }
    windows
}

/// Best-effort module references imported by a file.
pub fn extract_imports(content: &str, language: Language) -> Vec<String> {
    let mut imports: Vec<String> = Vec::new();
    let mut push = |s: &str| {
        let s = s.trim().trim_end_matches("::").to_string();
        if !s.is_empty() && !imports.contains(&s) {
            imports.push(s);
        }
    };
    match language {
        Language::Python => {
            for cap in PY_IMPORT_RE.captures_iter(content) {
                if let Some(m) = cap.get(1).or_else(|| cap.get(2)) {
                    push(m.as_str());
                }
            }
        }
        Language::JavaScript | Language::TypeScript | Language::Tsx => {
            for cap in JS_IMPORT_RE.captures_iter(content) {
                push(&cap[1]);
            }
            for cap in JS_REQUIRE_RE.captures_iter(content) {
                push(&cap[1]);
            }
        }
        Language::Rust => {
            for cap in RUST_USE_RE.captures_iter(content) {
                push(&cap[1]);
            }
        }
    }
    imports
}

/// Best-effort names a file exposes to other modules.
pub fn extract_exports(content: &str, language: Language, symbols: &[ExtractedSymbol]) -> Vec<String> {
    if language.is_ecmascript() {
        let mut exports: Vec<String> = Vec::new();
        for cap in JS_EXPORT_RE.captures_iter(content) {
            let name = cap[1].to_string();
            if !exports.contains(&name) {
                exports.push(name);
            }
        }
        return exports;
    }
    symbols
        .iter()
        .filter(|s| s.parent.is_none() && s.visibility == Visibility::Public)
        .map(|s| s.name.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SymbolKind;
    use chrono::Utc;
    use std::path::PathBuf;

    fn file(path: &str, content: &str, language: Language) -> CollectedFile {
        CollectedFile {
            relative_path: path.to_string(),
            absolute_path: PathBuf::from(path),
            content: content.to_string(),
            size: content.len() as u64,
            language,
            modified_at: Utc::now(),
            fingerprint: fingerprint(content.as_bytes()),
        }
    }

    fn symbol(name: &str, start: usize, end: usize) -> ExtractedSymbol {
        ExtractedSymbol {
            name: name.to_string(),
            kind: SymbolKind::Function,
            signature: format!("def {}():", name),
            docstring: Some(format!("Doc for {}.", name)),
            start_line: start,
            start_column: 0,
            end_line: end,
            end_column: 0,
            body_start_line: start + 1,
            decorators: vec![],
            visibility: Visibility::Public,
            parent: None,
        }
    }

    #[test]
    fn test_zero_symbols_zero_chunks() {
        let f = file("a.py", "x = 1\n", Language::Python);
        assert!(chunk_file("s1", &f, &[], &ChunkerOptions::default()).is_empty());
    }

    #[test]
    fn test_small_symbol_tree() {
        let content = "import os\n\ndef a():\n    return 1\n\ndef b():\n    return 2\n";
        let f = file("pkg/m.py", content, Language::Python);
        let symbols = vec![symbol("a", 3, 4), symbol("b", 6, 7)];
        let chunks = chunk_file("s1", &f, &symbols, &ChunkerOptions::default());

        // file summary + 2 × (summary + implementation)
        assert_eq!(chunks.len(), 5);
        let file_summary = &chunks[0];
        assert_eq!(file_summary.chunk_type, ChunkKind::File);
        assert!(file_summary.parent_id.is_none());
        assert!(file_summary.content.starts_with("File: pkg/m.py\nLanguage: python\nSymbols: 2"));
        assert_eq!(file_summary.imports, vec!["os".to_string()]);
        assert_eq!(file_summary.exports, vec!["a".to_string(), "b".to_string()]);

        let summary = &chunks[1];
        assert_eq!(summary.level, ChunkLevel::Summary);
        assert_eq!(summary.content, "Doc for a.\n\ndef a():");
        let implementation = &chunks[2];
        assert_eq!(implementation.level, ChunkLevel::Implementation);
        assert_eq!(implementation.content, "def a():\n    return 1");
        assert_eq!(implementation.parent_id.as_deref(), Some(summary.id.as_str()));
        assert_eq!(summary.child_ids, vec![implementation.id.clone()]);
        assert_eq!(implementation.file_hash, f.fingerprint);
        assert_eq!(implementation.content_hash, fingerprint(implementation.content.as_bytes()));
    }

    #[test]
    fn test_every_implementation_has_one_summary_parent() {
        let content = (1..=40).map(|i| format!("    line_{} = {}", i, i)).collect::<Vec<_>>().join("\n");
        let content = format!("def big():\n{}\n\ndef small():\n    pass\n", content);
        let f = file("big.py", &content, Language::Python);
        let symbols = vec![symbol("big", 1, 41), symbol("small", 43, 44)];
        let options = ChunkerOptions { max_tokens: 50, overlap_lines: 2 };
        let chunks = chunk_file("s1", &f, &symbols, &options);

        for chunk in chunks.iter().filter(|c| c.level == ChunkLevel::Implementation) {
            let parents: Vec<_> = chunks
                .iter()
                .filter(|c| Some(&c.id) == chunk.parent_id.as_ref())
                .collect();
            assert_eq!(parents.len(), 1);
            assert_eq!(parents[0].level, ChunkLevel::Summary);
            assert!(parents[0].child_ids.contains(&chunk.id));
        }
    }

    #[test]
    fn test_split_coverage_and_overlap() {
        let body = (1..=40).map(|i| format!("    value_{:02} = compute({})", i, i)).collect::<Vec<_>>().join("\n");
        let content = format!("def big():\n{}\n", body);
        let f = file("big.py", &content, Language::Python);
        let symbols = vec![symbol("big", 1, 41)];
        let options = ChunkerOptions { max_tokens: 50, overlap_lines: 2 };
        let chunks = chunk_file("s1", &f, &symbols, &options);

        let parts: Vec<&CodeChunk> = chunks
            .iter()
            .filter(|c| c.level == ChunkLevel::Implementation)
            .collect();
        // window = 5 lines, step = 3 over 41 lines
        assert!(parts.len() > 1);
        assert_eq!(parts[0].start_line, 1);
        assert_eq!(parts.last().unwrap().end_line, 41);
        for pair in parts.windows(2) {
            assert_eq!(pair[0].end_line - pair[1].start_line + 1, 2);
        }
        let n = parts.len();
        assert_eq!(
            parts[0].signature.as_deref(),
            Some(format!("def big(): (part 1/{})", n).as_str())
        );
    }

    #[test]
    fn test_split_windows_clamps_overlap() {
        assert_eq!(split_windows(5, 2, 5), vec![(0, 2), (1, 3), (2, 4), (3, 5)]);
        assert_eq!(split_windows(3, 1, 0), vec![(0, 1), (1, 2), (2, 3)]);
        assert_eq!(split_windows(0, 4, 1), Vec::<(usize, usize)>::new());
        let options = ChunkerOptions { max_tokens: 5, overlap_lines: 5 };
        assert_eq!(options.window_lines(), 1);
        assert_eq!(options.effective_overlap(), 0);
    }

    #[test]
    fn test_chunk_ids_are_deterministic() {
        let content = "def a():\n    return 1\n";
        let f = file("m.py", content, Language::Python);
        let symbols = vec![symbol("a", 1, 2)];
        let first = chunk_file("s1", &f, &symbols, &ChunkerOptions::default());
        let second = chunk_file("s1", &f, &symbols, &ChunkerOptions::default());
        let ids: Vec<_> = first.iter().map(|c| &c.id).collect();
        let again: Vec<_> = second.iter().map(|c| &c.id).collect();
        assert_eq!(ids, again);

        let other = chunk_file("s2", &f, &symbols, &ChunkerOptions::default());
        assert_ne!(first[0].id, other[0].id);
    }

    #[test]
    fn test_extract_imports() {
        let ts = "import { a } from './a';\nimport React from \"react\";\nimport './side';\nconst fs = require('fs');\n";
        assert_eq!(
            extract_imports(ts, Language::TypeScript),
            vec!["./a", "react", "./side", "fs"]
        );
        let rs = "use std::collections::HashMap;\npub use crate::models::{A, B};\n";
        assert_eq!(
            extract_imports(rs, Language::Rust),
            vec!["std::collections::HashMap", "crate::models"]
        );
    }

    #[test]
    fn test_extract_exports_js() {
        let js = "export function a() {}\nexport default class B {}\nexport const c = 1;\nfunction d() {}\n";
        assert_eq!(extract_exports(js, Language::JavaScript, &[]), vec!["a", "B", "c"]);
    }
}
