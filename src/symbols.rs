//! Tree-sitter symbol extraction.
//!
//! Walks a parsed syntax tree and extracts top-level and class-nested
//! declarations: functions, classes, methods, interfaces, and type aliases.
//! Each language defines a table of per-kind node matchers; a candidate that
//! cannot be resolved (no name, unexpected shape) is logged and skipped
//! without affecting other candidates. Declarations inside function bodies
//! are never emitted.

use std::collections::HashSet;

use anyhow::{anyhow, Context, Result};
use tracing::debug;
use tree_sitter::{Node, Parser, Tree};

use crate::language::Language;
use crate::models::{ExtractedSymbol, SymbolKind, Visibility};

/// Node types that produce one symbol kind.
struct KindMatcher {
    kind: SymbolKind,
    node_types: &'static [&'static str],
}

const PYTHON: &[KindMatcher] = &[
    KindMatcher {
        kind: SymbolKind::Function,
        node_types: &["function_definition"],
    },
    KindMatcher {
        kind: SymbolKind::Class,
        node_types: &["class_definition"],
    },
];

const JAVASCRIPT: &[KindMatcher] = &[
    KindMatcher {
        kind: SymbolKind::Function,
        node_types: &[
            "function_declaration",
            "generator_function_declaration",
            "variable_declarator",
        ],
    },
    KindMatcher {
        kind: SymbolKind::Class,
        node_types: &["class_declaration"],
    },
    KindMatcher {
        kind: SymbolKind::Method,
        node_types: &["method_definition"],
    },
];

const TYPESCRIPT: &[KindMatcher] = &[
    KindMatcher {
        kind: SymbolKind::Function,
        node_types: &[
            "function_declaration",
            "generator_function_declaration",
            "variable_declarator",
        ],
    },
    KindMatcher {
        kind: SymbolKind::Class,
        node_types: &["class_declaration", "abstract_class_declaration"],
    },
    KindMatcher {
        kind: SymbolKind::Method,
        node_types: &["method_definition"],
    },
    KindMatcher {
        kind: SymbolKind::Interface,
        node_types: &["interface_declaration"],
    },
    KindMatcher {
        kind: SymbolKind::TypeAlias,
        node_types: &["type_alias_declaration"],
    },
];

const RUST: &[KindMatcher] = &[
    KindMatcher {
        kind: SymbolKind::Function,
        node_types: &["function_item", "function_signature_item"],
    },
    KindMatcher {
        kind: SymbolKind::Class,
        node_types: &["struct_item", "enum_item", "union_item"],
    },
    KindMatcher {
        kind: SymbolKind::Interface,
        node_types: &["trait_item"],
    },
    KindMatcher {
        kind: SymbolKind::TypeAlias,
        node_types: &["type_item"],
    },
];

/// Nodes whose bodies hide nested declarations from extraction.
const FUNCTION_LIKE: &[&str] = &[
    "function_definition",
    "lambda",
    "function_declaration",
    "generator_function_declaration",
    "function_expression",
    "function",
    "generator_function",
    "arrow_function",
    "method_definition",
    "function_item",
    "closure_expression",
];

const IDENTIFIER_KINDS: &[&str] = &[
    "identifier",
    "type_identifier",
    "property_identifier",
    "private_property_identifier",
];

fn matchers_for(language: Language) -> &'static [KindMatcher] {
    match language {
        Language::Python => PYTHON,
        Language::JavaScript => JAVASCRIPT,
        Language::TypeScript | Language::Tsx => TYPESCRIPT,
        Language::Rust => RUST,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Container {
    Module,
    Class,
    Trait,
    TraitImpl,
}

#[derive(Debug, Clone)]
struct Scope {
    parent: Option<String>,
    container: Container,
}

impl Scope {
    fn module() -> Self {
        Self {
            parent: None,
            container: Container::Module,
        }
    }

    fn nested(parent: String, container: Container) -> Self {
        Self {
            parent: Some(parent),
            container,
        }
    }
}

/// Reusable parser wrapper; switches grammar only when the language changes.
pub struct SymbolExtractor {
    parser: Parser,
    current: Option<Language>,
}

impl Default for SymbolExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolExtractor {
    pub fn new() -> Self {
        Self {
            parser: Parser::new(),
            current: None,
        }
    }

    /// Parse `source` and extract its symbols.
    pub fn extract(&mut self, source: &str, language: Language) -> Result<Vec<ExtractedSymbol>> {
        let tree = self.parse(source, language)?;
        Ok(extract_symbols(&tree, source, language))
    }

    pub fn parse(&mut self, source: &str, language: Language) -> Result<Tree> {
        if self.current != Some(language) {
            self.parser
                .set_language(&language.grammar())
                .with_context(|| format!("Failed to load {} grammar", language))?;
            self.current = Some(language);
        }
        let tree = self
            .parser
            .parse(source, None)
            .ok_or_else(|| anyhow!("Parser produced no tree"))?;
        if tree.root_node().has_error() {
            debug!(language = %language, "syntax errors present, extracting what parsed");
        }
        Ok(tree)
    }
}

/// Extract symbols from an already-parsed tree, ordered by position.
pub fn extract_symbols(tree: &Tree, source: &str, language: Language) -> Vec<ExtractedSymbol> {
    let mut found: Vec<(usize, ExtractedSymbol)> = Vec::new();
    let mut seen: HashSet<(SymbolKind, usize)> = HashSet::new();
    let walker = Walker {
        source,
        language,
        matchers: matchers_for(language),
    };
    walker.visit(tree.root_node(), &Scope::module(), &mut |byte, symbol| {
        if seen.insert((symbol.kind, byte)) {
            found.push((byte, symbol));
        }
    });
    found.sort_by_key(|(byte, _)| *byte);
    found.into_iter().map(|(_, symbol)| symbol).collect()
}

struct Walker<'a> {
    source: &'a str,
    language: Language,
    matchers: &'static [KindMatcher],
}

impl<'a> Walker<'a> {
    fn visit(&self, node: Node, scope: &Scope, emit: &mut dyn FnMut(usize, ExtractedSymbol)) {
        if self.language == Language::Rust && node.kind() == "impl_item" {
            self.visit_impl(node, emit);
            return;
        }

        let matched = self
            .matchers
            .iter()
            .find(|m| m.node_types.contains(&node.kind()));

        if let Some(matcher) = matched {
            if let Some(symbol) = self.build_symbol(node, matcher.kind, scope) {
                let name = symbol.name.clone();
                let kind = symbol.kind;
                emit(node.start_byte(), symbol);
                match kind {
                    SymbolKind::Class => {
                        self.visit_children(node, &Scope::nested(name, Container::Class), emit)
                    }
                    SymbolKind::Interface if self.language == Language::Rust => {
                        self.visit_children(node, &Scope::nested(name, Container::Trait), emit)
                    }
                    _ => {}
                }
                return;
            }
        }

        if FUNCTION_LIKE.contains(&node.kind()) {
            return;
        }
        self.visit_children(node, scope, emit);
    }

    fn visit_children(&self, node: Node, scope: &Scope, emit: &mut dyn FnMut(usize, ExtractedSymbol)) {
        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            self.visit(child, scope, emit);
        }
    }

    fn visit_impl(&self, node: Node, emit: &mut dyn FnMut(usize, ExtractedSymbol)) {
        let Some(type_node) = node.child_by_field_name("type") else {
            debug!(line = node.start_position().row + 1, "impl block without a type, skipping");
            return;
        };
        let type_name = self.text(type_node);
        let type_name = type_name.split('<').next().unwrap_or(type_name).trim().to_string();
        let container = if node.child_by_field_name("trait").is_some() {
            Container::TraitImpl
        } else {
            Container::Class
        };
        if let Some(body) = node.child_by_field_name("body") {
            self.visit_children(body, &Scope::nested(type_name, container), emit);
        }
    }

    fn build_symbol(&self, node: Node, matched: SymbolKind, scope: &Scope) -> Option<ExtractedSymbol> {
        // `const f = () => {}` counts only when the value is a function.
        let value = if node.kind() == "variable_declarator" {
            let value = node.child_by_field_name("value")?;
            if !matches!(
                value.kind(),
                "arrow_function" | "function_expression" | "function" | "generator_function"
            ) {
                return None;
            }
            Some(value)
        } else {
            None
        };

        let Some(name_node) = self.name_node(node) else {
            debug!(
                kind = matched.as_str(),
                line = node.start_position().row + 1,
                "declaration without a resolvable name, skipping"
            );
            return None;
        };
        if node.kind() == "variable_declarator" && name_node.kind() != "identifier" {
            return None;
        }
        let name = self.text(name_node).to_string();
        if name.is_empty() {
            return None;
        }

        let kind = match matched {
            SymbolKind::Function if scope.container != Container::Module => SymbolKind::Method,
            other => other,
        };

        let outer = self.outer_node(node);
        let body = match value {
            Some(value) => value.child_by_field_name("body"),
            None => node.child_by_field_name("body"),
        };
        let signature_start = if value.is_some() { outer.start_byte() } else { node.start_byte() };
        let signature_end = body.map(|b| b.start_byte()).unwrap_or_else(|| node.end_byte());
        let signature = self.source[signature_start..signature_end].trim().to_string();

        let start = outer.start_position();
        let end = outer.end_position();
        let body_start_line = body
            .map(|b| b.start_position().row + 1)
            .unwrap_or(start.row + 1);

        Some(ExtractedSymbol {
            visibility: self.visibility(node, name_node, &name, scope),
            docstring: self.docstring(node, outer, body),
            decorators: self.decorators(node, outer),
            name,
            kind,
            signature,
            start_line: start.row + 1,
            start_column: start.column,
            end_line: end.row + 1,
            end_column: end.column,
            body_start_line,
            parent: scope.parent.clone(),
        })
    }

    fn name_node<'t>(&self, node: Node<'t>) -> Option<Node<'t>> {
        if let Some(name) = node.child_by_field_name("name") {
            return Some(name);
        }
        let mut cursor = node.walk();
        let found = node
            .children(&mut cursor)
            .find(|child| IDENTIFIER_KINDS.contains(&child.kind()));
        found
    }

    /// The node whose range covers the whole declaration, decorators included.
    fn outer_node<'t>(&self, node: Node<'t>) -> Node<'t> {
        match node.parent() {
            Some(parent) if parent.kind() == "decorated_definition" => parent,
            Some(parent) if node.kind() == "variable_declarator" => parent,
            _ => node,
        }
    }

    fn text(&self, node: Node) -> &'a str {
        &self.source[node.byte_range()]
    }

    fn docstring(&self, node: Node, outer: Node, body: Option<Node>) -> Option<String> {
        let doc = match self.language {
            Language::Python => body.and_then(|b| self.python_docstring(b)),
            Language::Rust => self.rust_doc_comments(node),
            _ => self.jsdoc(outer),
        };
        doc.filter(|d| !d.is_empty())
    }

    fn python_docstring(&self, body: Node) -> Option<String> {
        let first = body.named_child(0)?;
        if first.kind() != "expression_statement" {
            return None;
        }
        let string = first.named_child(0)?;
        if string.kind() != "string" {
            return None;
        }
        Some(strip_python_string(self.text(string)))
    }

    fn jsdoc(&self, outer: Node) -> Option<String> {
        let anchor = match outer.parent() {
            Some(parent) if parent.kind() == "export_statement" => parent,
            _ => outer,
        };
        let comment = anchor.prev_named_sibling()?;
        if comment.kind() != "comment" {
            return None;
        }
        let text = self.text(comment);
        if !text.starts_with("/**") {
            return None;
        }
        if comment.end_position().row + 1 < anchor.start_position().row {
            return None;
        }
        Some(strip_block_comment(text))
    }

    fn rust_doc_comments(&self, node: Node) -> Option<String> {
        let mut lines: Vec<String> = Vec::new();
        let mut sibling = node.prev_sibling();
        while let Some(current) = sibling {
            match current.kind() {
                "attribute_item" => {}
                "line_comment" => {
                    let text = self.text(current).trim_end();
                    if !text.starts_with("///") || text.starts_with("////") {
                        break;
                    }
                    let line = &text[3..];
                    lines.push(line.strip_prefix(' ').unwrap_or(line).to_string());
                }
                "block_comment" => {
                    let text = self.text(current);
                    if !text.starts_with("/**") {
                        break;
                    }
                    lines.push(strip_block_comment(text));
                }
                _ => break,
            }
            sibling = current.prev_sibling();
        }
        if lines.is_empty() {
            return None;
        }
        lines.reverse();
        Some(lines.join("\n").trim().to_string())
    }

    fn decorators(&self, node: Node, outer: Node) -> Vec<String> {
        let mut decorators = Vec::new();
        match self.language {
            Language::Python => {
                if outer.kind() == "decorated_definition" {
                    let mut cursor = outer.walk();
                    for child in outer.children(&mut cursor) {
                        if child.kind() == "decorator" {
                            decorators.push(self.text(child).trim().to_string());
                        }
                    }
                }
            }
            Language::Rust => {
                let mut sibling = node.prev_sibling();
                while let Some(current) = sibling {
                    match current.kind() {
                        "attribute_item" => decorators.push(self.text(current).trim().to_string()),
                        "line_comment" | "block_comment" => {}
                        _ => break,
                    }
                    sibling = current.prev_sibling();
                }
                decorators.reverse();
            }
            _ => {
                let mut preceding = Vec::new();
                let mut sibling = node.prev_named_sibling();
                while let Some(current) = sibling {
                    match current.kind() {
                        "decorator" => preceding.push(self.text(current).trim().to_string()),
                        "comment" => {}
                        _ => break,
                    }
                    sibling = current.prev_named_sibling();
                }
                preceding.reverse();
                decorators.extend(preceding);

                let mut cursor = node.walk();
                for child in node.children(&mut cursor) {
                    if child.kind() == "decorator" {
                        decorators.push(self.text(child).trim().to_string());
                    }
                }
            }
        }
        decorators
    }

    fn visibility(&self, node: Node, name_node: Node, name: &str, scope: &Scope) -> Visibility {
        match self.language {
            Language::Rust => {
                let mut cursor = node.walk();
                let has_pub = node
                    .children(&mut cursor)
                    .any(|c| c.kind() == "visibility_modifier");
                if has_pub || matches!(scope.container, Container::Trait | Container::TraitImpl) {
                    Visibility::Public
                } else {
                    Visibility::Private
                }
            }
            Language::Python => visibility_from_name(name),
            _ => {
                if name_node.kind() == "private_property_identifier" {
                    return Visibility::Private;
                }
                let mut cursor = node.walk();
                let modifier = node
                    .children(&mut cursor)
                    .find(|c| c.kind() == "accessibility_modifier")
                    .map(|c| self.text(c).trim());
                match modifier {
                    Some("private") => Visibility::Private,
                    Some("protected") => Visibility::Protected,
                    Some(_) => Visibility::Public,
                    None => visibility_from_name(name),
                }
            }
        }
    }
}

/// `__x` (not dunder) is private, `_x` is protected, everything else public.
pub fn visibility_from_name(name: &str) -> Visibility {
    if name.starts_with("__") && !name.ends_with("__") {
        Visibility::Private
    } else if name.starts_with('_') && !name.starts_with("__") {
        Visibility::Protected
    } else {
        Visibility::Public
    }
}

fn strip_block_comment(text: &str) -> String {
    let inner = text.trim();
    let inner = inner.strip_prefix("/**").unwrap_or(inner);
    let inner = inner.strip_suffix("*/").unwrap_or(inner);
    inner
        .lines()
        .map(|line| {
            let line = line.trim();
            match line.strip_prefix('*') {
                Some(rest) => rest.strip_prefix(' ').unwrap_or(rest),
                None => line,
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

fn strip_python_string(text: &str) -> String {
    let unprefixed = text.trim_start_matches(|c: char| "rRbBuUfF".contains(c));
    for quote in ["\"\"\"", "'''", "\"", "'"] {
        if unprefixed.len() >= quote.len() * 2
            && unprefixed.starts_with(quote)
            && unprefixed.ends_with(quote)
        {
            let inner = &unprefixed[quote.len()..unprefixed.len() - quote.len()];
            return inner
                .lines()
                .map(str::trim)
                .collect::<Vec<_>>()
                .join("\n")
                .trim()
                .to_string();
        }
    }
    unprefixed.trim().to_string()
}
