//! Completion item conversion and enrichment
//!
//! Server items arrive as raw JSON; they are converted into
//! [`CompletionItem`]s (snippet rewriting, import edits), then merged with
//! classpath-derived class candidates. Both sources meet in
//! [`merge_candidates`], which deduplicates on `(label, detail)`.

pub mod converter;
pub mod imports;
pub mod index;
pub mod snippet;

use std::collections::HashSet;

use lsp_types::{Position, TextEdit};
use serde::Serialize;

pub use converter::CompletionConverter;
pub use imports::ImportResolver;
pub use index::ImportIndex;
pub use snippet::SnippetTransformer;

/// Editor-side completion kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CompletionItemKind {
    None,
    Method,
    Function,
    Constructor,
    Field,
    Variable,
    Class,
    Interface,
    Module,
    Property,
    Value,
    Enum,
    Keyword,
    Snippet,
    EnumMember,
    TypeParameter,
}

impl CompletionItemKind {
    /// Map an LSP `CompletionItemKind` number
    pub fn from_lsp(kind: i64) -> Self {
        match kind {
            2 => Self::Method,
            3 => Self::Function,
            4 => Self::Constructor,
            5 => Self::Field,
            6 => Self::Variable,
            7 => Self::Class,
            8 => Self::Interface,
            9 => Self::Module,
            10 => Self::Property,
            12 => Self::Value,
            13 => Self::Enum,
            14 => Self::Keyword,
            15 => Self::Snippet,
            20 => Self::EnumMember,
            25 => Self::TypeParameter,
            _ => Self::None,
        }
    }
}

/// How well a label matches the typed prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum MatchLevel {
    CaseSensitiveEquals,
    CaseInsensitiveEquals,
    CaseSensitivePrefix,
    CaseInsensitivePrefix,
    NoMatch,
}

impl MatchLevel {
    pub fn compute(label: &str, prefix: &str) -> Self {
        if prefix.is_empty() {
            return Self::NoMatch;
        }
        if label == prefix {
            Self::CaseSensitiveEquals
        } else if label.eq_ignore_ascii_case(prefix) {
            Self::CaseInsensitiveEquals
        } else if label.starts_with(prefix) {
            Self::CaseSensitivePrefix
        } else if label.to_lowercase().starts_with(&prefix.to_lowercase()) {
            Self::CaseInsensitivePrefix
        } else {
            Self::NoMatch
        }
    }
}

/// Format of `insert_text`
///
/// Converted items are always plain text: snippet syntax is rewritten
/// during conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InsertTextFormat {
    PlainText,
    Snippet,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionItem {
    pub label: String,
    pub detail: String,
    pub insert_text: Option<String>,
    pub insert_text_format: InsertTextFormat,
    pub sort_text: Option<String>,
    pub kind: CompletionItemKind,
    pub match_level: MatchLevel,
    /// Import edits to apply alongside the insertion
    pub additional_text_edits: Vec<TextEdit>,
    /// Cursor position inside `insert_text`, in characters
    pub cursor_offset: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CompletionList {
    pub items: Vec<CompletionItem>,
    pub is_incomplete: bool,
    /// A newer completion request for the same file replaced this one
    pub superseded: bool,
}

impl CompletionList {
    pub fn superseded() -> Self {
        Self {
            superseded: true,
            ..Self::default()
        }
    }
}

/// A class found on the classpath
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassInfo {
    pub simple_name: String,
    pub fully_qualified_name: String,
    pub package: String,
}

impl ClassInfo {
    pub fn from_fqn(fqn: &str) -> Self {
        let (package, simple) = fqn.rsplit_once('.').unwrap_or(("", fqn));
        Self {
            simple_name: simple.to_string(),
            fully_qualified_name: fqn.to_string(),
            package: package.to_string(),
        }
    }
}

/// Supplier of classpath classes for completion
///
/// Implemented by [`ImportIndex`]; an external compiler service can provide
/// its own.
pub trait ClassCandidateSource: Send + Sync {
    fn classes_with_prefix(&self, prefix: &str, limit: usize) -> Vec<ClassInfo>;
}

/// One completion candidate, by origin
#[derive(Debug, Clone)]
pub enum CompletionCandidate {
    Server(CompletionItem),
    Classpath(ClassInfo),
}

/// Merge candidates into the final item list
///
/// Order is preserved and the first item for each `(label, detail)` pair
/// wins. Classpath classes become `Class` items with an import edit when the
/// file needs one.
pub fn merge_candidates(
    candidates: Vec<CompletionCandidate>,
    resolver: &ImportResolver,
    file_content: &str,
    prefix: &str,
) -> Vec<CompletionItem> {
    let mut seen = HashSet::new();
    let mut merged = Vec::with_capacity(candidates.len());

    for candidate in candidates {
        let item = match candidate {
            CompletionCandidate::Server(item) => item,
            CompletionCandidate::Classpath(class) => class_item(class, resolver, file_content),
        };
        if seen.insert((item.label.clone(), item.detail.clone())) {
            merged.push(CompletionItem {
                match_level: MatchLevel::compute(&item.label, prefix),
                ..item
            });
        }
    }

    merged
}

fn class_item(class: ClassInfo, resolver: &ImportResolver, file_content: &str) -> CompletionItem {
    let additional_text_edits =
        if resolver.needs_import_for_class(&class.fully_qualified_name, file_content) {
            vec![resolver.generate_import_edit(&class.fully_qualified_name, file_content)]
        } else {
            Vec::new()
        };

    CompletionItem {
        label: class.simple_name.clone(),
        detail: class.fully_qualified_name,
        insert_text: Some(class.simple_name.clone()),
        insert_text_format: InsertTextFormat::PlainText,
        sort_text: Some(class.simple_name),
        kind: CompletionItemKind::Class,
        match_level: MatchLevel::NoMatch,
        additional_text_edits,
        cursor_offset: None,
    }
}

/// Text of `position`'s line up to the cursor
///
/// LSP character offsets are taken as characters.
pub fn line_before_cursor(content: &str, position: Position) -> &str {
    let Some(line) = content.split('\n').nth(position.line as usize) else {
        return "";
    };
    let end = line
        .char_indices()
        .nth(position.character as usize)
        .map_or(line.len(), |(offset, _)| offset);
    &line[..end]
}

/// Identifier being typed at `position`
pub fn completion_prefix(content: &str, position: Position) -> String {
    let before = line_before_cursor(content, position);
    let start = before
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_alphanumeric() || *c == '_')
        .last()
        .map_or(before.len(), |(offset, _)| offset);
    before[start..].to_string()
}

/// Character immediately before `position`
pub fn char_before(content: &str, position: Position) -> Option<char> {
    line_before_cursor(content, position).chars().last()
}
