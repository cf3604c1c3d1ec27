//! Import resolution for completion items
//!
//! Decides whether inserting a completion needs an `import` line and
//! produces the edit that adds it.

use lsp_types::{Position, Range, TextEdit};
use regex::Regex;

/// Packages every Kotlin file sees without an import
pub const AUTO_IMPORTED_PREFIXES: &[&str] = &[
    "kotlin.",
    "kotlin.annotation.",
    "kotlin.collections.",
    "kotlin.comparisons.",
    "kotlin.io.",
    "kotlin.ranges.",
    "kotlin.sequences.",
    "kotlin.text.",
    "java.lang.",
];

/// Builtin types and keywords, never imported
const STANDARD_NAMES: &[&str] = &[
    "Int", "Long", "Short", "Byte", "Float", "Double", "Boolean", "Char", "String", "Unit",
    "Nothing", "Any", "val", "var", "fun", "class", "interface", "object", "if", "else", "when",
    "for", "while", "do", "return",
];

pub fn is_standard_name(name: &str) -> bool {
    STANDARD_NAMES.contains(&name)
}

pub fn is_auto_imported(fqn: &str) -> bool {
    AUTO_IMPORTED_PREFIXES
        .iter()
        .any(|prefix| fqn.starts_with(prefix))
}

/// Package part of a fully-qualified name, empty for top-level names
pub fn package_of(fqn: &str) -> &str {
    fqn.rsplit_once('.').map_or("", |(package, _)| package)
}

#[derive(Debug, Clone)]
pub struct ImportResolver {
    qualified_name_regex: Regex,
    defined_in_regex: Regex,
    package_only_regex: Regex,
    package_declaration_regex: Regex,
}

impl ImportResolver {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            // android.widget.Toast
            qualified_name_regex: Regex::new(
                r"([a-z][a-z0-9_]*(\.[a-z][a-z0-9_]*)+\.[A-Z][A-Za-z0-9_]*)",
            )?,
            // "defined in kotlinx.coroutines"
            defined_in_regex: Regex::new(r"defined in ([a-zA-Z0-9_.]+)")?,
            package_only_regex: Regex::new(r"^([a-z][a-z0-9_]*(?:\.[a-z][a-z0-9_]*)*)$")?,
            package_declaration_regex: Regex::new(r"(?m)^\s*package\s+([A-Za-z0-9_.]+)")?,
        })
    }

    /// Fully-qualified name to import for a server completion item, if any
    pub fn needs_import(&self, label: &str, detail: &str, file_content: &str) -> Option<String> {
        if detail.is_empty() || is_standard_name(label) {
            return None;
        }

        let fqn = self.extract_fully_qualified_name(detail, label)?;
        if !fqn.contains('.') || has_import(file_content, &fqn) || is_auto_imported(&fqn) {
            return None;
        }
        Some(fqn)
    }

    /// Whether a classpath class needs an import in this file
    pub fn needs_import_for_class(&self, fqn: &str, file_content: &str) -> bool {
        !has_import(file_content, fqn)
            && !self.is_in_same_package(fqn, file_content)
            && !is_auto_imported(fqn)
    }

    /// Package declared by the file, if any
    pub fn file_package<'a>(&self, file_content: &'a str) -> Option<&'a str> {
        self.package_declaration_regex
            .captures(file_content)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str())
    }

    pub fn is_in_same_package(&self, fqn: &str, file_content: &str) -> bool {
        let package = package_of(fqn);
        !package.is_empty() && self.file_package(file_content) == Some(package)
    }

    /// Fully-qualified name described by a completion item's detail
    ///
    /// Tried in order: a qualified class name anywhere in the detail, a
    /// `defined in <package>` phrase, then a detail that is only a package.
    pub fn extract_fully_qualified_name(&self, detail: &str, label: &str) -> Option<String> {
        if let Some(m) = self.qualified_name_regex.find(detail) {
            return Some(m.as_str().to_string());
        }

        if let Some(caps) = self.defined_in_regex.captures(detail) {
            let owner = &caps[1];
            return Some(if owner.ends_with(&format!(".{label}")) {
                owner.to_string()
            } else {
                format!("{owner}.{label}")
            });
        }

        if self.package_only_regex.is_match(detail) {
            return Some(format!("{detail}.{label}"));
        }

        None
    }

    /// Zero-width edit inserting `import <fqn>`
    pub fn generate_import_edit(&self, fqn: &str, file_content: &str) -> TextEdit {
        insert_at_line(import_insertion_line(file_content), format!("import {fqn}\n"))
    }

    /// Zero-width edit inserting a server-provided import statement
    pub fn import_edit_from_statement(&self, statement: &str, file_content: &str) -> TextEdit {
        insert_at_line(
            import_insertion_line(file_content),
            format!("{}\n", statement.trim()),
        )
    }
}

pub fn has_import(file_content: &str, fqn: &str) -> bool {
    file_content.contains(&format!("import {fqn}"))
}

/// Text of `content` with a line-start insertion applied
///
/// Lines missing before the edit's line are added as empty lines.
pub fn apply_line_insert(content: &str, edit: &TextEdit) -> String {
    let target = edit.range.start.line as usize;
    let mut offset = 0;
    let mut line = 0;
    while line < target {
        match content[offset..].find('\n') {
            Some(i) => {
                offset += i + 1;
                line += 1;
            }
            None => break,
        }
    }

    let mut out = String::with_capacity(content.len() + edit.new_text.len() + target - line);
    if line < target {
        out.push_str(content);
        out.extend(std::iter::repeat_n('\n', target - line));
        out.push_str(&edit.new_text);
    } else {
        out.push_str(&content[..offset]);
        out.push_str(&edit.new_text);
        out.push_str(&content[offset..]);
    }
    out
}

fn insert_at_line(line: u32, new_text: String) -> TextEdit {
    let at = Position::new(line, 0);
    TextEdit {
        range: Range::new(at, at),
        new_text,
    }
}

/// Line where a new import goes
///
/// After the last import of the header block, else two lines below the
/// package declaration, else the top of the file.
pub fn import_insertion_line(file_content: &str) -> u32 {
    let mut last_import: Option<usize> = None;
    let mut package: Option<usize> = None;

    for (index, line) in file_content.split('\n').enumerate() {
        let trimmed = line.trim();
        if trimmed.starts_with("package ") {
            package = Some(index);
        } else if trimmed.starts_with("import ") {
            last_import = Some(index);
        } else if !trimmed.is_empty()
            && !trimmed.starts_with("//")
            && !trimmed.starts_with("/*")
            && last_import.is_some()
        {
            break;
        }
    }

    let line = match (last_import, package) {
        (Some(import), _) => import + 1,
        (None, Some(package)) => package + 2,
        (None, None) => 0,
    };
    u32::try_from(line).unwrap_or(u32::MAX)
}
