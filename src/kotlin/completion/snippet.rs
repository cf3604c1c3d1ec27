//! Snippet rewriting for completion items
//!
//! The Kotlin server emits LSP snippets such as
//! `makeText(${1:p0}, ${2:p1}, ${3:p2})`. Editors here insert plain text, so
//! placeholders are replaced with the real parameter names and the rest of
//! the snippet syntax is stripped, leaving a cursor position behind.

use regex::{Captures, Regex};

/// Marks where the cursor goes after insertion
pub const CURSOR_MARKER: char = '¶';

/// Rewrites LSP snippet syntax into insertable text
#[derive(Debug, Clone)]
pub struct SnippetTransformer {
    placeholder_regex: Regex,
    block_placeholder_regex: Regex,
    generic_placeholder_regex: Regex,
    bare_tabstop_regex: Regex,
    short_tabstop_regex: Regex,
    parameter_list_regex: Regex,
}

impl SnippetTransformer {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            // ${1:p0}, ${2:message}
            placeholder_regex: Regex::new(r"\$\{(\d+):([^}]+)\}")?,
            block_placeholder_regex: Regex::new(r"^(block|lambda|action|init|body|builder)$")?,
            // p0, p1, ... are the server's synthetic names
            generic_placeholder_regex: Regex::new(r"^p\d+$")?,
            // ${1}
            bare_tabstop_regex: Regex::new(r"\$\{\d+\}")?,
            // $1
            short_tabstop_regex: Regex::new(r"\$\d+")?,
            parameter_list_regex: Regex::new(r"\(([^)]*)\)")?,
        })
    }

    /// Parameter names of the first parameter list in `signature`
    ///
    /// `makeText(context: Context, text: CharSequence, duration: Int)` yields
    /// `["context", "text", "duration"]`.
    pub fn extract_parameter_names(&self, signature: &str) -> Vec<String> {
        let Some(captures) = self.parameter_list_regex.captures(signature) else {
            return Vec::new();
        };
        let params = captures.get(1).map_or("", |m| m.as_str());
        if params.trim().is_empty() {
            return Vec::new();
        }

        params
            .split(',')
            .filter_map(|param| {
                let name = param.split(':').next().unwrap_or_default().trim();
                (!name.is_empty()).then(|| name.to_string())
            })
            .collect()
    }

    /// Replace `${n:placeholder}` with `names[n - 1]`
    ///
    /// Block-like placeholders (`block`, `lambda`, `action`, `init`, `body`,
    /// `builder`) become an empty line pair. Placeholders without a matching
    /// name keep their text.
    pub fn transform_snippet(&self, text: &str, names: &[String]) -> String {
        self.placeholder_regex
            .replace_all(text, |caps: &Captures| {
                let placeholder = &caps[2];
                if self.block_placeholder_regex.is_match(placeholder) {
                    return "\n\n".to_string();
                }

                caps[1]
                    .parse::<usize>()
                    .ok()
                    .and_then(|tabstop| tabstop.checked_sub(1))
                    .and_then(|index| names.get(index))
                    .cloned()
                    .unwrap_or_else(|| placeholder.to_string())
            })
            .into_owned()
    }

    /// Strip the remaining snippet syntax
    ///
    /// Synthetic `${n:pN}` placeholders are dropped, meaningful placeholder
    /// text is kept, `${n}` and `$n` tabstops are dropped and `\$` is
    /// unescaped. An empty argument list gets the cursor marker: `()` becomes
    /// `(¶)`.
    pub fn cleanup_snippet(&self, snippet: &str) -> String {
        let result = self
            .placeholder_regex
            .replace_all(snippet, |caps: &Captures| {
                let placeholder = &caps[2];
                if self.generic_placeholder_regex.is_match(placeholder) {
                    String::new()
                } else {
                    placeholder.to_string()
                }
            });
        let result = self.bare_tabstop_regex.replace_all(&result, "");
        let result = self.short_tabstop_regex.replace_all(&result, "");
        let result = result.replace("\\$", "$");

        result.replace("()", &format!("({CURSOR_MARKER})"))
    }

    /// Clean up `snippet` and locate the cursor
    ///
    /// The offset is in characters. It is the marker's position when one is
    /// present, otherwise just after the first `(`, otherwise `None`.
    pub fn process_snippet_with_cursor(&self, snippet: &str) -> (String, Option<usize>) {
        let cleaned = self.cleanup_snippet(snippet);

        if let Some(marker) = cleaned.chars().position(|c| c == CURSOR_MARKER) {
            let text: String = cleaned.chars().filter(|c| *c != CURSOR_MARKER).collect();
            return (text, Some(marker));
        }

        let cursor = cleaned.chars().position(|c| c == '(').map(|p| p + 1);
        (cleaned, cursor)
    }
}
