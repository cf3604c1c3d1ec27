//! Conversion of raw server completion items
//!
//! Items are independent, so large responses are converted in chunks on the
//! blocking pool and reassembled in server order.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::kotlin::completion::imports::ImportResolver;
use crate::kotlin::completion::snippet::SnippetTransformer;
use crate::kotlin::completion::{CompletionItem, CompletionItemKind, InsertTextFormat, MatchLevel};
use crate::kotlin::error::BridgeError;

/// Items per blocking-pool task
pub const CONVERSION_CHUNK_SIZE: usize = 64;

/// LSP `InsertTextFormat.Snippet`
const LSP_SNIPPET_FORMAT: i64 = 2;

/// Labels the server emits for keyword placeholders
fn is_noise_label(label: &str) -> bool {
    label.trim().is_empty() || label == "K" || label == "Keyword"
}

#[derive(Debug, Clone)]
pub struct CompletionConverter {
    snippets: SnippetTransformer,
    imports: ImportResolver,
}

impl CompletionConverter {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            snippets: SnippetTransformer::new()?,
            imports: ImportResolver::new()?,
        })
    }

    pub fn import_resolver(&self) -> &ImportResolver {
        &self.imports
    }

    /// Convert one raw item
    ///
    /// `Ok(None)` means the item is filtered out; `Err` means it was not a
    /// completion item at all.
    pub fn convert_item(
        &self,
        raw: &Value,
        file_content: &str,
    ) -> Result<Option<CompletionItem>, BridgeError> {
        let object = raw
            .as_object()
            .ok_or_else(|| BridgeError::conversion("completion item is not an object"))?;

        let label = object
            .get("label")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if is_noise_label(label) {
            return Ok(None);
        }

        let detail = object
            .get("detail")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let kind = object.get("kind").and_then(Value::as_i64).unwrap_or(1);
        let sort_text = object
            .get("sortText")
            .and_then(Value::as_str)
            .map(str::to_string);
        let is_snippet =
            object.get("insertTextFormat").and_then(Value::as_i64) == Some(LSP_SNIPPET_FORMAT);

        let mut insert_text = object
            .get("insertText")
            .and_then(Value::as_str)
            .map(str::to_string);
        let mut cursor_offset = None;

        if is_snippet && let Some(text) = insert_text.take() {
            let (cleaned, cursor) = self.rewrite_snippet(&text, detail, label);
            trace!("Snippet {:?} -> {:?} (cursor {:?})", text, cleaned, cursor);
            insert_text = Some(cleaned);
            cursor_offset = cursor;
        }

        let import_edit = match server_import_statement(object.get("additionalTextEdits")) {
            Some(statement) => Some(
                self.imports
                    .import_edit_from_statement(&statement, file_content),
            ),
            None => self
                .imports
                .needs_import(label, detail, file_content)
                .map(|fqn| self.imports.generate_import_edit(&fqn, file_content)),
        };

        Ok(Some(CompletionItem {
            label: label.to_string(),
            detail: detail.to_string(),
            insert_text,
            insert_text_format: InsertTextFormat::PlainText,
            sort_text,
            kind: CompletionItemKind::from_lsp(kind),
            match_level: MatchLevel::NoMatch,
            additional_text_edits: import_edit.into_iter().collect(),
            cursor_offset,
        }))
    }

    /// Parameter names first, then syntax cleanup
    fn rewrite_snippet(&self, text: &str, detail: &str, label: &str) -> (String, Option<usize>) {
        let signature = if !detail.contains('(') && label.contains('(') {
            label
        } else {
            detail
        };
        let names = self.snippets.extract_parameter_names(signature);

        let transformed = if !names.is_empty() && text.contains("${") {
            self.snippets.transform_snippet(text, &names)
        } else {
            text.to_string()
        };

        self.snippets.process_snippet_with_cursor(&transformed)
    }

    /// Convert a batch sequentially, skipping items that fail
    pub fn convert_items(&self, raw_items: &[Value], file_content: &str) -> Vec<CompletionItem> {
        raw_items
            .iter()
            .filter_map(|raw| match self.convert_item(raw, file_content) {
                Ok(item) => item,
                Err(e) => {
                    debug!(category = e.category(), "Skipping completion item: {}", e);
                    None
                }
            })
            .collect()
    }

    /// Convert on the blocking pool in chunks, preserving server order
    pub async fn convert_parallel(
        self: &Arc<Self>,
        raw_items: Vec<Value>,
        file_content: Arc<str>,
    ) -> Vec<CompletionItem> {
        if raw_items.len() <= CONVERSION_CHUNK_SIZE {
            return self.convert_items(&raw_items, &file_content);
        }

        let mut tasks = Vec::new();
        let mut remaining = raw_items;
        while !remaining.is_empty() {
            let rest = remaining.split_off(remaining.len().min(CONVERSION_CHUNK_SIZE));
            let chunk = std::mem::replace(&mut remaining, rest);
            let converter = Arc::clone(self);
            let content = Arc::clone(&file_content);
            tasks.push(tokio::task::spawn_blocking(move || {
                converter.convert_items(&chunk, &content)
            }));
        }

        let mut items = Vec::new();
        for task in tasks {
            match task.await {
                Ok(chunk) => items.extend(chunk),
                Err(e) => warn!("Completion conversion task failed: {}", e),
            }
        }
        debug!("Converted {} completion items", items.len());
        items
    }
}

/// Item list and `isIncomplete` of a completion response
///
/// Accepts a `CompletionList`, a bare item array, or `null`.
pub fn completion_response_items(result: Value) -> (Vec<Value>, bool) {
    match result {
        Value::Array(items) => (items, false),
        Value::Object(mut list) => {
            let incomplete = list
                .get("isIncomplete")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let items = match list.remove("items") {
                Some(Value::Array(items)) => items,
                _ => Vec::new(),
            };
            (items, incomplete)
        }
        _ => (Vec::new(), false),
    }
}

/// First server edit that is an import statement
fn server_import_statement(edits: Option<&Value>) -> Option<String> {
    edits?
        .as_array()?
        .iter()
        .filter_map(|edit| edit.get("newText").and_then(Value::as_str))
        .map(str::trim)
        .find(|text| text.starts_with("import "))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lsp_types::Position;
    use serde_json::json;

    const FILE: &str = "package com.example.app\n\nimport android.os.Bundle\n\nclass Main\n";

    fn converter() -> CompletionConverter {
        CompletionConverter::new().unwrap()
    }

    #[test]
    fn test_snippet_gets_parameter_names_and_cursor() {
        let item = converter()
            .convert_item(
                &json!({
                    "label": "makeText",
                    "detail": "makeText(context: Context, text: CharSequence, duration: Int)",
                    "kind": 2,
                    "insertText": "makeText(${1:p0}, ${2:p1}, ${3:p2})",
                    "insertTextFormat": 2
                }),
                FILE,
            )
            .unwrap()
            .unwrap();

        assert_eq!(item.insert_text.as_deref(), Some("makeText(context, text, duration)"));
        assert_eq!(item.cursor_offset, Some(9));
        assert_eq!(item.kind, CompletionItemKind::Method);
        assert_eq!(item.insert_text_format, InsertTextFormat::PlainText);
    }

    #[test]
    fn test_snippet_without_parameters_places_cursor_inside_parens() {
        let item = converter()
            .convert_item(
                &json!({
                    "label": "toString",
                    "detail": "toString(): String",
                    "insertText": "toString()",
                    "insertTextFormat": 2
                }),
                FILE,
            )
            .unwrap()
            .unwrap();
        assert_eq!(item.insert_text.as_deref(), Some("toString()"));
        assert_eq!(item.cursor_offset, Some(9));
    }

    #[test]
    fn test_noise_labels_are_dropped() {
        let c = converter();
        for label in ["", "  ", "K", "Keyword"] {
            assert!(c.convert_item(&json!({"label": label}), FILE).unwrap().is_none());
        }
        assert!(c.convert_item(&json!("not an item"), FILE).is_err());
    }

    #[test]
    fn test_server_import_edit_is_preferred() {
        let item = converter()
            .convert_item(
                &json!({
                    "label": "launch",
                    "detail": "kotlinx.coroutines.CoroutineScope",
                    "additionalTextEdits": [
                        {"range": {"start": {"line": 0, "character": 0}, "end": {"line": 0, "character": 0}},
                         "newText": "\nimport kotlinx.coroutines.launch\n"}
                    ]
                }),
                FILE,
            )
            .unwrap()
            .unwrap();

        assert_eq!(item.additional_text_edits.len(), 1);
        let edit = &item.additional_text_edits[0];
        assert_eq!(edit.new_text, "import kotlinx.coroutines.launch\n");
        assert_eq!(edit.range.start, Position::new(3, 0));
    }

    #[test]
    fn test_import_synthesized_from_detail() {
        let c = converter();
        let toast = c
            .convert_item(&json!({"label": "Toast", "detail": "android.widget.Toast", "kind": 7}), FILE)
            .unwrap()
            .unwrap();
        assert_eq!(
            toast.additional_text_edits[0].new_text,
            "import android.widget.Toast\n"
        );

        let bundle = c
            .convert_item(&json!({"label": "Bundle", "detail": "android.os.Bundle", "kind": 7}), FILE)
            .unwrap()
            .unwrap();
        assert!(bundle.additional_text_edits.is_empty());
    }

    #[test]
    fn test_response_shapes() {
        let (items, incomplete) =
            completion_response_items(json!({"isIncomplete": true, "items": [{"label": "a"}]}));
        assert_eq!(items.len(), 1);
        assert!(incomplete);

        let (items, incomplete) = completion_response_items(json!([{"label": "a"}, {"label": "b"}]));
        assert_eq!(items.len(), 2);
        assert!(!incomplete);

        assert!(completion_response_items(Value::Null).0.is_empty());
    }

    #[tokio::test]
    async fn test_parallel_conversion_keeps_order_and_skips_bad_items() {
        let converter = Arc::new(converter());
        let mut raw: Vec<Value> = (0..200)
            .map(|i| json!({"label": format!("item{i:03}"), "kind": 6}))
            .collect();
        raw[10] = json!(42);
        raw[150] = json!({"label": "K"});

        let items = converter.convert_parallel(raw, Arc::from(FILE)).await;
        assert_eq!(items.len(), 198);
        assert_eq!(items[0].label, "item000");
        assert_eq!(items[10].label, "item011");
        assert_eq!(items.last().map(|i| i.label.as_str()), Some("item199"));
    }
}
