//! Request pipeline
//!
//! Every editor request goes through here: the document is brought up to
//! date, the request is sent with its own timeout, and the raw result is
//! converted. Failures never reach the caller; they are logged with their
//! [`BridgeError`] category and the operation returns its empty default.
//!
//! Completion is debounced per file with "latest wins" semantics: a new
//! request cancels the previous one for the same file, and a request that is
//! no longer the last one issued returns a superseded, empty list.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use lsp_types::{FormattingOptions, Location, LocationLink, Position, TextEdit, Uri};
use serde::Serialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::kotlin::completion::converter::completion_response_items;
use crate::kotlin::completion::{
    ClassCandidateSource, CompletionCandidate, CompletionConverter, CompletionList, char_before,
    completion_prefix, merge_candidates,
};
use crate::kotlin::config::{
    CLASSPATH_COMPLETION_LIMIT, CLASSPATH_COMPLETION_MIN_PREFIX, FORMAT_MAX_WIDTH, FormatStyle,
    PipelineConfig,
};
use crate::kotlin::documents::DocumentSynchronizer;
use crate::kotlin::error::BridgeError;
use crate::log_timing;
use crate::lsp::traits::LspClientTrait;
use crate::lsp::uri::{canonical_path, path_to_uri};

// ============================================================================
// Request and Result Types
// ============================================================================

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub file: PathBuf,
    pub position: Position,
    /// Editor snapshot of the whole file
    pub content: String,
}

/// Hover text, empty when nothing is known
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HoverContent {
    pub value: String,
    pub markdown: bool,
}

impl HoverContent {
    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignatureInfo {
    pub label: String,
    pub documentation: Option<String>,
    pub parameters: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SignatureHelpResult {
    pub signatures: Vec<SignatureInfo>,
    pub active_signature: u32,
    pub active_parameter: u32,
}

// ============================================================================
// Pipeline
// ============================================================================

struct CompletionSlot {
    sequence: u64,
    token: CancellationToken,
}

pub struct RequestPipeline {
    client: Arc<dyn LspClientTrait>,
    documents: Arc<DocumentSynchronizer>,
    converter: Arc<CompletionConverter>,
    classes: Arc<dyn ClassCandidateSource>,
    config: PipelineConfig,
    next_sequence: AtomicU64,
    completions: Mutex<HashMap<PathBuf, CompletionSlot>>,
}

impl RequestPipeline {
    pub fn new(
        client: Arc<dyn LspClientTrait>,
        documents: Arc<DocumentSynchronizer>,
        classes: Arc<dyn ClassCandidateSource>,
        config: PipelineConfig,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            client,
            documents,
            converter: Arc::new(CompletionConverter::new()?),
            classes,
            config,
            next_sequence: AtomicU64::new(0),
            completions: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    // ========================================================================
    // Completion
    // ========================================================================

    /// Debounced completion at `request.position`
    pub async fn complete(&self, request: CompletionRequest) -> CompletionList {
        let start = Instant::now();
        let key = canonical_path(&request.file);
        let (sequence, token) = self.begin_completion(&key);

        let outcome = tokio::time::timeout(
            self.config.completion_timeout,
            self.run_completion(&key, request, sequence, &token),
        )
        .await;
        self.finish_completion(&key, sequence);

        let list = match outcome {
            Ok(Ok(list)) => list,
            Ok(Err(e)) => {
                log_failure("completion", &e);
                CompletionList::default()
            }
            Err(_) => {
                log_failure("completion", &BridgeError::timeout("completion"));
                CompletionList::default()
            }
        };

        log_timing!(tracing::Level::DEBUG, "completion", start.elapsed());
        list
    }

    async fn run_completion(
        &self,
        key: &Path,
        request: CompletionRequest,
        sequence: u64,
        token: &CancellationToken,
    ) -> Result<CompletionList, BridgeError> {
        tokio::select! {
            _ = token.cancelled() => return Ok(CompletionList::superseded()),
            _ = tokio::time::sleep(self.config.completion_debounce) => {}
        }
        if !self.is_latest(key, sequence) {
            trace!("Completion #{} superseded after debounce", sequence);
            return Ok(CompletionList::superseded());
        }

        let resync = self.documents.needs_resync(key).await;
        self.documents
            .sync(key, request.content.clone(), resync)
            .await?;
        if resync {
            tokio::time::sleep(self.config.resync_settle).await;
        }
        if token.is_cancelled() {
            return Ok(CompletionList::superseded());
        }

        let uri = path_to_uri(key)?;
        let trigger = (char_before(&request.content, request.position) == Some('.'))
            .then(|| ".".to_string());

        let response = tokio::select! {
            _ = token.cancelled() => return Ok(CompletionList::superseded()),
            response = self.client.completion(
                &uri,
                request.position,
                trigger,
                self.config.completion_timeout,
            ) => response?,
        };

        let (raw_items, is_incomplete) = completion_response_items(response);
        debug!("Completion #{}: {} raw item(s)", sequence, raw_items.len());

        let content: Arc<str> = Arc::from(request.content);
        let items = self
            .converter
            .convert_parallel(raw_items, Arc::clone(&content))
            .await;

        let prefix = completion_prefix(&content, request.position);
        let mut candidates: Vec<CompletionCandidate> =
            items.into_iter().map(CompletionCandidate::Server).collect();
        if prefix.chars().count() >= CLASSPATH_COMPLETION_MIN_PREFIX {
            candidates.extend(
                self.classes
                    .classes_with_prefix(&prefix, CLASSPATH_COMPLETION_LIMIT)
                    .into_iter()
                    .map(CompletionCandidate::Classpath),
            );
        }

        let items = merge_candidates(
            candidates,
            self.converter.import_resolver(),
            &content,
            &prefix,
        );
        Ok(CompletionList {
            items,
            is_incomplete,
            superseded: false,
        })
    }

    /// Register a new completion for `key`, cancelling the previous one
    fn begin_completion(&self, key: &Path) -> (u64, CancellationToken) {
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let token = CancellationToken::new();
        let previous = self
            .completions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                key.to_path_buf(),
                CompletionSlot {
                    sequence,
                    token: token.clone(),
                },
            );
        if let Some(previous) = previous {
            trace!("Completion #{} cancels #{}", sequence, previous.sequence);
            previous.token.cancel();
        }
        (sequence, token)
    }

    fn is_latest(&self, key: &Path, sequence: u64) -> bool {
        self.completions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .is_some_and(|slot| slot.sequence == sequence)
    }

    fn finish_completion(&self, key: &Path, sequence: u64) {
        let mut completions = self
            .completions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if completions
            .get(key)
            .is_some_and(|slot| slot.sequence == sequence)
        {
            completions.remove(key);
        }
    }

    // ========================================================================
    // Hover, Navigation and Signature Help
    // ========================================================================

    pub async fn hover(&self, file: &Path, position: Position) -> HoverContent {
        let result = async {
            let uri = self.prepare(file).await?;
            let response = self
                .client
                .hover(&uri, position, self.config.hover_timeout)
                .await?;
            Ok::<_, BridgeError>(hover_content(&response))
        }
        .await;

        result.unwrap_or_else(|e| {
            log_failure("hover", &e);
            HoverContent::default()
        })
    }

    pub async fn definition(&self, file: &Path, position: Position) -> Vec<Location> {
        let result = async {
            let uri = self.prepare(file).await?;
            let response = self
                .client
                .definition(&uri, position, self.config.definition_timeout)
                .await?;
            Ok::<_, BridgeError>(locations(response))
        }
        .await;

        result.unwrap_or_else(|e| {
            log_failure("definition", &e);
            Vec::new()
        })
    }

    pub async fn references(
        &self,
        file: &Path,
        position: Position,
        include_declaration: bool,
    ) -> Vec<Location> {
        let result = async {
            let uri = self.prepare(file).await?;
            let response = self
                .client
                .references(
                    &uri,
                    position,
                    include_declaration,
                    self.config.references_timeout,
                )
                .await?;
            Ok::<_, BridgeError>(locations(response))
        }
        .await;

        result.unwrap_or_else(|e| {
            log_failure("references", &e);
            Vec::new()
        })
    }

    /// Signature help with the editor's current `content`
    pub async fn signature_help(
        &self,
        file: &Path,
        position: Position,
        content: String,
    ) -> SignatureHelpResult {
        let trigger = match char_before(&content, position) {
            Some(c @ ('(' | ',')) => Some(c.to_string()),
            _ => None,
        };

        let result = async {
            self.documents.sync(file, content, false).await?;
            let uri = path_to_uri(&canonical_path(file))?;
            let response = self
                .client
                .signature_help(&uri, position, trigger, self.config.signature_help_timeout)
                .await?;
            Ok::<_, BridgeError>(signature_help(&response))
        }
        .await;

        result.unwrap_or_else(|e| {
            log_failure("signature help", &e);
            SignatureHelpResult::default()
        })
    }

    // ========================================================================
    // Formatting
    // ========================================================================

    /// Whole-document ktfmt edits for a `.kt` or `.kts` file
    ///
    /// With `content` the server copy is synced to it first; otherwise the
    /// document is opened from disk if needed. Other files get no edits.
    pub async fn format(&self, file: &Path, content: Option<String>) -> Vec<TextEdit> {
        if !is_kotlin_source(file) {
            debug!("Not formatting non-Kotlin file {}", file.display());
            return Vec::new();
        }
        let start = Instant::now();
        let style = self.config.format_style;

        let result = async {
            let uri = match content {
                Some(text) => {
                    self.documents.sync(file, text, false).await?;
                    path_to_uri(&canonical_path(file))?
                }
                None => self.prepare(file).await?,
            };
            self.client
                .change_configuration(formatting_settings(style))
                .await?;
            let response = self
                .client
                .formatting(&uri, formatting_options(style), self.config.format_timeout)
                .await?;
            text_edits(response)
        }
        .await;

        let edits = result.unwrap_or_else(|e| {
            log_failure("formatting", &e);
            Vec::new()
        });
        log_timing!(tracing::Level::DEBUG, "formatting", start.elapsed());
        edits
    }

    async fn prepare(&self, file: &Path) -> Result<Uri, BridgeError> {
        self.documents.ensure_open(file, None).await?;
        Ok(path_to_uri(&canonical_path(file))?)
    }
}

fn log_failure(operation: &str, error: &BridgeError) {
    match error {
        BridgeError::TransportUnavailable(_) => {
            debug!(category = error.category(), "{} skipped: {}", operation, error)
        }
        _ => warn!(category = error.category(), "{} failed: {}", operation, error),
    }
}

fn is_kotlin_source(file: &Path) -> bool {
    file.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext == "kt" || ext == "kts")
}

/// `workspace/didChangeConfiguration` body selecting ktfmt
pub fn formatting_settings(style: FormatStyle) -> Value {
    json!({
        "kotlin": {
            "formatting": {
                "formatter": "ktfmt",
                "ktfmt": {
                    "style": style.as_str(),
                    "indent": style.indent(),
                    "maxWidth": FORMAT_MAX_WIDTH,
                    "removeUnusedImports": true
                }
            }
        }
    })
}

pub fn formatting_options(style: FormatStyle) -> FormattingOptions {
    FormattingOptions {
        tab_size: style.indent(),
        insert_spaces: true,
        trim_trailing_whitespace: Some(true),
        insert_final_newline: Some(true),
        trim_final_newlines: Some(true),
        ..Default::default()
    }
}

// ============================================================================
// Result Conversion
// ============================================================================

/// Edits of a formatting response; `null` means the document is already formatted
pub fn text_edits(response: Value) -> Result<Vec<TextEdit>, BridgeError> {
    match response {
        Value::Null => Ok(Vec::new()),
        other => serde_json::from_value(other)
            .map_err(|e| BridgeError::conversion(format!("formatting edits: {e}"))),
    }
}

/// Hover contents as text
///
/// `MarkupContent` keeps its kind; marked strings and arrays are markdown,
/// array entries joined by a blank line; a bare string is plain text.
pub fn hover_content(response: &Value) -> HoverContent {
    let Some(contents) = response.get("contents") else {
        return HoverContent::default();
    };

    match contents {
        Value::String(text) => HoverContent {
            value: text.clone(),
            markdown: false,
        },
        Value::Object(object) => {
            let value = object
                .get("value")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let markdown = match object.get("kind").and_then(Value::as_str) {
                Some(kind) => kind == "markdown",
                None => true,
            };
            HoverContent { value, markdown }
        }
        Value::Array(entries) => {
            let parts: Vec<&str> = entries
                .iter()
                .filter_map(|entry| match entry {
                    Value::String(text) => Some(text.as_str()),
                    other => other.get("value").and_then(Value::as_str),
                })
                .filter(|text| !text.is_empty())
                .collect();
            HoverContent {
                value: parts.join("\n\n"),
                markdown: true,
            }
        }
        _ => HoverContent::default(),
    }
}

/// Locations of a definition or references response
///
/// Accepts a single `Location`, an array of them, or `LocationLink`s.
pub fn locations(response: Value) -> Vec<Location> {
    let entries = match response {
        Value::Array(entries) => entries,
        Value::Null => return Vec::new(),
        single => vec![single],
    };

    entries
        .into_iter()
        .filter_map(|entry| {
            if entry.get("targetUri").is_some() {
                serde_json::from_value::<LocationLink>(entry)
                    .map(|link| Location::new(link.target_uri, link.target_selection_range))
                    .map_err(|e| debug!("Skipping location link: {}", e))
                    .ok()
            } else {
                serde_json::from_value::<Location>(entry)
                    .map_err(|e| debug!("Skipping location: {}", e))
                    .ok()
            }
        })
        .collect()
}

pub fn signature_help(response: &Value) -> SignatureHelpResult {
    let signatures = response
        .get("signatures")
        .and_then(Value::as_array)
        .map(|signatures| signatures.iter().filter_map(signature_info).collect())
        .unwrap_or_default();

    let index = |field: &str| {
        response
            .get(field)
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(0)
    };

    SignatureHelpResult {
        signatures,
        active_signature: index("activeSignature"),
        active_parameter: index("activeParameter"),
    }
}

fn signature_info(signature: &Value) -> Option<SignatureInfo> {
    let label = signature.get("label").and_then(Value::as_str)?.to_string();
    let documentation = signature.get("documentation").and_then(documentation_text);
    let parameters = signature
        .get("parameters")
        .and_then(Value::as_array)
        .map(|parameters| {
            parameters
                .iter()
                .filter_map(|parameter| parameter_label(&label, parameter.get("label")?))
                .collect()
        })
        .unwrap_or_default();

    Some(SignatureInfo {
        label,
        documentation,
        parameters,
    })
}

fn documentation_text(documentation: &Value) -> Option<String> {
    match documentation {
        Value::String(text) => Some(text.clone()),
        other => other.get("value").and_then(Value::as_str).map(str::to_string),
    }
}

/// Parameter label, given inline or as UTF-16 offsets into the signature
fn parameter_label(signature: &str, label: &Value) -> Option<String> {
    match label {
        Value::String(text) => Some(text.clone()),
        Value::Array(offsets) => {
            let start = usize::try_from(offsets.first()?.as_u64()?).ok()?;
            let end = usize::try_from(offsets.get(1)?.as_u64()?).ok()?;
            let units: Vec<u16> = signature.encode_utf16().collect();
            let slice = units.get(start..end)?;
            Some(String::from_utf16_lossy(slice))
        }
        _ => None,
    }
}
