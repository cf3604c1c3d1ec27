//! Diagnostics model and the local analysis pass
//!
//! Server-pushed diagnostics are decoded by the notification router. The
//! local pass runs after an idle period: it re-syncs the document (which
//! makes the server publish fresh diagnostics) and looks for class names
//! used without an import that the import index can resolve.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use lsp_types::{Position, Range, TextEdit};
use regex::Regex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::kotlin::completion::ImportIndex;
use crate::kotlin::completion::imports::{
    ImportResolver, has_import, is_auto_imported, is_standard_name,
};
use crate::kotlin::documents::DocumentSynchronizer;
use crate::kotlin::error::BridgeError;
use crate::lsp::uri::{canonical_path, file_uri_string};

pub const MISSING_IMPORT_CODE: &str = "MISSING_IMPORT";
pub const IMPORT_ANALYZER_SOURCE: &str = "kotlin-import-analyzer";
pub const MAX_IMPORT_SUGGESTIONS: usize = 5;

/// Types visible in every Kotlin file besides the builtins
const IMPLICIT_TYPES: &[&str] = &[
    "List", "Map", "Set", "Array", "Pair", "Triple", "Throwable", "Exception", "Error",
    "RuntimeException", "Iterable", "Collection", "Sequence", "Comparator", "Enum", "Annotation",
    "Deprecated", "Suppress", "Object", "Class", "Integer", "Character", "Void", "System", "Math",
    "MutableList", "MutableMap", "MutableSet", "IllegalStateException",
    "IllegalArgumentException", "Companion", "TODO",
];

// ============================================================================
// Diagnostics Model
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DiagnosticSeverity {
    Error,
    Warning,
    Information,
    Hint,
}

impl DiagnosticSeverity {
    /// Map an LSP severity; unknown or missing values count as errors
    pub fn from_lsp(value: Option<i64>) -> Self {
        match value {
            Some(2) => Self::Warning,
            Some(3) => Self::Information,
            Some(4) => Self::Hint,
            _ => Self::Error,
        }
    }
}

/// Diagnostic code, which servers send as a string or a number
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(untagged)]
pub enum DiagnosticCode {
    Text(String),
    Number(i64),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticItem {
    pub message: String,
    pub code: Option<DiagnosticCode>,
    pub range: Range,
    pub source: String,
    pub severity: DiagnosticSeverity,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileDiagnostics {
    pub file: PathBuf,
    pub uri: String,
    pub items: Vec<DiagnosticItem>,
}

/// Outcome of a diagnostics source
///
/// `NoUpdate` means nothing changed; an `Updated` with no items means the
/// file's diagnostics were cleared.
#[derive(Debug, Clone, PartialEq)]
pub enum DiagnosticResult {
    NoUpdate,
    Updated(FileDiagnostics),
}

impl DiagnosticResult {
    pub fn is_no_update(&self) -> bool {
        matches!(self, DiagnosticResult::NoUpdate)
    }
}

// ============================================================================
// Missing Import Analysis
// ============================================================================

/// A class reference without an import, with the classes it could mean
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MissingImport {
    pub name: String,
    pub range: Range,
    pub candidates: Vec<String>,
}

impl MissingImport {
    pub fn to_diagnostic(&self) -> DiagnosticItem {
        let message = match self.candidates.as_slice() {
            [only] => format!("Unresolved reference: {}. Import {only}", self.name),
            many => format!(
                "Unresolved reference: {}. Choose an import ({} options: {})",
                self.name,
                many.len(),
                many.join(", ")
            ),
        };

        DiagnosticItem {
            message,
            code: Some(DiagnosticCode::Text(MISSING_IMPORT_CODE.to_string())),
            range: self.range,
            source: IMPORT_ANALYZER_SOURCE.to_string(),
            severity: DiagnosticSeverity::Warning,
        }
    }

    fn covers(&self, position: Position) -> bool {
        self.range.start <= position && position <= self.range.end
    }
}

/// Import chosen for a missing reference and the edit that adds it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImportFix {
    pub fqn: String,
    pub edit: TextEdit,
}

/// Finds class references that lack an import
#[derive(Debug, Clone)]
pub struct MissingImportAnalyzer {
    class_reference_regex: Regex,
    import_regex: Regex,
    declaration_regex: Regex,
    resolver: ImportResolver,
}

impl MissingImportAnalyzer {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            class_reference_regex: Regex::new(r"\b([A-Z][A-Za-z0-9_]*)\b")?,
            // import a.b.C, import a.b.*, import a.b.C as D
            import_regex: Regex::new(r"(?m)^\s*import\s+([\w.]+?)(\.\*)?(?:\s+as\s+(\w+))?\s*$")?,
            declaration_regex: Regex::new(
                r"\b(?:class|interface|object|typealias)\s+([A-Z][A-Za-z0-9_]*)",
            )?,
            resolver: ImportResolver::new()?,
        })
    }

    pub fn analyze(&self, content: &str, index: &ImportIndex) -> Vec<DiagnosticItem> {
        self.find(content, index)
            .iter()
            .map(MissingImport::to_diagnostic)
            .collect()
    }

    pub fn find(&self, content: &str, index: &ImportIndex) -> Vec<MissingImport> {
        let mut explicit = HashSet::new();
        let mut wildcard_packages = HashSet::new();
        for caps in self.import_regex.captures_iter(content) {
            let path = &caps[1];
            if caps.get(2).is_some() {
                wildcard_packages.insert(path.to_string());
                continue;
            }
            match caps.get(3) {
                Some(alias) => explicit.insert(alias.as_str().to_string()),
                None => explicit.insert(path.rsplit('.').next().unwrap_or(path).to_string()),
            };
        }

        let declared: HashSet<&str> = self
            .declaration_regex
            .captures_iter(content)
            .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
            .collect();

        let file_package = self.resolver.file_package(content).unwrap_or_default();
        let same_package: HashSet<String> = index
            .classes_in_package(file_package)
            .into_iter()
            .collect();

        let mut candidates_by_name: HashMap<&str, Vec<String>> = HashMap::new();
        let mut found = Vec::new();

        for (line_index, line) in content.split('\n').enumerate() {
            if skip_line(line) {
                continue;
            }

            for m in self.class_reference_regex.find_iter(line) {
                let name = m.as_str();
                if name.len() == 1
                    || is_standard_name(name)
                    || IMPLICIT_TYPES.contains(&name)
                    || explicit.contains(name)
                    || declared.contains(name)
                    || same_package.contains(name)
                    || inside_string_literal(line, m.start())
                {
                    continue;
                }

                let candidates = candidates_by_name.entry(name).or_insert_with(|| {
                    index
                        .lookup(name)
                        .into_iter()
                        .filter(|fqn| !is_auto_imported(fqn))
                        .take(MAX_IMPORT_SUGGESTIONS)
                        .collect()
                });
                if candidates.is_empty()
                    || candidates.iter().any(|fqn| {
                        wildcard_packages.iter().any(|package| {
                            fqn.strip_prefix(package.as_str())
                                .and_then(|rest| rest.strip_prefix('.'))
                                == Some(name)
                        })
                    })
                {
                    continue;
                }

                found.push(MissingImport {
                    name: name.to_string(),
                    range: reference_range(line, line_index, m.start(), m.end()),
                    candidates: candidates.clone(),
                });
            }
        }

        found
    }
}

fn skip_line(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.is_empty()
        || trimmed.starts_with("import ")
        || trimmed.starts_with("package ")
        || trimmed.starts_with("//")
        || trimmed.starts_with("/*")
        || trimmed.starts_with('*')
        || trimmed.starts_with('@')
}

fn inside_string_literal(line: &str, byte_offset: usize) -> bool {
    line[..byte_offset].matches('"').count() % 2 == 1
}

/// Columns in characters, like the positions the editor sends
fn reference_range(line: &str, line_index: usize, start: usize, end: usize) -> Range {
    let start_col = line[..start].chars().count() as u32;
    let end_col = start_col + line[start..end].chars().count() as u32;
    let line_index = line_index as u32;
    Range::new(
        Position::new(line_index, start_col),
        Position::new(line_index, end_col),
    )
}

// ============================================================================
// Diagnostics Analyzer
// ============================================================================

/// Runs the local analysis pass, at most once at a time per file
pub struct DiagnosticsAnalyzer {
    documents: Arc<DocumentSynchronizer>,
    index: Arc<ImportIndex>,
    missing_imports: MissingImportAnalyzer,
    in_flight: Mutex<HashSet<PathBuf>>,
    findings: Mutex<HashMap<PathBuf, Vec<MissingImport>>>,
}

/// Removes a file from the in-flight set when the analysis ends
struct InFlightGuard<'a> {
    in_flight: &'a Mutex<HashSet<PathBuf>>,
    file: PathBuf,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.file);
    }
}

impl DiagnosticsAnalyzer {
    pub fn new(
        documents: Arc<DocumentSynchronizer>,
        index: Arc<ImportIndex>,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            documents,
            index,
            missing_imports: MissingImportAnalyzer::new()?,
            in_flight: Mutex::new(HashSet::new()),
            findings: Mutex::new(HashMap::new()),
        })
    }

    /// Analyze `file` with its current `content`
    ///
    /// Returns `NoUpdate` when an analysis of the file is already running or
    /// when the local findings did not change since the last run.
    pub async fn analyze(&self, file: &Path, content: String) -> DiagnosticResult {
        let key = canonical_path(file);
        let Some(_guard) = self.begin(&key) else {
            debug!("Analysis already running for {}, skipping", key.display());
            return DiagnosticResult::NoUpdate;
        };

        if let Err(e) = self.documents.sync(&key, content.clone(), false).await {
            let error = BridgeError::from(e);
            warn!(category = error.category(), "Sync before analysis failed: {}", error);
        }

        let found = self.missing_imports.find(&content, &self.index);
        trace!("Local analysis of {}: {} item(s)", key.display(), found.len());

        let items: Vec<DiagnosticItem> = found.iter().map(MissingImport::to_diagnostic).collect();
        {
            let mut findings = self
                .findings
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if findings.get(&key) == Some(&found) {
                return DiagnosticResult::NoUpdate;
            }
            findings.insert(key.clone(), found);
        }

        let uri = file_uri_string(&key).unwrap_or_else(|_| key.display().to_string());
        DiagnosticResult::Updated(FileDiagnostics {
            file: key,
            uri,
            items,
        })
    }

    /// Candidate imports for the missing reference at `range.start`
    ///
    /// Empty unless the last analysis of `file` flagged that position.
    pub fn import_options(&self, file: &Path, range: Range) -> Vec<String> {
        self.findings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&canonical_path(file))
            .and_then(|found| found.iter().find(|m| m.covers(range.start)))
            .map(|m| m.candidates.clone())
            .unwrap_or_default()
    }

    /// Edit importing `choice`, or the first candidate when `choice` is not one
    ///
    /// `None` when nothing is flagged at `range` or `content` already has
    /// the import.
    pub fn import_fix(
        &self,
        file: &Path,
        range: Range,
        content: &str,
        choice: Option<&str>,
    ) -> Option<ImportFix> {
        let options = self.import_options(file, range);
        let fqn = match choice {
            Some(choice) if options.iter().any(|o| o == choice) => choice.to_string(),
            _ => options.into_iter().next()?,
        };
        if has_import(content, &fqn) {
            debug!("{} is already imported", fqn);
            return None;
        }

        let edit = self.missing_imports.resolver.generate_import_edit(&fqn, content);
        Some(ImportFix { fqn, edit })
    }

    /// Drop the remembered result for a closed file
    pub fn forget(&self, file: &Path) {
        self.findings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&canonical_path(file));
    }

    fn begin(&self, key: &Path) -> Option<InFlightGuard<'_>> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if !in_flight.insert(key.to_path_buf()) {
            return None;
        }
        Some(InFlightGuard {
            in_flight: &self.in_flight,
            file: key.to_path_buf(),
        })
    }
}

// ============================================================================
// Analysis Scheduler
// ============================================================================

/// Idle debounce in front of the analysis pass
///
/// Each `touch` restarts the file's timer; the analysis runs with the most
/// recent content once the file has been idle for the configured period.
pub struct AnalysisScheduler {
    sender: mpsc::UnboundedSender<(PathBuf, String)>,
    task: JoinHandle<()>,
}

impl AnalysisScheduler {
    pub fn spawn<F, Fut>(idle: Duration, run: F) -> Self
    where
        F: Fn(PathBuf, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (sender, mut receiver) = mpsc::unbounded_channel::<(PathBuf, String)>();

        let task = tokio::spawn(async move {
            let mut pending: HashMap<PathBuf, (String, Instant)> = HashMap::new();

            loop {
                let next_deadline = pending.values().map(|(_, deadline)| *deadline).min();

                tokio::select! {
                    message = receiver.recv() => match message {
                        Some((file, content)) => {
                            pending.insert(file, (content, Instant::now() + idle));
                        }
                        None => break,
                    },
                    _ = sleep_until_or_forever(next_deadline) => {
                        let now = Instant::now();
                        let due: Vec<PathBuf> = pending
                            .iter()
                            .filter(|(_, (_, deadline))| *deadline <= now)
                            .map(|(file, _)| file.clone())
                            .collect();
                        for file in due {
                            if let Some((content, _)) = pending.remove(&file) {
                                trace!("Idle period elapsed for {}", file.display());
                                tokio::spawn(run(file, content));
                            }
                        }
                    }
                }
            }

            trace!("AnalysisScheduler: stopped");
        });

        Self { sender, task }
    }

    /// Record activity on `file`
    pub fn touch(&self, file: &Path, content: String) {
        if self
            .sender
            .send((canonical_path(file), content))
            .is_err()
        {
            debug!("AnalysisScheduler stopped, dropping touch for {}", file.display());
        }
    }

    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for AnalysisScheduler {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn sleep_until_or_forever(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
