//! Document synchronization
//!
//! Tracks which files the server has open and the last version sent for
//! each. Per document the lifecycle is Closed → Opening → Open → Closed,
//! and the versions sent to the server are strictly increasing.
//!
//! The state table is held across each send, so notifications for one
//! document reach the transport in the order they were issued.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use lsp_types::Uri;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::kotlin::config::KOTLIN_LANGUAGE_ID;
use crate::lsp::error::LspError;
use crate::lsp::traits::LspClientTrait;
use crate::lsp::uri::{canonical_path, path_to_uri};
use crate::project::index_cache::sha256_hex;

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("Failed to read {path}: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Path cannot be expressed as a document URI: {0}")]
    InvalidPath(PathBuf),

    #[error("LSP error: {0}")]
    Lsp(#[from] LspError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentPhase {
    /// `didOpen` is being sent
    Opening,
    Open,
}

/// Per-document state owned by the synchronizer
#[derive(Debug, Clone)]
pub struct DocumentState {
    pub uri: Uri,
    pub version: i32,
    pub phase: DocumentPhase,
    pub last_sync: Instant,
    pub content_hash: String,
}

/// What a synchronization call sent to the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// `didOpen` sent with this version
    Opened(i32),
    /// `didChange` sent with this version
    Changed(i32),
    /// Nothing sent
    Unchanged,
}

impl SyncOutcome {
    pub fn sent(&self) -> bool {
        !matches!(self, SyncOutcome::Unchanged)
    }
}

pub struct DocumentSynchronizer {
    client: Arc<dyn LspClientTrait>,
    documents: Mutex<HashMap<PathBuf, DocumentState>>,
    throttle: Duration,
}

impl DocumentSynchronizer {
    pub fn new(client: Arc<dyn LspClientTrait>, throttle: Duration) -> Self {
        Self {
            client,
            documents: Mutex::new(HashMap::new()),
            throttle,
        }
    }

    /// Open `file` if it is not open yet
    ///
    /// Without a `content` snapshot the text is read from disk. If sending
    /// `didOpen` fails the document stays closed.
    pub async fn ensure_open(
        &self,
        file: &Path,
        content: Option<String>,
    ) -> Result<SyncOutcome, DocumentError> {
        let key = canonical_path(file);
        let mut documents = self.documents.lock().await;

        if let Some(state) = documents.get(&key)
            && state.phase == DocumentPhase::Open
        {
            trace!("Document already open: {} (v{})", key.display(), state.version);
            return Ok(SyncOutcome::Unchanged);
        }

        let text = match content {
            Some(text) => text,
            None => read_document(&key).await?,
        };
        self.open_locked(&mut documents, key, text).await
    }

    /// Send the full replacement text of an open document
    ///
    /// A document that is not open is opened with `new_text` instead. The
    /// version sent is `max(last + 1, version)`. An unchanged text inside the
    /// throttle window is not re-sent.
    pub async fn notify_change(
        &self,
        file: &Path,
        new_text: String,
        version: Option<i32>,
    ) -> Result<SyncOutcome, DocumentError> {
        let key = canonical_path(file);
        let mut documents = self.documents.lock().await;

        let hash = sha256_hex(new_text.as_bytes());
        match documents.get(&key) {
            Some(state) if state.phase == DocumentPhase::Open => {
                if state.content_hash == hash && state.last_sync.elapsed() < self.throttle {
                    trace!("Skipping unchanged sync of {}", key.display());
                    return Ok(SyncOutcome::Unchanged);
                }
            }
            _ => {
                debug!("Change for unopened document {}, opening", key.display());
                return self.open_locked(&mut documents, key, new_text).await;
            }
        }

        self.change_locked(&mut documents, &key, new_text, hash, version)
            .await
    }

    /// Bring the server's copy of `file` up to date with `content`
    ///
    /// Opens the document if needed, otherwise sends a change when the text
    /// differs from the last one sent, or unconditionally when `force` is set.
    pub async fn sync(
        &self,
        file: &Path,
        content: String,
        force: bool,
    ) -> Result<SyncOutcome, DocumentError> {
        let key = canonical_path(file);
        let mut documents = self.documents.lock().await;

        let hash = sha256_hex(content.as_bytes());
        match documents.get(&key) {
            Some(state) if state.phase == DocumentPhase::Open => {
                if !force && state.content_hash == hash {
                    return Ok(SyncOutcome::Unchanged);
                }
            }
            _ => return self.open_locked(&mut documents, key, content).await,
        }

        self.change_locked(&mut documents, &key, content, hash, None)
            .await
    }

    /// True when the throttle window has passed since the last sync
    pub async fn needs_resync(&self, file: &Path) -> bool {
        let key = canonical_path(file);
        let documents = self.documents.lock().await;
        match documents.get(&key) {
            Some(state) if state.phase == DocumentPhase::Open => {
                state.last_sync.elapsed() >= self.throttle
            }
            _ => true,
        }
    }

    /// Send `didClose` and forget the document
    ///
    /// Returns false when the document was not open.
    pub async fn close(&self, file: &Path) -> Result<bool, DocumentError> {
        let key = canonical_path(file);
        let mut documents = self.documents.lock().await;

        let Some(state) = documents.remove(&key) else {
            return Ok(false);
        };
        self.client.close_text_document(&state.uri).await?;
        debug!("Closed document {}", key.display());
        Ok(true)
    }

    /// Close every open document, logging failures
    pub async fn close_all(&self) {
        let mut documents = self.documents.lock().await;
        for (path, state) in documents.drain() {
            if let Err(e) = self.client.close_text_document(&state.uri).await {
                debug!("Failed to close {}: {}", path.display(), e);
            }
        }
    }

    /// Forget every document without notifying the server
    ///
    /// For a freshly launched server, which has nothing open. Returns the
    /// number of documents dropped.
    pub async fn reset(&self) -> usize {
        let mut documents = self.documents.lock().await;
        let dropped = documents.len();
        documents.clear();
        if dropped > 0 {
            debug!("Dropped state of {} document(s) for a new server session", dropped);
        }
        dropped
    }

    pub async fn is_open(&self, file: &Path) -> bool {
        let key = canonical_path(file);
        self.documents
            .lock()
            .await
            .get(&key)
            .is_some_and(|state| state.phase == DocumentPhase::Open)
    }

    /// Last version sent for `file`
    pub async fn version_of(&self, file: &Path) -> Option<i32> {
        let key = canonical_path(file);
        self.documents.lock().await.get(&key).map(|state| state.version)
    }

    pub async fn open_documents(&self) -> Vec<PathBuf> {
        self.documents.lock().await.keys().cloned().collect()
    }

    async fn open_locked(
        &self,
        documents: &mut HashMap<PathBuf, DocumentState>,
        key: PathBuf,
        text: String,
    ) -> Result<SyncOutcome, DocumentError> {
        let uri = path_to_uri(&key).map_err(|_| DocumentError::InvalidPath(key.clone()))?;
        let content_hash = sha256_hex(text.as_bytes());

        documents.insert(
            key.clone(),
            DocumentState {
                uri: uri.clone(),
                version: 1,
                phase: DocumentPhase::Opening,
                last_sync: Instant::now(),
                content_hash,
            },
        );

        if let Err(e) = self
            .client
            .open_text_document(&uri, KOTLIN_LANGUAGE_ID, 1, text)
            .await
        {
            warn!("Failed to open {}: {}", key.display(), e);
            documents.remove(&key);
            return Err(e.into());
        }

        if let Some(state) = documents.get_mut(&key) {
            state.phase = DocumentPhase::Open;
            state.last_sync = Instant::now();
        }
        debug!("Opened document {} (v1)", key.display());
        Ok(SyncOutcome::Opened(1))
    }

    async fn change_locked(
        &self,
        documents: &mut HashMap<PathBuf, DocumentState>,
        key: &Path,
        text: String,
        hash: String,
        caller_version: Option<i32>,
    ) -> Result<SyncOutcome, DocumentError> {
        let Some(state) = documents.get_mut(key) else {
            return Ok(SyncOutcome::Unchanged);
        };

        let next = state.version.saturating_add(1).max(caller_version.unwrap_or(0));
        // The version is consumed even if the send fails: the frame may have
        // reached the server.
        state.version = next;

        self.client
            .change_text_document(&state.uri, next, text)
            .await?;

        state.content_hash = hash;
        state.last_sync = Instant::now();
        trace!("Synced {} (v{})", key.display(), next);
        Ok(SyncOutcome::Changed(next))
    }
}

async fn read_document(path: &Path) -> Result<String, DocumentError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|source| DocumentError::FileRead {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lsp::testing::MockLspClient;

    const THROTTLE: Duration = Duration::from_millis(300);

    fn synchronizer() -> (Arc<MockLspClient>, DocumentSynchronizer) {
        let mock = Arc::new(MockLspClient::new());
        let sync = DocumentSynchronizer::new(mock.clone(), THROTTLE);
        (mock, sync)
    }

    fn sent_versions(mock: &MockLspClient) -> Vec<i64> {
        mock.calls()
            .into_iter()
            .filter(|c| c.method == "textDocument/didOpen" || c.method == "textDocument/didChange")
            .filter_map(|c| {
                let params = c.params?;
                params["textDocument"]["version"].as_i64()
            })
            .collect()
    }

    #[tokio::test]
    async fn test_ensure_open_sends_version_one_once() {
        let (mock, sync) = synchronizer();
        let file = Path::new("/work/Main.kt");

        let first = sync
            .ensure_open(file, Some("fun main() {}".to_string()))
            .await
            .unwrap();
        let second = sync
            .ensure_open(file, Some("fun main() {}".to_string()))
            .await
            .unwrap();

        assert_eq!(first, SyncOutcome::Opened(1));
        assert_eq!(second, SyncOutcome::Unchanged);
        assert_eq!(mock.count("textDocument/didOpen"), 1);
        let params = &mock.params_of("textDocument/didOpen")[0];
        assert_eq!(params["textDocument"]["languageId"], "kotlin");
        assert_eq!(params["textDocument"]["uri"], "file:///work/Main.kt");
    }

    #[tokio::test(start_paused = true)]
    async fn test_versions_strictly_increase() {
        let (mock, sync) = synchronizer();
        let file = Path::new("/work/Main.kt");

        sync.ensure_open(file, Some("a".to_string())).await.unwrap();
        for (i, version) in [Some(1), None, Some(10), Some(3), None].into_iter().enumerate() {
            sync.notify_change(file, format!("text {i}"), version)
                .await
                .unwrap();
        }

        let versions = sent_versions(&mock);
        assert_eq!(versions, vec![1, 2, 3, 10, 11, 12]);
        assert!(versions.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(sync.version_of(file).await, Some(12));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_text_throttled_within_window() {
        let (mock, sync) = synchronizer();
        let file = Path::new("/work/Main.kt");

        sync.ensure_open(file, Some("same".to_string())).await.unwrap();
        let skipped = sync
            .notify_change(file, "same".to_string(), None)
            .await
            .unwrap();
        assert_eq!(skipped, SyncOutcome::Unchanged);
        assert!(!sync.needs_resync(file).await);

        tokio::time::advance(THROTTLE).await;
        assert!(sync.needs_resync(file).await);
        let resent = sync
            .notify_change(file, "same".to_string(), None)
            .await
            .unwrap();
        assert_eq!(resent, SyncOutcome::Changed(2));
        assert_eq!(mock.count("textDocument/didChange"), 1);
    }

    #[tokio::test]
    async fn test_change_on_closed_document_opens_it() {
        let (mock, sync) = synchronizer();
        let file = Path::new("/work/Other.kt");

        let outcome = sync
            .notify_change(file, "class Other".to_string(), Some(5))
            .await
            .unwrap();

        assert_eq!(outcome, SyncOutcome::Opened(1));
        assert_eq!(mock.methods(), vec!["textDocument/didOpen"]);
        assert!(sync.is_open(file).await);
    }

    #[tokio::test]
    async fn test_sync_sends_only_when_content_differs() {
        let (mock, sync) = synchronizer();
        let file = Path::new("/work/Main.kt");

        assert_eq!(
            sync.sync(file, "a".to_string(), false).await.unwrap(),
            SyncOutcome::Opened(1)
        );
        assert_eq!(
            sync.sync(file, "a".to_string(), false).await.unwrap(),
            SyncOutcome::Unchanged
        );
        assert_eq!(
            sync.sync(file, "b".to_string(), false).await.unwrap(),
            SyncOutcome::Changed(2)
        );
        assert_eq!(
            sync.sync(file, "b".to_string(), true).await.unwrap(),
            SyncOutcome::Changed(3)
        );
        assert_eq!(mock.count("textDocument/didChange"), 2);
    }

    #[tokio::test]
    async fn test_close_then_reopen_restarts_versions() {
        let (mock, sync) = synchronizer();
        let file = Path::new("/work/Main.kt");

        sync.ensure_open(file, Some("a".to_string())).await.unwrap();
        sync.notify_change(file, "b".to_string(), None).await.unwrap();
        assert!(sync.close(file).await.unwrap());
        assert!(!sync.close(file).await.unwrap());
        assert!(!sync.is_open(file).await);
        assert_eq!(sync.version_of(file).await, None);

        sync.ensure_open(file, Some("c".to_string())).await.unwrap();
        assert_eq!(sync.version_of(file).await, Some(1));
        assert_eq!(mock.count("textDocument/didClose"), 1);
    }

    #[tokio::test]
    async fn test_failed_open_stays_closed() {
        let (mock, sync) = synchronizer();
        mock.set_running(false);
        let file = Path::new("/work/Main.kt");

        let result = sync.ensure_open(file, Some("a".to_string())).await;
        assert!(matches!(result, Err(DocumentError::Lsp(LspError::NotRunning))));
        assert!(!sync.is_open(file).await);

        mock.set_running(true);
        assert_eq!(
            sync.ensure_open(file, Some("a".to_string())).await.unwrap(),
            SyncOutcome::Opened(1)
        );
    }

    #[tokio::test]
    async fn test_ensure_open_reads_from_disk() {
        let (mock, sync) = synchronizer();
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("Disk.kt");
        std::fs::write(&file, "object Disk").unwrap();

        sync.ensure_open(&file, None).await.unwrap();
        let params = &mock.params_of("textDocument/didOpen")[0];
        assert_eq!(params["textDocument"]["text"], "object Disk");

        let missing = sync.ensure_open(&dir.path().join("Missing.kt"), None).await;
        assert!(matches!(missing, Err(DocumentError::FileRead { .. })));
    }

    #[tokio::test]
    async fn test_close_all_closes_every_document() {
        let (mock, sync) = synchronizer();
        sync.ensure_open(Path::new("/work/A.kt"), Some(String::new()))
            .await
            .unwrap();
        sync.ensure_open(Path::new("/work/B.kt"), Some(String::new()))
            .await
            .unwrap();

        sync.close_all().await;
        assert_eq!(mock.count("textDocument/didClose"), 2);
        assert!(sync.open_documents().await.is_empty());
    }

    #[tokio::test]
    async fn test_reset_forgets_documents_without_closing() {
        let (mock, sync) = synchronizer();
        let file = Path::new("/work/A.kt");
        sync.ensure_open(file, Some("a".to_string())).await.unwrap();
        sync.notify_change(file, "b".to_string(), None).await.unwrap();

        assert_eq!(sync.reset().await, 1);
        assert!(!sync.is_open(file).await);
        assert_eq!(mock.count("textDocument/didClose"), 0);

        assert_eq!(
            sync.ensure_open(file, Some("b".to_string())).await.unwrap(),
            SyncOutcome::Opened(1)
        );
        assert_eq!(mock.count("textDocument/didOpen"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_version_hint_at_max_does_not_overflow() {
        let (mock, sync) = synchronizer();
        let file = Path::new("/work/Main.kt");
        sync.ensure_open(file, Some("a".to_string())).await.unwrap();

        assert_eq!(
            sync.notify_change(file, "b".to_string(), Some(i32::MAX))
                .await
                .unwrap(),
            SyncOutcome::Changed(i32::MAX)
        );
        assert_eq!(
            sync.notify_change(file, "c".to_string(), None).await.unwrap(),
            SyncOutcome::Changed(i32::MAX)
        );
        assert_eq!(sent_versions(&mock).last(), Some(&i64::from(i32::MAX)));
    }
}
