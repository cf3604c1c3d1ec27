//! Editor-facing facade
//!
//! [`KotlinBridge`] owns one project's language server session and every
//! component around it. Editor activity comes in as [`EditorEvent`]s;
//! requests return plain result values, never errors.

use lsp_types::{Location, Position, Range, TextEdit};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

use crate::kotlin::completion::CompletionList;
use crate::kotlin::completion::imports::apply_line_insert;
use crate::kotlin::completion::index::ImportIndex;
use crate::kotlin::diagnostics::{
    AnalysisScheduler, DiagnosticResult, DiagnosticsAnalyzer, ImportFix,
};
use crate::kotlin::notifications::ServerMessage;
use crate::kotlin::requests::{CompletionRequest, HoverContent, SignatureHelpResult};
use crate::kotlin::{
    BridgeError, DocumentSynchronizer, KotlinServer, KotlinServerConfig, NotificationRouter,
    RequestPipeline,
};
use crate::lsp::LspClientTrait;
use crate::project::classpath::{ClasspathAssembler, ProjectModelProvider};
use crate::project::index_cache::{self, CacheStats};
use crate::project::watcher::BuildWatcher;
use crate::project::workspace::{ServerHandle, SetupReport, WorkspaceSetup};

/// Editor activity on a Kotlin file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditorEvent {
    Opened {
        file: PathBuf,
        content: String,
    },
    Changed {
        file: PathBuf,
        content: String,
        version: Option<i32>,
    },
    /// The editor switched to an already open file
    Selected {
        file: PathBuf,
        content: String,
    },
    Closed {
        file: PathBuf,
    },
}

pub struct KotlinBridge {
    config: KotlinServerConfig,
    server: Arc<dyn ServerHandle>,
    router: Arc<NotificationRouter>,
    documents: Arc<DocumentSynchronizer>,
    pipeline: RequestPipeline,
    analyzer: Arc<DiagnosticsAnalyzer>,
    scheduler: AnalysisScheduler,
    index: Arc<ImportIndex>,
    workspace: Arc<WorkspaceSetup>,
    watcher: Mutex<Option<BuildWatcher>>,
    cache_root: PathBuf,
}

impl KotlinBridge {
    /// Bridge for the project described by `provider`
    ///
    /// Must be called inside a tokio runtime. Nothing is launched until
    /// [`start`](Self::start).
    pub fn new(
        config: KotlinServerConfig,
        provider: Arc<dyn ProjectModelProvider>,
        cache_root: &Path,
    ) -> Result<Self, BridgeError> {
        let router = Arc::new(NotificationRouter::new());
        let server = Arc::new(KotlinServer::new(config.clone(), Arc::clone(&router)));
        Self::with_server(server, router, config, provider, cache_root)
    }

    /// Bridge over an existing server handle
    ///
    /// `router` must be the router the server delivers its notifications to.
    pub fn with_server<S: ServerHandle + 'static>(
        server: Arc<S>,
        router: Arc<NotificationRouter>,
        config: KotlinServerConfig,
        provider: Arc<dyn ProjectModelProvider>,
        cache_root: &Path,
    ) -> Result<Self, BridgeError> {
        let client: Arc<dyn LspClientTrait> = server.clone();
        let server: Arc<dyn ServerHandle> = server;
        let documents = Arc::new(DocumentSynchronizer::new(
            client.clone(),
            config.pipeline.sync_throttle,
        ));
        let index = Arc::new(ImportIndex::new());

        let pipeline = RequestPipeline::new(
            client,
            Arc::clone(&documents),
            index.clone(),
            config.pipeline.clone(),
        )
        .map_err(pattern_error)?;
        let analyzer = Arc::new(
            DiagnosticsAnalyzer::new(Arc::clone(&documents), Arc::clone(&index))
                .map_err(pattern_error)?,
        );

        let scheduler = {
            let analyzer = Arc::clone(&analyzer);
            let router = Arc::clone(&router);
            AnalysisScheduler::spawn(config.pipeline.analysis_idle, move |file, content| {
                let analyzer = Arc::clone(&analyzer);
                let router = Arc::clone(&router);
                async move {
                    let result = analyzer.analyze(&file, content).await;
                    router.publish(result);
                }
            })
        };

        let workspace = Arc::new(WorkspaceSetup::new(
            Arc::clone(&server),
            config.clone(),
            Arc::new(ClasspathAssembler::new(provider)),
            cache_root,
            Arc::clone(&index),
        ));

        Ok(Self {
            config,
            server,
            router,
            documents,
            pipeline,
            analyzer,
            scheduler,
            index,
            workspace,
            watcher: Mutex::new(None),
            cache_root: cache_root.to_path_buf(),
        })
    }

    /// Set up the workspace and start watching build outputs
    ///
    /// Also the way back after the server died: setup begins a new session,
    /// so documents the previous server had open are opened again on demand.
    pub async fn start(&self) -> Result<SetupReport, BridgeError> {
        self.documents.reset().await;
        let report = self.workspace.setup().await?;
        info!(
            "Kotlin workspace ready: {} classpath entries, {} symbols{}",
            report.classpath_len,
            report.symbol_count,
            if report.restored_from_cache { " (from cache)" } else { "" }
        );
        self.watch_build_outputs();
        Ok(report)
    }

    fn watch_build_outputs(&self) {
        let dirs = self.workspace.classpath().generated_roots();
        let workspace = Arc::clone(&self.workspace);
        let spawned = BuildWatcher::spawn(dirs, self.config.pipeline.watcher_quiet_period, move || {
            let workspace = Arc::clone(&workspace);
            async move {
                if let Err(e) = workspace.reload().await {
                    warn!(category = e.category(), "Classpath reload failed: {}", e);
                }
            }
        });

        match spawned {
            Ok(watcher) => {
                *self.watcher.lock().unwrap_or_else(PoisonError::into_inner) = Some(watcher);
            }
            Err(e) => warn!("Build outputs will not be watched: {}", e),
        }
    }

    // ========================================================================
    // Editor Events
    // ========================================================================

    /// Apply editor activity and schedule the local analysis pass
    ///
    /// The analysis is scheduled even when syncing with the server fails.
    pub async fn handle_event(&self, event: EditorEvent) -> Result<(), BridgeError> {
        match event {
            EditorEvent::Opened { file, content } => {
                let result = self
                    .documents
                    .ensure_open(&file, Some(content.clone()))
                    .await;
                self.scheduler.touch(&file, content);
                result?;
            }
            EditorEvent::Changed {
                file,
                content,
                version,
            } => {
                let result = self
                    .documents
                    .notify_change(&file, content.clone(), version)
                    .await;
                self.scheduler.touch(&file, content);
                result?;
            }
            EditorEvent::Selected { file, content } => {
                let result = self.documents.sync(&file, content.clone(), false).await;
                self.scheduler.touch(&file, content);
                result?;
            }
            EditorEvent::Closed { file } => {
                self.analyzer.forget(&file);
                self.documents.close(&file).await?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Requests
    // ========================================================================

    pub async fn complete(&self, request: CompletionRequest) -> CompletionList {
        self.pipeline.complete(request).await
    }

    pub async fn hover(&self, file: &Path, position: Position) -> HoverContent {
        self.pipeline.hover(file, position).await
    }

    pub async fn definition(&self, file: &Path, position: Position) -> Vec<Location> {
        self.pipeline.definition(file, position).await
    }

    pub async fn references(
        &self,
        file: &Path,
        position: Position,
        include_declaration: bool,
    ) -> Vec<Location> {
        self.pipeline
            .references(file, position, include_declaration)
            .await
    }

    pub async fn signature_help(
        &self,
        file: &Path,
        position: Position,
        content: String,
    ) -> SignatureHelpResult {
        self.pipeline.signature_help(file, position, content).await
    }

    pub async fn format(&self, file: &Path, content: Option<String>) -> Vec<TextEdit> {
        self.pipeline.format(file, content).await
    }

    // ========================================================================
    // Import Quick Fix
    // ========================================================================

    /// Classes that would resolve the missing reference at `range`
    pub fn import_options(&self, file: &Path, range: Range) -> Vec<String> {
        self.analyzer.import_options(file, range)
    }

    /// Add the import for the missing reference at `range`
    ///
    /// Imports `choice` when it is one of the options, else the first option.
    /// The edited text is sent to the server and re-analyzed; the applied
    /// edit is returned so the editor can mirror it. `None` when there is
    /// nothing to import.
    pub async fn apply_import_fix(
        &self,
        file: &Path,
        range: Range,
        content: String,
        choice: Option<&str>,
    ) -> Result<Option<ImportFix>, BridgeError> {
        let Some(fix) = self.analyzer.import_fix(file, range, &content, choice) else {
            return Ok(None);
        };

        let edited = apply_line_insert(&content, &fix.edit);
        let result = self
            .documents
            .notify_change(file, edited.clone(), None)
            .await;
        self.scheduler.touch(file, edited);
        result?;

        debug!("Imported {} into {}", fix.fqn, file.display());
        Ok(Some(fix))
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn set_diagnostics_callback<F>(&self, callback: F)
    where
        F: Fn(DiagnosticResult) + Send + Sync + 'static,
    {
        self.router.set_diagnostics_callback(callback);
    }

    pub fn set_message_callback<F>(&self, callback: F)
    where
        F: Fn(ServerMessage) + Send + Sync + 'static,
    {
        self.router.set_message_callback(callback);
    }

    pub fn classpath(&self) -> Vec<PathBuf> {
        self.workspace.classpath().assemble()
    }

    pub fn sdk_path(&self) -> Option<PathBuf> {
        self.config
            .android_sdk
            .clone()
            .or_else(|| self.workspace.classpath().android_sdk_path())
    }

    pub fn import_index(&self) -> &Arc<ImportIndex> {
        &self.index
    }

    pub fn is_running(&self) -> bool {
        self.server.is_running()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.workspace.cache_stats()
    }

    pub fn clear_cache(&self) {
        self.workspace.clear_cache();
    }

    /// Remove the index caches of every project under this cache root
    pub fn clear_all_caches(&self) -> Result<(), BridgeError> {
        index_cache::clear_all(&self.cache_root)?;
        Ok(())
    }

    pub fn total_cache_size(&self) -> u64 {
        index_cache::total_size(&self.cache_root)
    }

    /// Stop watching, close every document and shut the server down
    pub async fn shutdown(&self) {
        if let Some(watcher) = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            watcher.stop();
        }
        self.scheduler.shutdown();
        self.documents.close_all().await;
        self.server.shutdown().await;
        debug!("Kotlin bridge shut down");
    }
}

fn pattern_error(error: regex::Error) -> BridgeError {
    BridgeError::conversion(format!("invalid built-in pattern: {error}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kotlin::diagnostics::MISSING_IMPORT_CODE;
    use crate::lsp::testing::MockReply;
    use crate::project::classpath::StaticProjectModel;
    use crate::project::workspace::mock::MockServer;
    use crate::test_utils::fixtures::{FakeServerHome, TestKotlinProject};
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[cfg(feature = "test-logging")]
    crate::setup_test_logging!();

    const ACTIVITY: &str = "package com.example.app\n\nclass MainActivity {\n    fun show() {\n        Toast.makeText(null, \"hi\", 0)\n    }\n}\n";

    struct Fixture {
        _home: FakeServerHome,
        project: TestKotlinProject,
        _cache_root: tempfile::TempDir,
        server: Arc<MockServer>,
        bridge: KotlinBridge,
    }

    fn fixture() -> Fixture {
        let home = FakeServerHome::new().unwrap();
        let project = TestKotlinProject::new().unwrap();
        let config = KotlinServerConfig::builder()
            .server_home(&home.server_home)
            .java_home(&home.java_home)
            .build()
            .unwrap();
        let mut model = StaticProjectModel::new(&project.root);
        model.gradle_user_home = Some(project.root.join("no-gradle"));

        let cache_root = tempfile::tempdir().unwrap();
        let server = Arc::new(MockServer::new());
        server.client.set_default_reply(
            "workspace/symbol",
            MockReply::Result(json!([{
                "name": "Toast",
                "kind": 5,
                "containerName": "android.widget",
                "location": {
                    "uri": "file:///sdk/Toast.kt",
                    "range": {"start": {"line": 0, "character": 0}, "end": {"line": 0, "character": 0}}
                }
            }])),
        );
        let bridge = KotlinBridge::with_server(
            server.clone(),
            Arc::new(NotificationRouter::new()),
            config,
            Arc::new(model),
            cache_root.path(),
        )
        .unwrap();

        Fixture {
            _home: home,
            project,
            _cache_root: cache_root,
            server,
            bridge,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_reports_missing_import_after_idle() {
        let f = fixture();
        let report = f.bridge.start().await.unwrap();
        assert_eq!(report.symbol_count, 1);
        assert_eq!(f.server.starts.load(Ordering::SeqCst), 1);

        let (tx, mut rx) = mpsc::unbounded_channel();
        f.bridge.set_diagnostics_callback(move |result| {
            let _ = tx.send(result);
        });

        let file = f
            .project
            .write("app/src/main/kotlin/com/example/app/MainActivity.kt", ACTIVITY)
            .unwrap();
        f.bridge
            .handle_event(EditorEvent::Opened {
                file: file.clone(),
                content: ACTIVITY.to_string(),
            })
            .await
            .unwrap();
        assert_eq!(f.server.client.count("textDocument/didOpen"), 1);

        let result = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let DiagnosticResult::Updated(diagnostics) = result else {
            panic!("expected diagnostics");
        };
        assert_eq!(diagnostics.items.len(), 1);
        assert_eq!(
            diagnostics.items[0].code,
            Some(crate::kotlin::diagnostics::DiagnosticCode::Text(
                MISSING_IMPORT_CODE.to_string()
            ))
        );

        f.bridge
            .handle_event(EditorEvent::Closed { file })
            .await
            .unwrap();
        assert_eq!(f.server.client.count("textDocument/didClose"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_changes_are_debounced_into_one_analysis() {
        let f = fixture();
        f.bridge.start().await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        f.bridge.set_diagnostics_callback(move |result| {
            let _ = tx.send(result);
        });

        let file = f
            .project
            .write("app/src/main/kotlin/com/example/app/MainActivity.kt", ACTIVITY)
            .unwrap();
        for version in 1..=3 {
            f.bridge
                .handle_event(EditorEvent::Changed {
                    file: file.clone(),
                    content: format!("{ACTIVITY}// edit {version}\n"),
                    version: Some(version),
                })
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_shutdown_closes_documents_and_server() {
        let f = fixture();
        let file = f
            .project
            .write("app/src/main/kotlin/com/example/app/Main.kt", "package com.example.app\n")
            .unwrap();
        f.bridge
            .handle_event(EditorEvent::Selected {
                file,
                content: "package com.example.app\n".to_string(),
            })
            .await
            .unwrap();

        f.bridge.shutdown().await;
        assert_eq!(f.server.client.count("textDocument/didClose"), 1);
        assert_eq!(f.server.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stopped_server_still_answers_requests() {
        let f = fixture();
        f.server.client.set_running(false);
        let file = f.project.root.join("app/src/main/kotlin/Missing.kt");

        let hover = f.bridge.hover(&file, Position::new(0, 0)).await;
        assert!(hover.is_empty());
        assert!(f.bridge.definition(&file, Position::new(0, 0)).await.is_empty());
        assert!(f.bridge.sdk_path().is_none());
        assert!(f.bridge.classpath().is_empty());
    }

    #[tokio::test]
    async fn test_restart_reopens_documents_on_new_server() {
        let f = fixture();
        f.bridge.start().await.unwrap();
        let file = f
            .project
            .write("app/src/main/kotlin/com/example/app/A.kt", "package com.example.app\n")
            .unwrap();
        f.bridge
            .handle_event(EditorEvent::Opened {
                file: file.clone(),
                content: "package com.example.app\n".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(f.server.client.count("textDocument/didOpen"), 1);

        f.server.client.set_running(false);
        f.server.client.set_running(true);
        f.bridge.start().await.unwrap();
        assert_eq!(f.server.starts.load(Ordering::SeqCst), 2);

        f.server.client.clear_calls();
        f.bridge.hover(&file, Position::new(0, 0)).await;
        assert_eq!(
            f.server.client.methods(),
            vec!["textDocument/didOpen", "textDocument/hover"]
        );
        assert_eq!(f.server.client.count("textDocument/didClose"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_import_fix_edits_document_and_reanalyzes() {
        let f = fixture();
        f.bridge.start().await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        f.bridge.set_diagnostics_callback(move |result| {
            let _ = tx.send(result);
        });

        let file = f
            .project
            .write("app/src/main/kotlin/com/example/app/MainActivity.kt", ACTIVITY)
            .unwrap();
        f.bridge
            .handle_event(EditorEvent::Opened {
                file: file.clone(),
                content: ACTIVITY.to_string(),
            })
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();

        let toast = Range::new(Position::new(4, 8), Position::new(4, 13));
        assert_eq!(f.bridge.import_options(&file, toast), vec!["android.widget.Toast"]);

        let fix = f
            .bridge
            .apply_import_fix(&file, toast, ACTIVITY.to_string(), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fix.fqn, "android.widget.Toast");
        assert_eq!(fix.edit.range.start, Position::new(2, 0));

        let changes = f.server.client.params_of("textDocument/didChange");
        let sent = changes[0]["contentChanges"][0]["text"].as_str().unwrap();
        assert_eq!(
            sent,
            ACTIVITY.replace("\n\nclass", "\n\nimport android.widget.Toast\nclass")
        );

        let result = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, DiagnosticResult::Updated(d) if d.items.is_empty()));
        assert!(
            f.bridge
                .apply_import_fix(&file, toast, sent.to_string(), None)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_format_goes_through_pipeline() {
        let f = fixture();
        let file = f
            .project
            .write("app/src/main/kotlin/com/example/app/Main.kt", "package com.example.app\n")
            .unwrap();

        assert!(f.bridge.format(&file, None).await.is_empty());
        assert_eq!(f.server.client.count("textDocument/formatting"), 1);
        assert!(f.bridge.format(&f.project.root.join("build.gradle"), None).await.is_empty());
        assert_eq!(f.server.client.count("textDocument/formatting"), 1);
    }
}
