//! Workspace setup
//!
//! Brings a project up on the language server: assemble the classpath,
//! launch, run the LSP handshake, then fill the import index either from the
//! persisted index cache or from a full `workspace/symbol` query.

use async_trait::async_trait;
use lsp_types::{
    ClientCapabilities, ClientInfo, CompletionClientCapabilities, CompletionItemCapability,
    CompletionItemCapabilityResolveSupport, DynamicRegistrationClientCapabilities, GotoCapability,
    HoverClientCapabilities, InitializeParams, MarkupKind, PublishDiagnosticsClientCapabilities,
    ReferenceClientCapabilities, SignatureHelpClientCapabilities, TextDocumentClientCapabilities,
    WorkDoneProgressParams, WorkspaceClientCapabilities, WorkspaceEditClientCapabilities,
    WorkspaceSymbolClientCapabilities,
};
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::kotlin::completion::index::ImportIndex;
use crate::kotlin::config::KotlinServerConfig;
use crate::kotlin::error::BridgeError;
use crate::kotlin::server::{KotlinServer, ServerEnvironment};
use crate::log_timing;
use crate::lsp::LspClientTrait;
use crate::lsp::uri::path_to_uri;
use crate::project::classpath::ClasspathAssembler;
use crate::project::index_cache::{CacheStats, IndexCache, compute_path_hash};

/// Script template announced to the server for `.kts` files
const SCRIPT_TEMPLATE: &str = "kotlin.script.templates.standard.ScriptTemplateWithArgs";

/// Storage directory used when none is configured, relative to the project
const DEFAULT_STORAGE_DIR: &str = ".kls";

/// A language server that can be launched with a given environment
#[async_trait]
pub trait ServerHandle: LspClientTrait {
    async fn start(&self, environment: &ServerEnvironment) -> Result<(), BridgeError>;

    async fn shutdown(&self);
}

#[async_trait]
impl ServerHandle for KotlinServer {
    async fn start(&self, environment: &ServerEnvironment) -> Result<(), BridgeError> {
        KotlinServer::start(self, environment).await
    }

    async fn shutdown(&self) {
        KotlinServer::shutdown(self).await
    }
}

/// Outcome of [`WorkspaceSetup::setup`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupReport {
    pub classpath_len: usize,
    pub hash: String,
    pub restored_from_cache: bool,
    pub symbol_count: usize,
}

pub struct WorkspaceSetup {
    server: Arc<dyn ServerHandle>,
    config: KotlinServerConfig,
    classpath: Arc<ClasspathAssembler>,
    cache: IndexCache,
    index: Arc<ImportIndex>,
    project_root: PathBuf,
}

impl WorkspaceSetup {
    pub fn new(
        server: Arc<dyn ServerHandle>,
        config: KotlinServerConfig,
        classpath: Arc<ClasspathAssembler>,
        cache_root: &Path,
        index: Arc<ImportIndex>,
    ) -> Self {
        let project_root = classpath.provider().project_root();
        let cache = IndexCache::new(cache_root, &project_root);
        Self {
            server,
            config,
            classpath,
            cache,
            index,
            project_root,
        }
    }

    pub fn classpath(&self) -> &Arc<ClasspathAssembler> {
        &self.classpath
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Launch, handshake and index the project
    pub async fn setup(&self) -> Result<SetupReport, BridgeError> {
        let start = Instant::now();
        info!("Setting up Kotlin workspace {}", self.project_root.display());

        let classpath = self.assemble_classpath().await?;
        let hash = compute_path_hash(&classpath);
        let cache_valid = self.cache.is_valid(&hash);

        self.server
            .start(&ServerEnvironment::new(classpath.clone()))
            .await?;

        let params = self.initialize_params(&classpath)?;
        self.server
            .initialize(params, self.config.lsp_config.initialization_timeout)
            .await?;
        self.server.initialized().await?;
        self.server
            .change_configuration(self.script_settings())
            .await?;

        let mut restored = None;
        if cache_valid {
            restored = self.restore_from_cache().await?;
        }
        let restored_from_cache = restored.is_some();
        let symbol_count = match restored {
            Some(count) => count,
            None => self.reindex(&hash).await?,
        };

        log_timing!(tracing::Level::INFO, "workspace setup", start.elapsed());
        Ok(SetupReport {
            classpath_len: classpath.len(),
            hash,
            restored_from_cache,
            symbol_count,
        })
    }

    /// Rebuild the classpath after build outputs changed, then reindex
    pub async fn reload(&self) -> Result<SetupReport, BridgeError> {
        info!("Reloading Kotlin workspace classpath");
        self.classpath.invalidate();
        self.cache.clear();

        let classpath = self.assemble_classpath().await?;
        let hash = compute_path_hash(&classpath);

        self.server
            .change_configuration(json!({
                "kotlin": {
                    "classpath": path_strings(&classpath),
                    "usePredefinedClasspath": true,
                    "disableDependencyResolution": true,
                }
            }))
            .await?;

        self.index.clear();
        let symbol_count = self.reindex(&hash).await?;
        Ok(SetupReport {
            classpath_len: classpath.len(),
            hash,
            restored_from_cache: false,
            symbol_count,
        })
    }

    /// The assembler walks the build tree, so it runs on the blocking pool
    async fn assemble_classpath(&self) -> Result<Vec<PathBuf>, BridgeError> {
        let assembler = Arc::clone(&self.classpath);
        tokio::task::spawn_blocking(move || assembler.assemble())
            .await
            .map_err(|e| BridgeError::FileIo {
                context: "classpath assembly".to_string(),
                source: std::io::Error::other(e),
            })
    }

    /// Returns the number of restored symbols, or `None` when the cache had
    /// nothing usable
    async fn restore_from_cache(&self) -> Result<Option<usize>, BridgeError> {
        let cache = self.cache.clone();
        let symbols = match tokio::task::spawn_blocking(move || cache.load()).await {
            Ok(symbols) => symbols.unwrap_or_default(),
            Err(e) => {
                warn!("Index cache load task failed: {}", e);
                Vec::new()
            }
        };
        if symbols.is_empty() {
            info!("Index cache empty, falling back to a full reindex");
            return Ok(None);
        }

        self.index.update_from_symbols(&symbols);
        self.server
            .change_configuration(json!({ "kotlin": { "indexing": { "restored": true } } }))
            .await?;
        info!("Restored {} symbols from the index cache", symbols.len());
        Ok(Some(symbols.len()))
    }

    async fn reindex(&self, hash: &str) -> Result<usize, BridgeError> {
        let start = Instant::now();
        let response = self
            .server
            .workspace_symbols("", self.config.lsp_config.reindex_timeout)
            .await?;
        let symbols = match response {
            Value::Array(symbols) => symbols,
            Value::Null => Vec::new(),
            other => {
                debug!("Unexpected workspace/symbol result: {}", other);
                Vec::new()
            }
        };

        self.index.update_from_symbols(&symbols);
        log_timing!(tracing::Level::INFO, "workspace/symbol reindex", start.elapsed());

        if symbols.is_empty() {
            debug!("Reindex returned no symbols, cache not written");
        } else {
            let cache = self.cache.clone();
            let to_save = symbols.clone();
            let hash = hash.to_string();
            match tokio::task::spawn_blocking(move || cache.save(&to_save, &hash)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    let error = BridgeError::from(e);
                    warn!(category = error.category(), "Failed to save index cache: {}", error);
                }
                Err(e) => warn!("Index cache save task failed: {}", e),
            }
        }
        Ok(symbols.len())
    }

    fn script_settings(&self) -> Value {
        json!({
            "kotlin": {
                "scripts": {
                    "enabled": self.config.scripts.enabled,
                    "buildScriptsEnabled": self.config.scripts.build_scripts_enabled,
                }
            }
        })
    }

    fn initialize_params(&self, classpath: &[PathBuf]) -> Result<InitializeParams, BridgeError> {
        let root_uri = path_to_uri(&self.project_root)?;
        let storage = self
            .config
            .storage_path
            .clone()
            .unwrap_or_else(|| self.project_root.join(DEFAULT_STORAGE_DIR));

        let options = json!({
            "storagePath": storage.display().to_string(),
            "indexing": "full",
            "externalSources": "auto",
            "completion": { "snippets": { "enabled": true } },
            "scripts": {
                "enabled": self.config.scripts.enabled,
                "templates": [SCRIPT_TEMPLATE],
            },
            "usePredefinedClasspath": true,
            "disableDependencyResolution": true,
            "classpath": path_strings(classpath),
        });

        Ok(InitializeParams {
            process_id: Some(std::process::id()),
            #[allow(deprecated)]
            root_path: None,
            #[allow(deprecated)]
            root_uri: Some(root_uri),
            initialization_options: Some(options),
            capabilities: client_capabilities(),
            trace: None,
            workspace_folders: None,
            client_info: Some(ClientInfo {
                name: self.config.lsp_config.client_name.clone(),
                version: Some(self.config.lsp_config.client_version.clone()),
            }),
            locale: None,
            work_done_progress_params: WorkDoneProgressParams::default(),
        })
    }
}

fn path_strings(paths: &[PathBuf]) -> Vec<String> {
    paths.iter().map(|path| path.display().to_string()).collect()
}

fn client_capabilities() -> ClientCapabilities {
    let formats = Some(vec![MarkupKind::Markdown, MarkupKind::PlainText]);
    ClientCapabilities {
        workspace: Some(WorkspaceClientCapabilities {
            apply_edit: Some(true),
            workspace_edit: Some(WorkspaceEditClientCapabilities {
                document_changes: Some(true),
                ..Default::default()
            }),
            did_change_configuration: Some(DynamicRegistrationClientCapabilities {
                dynamic_registration: Some(true),
            }),
            symbol: Some(WorkspaceSymbolClientCapabilities {
                dynamic_registration: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        }),
        text_document: Some(TextDocumentClientCapabilities {
            completion: Some(CompletionClientCapabilities {
                completion_item: Some(CompletionItemCapability {
                    snippet_support: Some(true),
                    commit_characters_support: Some(true),
                    documentation_format: formats.clone(),
                    deprecated_support: Some(true),
                    preselect_support: Some(true),
                    resolve_support: Some(CompletionItemCapabilityResolveSupport {
                        properties: vec![
                            "documentation".to_string(),
                            "detail".to_string(),
                            "additionalTextEdits".to_string(),
                        ],
                    }),
                    ..Default::default()
                }),
                context_support: Some(true),
                ..Default::default()
            }),
            hover: Some(HoverClientCapabilities {
                dynamic_registration: None,
                content_format: formats,
            }),
            definition: Some(GotoCapability {
                dynamic_registration: None,
                link_support: Some(true),
            }),
            references: Some(ReferenceClientCapabilities::default()),
            signature_help: Some(SignatureHelpClientCapabilities::default()),
            publish_diagnostics: Some(PublishDiagnosticsClientCapabilities {
                related_information: Some(true),
                version_support: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// [`ServerHandle`] over a [`MockLspClient`](crate::lsp::testing::MockLspClient)
#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use crate::lsp::LspError;
    use crate::lsp::testing::MockLspClient;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    pub(crate) struct MockServer {
        pub client: MockLspClient,
        pub starts: AtomicUsize,
        pub shutdowns: AtomicUsize,
    }

    impl MockServer {
        pub fn new() -> Self {
            Self {
                client: MockLspClient::new(),
                starts: AtomicUsize::new(0),
                shutdowns: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl LspClientTrait for MockServer {
        fn is_running(&self) -> bool {
            self.client.is_running()
        }

        async fn request(
            &self,
            method: &str,
            params: Option<Value>,
            timeout: Duration,
        ) -> Result<Value, LspError> {
            self.client.request(method, params, timeout).await
        }

        async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), LspError> {
            self.client.notify(method, params).await
        }
    }

    #[async_trait]
    impl ServerHandle for MockServer {
        async fn start(&self, _environment: &ServerEnvironment) -> Result<(), BridgeError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockServer;
    use super::*;
    use crate::lsp::testing::MockReply;
    use crate::project::classpath::{ModuleInfo, StaticProjectModel};
    use crate::test_utils::fixtures::{FakeServerHome, TestKotlinProject};
    use std::sync::atomic::Ordering;

    #[cfg(feature = "test-logging")]
    crate::setup_test_logging!();

    struct Fixture {
        _home: FakeServerHome,
        project: TestKotlinProject,
        cache_root: tempfile::TempDir,
        server: Arc<MockServer>,
        index: Arc<ImportIndex>,
        setup: WorkspaceSetup,
    }

    fn symbol(name: &str, container: &str) -> Value {
        json!({
            "name": name,
            "kind": 5,
            "containerName": container,
            "location": {
                "uri": "file:///src/A.kt",
                "range": {"start": {"line": 0, "character": 0}, "end": {"line": 0, "character": 1}}
            }
        })
    }

    fn fixture() -> Fixture {
        let home = FakeServerHome::new().unwrap();
        let project = TestKotlinProject::new().unwrap();
        let jar = project.write("libs/a.jar", "").unwrap();
        let model = StaticProjectModel {
            root: project.root.clone(),
            modules: vec![ModuleInfo {
                root: project.module_root(),
                compile_classpaths: vec![jar],
                ..ModuleInfo::default()
            }],
            gradle_user_home: Some(project.root.join("no-gradle")),
            ..StaticProjectModel::default()
        };
        let config = KotlinServerConfig::builder()
            .server_home(&home.server_home)
            .java_home(&home.java_home)
            .build()
            .unwrap();
        let cache_root = tempfile::tempdir().unwrap();
        let server = Arc::new(MockServer::new());
        let index = Arc::new(ImportIndex::new());
        let setup = WorkspaceSetup::new(
            server.clone(),
            config,
            Arc::new(ClasspathAssembler::new(Arc::new(model))),
            cache_root.path(),
            index.clone(),
        );
        Fixture {
            _home: home,
            project,
            cache_root,
            server,
            index,
            setup,
        }
    }

    #[tokio::test]
    async fn test_first_setup_reindexes_and_saves_cache() {
        let f = fixture();
        f.server.client.push_reply(
            "workspace/symbol",
            MockReply::Result(json!([symbol("TextView", "android.widget")])),
        );

        let report = f.setup.setup().await.unwrap();
        assert_eq!(report.classpath_len, 1);
        assert!(!report.restored_from_cache);
        assert_eq!(report.symbol_count, 1);
        assert_eq!(report.hash.len(), 64);
        assert_eq!(f.server.starts.load(Ordering::SeqCst), 1);
        assert_eq!(f.index.lookup("TextView"), vec!["android.widget.TextView"]);

        let methods = f.server.client.methods();
        assert_eq!(
            methods,
            vec![
                "initialize",
                "initialized",
                "workspace/didChangeConfiguration",
                "workspace/symbol"
            ]
        );

        let init = &f.server.client.params_of("initialize")[0];
        let options = &init["initializationOptions"];
        assert_eq!(options["indexing"], "full");
        assert_eq!(options["usePredefinedClasspath"], true);
        assert_eq!(options["classpath"].as_array().unwrap().len(), 1);
        assert_eq!(
            options["storagePath"],
            f.project.root.join(".kls").display().to_string()
        );
        assert_eq!(
            init["capabilities"]["textDocument"]["completion"]["completionItem"]["snippetSupport"],
            true
        );

        let scripts = &f.server.client.params_of("workspace/didChangeConfiguration")[0];
        assert!(scripts["settings"]["kotlin"]["scripts"]["enabled"].is_boolean());
        assert!(scripts["settings"].get("settings").is_none());

        assert!(f.setup.cache_stats().exists);
    }

    #[tokio::test]
    async fn test_valid_cache_skips_reindex() {
        let f = fixture();
        f.server.client.push_reply(
            "workspace/symbol",
            MockReply::Result(json!([symbol("Toast", "android.widget")])),
        );
        f.setup.setup().await.unwrap();

        f.index.clear();
        f.server.client.clear_calls();
        let report = f.setup.setup().await.unwrap();

        assert!(report.restored_from_cache);
        assert_eq!(report.symbol_count, 1);
        assert_eq!(f.server.client.count("workspace/symbol"), 0);
        assert_eq!(f.index.lookup("Toast"), vec!["android.widget.Toast"]);

        let configs = f.server.client.params_of("workspace/didChangeConfiguration");
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[1]["settings"]["kotlin"]["indexing"]["restored"], true);
    }

    #[tokio::test]
    async fn test_empty_reindex_is_not_cached() {
        let f = fixture();
        f.server
            .client
            .push_reply("workspace/symbol", MockReply::Result(Value::Null));

        let report = f.setup.setup().await.unwrap();
        assert_eq!(report.symbol_count, 0);
        assert!(!f.setup.cache_stats().exists);
        assert_eq!(crate::project::index_cache::total_size(f.cache_root.path()), 0);
    }

    #[tokio::test]
    async fn test_reload_sends_new_classpath_and_reindexes() {
        let f = fixture();
        f.server.client.push_reply(
            "workspace/symbol",
            MockReply::Result(json!([symbol("Toast", "android.widget")])),
        );
        f.setup.setup().await.unwrap();

        f.server.client.clear_calls();
        f.server.client.push_reply(
            "workspace/symbol",
            MockReply::Result(json!([
                symbol("Toast", "android.widget"),
                symbol("Button", "android.widget")
            ])),
        );

        let report = f.setup.reload().await.unwrap();
        assert!(!report.restored_from_cache);
        assert_eq!(report.symbol_count, 2);
        assert_eq!(
            f.server.client.methods(),
            vec!["workspace/didChangeConfiguration", "workspace/symbol"]
        );
        let config = &f.server.client.params_of("workspace/didChangeConfiguration")[0];
        assert_eq!(
            config["settings"]["kotlin"]["classpath"].as_array().unwrap().len(),
            1
        );
        assert_eq!(f.index.lookup("Button"), vec!["android.widget.Button"]);
    }

    #[tokio::test]
    async fn test_reindex_server_error_fails_setup() {
        let f = fixture();
        f.server
            .client
            .push_reply(
                "workspace/symbol",
                MockReply::Error {
                    code: -32603,
                    message: "boom".into(),
                },
            );

        let err = f.setup.setup().await.unwrap_err();
        assert!(matches!(err, BridgeError::ServerReported { code: -32603, .. }));
    }
}
