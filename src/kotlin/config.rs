//! Configuration for the Kotlin language server session
//!
//! Provides KotlinServerConfig with a validating builder, plus the LSP and
//! request-pipeline timing settings shared by the rest of the bridge.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::kotlin::error::KotlinConfigError;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Kotlin language server version announced to the JVM
pub const DEFAULT_SERVER_VERSION: &str = "1.3.13";

/// Entry point of the language server inside its jars
pub const SERVER_MAIN_CLASS: &str = "org.javacs.kt.MainKt";

/// Language identifier sent with `didOpen`
pub const KOTLIN_LANGUAGE_ID: &str = "kotlin";

/// Timeout for a whole completion operation, debounce included (5 seconds)
pub const COMPLETION_TIMEOUT_MS: u64 = 5000;

/// Timeout for hover requests (2 seconds)
///
/// Hover is shown while the pointer rests on a symbol; a slow answer is a
/// useless answer.
pub const HOVER_TIMEOUT_MS: u64 = 2000;

/// Timeout for definition and references requests (5 seconds)
pub const NAVIGATION_TIMEOUT_MS: u64 = 5000;

/// Timeout for signature help requests (3 seconds)
pub const SIGNATURE_HELP_TIMEOUT_MS: u64 = 3000;

/// Timeout for whole-document formatting (15 seconds)
pub const FORMAT_TIMEOUT_MS: u64 = 15000;

/// Line width handed to ktfmt
pub const FORMAT_MAX_WIDTH: u32 = 100;

/// Delay before a completion request is issued
///
/// Requests superseded within this window never reach the server.
pub const COMPLETION_DEBOUNCE_MS: u64 = 100;

/// Window in which an unchanged document is not re-sent to the server
pub const SYNC_THROTTLE_MS: u64 = 300;

/// Pause after a forced resync so the server can apply it before completion
pub const RESYNC_SETTLE_MS: u64 = 30;

/// Timeout for the `initialize` handshake (60 seconds)
///
/// The server resolves the predefined classpath and loads the stdlib before
/// answering; large Android projects need most of this.
pub const INITIALIZATION_TIMEOUT_SECS: u64 = 60;

/// Maximum allowed initialization timeout (5 minutes)
pub const MAX_INITIALIZATION_TIMEOUT_SECS: u64 = 300;

/// Bounded wait for the `shutdown` request (2 seconds)
pub const SHUTDOWN_TIMEOUT_SECS: u64 = 2;

/// Timeout for the full-index `workspace/symbol` query (2 minutes)
pub const REINDEX_TIMEOUT_SECS: u64 = 120;

/// Quiet period after the last build-output event before reindexing
pub const WATCHER_QUIET_PERIOD_MS: u64 = 500;

/// Idle time after the last edit before the local analysis pass runs
pub const ANALYSIS_IDLE_MS: u64 = 400;

/// Minimum typed prefix length before classpath classes join completion
pub const CLASSPATH_COMPLETION_MIN_PREFIX: usize = 2;

/// Maximum classpath candidates merged into one completion list
pub const CLASSPATH_COMPLETION_LIMIT: usize = 50;

// ============================================================================
// Core Configuration Types
// ============================================================================

/// Complete Kotlin language server configuration
#[derive(Clone)]
pub struct KotlinServerConfig {
    /// Server installation directory, containing `lib/*.jar`
    pub server_home: PathBuf,

    /// JDK used to run the server
    pub java_home: PathBuf,

    /// Version passed as `-DkotlinLanguageServer.version`
    pub server_version: String,

    /// Additional JVM arguments, inserted before `-classpath`
    pub extra_jvm_args: Vec<String>,

    /// Android SDK, exported as `ANDROID_SDK_ROOT`/`ANDROID_HOME`
    pub android_sdk: Option<PathBuf>,

    /// Directory the server may use for its own storage
    pub storage_path: Option<PathBuf>,

    /// Kotlin script support flags
    pub scripts: ScriptConfig,

    /// LSP handshake settings
    pub lsp_config: LspConfig,

    /// Request pipeline timing
    pub pipeline: PipelineConfig,

    /// Optional stderr handler, in addition to logging
    pub stderr_handler: Option<Arc<dyn Fn(String) + Send + Sync>>,
}

impl std::fmt::Debug for KotlinServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KotlinServerConfig")
            .field("server_home", &self.server_home)
            .field("java_home", &self.java_home)
            .field("server_version", &self.server_version)
            .field("extra_jvm_args", &self.extra_jvm_args)
            .field("android_sdk", &self.android_sdk)
            .field("storage_path", &self.storage_path)
            .field("scripts", &self.scripts)
            .field("lsp_config", &self.lsp_config)
            .field("pipeline", &self.pipeline)
            .field(
                "stderr_handler",
                &self.stderr_handler.as_ref().map(|_| "Fn(String)"),
            )
            .finish()
    }
}

/// Kotlin script (`.kts`) support
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptConfig {
    pub enabled: bool,
    pub build_scripts_enabled: bool,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            build_scripts_enabled: true,
        }
    }
}

/// LSP client configuration
#[derive(Debug, Clone)]
pub struct LspConfig {
    /// Timeout for LSP initialization
    pub initialization_timeout: Duration,

    /// Bounded wait for the shutdown request
    pub shutdown_timeout: Duration,

    /// Timeout for the full-index symbol query
    pub reindex_timeout: Duration,

    /// Client name for LSP identification
    pub client_name: String,

    /// Client version for LSP identification
    pub client_version: String,
}

/// ktfmt style preset used by `textDocument/formatting`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FormatStyle {
    #[default]
    Google,
    Facebook,
    KotlinLang,
}

impl FormatStyle {
    /// Name understood by the server's ktfmt integration
    pub fn as_str(self) -> &'static str {
        match self {
            FormatStyle::Google => "google",
            FormatStyle::Facebook => "facebook",
            FormatStyle::KotlinLang => "kotlinlang",
        }
    }

    pub fn indent(self) -> u32 {
        match self {
            FormatStyle::Google | FormatStyle::Facebook => 2,
            FormatStyle::KotlinLang => 4,
        }
    }
}

/// Request pipeline timing
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub completion_timeout: Duration,
    pub hover_timeout: Duration,
    pub definition_timeout: Duration,
    pub references_timeout: Duration,
    pub signature_help_timeout: Duration,
    pub format_timeout: Duration,
    pub format_style: FormatStyle,
    pub completion_debounce: Duration,
    pub sync_throttle: Duration,
    pub resync_settle: Duration,
    pub analysis_idle: Duration,
    pub watcher_quiet_period: Duration,
}

// ============================================================================
// Default Implementations
// ============================================================================

impl Default for LspConfig {
    fn default() -> Self {
        Self {
            initialization_timeout: Duration::from_secs(INITIALIZATION_TIMEOUT_SECS),
            shutdown_timeout: Duration::from_secs(SHUTDOWN_TIMEOUT_SECS),
            reindex_timeout: Duration::from_secs(REINDEX_TIMEOUT_SECS),
            client_name: "kotlin-lsp-bridge".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            completion_timeout: Duration::from_millis(COMPLETION_TIMEOUT_MS),
            hover_timeout: Duration::from_millis(HOVER_TIMEOUT_MS),
            definition_timeout: Duration::from_millis(NAVIGATION_TIMEOUT_MS),
            references_timeout: Duration::from_millis(NAVIGATION_TIMEOUT_MS),
            signature_help_timeout: Duration::from_millis(SIGNATURE_HELP_TIMEOUT_MS),
            format_timeout: Duration::from_millis(FORMAT_TIMEOUT_MS),
            format_style: FormatStyle::default(),
            completion_debounce: Duration::from_millis(COMPLETION_DEBOUNCE_MS),
            sync_throttle: Duration::from_millis(SYNC_THROTTLE_MS),
            resync_settle: Duration::from_millis(RESYNC_SETTLE_MS),
            analysis_idle: Duration::from_millis(ANALYSIS_IDLE_MS),
            watcher_quiet_period: Duration::from_millis(WATCHER_QUIET_PERIOD_MS),
        }
    }
}

// ============================================================================
// Configuration Builder
// ============================================================================

/// Builder for KotlinServerConfig with validation and defaults
pub struct KotlinServerConfigBuilder {
    server_home: Option<PathBuf>,
    java_home: Option<PathBuf>,
    server_version: Option<String>,
    extra_jvm_args: Vec<String>,
    android_sdk: Option<PathBuf>,
    storage_path: Option<PathBuf>,
    scripts: ScriptConfig,
    lsp_config: LspConfig,
    pipeline: PipelineConfig,
    stderr_handler: Option<Arc<dyn Fn(String) + Send + Sync>>,
}

impl KotlinServerConfigBuilder {
    /// Create a new configuration builder
    pub fn new() -> Self {
        Self {
            server_home: None,
            java_home: None,
            server_version: None,
            extra_jvm_args: Vec::new(),
            android_sdk: None,
            storage_path: None,
            scripts: ScriptConfig::default(),
            lsp_config: LspConfig::default(),
            pipeline: PipelineConfig::default(),
            stderr_handler: None,
        }
    }

    /// Set the server installation directory
    pub fn server_home(mut self, path: impl Into<PathBuf>) -> Self {
        self.server_home = Some(path.into());
        self
    }

    /// Set the JDK used to run the server
    pub fn java_home(mut self, path: impl Into<PathBuf>) -> Self {
        self.java_home = Some(path.into());
        self
    }

    pub fn server_version(mut self, version: impl Into<String>) -> Self {
        self.server_version = Some(version.into());
        self
    }

    /// Add an extra JVM argument
    pub fn add_jvm_arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_jvm_args.push(arg.into());
        self
    }

    /// Add multiple extra JVM arguments
    pub fn add_jvm_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.extra_jvm_args
            .extend(args.into_iter().map(|arg| arg.into()));
        self
    }

    pub fn android_sdk(mut self, path: impl Into<PathBuf>) -> Self {
        self.android_sdk = Some(path.into());
        self
    }

    pub fn storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage_path = Some(path.into());
        self
    }

    /// Enable or disable `.kts` script support
    pub fn scripts(mut self, enabled: bool, build_scripts_enabled: bool) -> Self {
        self.scripts = ScriptConfig {
            enabled,
            build_scripts_enabled,
        };
        self
    }

    /// Set the LSP initialization timeout
    pub fn initialization_timeout(mut self, timeout: Duration) -> Self {
        self.lsp_config.initialization_timeout = timeout;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.lsp_config.shutdown_timeout = timeout;
        self
    }

    /// Replace the whole pipeline timing configuration
    pub fn pipeline(mut self, pipeline: PipelineConfig) -> Self {
        self.pipeline = pipeline;
        self
    }

    /// Set the stderr handler for process monitoring
    pub fn stderr_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.stderr_handler = Some(Arc::new(handler));
        self
    }

    /// Build the configuration with validation
    pub fn build(self) -> Result<KotlinServerConfig, KotlinConfigError> {
        let server_home = self
            .server_home
            .ok_or_else(|| KotlinConfigError::missing_field("server_home"))?;

        let java_home = self
            .java_home
            .ok_or_else(|| KotlinConfigError::missing_field("java_home"))?;

        let server_version = self
            .server_version
            .unwrap_or_else(|| DEFAULT_SERVER_VERSION.to_string());

        Self::validate_server_home(&server_home)?;
        Self::validate_java_home(&java_home)?;
        Self::validate_timeouts(&self.lsp_config, &self.pipeline)?;
        Self::validate_arguments(&self.extra_jvm_args)?;

        Ok(KotlinServerConfig {
            server_home,
            java_home,
            server_version,
            extra_jvm_args: self.extra_jvm_args,
            android_sdk: self.android_sdk,
            storage_path: self.storage_path,
            scripts: self.scripts,
            lsp_config: self.lsp_config,
            pipeline: self.pipeline,
            stderr_handler: self.stderr_handler,
        })
    }

    /// Server home must be a directory with a `lib/` subdirectory
    fn validate_server_home(path: &Path) -> Result<(), KotlinConfigError> {
        if !path.is_dir() {
            return Err(KotlinConfigError::invalid_path(
                path.display().to_string(),
                "Server home is not a directory",
            ));
        }

        if !path.join("lib").is_dir() {
            return Err(KotlinConfigError::invalid_path(
                path.display().to_string(),
                "Server home has no lib directory",
            ));
        }

        Ok(())
    }

    fn validate_java_home(path: &Path) -> Result<(), KotlinConfigError> {
        if !path.is_dir() {
            return Err(KotlinConfigError::invalid_path(
                path.display().to_string(),
                "Java home is not a directory",
            ));
        }

        // The launcher itself is checked at start, where a missing binary is
        // reported as a startup failure.
        Ok(())
    }

    fn validate_timeouts(
        lsp_config: &LspConfig,
        pipeline: &PipelineConfig,
    ) -> Result<(), KotlinConfigError> {
        if lsp_config.initialization_timeout.is_zero() {
            return Err(KotlinConfigError::invalid_timeout(
                lsp_config.initialization_timeout,
                "Initialization timeout must be greater than zero",
            ));
        }

        if lsp_config.initialization_timeout > Duration::from_secs(MAX_INITIALIZATION_TIMEOUT_SECS)
        {
            return Err(KotlinConfigError::invalid_timeout(
                lsp_config.initialization_timeout,
                "Initialization timeout too long (max 5 minutes)",
            ));
        }

        let request_timeouts = [
            pipeline.completion_timeout,
            pipeline.hover_timeout,
            pipeline.definition_timeout,
            pipeline.references_timeout,
            pipeline.signature_help_timeout,
            pipeline.format_timeout,
        ];
        if let Some(zero) = request_timeouts.iter().find(|t| t.is_zero()) {
            return Err(KotlinConfigError::invalid_timeout(
                *zero,
                "Request timeouts must be greater than zero",
            ));
        }

        if pipeline.completion_debounce >= pipeline.completion_timeout {
            return Err(KotlinConfigError::invalid_timeout(
                pipeline.completion_debounce,
                "Completion debounce must be shorter than the completion timeout",
            ));
        }

        Ok(())
    }

    fn validate_arguments(args: &[String]) -> Result<(), KotlinConfigError> {
        for arg in args {
            if arg.contains('\0') {
                return Err(KotlinConfigError::invalid_arguments(
                    args.to_vec(),
                    "Arguments cannot contain null characters",
                ));
            }
        }

        Ok(())
    }
}

impl Default for KotlinServerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Utility Methods
// ============================================================================

impl KotlinServerConfig {
    pub fn builder() -> KotlinServerConfigBuilder {
        KotlinServerConfigBuilder::new()
    }

    /// Path of the `java` launcher inside the configured JDK
    pub fn java_executable(&self) -> PathBuf {
        self.java_home.join("bin").join("java")
    }
}

// ============================================================================
// Tests
// ============================================================================
