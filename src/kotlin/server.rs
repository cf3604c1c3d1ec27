//! Kotlin language server session
//!
//! Launches the server JVM with a precomputed classpath, connects the stdio
//! transport, and routes server notifications. [`KotlinServer`] is itself an
//! [`LspClientTrait`], so the rest of the crate talks to it without knowing
//! whether a process is up: while it is stopped every call fails with
//! [`LspError::NotRunning`].
//!
//! A server that exits on its own is not restarted; the next explicit
//! `start` launches a new one.

use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::io::{
    ChildProcessManager, LaunchCommand, ProcessExitEvent, ProcessExitHandler, ProcessManager,
    StderrMonitor, StdioTransport, StopMode,
};
use crate::kotlin::config::{KotlinServerConfig, SERVER_MAIN_CLASS};
use crate::kotlin::error::BridgeError;
use crate::kotlin::notifications::NotificationRouter;
use crate::lsp::{LspClient, LspClientTrait, LspError};

/// Separator used when joining classpath entries
pub const CLASSPATH_SEPARATOR: &str = ":";

/// Inputs computed by workspace setup for one server launch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerEnvironment {
    pub classpath: Vec<PathBuf>,
}

impl ServerEnvironment {
    pub fn new(classpath: Vec<PathBuf>) -> Self {
        Self { classpath }
    }

    pub fn classpath_string(&self) -> String {
        join_paths(&self.classpath)
    }
}

struct Connection {
    process: Mutex<ChildProcessManager>,
    client: LspClient<StdioTransport>,
}

/// Logs unexpected exits; nothing is restarted
struct ExitLogger;

#[async_trait]
impl ProcessExitHandler for ExitLogger {
    async fn on_process_exit(&self, event: ProcessExitEvent) {
        match event.code {
            _ if event.requested => debug!("Kotlin language server (pid {:?}) stopped", event.pid),
            Some(0) => info!("Kotlin language server (pid {:?}) exited", event.pid),
            code => warn!(
                "Kotlin language server (pid {:?}) exited with {:?}; it will not be restarted",
                event.pid, code
            ),
        }
    }
}

pub struct KotlinServer {
    config: KotlinServerConfig,
    router: Arc<NotificationRouter>,
    connection: RwLock<Option<Arc<Connection>>>,
    /// Serializes `start` so concurrent callers launch one process
    starting: Mutex<()>,
}

impl KotlinServer {
    pub fn new(config: KotlinServerConfig, router: Arc<NotificationRouter>) -> Self {
        Self {
            config,
            router,
            connection: RwLock::new(None),
            starting: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &KotlinServerConfig {
        &self.config
    }

    /// Launch the server and connect to it
    ///
    /// Returns as soon as the transport is connected; the LSP handshake is
    /// up to the caller. A running server is left alone.
    pub async fn start(&self, environment: &ServerEnvironment) -> Result<(), BridgeError> {
        let _starting = self.starting.lock().await;
        if self.is_running() {
            debug!("Kotlin language server already running");
            return Ok(());
        }

        match self.launch(environment).await {
            Ok(connection) => {
                *self
                    .connection
                    .write()
                    .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(connection));
                info!("Kotlin language server started");
                Ok(())
            }
            Err(e) => {
                error!(category = e.category(), "Failed to start Kotlin language server: {}", e);
                Err(e)
            }
        }
    }

    async fn launch(&self, environment: &ServerEnvironment) -> Result<Connection, BridgeError> {
        let jars = discover_server_jars(&self.config.server_home).map_err(|source| {
            BridgeError::FileIo {
                context: format!("listing {}", self.config.server_home.join("lib").display()),
                source,
            }
        })?;
        if jars.is_empty() {
            return Err(BridgeError::startup_failed(format!(
                "no server jars under {}",
                self.config.server_home.join("lib").display()
            )));
        }

        let classpath = environment.classpath_string();
        let args = build_launch_args(&self.config, &jars, &classpath);
        let java = self.config.java_executable();
        debug!("Launching {} with {} classpath entries", java.display(), environment.classpath.len());

        let launch = LaunchCommand::new(java)
            .args(args)
            .current_dir(&self.config.server_home)
            .envs(launch_environment(&self.config, &classpath));
        let mut process = ChildProcessManager::new(launch).with_exit_handler(Arc::new(ExitLogger));

        let handler = self.config.stderr_handler.clone();
        process.on_stderr_line(move |line| {
            debug!(target: "kotlin_lsp::stderr", "{}", line);
            if let Some(handler) = &handler {
                handler(line);
            }
        });

        process.start().await?;
        let transport = process.create_stdio_transport()?;

        let client = LspClient::new(transport);
        let router = Arc::clone(&self.router);
        client
            .on_notification(move |notification| router.route(notification))
            .await;

        Ok(Connection {
            process: Mutex::new(process),
            client,
        })
    }

    /// Shutdown handshake, then stop the process
    ///
    /// Safe to call when the server never started or already died.
    pub async fn shutdown(&self) {
        let connection = self
            .connection
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(connection) = connection else {
            debug!("Kotlin language server not running, nothing to shut down");
            return;
        };

        connection
            .client
            .shutdown(self.config.lsp_config.shutdown_timeout)
            .await;

        let mut process = connection.process.lock().await;
        if process.is_running()
            && let Err(e) = process.stop(StopMode::Graceful).await
        {
            debug!("Stopping Kotlin language server: {}", e);
        }
        info!("Kotlin language server stopped");
    }

    /// Requests still waiting for a response
    pub async fn pending_requests(&self) -> usize {
        match self.connection() {
            Some(connection) => connection.client.pending_count().await,
            None => 0,
        }
    }

    pub async fn pid(&self) -> Option<u32> {
        let connection = self.connection()?;
        let process = connection.process.lock().await;
        process.get_state().pid()
    }

    fn connection(&self) -> Option<Arc<Connection>> {
        self.connection
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl LspClientTrait for KotlinServer {
    fn is_running(&self) -> bool {
        self.connection()
            .is_some_and(|connection| connection.client.is_connected())
    }

    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, LspError> {
        let connection = self.connection().ok_or(LspError::NotRunning)?;
        connection.client.request(method, params, timeout).await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), LspError> {
        let connection = self.connection().ok_or(LspError::NotRunning)?;
        connection.client.notify(method, params).await
    }
}

// ============================================================================
// Launch Command
// ============================================================================

/// `<server_home>/lib/*.jar`, sorted
pub fn discover_server_jars(server_home: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut jars: Vec<PathBuf> = std::fs::read_dir(server_home.join("lib"))?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "jar"))
        .collect();
    jars.sort();
    Ok(jars)
}

/// JVM arguments: system properties, extra args, server classpath, main class
pub fn build_launch_args(
    config: &KotlinServerConfig,
    server_jars: &[PathBuf],
    classpath: &str,
) -> Vec<String> {
    let mut args = vec![
        format!("-DkotlinLanguageServer.version={}", config.server_version),
        "-DkotlinLanguageServer.skipClasspathResolution=true".to_string(),
        format!("-DkotlinLanguageServer.predefinedClasspath={classpath}"),
    ];
    args.extend(config.extra_jvm_args.iter().cloned());
    args.push("-classpath".to_string());
    args.push(join_paths(server_jars));
    args.push(SERVER_MAIN_CLASS.to_string());
    args
}

/// Environment that makes the server use our classpath instead of resolving one
pub fn launch_environment(config: &KotlinServerConfig, classpath: &str) -> Vec<(String, String)> {
    let java_home = config.java_home.display().to_string();
    let path = match std::env::var("PATH") {
        Ok(existing) if !existing.is_empty() => format!("{java_home}/bin:{existing}"),
        _ => format!("{java_home}/bin"),
    };

    let mut vars = vec![
        ("JAVA_HOME".to_string(), java_home),
        ("PATH".to_string(), path),
        (
            "KOTLIN_LSP_DISABLE_DEPENDENCY_RESOLUTION".to_string(),
            "true".to_string(),
        ),
        (
            "KOTLIN_LSP_USE_PREDEFINED_CLASSPATH".to_string(),
            "true".to_string(),
        ),
        ("KOTLIN_LSP_CLASSPATH".to_string(), classpath.to_string()),
        ("CLASSPATH".to_string(), classpath.to_string()),
    ];
    if let Some(sdk) = &config.android_sdk {
        let sdk = sdk.display().to_string();
        vars.push(("ANDROID_SDK_ROOT".to_string(), sdk.clone()));
        vars.push(("ANDROID_HOME".to_string(), sdk));
    }
    vars
}

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|path| path.display().to_string())
        .collect::<Vec<_>>()
        .join(CLASSPATH_SEPARATOR)
}
