use clap::Parser;
use kotlin_lsp_bridge::kotlin::KotlinServerConfig;
use kotlin_lsp_bridge::kotlin::diagnostics::DiagnosticResult;
use kotlin_lsp_bridge::logging::{LogConfig, init_logging};
use kotlin_lsp_bridge::project::StaticProjectModel;
use kotlin_lsp_bridge::{EditorEvent, KotlinBridge};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Depth of the Gradle module scan below the project root
const MODULE_SCAN_DEPTH: usize = 3;

/// How long to wait for diagnostics of `--file` before shutting down
const DIAGNOSTICS_WAIT: Duration = Duration::from_secs(5);

/// CLI arguments for the Kotlin language server bridge
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Gradle project root (defaults to current directory)
    #[arg(long, value_name = "DIR")]
    project: Option<PathBuf>,

    /// Kotlin language server installation containing lib/*.jar (overrides KLS_HOME)
    #[arg(long, value_name = "DIR")]
    server_home: Option<PathBuf>,

    /// JDK used to run the server (overrides JAVA_HOME)
    #[arg(long, value_name = "DIR")]
    java_home: Option<PathBuf>,

    /// Android SDK root
    #[arg(long, value_name = "DIR")]
    android_sdk: Option<PathBuf>,

    /// Index cache root (overrides KLS_BRIDGE_CACHE_DIR)
    #[arg(long, value_name = "DIR")]
    cache_dir: Option<PathBuf>,

    /// Log level (overrides RUST_LOG env var)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Log file path (overrides KLS_BRIDGE_LOG_FILE env var)
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,

    /// Kotlin file to open and analyze once the workspace is ready
    #[arg(long, value_name = "FILE")]
    file: Option<PathBuf>,
}

/// CLI arg > environment variable
fn resolve_dir(arg: Option<PathBuf>, env_var: &str) -> Option<PathBuf> {
    arg.or_else(|| std::env::var_os(env_var).map(PathBuf::from))
}

/// CLI arg > KLS_BRIDGE_CACHE_DIR > platform cache directory
fn resolve_cache_dir(cache_dir_arg: Option<PathBuf>) -> PathBuf {
    resolve_dir(cache_dir_arg, "KLS_BRIDGE_CACHE_DIR")
        .or_else(|| dirs::cache_dir().map(|dir| dir.join("kotlin-lsp-bridge")))
        .unwrap_or_else(|| std::env::temp_dir().join("kotlin-lsp-bridge"))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let log_config = LogConfig::from_env().with_overrides(args.log_level.clone(), args.log_file.clone());
    if let Err(e) = init_logging(log_config) {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    let project_root = match args.project.clone() {
        Some(root) => root,
        None => std::env::current_dir()?,
    };

    let Some(server_home) = resolve_dir(args.server_home.clone(), "KLS_HOME") else {
        eprintln!("No server installation: pass --server-home or set KLS_HOME");
        std::process::exit(2);
    };
    let Some(java_home) = resolve_dir(args.java_home.clone(), "JAVA_HOME") else {
        eprintln!("No JDK: pass --java-home or set JAVA_HOME");
        std::process::exit(2);
    };
    let cache_root = resolve_cache_dir(args.cache_dir.clone());

    let mut builder = KotlinServerConfig::builder()
        .server_home(server_home)
        .java_home(java_home);
    if let Some(sdk) = args.android_sdk.clone() {
        builder = builder.android_sdk(sdk);
    }
    let config = match builder.build() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {e}");
            std::process::exit(2);
        }
    };

    let model = StaticProjectModel::discover(&project_root, MODULE_SCAN_DEPTH)
        .with_android_sdk(args.android_sdk.clone());
    info!(
        "Starting Kotlin language server bridge for {} (cache: {})",
        project_root.display(),
        cache_root.display()
    );

    let bridge = KotlinBridge::new(config, Arc::new(model), &cache_root)?;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    bridge.set_diagnostics_callback(move |result| {
        let _ = tx.send(result);
    });

    match bridge.start().await {
        Ok(report) => info!(
            "Workspace ready: {} classpath entries, {} symbols (cache: {})",
            report.classpath_len, report.symbol_count, report.restored_from_cache
        ),
        Err(e) => {
            error!(category = e.category(), "Workspace setup failed: {}", e);
            bridge.shutdown().await;
            return Err(e.into());
        }
    }
    println!("{}", bridge.cache_stats());

    if let Some(file) = args.file {
        let content = tokio::fs::read_to_string(&file).await?;
        bridge
            .handle_event(EditorEvent::Opened {
                file: file.clone(),
                content,
            })
            .await?;

        let deadline = tokio::time::Instant::now() + DIAGNOSTICS_WAIT;
        while let Ok(Some(result)) = tokio::time::timeout_at(deadline, rx.recv()).await {
            if let DiagnosticResult::Updated(diagnostics) = result {
                for item in &diagnostics.items {
                    println!(
                        "{}:{}:{}: {:?}: {}",
                        diagnostics.file.display(),
                        item.range.start.line + 1,
                        item.range.start.character + 1,
                        item.severity,
                        item.message
                    );
                }
            }
        }
    }

    bridge.shutdown().await;
    info!("Kotlin language server bridge finished");
    Ok(())
}
