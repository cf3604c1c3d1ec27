//! Logging setup for the bridge
//!
//! Log output goes to a file or stderr, never stdout: stdout of the bridge
//! process may be consumed by the editor.
//!
//! Environment:
//! - `RUST_LOG`: filter directives, default `info`
//! - `KLS_BRIDGE_LOG_FILE`: append to this file instead of stderr
//! - `KLS_BRIDGE_LOG_UNIQUE=true`: insert the pid into the file name
//! - `KLS_BRIDGE_LOG_JSON=true`: one JSON object per line

use std::env;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_FILTER: &str = "info";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// `EnvFilter` directives, e.g. `info,kotlin_lsp_bridge::lsp=trace`
    pub level: String,
    /// Stderr when `None`
    pub file_path: Option<PathBuf>,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_FILTER.to_string(),
            file_path: None,
            format: LogFormat::Text,
        }
    }
}

fn env_flag(name: &str) -> bool {
    env::var(name).is_ok_and(|value| value == "true")
}

/// `bridge.log` becomes `bridge.<pid>.log`
fn with_pid_suffix(path: &Path, pid: u32) -> PathBuf {
    let Some(stem) = path.file_stem() else {
        return path.to_path_buf();
    };
    let name = match path.extension() {
        Some(ext) => format!("{}.{}.{}", stem.to_string_lossy(), pid, ext.to_string_lossy()),
        None => format!("{}.{}", stem.to_string_lossy(), pid),
    };
    path.with_file_name(name)
}

impl LogConfig {
    pub fn from_env() -> Self {
        let level = env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_FILTER.to_string());
        let file_path = env::var_os("KLS_BRIDGE_LOG_FILE").map(|raw| {
            let path = PathBuf::from(raw);
            if env_flag("KLS_BRIDGE_LOG_UNIQUE") {
                with_pid_suffix(&path, std::process::id())
            } else {
                path
            }
        });
        let format = if env_flag("KLS_BRIDGE_LOG_JSON") {
            LogFormat::Json
        } else {
            LogFormat::Text
        };

        Self {
            level,
            file_path,
            format,
        }
    }

    /// CLI flags win over the environment
    pub fn with_overrides(mut self, level: Option<String>, file_path: Option<PathBuf>) -> Self {
        if let Some(level) = level {
            self.level = level;
        }
        if file_path.is_some() {
            self.file_path = file_path;
        }
        self
    }
}

/// Install the global subscriber; fails if the log file cannot be opened
pub fn init_logging(config: LogConfig) -> Result<(), Box<dyn std::error::Error>> {
    let filter =
        EnvFilter::try_new(&config.level).or_else(|_| EnvFilter::try_new(DEFAULT_FILTER))?;

    let (writer, ansi) = match &config.file_path {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            (BoxMakeWriter::new(Arc::new(file)), false)
        }
        None => (BoxMakeWriter::new(std::io::stderr), true),
    };

    let registry = tracing_subscriber::registry().with(filter);
    match config.format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(writer).with_ansi(false))
            .try_init()?,
        LogFormat::Text => registry
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(ansi)
                    .with_thread_ids(true)
                    .with_line_number(true),
            )
            .try_init()?,
    }

    Ok(())
}

/// One event per JSON-RPC message crossing the wire
#[macro_export]
macro_rules! log_lsp_message {
    ($level:expr, $direction:expr, $method:expr, $data:expr) => {
        tracing::event!(
            $level,
            direction = $direction,
            method = $method,
            data = ?$data,
            "LSP message"
        );
    };
}

/// Emit a `duration_ms` event for a finished operation
#[macro_export]
macro_rules! log_timing {
    ($level:expr, $operation:expr, $duration:expr) => {
        tracing::event!(
            $level,
            operation = $operation,
            duration_ms = $duration.as_millis() as u64,
            "Operation finished"
        );
    };
}
