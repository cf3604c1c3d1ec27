//! Error types for the Kotlin bridge
//!
//! `BridgeError` is the taxonomy every failure is classified into before it
//! is logged. Request-level failures never travel past the request pipeline;
//! they are logged with their category and turned into empty results.

use std::time::Duration;

use crate::io::process::ProcessError;
use crate::kotlin::documents::DocumentError;
use crate::lsp::error::LspError;
use crate::lsp::protocol::JsonRpcError;
use crate::project::index_cache::CacheError;

// ============================================================================
// Bridge Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The server process could not be launched
    #[error("Language server failed to start: {reason}")]
    TransportStartupFailure { reason: String },

    /// A frame or JSON payload could not be decoded
    #[error("Protocol decode error: {0}")]
    ProtocolDecode(String),

    /// The server answered with a JSON-RPC error object
    #[error("Server reported error ({code}): {message}")]
    ServerReported { code: i32, message: String },

    /// A bounded wait was exceeded
    #[error("Request timeout: {operation}")]
    RequestTimeout { operation: String },

    /// The persisted index record is unreadable or from another version
    #[error("Index cache corrupted: {0}")]
    CacheCorruption(String),

    /// Reading or writing a source or cache file failed
    #[error("File I/O failed for {context}: {source}")]
    FileIo {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// The server is not running or the connection is gone
    #[error("Language server unavailable: {0}")]
    TransportUnavailable(String),

    /// A result item had an unexpected shape
    #[error("Conversion error: {0}")]
    Conversion(String),

    #[error("Configuration error: {0}")]
    Config(#[from] KotlinConfigError),
}

impl BridgeError {
    pub fn startup_failed(reason: impl Into<String>) -> Self {
        Self::TransportStartupFailure {
            reason: reason.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::RequestTimeout {
            operation: operation.into(),
        }
    }

    pub fn conversion(reason: impl Into<String>) -> Self {
        Self::Conversion(reason.into())
    }

    /// Short category name used as a structured log field
    pub fn category(&self) -> &'static str {
        match self {
            Self::TransportStartupFailure { .. } => "transport_startup_failure",
            Self::ProtocolDecode(_) => "protocol_decode",
            Self::ServerReported { .. } => "server_reported",
            Self::RequestTimeout { .. } => "request_timeout",
            Self::CacheCorruption(_) => "cache_corruption",
            Self::FileIo { .. } => "file_io",
            Self::TransportUnavailable(_) => "transport_unavailable",
            Self::Conversion(_) => "conversion",
            Self::Config(_) => "config",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::RequestTimeout { .. })
    }
}

impl From<LspError> for BridgeError {
    fn from(error: LspError) -> Self {
        match error {
            LspError::RequestTimeout { method } => Self::RequestTimeout { operation: method },
            LspError::NotRunning => Self::TransportUnavailable("server not running".to_string()),
            LspError::InvalidUri(uri) => Self::Conversion(format!("invalid document URI: {uri}")),
            LspError::Protocol(message) => Self::ProtocolDecode(message),
            LspError::JsonRpc(rpc) => match rpc {
                JsonRpcError::Server { code, message, .. } => Self::ServerReported { code, message },
                JsonRpcError::Timeout => Self::RequestTimeout {
                    operation: "request".to_string(),
                },
                JsonRpcError::Transport(message) => Self::TransportUnavailable(message),
                JsonRpcError::RequestCancelled => {
                    Self::TransportUnavailable("request cancelled by disconnect".to_string())
                }
                JsonRpcError::Deserialization(e) => Self::ProtocolDecode(e.to_string()),
                JsonRpcError::MissingResult => {
                    Self::ProtocolDecode("response without result".to_string())
                }
                JsonRpcError::Serialization(e) => Self::Conversion(e.to_string()),
            },
        }
    }
}

impl From<DocumentError> for BridgeError {
    fn from(error: DocumentError) -> Self {
        match error {
            DocumentError::FileRead { path, source } => Self::FileIo {
                context: path.display().to_string(),
                source,
            },
            DocumentError::InvalidPath(path) => {
                Self::Conversion(format!("invalid document path: {}", path.display()))
            }
            DocumentError::Lsp(e) => e.into(),
        }
    }
}

impl From<CacheError> for BridgeError {
    fn from(error: CacheError) -> Self {
        match error {
            CacheError::Io(source) => Self::FileIo {
                context: "index cache".to_string(),
                source,
            },
            other => Self::CacheCorruption(other.to_string()),
        }
    }
}

impl From<ProcessError> for BridgeError {
    fn from(error: ProcessError) -> Self {
        Self::startup_failed(error.to_string())
    }
}

// ============================================================================
// Configuration Errors
// ============================================================================

/// Configuration validation and building errors
#[derive(Debug, thiserror::Error)]
pub enum KotlinConfigError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid path: {path} - {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("Invalid timeout: {timeout:?} - {reason}")]
    InvalidTimeout { timeout: Duration, reason: String },

    #[error("Invalid JVM arguments: {args:?} - {reason}")]
    InvalidArguments { args: Vec<String>, reason: String },
}

impl KotlinConfigError {
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
        }
    }

    pub fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_timeout(timeout: Duration, reason: impl Into<String>) -> Self {
        Self::InvalidTimeout {
            timeout,
            reason: reason.into(),
        }
    }

    pub fn invalid_arguments(args: Vec<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArguments {
            args,
            reason: reason.into(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
