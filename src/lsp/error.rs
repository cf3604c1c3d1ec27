//! LSP client errors

use crate::lsp::protocol::JsonRpcError;

#[derive(Debug, thiserror::Error)]
pub enum LspError {
    #[error("JSON-RPC error: {0}")]
    JsonRpc(#[from] JsonRpcError),

    #[error("Language server is not running")]
    NotRunning,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Request timeout: {method}")]
    RequestTimeout { method: String },

    #[error("Invalid document URI: {0}")]
    InvalidUri(String),
}

impl LspError {
    /// Map a JSON-RPC failure for `method`, surfacing timeouts with the method name
    pub fn from_rpc(method: &str, error: JsonRpcError) -> Self {
        match error {
            JsonRpcError::Timeout => LspError::RequestTimeout {
                method: method.to_string(),
            },
            other => LspError::JsonRpc(other),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            LspError::RequestTimeout { .. } | LspError::JsonRpc(JsonRpcError::Timeout)
        )
    }
}
