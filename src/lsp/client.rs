//! LSP client over a JSON-RPC connection

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::io::transport::Transport;
use crate::lsp::error::LspError;
use crate::lsp::protocol::{JsonRpcClient, JsonRpcNotification};
use crate::lsp::traits::LspClientTrait;

/// LSP client bound to one server connection
pub struct LspClient<T: Transport> {
    rpc: JsonRpcClient<T>,
}

impl<T: Transport + 'static> LspClient<T> {
    pub fn new(transport: T) -> Self {
        Self {
            rpc: JsonRpcClient::new(transport),
        }
    }

    /// Route server notifications to `handler`
    pub async fn on_notification<F>(&self, handler: F)
    where
        F: Fn(JsonRpcNotification) + Send + Sync + 'static,
    {
        self.rpc.on_notification(handler).await;
    }

    pub fn is_connected(&self) -> bool {
        self.rpc.is_connected()
    }

    pub async fn pending_count(&self) -> usize {
        self.rpc.pending_count().await
    }

    /// Polite shutdown: `shutdown` request, then `exit` notification
    ///
    /// Errors are logged rather than returned; the process is torn down by
    /// the caller regardless of how the server answered.
    pub async fn shutdown(&self, timeout: Duration) {
        if !self.rpc.is_connected() {
            debug!("LspClient: connection already closed, skipping shutdown handshake");
            self.rpc.close().await;
            return;
        }

        info!("Sending shutdown request to language server");
        if let Err(e) = self.rpc.request("shutdown", None, timeout).await {
            warn!("Language server did not acknowledge shutdown: {}", e);
        }
        if let Err(e) = self.rpc.notify("exit", None).await {
            debug!("Failed to send exit notification: {}", e);
        }

        self.rpc.close().await;
    }

    pub async fn close(&self) {
        self.rpc.close().await;
    }
}

#[async_trait]
impl<T: Transport + 'static> LspClientTrait for LspClient<T> {
    fn is_running(&self) -> bool {
        self.rpc.is_connected()
    }

    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, LspError> {
        let started = std::time::Instant::now();
        let result = self
            .rpc
            .request(method, params, timeout)
            .await
            .map_err(|e| LspError::from_rpc(method, e));
        crate::log_timing!(tracing::Level::DEBUG, method, started.elapsed());
        result
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), LspError> {
        self.rpc.notify(method, params).await.map_err(LspError::from)
    }
}
