//! LSP client trait
//!
//! The core of the trait is three methods: `is_running`, `request` and
//! `notify`. Every typed LSP operation is a provided method that serializes
//! `lsp_types` params on top of them, so the real client, the supervisor
//! handle and the test mock only implement the core.

use async_trait::async_trait;
use lsp_types::{
    CompletionContext, CompletionParams, CompletionTriggerKind, DidChangeConfigurationParams,
    DidChangeTextDocumentParams, DidCloseTextDocumentParams, DidOpenTextDocumentParams,
    DocumentFormattingParams, FormattingOptions, GotoDefinitionParams, HoverParams, InitializeParams, InitializedParams, PartialResultParams,
    Position, ReferenceContext, ReferenceParams, SignatureHelpContext, SignatureHelpParams,
    SignatureHelpTriggerKind, TextDocumentContentChangeEvent, TextDocumentIdentifier,
    TextDocumentItem, TextDocumentPositionParams, Uri, VersionedTextDocumentIdentifier,
    WorkDoneProgressParams, WorkspaceSymbolParams,
};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

use crate::lsp::error::LspError;
use crate::lsp::protocol::JsonRpcError;

fn to_params<P: Serialize>(params: &P) -> Result<Option<Value>, LspError> {
    serde_json::to_value(params)
        .map(Some)
        .map_err(|e| LspError::JsonRpc(JsonRpcError::Serialization(e)))
}

fn position_params(uri: &Uri, position: Position) -> TextDocumentPositionParams {
    TextDocumentPositionParams {
        text_document: TextDocumentIdentifier { uri: uri.clone() },
        position,
    }
}

#[async_trait]
pub trait LspClientTrait: Send + Sync {
    // ========================================================================
    // Core
    // ========================================================================

    /// Whether a live connection to the server exists
    fn is_running(&self) -> bool;

    /// Send a request and wait up to `timeout` for its result
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, LspError>;

    /// Send a notification
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), LspError>;

    // ========================================================================
    // Lifecycle
    // ========================================================================

    async fn initialize(
        &self,
        params: InitializeParams,
        timeout: Duration,
    ) -> Result<Value, LspError> {
        self.request("initialize", to_params(&params)?, timeout)
            .await
    }

    async fn initialized(&self) -> Result<(), LspError> {
        self.notify("initialized", to_params(&InitializedParams {})?)
            .await
    }

    // ========================================================================
    // Document Synchronization
    // ========================================================================

    async fn open_text_document(
        &self,
        uri: &Uri,
        language_id: &str,
        version: i32,
        text: String,
    ) -> Result<(), LspError> {
        let params = DidOpenTextDocumentParams {
            text_document: TextDocumentItem {
                uri: uri.clone(),
                language_id: language_id.to_string(),
                version,
                text,
            },
        };
        self.notify("textDocument/didOpen", to_params(&params)?)
            .await
    }

    /// Full-text change: the whole document is replaced
    async fn change_text_document(
        &self,
        uri: &Uri,
        version: i32,
        text: String,
    ) -> Result<(), LspError> {
        let params = DidChangeTextDocumentParams {
            text_document: VersionedTextDocumentIdentifier {
                uri: uri.clone(),
                version,
            },
            content_changes: vec![TextDocumentContentChangeEvent {
                range: None,
                range_length: None,
                text,
            }],
        };
        self.notify("textDocument/didChange", to_params(&params)?)
            .await
    }

    async fn close_text_document(&self, uri: &Uri) -> Result<(), LspError> {
        let params = DidCloseTextDocumentParams {
            text_document: TextDocumentIdentifier { uri: uri.clone() },
        };
        self.notify("textDocument/didClose", to_params(&params)?)
            .await
    }

    // ========================================================================
    // Workspace
    // ========================================================================

    async fn change_configuration(&self, settings: Value) -> Result<(), LspError> {
        let params = DidChangeConfigurationParams { settings };
        self.notify("workspace/didChangeConfiguration", to_params(&params)?)
            .await
    }

    async fn workspace_symbols(&self, query: &str, timeout: Duration) -> Result<Value, LspError> {
        let params = WorkspaceSymbolParams {
            partial_result_params: PartialResultParams::default(),
            work_done_progress_params: WorkDoneProgressParams::default(),
            query: query.to_string(),
        };
        self.request("workspace/symbol", to_params(&params)?, timeout)
            .await
    }

    // ========================================================================
    // Language Features
    // ========================================================================

    async fn completion(
        &self,
        uri: &Uri,
        position: Position,
        trigger_character: Option<String>,
        timeout: Duration,
    ) -> Result<Value, LspError> {
        let params = CompletionParams {
            text_document_position: position_params(uri, position),
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
            context: Some(CompletionContext {
                trigger_kind: CompletionTriggerKind::INVOKED,
                trigger_character,
            }),
        };
        self.request("textDocument/completion", to_params(&params)?, timeout)
            .await
    }

    async fn hover(
        &self,
        uri: &Uri,
        position: Position,
        timeout: Duration,
    ) -> Result<Value, LspError> {
        let params = HoverParams {
            text_document_position_params: position_params(uri, position),
            work_done_progress_params: WorkDoneProgressParams::default(),
        };
        self.request("textDocument/hover", to_params(&params)?, timeout)
            .await
    }

    async fn definition(
        &self,
        uri: &Uri,
        position: Position,
        timeout: Duration,
    ) -> Result<Value, LspError> {
        let params = GotoDefinitionParams {
            text_document_position_params: position_params(uri, position),
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
        };
        self.request("textDocument/definition", to_params(&params)?, timeout)
            .await
    }

    async fn references(
        &self,
        uri: &Uri,
        position: Position,
        include_declaration: bool,
        timeout: Duration,
    ) -> Result<Value, LspError> {
        let params = ReferenceParams {
            text_document_position: position_params(uri, position),
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
            context: ReferenceContext {
                include_declaration,
            },
        };
        self.request("textDocument/references", to_params(&params)?, timeout)
            .await
    }

    async fn signature_help(
        &self,
        uri: &Uri,
        position: Position,
        trigger_character: Option<String>,
        timeout: Duration,
    ) -> Result<Value, LspError> {
        let params = SignatureHelpParams {
            context: Some(SignatureHelpContext {
                trigger_kind: SignatureHelpTriggerKind::TRIGGER_CHARACTER,
                trigger_character,
                is_retrigger: false,
                active_signature_help: None,
            }),
            text_document_position_params: position_params(uri, position),
            work_done_progress_params: WorkDoneProgressParams::default(),
        };
        self.request("textDocument/signatureHelp", to_params(&params)?, timeout)
            .await
    }

    async fn formatting(
        &self,
        uri: &Uri,
        options: FormattingOptions,
        timeout: Duration,
    ) -> Result<Value, LspError> {
        let params = DocumentFormattingParams {
            text_document: TextDocumentIdentifier { uri: uri.clone() },
            options,
            work_done_progress_params: WorkDoneProgressParams::default(),
        };
        self.request("textDocument/formatting", to_params(&params)?, timeout)
            .await
    }
}
