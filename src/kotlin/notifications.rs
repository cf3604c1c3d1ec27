//! Notification router
//!
//! Decodes notifications pushed by the server and hands them to the
//! registered consumers. Diagnostics go to the diagnostics callback; log and
//! show-message notifications go to `tracing` under the
//! `kotlin_lsp::server` target.

use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

use lsp_types::Range;
use serde_json::Value;
use tracing::{debug, error, info, trace, warn};

use crate::kotlin::diagnostics::{
    DiagnosticCode, DiagnosticItem, DiagnosticResult, DiagnosticSeverity, FileDiagnostics,
};
use crate::kotlin::error::BridgeError;
use crate::lsp::protocol::JsonRpcNotification;
use crate::lsp::uri::uri_to_path;

pub const PUBLISH_DIAGNOSTICS: &str = "textDocument/publishDiagnostics";
pub const LOG_MESSAGE: &str = "window/logMessage";
pub const SHOW_MESSAGE: &str = "window/showMessage";

/// Source reported when the server omits one
pub const DEFAULT_DIAGNOSTIC_SOURCE: &str = "kotlin";

pub type DiagnosticsCallback = Arc<dyn Fn(DiagnosticResult) + Send + Sync>;
pub type MessageCallback = Arc<dyn Fn(ServerMessage) + Send + Sync>;

/// LSP `MessageType`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Error,
    Warning,
    Info,
    Log,
    Debug,
}

impl MessageKind {
    pub fn from_lsp(value: Option<i64>) -> Self {
        match value {
            Some(1) => MessageKind::Error,
            Some(2) => MessageKind::Warning,
            Some(3) => MessageKind::Info,
            Some(4) => MessageKind::Log,
            _ => MessageKind::Debug,
        }
    }
}

/// A `window/showMessage` notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerMessage {
    pub kind: MessageKind,
    pub message: String,
}

#[derive(Default)]
pub struct NotificationRouter {
    diagnostics: RwLock<Option<DiagnosticsCallback>>,
    messages: RwLock<Option<MessageCallback>>,
}

impl NotificationRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_diagnostics_callback<F>(&self, callback: F)
    where
        F: Fn(DiagnosticResult) + Send + Sync + 'static,
    {
        *self
            .diagnostics
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    pub fn set_message_callback<F>(&self, callback: F)
    where
        F: Fn(ServerMessage) + Send + Sync + 'static,
    {
        *self
            .messages
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    /// Dispatch one server notification
    ///
    /// Runs on the connection's dispatch task, so it never blocks.
    pub fn route(&self, notification: JsonRpcNotification) {
        let params = notification.params.unwrap_or(Value::Null);
        match notification.method.as_str() {
            PUBLISH_DIAGNOSTICS => match decode_publish_diagnostics(&params) {
                Ok(diagnostics) => {
                    debug!(
                        "Diagnostics for {}: {} item(s)",
                        diagnostics.uri,
                        diagnostics.items.len()
                    );
                    self.publish(DiagnosticResult::Updated(diagnostics));
                }
                Err(e) => warn!(category = e.category(), "Dropping diagnostics: {}", e),
            },
            LOG_MESSAGE => {
                let (kind, message) = message_parts(&params);
                log_server_message(kind, &message);
            }
            SHOW_MESSAGE => {
                let (kind, message) = message_parts(&params);
                info!(target: "kotlin_lsp::server", "{}", message);
                let callback = self
                    .messages
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                if let Some(callback) = callback {
                    callback(ServerMessage { kind, message });
                }
            }
            other => debug!("Unhandled server notification: {}", other),
        }
    }

    /// Forward a diagnostics result; `NoUpdate` is swallowed here
    pub fn publish(&self, result: DiagnosticResult) {
        if result.is_no_update() {
            trace!("Diagnostics unchanged, not forwarding");
            return;
        }
        let callback = self
            .diagnostics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match callback {
            Some(callback) => callback(result),
            None => trace!("No diagnostics callback registered"),
        }
    }
}

fn message_parts(params: &Value) -> (MessageKind, String) {
    let kind = MessageKind::from_lsp(params.get("type").and_then(Value::as_i64));
    let message = params
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    (kind, message)
}

fn log_server_message(kind: MessageKind, message: &str) {
    match kind {
        MessageKind::Error => error!(target: "kotlin_lsp::server", "{}", message),
        MessageKind::Warning => warn!(target: "kotlin_lsp::server", "{}", message),
        MessageKind::Info => info!(target: "kotlin_lsp::server", "{}", message),
        MessageKind::Log => debug!(target: "kotlin_lsp::server", "{}", message),
        MessageKind::Debug => trace!(target: "kotlin_lsp::server", "{}", message),
    }
}

/// Decode `publishDiagnostics` params
///
/// Items without a message or a valid range are skipped; the rest are kept
/// in server order.
pub fn decode_publish_diagnostics(params: &Value) -> Result<FileDiagnostics, BridgeError> {
    let uri = params
        .get("uri")
        .and_then(Value::as_str)
        .ok_or_else(|| BridgeError::ProtocolDecode("publishDiagnostics without uri".to_string()))?;

    let items = params
        .get("diagnostics")
        .and_then(Value::as_array)
        .map(|raw| raw.iter().filter_map(decode_diagnostic).collect())
        .unwrap_or_default();

    Ok(FileDiagnostics {
        file: uri_to_path(uri).unwrap_or_else(|| PathBuf::from(uri)),
        uri: uri.to_string(),
        items,
    })
}

fn decode_diagnostic(raw: &Value) -> Option<DiagnosticItem> {
    let message = raw.get("message")?.as_str()?.to_string();
    let range: Range = match raw.get("range").cloned().map(serde_json::from_value) {
        Some(Ok(range)) => range,
        _ => {
            debug!("Skipping diagnostic without a valid range: {}", message);
            return None;
        }
    };

    let code = match raw.get("code") {
        Some(Value::String(code)) => Some(DiagnosticCode::Text(code.clone())),
        Some(Value::Number(code)) => code.as_i64().map(DiagnosticCode::Number),
        _ => None,
    };

    Some(DiagnosticItem {
        message,
        code,
        range,
        source: raw
            .get("source")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_DIAGNOSTIC_SOURCE)
            .to_string(),
        severity: DiagnosticSeverity::from_lsp(raw.get("severity").and_then(Value::as_i64)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn notification(method: &str, params: Value) -> JsonRpcNotification {
        JsonRpcNotification {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params: Some(params),
        }
    }

    fn collecting_router() -> (NotificationRouter, Arc<Mutex<Vec<DiagnosticResult>>>) {
        let router = NotificationRouter::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        router.set_diagnostics_callback(move |result| sink.lock().unwrap().push(result));
        (router, seen)
    }

    #[test]
    fn test_single_error_diagnostic_is_forwarded() {
        let (router, seen) = collecting_router();

        router.route(notification(
            PUBLISH_DIAGNOSTICS,
            json!({
                "uri": "file:///X.kt",
                "diagnostics": [{
                    "range": {"start": {"line": 2, "character": 4}, "end": {"line": 2, "character": 9}},
                    "severity": 1,
                    "code": "UNRESOLVED_REFERENCE",
                    "message": "Unresolved reference: foo"
                }]
            }),
        ));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let DiagnosticResult::Updated(file) = &seen[0] else {
            panic!("Expected an update, got {:?}", seen[0]);
        };
        assert_eq!(file.file, PathBuf::from("/X.kt"));
        assert_eq!(file.items.len(), 1);
        let item = &file.items[0];
        assert_eq!(item.severity, DiagnosticSeverity::Error);
        assert_eq!(item.source, "kotlin");
        assert_eq!(
            item.code,
            Some(DiagnosticCode::Text("UNRESOLVED_REFERENCE".to_string()))
        );
        assert_eq!(item.range.start.line, 2);
        assert_ne!(seen[0], DiagnosticResult::NoUpdate);
    }

    #[test]
    fn test_empty_list_is_an_update_not_no_update() {
        let (router, seen) = collecting_router();
        router.route(notification(
            PUBLISH_DIAGNOSTICS,
            json!({"uri": "file:///X.kt", "diagnostics": []}),
        ));

        let seen = seen.lock().unwrap();
        assert!(matches!(&seen[0], DiagnosticResult::Updated(f) if f.items.is_empty()));
    }

    #[test]
    fn test_no_update_is_never_forwarded() {
        let (router, seen) = collecting_router();
        router.publish(DiagnosticResult::NoUpdate);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_decode_severity_code_and_malformed_items() {
        let decoded = decode_publish_diagnostics(&json!({
            "uri": "file:///X.kt",
            "diagnostics": [
                {"range": {"start": {"line": 0, "character": 0}, "end": {"line": 0, "character": 1}},
                 "severity": 2, "code": 42, "source": "detekt", "message": "warn"},
                {"range": {"start": {"line": 1, "character": 0}, "end": {"line": 1, "character": 1}},
                 "severity": 9, "message": "odd severity"},
                {"severity": 1, "message": "no range"},
                {"range": {"start": {"line": 1, "character": 0}, "end": {"line": 1, "character": 1}}}
            ]
        }))
        .unwrap();

        assert_eq!(decoded.items.len(), 2);
        assert_eq!(decoded.items[0].severity, DiagnosticSeverity::Warning);
        assert_eq!(decoded.items[0].code, Some(DiagnosticCode::Number(42)));
        assert_eq!(decoded.items[0].source, "detekt");
        assert_eq!(decoded.items[1].severity, DiagnosticSeverity::Error);
    }

    #[test]
    fn test_missing_uri_is_a_decode_error() {
        let result = decode_publish_diagnostics(&json!({"diagnostics": []}));
        assert!(matches!(result, Err(BridgeError::ProtocolDecode(_))));
    }

    #[test]
    fn test_show_message_reaches_callback() {
        let router = NotificationRouter::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        router.set_message_callback(move |message| sink.lock().unwrap().push(message));

        router.route(notification(
            SHOW_MESSAGE,
            json!({"type": 2, "message": "Gradle sync needed"}),
        ));
        router.route(notification(LOG_MESSAGE, json!({"type": 3, "message": "ignored"})));
        router.route(notification("$/progress", json!({})));

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![ServerMessage {
                kind: MessageKind::Warning,
                message: "Gradle sync needed".to_string()
            }]
        );
    }
}
