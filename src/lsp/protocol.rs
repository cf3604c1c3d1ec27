//! JSON-RPC 2.0 protocol layer
//!
//! Correlates requests with responses by integer id, routes unsolicited
//! notifications to a handler and answers the few requests the server
//! sends to the client. A single dispatch task owns the framed transport:
//! outbound messages are written one at a time from a queue, so message
//! bytes from concurrent callers never interleave.

use crate::io::transport::Transport;
use crate::log_lsp_message;
use crate::lsp::framing::LspFraming;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{Level, debug, error, trace, warn};

// ============================================================================
// JSON-RPC Types
// ============================================================================

/// JSON-RPC 2.0 request message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: Value,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// JSON-RPC 2.0 response message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcErrorObject>,
}

/// JSON-RPC 2.0 notification message (no response expected)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// JSON-RPC error object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcErrorObject {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

// ============================================================================
// JSON-RPC Errors
// ============================================================================

/// JSON-RPC error codes as defined in the specification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum JsonRpcErrorCode {
    ParseError = -32700,
    InvalidRequest = -32600,
    MethodNotFound = -32601,
    InvalidParams = -32602,
    InternalError = -32603,
}

/// JSON-RPC error type
#[derive(Debug, thiserror::Error)]
pub enum JsonRpcError {
    #[error("JSON-RPC server error ({code}): {message}")]
    Server {
        code: i32,
        message: String,
        data: Option<Value>,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(serde_json::Error),

    #[error("Deserialization error: {0}")]
    Deserialization(serde_json::Error),

    #[error("Request timeout")]
    Timeout,

    #[error("Request was cancelled")]
    RequestCancelled,

    #[error("Missing result in response")]
    MissingResult,
}

// ============================================================================
// Inbound message classification
// ============================================================================

/// Shape of a decoded inbound message
#[derive(Debug)]
pub enum InboundMessage {
    /// Response to one of our requests
    Response {
        id: Option<u64>,
        raw_id: Value,
        outcome: Result<Value, JsonRpcErrorObject>,
    },
    /// Request initiated by the server
    ServerRequest {
        id: Value,
        method: String,
        params: Option<Value>,
    },
    Notification(JsonRpcNotification),
    /// Valid JSON that is not a JSON-RPC message, or invalid JSON
    Invalid(String),
}

impl InboundMessage {
    /// Classify a raw message body
    ///
    /// An object carrying `method` is a request (with `id`) or a
    /// notification (without). An object carrying `id` but no `method` is a
    /// response; a missing `result` is treated as `null`.
    pub fn parse(text: &str) -> Self {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => return InboundMessage::Invalid(format!("invalid JSON: {}", e)),
        };

        let Some(object) = value.as_object() else {
            return InboundMessage::Invalid("message is not a JSON object".to_string());
        };

        let id = object.get("id").filter(|id| !id.is_null()).cloned();
        let method = object.get("method").and_then(Value::as_str);
        let params = object.get("params").cloned();

        match (id, method) {
            (Some(id), Some(method)) => InboundMessage::ServerRequest {
                id,
                method: method.to_string(),
                params,
            },
            (None, Some(method)) => InboundMessage::Notification(JsonRpcNotification {
                jsonrpc: "2.0".to_string(),
                method: method.to_string(),
                params,
            }),
            (Some(raw_id), None) => {
                let outcome = match object.get("error") {
                    Some(error) if !error.is_null() => {
                        match serde_json::from_value::<JsonRpcErrorObject>(error.clone()) {
                            Ok(error) => Err(error),
                            Err(e) => Err(JsonRpcErrorObject {
                                code: JsonRpcErrorCode::InternalError as i32,
                                message: format!("malformed error object: {}", e),
                                data: Some(error.clone()),
                            }),
                        }
                    }
                    _ => Ok(object.get("result").cloned().unwrap_or(Value::Null)),
                };
                InboundMessage::Response {
                    id: raw_id.as_u64(),
                    raw_id,
                    outcome,
                }
            }
            (None, None) => {
                InboundMessage::Invalid("message has neither id nor method".to_string())
            }
        }
    }
}

// ============================================================================
// JSON-RPC Client
// ============================================================================

type NotificationHandler = Arc<dyn Fn(JsonRpcNotification) + Send + Sync>;
type PendingSender = oneshot::Sender<Result<Value, JsonRpcError>>;
type PendingTable = Arc<Mutex<HashMap<u64, PendingSender>>>;

/// A request that has been written and is waiting for its response
///
/// Resolves exactly once. Dropping it, or letting [`PendingResponse::wait`]
/// time out, abandons the wait without retracting the request; a late
/// response is then dropped as an unknown id.
pub struct PendingResponse {
    id: u64,
    method: String,
    receiver: oneshot::Receiver<Result<Value, JsonRpcError>>,
    pending_requests: PendingTable,
}

impl PendingResponse {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the response, giving up after `timeout`
    pub async fn wait(self, timeout: Duration) -> Result<Value, JsonRpcError> {
        let PendingResponse {
            id,
            method,
            receiver,
            pending_requests,
        } = self;

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(JsonRpcError::RequestCancelled),
            Err(_) => {
                pending_requests.lock().await.remove(&id);
                debug!(
                    "JsonRpcClient: Request {} ({}) timed out after {:?}",
                    id, method, timeout
                );
                Err(JsonRpcError::Timeout)
            }
        }
    }
}

/// JSON-RPC client with request/response correlation
pub struct JsonRpcClient<T: Transport> {
    outbound_sender: mpsc::UnboundedSender<String>,
    request_id: AtomicU64,
    pending_requests: PendingTable,
    notification_handler: Arc<Mutex<Option<NotificationHandler>>>,
    connected: Arc<AtomicBool>,
    shutdown: CancellationToken,
    _phantom: std::marker::PhantomData<fn() -> T>,
}

impl<T: Transport + 'static> JsonRpcClient<T> {
    /// Create a client and spawn its dispatch task
    pub fn new(transport: T) -> Self {
        let (outbound_sender, outbound_receiver) = mpsc::unbounded_channel::<String>();
        let pending_requests: PendingTable = Arc::new(Mutex::new(HashMap::new()));
        let notification_handler = Arc::new(Mutex::new(None::<NotificationHandler>));
        let connected = Arc::new(AtomicBool::new(true));
        let shutdown = CancellationToken::new();

        tokio::spawn(Self::dispatch_task(
            LspFraming::new(transport),
            outbound_receiver,
            Arc::clone(&pending_requests),
            Arc::clone(&notification_handler),
            Arc::clone(&connected),
            shutdown.clone(),
        ));

        Self {
            outbound_sender,
            request_id: AtomicU64::new(1),
            pending_requests,
            notification_handler,
            connected,
            shutdown,
            _phantom: std::marker::PhantomData,
        }
    }

    async fn dispatch_task(
        mut framing: LspFraming<T>,
        mut outbound_receiver: mpsc::UnboundedReceiver<String>,
        pending_requests: PendingTable,
        notification_handler: Arc<Mutex<Option<NotificationHandler>>>,
        connected: Arc<AtomicBool>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    // Flush what was queued before close, e.g. the `exit` notification
                    while let Ok(message) = outbound_receiver.try_recv() {
                        if framing.send_message(&message).await.is_err() {
                            break;
                        }
                    }
                    trace!("JsonRpcClient: dispatch task cancelled");
                    break;
                }
                outbound = outbound_receiver.recv() => {
                    let Some(message) = outbound else {
                        trace!("JsonRpcClient: outbound channel closed");
                        break;
                    };
                    if let Err(e) = framing.send_message(&message).await {
                        error!("Failed to send message: {}", e);
                        break;
                    }
                }
                inbound = framing.receive_message() => {
                    match inbound {
                        Ok(message) => {
                            let handler = notification_handler.lock().await.clone();
                            let reply =
                                Self::process_inbound_message(&message, &pending_requests, &handler)
                                    .await;
                            if let Some(reply) = reply {
                                if let Err(e) = framing.send_message(&reply).await {
                                    error!("Failed to reply to server request: {}", e);
                                    break;
                                }
                            }
                        }
                        Err(e) => {
                            debug!("JsonRpcClient: transport closed: {}", e);
                            break;
                        }
                    }
                }
            }
        }

        connected.store(false, Ordering::SeqCst);
        Self::fail_pending(&pending_requests).await;
        let _ = framing.close().await;
        trace!("JsonRpcClient: dispatch task finished");
    }

    /// Handle one inbound message; returns a reply for server requests
    async fn process_inbound_message(
        message: &str,
        pending_requests: &PendingTable,
        notification_handler: &Option<NotificationHandler>,
    ) -> Option<String> {
        match InboundMessage::parse(message) {
            InboundMessage::Response {
                id,
                raw_id,
                outcome,
            } => {
                let Some(id) = id else {
                    warn!("Received response with non-numeric id {}", raw_id);
                    return None;
                };
                let sender = pending_requests.lock().await.remove(&id);
                let Some(sender) = sender else {
                    debug!("Received response for unknown or abandoned request {}", id);
                    return None;
                };

                let result = outcome.map_err(|error| {
                    warn!(
                        "Language server returned error for request {}: code={}, message={}",
                        id, error.code, error.message
                    );
                    JsonRpcError::Server {
                        code: error.code,
                        message: error.message,
                        data: error.data,
                    }
                });

                if sender.send(result).is_err() {
                    debug!("Response receiver dropped for request {}", id);
                }
                None
            }
            InboundMessage::Notification(notification) => {
                log_lsp_message!(
                    Level::TRACE,
                    "incoming",
                    notification.method.as_str(),
                    &notification.params
                );
                match notification_handler {
                    Some(handler) => handler(notification),
                    None => debug!("No notification handler for {}", notification.method),
                }
                None
            }
            InboundMessage::ServerRequest { id, method, params } => {
                log_lsp_message!(Level::DEBUG, "incoming-request", method.as_str(), &params);
                Some(Self::reply_to_server_request(id, &method, params.as_ref()))
            }
            InboundMessage::Invalid(reason) => {
                warn!("Dropping unparseable message ({}): {}", reason, message);
                None
            }
        }
    }

    /// Build the reply to a server-initiated request
    ///
    /// Registration and progress requests are acknowledged, configuration
    /// pulls get one `null` per item, everything else is MethodNotFound.
    fn reply_to_server_request(id: Value, method: &str, params: Option<&Value>) -> String {
        let (result, error) = match method {
            "client/registerCapability"
            | "client/unregisterCapability"
            | "window/workDoneProgress/create" => (Some(Value::Null), None),
            "workspace/configuration" => {
                let count = params
                    .and_then(|p| p.get("items"))
                    .and_then(Value::as_array)
                    .map_or(0, Vec::len);
                (Some(Value::Array(vec![Value::Null; count])), None)
            }
            _ => (
                None,
                Some(JsonRpcErrorObject {
                    code: JsonRpcErrorCode::MethodNotFound as i32,
                    message: format!("Method not supported by client: {}", method),
                    data: None,
                }),
            ),
        };

        let response = JsonRpcResponse {
            jsonrpc: "2.0".to_string(),
            id,
            result,
            error,
        };

        serde_json::to_string(&response).unwrap_or_else(|e| {
            error!("Failed to serialize reply to {}: {}", method, e);
            String::from("{}")
        })
    }

    /// Set notification handler
    pub async fn on_notification<F>(&self, handler: F)
    where
        F: Fn(JsonRpcNotification) + Send + Sync + 'static,
    {
        *self.notification_handler.lock().await = Some(Arc::new(handler));
    }

    /// Write a request and return the handle that resolves with its response
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<PendingResponse, JsonRpcError> {
        if !self.is_connected() {
            return Err(JsonRpcError::Transport("Connection closed".to_string()));
        }

        let id = self.request_id.fetch_add(1, Ordering::SeqCst);
        let (response_sender, response_receiver) = oneshot::channel();
        self.pending_requests
            .lock()
            .await
            .insert(id, response_sender);

        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: Value::from(id),
            method: method.to_string(),
            params,
        };

        let request_json = match serde_json::to_string(&request) {
            Ok(json) => json,
            Err(e) => {
                self.pending_requests.lock().await.remove(&id);
                return Err(JsonRpcError::Serialization(e));
            }
        };
        log_lsp_message!(Level::TRACE, "outgoing", method, &request_json);

        if self.outbound_sender.send(request_json).is_err() {
            self.pending_requests.lock().await.remove(&id);
            return Err(JsonRpcError::Transport("Outbound channel closed".to_string()));
        }

        Ok(PendingResponse {
            id,
            method: method.to_string(),
            receiver: response_receiver,
            pending_requests: Arc::clone(&self.pending_requests),
        })
    }

    /// Send a request and wait for its result with a timeout
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, JsonRpcError> {
        self.send_request(method, params).await?.wait(timeout).await
    }

    /// Send a JSON-RPC notification
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), JsonRpcError> {
        if !self.is_connected() {
            return Err(JsonRpcError::Transport("Connection closed".to_string()));
        }

        let notification = JsonRpcNotification {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
        };

        let notification_json =
            serde_json::to_string(&notification).map_err(JsonRpcError::Serialization)?;
        log_lsp_message!(Level::TRACE, "outgoing", method, &notification_json);

        self.outbound_sender
            .send(notification_json)
            .map_err(|_| JsonRpcError::Transport("Outbound channel closed".to_string()))
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.outbound_sender.is_closed()
    }

    /// Number of requests still waiting for a response
    pub async fn pending_count(&self) -> usize {
        self.pending_requests.lock().await.len()
    }

    async fn fail_pending(pending_requests: &PendingTable) {
        let mut pending = pending_requests.lock().await;
        for (id, sender) in pending.drain() {
            debug!("JsonRpcClient: Cancelling pending request ID {}", id);
            let _ = sender.send(Err(JsonRpcError::RequestCancelled));
        }
    }

    /// Fail every outstanding request with `RequestCancelled`
    pub async fn cleanup_pending_requests(&self) {
        Self::fail_pending(&self.pending_requests).await;
    }

    /// Stop the dispatch task and release waiters
    ///
    /// Messages queued before the call are still written.
    pub async fn close(&self) {
        self.cleanup_pending_requests().await;
        self.connected.store(false, Ordering::SeqCst);
        self.shutdown.cancel();
    }
}

impl<T: Transport> Drop for JsonRpcClient<T> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::transport::{MockTransport, MockTransportHandle, StdioTransport};
    use crate::lsp::framing::{FrameDecoder, encode_frame};
    use serde_json::json;
    use std::collections::HashSet;

    /// Decode every JSON message the client has written so far
    fn sent_json(handle: &MockTransportHandle) -> Vec<Value> {
        let mut decoder = FrameDecoder::new();
        for chunk in handle.sent_messages() {
            decoder.push(&chunk);
        }
        let mut messages = Vec::new();
        while let Some(Ok(text)) = decoder.next_frame() {
            messages.push(serde_json::from_str(&text).unwrap());
        }
        messages
    }

    async fn wait_for_sent(handle: &MockTransportHandle, count: usize) {
        for _ in 0..200 {
            if handle.sent_count() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {} sent messages, saw {}", count, handle.sent_count());
    }

    #[test]
    fn test_classify_messages() {
        assert!(matches!(
            InboundMessage::parse(r#"{"jsonrpc":"2.0","id":3,"result":{"a":1}}"#),
            InboundMessage::Response { id: Some(3), outcome: Ok(_), .. }
        ));
        assert!(matches!(
            InboundMessage::parse(r#"{"jsonrpc":"2.0","id":4}"#),
            InboundMessage::Response { id: Some(4), outcome: Ok(Value::Null), .. }
        ));
        assert!(matches!(
            InboundMessage::parse(r#"{"jsonrpc":"2.0","id":5,"error":{"code":-32601,"message":"nope"}}"#),
            InboundMessage::Response { id: Some(5), outcome: Err(JsonRpcErrorObject { code: -32601, .. }), .. }
        ));
        assert!(matches!(
            InboundMessage::parse(r#"{"jsonrpc":"2.0","method":"window/logMessage","params":{}}"#),
            InboundMessage::Notification(_)
        ));
        assert!(matches!(
            InboundMessage::parse(r#"{"jsonrpc":"2.0","id":"x","method":"client/registerCapability"}"#),
            InboundMessage::ServerRequest { .. }
        ));
        assert!(matches!(InboundMessage::parse("not json"), InboundMessage::Invalid(_)));
        assert!(matches!(InboundMessage::parse("[1,2]"), InboundMessage::Invalid(_)));
    }

    #[tokio::test]
    async fn test_request_response_correlation() {
        let (transport, handle) = MockTransport::new();
        let client = JsonRpcClient::new(transport);

        let first = client.send_request("textDocument/hover", Some(json!({}))).await.unwrap();
        let second = client.send_request("textDocument/definition", None).await.unwrap();
        assert!(second.id() > first.id());

        wait_for_sent(&handle, 2).await;

        // Answer out of order
        handle.push_inbound(encode_frame(&format!(
            r#"{{"jsonrpc":"2.0","id":{},"result":"second"}}"#,
            second.id()
        )));
        handle.push_inbound(encode_frame(&format!(
            r#"{{"jsonrpc":"2.0","id":{},"result":"first"}}"#,
            first.id()
        )));

        let timeout = Duration::from_secs(1);
        assert_eq!(second.wait(timeout).await.unwrap(), json!("second"));
        assert_eq!(first.wait(timeout).await.unwrap(), json!("first"));
        assert_eq!(client.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_concurrent_request_ids_are_unique() {
        let (transport, handle) = MockTransport::new();
        let client = Arc::new(JsonRpcClient::new(transport));

        let mut tasks = Vec::new();
        for _ in 0..50 {
            let client = Arc::clone(&client);
            tasks.push(tokio::spawn(async move {
                client.send_request("workspace/symbol", None).await.unwrap().id()
            }));
        }

        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap());
        }

        let unique: HashSet<u64> = ids.iter().copied().collect();
        assert_eq!(unique.len(), 50);
        assert_eq!(unique, (1..=50).collect::<HashSet<u64>>());

        wait_for_sent(&handle, 50).await;
        let wire_ids: HashSet<u64> = sent_json(&handle)
            .iter()
            .map(|m| m["id"].as_u64().unwrap())
            .collect();
        assert_eq!(wire_ids, unique);
    }

    #[tokio::test]
    async fn test_sequential_ids_increase() {
        let (transport, _handle) = MockTransport::new();
        let client = JsonRpcClient::new(transport);

        let mut last = 0;
        for _ in 0..10 {
            let id = client.send_request("shutdown", None).await.unwrap().id();
            assert!(id > last);
            last = id;
        }
    }

    #[tokio::test]
    async fn test_server_error_is_reported() {
        let (transport, handle) = MockTransport::new();
        let client = JsonRpcClient::new(transport);

        let pending = client.send_request("textDocument/completion", None).await.unwrap();
        handle.push_inbound(encode_frame(&format!(
            r#"{{"jsonrpc":"2.0","id":{},"error":{{"code":-32603,"message":"boom"}}}}"#,
            pending.id()
        )));

        match pending.wait(Duration::from_secs(1)).await {
            Err(JsonRpcError::Server { code, message, .. }) => {
                assert_eq!(code, -32603);
                assert_eq!(message, "boom");
            }
            other => panic!("Expected server error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout_abandons_wait_and_late_response_is_dropped() {
        let (transport, handle) = MockTransport::new();
        let client = JsonRpcClient::new(transport);

        let result = client
            .request("textDocument/hover", None, Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(JsonRpcError::Timeout)));
        assert_eq!(client.pending_count().await, 0);

        // The late response takes the unknown-id path and the client keeps working
        handle.push_inbound(encode_frame(r#"{"jsonrpc":"2.0","id":1,"result":"late"}"#));
        let next = client.send_request("textDocument/hover", None).await.unwrap();
        handle.push_inbound(encode_frame(&format!(
            r#"{{"jsonrpc":"2.0","id":{},"result":"fresh"}}"#,
            next.id()
        )));
        assert_eq!(next.wait(Duration::from_secs(1)).await.unwrap(), json!("fresh"));
    }

    #[tokio::test]
    async fn test_malformed_messages_do_not_stop_dispatch() {
        let (transport, handle) = MockTransport::new();
        let client = JsonRpcClient::new(transport);

        let pending = client.send_request("workspace/symbol", None).await.unwrap();
        handle.push_inbound(b"Content-Length: x\r\n\r\n".to_vec());
        handle.push_inbound(encode_frame("this is not json"));
        handle.push_inbound(encode_frame(r#"{"jsonrpc":"2.0","id":999,"result":1}"#));
        handle.push_inbound(encode_frame(&format!(
            r#"{{"jsonrpc":"2.0","id":{},"result":[]}}"#,
            pending.id()
        )));

        assert_eq!(pending.wait(Duration::from_secs(1)).await.unwrap(), json!([]));
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_notifications_reach_handler() {
        let (transport, handle) = MockTransport::new();
        let client = JsonRpcClient::new(transport);

        let (tx, mut rx) = mpsc::unbounded_channel();
        client
            .on_notification(move |notification| {
                let _ = tx.send(notification.method);
            })
            .await;

        handle.push_inbound(encode_frame(
            r#"{"jsonrpc":"2.0","method":"window/logMessage","params":{"type":3,"message":"hi"}}"#,
        ));

        let method = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(method, "window/logMessage");
    }

    #[tokio::test]
    async fn test_server_requests_are_answered() {
        let (transport, handle) = MockTransport::new();
        let _client = JsonRpcClient::new(transport);

        handle.push_inbound(encode_frame(
            r#"{"jsonrpc":"2.0","id":"cfg","method":"workspace/configuration","params":{"items":[{},{}]}}"#,
        ));
        handle.push_inbound(encode_frame(
            r#"{"jsonrpc":"2.0","id":8,"method":"custom/unknown"}"#,
        ));

        wait_for_sent(&handle, 2).await;
        let replies = sent_json(&handle);
        assert_eq!(replies[0]["id"], json!("cfg"));
        assert_eq!(replies[0]["result"], json!([null, null]));
        assert_eq!(replies[1]["id"], json!(8));
        assert_eq!(replies[1]["error"]["code"], json!(-32601));
    }

    #[tokio::test]
    async fn test_disconnect_cancels_pending() {
        let (transport, handle) = MockTransport::new();
        let client = JsonRpcClient::new(transport);

        let pending = client.send_request("workspace/symbol", None).await.unwrap();
        drop(handle);

        let result = pending.wait(Duration::from_secs(1)).await;
        assert!(matches!(result, Err(JsonRpcError::RequestCancelled)));
        assert!(!client.is_connected());
        assert!(client.notify("exit", None).await.is_err());
    }

    #[tokio::test]
    async fn test_close_releases_waiters() {
        let (transport, _handle) = MockTransport::new();
        let client = JsonRpcClient::new(transport);

        let pending = client.send_request("shutdown", None).await.unwrap();
        client.close().await;

        assert!(matches!(
            pending.wait(Duration::from_secs(1)).await,
            Err(JsonRpcError::RequestCancelled)
        ));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_end_to_end_over_duplex_streams() {
        let (client_side, server_side) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client_side);
        let (server_read, server_write) = tokio::io::split(server_side);

        let client = JsonRpcClient::new(StdioTransport::new(client_write, client_read));

        // Fake server: echoes the method name back as the result
        tokio::spawn(async move {
            let mut framing = LspFraming::new(StdioTransport::new(server_write, server_read));
            while let Ok(message) = framing.receive_message().await {
                let request: Value = serde_json::from_str(&message).unwrap();
                let reply = json!({
                    "jsonrpc": "2.0",
                    "id": request["id"],
                    "result": request["method"],
                });
                framing.send_message(&reply.to_string()).await.unwrap();
            }
        });

        let result = client
            .request("textDocument/signatureHelp", Some(json!({})), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(result, json!("textDocument/signatureHelp"));
    }
}
