//! Testing utilities for code that talks to the language server
//!
//! [`MockLspClient`] implements the core of [`LspClientTrait`], records every
//! request and notification, and answers requests from per-method scripted
//! replies. Replies can be delayed or never arrive, which is how timeout
//! paths are exercised.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::lsp::error::LspError;
use crate::lsp::protocol::JsonRpcError;
use crate::lsp::traits::LspClientTrait;

/// Scripted reply for a mocked request
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Successful result
    Result(Value),
    /// JSON-RPC error object
    Error { code: i32, message: String },
    /// The server never answers; the caller's timeout fires
    Never,
    /// Result delivered after a delay (times out if the delay exceeds the timeout)
    Delayed(Duration, Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Request,
    Notification,
}

/// One call observed by the mock
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub kind: CallKind,
    pub method: String,
    pub params: Option<Value>,
}

/// Mock LSP client for testing
#[derive(Debug)]
pub struct MockLspClient {
    running: AtomicBool,
    calls: Mutex<Vec<RecordedCall>>,
    queued: Mutex<HashMap<String, VecDeque<MockReply>>>,
    defaults: Mutex<HashMap<String, MockReply>>,
}

impl MockLspClient {
    /// Create a running mock that answers every request with `null`
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(true),
            calls: Mutex::new(Vec::new()),
            queued: Mutex::new(HashMap::new()),
            defaults: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    /// Queue a one-shot reply for `method`
    pub fn push_reply(&self, method: &str, reply: MockReply) {
        self.queued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(method.to_string())
            .or_default()
            .push_back(reply);
    }

    /// Reply used for `method` once its queue is empty
    pub fn set_default_reply(&self, method: &str, reply: MockReply) {
        self.defaults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(method.to_string(), reply);
    }

    /// Every call observed so far, in order
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Params of each call to `method`, in order
    pub fn params_of(&self, method: &str) -> Vec<Value> {
        self.calls()
            .into_iter()
            .filter(|call| call.method == method)
            .map(|call| call.params.unwrap_or(Value::Null))
            .collect()
    }

    /// Number of calls to `method`
    pub fn count(&self, method: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.method == method)
            .count()
    }

    /// Methods called, in order
    pub fn methods(&self) -> Vec<String> {
        self.calls().into_iter().map(|call| call.method).collect()
    }

    pub fn clear_calls(&self) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn record(&self, kind: CallKind, method: &str, params: Option<Value>) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedCall {
                kind,
                method: method.to_string(),
                params,
            });
    }

    fn next_reply(&self, method: &str) -> MockReply {
        let queued = self
            .queued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(method)
            .and_then(VecDeque::pop_front);

        queued.unwrap_or_else(|| {
            self.defaults
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(method)
                .cloned()
                .unwrap_or(MockReply::Result(Value::Null))
        })
    }
}

impl Default for MockLspClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LspClientTrait for MockLspClient {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, LspError> {
        if !self.is_running() {
            return Err(LspError::NotRunning);
        }
        self.record(CallKind::Request, method, params);

        let timed_out = || LspError::RequestTimeout {
            method: method.to_string(),
        };

        match self.next_reply(method) {
            MockReply::Result(value) => Ok(value),
            MockReply::Error { code, message } => Err(LspError::JsonRpc(JsonRpcError::Server {
                code,
                message,
                data: None,
            })),
            MockReply::Never => {
                tokio::time::sleep(timeout).await;
                Err(timed_out())
            }
            MockReply::Delayed(delay, value) => {
                if delay >= timeout {
                    tokio::time::sleep(timeout).await;
                    Err(timed_out())
                } else {
                    tokio::time::sleep(delay).await;
                    Ok(value)
                }
            }
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), LspError> {
        if !self.is_running() {
            return Err(LspError::NotRunning);
        }
        self.record(CallKind::Notification, method, params);
        Ok(())
    }
}
