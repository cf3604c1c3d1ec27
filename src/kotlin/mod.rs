//! Kotlin language server integration
//!
//! - **server**: process launch and the session-level LSP client
//! - **documents**: open-document versions and full-text sync
//! - **notifications**: diagnostics and server messages
//! - **requests**: debounced completion and the other editor requests
//! - **completion**: item conversion, import edits, classpath candidates
//! - **diagnostics**: the local analysis pass and its idle scheduler

pub mod completion;
pub mod config;
pub mod diagnostics;
pub mod documents;
pub mod error;
pub mod notifications;
pub mod requests;
pub mod server;

pub use config::{FormatStyle, KotlinServerConfig, KotlinServerConfigBuilder, PipelineConfig};
pub use diagnostics::{DiagnosticResult, DiagnosticsAnalyzer, FileDiagnostics, ImportFix};
pub use documents::DocumentSynchronizer;
pub use error::{BridgeError, KotlinConfigError};
pub use notifications::NotificationRouter;
pub use requests::{CompletionRequest, RequestPipeline};
pub use server::{KotlinServer, ServerEnvironment};
