//! Client runtime for the Kotlin language server
//!
//! Launches and supervises the server JVM, keeps editor documents in sync
//! with it, and turns editor requests into completion lists, hover text,
//! locations and diagnostics.
//!
//! - **io**: child process and byte transport
//! - **lsp**: framing, JSON-RPC correlation and the typed client
//! - **kotlin**: server session, documents, request pipeline, diagnostics
//! - **project**: classpath, index cache, workspace setup, build watcher
//! - **bridge**: the editor-facing facade tying it together

pub mod bridge;
pub mod io;
pub mod kotlin;
pub mod logging;
pub mod lsp;
pub mod project;

#[cfg(test)]
mod test_utils;

pub use bridge::{EditorEvent, KotlinBridge};
