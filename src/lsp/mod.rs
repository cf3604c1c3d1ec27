//! Language Server Protocol client
//!
//! Layered bottom-up:
//!
//! - **framing**: `Content-Length` message framing over a byte transport
//! - **protocol**: JSON-RPC 2.0 request correlation and notification routing
//! - **client**: typed LSP client bound to one server connection
//! - **traits**: the `LspClientTrait` seam used by higher layers and mocks

pub mod client;
pub mod error;
pub mod framing;
pub mod protocol;
pub mod testing;
pub mod traits;
pub mod uri;

pub use client::LspClient;
pub use error::LspError;
pub use protocol::{JsonRpcClient, JsonRpcError, JsonRpcNotification};
pub use traits::LspClientTrait;
