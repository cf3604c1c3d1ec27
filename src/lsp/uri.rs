//! Conversions between filesystem paths and `file://` document URIs

use crate::lsp::error::LspError;
use lsp_types::Uri;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Absolute, symlink-resolved form of `path`
///
/// Files that do not exist yet (unsaved buffers) keep their absolute
/// spelling instead of failing canonicalization.
pub fn canonical_path(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

/// Canonical `file://` URI string for a path (percent-encoded)
pub fn file_uri_string(path: &Path) -> Result<String, LspError> {
    url::Url::from_file_path(canonical_path(path))
        .map(String::from)
        .map_err(|_| LspError::InvalidUri(path.display().to_string()))
}

/// Canonical `file://` URI for a path as an LSP [`Uri`]
pub fn path_to_uri(path: &Path) -> Result<Uri, LspError> {
    let uri = file_uri_string(path)?;
    Uri::from_str(&uri).map_err(|_| LspError::InvalidUri(uri))
}

/// Filesystem path of a `file://` URI, `None` for other schemes
pub fn uri_to_path(uri: &str) -> Option<PathBuf> {
    let url = url::Url::parse(uri).ok()?;
    if url.scheme() != "file" {
        return None;
    }
    url.to_file_path().ok()
}
