//! Persisted symbol index cache
//!
//! One directory per project under `<cache_root>/kls-cache/`, named by the
//! first 16 hex digits of the SHA-256 of the project path:
//!
//! - `index-cache.json`: the versioned [`IndexCacheRecord`]
//! - `classpath-hash.txt`: hash of the classpath the symbols were indexed with
//!
//! A record that cannot be read is a cache miss, never an error the caller
//! has to handle: `load` logs it and returns `None`.

use std::fmt;
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::kotlin::error::BridgeError;

pub const CACHE_VERSION: u32 = 1;
pub const CACHE_DIR_NAME: &str = "kls-cache";
pub const CACHE_FILE_NAME: &str = "index-cache.json";
pub const CLASSPATH_HASH_FILE: &str = "classpath-hash.txt";

/// Hex digits of the project path hash used as directory name
const PROJECT_HASH_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Incompatible cache version: found {found}, expected {expected}")]
    IncompatibleVersion { found: u32, expected: u32 },

    #[error("Cache record corrupted: {0}")]
    Corrupted(String),
}

impl CacheError {
    pub fn incompatible_version(found: u32, expected: u32) -> Self {
        Self::IncompatibleVersion { found, expected }
    }
}

/// On-disk cache record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IndexCacheRecord {
    pub version: u32,
    /// Milliseconds since the epoch
    pub timestamp: i64,
    pub project_path: String,
    pub classpath_hash: String,
    pub symbols: Vec<Value>,
}

/// Lower-case hex SHA-256 of `bytes`
pub fn sha256_hex(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .fold(String::with_capacity(64), |mut out, byte| {
            let _ = write!(out, "{byte:02x}");
            out
        })
}

/// Order-independent hash of classpath entries
pub fn compute_hash<S: AsRef<str>>(entries: &[S]) -> String {
    let mut sorted: Vec<&str> = entries.iter().map(AsRef::as_ref).collect();
    sorted.sort_unstable();
    sha256_hex(sorted.join("\n").as_bytes())
}

/// [`compute_hash`] over paths
pub fn compute_path_hash(entries: &[PathBuf]) -> String {
    let strings: Vec<String> = entries
        .iter()
        .map(|path| path.display().to_string())
        .collect();
    compute_hash(&strings)
}

#[derive(Debug, Clone)]
pub struct IndexCache {
    project_path: String,
    project_hash: String,
    cache_dir: PathBuf,
}

impl IndexCache {
    pub fn new(cache_root: &Path, project: &Path) -> Self {
        let project_path = project.display().to_string();
        let project_hash = sha256_hex(project_path.as_bytes())[..PROJECT_HASH_LEN].to_string();
        let cache_dir = cache_root.join(CACHE_DIR_NAME).join(&project_hash);
        debug!("Index cache directory: {}", cache_dir.display());

        Self {
            project_path,
            project_hash,
            cache_dir,
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn cache_file(&self) -> PathBuf {
        self.cache_dir.join(CACHE_FILE_NAME)
    }

    fn hash_file(&self) -> PathBuf {
        self.cache_dir.join(CLASSPATH_HASH_FILE)
    }

    /// Both files exist and the stored hash equals `classpath_hash`
    pub fn is_valid(&self, classpath_hash: &str) -> bool {
        if !self.cache_file().is_file() {
            debug!("No index cache for {}", self.project_path);
            return false;
        }
        match fs::read_to_string(self.hash_file()) {
            Ok(stored) => {
                let stored = stored.trim();
                let valid = stored == classpath_hash;
                info!(
                    "Index cache validation: cached={}, current={}, valid={}",
                    short(stored),
                    short(classpath_hash),
                    valid
                );
                valid
            }
            Err(e) => {
                debug!("Classpath hash unreadable: {}", e);
                false
            }
        }
    }

    /// Write the record, then the hash file
    pub fn save(&self, symbols: &[Value], classpath_hash: &str) -> Result<(), CacheError> {
        fs::create_dir_all(&self.cache_dir)?;

        let record = IndexCacheRecord {
            version: CACHE_VERSION,
            timestamp: chrono::Utc::now().timestamp_millis(),
            project_path: self.project_path.clone(),
            classpath_hash: classpath_hash.to_string(),
            symbols: symbols.to_vec(),
        };
        fs::write(self.cache_file(), serde_json::to_vec(&record)?)?;
        fs::write(self.hash_file(), classpath_hash)?;

        info!(
            "Saved index cache with {} symbols (hash {})",
            symbols.len(),
            short(classpath_hash)
        );
        Ok(())
    }

    /// Cached symbols, or `None` on any kind of miss
    pub fn load(&self) -> Option<Vec<Value>> {
        match self.read_record() {
            Ok(Some(record)) => {
                info!("Loaded index cache with {} symbols", record.symbols.len());
                Some(record.symbols)
            }
            Ok(None) => None,
            Err(e) => {
                let error = BridgeError::from(e);
                warn!(category = error.category(), "Ignoring index cache: {}", error);
                None
            }
        }
    }

    fn read_record(&self) -> Result<Option<IndexCacheRecord>, CacheError> {
        let bytes = match fs::read(self.cache_file()) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let value: Value = serde_json::from_slice(&bytes)
            .map_err(|e| CacheError::Corrupted(e.to_string()))?;
        let version = value
            .get("version")
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(0);
        if version != CACHE_VERSION {
            return Err(CacheError::incompatible_version(version, CACHE_VERSION));
        }

        let record = serde_json::from_value(value)
            .map_err(|e| CacheError::Corrupted(e.to_string()))?;
        Ok(Some(record))
    }

    /// Remove this project's cache files
    pub fn clear(&self) {
        for file in [self.cache_file(), self.hash_file()] {
            match fs::remove_file(&file) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove {}: {}", file.display(), e),
            }
        }
        info!("Index cache cleared for {}", self.project_path);
    }

    pub fn stats(&self) -> CacheStats {
        let metadata = fs::metadata(self.cache_file()).ok();
        CacheStats {
            project_hash: self.project_hash.clone(),
            cache_dir: self.cache_dir.clone(),
            exists: metadata.is_some(),
            size_bytes: metadata.as_ref().map(|m| m.len()),
            last_modified: metadata
                .and_then(|m| m.modified().ok())
                .map(DateTime::<Local>::from),
        }
    }
}

/// Remove the caches of every project
pub fn clear_all(cache_root: &Path) -> Result<(), CacheError> {
    let root = cache_root.join(CACHE_DIR_NAME);
    match fs::remove_dir_all(&root) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    fs::create_dir_all(&root)?;
    info!("All index caches cleared");
    Ok(())
}

/// Bytes used by the caches of every project
pub fn total_size(cache_root: &Path) -> u64 {
    WalkDir::new(cache_root.join(CACHE_DIR_NAME))
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|metadata| metadata.len())
        .sum()
}

#[derive(Debug, Clone)]
pub struct CacheStats {
    pub project_hash: String,
    pub cache_dir: PathBuf,
    pub exists: bool,
    pub size_bytes: Option<u64>,
    pub last_modified: Option<DateTime<Local>>,
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Project hash: {}", self.project_hash)?;
        writeln!(f, "Cache dir: {}", self.cache_dir.display())?;
        writeln!(f, "Cache exists: {}", self.exists)?;
        if let Some(size) = self.size_bytes {
            writeln!(f, "Cache size: {} KB", size / 1024)?;
        }
        if let Some(modified) = self.last_modified {
            writeln!(f, "Last modified: {}", modified.format("%Y-%m-%d %H:%M:%S"))?;
        }
        Ok(())
    }
}

fn short(hash: &str) -> &str {
    hash.get(..8).unwrap_or(hash)
}
