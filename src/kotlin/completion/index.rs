//! Import lookup tables
//!
//! Maps simple class names to the fully-qualified names that declare them,
//! and packages to their classes. The index is filled from workspace symbols
//! (or the persisted index cache) during workspace setup and shared with
//! completion and the local import analysis.

use std::collections::{BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock};

use serde_json::Value;
use tracing::debug;

use crate::kotlin::completion::imports::package_of;
use crate::kotlin::completion::{ClassCandidateSource, ClassInfo};

/// LSP `SymbolKind`s that name importable types
const CLASS_LIKE_SYMBOL_KINDS: &[i64] = &[
    5,  // Class
    10, // Enum
    11, // Interface
    19, // Object
    23, // Struct
];

#[derive(Debug, Default)]
struct Tables {
    by_simple_name: HashMap<String, BTreeSet<String>>,
    by_package: HashMap<String, BTreeSet<String>>,
}

#[derive(Debug, Default)]
pub struct ImportIndex {
    tables: RwLock<Tables>,
}

impl ImportIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add fully-qualified class names
    pub fn update<I, S>(&self, fqns: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        for fqn in fqns {
            let fqn = fqn.as_ref().trim();
            let Some((package, simple)) = fqn.rsplit_once('.') else {
                continue;
            };
            if package.is_empty() || simple.is_empty() {
                continue;
            }
            tables
                .by_simple_name
                .entry(simple.to_string())
                .or_default()
                .insert(fqn.to_string());
            tables
                .by_package
                .entry(package.to_string())
                .or_default()
                .insert(simple.to_string());
        }
    }

    /// Add the class-like entries of a `workspace/symbol` result
    ///
    /// Returns the number of symbols that were usable.
    pub fn update_from_symbols(&self, symbols: &[Value]) -> usize {
        let fqns: Vec<String> = symbols.iter().filter_map(symbol_fqn).collect();
        let count = fqns.len();
        self.update(fqns);
        debug!("ImportIndex: {} class symbols indexed", count);
        count
    }

    pub fn clear(&self) {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        tables.by_simple_name.clear();
        tables.by_package.clear();
    }

    /// Fully-qualified names declaring `simple_name`, sorted
    pub fn lookup(&self, simple_name: &str) -> Vec<String> {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_simple_name
            .get(simple_name)
            .map(|fqns| fqns.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Simple names of the classes in `package`, sorted
    pub fn classes_in_package(&self, package: &str) -> Vec<String> {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_package
            .get(package)
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of distinct simple names
    pub fn len(&self) -> usize {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_simple_name
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ClassCandidateSource for ImportIndex {
    /// Case-sensitive prefix match on the simple name, ordered by simple name
    /// then package
    fn classes_with_prefix(&self, prefix: &str, limit: usize) -> Vec<ClassInfo> {
        if prefix.is_empty() {
            return Vec::new();
        }

        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        let mut simple_names: Vec<&String> = tables
            .by_simple_name
            .keys()
            .filter(|name| name.starts_with(prefix))
            .collect();
        simple_names.sort();

        simple_names
            .into_iter()
            .flat_map(|name| tables.by_simple_name[name].iter())
            .take(limit)
            .map(|fqn| ClassInfo::from_fqn(fqn))
            .collect()
    }
}

fn symbol_fqn(symbol: &Value) -> Option<String> {
    let kind = symbol.get("kind").and_then(Value::as_i64)?;
    if !CLASS_LIKE_SYMBOL_KINDS.contains(&kind) {
        return None;
    }

    let name = symbol.get("name").and_then(Value::as_str)?;
    let container = symbol
        .get("containerName")
        .and_then(Value::as_str)
        .unwrap_or_default();

    if !container.is_empty() {
        return Some(format!("{container}.{name}"));
    }
    // Some servers report the qualified name with no container
    (!package_of(name).is_empty()).then(|| name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_update_and_lookup() {
        let index = ImportIndex::new();
        index.update([
            "android.widget.Toast",
            "com.example.ui.Toast",
            "android.widget.TextView",
            "NoPackage",
        ]);

        assert_eq!(
            index.lookup("Toast"),
            vec!["android.widget.Toast", "com.example.ui.Toast"]
        );
        assert_eq!(
            index.classes_in_package("android.widget"),
            vec!["TextView", "Toast"]
        );
        assert!(index.lookup("NoPackage").is_empty());
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_update_from_symbols_keeps_class_like_kinds() {
        let index = ImportIndex::new();
        let count = index.update_from_symbols(&[
            json!({"name": "MainActivity", "kind": 5, "containerName": "com.example.app"}),
            json!({"name": "Direction", "kind": 10, "containerName": "com.example.nav"}),
            json!({"name": "onCreate", "kind": 6, "containerName": "com.example.app.MainActivity"}),
            json!({"name": "org.lib.Thing", "kind": 5}),
            json!({"name": "Loose", "kind": 5}),
        ]);

        assert_eq!(count, 3);
        assert_eq!(index.lookup("MainActivity"), vec!["com.example.app.MainActivity"]);
        assert_eq!(index.lookup("Thing"), vec!["org.lib.Thing"]);
        assert!(index.lookup("onCreate").is_empty());
    }

    #[test]
    fn test_classes_with_prefix_is_case_sensitive_and_limited() {
        let index = ImportIndex::new();
        index.update([
            "android.widget.TextView",
            "android.widget.TableLayout",
            "android.widget.Toast",
            "com.example.textutil.textHelper",
        ]);

        let found = index.classes_with_prefix("T", 2);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].simple_name, "TableLayout");
        assert_eq!(found[1].simple_name, "TextView");
        assert_eq!(found[1].package, "android.widget");

        assert!(index.classes_with_prefix("", 10).is_empty());
        assert_eq!(index.classes_with_prefix("text", 10).len(), 1);
    }

    #[test]
    fn test_clear_empties_index() {
        let index = ImportIndex::new();
        index.update(["a.b.C"]);
        index.clear();
        assert!(index.is_empty());
        assert!(index.classes_in_package("a.b").is_empty());
    }
}
