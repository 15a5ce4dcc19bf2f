use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

use strand_core::error::{Result, StrandError};
use strand_core::types::{NodeInput, OutputMap};

/// Key of one committed output: `(producer node id, output key)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ContextKey {
    pub producer: String,
    pub key: String,
}

impl ContextKey {
    pub fn new(producer: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            producer: producer.into(),
            key: key.into(),
        }
    }
}

impl std::fmt::Display for ContextKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.producer, self.key)
    }
}

/// A single write-once output value.
#[derive(Debug, Clone, Serialize)]
pub struct ContextEntry {
    pub key: ContextKey,
    pub value: serde_json::Value,
    pub written_at: DateTime<Utc>,
}

impl ContextEntry {
    pub fn producer(&self) -> &str {
        &self.key.producer
    }
}

/// Append-only store of validated node outputs, shared by every worker of
/// a run.
///
/// A batch is checked and inserted under one write lock, so readers see
/// either none or all of a producer's commit.
#[derive(Debug, Default)]
pub struct ContextStore {
    entries: RwLock<BTreeMap<ContextKey, Arc<ContextEntry>>>,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commit every output of `producer`. Returns the number of entries
    /// written.
    ///
    /// If any key already exists the whole batch is rejected with
    /// `StrandError::Validation` and nothing is written.
    pub fn commit(&self, producer: &str, outputs: OutputMap) -> Result<usize> {
        let mut entries = self.entries.write();
        if let Some(existing) = outputs
            .keys()
            .map(|k| ContextKey::new(producer, k.as_str()))
            .find(|k| entries.contains_key(k))
        {
            return Err(StrandError::Validation(format!(
                "context key '{}' already written",
                existing
            )));
        }

        let written_at = Utc::now();
        let count = outputs.len();
        for (key, value) in outputs {
            let key = ContextKey::new(producer, key);
            let entry = Arc::new(ContextEntry {
                key: key.clone(),
                value,
                written_at,
            });
            entries.insert(key, entry);
        }
        debug!(producer, entries = count, "Context committed");
        Ok(count)
    }

    pub fn get(&self, producer: &str, key: &str) -> Option<Arc<ContextEntry>> {
        self.entries.read().get(&ContextKey::new(producer, key)).cloned()
    }

    /// Get a value by producer and key.
    pub fn value(&self, producer: &str, key: &str) -> Option<serde_json::Value> {
        self.get(producer, key).map(|e| e.value.clone())
    }

    pub fn contains(&self, producer: &str, key: &str) -> bool {
        self.entries.read().contains_key(&ContextKey::new(producer, key))
    }

    /// All entries written by one producer.
    pub fn entries_for(&self, producer: &str) -> Vec<Arc<ContextEntry>> {
        self.entries
            .read()
            .values()
            .filter(|e| e.key.producer == producer)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// The union of everything the given prerequisites committed.
    pub fn input_for<'a, I>(&self, prerequisites: I) -> NodeInput
    where
        I: IntoIterator<Item = &'a str>,
    {
        let entries = self.entries.read();
        let mut input = NodeInput::new();
        for producer in prerequisites {
            for entry in entries.values().filter(|e| e.key.producer == producer) {
                input.insert(producer, entry.key.key.as_str(), entry.value.clone());
            }
        }
        input
    }

    /// Point-in-time copy of every entry.
    pub fn snapshot(&self) -> Vec<Arc<ContextEntry>> {
        self.entries.read().values().cloned().collect()
    }

    /// Committed values grouped by producer.
    pub fn outputs(&self) -> BTreeMap<String, OutputMap> {
        let mut grouped: BTreeMap<String, OutputMap> = BTreeMap::new();
        for entry in self.entries.read().values() {
            grouped
                .entry(entry.key.producer.clone())
                .or_default()
                .insert(entry.key.key.clone(), entry.value.clone());
        }
        grouped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outputs(pairs: &[(&str, serde_json::Value)]) -> OutputMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_commit_and_read() {
        let store = ContextStore::new();
        let n = store
            .commit("fetch", outputs(&[("body", json!("hi")), ("status", json!(200))]))
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(store.len(), 2);
        assert_eq!(store.value("fetch", "body"), Some(json!("hi")));
        assert!(store.contains("fetch", "status"));
        assert!(!store.contains("fetch", "missing"));
        assert_eq!(store.get("fetch", "body").unwrap().producer(), "fetch");
        assert_eq!(store.entries_for("fetch").len(), 2);
    }

    #[test]
    fn test_duplicate_key_rejects_whole_batch() {
        let store = ContextStore::new();
        store.commit("a", outputs(&[("x", json!(1))])).unwrap();

        let err = store
            .commit("a", outputs(&[("new", json!(2)), ("x", json!(3))]))
            .unwrap_err();
        assert!(matches!(err, StrandError::Validation(_)));
        assert!(err.to_string().contains("a.x"));

        // Nothing from the rejected batch is visible
        assert!(!store.contains("a", "new"));
        assert_eq!(store.value("a", "x"), Some(json!(1)));
    }

    #[test]
    fn test_same_key_different_producers() {
        let store = ContextStore::new();
        store.commit("a", outputs(&[("out", json!(1))])).unwrap();
        store.commit("b", outputs(&[("out", json!(2))])).unwrap();
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_input_for_unions_prerequisites() {
        let store = ContextStore::new();
        store.commit("a", outputs(&[("x", json!(1))])).unwrap();
        store.commit("b", outputs(&[("y", json!(2))])).unwrap();
        store.commit("c", outputs(&[("z", json!(3))])).unwrap();

        let input = store.input_for(["a", "b"]);
        assert_eq!(input.len(), 2);
        assert_eq!(input.get("a", "x"), Some(&json!(1)));
        assert_eq!(input.get("b", "y"), Some(&json!(2)));
        assert_eq!(input.get("c", "z"), None);

        let grouped = store.outputs();
        assert_eq!(grouped.len(), 3);
        assert_eq!(grouped["c"]["z"], json!(3));
    }

    #[test]
    fn test_empty_commit_is_allowed() {
        let store = ContextStore::new();
        assert_eq!(store.commit("a", OutputMap::new()).unwrap(), 0);
        assert!(store.is_empty());
    }

    #[test]
    fn test_concurrent_commits() {
        let store = Arc::new(ContextStore::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store
                        .commit(&format!("n{}", i), outputs(&[("v", json!(i))]))
                        .unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.snapshot().len(), 8);
    }
}
