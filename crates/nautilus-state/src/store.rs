//! Global store and snapshots

use crate::{Result, StateError};
use nautilus_core::{Binding, BindingTable, ValueKind};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, trace, warn};

type EntryMap = BTreeMap<String, GlobalEntry>;

/// Entry in the global store
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GlobalEntry {
    /// Current value
    pub value: Value,
    /// Declared kind
    pub kind: ValueKind,
    /// Rejects every later write when set
    pub read_only: bool,
}

/// Immutable copy of the store taken at a fixed point in time
#[derive(Debug, Clone, Default)]
pub struct GlobalSnapshot {
    entries: Arc<EntryMap>,
}

impl GlobalSnapshot {
    /// Value of an entry
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries.get(name).map(|e| &e.value)
    }

    /// Full entry
    pub fn entry(&self, name: &str) -> Option<&GlobalEntry> {
        self.entries.get(name)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the snapshot is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate entries ordered by name
    pub fn iter(&self) -> impl Iterator<Item = (&String, &GlobalEntry)> {
        self.entries.iter()
    }

    /// Entries as typed bindings, ordered by name
    pub fn to_bindings(&self) -> BindingTable {
        self.entries
            .iter()
            .map(|(name, entry)| Binding::typed(name.clone(), entry.value.clone(), entry.kind))
            .collect()
    }
}

/// Process-wide, thread-safe key/value registry
///
/// Reads run concurrently; writes are serialized under one lock. The map is
/// copy-on-write, so taking a snapshot is a reference-count bump and a write
/// only clones the map while an older snapshot is still alive.
#[derive(Debug, Clone, Default)]
pub struct GlobalStore {
    entries: Arc<RwLock<Arc<EntryMap>>>,
}

impl GlobalStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace an entry, inferring its kind from the value
    pub fn define(&self, name: &str, value: Value, read_only: bool) -> Result<()> {
        let kind = ValueKind::of(&value);
        self.define_typed(name, value, kind, read_only)
    }

    /// Create or replace an entry with an explicit kind
    pub fn define_typed(
        &self,
        name: &str,
        value: Value,
        kind: ValueKind,
        read_only: bool,
    ) -> Result<()> {
        validate_name(name)?;
        if !kind.accepts(&value) {
            return Err(StateError::TypeMismatch {
                key: name.to_string(),
                expected: kind,
                found: ValueKind::of(&value),
            });
        }

        let mut guard = self.entries.write();
        if let Some(existing) = guard.get(name) {
            if existing.read_only {
                warn!(global = %name, "Rejected redefinition of read-only global");
                return Err(StateError::ReadOnly(name.to_string()));
            }
        }

        Arc::make_mut(&mut guard).insert(
            name.to_string(),
            GlobalEntry {
                value,
                kind,
                read_only,
            },
        );
        debug!(global = %name, %kind, read_only, "Global defined");
        Ok(())
    }

    /// Replace the value of an existing entry, keeping its declared kind
    pub fn update_value(&self, name: &str, value: Value) -> Result<()> {
        let mut guard = self.entries.write();
        let existing = guard
            .get(name)
            .ok_or_else(|| StateError::NotFound(name.to_string()))?;

        if existing.read_only {
            warn!(global = %name, "Rejected update of read-only global");
            return Err(StateError::ReadOnly(name.to_string()));
        }
        if !existing.kind.accepts(&value) {
            return Err(StateError::TypeMismatch {
                key: name.to_string(),
                expected: existing.kind,
                found: ValueKind::of(&value),
            });
        }

        if let Some(entry) = Arc::make_mut(&mut guard).get_mut(name) {
            entry.value = value;
        }
        debug!(global = %name, "Global updated");
        Ok(())
    }

    /// Remove an entry; returns whether one existed
    pub fn remove(&self, name: &str) -> Result<bool> {
        let mut guard = self.entries.write();
        match guard.get(name) {
            None => Ok(false),
            Some(entry) if entry.read_only => Err(StateError::ReadOnly(name.to_string())),
            Some(_) => {
                Arc::make_mut(&mut guard).remove(name);
                debug!(global = %name, "Global removed");
                Ok(true)
            }
        }
    }

    /// Current value of an entry
    pub fn get(&self, name: &str) -> Option<Value> {
        trace!(global = %name, "Global read");
        self.entries.read().get(name).map(|e| e.value.clone())
    }

    /// Current entry
    pub fn entry(&self, name: &str) -> Option<GlobalEntry> {
        self.entries.read().get(name).cloned()
    }

    /// Immutable copy of every entry
    pub fn snapshot(&self) -> GlobalSnapshot {
        GlobalSnapshot {
            entries: Arc::clone(&self.entries.read()),
        }
    }

    /// Entry names ordered
    pub fn names(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// Names must be usable as an identifier in every hosted language
fn validate_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(StateError::InvalidKey(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_define_and_get() {
        let store = GlobalStore::new();
        store.define("greeting", json!("hello"), false).unwrap();

        assert_eq!(store.get("greeting"), Some(json!("hello")));
        assert_eq!(store.entry("greeting").unwrap().kind, ValueKind::String);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let store = GlobalStore::new();
        store.define("tenant", json!("acme"), true).unwrap();

        assert_eq!(
            store.define("tenant", json!("other"), false),
            Err(StateError::ReadOnly("tenant".to_string()))
        );
        assert_eq!(
            store.update_value("tenant", json!("other")),
            Err(StateError::ReadOnly("tenant".to_string()))
        );
        assert!(store.remove("tenant").is_err());
        assert_eq!(store.get("tenant"), Some(json!("acme")));
    }

    #[test]
    fn test_update_keeps_declared_kind() {
        let store = GlobalStore::new();
        store
            .define_typed("ratio", json!(1), ValueKind::Float, false)
            .unwrap();

        store.update_value("ratio", json!(2.5)).unwrap();
        assert_eq!(store.get("ratio"), Some(json!(2.5)));

        let err = store.update_value("ratio", json!("high")).unwrap_err();
        assert!(matches!(err, StateError::TypeMismatch { .. }));
        assert_eq!(store.get("ratio"), Some(json!(2.5)));
    }

    #[test]
    fn test_update_missing() {
        let store = GlobalStore::new();
        assert_eq!(
            store.update_value("missing", json!(1)),
            Err(StateError::NotFound("missing".to_string()))
        );
    }

    #[test]
    fn test_invalid_names() {
        let store = GlobalStore::new();
        assert!(store.define("", json!(1), false).is_err());
        assert!(store.define("1abc", json!(1), false).is_err());
        assert!(store.define("with-dash", json!(1), false).is_err());
        assert!(store.define("_ok9", json!(1), false).is_ok());
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_writes() {
        let store = GlobalStore::new();
        store.define("counter", json!(1), false).unwrap();

        let snapshot = store.snapshot();
        store.update_value("counter", json!(2)).unwrap();
        store.define("added", json!(true), false).unwrap();

        assert_eq!(snapshot.get("counter"), Some(&json!(1)));
        assert!(snapshot.get("added").is_none());
        assert_eq!(store.snapshot().get("counter"), Some(&json!(2)));
    }

    #[test]
    fn test_snapshot_bindings() {
        let store = GlobalStore::new();
        store.define("b", json!([1, 2]), false).unwrap();
        store.define("a", json!({"x": 1}), true).unwrap();

        let bindings = store.snapshot().to_bindings();
        let signature = bindings.signature();
        assert_eq!(
            signature,
            vec![
                ("a".to_string(), ValueKind::Map),
                ("b".to_string(), ValueKind::Array)
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_are_serialized() {
        let store = GlobalStore::new();
        store.define("hits", json!(0), false).unwrap();

        let mut tasks = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store.define(&format!("key_{i}"), json!(i), false).unwrap();
                let _ = store.snapshot();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(store.len(), 17);
    }
}
