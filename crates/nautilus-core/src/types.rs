//! Common types used throughout Nautilus

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Best-known runtime type of a bound value
///
/// Inferred from the JSON shape of a value; `null` infers [`ValueKind::Any`],
/// which every language treats as its generic object type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    /// Untyped / generic object
    #[default]
    Any,
    /// Boolean
    Bool,
    /// 64-bit integer
    Int,
    /// 64-bit float
    Float,
    /// UTF-8 string
    String,
    /// Ordered list
    Array,
    /// String-keyed map
    Map,
}

impl ValueKind {
    /// Infer the kind of a JSON value
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => Self::Any,
            Value::Bool(_) => Self::Bool,
            Value::Number(n) if n.is_i64() || n.is_u64() => Self::Int,
            Value::Number(_) => Self::Float,
            Value::String(_) => Self::String,
            Value::Array(_) => Self::Array,
            Value::Object(_) => Self::Map,
        }
    }

    /// Whether a value may be stored under this declared kind
    ///
    /// `null` is accepted by every kind and integers widen to floats.
    pub fn accepts(&self, value: &Value) -> bool {
        if *self == Self::Any || value.is_null() {
            return true;
        }
        let actual = Self::of(value);
        actual == *self || (*self == Self::Float && actual == Self::Int)
    }

    /// Lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::String => "string",
            Self::Array => "array",
            Self::Map => "map",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named, typed value handed to a compiled handler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Binding {
    /// Name scripts use to reference the value
    pub name: String,
    /// Current value
    pub value: Value,
    /// Declared kind
    pub kind: ValueKind,
}

impl Binding {
    /// Create a binding whose kind is inferred from the value
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        let kind = ValueKind::of(&value);
        Self {
            name: name.into(),
            value,
            kind,
        }
    }

    /// Create a binding with an explicit kind
    pub fn typed(name: impl Into<String>, value: Value, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            value,
            kind,
        }
    }
}

/// Ordered table of bindings with unique names
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BindingTable {
    entries: Vec<Binding>,
}

impl BindingTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from name/value pairs, inferring kinds
    pub fn from_values<I, K>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        values
            .into_iter()
            .map(|(name, value)| Binding::new(name, value))
            .collect()
    }

    /// Insert a binding, replacing any existing binding with the same name
    pub fn insert(&mut self, binding: Binding) {
        match self.entries.iter_mut().find(|b| b.name == binding.name) {
            Some(existing) => *existing = binding,
            None => self.entries.push(binding),
        }
    }

    /// Look up a binding by name
    pub fn get(&self, name: &str) -> Option<&Binding> {
        self.entries.iter().find(|b| b.name == name)
    }

    /// Iterate bindings in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &Binding> {
        self.entries.iter()
    }

    /// Number of bindings
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Layer `other` on top of this table; `other` wins on name collisions
    pub fn merged(&self, other: &BindingTable) -> BindingTable {
        let mut merged = self.clone();
        for binding in other.iter() {
            merged.insert(binding.clone());
        }
        merged
    }

    /// Names and kinds, in order
    pub fn signature(&self) -> Vec<(String, ValueKind)> {
        self.entries
            .iter()
            .map(|b| (b.name.clone(), b.kind))
            .collect()
    }
}

impl FromIterator<Binding> for BindingTable {
    fn from_iter<T: IntoIterator<Item = Binding>>(iter: T) -> Self {
        let mut table = BindingTable::new();
        for binding in iter {
            table.insert(binding);
        }
        table
    }
}

impl<'a> IntoIterator for &'a BindingTable {
    type Item = &'a Binding;
    type IntoIter = std::slice::Iter<'a, Binding>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// What to do when a registration collides with an existing one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// Return an error to the caller
    #[default]
    Error,
    /// Leave the existing registration in place and return nothing
    Reject,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_value_kind_inference() {
        assert_eq!(ValueKind::of(&json!(null)), ValueKind::Any);
        assert_eq!(ValueKind::of(&json!(true)), ValueKind::Bool);
        assert_eq!(ValueKind::of(&json!(42)), ValueKind::Int);
        assert_eq!(ValueKind::of(&json!(1.5)), ValueKind::Float);
        assert_eq!(ValueKind::of(&json!("x")), ValueKind::String);
        assert_eq!(ValueKind::of(&json!([1])), ValueKind::Array);
        assert_eq!(ValueKind::of(&json!({"a": 1})), ValueKind::Map);
    }

    #[test]
    fn test_value_kind_accepts() {
        assert!(ValueKind::Float.accepts(&json!(3)));
        assert!(!ValueKind::Int.accepts(&json!(3.5)));
        assert!(ValueKind::String.accepts(&json!(null)));
        assert!(ValueKind::Any.accepts(&json!({"k": "v"})));
        assert!(!ValueKind::Bool.accepts(&json!("true")));
    }

    #[test]
    fn test_binding_table_merge_prefers_later_layer() {
        let globals = BindingTable::from_values([("region", json!("eu")), ("limit", json!(10))]);
        let locals = BindingTable::from_values([("limit", json!("unbounded"))]);

        let merged = globals.merged(&locals);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged.get("region").unwrap().value, json!("eu"));
        let limit = merged.get("limit").unwrap();
        assert_eq!(limit.value, json!("unbounded"));
        assert_eq!(limit.kind, ValueKind::String);
    }

    #[test]
    fn test_duplicate_policy_default() {
        assert_eq!(DuplicatePolicy::default(), DuplicatePolicy::Error);
        let parsed: DuplicatePolicy = serde_json::from_str("\"reject\"").unwrap();
        assert_eq!(parsed, DuplicatePolicy::Reject);
    }
}
