//! Shell values and their conversion rules

use crate::shell::ast::Block;
use serde_json::{Map, Number, Value};
use std::cmp::Ordering;
use std::sync::Arc;

/// Runtime value of the shell language
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) enum ShellValue {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    Str(String),
    Array(Vec<ShellValue>),
    Table(Table),
    Block(Arc<Block>),
}

/// Hashtable with case-insensitive keys, kept in insertion order
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Table {
    entries: Vec<(String, ShellValue)>,
}

impl Table {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn get(&self, key: &str) -> Option<&ShellValue> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    }

    pub(crate) fn get_mut(&mut self, key: &str) -> Option<&mut ShellValue> {
        self.entries
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    }

    /// Insert or replace; the first spelling of a key is kept
    pub(crate) fn insert(&mut self, key: impl Into<String>, value: ShellValue) {
        let key = key.into();
        match self.get_mut(&key) {
            Some(existing) => *existing = value,
            None => self.entries.push((key, value)),
        }
    }

    pub(crate) fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&String, &ShellValue)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }
}

impl FromIterator<(String, ShellValue)> for Table {
    fn from_iter<I: IntoIterator<Item = (String, ShellValue)>>(iter: I) -> Self {
        let mut table = Table::new();
        for (key, value) in iter {
            table.insert(key, value);
        }
        table
    }
}

#[derive(Debug, Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }
}

impl ShellValue {
    pub(crate) fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Double(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => Self::Str(s.clone()),
            Value::Array(items) => Self::Array(items.iter().map(Self::from_json).collect()),
            Value::Object(map) => Self::Table(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    pub(crate) fn to_json(&self) -> Value {
        match self {
            Self::Null | Self::Block(_) => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(i) => Value::from(*i),
            Self::Double(d) => Number::from_f64(*d).map(Value::Number).unwrap_or(Value::Null),
            Self::Str(s) => Value::String(s.clone()),
            Self::Array(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            Self::Table(table) => {
                let mut map = Map::new();
                for (key, value) in table.iter() {
                    map.insert(key.clone(), value.to_json());
                }
                Value::Object(map)
            }
        }
    }

    /// Text form used by string expansion and `Write-*` commands
    pub(crate) fn to_text(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::Bool(true) => "True".to_string(),
            Self::Bool(false) => "False".to_string(),
            Self::Int(i) => i.to_string(),
            Self::Double(d) => format_double(*d),
            Self::Str(s) => s.clone(),
            Self::Array(items) => items
                .iter()
                .map(Self::to_text)
                .collect::<Vec<_>>()
                .join(" "),
            Self::Table(_) => self.to_json().to_string(),
            Self::Block(_) => "ScriptBlock".to_string(),
        }
    }

    pub(crate) fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Double(_) => "double",
            Self::Str(_) => "string",
            Self::Array(_) => "array",
            Self::Table(_) => "hashtable",
            Self::Block(_) => "scriptblock",
        }
    }

    pub(crate) fn is_truthy(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Double(d) => *d != 0.0,
            Self::Str(s) => !s.is_empty(),
            Self::Array(items) => match items.as_slice() {
                [] => false,
                [single] => single.is_truthy(),
                _ => true,
            },
            Self::Table(_) | Self::Block(_) => true,
        }
    }

    pub(crate) fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Items this value contributes to a pipeline
    pub(crate) fn into_items(self) -> Vec<ShellValue> {
        match self {
            Self::Null => Vec::new(),
            Self::Array(items) => items,
            other => vec![other],
        }
    }

    /// Collapse pipeline output: nothing is `$null`, one item is itself
    pub(crate) fn collapse(mut items: Vec<ShellValue>) -> Self {
        match items.len() {
            0 => Self::Null,
            1 => items.pop().unwrap_or_default(),
            _ => Self::Array(items),
        }
    }

    fn number(&self) -> Option<Num> {
        match self {
            Self::Null => Some(Num::Int(0)),
            Self::Bool(b) => Some(Num::Int(i64::from(*b))),
            Self::Int(i) => Some(Num::Int(*i)),
            Self::Double(d) => Some(Num::Float(*d)),
            Self::Str(s) => {
                let s = s.trim();
                if s.is_empty() {
                    Some(Num::Int(0))
                } else if let Ok(i) = s.parse::<i64>() {
                    Some(Num::Int(i))
                } else {
                    s.parse::<f64>().ok().map(Num::Float)
                }
            }
            _ => None,
        }
    }

    pub(crate) fn to_int(&self) -> Option<i64> {
        match self.number()? {
            Num::Int(i) => Some(i),
            Num::Float(f) if f.is_finite() => Some(f.round() as i64),
            Num::Float(_) => None,
        }
    }

    pub(crate) fn to_double(&self) -> Option<f64> {
        self.number().map(Num::as_f64)
    }

    /// Property read; arrays enumerate the member over their items
    pub(crate) fn member(&self, name: &str) -> ShellValue {
        match self {
            Self::Table(table) => match table.get(name) {
                Some(value) => value.clone(),
                None if name.eq_ignore_ascii_case("count") => Self::Int(table.len() as i64),
                None if name.eq_ignore_ascii_case("keys") => {
                    Self::Array(table.iter().map(|(k, _)| Self::Str(k.clone())).collect())
                }
                None if name.eq_ignore_ascii_case("values") => {
                    Self::Array(table.iter().map(|(_, v)| v.clone()).collect())
                }
                None => Self::Null,
            },
            Self::Array(items) => {
                if name.eq_ignore_ascii_case("count") || name.eq_ignore_ascii_case("length") {
                    Self::Int(items.len() as i64)
                } else {
                    Self::collapse(
                        items
                            .iter()
                            .map(|item| item.member(name))
                            .filter(|v| !v.is_null())
                            .collect(),
                    )
                }
            }
            Self::Str(s) if name.eq_ignore_ascii_case("length") => Self::Int(s.chars().count() as i64),
            Self::Null => Self::Null,
            _ if name.eq_ignore_ascii_case("count") => Self::Int(1),
            _ => Self::Null,
        }
    }

    /// Indexer; negative indices count from the end, misses are `$null`
    pub(crate) fn index(&self, index: &ShellValue) -> ShellValue {
        let position = |len: usize| -> Option<usize> {
            let i = index.to_int()?;
            let i = if i < 0 { len as i64 + i } else { i };
            usize::try_from(i).ok().filter(|i| *i < len)
        };
        match self {
            Self::Array(items) => position(items.len())
                .map(|i| items[i].clone())
                .unwrap_or_default(),
            Self::Table(table) => table.get(&index.to_text()).cloned().unwrap_or_default(),
            Self::Str(s) => {
                let chars: Vec<char> = s.chars().collect();
                position(chars.len())
                    .map(|i| Self::Str(chars[i].to_string()))
                    .unwrap_or_default()
            }
            _ => Self::Null,
        }
    }
}

pub(crate) fn format_double(d: f64) -> String {
    if d.is_finite() && d.fract() == 0.0 && d.abs() < 1e15 {
        format!("{}", d as i64)
    } else {
        d.to_string()
    }
}

fn arithmetic(
    left: &ShellValue,
    right: &ShellValue,
    op: &str,
    int: fn(i64, i64) -> Option<i64>,
    float: fn(f64, f64) -> f64,
) -> Result<ShellValue, String> {
    let (Some(l), Some(r)) = (left.number(), right.number()) else {
        return Err(format!(
            "Operator '{op}' is not defined for {} and {}",
            left.type_name(),
            right.type_name()
        ));
    };
    match (l, r) {
        (Num::Int(a), Num::Int(b)) => match int(a, b) {
            Some(v) => Ok(ShellValue::Int(v)),
            None => Ok(ShellValue::Double(float(a as f64, b as f64))),
        },
        (a, b) => Ok(ShellValue::Double(float(a.as_f64(), b.as_f64()))),
    }
}

pub(crate) fn add(left: &ShellValue, right: &ShellValue) -> Result<ShellValue, String> {
    match left {
        ShellValue::Str(s) => Ok(ShellValue::Str(format!("{s}{}", right.to_text()))),
        ShellValue::Array(items) => {
            let mut items = items.clone();
            items.extend(right.clone().into_items());
            Ok(ShellValue::Array(items))
        }
        ShellValue::Table(table) => match right {
            ShellValue::Table(other) => {
                let mut merged = table.clone();
                for (key, value) in other.iter() {
                    if merged.contains_key(key) {
                        return Err(format!("Item has already been added. Key: '{key}'"));
                    }
                    merged.insert(key.clone(), value.clone());
                }
                Ok(ShellValue::Table(merged))
            }
            _ => Err("A hashtable can only be added to another hashtable".to_string()),
        },
        ShellValue::Null => Ok(right.clone()),
        _ => arithmetic(left, right, "+", i64::checked_add, |a, b| a + b),
    }
}

pub(crate) fn subtract(left: &ShellValue, right: &ShellValue) -> Result<ShellValue, String> {
    arithmetic(left, right, "-", i64::checked_sub, |a, b| a - b)
}

pub(crate) fn multiply(left: &ShellValue, right: &ShellValue) -> Result<ShellValue, String> {
    match left {
        ShellValue::Str(s) => {
            let count = right
                .to_int()
                .and_then(|n| usize::try_from(n).ok())
                .ok_or_else(|| format!("Cannot repeat a string {} times", right.to_text()))?;
            Ok(ShellValue::Str(s.repeat(count)))
        }
        _ => arithmetic(left, right, "*", i64::checked_mul, |a, b| a * b),
    }
}

pub(crate) fn divide(left: &ShellValue, right: &ShellValue) -> Result<ShellValue, String> {
    if right.to_double() == Some(0.0) {
        return Err("Attempted to divide by zero.".to_string());
    }
    arithmetic(
        left,
        right,
        "/",
        |a, b| a.checked_rem(b).filter(|r| *r == 0).and_then(|_| a.checked_div(b)),
        |a, b| a / b,
    )
}

pub(crate) fn remainder(left: &ShellValue, right: &ShellValue) -> Result<ShellValue, String> {
    if right.to_double() == Some(0.0) {
        return Err("Attempted to divide by zero.".to_string());
    }
    arithmetic(left, right, "%", i64::checked_rem, |a, b| a % b)
}

/// `-eq` for scalars; the left operand decides the conversion
pub(crate) fn equals(left: &ShellValue, right: &ShellValue) -> bool {
    match (left, right) {
        (ShellValue::Null, ShellValue::Null) => true,
        (ShellValue::Null, _) | (_, ShellValue::Null) => false,
        (ShellValue::Str(l), r) => l.eq_ignore_ascii_case(&r.to_text()),
        (ShellValue::Bool(l), r) => *l == r.is_truthy(),
        (ShellValue::Int(_) | ShellValue::Double(_), r) => match (left.number(), r.number()) {
            (Some(Num::Int(a)), Some(Num::Int(b))) => a == b,
            (Some(a), Some(b)) => a.as_f64() == b.as_f64(),
            _ => false,
        },
        (l, r) => l == r,
    }
}

/// Ordering for `-lt`/`-gt` and `Sort-Object`
pub(crate) fn compare(left: &ShellValue, right: &ShellValue) -> Option<Ordering> {
    match (left, right) {
        (ShellValue::Null, ShellValue::Null) => Some(Ordering::Equal),
        (ShellValue::Null, _) => Some(Ordering::Less),
        (_, ShellValue::Null) => Some(Ordering::Greater),
        (ShellValue::Str(l), r) => Some(l.to_lowercase().cmp(&r.to_text().to_lowercase())),
        (ShellValue::Int(_) | ShellValue::Double(_) | ShellValue::Bool(_), r) => {
            match (left.number()?, r.number()?) {
                (Num::Int(a), Num::Int(b)) => Some(a.cmp(&b)),
                (a, b) => a.as_f64().partial_cmp(&b.as_f64()),
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_round_trip_keeps_numbers() {
        let value = ShellValue::from_json(&json!({"a": 1, "b": [1.5, "x", null], "c": true}));
        assert_eq!(value.member("A"), ShellValue::Int(1));
        assert_eq!(value.to_json(), json!({"a": 1, "b": [1.5, "x", null], "c": true}));
    }

    #[test]
    fn test_arithmetic_follows_left_operand() {
        let one = ShellValue::Int(1);
        let text = ShellValue::Str("2".to_string());
        assert_eq!(add(&one, &text).unwrap(), ShellValue::Int(3));
        assert_eq!(add(&text, &one).unwrap(), ShellValue::Str("21".to_string()));
        assert_eq!(
            divide(&ShellValue::Int(7), &ShellValue::Int(2)).unwrap(),
            ShellValue::Double(3.5)
        );
        assert_eq!(
            divide(&ShellValue::Int(8), &ShellValue::Int(2)).unwrap(),
            ShellValue::Int(4)
        );
        assert!(divide(&one, &ShellValue::Int(0)).is_err());
    }

    #[test]
    fn test_comparisons_are_case_insensitive() {
        let upper = ShellValue::Str("ADMIN".to_string());
        assert!(equals(&upper, &ShellValue::Str("admin".to_string())));
        assert!(equals(&ShellValue::Int(5), &ShellValue::Str("5".to_string())));
        assert!(!equals(&ShellValue::Null, &ShellValue::Str(String::new())));
        assert_eq!(
            compare(&ShellValue::Int(2), &ShellValue::Double(10.0)),
            Some(Ordering::Less)
        );
    }

    #[test]
    fn test_truthiness() {
        assert!(!ShellValue::Array(vec![ShellValue::Int(0)]).is_truthy());
        assert!(ShellValue::Array(vec![ShellValue::Null, ShellValue::Null]).is_truthy());
        assert!(!ShellValue::Str(String::new()).is_truthy());
        assert!(ShellValue::Table(Table::new()).is_truthy());
    }
}
