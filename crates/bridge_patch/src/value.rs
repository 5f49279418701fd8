//! Immutable, structurally shared view-state values.
//!
//! A snapshot is a root [`ViewValue`]. Lists and objects sit behind `Arc`, so
//! cloning a snapshot is cheap and a patched copy shares every subtree the
//! patch did not touch.

use serde::de::{self, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeMap, SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::path::PathSegment;

/// Largest integer an f64 represents exactly.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

#[derive(Debug, Clone, Default, PartialEq)]
pub enum ViewValue {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    Text(Arc<str>),
    List(Arc<Vec<ViewValue>>),
    Object(Arc<BTreeMap<Arc<str>, ViewValue>>),
}

impl ViewValue {
    pub fn list(items: impl IntoIterator<Item = ViewValue>) -> Self {
        Self::List(Arc::new(items.into_iter().collect()))
    }

    pub fn object<K: AsRef<str>>(fields: impl IntoIterator<Item = (K, ViewValue)>) -> Self {
        Self::Object(Arc::new(
            fields
                .into_iter()
                .map(|(k, v)| (Arc::from(k.as_ref()), v))
                .collect(),
        ))
    }

    pub fn text(value: impl AsRef<str>) -> Self {
        Self::Text(Arc::from(value.as_ref()))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ViewValue::Null => "null",
            ViewValue::Bool(_) => "bool",
            ViewValue::Number(_) => "number",
            ViewValue::Text(_) => "text",
            ViewValue::List(_) => "list",
            ViewValue::Object(_) => "object",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ViewValue::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ViewValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ViewValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ViewValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[ViewValue]> {
        match self {
            ViewValue::List(items) => Some(items.as_slice()),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<Arc<str>, ViewValue>> {
        match self {
            ViewValue::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Field of an object.
    pub fn get(&self, key: &str) -> Option<&ViewValue> {
        self.as_object()?.get(key)
    }

    /// Subtree at `path`, if every step resolves.
    pub fn pointer(&self, path: &[PathSegment]) -> Option<&ViewValue> {
        let mut current = self;
        for segment in path {
            current = match (current, segment) {
                (ViewValue::Object(map), PathSegment::Key(k)) => map.get(k.as_str())?,
                (ViewValue::List(items), PathSegment::Index(i)) => items.get(*i)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Same allocation, not just equal content. Scalars never share.
    pub fn ptr_eq(&self, other: &ViewValue) -> bool {
        match (self, other) {
            (ViewValue::List(a), ViewValue::List(b)) => Arc::ptr_eq(a, b),
            (ViewValue::Object(a), ViewValue::Object(b)) => Arc::ptr_eq(a, b),
            (ViewValue::Text(a), ViewValue::Text(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// String form of a list item key. Only text and numbers can be keys.
    pub fn key_string(&self) -> Option<String> {
        match self {
            ViewValue::Text(s) => Some(s.to_string()),
            ViewValue::Number(n) if n.is_finite() => Some(format_number(*n)),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ViewValue::Null => serde_json::Value::Null,
            ViewValue::Bool(b) => serde_json::Value::Bool(*b),
            ViewValue::Number(n) => number_to_json(*n),
            ViewValue::Text(s) => serde_json::Value::String(s.to_string()),
            ViewValue::List(items) => {
                serde_json::Value::Array(items.iter().map(ViewValue::to_json).collect())
            }
            ViewValue::Object(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.to_string(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

fn is_exact_integer(n: f64) -> bool {
    n.is_finite() && n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER
}

fn format_number(n: f64) -> String {
    if is_exact_integer(n) {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

fn number_to_json(n: f64) -> serde_json::Value {
    if is_exact_integer(n) {
        serde_json::Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)
    }
}

impl fmt::Display for ViewValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

// ============================================================================
// Conversions
// ============================================================================

impl From<serde_json::Value> for ViewValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => ViewValue::Null,
            serde_json::Value::Bool(b) => ViewValue::Bool(b),
            serde_json::Value::Number(n) => ViewValue::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => ViewValue::Text(Arc::from(s)),
            serde_json::Value::Array(items) => {
                ViewValue::list(items.into_iter().map(ViewValue::from))
            }
            serde_json::Value::Object(map) => {
                ViewValue::object(map.into_iter().map(|(k, v)| (k, ViewValue::from(v))))
            }
        }
    }
}

impl From<&ViewValue> for serde_json::Value {
    fn from(value: &ViewValue) -> Self {
        value.to_json()
    }
}

impl From<bool> for ViewValue {
    fn from(value: bool) -> Self {
        ViewValue::Bool(value)
    }
}

impl From<f64> for ViewValue {
    fn from(value: f64) -> Self {
        ViewValue::Number(value)
    }
}

impl From<i64> for ViewValue {
    fn from(value: i64) -> Self {
        ViewValue::Number(value as f64)
    }
}

impl From<i32> for ViewValue {
    fn from(value: i32) -> Self {
        ViewValue::Number(f64::from(value))
    }
}

impl From<&str> for ViewValue {
    fn from(value: &str) -> Self {
        ViewValue::text(value)
    }
}

impl From<String> for ViewValue {
    fn from(value: String) -> Self {
        ViewValue::Text(Arc::from(value))
    }
}

impl From<Vec<ViewValue>> for ViewValue {
    fn from(items: Vec<ViewValue>) -> Self {
        ViewValue::List(Arc::new(items))
    }
}

// ============================================================================
// Serde
// ============================================================================

impl Serialize for ViewValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ViewValue::Null => serializer.serialize_unit(),
            ViewValue::Bool(b) => serializer.serialize_bool(*b),
            ViewValue::Number(n) if is_exact_integer(*n) => serializer.serialize_i64(*n as i64),
            ViewValue::Number(n) => serializer.serialize_f64(*n),
            ViewValue::Text(s) => serializer.serialize_str(s),
            ViewValue::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items.iter() {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            ViewValue::Object(fields) => {
                let mut map = serializer.serialize_map(Some(fields.len()))?;
                for (k, v) in fields.iter() {
                    map.serialize_entry(&**k, v)?;
                }
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for ViewValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(ViewValueVisitor)
    }
}

struct ViewValueVisitor;

impl<'de> Visitor<'de> for ViewValueVisitor {
    type Value = ViewValue;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a JSON-compatible view value")
    }

    fn visit_unit<E: de::Error>(self) -> Result<ViewValue, E> {
        Ok(ViewValue::Null)
    }

    fn visit_none<E: de::Error>(self) -> Result<ViewValue, E> {
        Ok(ViewValue::Null)
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<ViewValue, D::Error> {
        ViewValue::deserialize(deserializer)
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<ViewValue, E> {
        Ok(ViewValue::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<ViewValue, E> {
        Ok(ViewValue::Number(v as f64))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<ViewValue, E> {
        Ok(ViewValue::Number(v as f64))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<ViewValue, E> {
        Ok(ViewValue::Number(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<ViewValue, E> {
        Ok(ViewValue::text(v))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<ViewValue, E> {
        Ok(ViewValue::from(v))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<ViewValue, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(item) = seq.next_element::<ViewValue>()? {
            items.push(item);
        }
        Ok(ViewValue::from(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<ViewValue, A::Error> {
        let mut fields = BTreeMap::new();
        while let Some((k, v)) = map.next_entry::<String, ViewValue>()? {
            fields.insert(Arc::from(k), v);
        }
        Ok(ViewValue::Object(Arc::new(fields)))
    }
}
