//! Schema-less document model
//!
//! Every document read from a collection is converted into a [`Value`] tree
//! before masking, so the rule engine never depends on a fixed schema.

use std::fmt;

use indexmap::IndexMap;
use serde::{Serialize, Serializer};
use serde_json::Number;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::error::ValueConversionError;

/// A document node.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Timestamp(OffsetDateTime),
    Array(Vec<Value>),
    Object(Map),
}

/// Insertion-ordered string map used for object nodes.
///
/// Lookups are hashed; iteration follows insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Map {
    entries: IndexMap<String, Value>,
}

impl Map {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: IndexMap::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.entries.get_mut(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert or replace. A replaced entry keeps its original position.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.entries.insert(key.into(), value)
    }

    /// Remove an entry, shifting later entries down to keep their order.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.entries.shift_remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut Value)> {
        self.entries.iter_mut().map(|(k, v)| (k.as_str(), v))
    }
}

impl FromIterator<(String, Value)> for Map {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// One step in a path from the document root.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// Location of a node inside a document, rendered as `a.b[0].c`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct FieldPath(Vec<PathSegment>);

impl FieldPath {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }

    pub fn push(&mut self, segment: PathSegment) {
        self.0.push(segment);
    }

    pub fn pop(&mut self) -> Option<PathSegment> {
        self.0.pop()
    }

    pub fn child_key(&self, key: &str) -> Self {
        let mut path = self.clone();
        path.push(PathSegment::Key(key.to_string()));
        path
    }

    pub fn child_index(&self, index: usize) -> Self {
        let mut path = self.clone();
        path.push(PathSegment::Index(index));
        path
    }

    /// Field name of the last segment, if it addresses an object key.
    pub fn last_key(&self) -> Option<&str> {
        match self.0.last() {
            Some(PathSegment::Key(k)) => Some(k),
            _ => None,
        }
    }

    pub fn starts_with(&self, prefix: &FieldPath) -> bool {
        self.0.starts_with(&prefix.0)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.0.iter().enumerate() {
            match segment {
                PathSegment::Key(k) if i == 0 => write!(f, "{}", k)?,
                PathSegment::Key(k) => write!(f, ".{}", k)?,
                PathSegment::Index(idx) => write!(f, "[{}]", idx)?,
            }
        }
        Ok(())
    }
}

impl Serialize for FieldPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Pre-order traversal over `(path, node)` pairs.
///
/// Objects are yielded before their children, array elements in index order.
pub struct Walk<'a> {
    stack: Vec<(FieldPath, &'a Value)>,
}

impl<'a> Iterator for Walk<'a> {
    type Item = (FieldPath, &'a Value);

    fn next(&mut self) -> Option<Self::Item> {
        let (path, node) = self.stack.pop()?;
        match node {
            Value::Object(map) => {
                for (k, child) in map.iter().rev() {
                    self.stack.push((path.child_key(k), child));
                }
            }
            Value::Array(items) => {
                for (idx, child) in items.iter().enumerate().rev() {
                    self.stack.push((path.child_index(idx), child));
                }
            }
            _ => {}
        }
        Some((path, node))
    }
}

impl Value {
    /// Convert a native (extended JSON) document into the value model.
    pub fn from_native(native: serde_json::Value) -> Result<Self, ValueConversionError> {
        convert_native(native, &mut FieldPath::root())
    }

    /// Render back into the native (extended JSON) representation.
    pub fn to_native(&self) -> Result<serde_json::Value, ValueConversionError> {
        render_native(self, &mut FieldPath::root())
    }

    pub fn walk(&self) -> Walk<'_> {
        Walk {
            stack: vec![(FieldPath::root(), self)],
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Timestamp(_) => "timestamp",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_container(&self) -> bool {
        matches!(self, Value::Array(_) | Value::Object(_))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Map> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn get_path(&self, path: &FieldPath) -> Option<&Value> {
        let mut node = self;
        for segment in path.segments() {
            node = match (segment, node) {
                (PathSegment::Key(k), Value::Object(map)) => map.get(k)?,
                (PathSegment::Index(i), Value::Array(items)) => items.get(*i)?,
                _ => return None,
            };
        }
        Some(node)
    }

    pub fn get_path_mut(&mut self, path: &FieldPath) -> Option<&mut Value> {
        let mut node = self;
        for segment in path.segments() {
            node = match (segment, node) {
                (PathSegment::Key(k), Value::Object(map)) => map.get_mut(k)?,
                (PathSegment::Index(i), Value::Array(items)) => items.get_mut(*i)?,
                _ => return None,
            };
        }
        Some(node)
    }

    /// Set the node at `path`. A missing final object key is inserted; a missing
    /// parent or out-of-range index leaves the document untouched and returns false.
    pub fn set_path(&mut self, path: &FieldPath, value: Value) -> bool {
        let Some((last, parent_segments)) = path.segments().split_last() else {
            *self = value;
            return true;
        };
        let parent_path = FieldPath(parent_segments.to_vec());
        match (last, self.get_path_mut(&parent_path)) {
            (PathSegment::Key(k), Some(Value::Object(map))) => {
                map.insert(k.clone(), value);
                true
            }
            (PathSegment::Index(i), Some(Value::Array(items))) if *i < items.len() => {
                items[*i] = value;
                true
            }
            _ => false,
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Number(value.into())
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Number(value.into())
    }
}

impl From<OffsetDateTime> for Value {
    fn from(value: OffsetDateTime) -> Self {
        Value::Timestamp(value)
    }
}

/// Epoch milliseconds to a UTC timestamp, if representable.
pub fn millis_to_timestamp(millis: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(millis as i128 * 1_000_000).ok()
}

fn convert_native(
    native: serde_json::Value,
    path: &mut FieldPath,
) -> Result<Value, ValueConversionError> {
    match native {
        serde_json::Value::Null => Ok(Value::Null),
        serde_json::Value::Bool(b) => Ok(Value::Bool(b)),
        serde_json::Value::Number(n) => Ok(Value::Number(n)),
        serde_json::Value::String(s) => Ok(Value::String(s)),
        serde_json::Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for (idx, item) in items.into_iter().enumerate() {
                path.push(PathSegment::Index(idx));
                out.push(convert_native(item, path)?);
                path.pop();
            }
            Ok(Value::Array(out))
        }
        serde_json::Value::Object(map) => {
            if map.len() == 1 {
                if let Some(inner) = map.get("$date") {
                    return convert_date(inner, path).map(Value::Timestamp);
                }
                if let Some(inner) = map.get("$numberLong") {
                    return parse_number_long(inner, path).map(|n| Value::Number(n.into()));
                }
            }
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                path.push(PathSegment::Key(k.clone()));
                let converted = convert_native(v, path)?;
                path.pop();
                out.insert(k, converted);
            }
            Ok(Value::Object(out))
        }
    }
}

fn convert_date(
    inner: &serde_json::Value,
    path: &FieldPath,
) -> Result<OffsetDateTime, ValueConversionError> {
    let millis = match inner {
        serde_json::Value::String(s) => {
            return OffsetDateTime::parse(s, &Rfc3339).map_err(|e| {
                ValueConversionError::new(path.to_string(), format!("invalid $date string: {}", e))
            });
        }
        serde_json::Value::Number(n) => n.as_i64().ok_or_else(|| {
            ValueConversionError::new(path.to_string(), "$date millis must be an integer")
        })?,
        serde_json::Value::Object(map) if map.len() == 1 && map.contains_key("$numberLong") => {
            parse_number_long(&map["$numberLong"], path)?
        }
        _ => {
            return Err(ValueConversionError::new(
                path.to_string(),
                "unsupported $date payload",
            ));
        }
    };
    millis_to_timestamp(millis).ok_or_else(|| {
        ValueConversionError::new(path.to_string(), "$date out of range")
    })
}

fn parse_number_long(inner: &serde_json::Value, path: &FieldPath) -> Result<i64, ValueConversionError> {
    inner
        .as_str()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| {
            ValueConversionError::new(path.to_string(), "$numberLong must be a decimal integer string")
        })
}

fn render_native(value: &Value, path: &mut FieldPath) -> Result<serde_json::Value, ValueConversionError> {
    Ok(match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Number(n) => serde_json::Value::Number(n.clone()),
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::Timestamp(ts) => {
            let rendered = ts.format(&Rfc3339).map_err(|e| {
                ValueConversionError::new(path.to_string(), format!("timestamp not representable: {}", e))
            })?;
            serde_json::json!({ "$date": rendered })
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for (idx, item) in items.iter().enumerate() {
                path.push(PathSegment::Index(idx));
                out.push(render_native(item, path)?);
                path.pop();
            }
            serde_json::Value::Array(out)
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map.iter() {
                path.push(PathSegment::Key(k.to_string()));
                out.insert(k.to_string(), render_native(v, path)?);
                path.pop();
            }
            serde_json::Value::Object(out)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use time::macros::datetime;

    fn doc() -> Value {
        Value::from_native(json!({
            "Name": "JANE",
            "Contacts": [
                {"Email": "a@b.org"},
                {"Email": "c@d.org", "Notes": {"Email": "nested"}}
            ],
            "Dob": {"$date": "1980-01-01T00:00:00Z"}
        }))
        .unwrap()
    }

    #[test]
    fn test_extended_json_dates() {
        let value = doc();
        let dob = value.as_object().unwrap().get("Dob").unwrap();
        assert_eq!(dob, &Value::Timestamp(datetime!(1980-01-01 0:00 UTC)));

        let millis = Value::from_native(json!({"$date": 0})).unwrap();
        assert_eq!(millis, Value::Timestamp(datetime!(1970-01-01 0:00 UTC)));

        let long = Value::from_native(json!({"$date": {"$numberLong": "86400000"}})).unwrap();
        assert_eq!(long, Value::Timestamp(datetime!(1970-01-02 0:00 UTC)));

        let number = Value::from_native(json!({"$numberLong": "12"})).unwrap();
        assert_eq!(number, Value::from(12));
    }

    #[test]
    fn test_malformed_date_fails_fast() {
        let err = Value::from_native(json!({"a": [{"$date": "yesterday"}]})).unwrap_err();
        assert_eq!(err.path, "a[0]");
        assert!(err.reason.contains("$date"));
        assert!(!err.to_string().contains("yesterday"));
    }

    #[test]
    fn test_round_trip_preserves_key_order() {
        let native = json!({"z": 1, "a": {"$date": "2001-02-03T04:05:06Z"}, "m": [true, null]});
        let value = Value::from_native(native.clone()).unwrap();
        let keys: Vec<_> = value.as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["z", "a", "m"]);
        assert_eq!(value.to_native().unwrap(), native);
    }

    #[test]
    fn test_walk_pre_order() {
        let value = doc();
        let paths: Vec<String> = value.walk().map(|(p, _)| p.to_string()).collect();
        assert_eq!(
            paths,
            vec![
                "",
                "Name",
                "Contacts",
                "Contacts[0]",
                "Contacts[0].Email",
                "Contacts[1]",
                "Contacts[1].Email",
                "Contacts[1].Notes",
                "Contacts[1].Notes.Email",
                "Dob",
            ]
        );
        // restartable
        assert_eq!(value.walk().count(), paths.len());
    }

    #[test]
    fn test_get_and_set_path() {
        let mut value = doc();
        let path = FieldPath::root()
            .child_key("Contacts")
            .child_index(1)
            .child_key("Email");
        assert_eq!(value.get_path(&path), Some(&Value::from("c@d.org")));

        assert!(value.set_path(&path, Value::from("x@y.z")));
        assert_eq!(value.get_path(&path), Some(&Value::from("x@y.z")));

        let missing = FieldPath::root().child_key("Contacts").child_index(9).child_key("Email");
        assert!(!value.set_path(&missing, Value::Null));
    }

    #[test]
    fn test_map_insert_keeps_position() {
        let mut map = Map::new();
        map.insert("a", Value::from(1));
        map.insert("b", Value::from(2));
        assert_eq!(map.insert("a", Value::from(3)), Some(Value::from(1)));
        let entries: Vec<_> = map.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
        assert_eq!(
            entries,
            vec![("a".to_string(), Value::from(3)), ("b".to_string(), Value::from(2))]
        );
    }

    #[test]
    fn test_wide_object_keeps_order_and_lookups() {
        let width = 50_000i64;
        let native: serde_json::Map<String, serde_json::Value> = (0..width)
            .map(|i| (format!("field{}", i), serde_json::Value::from(i)))
            .collect();
        let value = Value::from_native(serde_json::Value::Object(native)).unwrap();
        let map = value.as_object().unwrap();

        assert_eq!(map.len(), width as usize);
        assert_eq!(map.keys().next(), Some("field0"));
        assert_eq!(map.keys().last(), Some("field49999"));
        assert_eq!(map.get("field31337"), Some(&Value::from(31337i64)));

        let mut map = map.clone();
        assert_eq!(map.remove("field0"), Some(Value::from(0i64)));
        assert_eq!(map.keys().next(), Some("field1"));
    }
}
