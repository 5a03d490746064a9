//! Primary keys of source documents

use std::fmt;

use serde::{Deserialize, Serialize};

/// Immutable, totally ordered document key.
///
/// Integers sort before strings; integers compare numerically and strings by
/// byte order. Batch pagination and checkpoint resume both rely on this order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DocumentKey {
    Int(i64),
    Str(String),
}

impl DocumentKey {
    /// Field holding the primary key inside a native document.
    pub const FIELD: &'static str = "_id";

    /// Extract the key from a native document's `_id`.
    pub fn of(document: &serde_json::Value) -> Option<Self> {
        document.get(Self::FIELD).and_then(Self::from_native)
    }

    /// Interpret a native `_id` value. Accepts integers, strings, `{"$oid": ..}`
    /// and `{"$numberLong": ..}` wrappers.
    pub fn from_native(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Number(n) => n.as_i64().map(DocumentKey::Int),
            serde_json::Value::String(s) => Some(DocumentKey::Str(s.clone())),
            serde_json::Value::Object(map) if map.len() == 1 => {
                if let Some(oid) = map.get("$oid").and_then(|v| v.as_str()) {
                    Some(DocumentKey::Str(oid.to_string()))
                } else {
                    map.get("$numberLong")
                        .and_then(|v| v.as_str())
                        .and_then(|s| s.parse().ok())
                        .map(DocumentKey::Int)
                }
            }
            _ => None,
        }
    }

    pub fn to_native(&self) -> serde_json::Value {
        match self {
            DocumentKey::Int(i) => serde_json::Value::from(*i),
            DocumentKey::Str(s) => serde_json::Value::from(s.as_str()),
        }
    }

    /// Bytes that identify this key unambiguously (used for seeding).
    pub fn canonical_bytes(&self) -> Vec<u8> {
        match self {
            DocumentKey::Int(i) => {
                let mut bytes = vec![0u8];
                bytes.extend_from_slice(&i.to_be_bytes());
                bytes
            }
            DocumentKey::Str(s) => {
                let mut bytes = vec![1u8];
                bytes.extend_from_slice(s.as_bytes());
                bytes
            }
        }
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentKey::Int(i) => write!(f, "{}", i),
            DocumentKey::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for DocumentKey {
    fn from(value: i64) -> Self {
        DocumentKey::Int(value)
    }
}

impl From<&str> for DocumentKey {
    fn from(value: &str) -> Self {
        DocumentKey::Str(value.to_string())
    }
}

impl From<String> for DocumentKey {
    fn from(value: String) -> Self {
        DocumentKey::Str(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ordering_ints_before_strings() {
        let mut keys = vec![
            DocumentKey::from("b"),
            DocumentKey::Int(10),
            DocumentKey::from("a"),
            DocumentKey::Int(-3),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![
                DocumentKey::Int(-3),
                DocumentKey::Int(10),
                DocumentKey::from("a"),
                DocumentKey::from("b"),
            ]
        );
    }

    #[test]
    fn test_extract_from_document() {
        assert_eq!(DocumentKey::of(&json!({"_id": 7})), Some(DocumentKey::Int(7)));
        assert_eq!(
            DocumentKey::of(&json!({"_id": {"$oid": "65f0c0ffee"}})),
            Some(DocumentKey::from("65f0c0ffee"))
        );
        assert_eq!(
            DocumentKey::of(&json!({"_id": {"$numberLong": "9000000000"}})),
            Some(DocumentKey::Int(9_000_000_000))
        );
        assert_eq!(DocumentKey::of(&json!({"name": "x"})), None);
        assert_eq!(DocumentKey::of(&json!({"_id": 1.5})), None);
    }

    #[test]
    fn test_untagged_serialization() {
        let keys = vec![DocumentKey::Int(1), DocumentKey::from("x")];
        let json = serde_json::to_string(&keys).unwrap();
        assert_eq!(json, r#"[1,"x"]"#);
        let parsed: Vec<DocumentKey> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, keys);
    }
}
