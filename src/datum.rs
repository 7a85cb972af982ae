//! Datum - the JSON-like value stored in document attributes.
//!
//! A `Datum` represents any value a document attribute can hold. It mirrors
//! JSON but keeps integers and floats apart so that values read back from
//! the server compare equal to the values that were saved.
//!
//! # Supported Types
//!
//! - **Null**: Absence of a value
//! - **Boolean**: true or false
//! - **Integer**: i64 whole numbers
//! - **Float**: f64 floating point numbers
//! - **String**: UTF-8 encoded text
//! - **Array**: Ordered list of datums
//! - **Object**: Key-ordered map of datums
//!
//! # Example
//!
//! ```rust
//! use divan::Datum;
//! use std::collections::BTreeMap;
//!
//! let mut obj = BTreeMap::new();
//! obj.insert("is_a".to_string(), Datum::from("Hash"));
//! obj.insert("hash_size".to_string(), Datum::from(2));
//! let value = Datum::Object(obj);
//! assert_eq!(value.get("hash_size").and_then(Datum::as_i64), Some(2));
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// A document attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Datum {
    #[default]
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Array(Vec<Datum>),
    Object(BTreeMap<String, Datum>),
}

impl Datum {
    /// Check if datum is null
    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    /// Get as string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Datum::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get as integer
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Datum::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Get as a float, widening integers
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Datum::Integer(n) => Some(*n as f64),
            Datum::Float(n) => Some(*n),
            _ => None,
        }
    }

    /// Get as boolean
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Datum::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Get as array
    pub fn as_array(&self) -> Option<&Vec<Datum>> {
        match self {
            Datum::Array(arr) => Some(arr),
            _ => None,
        }
    }

    /// Get as object
    pub fn as_object(&self) -> Option<&BTreeMap<String, Datum>> {
        match self {
            Datum::Object(obj) => Some(obj),
            _ => None,
        }
    }

    /// Look up a field when this datum is an object
    pub fn get(&self, key: &str) -> Option<&Datum> {
        self.as_object().and_then(|obj| obj.get(key))
    }

    /// Strict JSON form. Fails on NaN and infinite floats, which JSON
    /// cannot carry.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(match self {
            Datum::Float(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .ok_or_else(|| {
                    Error::Serialization(format!("{} cannot be represented in JSON", n))
                })?,
            Datum::Array(arr) => serde_json::Value::Array(
                arr.iter().map(Datum::to_json).collect::<Result<_>>()?,
            ),
            Datum::Object(obj) => serde_json::Value::Object(
                obj.iter()
                    .map(|(k, v)| Ok((k.clone(), v.to_json()?)))
                    .collect::<Result<_>>()?,
            ),
            other => serde_json::Value::from(other.clone()),
        })
    }
}

// Conversions
impl From<bool> for Datum {
    fn from(b: bool) -> Self {
        Datum::Boolean(b)
    }
}

impl From<i32> for Datum {
    fn from(n: i32) -> Self {
        Datum::Integer(n as i64)
    }
}

impl From<i64> for Datum {
    fn from(n: i64) -> Self {
        Datum::Integer(n)
    }
}

impl From<usize> for Datum {
    fn from(n: usize) -> Self {
        match i64::try_from(n) {
            Ok(n) => Datum::Integer(n),
            Err(_) => Datum::Float(n as f64),
        }
    }
}

impl From<f64> for Datum {
    fn from(n: f64) -> Self {
        Datum::Float(n)
    }
}

impl From<String> for Datum {
    fn from(s: String) -> Self {
        Datum::String(s)
    }
}

impl From<&str> for Datum {
    fn from(s: &str) -> Self {
        Datum::String(s.to_string())
    }
}

impl<T: Into<Datum>> From<Vec<T>> for Datum {
    fn from(items: Vec<T>) -> Self {
        Datum::Array(items.into_iter().map(Into::into).collect())
    }
}

impl From<BTreeMap<String, Datum>> for Datum {
    fn from(obj: BTreeMap<String, Datum>) -> Self {
        Datum::Object(obj)
    }
}

impl<T: Into<Datum>> From<Option<T>> for Datum {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Datum::Null)
    }
}

impl From<serde_json::Value> for Datum {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Datum::Null,
            serde_json::Value::Bool(b) => Datum::Boolean(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Datum::Integer(i),
                None => Datum::Float(n.as_f64().unwrap_or(0.0)),
            },
            serde_json::Value::String(s) => Datum::String(s),
            serde_json::Value::Array(arr) => {
                Datum::Array(arr.into_iter().map(Datum::from).collect())
            }
            serde_json::Value::Object(obj) => {
                Datum::Object(obj.into_iter().map(|(k, v)| (k, Datum::from(v))).collect())
            }
        }
    }
}

impl From<Datum> for serde_json::Value {
    fn from(datum: Datum) -> Self {
        match datum {
            Datum::Null => serde_json::Value::Null,
            Datum::Boolean(b) => serde_json::Value::Bool(b),
            Datum::Integer(n) => serde_json::Value::Number(n.into()),
            Datum::Float(n) => serde_json::Number::from_f64(n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Datum::String(s) => serde_json::Value::String(s),
            Datum::Array(arr) => {
                serde_json::Value::Array(arr.into_iter().map(serde_json::Value::from).collect())
            }
            Datum::Object(obj) => serde_json::Value::Object(
                obj.into_iter()
                    .map(|(k, v)| (k, serde_json::Value::from(v)))
                    .collect(),
            ),
        }
    }
}

impl PartialEq<&str> for Datum {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == Some(*other)
    }
}

impl PartialEq<i64> for Datum {
    fn eq(&self, other: &i64) -> bool {
        self.as_i64() == Some(*other)
    }
}

impl std::fmt::Display for Datum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Datum::Null => write!(f, "null"),
            Datum::Boolean(b) => write!(f, "{}", b),
            Datum::Integer(n) => write!(f, "{}", n),
            Datum::Float(n) => write!(f, "{}", n),
            Datum::String(s) => write!(f, "\"{}\"", s),
            Datum::Array(arr) => {
                write!(f, "[")?;
                for (i, item) in arr.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Datum::Object(obj) => {
                write!(f, "{{")?;
                for (i, (key, value)) in obj.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "\"{}\": {}", key, value)?;
                }
                write!(f, "}}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_integers_and_floats_stay_distinct() {
        let datum = Datum::from(json!({"count": 2, "ratio": 2.5, "whole": 2.0}));
        assert_eq!(datum.get("count"), Some(&Datum::Integer(2)));
        assert_eq!(datum.get("ratio"), Some(&Datum::Float(2.5)));
        assert_eq!(datum.get("whole"), Some(&Datum::Float(2.0)));
    }

    #[test]
    fn test_json_conversion_preserves_nested_values() {
        let original = json!({
            "is_a": "Hash",
            "hash_size": 2,
            "tags": ["a", null, true],
        });
        let datum = Datum::from(original.clone());
        assert_eq!(serde_json::Value::from(datum), original);
    }

    #[test]
    fn test_untagged_deserialize_matches_conversion() {
        let raw = r#"{"n": 7, "f": 0.5, "s": "x", "o": {"k": [1]}}"#;
        let parsed: Datum = serde_json::from_str(raw).unwrap();
        let converted = Datum::from(serde_json::from_str::<serde_json::Value>(raw).unwrap());
        assert_eq!(parsed, converted);
    }

    #[test]
    fn test_strict_json_rejects_non_finite_floats() {
        assert_eq!(Datum::from(2.5).to_json().unwrap(), json!(2.5));
        assert!(Datum::from(f64::NAN).to_json().is_err());
        let nested = Datum::from(vec![Datum::from(1), Datum::from(f64::INFINITY)]);
        assert!(matches!(nested.to_json(), Err(Error::Serialization(_))));
    }

    #[test]
    fn test_comparisons_with_primitives() {
        assert_eq!(Datum::from("Well"), "Well");
        assert_eq!(Datum::from(1), 1i64);
        assert_ne!(Datum::Float(1.0), 1i64);
    }

    #[test]
    fn test_display() {
        let datum = Datum::from(vec![Datum::from(1), Datum::from("two")]);
        assert_eq!(datum.to_string(), "[1, \"two\"]");
    }
}
