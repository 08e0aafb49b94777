//! Field value model
//!
//! `Value` is the discriminated union of every shape a record field can
//! hold. `IndexKey` is the hashable canonical form used for primary-table
//! keys and index entries. `deep_equal` is the structural equality the
//! reactive layer uses to suppress no-op notifications.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// JSON object key marking a serialized `Value::Date`
const DATE_TAG: &str = "$date";

/// Caller-facing field map: insert data, update change sets, filters.
pub type FieldMap = BTreeMap<String, Value>;

/// A single field value.
///
/// Dates carry a Unix-millisecond instant and round-trip through JSON as
/// `{"$date": <ms>}` so snapshots restore them losslessly.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    /// Instant in Unix milliseconds
    Date(i64),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

impl Value {
    /// Human-readable type name, used in validation error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Date(_) => "date",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Unix-millisecond instant, if this is a date.
    pub fn as_date_ms(&self) -> Option<i64> {
        match self {
            Value::Date(ms) => Some(*ms),
            _ => None,
        }
    }

    /// Convert from a plain JSON value. A single-key object
    /// `{"$date": <number>}` becomes `Value::Date`.
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => {
                if map.len() == 1 {
                    if let Some(ms) = map.get(DATE_TAG).and_then(serde_json::Value::as_i64) {
                        return Value::Date(ms);
                    }
                }
                Value::Object(
                    map.into_iter()
                        .map(|(k, v)| (k, Value::from_json(v)))
                        .collect(),
                )
            }
        }
    }

    /// Convert to a plain JSON value (dates become `{"$date": <ms>}`).
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Date(ms) => {
                let mut map = serde_json::Map::new();
                map.insert(DATE_TAG.to_string(), serde_json::Value::from(*ms));
                serde_json::Value::Object(map)
            }
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Object(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let json = serde_json::Value::deserialize(deserializer)?;
        Ok(Value::from_json(json))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<f32> for Value {
    fn from(n: f32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "{s}"),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

// ---------------------------------------------------------------------------
// Deep equality
// ---------------------------------------------------------------------------

/// Structural equality with SameValueZero number semantics.
///
/// - numbers: `NaN == NaN` is true, `-0.0 == 0.0` is true
/// - dates: compared by instant
/// - arrays: length plus element-wise
/// - objects: key-set plus element-wise
/// - differing shapes are never deep-equal
pub fn deep_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Number(x), Value::Number(y)) => (x.is_nan() && y.is_nan()) || x == y,
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Date(x), Value::Date(y)) => x == y,
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| deep_equal(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs.iter().all(|(k, x)| match ys.get(k) {
                    Some(y) => deep_equal(x, y),
                    None => false,
                })
        }
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// IndexKey
// ---------------------------------------------------------------------------

/// Canonical, hashable form of an indexable value.
///
/// Numbers are stored by bit pattern with NaN collapsed to one
/// representation and `-0.0` normalized to `0.0`, so index equality
/// matches `deep_equal`. Arrays and objects are not indexable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IndexKey {
    Null,
    Bool(bool),
    /// Normalized f64 bit pattern
    Number(u64),
    String(String),
    /// Instant in Unix milliseconds
    Date(i64),
}

impl IndexKey {
    /// Canonicalize a value for use as an index or table key.
    /// Returns `None` for arrays and objects.
    pub fn from_value(value: &Value) -> Option<IndexKey> {
        match value {
            Value::Null => Some(IndexKey::Null),
            Value::Bool(b) => Some(IndexKey::Bool(*b)),
            Value::Number(n) => Some(IndexKey::Number(normalize_bits(*n))),
            Value::String(s) => Some(IndexKey::String(s.clone())),
            Value::Date(ms) => Some(IndexKey::Date(*ms)),
            Value::Array(_) | Value::Object(_) => None,
        }
    }

    /// The value this key canonicalizes.
    pub fn to_value(&self) -> Value {
        match self {
            IndexKey::Null => Value::Null,
            IndexKey::Bool(b) => Value::Bool(*b),
            IndexKey::Number(bits) => Value::Number(f64::from_bits(*bits)),
            IndexKey::String(s) => Value::String(s.clone()),
            IndexKey::Date(ms) => Value::Date(*ms),
        }
    }
}

fn normalize_bits(n: f64) -> u64 {
    if n.is_nan() {
        f64::NAN.to_bits()
    } else if n == 0.0 {
        0.0f64.to_bits()
    } else {
        n.to_bits()
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexKey::Number(bits) => {
                let n = f64::from_bits(*bits);
                if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
                    write!(f, "{}", n as i64)
                } else {
                    write!(f, "{n}")
                }
            }
            other => write!(f, "{}", other.to_value()),
        }
    }
}

impl Serialize for IndexKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for IndexKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        IndexKey::from_value(&value).ok_or_else(|| {
            serde::de::Error::custom(format!("{} is not a valid key", value.type_name()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deep_equal_primitives() {
        assert!(deep_equal(&Value::Null, &Value::Null));
        assert!(deep_equal(&Value::Bool(true), &Value::Bool(true)));
        assert!(!deep_equal(&Value::Bool(true), &Value::Bool(false)));
        assert!(deep_equal(&Value::from("a"), &Value::from("a")));
        assert!(!deep_equal(&Value::from("a"), &Value::from("b")));
        assert!(deep_equal(&Value::from(1.5), &Value::from(1.5)));
    }

    #[test]
    fn test_deep_equal_nan_and_negative_zero() {
        assert!(deep_equal(&Value::Number(f64::NAN), &Value::Number(f64::NAN)));
        assert!(deep_equal(&Value::Number(-0.0), &Value::Number(0.0)));
        assert!(!deep_equal(&Value::Number(f64::NAN), &Value::Number(0.0)));
    }

    #[test]
    fn test_deep_equal_dates_by_instant() {
        assert!(deep_equal(&Value::Date(1_700_000_000_000), &Value::Date(1_700_000_000_000)));
        assert!(!deep_equal(&Value::Date(1), &Value::Date(2)));
        // A date never equals the number with the same millis
        assert!(!deep_equal(&Value::Date(1000), &Value::Number(1000.0)));
    }

    #[test]
    fn test_deep_equal_arrays() {
        let a = Value::Array(vec![Value::from(1.0), Value::from("x")]);
        let b = Value::Array(vec![Value::from(1.0), Value::from("x")]);
        let c = Value::Array(vec![Value::from(1.0)]);
        assert!(deep_equal(&a, &b));
        assert!(!deep_equal(&a, &c));
    }

    #[test]
    fn test_deep_equal_objects_by_key_set() {
        let mut m1 = BTreeMap::new();
        m1.insert("a".to_string(), Value::from(1.0));
        let mut m2 = BTreeMap::new();
        m2.insert("a".to_string(), Value::from(1.0));
        let mut m3 = BTreeMap::new();
        m3.insert("b".to_string(), Value::from(1.0));
        assert!(deep_equal(&Value::Object(m1.clone()), &Value::Object(m2)));
        assert!(!deep_equal(&Value::Object(m1), &Value::Object(m3)));
    }

    #[test]
    fn test_deep_equal_rejects_shape_mismatch() {
        assert!(!deep_equal(&Value::Null, &Value::Bool(false)));
        assert!(!deep_equal(&Value::from("1"), &Value::from(1.0)));
        assert!(!deep_equal(&Value::Array(vec![]), &Value::Object(BTreeMap::new())));
    }

    #[test]
    fn test_index_key_normalizes_numbers() {
        let nan1 = IndexKey::from_value(&Value::Number(f64::NAN)).unwrap();
        let nan2 = IndexKey::from_value(&Value::Number(0.0 / 0.0)).unwrap();
        assert_eq!(nan1, nan2);

        let pos = IndexKey::from_value(&Value::Number(0.0)).unwrap();
        let neg = IndexKey::from_value(&Value::Number(-0.0)).unwrap();
        assert_eq!(pos, neg);
    }

    #[test]
    fn test_index_key_rejects_compound_values() {
        assert!(IndexKey::from_value(&Value::Array(vec![])).is_none());
        assert!(IndexKey::from_value(&Value::Object(BTreeMap::new())).is_none());
    }

    #[test]
    fn test_index_key_display_whole_numbers() {
        let key = IndexKey::from_value(&Value::Number(42.0)).unwrap();
        assert_eq!(key.to_string(), "42");
        let key = IndexKey::from_value(&Value::Number(1.25)).unwrap();
        assert_eq!(key.to_string(), "1.25");
    }

    #[test]
    fn test_date_round_trips_through_json() {
        let value = Value::Date(1_700_000_000_000);
        let json = serde_json::to_string(&value).unwrap();
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_plain_object_survives_json() {
        let mut map = BTreeMap::new();
        map.insert("name".to_string(), Value::from("ada"));
        map.insert("age".to_string(), Value::from(36.0));
        let value = Value::Object(map);
        let json = serde_json::to_string(&value).unwrap();
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back, value);
    }
}
