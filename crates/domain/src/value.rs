use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single decoded payload field value.
///
/// Mirrors the shape JSON payloads arrive in, plus a `List` variant for
/// array-valued fields encountered before the "auto" derivation mode reduces
/// them to their first element.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Json(serde_json::Value),
    List(Vec<Value>),
}

impl Value {
    /// Converts a decoded JSON value into our internal representation.
    /// Objects become `Json` (not recursively decomposed); arrays become `List`.
    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else if let Some(f) = n.as_f64() {
                    Value::Float(f)
                } else {
                    Value::Text(n.to_string())
                }
            }
            serde_json::Value::String(s) => Value::Text(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from_json).collect())
            }
            obj @ serde_json::Value::Object(_) => Value::Json(obj),
        }
    }

    /// Reduces a list-valued field to its first element, per the "auto"
    /// derivation convention. Non-list values pass through unchanged.
    pub fn reduce_list(self) -> Value {
        match self {
            Value::List(mut items) if !items.is_empty() => items.remove(0),
            Value::List(_) => Value::Null,
            other => other,
        }
    }

    pub fn column_type(&self) -> ColumnType {
        match self {
            Value::Null => ColumnType::Text,
            Value::Bool(_) => ColumnType::Boolean,
            Value::Int(_) => ColumnType::Integer,
            Value::Float(_) => ColumnType::Float,
            Value::Text(_) => ColumnType::Text,
            Value::Json(_) => ColumnType::Json,
            Value::List(_) => ColumnType::Json,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Parses a value as an integer without going through `f64`, so large
    /// fractional-part fields don't lose trailing digits to float rounding.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            Value::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// A row of decoded fields, keyed by column name. Ordered so that
/// schema-diffing and test assertions are deterministic.
pub type Row = BTreeMap<String, Value>;

/// Destination column types, in ascending order of how "wide" they are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Boolean,
    Integer,
    Float,
    Text,
    Json,
}

impl ColumnType {
    /// Returns the column type that can hold values of both `self` and
    /// `other`, or `None` if the two types are irreconcilable (which
    /// triggers a shadow-version table rather than a widening ALTER).
    pub fn widen(self, other: ColumnType) -> Option<ColumnType> {
        use ColumnType::*;
        if self == other {
            return Some(self);
        }
        match (self, other) {
            (Integer, Float) | (Float, Integer) => Some(Float),
            (Text, Json) | (Json, Text) => Some(Json),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_type_same_type_is_always_compatible() {
        assert_eq!(ColumnType::Text.widen(ColumnType::Text), Some(ColumnType::Text));
        assert_eq!(ColumnType::Json.widen(ColumnType::Json), Some(ColumnType::Json));
    }

    #[test]
    fn column_type_integer_widens_to_float() {
        assert_eq!(ColumnType::Integer.widen(ColumnType::Float), Some(ColumnType::Float));
        assert_eq!(ColumnType::Float.widen(ColumnType::Integer), Some(ColumnType::Float));
    }

    #[test]
    fn column_type_text_and_json_widen_bidirectionally() {
        assert_eq!(ColumnType::Text.widen(ColumnType::Json), Some(ColumnType::Json));
        assert_eq!(ColumnType::Json.widen(ColumnType::Text), Some(ColumnType::Json));
    }

    #[test]
    fn column_type_boolean_is_incompatible_with_numeric() {
        assert_eq!(ColumnType::Boolean.widen(ColumnType::Integer), None);
    }

    #[test]
    fn value_reduces_list_to_first_element() {
        let v = Value::List(vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(v.reduce_list(), Value::Int(1));
    }

    #[test]
    fn value_from_json_classifies_numbers() {
        assert_eq!(Value::from_json(serde_json::json!(5)).column_type(), ColumnType::Integer);
        assert_eq!(Value::from_json(serde_json::json!(5.5)).column_type(), ColumnType::Float);
    }
}
