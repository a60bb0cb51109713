//! value representation
//!
//! The evaluation model contains the following data types
//! - null
//! - unknown (a placeholder of a given [Type] for a value not known in the current phase)
//! - boolean (true/false)
//! - integer (signed, i64)
//! - decimal (f64)
//! - string (utf-8)
//! - array ("list" of values)
//! - object (order-preserving "map"/"dictionary", where the key is of type string)
//!
//! Values coming out of the expression evaluator are always known. Unknowns only enter via
//! deferred evaluation (e.g. input variables during validation) and then spread to anything
//! that references them.
use crate::types::Type;
use serde::{
    ser::{SerializeMap, SerializeSeq},
    Serializer,
};

/// Rendering of an unknown value in serialized output
pub const UNKNOWN_PLACEHOLDER: &str = "(known after apply)";

/// All possible value types
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Unknown(Type),
    Boolean(bool),
    Integer(i64),
    Decimal(f64),
    String(String),
    Array(Vec<Value>),
    Object(indexmap::IndexMap<String, Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Short name of the kind of value, used in error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Unknown(_) => "unknown",
            Value::Boolean(_) => "bool",
            Value::Integer(_) | Value::Decimal(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "list",
            Value::Object(_) => "object",
        }
    }

    /// Converts into the expression evaluator's representation
    ///
    /// Returns `None` when the value is not wholly known.
    pub fn to_hcl(&self) -> Option<hcl::Value> {
        Some(match self {
            Value::Null => hcl::Value::Null,
            Value::Unknown(_) => return None,
            Value::Boolean(b) => hcl::Value::Bool(*b),
            Value::Integer(i) => hcl::Value::Number((*i).into()),
            Value::Decimal(d) => hcl::Number::from_f64(*d)
                .map(hcl::Value::Number)
                .unwrap_or(hcl::Value::Null),
            Value::String(s) => hcl::Value::String(s.clone()),
            Value::Array(items) => hcl::Value::Array(
                items
                    .iter()
                    .map(Value::to_hcl)
                    .collect::<Option<Vec<_>>>()?,
            ),
            Value::Object(attrs) => hcl::Value::Object(
                attrs
                    .iter()
                    .map(|(k, v)| v.to_hcl().map(|v| (k.clone(), v)))
                    .collect::<Option<hcl::value::Map<String, hcl::Value>>>()?,
            ),
        })
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Decimal(value)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(value: Vec<T>) -> Self {
        Value::Array(value.into_iter().map(Into::into).collect())
    }
}

impl<K: ToString, V: Into<Value>> From<indexmap::IndexMap<K, V>> for Value {
    fn from(value: indexmap::IndexMap<K, V>) -> Self {
        Value::Object(
            value
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.into()))
                .collect(),
        )
    }
}

impl From<hcl::Number> for Value {
    fn from(value: hcl::Number) -> Self {
        if let Some(int) = value.as_i64() {
            return Value::Integer(int);
        }

        match value.as_f64() {
            Some(decimal) => Value::Decimal(decimal),
            None => Value::Null,
        }
    }
}

impl From<hcl::Value> for Value {
    fn from(value: hcl::Value) -> Value {
        match value {
            hcl::Value::Null => Value::Null,
            hcl::Value::Bool(b) => b.into(),
            hcl::Value::Number(n) => n.into(),
            hcl::Value::String(s) => s.into(),
            hcl::Value::Array(a) => Value::Array(a.into_iter().map(Into::into).collect()),
            hcl::Value::Object(o) => {
                Value::Object(o.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

impl serde::ser::Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Unknown(_) => serializer.serialize_str(UNKNOWN_PLACEHOLDER),
            Value::Boolean(value) => serializer.serialize_bool(*value),
            Value::Integer(value) => serializer.serialize_i64(*value),
            Value::Decimal(value) => serializer.serialize_f64(*value),
            Value::String(value) => serializer.serialize_str(value),
            Value::Array(value) => {
                let mut ser = serializer.serialize_seq(Some(value.len()))?;
                for element in value {
                    ser.serialize_element(element)?;
                }
                ser.end()
            }
            Value::Object(value) => {
                let mut ser = serializer.serialize_map(Some(value.len()))?;
                for (element_key, element_value) in value {
                    ser.serialize_entry(element_key, element_value)?;
                }
                ser.end()
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn nested_unknowns_have_no_hcl_value() {
        let value = Value::Object(indexmap::indexmap! {
            "a".to_string() => Value::Integer(1),
            "b".to_string() => Value::Array(vec![Value::Unknown(Type::String)]),
        });
        assert_eq!(value.to_hcl(), None);
    }

    #[test]
    fn from_hcl_value() {
        let value: Value = hcl::Value::Array(vec![
            hcl::Value::Number(3.into()),
            hcl::Value::Number(hcl::Number::from_f64(1.5).unwrap()),
            hcl::Value::Null,
        ])
        .into();

        assert_eq!(
            value,
            Value::Array(vec![Value::Integer(3), Value::Decimal(1.5), Value::Null])
        );
    }

    #[test]
    fn unknowns_serialize_as_placeholder() {
        let value = Value::Object(indexmap::indexmap! {
            "id".to_string() => Value::Unknown(Type::String),
        });
        assert_eq!(
            serde_json::to_string(&value).unwrap(),
            r#"{"id":"(known after apply)"}"#
        );
    }
}
