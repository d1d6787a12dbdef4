//! Typed parameter values for step inputs and results.
//!
//! `ParamValue` is a closed tagged union over the shapes a step parameter or
//! result can take. It deserializes untagged, so YAML and JSON definitions can
//! be written naturally:
//!
//! ```yaml
//! parameters:
//!   target: example.org
//!   depth: 2
//!   tags: [dns, whois]
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum nesting depth accepted by [`ParamValue::validate`].
pub const MAX_VALUE_DEPTH: usize = 32;

/// A step parameter map, keyed by parameter name.
pub type Parameters = BTreeMap<String, ParamValue>;

/// A dynamically shaped but closed parameter or result value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum ParamValue {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<ParamValue>),
    Map(BTreeMap<String, ParamValue>),
}

/// Reasons a value is rejected at registration time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValueError {
    #[error("non-finite number at '{path}'")]
    NonFinite { path: String },

    #[error("empty map key at '{path}'")]
    EmptyKey { path: String },

    #[error("value nested deeper than {max} levels at '{path}'")]
    TooDeep { path: String, max: usize },
}

impl ParamValue {
    /// Check the value is representable everywhere it may travel (JSON,
    /// YAML, event payloads).
    pub fn validate(&self) -> Result<(), ValueError> {
        self.validate_at("$", 0)
    }

    fn validate_at(&self, path: &str, depth: usize) -> Result<(), ValueError> {
        if depth > MAX_VALUE_DEPTH {
            return Err(ValueError::TooDeep {
                path: path.to_string(),
                max: MAX_VALUE_DEPTH,
            });
        }
        match self {
            Self::Float(f) if !f.is_finite() => Err(ValueError::NonFinite {
                path: path.to_string(),
            }),
            Self::List(items) => {
                for (i, item) in items.iter().enumerate() {
                    item.validate_at(&format!("{path}[{i}]"), depth + 1)?;
                }
                Ok(())
            }
            Self::Map(entries) => {
                for (key, item) in entries {
                    if key.is_empty() {
                        return Err(ValueError::EmptyKey {
                            path: path.to_string(),
                        });
                    }
                    item.validate_at(&format!("{path}.{key}"), depth + 1)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Look up a key when this value is a map.
    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        match self {
            Self::Map(entries) => entries.get(key),
            _ => None,
        }
    }

    /// Short name of the variant, used in validation messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::List(_) => "list",
            Self::Map(_) => "map",
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(s) => f.write_str(&s),
            Err(_) => f.write_str(self.kind()),
        }
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl<T: Into<ParamValue>> From<Vec<T>> for ParamValue {
    fn from(v: Vec<T>) -> Self {
        Self::List(v.into_iter().map(Into::into).collect())
    }
}

impl From<BTreeMap<String, ParamValue>> for ParamValue {
    fn from(v: BTreeMap<String, ParamValue>) -> Self {
        Self::Map(v)
    }
}

impl From<serde_json::Value> for ParamValue {
    fn from(v: serde_json::Value) -> Self {
        use serde_json::Value;
        match v {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => Self::String(s),
            Value::Array(items) => Self::List(items.into_iter().map(Into::into).collect()),
            Value::Object(entries) => {
                Self::Map(entries.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

impl From<ParamValue> for serde_json::Value {
    fn from(v: ParamValue) -> Self {
        use serde_json::Value;
        match v {
            ParamValue::Null => Value::Null,
            ParamValue::Bool(b) => Value::Bool(b),
            ParamValue::Int(i) => Value::from(i),
            // Non-finite floats have no JSON form.
            ParamValue::Float(f) => serde_json::Number::from_f64(f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            ParamValue::String(s) => Value::String(s),
            ParamValue::List(items) => Value::Array(items.into_iter().map(Into::into).collect()),
            ParamValue::Map(entries) => {
                Value::Object(entries.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untagged_deserialize_picks_narrowest_variant() {
        let v: ParamValue = serde_json::from_str(r#"{"a": 1, "b": 1.5, "c": [true, null], "d": "x"}"#)
            .unwrap();
        assert_eq!(v.get("a"), Some(&ParamValue::Int(1)));
        assert_eq!(v.get("b"), Some(&ParamValue::Float(1.5)));
        assert_eq!(
            v.get("c"),
            Some(&ParamValue::List(vec![ParamValue::Bool(true), ParamValue::Null]))
        );
        assert_eq!(v.get("d").and_then(ParamValue::as_str), Some("x"));
    }

    #[test]
    fn test_yaml_parameters() {
        let yaml = "target: example.org\ndepth: 2\ntags: [dns, whois]\n";
        let params: Parameters = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(params["target"], ParamValue::from("example.org"));
        assert_eq!(params["depth"].as_i64(), Some(2));
        assert_eq!(params["tags"], ParamValue::from(vec!["dns", "whois"]));
    }

    #[test]
    fn test_validate_rejects_non_finite() {
        let v = ParamValue::List(vec![ParamValue::Float(f64::INFINITY)]);
        let err = v.validate().unwrap_err();
        assert_eq!(
            err,
            ValueError::NonFinite {
                path: "$[0]".to_string()
            }
        );
    }

    #[test]
    fn test_validate_rejects_empty_key() {
        let mut map = BTreeMap::new();
        map.insert(String::new(), ParamValue::Null);
        let err = ParamValue::Map(map).validate().unwrap_err();
        assert!(matches!(err, ValueError::EmptyKey { .. }));
    }

    #[test]
    fn test_validate_rejects_deep_nesting() {
        let mut v = ParamValue::Int(1);
        for _ in 0..=MAX_VALUE_DEPTH {
            v = ParamValue::List(vec![v]);
        }
        assert!(matches!(v.validate(), Err(ValueError::TooDeep { .. })));
    }

    #[test]
    fn test_validate_accepts_ordinary_values() {
        let v: ParamValue = serde_json::json!({"a": [1, 2.5, "x", {"b": false}]}).into();
        assert!(v.validate().is_ok());
    }

    #[test]
    fn test_json_conversion_preserves_shape() {
        let json = serde_json::json!({"n": 3, "s": "x", "l": [1, null]});
        let v = ParamValue::from(json.clone());
        assert_eq!(serde_json::Value::from(v), json);
    }

    #[test]
    fn test_display_is_json() {
        assert_eq!(ParamValue::from(vec![1_i64, 2]).to_string(), "[1,2]");
        assert_eq!(ParamValue::Null.to_string(), "null");
    }
}
