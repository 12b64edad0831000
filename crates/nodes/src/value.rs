//! `ParamValue`: the tagged union carried by task input parameters.
//!
//! Input maps mix strings, numbers, booleans, nested maps and lists. Instead of
//! casting loosely typed JSON on demand, every value is one of the explicit
//! variants below and each task kind decodes the shape it needs with
//! [`ParamValue::decode`].

use std::collections::BTreeMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::NodeError;

/// Named input parameters of a task.
pub type ParamMap = BTreeMap<String, ParamValue>;

/// A single heterogeneous parameter value.
///
/// The untagged representation keeps plain JSON/YAML documents readable:
/// `{"retries": 3, "uri": "http://x", "flags": [true]}` maps straight onto
/// `Integer`, `String` and `List(Bool)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum ParamValue {
    #[default]
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    List(Vec<ParamValue>),
    Map(ParamMap),
}

impl ParamValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&ParamMap> {
        match self {
            ParamValue::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[ParamValue]> {
        match self {
            ParamValue::List(items) => Some(items),
            _ => None,
        }
    }

    /// Convert into a `serde_json::Value`. Non-finite floats become `null`.
    pub fn to_json(&self) -> Value {
        match self {
            ParamValue::Null => Value::Null,
            ParamValue::Bool(b) => Value::Bool(*b),
            ParamValue::Integer(i) => Value::from(*i),
            ParamValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            ParamValue::String(s) => Value::String(s.clone()),
            ParamValue::List(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            ParamValue::Map(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    /// Decode this value into a typed shape.
    ///
    /// A mismatch is a permanent error: retrying will not fix malformed input.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, NodeError> {
        serde_json::from_value(self.to_json())
            .map_err(|e| NodeError::Fatal(format!("malformed parameters: {e}")))
    }
}

/// Render a whole parameter map as a JSON object.
pub fn params_to_json(params: &ParamMap) -> Value {
    Value::Object(
        params
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect(),
    )
}

impl From<&str> for ParamValue {
    fn from(s: &str) -> Self {
        ParamValue::String(s.to_owned())
    }
}

impl From<String> for ParamValue {
    fn from(s: String) -> Self {
        ParamValue::String(s)
    }
}

impl From<bool> for ParamValue {
    fn from(b: bool) -> Self {
        ParamValue::Bool(b)
    }
}

impl From<i64> for ParamValue {
    fn from(i: i64) -> Self {
        ParamValue::Integer(i)
    }
}

impl From<f64> for ParamValue {
    fn from(f: f64) -> Self {
        ParamValue::Float(f)
    }
}

impl From<Vec<ParamValue>> for ParamValue {
    fn from(items: Vec<ParamValue>) -> Self {
        ParamValue::List(items)
    }
}

impl From<ParamMap> for ParamValue {
    fn from(map: ParamMap) -> Self {
        ParamValue::Map(map)
    }
}

impl From<Value> for ParamValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => ParamValue::Null,
            Value::Bool(b) => ParamValue::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => ParamValue::Integer(i),
                None => ParamValue::Float(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => ParamValue::String(s),
            Value::Array(items) => ParamValue::List(items.into_iter().map(Into::into).collect()),
            Value::Object(map) => {
                ParamValue::Map(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

/// Plain-text rendering, as used for environment variables: strings are
/// written as-is, `null` is empty and lists or maps are written as JSON.
impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Null => Ok(()),
            ParamValue::Bool(b) => write!(f, "{b}"),
            ParamValue::Integer(i) => write!(f, "{i}"),
            ParamValue::Float(x) => write!(f, "{x}"),
            ParamValue::String(s) => f.write_str(s),
            ParamValue::List(_) | ParamValue::Map(_) => write!(f, "{}", self.to_json()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn untagged_json_maps_onto_variants() {
        let parsed: ParamMap = serde_json::from_value(json!({
            "uri": "http://svc/health",
            "retries": 3,
            "ratio": 0.5,
            "enabled": true,
            "nothing": null,
            "list": [1, "two"],
            "nested": { "k": "v" }
        }))
        .unwrap();

        assert_eq!(parsed["uri"], ParamValue::from("http://svc/health"));
        assert_eq!(parsed["retries"], ParamValue::Integer(3));
        assert_eq!(parsed["ratio"], ParamValue::Float(0.5));
        assert_eq!(parsed["enabled"], ParamValue::Bool(true));
        assert_eq!(parsed["nothing"], ParamValue::Null);
        assert_eq!(
            parsed["list"],
            ParamValue::List(vec![ParamValue::Integer(1), ParamValue::from("two")])
        );
        assert_eq!(parsed["nested"].as_map().unwrap()["k"], ParamValue::from("v"));
    }

    #[test]
    fn decode_mismatch_is_fatal() {
        #[derive(Debug, Deserialize)]
        struct Needs {
            #[allow(dead_code)]
            uri: String,
        }

        let err = ParamValue::Integer(7).decode::<Needs>().unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn json_conversion_preserves_structure() {
        let value = ParamValue::from(json!({ "a": [1, 2.5, "x"], "b": { "c": false } }));
        assert_eq!(value.to_json(), json!({ "a": [1, 2.5, "x"], "b": { "c": false } }));
    }

    #[test]
    fn display_renders_scalars_as_plain_text() {
        assert_eq!(ParamValue::from("debug").to_string(), "debug");
        assert_eq!(ParamValue::Integer(8080).to_string(), "8080");
        assert_eq!(ParamValue::Float(0.25).to_string(), "0.25");
        assert_eq!(ParamValue::Bool(true).to_string(), "true");
        assert_eq!(ParamValue::Null.to_string(), "");
        assert_eq!(ParamValue::from(json!([1, "a"])).to_string(), r#"[1,"a"]"#);
    }
}
