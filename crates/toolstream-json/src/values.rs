use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Dotted-path view over a (possibly partial) JSON document.
///
/// Objects are walked recursively; arrays, scalars and empty objects are
/// stored as leaves under the path that leads to them.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ExtractedValues(BTreeMap<String, Value>);

impl ExtractedValues {
    pub fn from_document(document: &Value) -> Self {
        let mut out = BTreeMap::new();
        if let Value::Object(map) = document {
            for (key, value) in map {
                flatten_into(key, value, &mut out);
            }
        }
        Self(out)
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        self.0.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.0.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get(path).and_then(Value::as_str)
    }
}

fn flatten_into(path: &str, value: &Value, out: &mut BTreeMap<String, Value>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, child) in map {
                flatten_into(&format!("{path}.{key}"), child, out);
            }
        }
        other => {
            out.insert(path.to_string(), other.clone());
        }
    }
}

/// Typed lookup into extracted values. A value that does not deserialize into
/// `T` is treated as absent.
pub fn get_optimistic_value<T: DeserializeOwned>(values: &ExtractedValues, path: &str) -> Option<T> {
    values
        .get(path)
        .and_then(|value| serde_json::from_value(value.clone()).ok())
}

pub fn get_optimistic_value_or<T: DeserializeOwned>(
    values: &ExtractedValues,
    path: &str,
    default: T,
) -> T {
    get_optimistic_value(values, path).unwrap_or(default)
}
