//! A small JSON-schema subset for plugin configuration.
//!
//! Supports `type`, `properties`, `required`, `default`, `enum`, numeric and
//! length bounds, `items` and `additionalProperties: false`. Validation
//! collects every violation and materializes defaults into the result.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaType {
    Object,
    Array,
    String,
    Integer,
    Number,
    Boolean,
    Null,
}

impl SchemaType {
    fn accepts(self, value: &Value) -> bool {
        match (self, value) {
            (Self::Object, Value::Object(_))
            | (Self::Array, Value::Array(_))
            | (Self::String, Value::String(_))
            | (Self::Boolean, Value::Bool(_))
            | (Self::Number, Value::Number(_))
            | (Self::Null, Value::Null) => true,
            (Self::Integer, Value::Number(n)) => {
                n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0)
            }
            _ => false,
        }
    }
}

impl fmt::Display for SchemaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Object => "object",
            Self::Array => "array",
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Null => "null",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSchema {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<SchemaType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, ConfigSchema>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<ConfigSchema>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_properties: Option<bool>,
}

impl ConfigSchema {
    /// True when the schema places no constraint at all.
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Validates `value` (or an empty object when absent) and returns it with
    /// defaults filled in.
    pub fn apply(&self, value: Option<&Value>) -> Result<Value, Vec<String>> {
        let empty = Value::Object(serde_json::Map::new());
        let value = match value {
            Some(Value::Null) | None => &empty,
            Some(value) => value,
        };
        let mut errors = Vec::new();
        let out = self.check("config", value, &mut errors);
        if errors.is_empty() {
            Ok(out)
        } else {
            Err(errors)
        }
    }

    /// Checks the schema's own shape: defaults must satisfy their schemas.
    pub fn check_definition(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        self.check_defaults("config", &mut errors);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn check_defaults(&self, at: &str, errors: &mut Vec<String>) {
        if let Some(default) = &self.default {
            let mut local = Vec::new();
            self.check(at, default, &mut local);
            errors.extend(local.into_iter().map(|e| format!("default {e}")));
        }
        for (name, property) in &self.properties {
            property.check_defaults(&format!("{at}.{name}"), errors);
        }
        if let Some(items) = &self.items {
            items.check_defaults(&format!("{at}[]"), errors);
        }
    }

    fn check(&self, at: &str, value: &Value, errors: &mut Vec<String>) -> Value {
        if let Some(kind) = self.kind {
            if !kind.accepts(value) {
                errors.push(format!("{at}: expected {kind}, got {}", describe(value)));
                return value.clone();
            }
        }
        if let Some(allowed) = &self.allowed {
            if !allowed.contains(value) {
                errors.push(format!("{at}: {value} is not one of the allowed values"));
            }
        }

        match value {
            Value::Number(n) => {
                if let Some(f) = n.as_f64() {
                    if let Some(min) = self.minimum.filter(|min| f < *min) {
                        errors.push(format!("{at}: {f} is below minimum {min}"));
                    }
                    if let Some(max) = self.maximum.filter(|max| f > *max) {
                        errors.push(format!("{at}: {f} is above maximum {max}"));
                    }
                }
                value.clone()
            }
            Value::String(s) => {
                let len = s.chars().count();
                if let Some(min) = self.min_length.filter(|min| len < *min) {
                    errors.push(format!("{at}: shorter than {min} characters"));
                }
                if let Some(max) = self.max_length.filter(|max| len > *max) {
                    errors.push(format!("{at}: longer than {max} characters"));
                }
                value.clone()
            }
            Value::Array(items) => match &self.items {
                Some(schema) => Value::Array(
                    items
                        .iter()
                        .enumerate()
                        .map(|(idx, item)| schema.check(&format!("{at}[{idx}]"), item, errors))
                        .collect(),
                ),
                None => value.clone(),
            },
            Value::Object(map) => self.check_object(at, map, errors),
            Value::Bool(_) | Value::Null => value.clone(),
        }
    }

    fn check_object(
        &self,
        at: &str,
        map: &serde_json::Map<String, Value>,
        errors: &mut Vec<String>,
    ) -> Value {
        let mut out = map.clone();
        for (name, property) in &self.properties {
            let path = format!("{at}.{name}");
            match map.get(name) {
                Some(value) => {
                    out.insert(name.clone(), property.check(&path, value, errors));
                }
                None => {
                    if let Some(default) = &property.default {
                        out.insert(name.clone(), property.check(&path, default, errors));
                    } else if property.kind == Some(SchemaType::Object) && !property.properties.is_empty() {
                        let nested = serde_json::Map::new();
                        let filled = property.check_object(&path, &nested, &mut Vec::new());
                        if self.required.contains(name) {
                            out.insert(name.clone(), property.check(&path, &filled, errors));
                        } else if filled.as_object().is_some_and(|m| !m.is_empty()) {
                            out.insert(name.clone(), filled);
                        }
                    } else if self.required.contains(name) {
                        errors.push(format!("{path}: is required"));
                    }
                }
            }
        }
        if self.additional_properties == Some(false) {
            for key in map.keys().filter(|k| !self.properties.contains_key(*k)) {
                errors.push(format!("{at}.{key}: unexpected property"));
            }
        }
        Value::Object(out)
    }
}

fn describe(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
