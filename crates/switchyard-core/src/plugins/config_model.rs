//! Schema-driven validation of per-assistant plugin configuration.
//!
//! A manifest's `config_schema` is a list of tagged field descriptors; the
//! model built from it validates and coerces user-supplied values without
//! generating any types at runtime.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value};

use crate::models::{ConfigField, FieldType};

const SECRET_MASK: &str = "********";

/// A validation problem with one configuration field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[derive(Debug, Clone)]
pub struct ConfigModel {
    fields: Vec<ConfigField>,
}

/// Configuration values ready to hand to a plugin.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidatedConfig {
    pub values: BTreeMap<String, Value>,
    secrets: BTreeSet<String>,
}

impl ConfigModel {
    pub fn from_schema(fields: &[ConfigField]) -> Self {
        Self {
            fields: fields.to_vec(),
        }
    }

    pub fn fields(&self) -> &[ConfigField] {
        &self.fields
    }

    /// Validate `input`, collecting every field error rather than stopping
    /// at the first. Keys not in the schema pass through untouched.
    pub fn validate(&self, input: &Map<String, Value>) -> Result<ValidatedConfig, Vec<FieldError>> {
        let mut errors = Vec::new();
        let mut config = ValidatedConfig::default();

        for field in &self.fields {
            if field.secret {
                config.secrets.insert(field.name.clone());
            }
            let supplied = input.get(&field.name).filter(|v| !v.is_null());
            let value = match (supplied, &field.default) {
                (Some(v), _) => v,
                (None, Some(default)) => default,
                (None, None) if field.required => {
                    errors.push(FieldError {
                        field: field.name.clone(),
                        message: "required field is missing".to_string(),
                    });
                    continue;
                }
                (None, None) => continue,
            };
            match coerce(value, field.field_type) {
                Some(v) => {
                    config.values.insert(field.name.clone(), v);
                }
                None => errors.push(FieldError {
                    field: field.name.clone(),
                    message: format!("expected {}, got {}", field.field_type, value),
                }),
            }
        }

        for (key, value) in input {
            if !self.fields.iter().any(|f| &f.name == key) {
                config.values.insert(key.clone(), value.clone());
            }
        }

        if errors.is_empty() {
            Ok(config)
        } else {
            Err(errors)
        }
    }
}

fn coerce(value: &Value, ty: FieldType) -> Option<Value> {
    match (ty, value) {
        (FieldType::String, Value::String(_)) => Some(value.clone()),
        (FieldType::String, Value::Number(n)) => Some(Value::String(n.to_string())),
        (FieldType::String, Value::Bool(b)) => Some(Value::String(b.to_string())),
        (FieldType::Integer, Value::Number(n)) => n.as_i64().map(Value::from),
        (FieldType::Integer, Value::String(s)) => s.trim().parse::<i64>().ok().map(Value::from),
        (FieldType::Float, Value::Number(n)) => n.as_f64().map(Value::from),
        (FieldType::Float, Value::String(s)) => s.trim().parse::<f64>().ok().map(Value::from),
        (FieldType::Bool, Value::Bool(_)) => Some(value.clone()),
        (FieldType::Bool, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(Value::Bool(true)),
            "false" | "0" | "no" => Some(Value::Bool(false)),
            _ => None,
        },
        _ => None,
    }
}

impl ValidatedConfig {
    /// Unvalidated fallback: the raw map as given, secrets still masked in
    /// rendered output.
    pub fn raw(input: &Map<String, Value>, schema: &[ConfigField]) -> Self {
        Self {
            values: input.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            secrets: schema
                .iter()
                .filter(|f| f.secret)
                .map(|f| f.name.clone())
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Environment variables for a subprocess: `NAME_UPPER=value`.
    pub fn to_env(&self) -> Vec<(String, String)> {
        self.values
            .iter()
            .map(|(k, v)| (env_key(k), env_value(v)))
            .collect()
    }

    /// JSON rendering safe for logs and display.
    pub fn redacted(&self) -> Value {
        let map: Map<String, Value> = self
            .values
            .iter()
            .map(|(k, v)| {
                let shown = if self.secrets.contains(k) {
                    Value::String(SECRET_MASK.to_string())
                } else {
                    v.clone()
                };
                (k.clone(), shown)
            })
            .collect();
        Value::Object(map)
    }
}

fn env_key(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

fn env_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
