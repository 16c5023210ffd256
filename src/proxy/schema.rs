//! Tool parameter schemas discovered at runtime.
//!
//! Workers describe their tools with JSON Schema. The proxy keeps the raw
//! schema for display and a parsed, tagged form for a structural check of
//! call arguments: object shape, required fields, declared top-level types.
//! Deeper validation is left to the worker itself.

use std::collections::BTreeMap;

use serde_json::Value;

use super::errors::ProxyError;

/// JSON value types as named by JSON Schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
    Null,
}

impl JsonType {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "string" => Some(Self::String),
            "number" => Some(Self::Number),
            "integer" => Some(Self::Integer),
            "boolean" => Some(Self::Boolean),
            "array" => Some(Self::Array),
            "object" => Some(Self::Object),
            "null" => Some(Self::Null),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
            Self::Null => "null",
        }
    }

    fn accepts(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => {
                value.is_i64()
                    || value.is_u64()
                    || value.as_f64().is_some_and(|f| f.fract() == 0.0)
            }
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
            Self::Null => value.is_null(),
        }
    }
}

/// One declared property. An empty `types` list accepts anything.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PropertySchema {
    pub types: Vec<JsonType>,
}

/// Parameter schema of an object-typed tool input.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ObjectSchema {
    pub properties: BTreeMap<String, PropertySchema>,
    pub required: Vec<String>,
    pub allows_additional: bool,
}

/// Parsed form of a tool's `inputSchema`.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ToolSchema {
    /// `{"type": "object", ...}`, checked structurally at call time.
    Object(ObjectSchema),
    /// Missing or non-object schema; arguments are passed through unchecked.
    #[default]
    Untyped,
}

impl ToolSchema {
    /// Parse a raw JSON Schema value. Never fails; unknown shapes are `Untyped`.
    pub fn parse(raw: &Value) -> Self {
        let Some(obj) = raw.as_object() else {
            return Self::Untyped;
        };

        let is_object = match obj.get("type") {
            Some(Value::String(t)) => t == "object",
            Some(Value::Array(ts)) => ts.iter().any(|t| t.as_str() == Some("object")),
            None => obj.contains_key("properties"),
            _ => false,
        };
        if !is_object {
            return Self::Untyped;
        }

        let properties = obj
            .get("properties")
            .and_then(Value::as_object)
            .map(|props| {
                props
                    .iter()
                    .map(|(name, prop)| (name.clone(), parse_property(prop)))
                    .collect()
            })
            .unwrap_or_default();

        let required = obj
            .get("required")
            .and_then(Value::as_array)
            .map(|fields| {
                fields
                    .iter()
                    .filter_map(|f| f.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();

        let allows_additional = !matches!(obj.get("additionalProperties"), Some(Value::Bool(false)));

        Self::Object(ObjectSchema {
            properties,
            required,
            allows_additional,
        })
    }

    /// Check call arguments against the schema.
    ///
    /// `null` arguments are treated as an empty object.
    pub fn validate(&self, tool: &str, arguments: &Value) -> Result<(), ProxyError> {
        let invalid = |reason: String| ProxyError::InvalidArguments {
            tool: tool.to_string(),
            reason,
        };

        let empty = serde_json::Map::new();
        let args = match arguments {
            Value::Object(map) => map,
            Value::Null => &empty,
            other => {
                return Err(invalid(format!(
                    "arguments must be an object, got {}",
                    value_type_name(other)
                )))
            }
        };

        let Self::Object(schema) = self else {
            return Ok(());
        };

        for field in &schema.required {
            if !args.contains_key(field) {
                return Err(invalid(format!("missing required field: '{field}'")));
            }
        }

        for (name, value) in args {
            match schema.properties.get(name) {
                Some(prop) if !prop.types.is_empty() => {
                    if !prop.types.iter().any(|t| t.accepts(value)) {
                        let expected: Vec<&str> = prop.types.iter().map(|t| t.name()).collect();
                        return Err(invalid(format!(
                            "field '{name}' expected {}, got {}",
                            expected.join(" | "),
                            value_type_name(value)
                        )));
                    }
                }
                Some(_) => {}
                None if !schema.allows_additional => {
                    return Err(invalid(format!("unexpected field: '{name}'")));
                }
                None => {}
            }
        }

        Ok(())
    }

    /// Names of required parameters (empty for untyped schemas).
    pub fn required(&self) -> &[String] {
        match self {
            Self::Object(schema) => &schema.required,
            Self::Untyped => &[],
        }
    }
}

fn parse_property(prop: &Value) -> PropertySchema {
    let types = match prop.get("type") {
        Some(Value::String(t)) => JsonType::parse(t).into_iter().collect(),
        Some(Value::Array(ts)) => ts
            .iter()
            .filter_map(|t| t.as_str().and_then(JsonType::parse))
            .collect(),
        _ => Vec::new(),
    };
    PropertySchema { types }
}

fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
