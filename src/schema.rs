//! Validation of tool arguments against their declared input schema.
//!
//! Covers the JSON Schema subset the tool catalog uses: `type`, `required`,
//! `properties`, `additionalProperties: false`, `enum`, `minimum`/`maximum`,
//! `minLength`/`maxLength`, `pattern`, `minItems`/`maxItems` and `items`.
//!
//! Patterns are matched against the whole string, so `[0-9]+` behaves like
//! `^[0-9]+$`.

use regex::Regex;
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Validate `args` against `schema`.
pub fn validate(schema: &Value, args: &Value) -> Result<()> {
    check(schema, args, "arguments").map_err(Error::InvalidParams)
}

fn check(schema: &Value, value: &Value, path: &str) -> std::result::Result<(), String> {
    if let Some(expected) = schema.get("type").and_then(Value::as_str) {
        if !type_matches(expected, value) {
            return Err(format!("{} must be of type {}", path, expected));
        }
    }

    if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            let names: Vec<String> = allowed.iter().map(Value::to_string).collect();
            return Err(format!("{} must be one of {}", path, names.join(", ")));
        }
    }

    match value {
        Value::Object(map) => check_object(schema, map, path),
        Value::String(s) => {
            let len = s.chars().count() as u64;
            if let Some(min) = schema.get("minLength").and_then(Value::as_u64) {
                if len < min {
                    return Err(format!("{} must be at least {} characters", path, min));
                }
            }
            if let Some(max) = schema.get("maxLength").and_then(Value::as_u64) {
                if len > max {
                    return Err(format!("{} must be at most {} characters", path, max));
                }
            }
            if let Some(pattern) = schema.get("pattern").and_then(Value::as_str) {
                let re = Regex::new(&format!("^(?:{})$", pattern))
                    .map_err(|e| format!("{} has an unusable pattern: {}", path, e))?;
                if !re.is_match(s) {
                    return Err(format!("{} must match {}", path, pattern));
                }
            }
            Ok(())
        }
        Value::Number(n) => {
            let n = n.as_f64().unwrap_or(f64::NAN);
            if let Some(min) = schema.get("minimum").and_then(Value::as_f64) {
                if n < min {
                    return Err(format!("{} must be >= {}", path, min));
                }
            }
            if let Some(max) = schema.get("maximum").and_then(Value::as_f64) {
                if n > max {
                    return Err(format!("{} must be <= {}", path, max));
                }
            }
            Ok(())
        }
        Value::Array(items) => {
            let len = items.len() as u64;
            if let Some(min) = schema.get("minItems").and_then(Value::as_u64) {
                if len < min {
                    return Err(format!("{} must contain at least {} items", path, min));
                }
            }
            if let Some(max) = schema.get("maxItems").and_then(Value::as_u64) {
                if len > max {
                    return Err(format!("{} must contain at most {} items", path, max));
                }
            }
            if let Some(item_schema) = schema.get("items") {
                for (i, item) in items.iter().enumerate() {
                    check(item_schema, item, &format!("{}[{}]", path, i))?;
                }
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn check_object(
    schema: &Value,
    map: &Map<String, Value>,
    path: &str,
) -> std::result::Result<(), String> {
    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for name in required.iter().filter_map(Value::as_str) {
            if map.get(name).map_or(true, Value::is_null) {
                return Err(format!("missing required field '{}'", name));
            }
        }
    }

    let properties = schema.get("properties").and_then(Value::as_object);
    let closed = schema.get("additionalProperties") == Some(&Value::Bool(false));

    for (name, value) in map {
        match properties.and_then(|p| p.get(name)) {
            // Explicit nulls are treated as absent optionals.
            Some(_) if value.is_null() => {}
            Some(prop) => check(prop, value, &format!("{}.{}", path, name))?,
            None if closed => return Err(format!("unknown field '{}'", name)),
            None => {}
        }
    }
    Ok(())
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "object" => value.is_object(),
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "null" => value.is_null(),
        _ => true,
    }
}
