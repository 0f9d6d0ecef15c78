//! Local argument validation against a tool's declared input schema.
//!
//! Tool schemas arrive as dynamic JSON Schema documents, so this checks
//! the subset that catches the common mistakes cheaply before any wire
//! traffic: the top-level object shape, required properties, and primitive
//! property types. Anything the check cannot interpret is let through for
//! the server to judge.

use serde_json::Value;

use crate::error::ClientError;

/// Check `args` against `schema`. Failures carry the property path.
pub fn validate_args(schema: &Value, args: &Value) -> Result<(), ClientError> {
    let Some(schema_obj) = schema.as_object() else {
        return Ok(());
    };

    if schema_obj.get("type").and_then(Value::as_str) == Some("object") && !args.is_object() {
        return Err(ClientError::validation(format!(
            "arguments must be an object, got {}",
            type_name(args)
        )));
    }

    let args_obj = match args.as_object() {
        Some(obj) => obj,
        None => return Ok(()),
    };

    if let Some(required) = schema_obj.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            if !args_obj.contains_key(key) {
                return Err(ClientError::validation(format!(
                    "missing required argument \"{key}\""
                )));
            }
        }
    }

    if let Some(properties) = schema_obj.get("properties").and_then(Value::as_object) {
        for (key, value) in args_obj {
            let Some(expected) = properties
                .get(key)
                .and_then(|p| p.get("type"))
                .and_then(Value::as_str)
            else {
                continue;
            };
            if !type_matches(expected, value) {
                return Err(ClientError::validation(format!(
                    "argument \"{key}\" must be of type {expected}, got {}",
                    type_name(value)
                )));
            }
        }
    }

    Ok(())
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        // Unknown schema type keyword: defer to the server.
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
