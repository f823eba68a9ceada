//! Preset JSON schemas and shallow output validation (§4.10 steps 3/5),
//! ported from `cascade_pipeline.py`'s `PRESET_MANIFEST_SCHEMA` /
//! `PRESET_PROMPTS_SCHEMA` / `_validate_schema_minimal` / `_validate_json_output`.

use crate::types::OutputSchemaKind;
use forgechain_utils::error::ForgeError;
use once_cell::sync::Lazy;
use serde_json::{Value, json};

pub static PRESET_MANIFEST_SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "type": "object",
        "required": ["files"],
        "additionalProperties": false,
        "properties": {
            "files": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["path"],
                    "additionalProperties": true,
                    "properties": {
                        "path": {"type": "string"},
                        "file_id": {"type": "string"},
                        "notes": {"type": "string"},
                    },
                },
            },
        },
    })
});

pub static PRESET_PROMPTS_SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "type": "object",
        "required": ["prompts"],
        "additionalProperties": false,
        "properties": {
            "prompts": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["name", "text"],
                    "additionalProperties": true,
                    "properties": {
                        "name": {"type": "string"},
                        "text": {"type": "string"},
                    },
                },
            },
        },
    })
});

/// Select the preset (or custom) schema for a step, or `None` when the step
/// is not JSON-output.
#[must_use]
pub fn schema_for(
    kind: Option<OutputSchemaKind>,
    custom: Option<&Value>,
) -> Option<Value> {
    match kind {
        Some(OutputSchemaKind::Manifest) => Some(PRESET_MANIFEST_SCHEMA.clone()),
        Some(OutputSchemaKind::Prompts) => Some(PRESET_PROMPTS_SCHEMA.clone()),
        Some(OutputSchemaKind::Custom) => custom.cloned(),
        None => None,
    }
}

/// Reject a schema that is not a JSON object, or that declares neither
/// `type` nor `properties`.
pub fn validate_schema_minimal(schema: &Value) -> Result<(), ForgeError> {
    if !schema.is_object() {
        return Err(ForgeError::Contract("schema must be a JSON object".to_string()));
    }
    if schema.get("type").is_none() && schema.get("properties").is_none() {
        return Err(ForgeError::Contract(
            "schema must declare at least 'type' or 'properties'".to_string(),
        ));
    }
    Ok(())
}

/// Shallow validation of a parsed JSON output against `schema`: every
/// `required` key is present, and each top-level key's declared `type`
/// (array/object/string) matches the value's actual shape.
pub fn validate_json_output(obj: &Value, schema: &Value) -> Result<(), ForgeError> {
    let Some(obj_map) = obj.as_object() else {
        return Err(ForgeError::Contract("JSON output must be an object".to_string()));
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        let missing: Vec<&str> = required
            .iter()
            .filter_map(Value::as_str)
            .filter(|k| !obj_map.contains_key(*k))
            .collect();
        if !missing.is_empty() {
            return Err(ForgeError::Contract(format!(
                "JSON output missing required keys: {}",
                missing.join(", ")
            )));
        }
    }

    if let Some(props) = schema.get("properties").and_then(Value::as_object) {
        for (key, meta) in props {
            let Some(val) = obj_map.get(key) else { continue };
            let expected_type = meta.get("type").and_then(Value::as_str);
            let ok = match expected_type {
                Some("array") => val.is_array(),
                Some("object") => val.is_object(),
                Some("string") => val.is_string(),
                _ => true,
            };
            if !ok {
                return Err(ForgeError::Contract(format!(
                    "JSON key '{key}' must be {}",
                    expected_type.unwrap_or("?")
                )));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_for_selects_manifest_preset() {
        let schema = schema_for(Some(OutputSchemaKind::Manifest), None).unwrap();
        assert_eq!(schema["required"][0], "files");
    }

    #[test]
    fn schema_for_custom_uses_provided_value() {
        let custom = json!({"type": "object", "required": ["x"]});
        let schema = schema_for(Some(OutputSchemaKind::Custom), Some(&custom)).unwrap();
        assert_eq!(schema, custom);
    }

    #[test]
    fn validate_schema_minimal_rejects_schema_without_type_or_properties() {
        assert!(validate_schema_minimal(&json!({"required": ["x"]})).is_err());
    }

    #[test]
    fn validate_json_output_reports_missing_required_keys() {
        let schema = json!({"type": "object", "required": ["files"]});
        let err = validate_json_output(&json!({}), &schema).unwrap_err();
        assert!(err.to_string().contains("files"));
    }

    #[test]
    fn validate_json_output_checks_declared_types() {
        let schema = json!({"type": "object", "properties": {"files": {"type": "array"}}});
        let err = validate_json_output(&json!({"files": "not-an-array"}), &schema).unwrap_err();
        assert!(err.to_string().contains("files"));
    }

    #[test]
    fn validate_json_output_accepts_matching_shape() {
        let schema = json!({"type": "object", "required": ["files"], "properties": {"files": {"type": "array"}}});
        assert!(validate_json_output(&json!({"files": []}), &schema).is_ok());
    }
}
