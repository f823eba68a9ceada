//! Cascade definition types (§3), ported from
//! `original_source/kajovo/core/cascade_types.py`'s `CascadeStep` /
//! `CascadeDefinition`, with tolerant `from_dict`-style deserialization
//! matched through `serde(default)` plus light normalization rather than
//! an error path for missing or malformed optional fields.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputType {
    Text,
    Json,
}

impl Default for OutputType {
    fn default() -> Self {
        OutputType::Text
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputSchemaKind {
    Manifest,
    Prompts,
    Custom,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CascadeStep {
    pub title: String,
    pub model: String,
    pub temperature: Option<f64>,
    pub instructions: String,
    pub input_text: String,
    pub input_content_json: Option<serde_json::Value>,
    pub files_existing_ids: Vec<String>,
    pub files_local_paths: Vec<String>,
    pub previous_response_id_expr: Option<String>,
    pub output_type: OutputType,
    pub output_schema_kind: Option<OutputSchemaKind>,
    pub output_schema_custom: Option<serde_json::Value>,
    pub expected_out_files: Vec<String>,
}

impl CascadeStep {
    /// Tolerant reconstruction from a loosely-typed JSON object: unknown or
    /// malformed optional fields fall back to their defaults instead of
    /// failing the whole load, matching `CascadeStep.from_dict`.
    #[must_use]
    pub fn from_value(data: &serde_json::Value) -> Self {
        let get = |k: &str| data.get(k);
        let as_str_list = |v: Option<&serde_json::Value>| -> Vec<String> {
            v.and_then(|v| v.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|x| x.as_str().map(|s| s.trim().to_string()))
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default()
        };

        let output_type = match get("output_type").and_then(|v| v.as_str()) {
            Some(s) if s.eq_ignore_ascii_case("json") => OutputType::Json,
            _ => OutputType::Text,
        };
        let output_schema_kind = match get("output_schema_kind").and_then(|v| v.as_str()) {
            Some("manifest") => Some(OutputSchemaKind::Manifest),
            Some("prompts") => Some(OutputSchemaKind::Prompts),
            Some("custom") => Some(OutputSchemaKind::Custom),
            _ => None,
        };
        let input_content_json = get("input_content_json")
            .filter(|v| v.is_object() || v.is_array())
            .cloned();
        let output_schema_custom = get("output_schema_custom").filter(|v| v.is_object()).cloned();
        let temperature = get("temperature").and_then(|v| {
            if v.is_null() {
                None
            } else {
                v.as_f64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))
            }
        });
        let previous_response_id_expr = get("previous_response_id_expr")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        Self {
            title: get("title").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            model: get("model").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            temperature,
            instructions: get("instructions").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            input_text: get("input_text").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            input_content_json,
            files_existing_ids: as_str_list(get("files_existing_ids")),
            files_local_paths: as_str_list(get("files_local_paths")),
            previous_response_id_expr,
            output_type,
            output_schema_kind,
            output_schema_custom,
            expected_out_files: as_str_list(get("expected_out_files")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CascadeDefinition {
    #[serde(default = "default_version")]
    pub version: u32,
    pub name: String,
    #[serde(default)]
    pub steps: Vec<CascadeStep>,
    #[serde(default)]
    pub default_out_dir: String,
    pub created_at: Option<f64>,
    pub updated_at: Option<f64>,
}

fn default_version() -> u32 {
    1
}

impl CascadeDefinition {
    /// Tolerant load matching `CascadeDefinition.from_dict`: a missing or
    /// non-positive version becomes 1, a missing name becomes "Unnamed
    /// Cascade", non-object step rows are skipped rather than erroring.
    #[must_use]
    pub fn from_value(data: &serde_json::Value) -> Self {
        let version = data.get("version").and_then(|v| v.as_u64()).filter(|v| *v > 0).unwrap_or(1) as u32;
        let name = data
            .get("name")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .unwrap_or("Unnamed Cascade")
            .to_string();
        let steps = data
            .get("steps")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter(|row| row.is_object()).map(CascadeStep::from_value).collect())
            .unwrap_or_default();
        let default_out_dir = data
            .get("default_out_dir")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .trim()
            .to_string();

        Self {
            version,
            name,
            steps,
            default_out_dir,
            created_at: data.get("created_at").and_then(serde_json::Value::as_f64),
            updated_at: data.get("updated_at").and_then(serde_json::Value::as_f64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_from_value_defaults_missing_optional_fields() {
        let step = CascadeStep::from_value(&serde_json::json!({"title": "Plan"}));
        assert_eq!(step.title, "Plan");
        assert_eq!(step.output_type, OutputType::Text);
        assert!(step.output_schema_kind.is_none());
        assert!(step.expected_out_files.is_empty());
    }

    #[test]
    fn step_from_value_normalizes_invalid_output_schema_kind() {
        let step = CascadeStep::from_value(&serde_json::json!({"output_schema_kind": "bogus"}));
        assert!(step.output_schema_kind.is_none());
    }

    #[test]
    fn definition_from_value_falls_back_on_bad_version() {
        let def = CascadeDefinition::from_value(&serde_json::json!({"version": -3, "steps": []}));
        assert_eq!(def.version, 1);
        assert_eq!(def.name, "Unnamed Cascade");
    }

    #[test]
    fn definition_from_value_skips_non_object_step_rows() {
        let def = CascadeDefinition::from_value(&serde_json::json!({
            "name": "demo",
            "steps": [{"title": "a"}, "not an object", 42],
        }));
        assert_eq!(def.steps.len(), 1);
    }
}
