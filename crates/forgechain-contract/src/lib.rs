//! Strict JSON contract enforcement for model responses (§4.3).
//!
//! Ports `contracts.py`'s `extract_text_from_response` / `parse_json_strict`
//! / `validate_paths`. A model response is never trusted shape-first: text is
//! pulled out of whatever envelope the backend returned, the extracted text
//! must parse as a single JSON object, and every path inside the `files[]`
//! array must be a clean relative path before anything gets written to disk.

use forgechain_utils::error::ForgeError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::HashSet;

/// Pull the model's text output out of whichever response envelope shape it
/// arrived in, falling back from most to least specific.
#[must_use]
pub fn extract_text_from_response(resp: &Value) -> String {
    if let Some(s) = resp.get("output_text").and_then(Value::as_str) {
        return s.to_string();
    }

    if let Some(out) = resp.get("output").and_then(Value::as_array) {
        let mut texts = Vec::new();
        for item in out {
            let Some(content) = item.get("content").and_then(Value::as_array) else {
                continue;
            };
            for c in content {
                let is_text_block =
                    matches!(c.get("type").and_then(Value::as_str), Some("output_text" | "text"));
                if !is_text_block {
                    continue;
                }
                if let Some(t) = c.get("text").and_then(Value::as_str) {
                    texts.push(t.to_string());
                } else if let Some(t) = c.get("content").and_then(Value::as_str) {
                    texts.push(t.to_string());
                }
            }
        }
        if !texts.is_empty() {
            return texts.join("\n");
        }
    }

    for key in ["text", "content", "message"] {
        if let Some(s) = resp.get(key).and_then(Value::as_str) {
            return s.to_string();
        }
    }

    serde_json::to_string(resp).unwrap_or_default()
}

static JSON_OBJECT_SPAN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)(\{.*\})").expect("static regex"));

/// Parse `text` as a single JSON object, tolerating surrounding prose by
/// falling back to the first `{...}` span found. Any other shape (array,
/// scalar, unparsable) is a contract violation.
pub fn parse_json_strict(text: &str) -> Result<Value, ForgeError> {
    let trimmed = text.trim();

    if let Ok(parsed) = serde_json::from_str::<Value>(trimmed) {
        return match parsed {
            Value::Object(_) => Ok(parsed),
            _ => Err(ForgeError::Contract("Response JSON must be an object.".into())),
        };
    }

    if let Some(caps) = JSON_OBJECT_SPAN.captures(trimmed) {
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&caps[1]) {
            return Ok(Value::Object(map));
        }
    }

    Err(ForgeError::Contract("Response is not valid JSON (strict contract violated).".into()))
}

/// Validate every `path` field inside a `files[]` array: relative, no `..`
/// segment, no backslash, no duplicates. Mirrors the sandboxed-path rules in
/// [`forgechain_utils::paths`] but operates on the raw contract JSON before a
/// [`forgechain_utils::paths::SandboxRoot`] is even constructed.
pub fn validate_paths(files: &[Value]) -> Result<(), ForgeError> {
    let mut seen = HashSet::new();

    for f in files {
        let path = f.get("path").and_then(Value::as_str).filter(|s| !s.is_empty());
        let Some(path) = path else {
            return Err(ForgeError::PathViolation("Invalid path in files[]".into()));
        };

        if path.starts_with('/') || path.starts_with('\\') {
            return Err(ForgeError::PathViolation(format!("Path must be relative: {path}")));
        }
        if path.split('/').any(|segment| segment == "..") {
            return Err(ForgeError::PathViolation(format!("Path cannot contain '..': {path}")));
        }
        if path.contains('\\') {
            return Err(ForgeError::PathViolation(format!("Path cannot contain \\: {path}")));
        }
        if !seen.insert(path) {
            return Err(ForgeError::PathViolation(format!("Duplicate path: {path}")));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_output_text_field() {
        let resp = json!({"output_text": "hello"});
        assert_eq!(extract_text_from_response(&resp), "hello");
    }

    #[test]
    fn extracts_from_nested_output_blocks() {
        let resp = json!({
            "output": [{"content": [{"type": "output_text", "text": "nested"}]}]
        });
        assert_eq!(extract_text_from_response(&resp), "nested");
    }

    #[test]
    fn parses_strict_object() {
        let v = parse_json_strict(r#"{"a": 1}"#).unwrap();
        assert_eq!(v["a"], 1);
    }

    #[test]
    fn recovers_object_from_surrounding_prose() {
        let v = parse_json_strict("Sure, here you go:\n{\"a\": 1}\nLet me know.").unwrap();
        assert_eq!(v["a"], 1);
    }

    #[test]
    fn rejects_non_object_json() {
        assert!(parse_json_strict("[1, 2, 3]").is_err());
    }

    #[test]
    fn rejects_unparsable_text() {
        assert!(parse_json_strict("not json at all").is_err());
    }

    #[test]
    fn validate_paths_rejects_absolute() {
        let files = vec![json!({"path": "/etc/passwd"})];
        assert!(validate_paths(&files).is_err());
    }

    #[test]
    fn validate_paths_rejects_traversal_and_backslash_and_dupes() {
        assert!(validate_paths(&[json!({"path": "../x"})]).is_err());
        assert!(validate_paths(&[json!({"path": "a\\b"})]).is_err());
        assert!(validate_paths(&[json!({"path": "a.rs"}), json!({"path": "a.rs"})]).is_err());
    }

    #[test]
    fn validate_paths_accepts_clean_relative_paths() {
        let files = vec![json!({"path": "src/lib.rs"}), json!({"path": "README.md"})];
        assert!(validate_paths(&files).is_ok());
    }
}
