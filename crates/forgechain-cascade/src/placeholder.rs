//! Typed placeholder token interpreter (§4.10 step 1, Design Note §9).
//!
//! A standalone tokenizer/parser/resolver rather than the original's single
//! `re.sub` with an inline closure (`cascade_pipeline.py::_resolve_text`):
//! one regex finds `{{...}}` spans, each span parses into a [`Token`], and
//! resolution against a [`StepContext`] errors on anything unresolved or
//! malformed instead of leaving the placeholder text verbatim in output.

use forgechain_utils::error::ForgeError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

static PLACEHOLDER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*step\.(\d+)\.(response_id|json|out_file_path|out_file_id)(?::([^}]+))?\s*\}\}").unwrap()
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    ResponseId { step: u32 },
    Json { step: u32 },
    OutFilePath { step: u32, rel: String },
    OutFileId { step: u32, rel: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlaceholderError {
    #[error("malformed placeholder token: {0}")]
    Malformed(String),
    #[error("unresolved placeholder: step {step} has no {field}")]
    Unresolved { step: u32, field: &'static str },
    #[error("out_file placeholder references unknown path {rel:?} for step {step}")]
    UnknownOutFile { step: u32, rel: String },
}

impl From<PlaceholderError> for ForgeError {
    fn from(e: PlaceholderError) -> Self {
        ForgeError::Contract(e.to_string())
    }
}

/// Accumulated, fully-resolved state for completed steps, keyed by 1-based
/// step index.
#[derive(Debug, Clone, Default)]
pub struct StepContext {
    response_ids: HashMap<u32, String>,
    json_values: HashMap<u32, serde_json::Value>,
    out_files: HashMap<(u32, String), (PathBuf, String)>,
}

impl StepContext {
    pub fn set_response_id(&mut self, step: u32, response_id: impl Into<String>) {
        self.response_ids.insert(step, response_id.into());
    }

    pub fn set_json(&mut self, step: u32, value: serde_json::Value) {
        self.json_values.insert(step, value);
    }

    pub fn set_out_file(&mut self, step: u32, rel: impl Into<String>, abs_path: PathBuf, file_id: impl Into<String>) {
        self.out_files.insert((step, rel.into()), (abs_path, file_id.into()));
    }
}

fn parse_token(step: u32, kind: &str, arg: Option<&str>) -> Result<Token, PlaceholderError> {
    match (kind, arg) {
        ("response_id", None) => Ok(Token::ResponseId { step }),
        ("json", None) => Ok(Token::Json { step }),
        ("out_file_path", Some(rel)) => Ok(Token::OutFilePath { step, rel: rel.to_string() }),
        ("out_file_id", Some(rel)) => Ok(Token::OutFileId { step, rel: rel.to_string() }),
        _ => Err(PlaceholderError::Malformed(format!("step.{step}.{kind}"))),
    }
}

fn resolve_token(token: &Token, ctx: &StepContext) -> Result<String, PlaceholderError> {
    match token {
        Token::ResponseId { step } => ctx
            .response_ids
            .get(step)
            .cloned()
            .ok_or(PlaceholderError::Unresolved { step: *step, field: "response_id" }),
        Token::Json { step } => {
            let value = ctx
                .json_values
                .get(step)
                .ok_or(PlaceholderError::Unresolved { step: *step, field: "json" })?;
            Ok(match value {
                serde_json::Value::String(s) => s.clone(),
                other => serde_json::to_string(other).unwrap_or_default(),
            })
        }
        Token::OutFilePath { step, rel } => ctx
            .out_files
            .get(&(*step, rel.clone()))
            .map(|(path, _)| path.display().to_string())
            .ok_or_else(|| PlaceholderError::UnknownOutFile { step: *step, rel: rel.clone() }),
        Token::OutFileId { step, rel } => ctx
            .out_files
            .get(&(*step, rel.clone()))
            .map(|(_, id)| id.clone())
            .ok_or_else(|| PlaceholderError::UnknownOutFile { step: *step, rel: rel.clone() }),
    }
}

/// Resolve every `{{step.N....}}` token found in `text` against `ctx`.
/// Empty input returns empty output (matches the original's falsy-text
/// short-circuit). Any unresolved or malformed token is an error.
pub fn resolve_text(text: &str, ctx: &StepContext) -> Result<String, PlaceholderError> {
    if text.is_empty() {
        return Ok(String::new());
    }

    let mut err: Option<PlaceholderError> = None;
    let replaced = PLACEHOLDER_RE.replace_all(text, |caps: &regex::Captures| {
        if err.is_some() {
            return String::new();
        }
        let step: u32 = caps[1].parse().unwrap_or(0);
        let kind = &caps[2];
        let arg = caps.get(3).map(|m| m.as_str());
        match parse_token(step, kind, arg).and_then(|tok| resolve_token(&tok, ctx)) {
            Ok(s) => s,
            Err(e) => {
                err = Some(e);
                String::new()
            }
        }
    });

    if let Some(e) = err {
        return Err(e);
    }
    Ok(replaced.into_owned())
}

/// Recursively resolve placeholders inside every string leaf of a JSON
/// value, matching `_resolve_json`'s object/array/string walk.
pub fn resolve_json(value: &serde_json::Value, ctx: &StepContext) -> Result<serde_json::Value, PlaceholderError> {
    match value {
        serde_json::Value::String(s) => Ok(serde_json::Value::String(resolve_text(s, ctx)?)),
        serde_json::Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(resolve_json(item, ctx)?);
            }
            Ok(serde_json::Value::Array(out))
        }
        serde_json::Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), resolve_json(v, ctx)?);
            }
            Ok(serde_json::Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_response_id_and_json_tokens() {
        let mut ctx = StepContext::default();
        ctx.set_response_id(1, "resp_123");
        ctx.set_json(1, serde_json::json!({"a": 1}));

        let out = resolve_text("id={{step.1.response_id}} json={{ step.1.json }}", &ctx).unwrap();
        assert_eq!(out, r#"id=resp_123 json={"a":1}"#);
    }

    #[test]
    fn resolves_out_file_placeholders() {
        let mut ctx = StepContext::default();
        ctx.set_out_file(2, "src/a.txt", PathBuf::from("/out/src/a.txt"), "file_abc");

        let out = resolve_text("{{step.2.out_file_id:src/a.txt}}", &ctx).unwrap();
        assert_eq!(out, "file_abc");
        let out_path = resolve_text("{{step.2.out_file_path:src/a.txt}}", &ctx).unwrap();
        assert_eq!(out_path, "/out/src/a.txt");
    }

    #[test]
    fn unresolved_token_is_an_error() {
        let ctx = StepContext::default();
        let err = resolve_text("{{step.1.response_id}}", &ctx).unwrap_err();
        assert!(matches!(err, PlaceholderError::Unresolved { step: 1, field: "response_id" }));
    }

    #[test]
    fn unknown_out_file_reference_is_an_error() {
        let ctx = StepContext::default();
        let err = resolve_text("{{step.1.out_file_id:missing.txt}}", &ctx).unwrap_err();
        assert!(matches!(err, PlaceholderError::UnknownOutFile { .. }));
    }

    #[test]
    fn empty_text_short_circuits() {
        let ctx = StepContext::default();
        assert_eq!(resolve_text("", &ctx).unwrap(), "");
    }

    #[test]
    fn resolve_json_walks_nested_structures() {
        let mut ctx = StepContext::default();
        ctx.set_response_id(1, "r1");
        let value = serde_json::json!({"nested": ["{{step.1.response_id}}", {"k": "{{step.1.response_id}}"}]});
        let resolved = resolve_json(&value, &ctx).unwrap();
        assert_eq!(resolved["nested"][0], "r1");
        assert_eq!(resolved["nested"][1]["k"], "r1");
    }

    #[test]
    fn text_without_placeholders_is_unchanged() {
        let ctx = StepContext::default();
        assert_eq!(resolve_text("plain text, no tokens", &ctx).unwrap(), "plain text, no tokens");
    }
}
