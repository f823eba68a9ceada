//! Request-shaping helpers ported from `pipeline.py`'s `_input_parts`,
//! `_payload_base`, and the `_io_reference_note`/`_append_io_reference*`
//! family (§4.9).

use forgechain_client::split_text;
use serde_json::{Value, json};

/// Build Responses-API `input`: one `message`/`user` part per ≤20,000-char
/// chunk of `text`, with every `file_id` attached as an `input_file` part
/// on the *first* chunk only.
#[must_use]
pub fn input_parts(text: &str, file_ids: &[String]) -> Vec<Value> {
    let chunks = split_text(text, 20_000);
    chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| {
            let mut content = vec![json!({"type": "input_text", "text": chunk})];
            if i == 0 {
                for fid in file_ids {
                    content.push(json!({"type": "input_file", "file_id": fid}));
                }
            }
            json!({"type": "message", "role": "user", "content": content})
        })
        .collect()
}

/// Base request body shared by every call site: model, instructions, input,
/// plus `temperature` (when the model's capability record doesn't flag it
/// unsupported) and `previous_response_id` (when chaining).
#[must_use]
pub fn payload_base(
    model: &str,
    instructions: &str,
    input: Vec<Value>,
    prev_id: Option<&str>,
    temperature: f64,
    supports_temperature: bool,
) -> Value {
    let mut payload = json!({
        "model": model,
        "instructions": instructions,
        "input": input,
    });
    if supports_temperature {
        payload["temperature"] = json!(temperature);
    }
    if let Some(id) = prev_id {
        if !id.is_empty() {
            payload["previous_response_id"] = json!(id);
        }
    }
    payload
}

/// `DATA REFERENCE:` block naming uploaded file ids and attached vector
/// store ids, appended to prompts/instructions so a model that can use
/// `input_file`/`file_search` knows what's available to it.
#[must_use]
pub fn io_reference_note(file_ids: &[String], vector_store_ids: &[String]) -> String {
    let ids: Vec<&str> = file_ids.iter().map(String::as_str).filter(|s| !s.is_empty()).collect();
    let vs_ids: Vec<&str> = vector_store_ids.iter().map(String::as_str).filter(|s| !s.is_empty()).collect();
    if ids.is_empty() && vs_ids.is_empty() {
        return String::new();
    }
    let mut parts = vec!["DATA REFERENCE:".to_string()];
    if !ids.is_empty() {
        parts.push(format!("Files API file_id: {}", ids.join(", ")));
        parts.push("If the model supports input_file, use these file_id values as input_file.".to_string());
    }
    if !vs_ids.is_empty() {
        parts.push(format!("Vector store id: {}", vs_ids.join(", ")));
        parts.push("If the model supports file_search, use file_search over the listed vector store(s).".to_string());
    }
    parts.join("\n")
}

/// Append [`io_reference_note`] to `text` unless it's already present or
/// there's nothing to reference.
#[must_use]
pub fn append_io_reference(text: &str, file_ids: &[String], vector_store_ids: &[String]) -> String {
    let note = io_reference_note(file_ids, vector_store_ids);
    if note.is_empty() || text.contains(&note) {
        text.to_string()
    } else {
        format!("{text}\n\n{note}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_parts_attaches_file_ids_to_first_chunk_only() {
        let long = "x".repeat(25_000);
        let parts = input_parts(&long, &["file_1".to_string()]);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0]["content"].as_array().unwrap().len(), 2);
        assert_eq!(parts[1]["content"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn payload_base_omits_temperature_when_unsupported() {
        let body = payload_base("gpt-4o", "do it", vec![], None, 0.2, false);
        assert!(body.get("temperature").is_none());
    }

    #[test]
    fn payload_base_includes_previous_response_id_when_present() {
        let body = payload_base("gpt-4o", "do it", vec![], Some("resp_1"), 0.2, true);
        assert_eq!(body["previous_response_id"], "resp_1");
        assert_eq!(body["temperature"], 0.2);
    }

    #[test]
    fn io_reference_note_empty_when_nothing_to_reference() {
        assert_eq!(io_reference_note(&[], &[]), "");
    }

    #[test]
    fn append_io_reference_is_idempotent() {
        let ids = vec!["f1".to_string()];
        let once = append_io_reference("hello", &ids, &[]);
        let twice = append_io_reference(&once, &ids, &[]);
        assert_eq!(once, twice);
    }
}
