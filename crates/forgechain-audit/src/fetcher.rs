//! Pricing refresh via a model fallback when the URL source is unreachable
//! and an API key is available (§4.6 step 1).
//!
//! Ports `pricing_fetcher.py`'s `PricingFetcher`.

use forgechain_pricing::PriceRow;
use serde_json::{Value, json};

pub const DEFAULT_MODEL: &str = "gpt-4.1";

const INSTRUCTIONS: &str = "Return ONLY valid JSON with field 'rows' (list). \
Each row: {\"model\":\"string\",\"input_per_1k\":float,\"output_per_1k\":float,\
\"batch_input_per_1k\":float|null,\"batch_output_per_1k\":float|null,\
\"file_search_per_1k\":float|null,\"storage_per_gb_day\":float|null}. \
Use USD prices for current OpenAI production models. No commentary.";

/// Request body for a Responses-API call asking the model to produce a
/// pricing table, used only when the URL refresh has already failed.
#[must_use]
pub fn payload() -> Value {
    json!({
        "model": DEFAULT_MODEL,
        "instructions": INSTRUCTIONS,
        "input": [
            {
                "type": "message",
                "role": "user",
                "content": [
                    {"type": "input_text", "text": "Give me the current OpenAI API pricing table."}
                ],
            }
        ],
    })
}

/// Extract `PriceRow`s from the first non-empty text part that parses as
/// `{"rows": [...]}` with at least one recognizable row. Later text parts
/// are ignored once one has yielded rows, matching the original's
/// first-hit-wins loop.
#[must_use]
pub fn parse_response(resp: &Value) -> Vec<PriceRow> {
    for text in extract_text_parts(resp) {
        if text.is_empty() {
            continue;
        }
        let Ok(parsed) = serde_json::from_str::<Value>(&text) else { continue };
        let Some(rows) = parsed.get("rows").and_then(Value::as_array) else { continue };
        let price_rows: Vec<PriceRow> = rows.iter().filter_map(PriceRow::from_value).collect();
        if !price_rows.is_empty() {
            return price_rows;
        }
    }
    Vec::new()
}

fn extract_text_parts(resp: &Value) -> Vec<String> {
    let mut parts = Vec::new();
    if let Some(output) = resp.get("output").and_then(Value::as_array) {
        for msg in output {
            let Some(content) = msg.get("content").and_then(Value::as_array) else { continue };
            for part in content {
                if let Some(text) = part.get("text").and_then(Value::as_str) {
                    parts.push(text.to_string());
                }
            }
        }
    }
    if parts.is_empty() {
        if let Some(text) = resp.get("text").and_then(Value::as_str) {
            parts.push(text.to_string());
        }
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_response_reads_rows_from_output_content() {
        let resp = json!({
            "output": [
                {"content": [{"text": "{\"rows\":[{\"model\":\"gpt-4o\",\"input_per_1k\":5.0,\"output_per_1k\":15.0}]}"}]}
            ]
        });
        let rows = parse_response(&resp);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].model, "gpt-4o");
    }

    #[test]
    fn parse_response_falls_back_to_top_level_text() {
        let resp = json!({"text": "{\"rows\":[{\"model\":\"gpt-4o-mini\",\"input_per_1k\":0.15,\"output_per_1k\":0.6}]}"});
        let rows = parse_response(&resp);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].model, "gpt-4o-mini");
    }

    #[test]
    fn parse_response_returns_empty_on_garbage() {
        let resp = json!({"output": [{"content": [{"text": "not json"}]}]});
        assert!(parse_response(&resp).is_empty());
    }

    #[test]
    fn payload_carries_the_default_model_and_instructions() {
        let body = payload();
        assert_eq!(body["model"], DEFAULT_MODEL);
        assert!(body["instructions"].as_str().unwrap().contains("rows"));
    }
}
