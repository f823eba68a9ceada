//! JCS (RFC 8785) canonical JSON emission.
//!
//! Used for every on-disk JSON contract that needs a deterministic byte
//! representation: receipts, run state, capability cache, price table cache.
//! Field order in the source struct never affects the emitted bytes.

use anyhow::{Context, Result};
use serde::Serialize;

pub fn emit_jcs<T: Serialize>(value: &T) -> Result<String> {
    let json_value =
        serde_json::to_value(value).with_context(|| "Failed to serialize value to JSON")?;
    let json_bytes = serde_json_canonicalizer::to_vec(&json_value)
        .with_context(|| "Failed to canonicalize JSON using JCS")?;
    String::from_utf8(json_bytes).with_context(|| "JCS output contained invalid UTF-8")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;
    use serde_json::json;

    #[derive(Serialize)]
    struct Example {
        b: i32,
        a: i32,
    }

    #[test]
    fn field_order_is_irrelevant() {
        let a = emit_jcs(&Example { b: 1, a: 2 }).unwrap();
        let b = emit_jcs(&json!({"a": 2, "b": 1})).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn is_deterministic_across_calls() {
        let v = json!({"z": 1, "a": {"y": 2, "x": 1}});
        assert_eq!(emit_jcs(&v).unwrap(), emit_jcs(&v).unwrap());
    }
}
