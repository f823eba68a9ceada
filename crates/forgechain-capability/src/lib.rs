//! Model-capability probe and TTL-bounded cache (§4.1, Design Note §9).
//!
//! Ports `model_capabilities.py`'s `ModelCapabilities` / `ModelCapabilitiesCache`
//! / `ModelProbeWorker`. Capability flags are modeled as
//! [`forgechain_utils::types::Support`] rather than the original's
//! boolean-plus-errors-map shape; [`ModelCapabilities::to_legacy_json`] /
//! [`ModelCapabilities::from_legacy_json`] convert at the on-disk boundary so
//! the cache file format is unchanged.

use camino::Utf8Path;
use chrono::{DateTime, Utc};
use forgechain_client::{RemoteClient, split_text};
use forgechain_retry::{CircuitBreaker, RetryPolicy, with_retry};
use forgechain_utils::atomic_write::write_file_atomic;
use forgechain_utils::types::Support;
use std::collections::HashMap;
use std::path::PathBuf;

/// Heuristic from the original: only a schema/validation-style rejection
/// counts as "unsupported" — transient failures (429/5xx/network) must never
/// mark a capability false.
#[must_use]
pub fn err_indicates_param_unsupported(err: &str, param_name: &str) -> bool {
    if err.is_empty() {
        return false;
    }
    let e = err.to_lowercase();
    let key = param_name.to_lowercase();

    let needles = [
        format!("unknown parameter: {key}"),
        format!("unrecognized parameter: {key}"),
        format!("unexpected parameter: {key}"),
        format!("unsupported parameter: {key}"),
        "additional properties are not allowed".to_string(),
        "extra fields not permitted".to_string(),
        format!("'{key}' is not permitted"),
        format!("'{key}' was unexpected"),
        format!("{key} is not allowed"),
        format!("{key} is not supported"),
        "invalid request".to_string(),
    ];
    if needles.iter().any(|n| e.contains(n.as_str())) && e.contains(&key) {
        return true;
    }

    e.contains(&key)
        && (e.contains("unknown") || e.contains("unrecognized") || e.contains("unsupported"))
        && (e.contains("parameter") || e.contains("field"))
}

/// One model's probed capability record (§3).
#[derive(Debug, Clone)]
pub struct ModelCapabilities {
    pub model: String,
    pub tested_at: DateTime<Utc>,
    pub ok_basic: bool,
    pub supports_previous_response_id: Support,
    pub supports_temperature: Support,
    pub supports_tools: Support,
    pub supports_file_search: Support,
    pub supports_vector_store: Support,
    pub notes: String,
    pub errors: HashMap<String, String>,
}

impl ModelCapabilities {
    /// Convert to the legacy on-disk shape: every `supports_*` field becomes
    /// a plain bool, with `Inconclusive` reasons folded into `errors` via the
    /// `inconclusive:` prefix convention ([`Support::into_legacy`]).
    #[must_use]
    pub fn to_legacy_json(&self) -> serde_json::Value {
        let mut errors = self.errors.clone();
        let mut flag = |field: &str, support: Support| -> bool {
            let (b, reason) = support.into_legacy();
            if let Some(r) = reason {
                errors.insert(field.to_string(), r);
            }
            b
        };

        serde_json::json!({
            "model": self.model,
            "tested_at": self.tested_at.timestamp() as f64,
            "ok_basic": self.ok_basic,
            "supports_previous_response_id": flag("previous_response_id", self.supports_previous_response_id.clone()),
            "supports_temperature": flag("temperature", self.supports_temperature.clone()),
            "supports_tools": flag("tools", self.supports_tools.clone()),
            "supports_file_search": flag("file_search", self.supports_file_search.clone()),
            "supports_vector_store": flag("vector_store", self.supports_vector_store.clone()),
            "notes": self.notes,
            "errors": errors,
        })
    }

    #[must_use]
    pub fn from_legacy_json(value: &serde_json::Value) -> Self {
        let errors: HashMap<String, String> = value
            .get("errors")
            .and_then(|v| v.as_object())
            .map(|m| m.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))).collect())
            .unwrap_or_default();

        let support_of = |field: &str, bool_key: &str, default: bool| -> Support {
            let b = value.get(bool_key).and_then(|v| v.as_bool()).unwrap_or(default);
            Support::from_legacy(b, errors.get(field).map(String::as_str))
        };

        Self {
            model: value.get("model").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            tested_at: value
                .get("tested_at")
                .and_then(|v| v.as_f64())
                .and_then(|ts| DateTime::from_timestamp(ts as i64, 0))
                .unwrap_or_else(Utc::now),
            ok_basic: value.get("ok_basic").and_then(|v| v.as_bool()).unwrap_or(false),
            supports_previous_response_id: support_of(
                "previous_response_id",
                "supports_previous_response_id",
                true,
            ),
            supports_temperature: support_of("temperature", "supports_temperature", true),
            supports_tools: support_of("tools", "supports_tools", false),
            supports_file_search: support_of("file_search", "supports_file_search", false),
            supports_vector_store: support_of("vector_store", "supports_vector_store", false),
            notes: value.get("notes").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            errors,
        }
    }
}

/// On-disk, TTL-bounded capability cache. Sole writer is the prober (§5).
pub struct ModelCapabilitiesCache {
    path: PathBuf,
    data: HashMap<String, ModelCapabilities>,
}

impl ModelCapabilitiesCache {
    #[must_use]
    pub fn new(path: &Utf8Path) -> Self {
        Self { path: path.as_std_path().to_path_buf(), data: HashMap::new() }
    }

    fn force_refresh_marker(&self) -> PathBuf {
        let mut marker = self.path.clone().into_os_string();
        marker.push(".force_refresh");
        PathBuf::from(marker)
    }

    /// Load the cache, honoring a force-refresh marker (removes the marker
    /// and the stale cache file, then starts fresh).
    pub fn load(&mut self) -> anyhow::Result<()> {
        self.data.clear();

        let marker = self.force_refresh_marker();
        if marker.is_file() {
            let _ = std::fs::remove_file(&marker);
            let _ = std::fs::remove_file(&self.path);
            return Ok(());
        }

        if !self.path.exists() {
            return Ok(());
        }

        let text = match std::fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(_) => return Ok(()),
        };
        let root: serde_json::Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(_) => return Ok(()),
        };

        if let Some(models) = root.get("models").and_then(|v| v.as_object()) {
            for (model_id, obj) in models {
                self.data.insert(model_id.clone(), ModelCapabilities::from_legacy_json(obj));
            }
        }
        Ok(())
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let models: serde_json::Map<String, serde_json::Value> =
            self.data.iter().map(|(k, v)| (k.clone(), v.to_legacy_json())).collect();
        let root = serde_json::json!({
            "version": 2,
            "saved_at": Utc::now().timestamp() as f64,
            "models": models,
        });
        let path = Utf8Path::from_path(&self.path).ok_or_else(|| anyhow::anyhow!("non-UTF-8 cache path"))?;
        write_file_atomic(path, &serde_json::to_string_pretty(&root)?)?;
        Ok(())
    }

    #[must_use]
    pub fn get(&self, model: &str) -> Option<&ModelCapabilities> {
        self.data.get(model)
    }

    pub fn upsert(&mut self, caps: ModelCapabilities) {
        self.data.insert(caps.model.clone(), caps);
    }

    #[must_use]
    pub fn is_stale(&self, model: &str, ttl_hours: f64) -> bool {
        let Some(caps) = self.get(model) else { return true };
        if ttl_hours <= 0.0 {
            return false;
        }
        let age = Utc::now().signed_duration_since(caps.tested_at);
        age.num_seconds() as f64 > ttl_hours * 3600.0
    }

    #[must_use]
    pub fn missing_or_stale(&self, models: &[String], ttl_hours: f64) -> Vec<String> {
        models.iter().filter(|m| self.is_stale(m, ttl_hours)).cloned().collect()
    }
}

fn instructions_for(contract: &str) -> String {
    format!("Return ONLY valid JSON: {{\"contract\":\"{contract}\",\"ok\":true}}. No extra text.")
}

fn input_parts(text: &str) -> serde_json::Value {
    let chunks = split_text(text, 20_000);
    let parts: Vec<serde_json::Value> = chunks
        .into_iter()
        .map(|chunk| {
            serde_json::json!({
                "type": "message",
                "role": "user",
                "content": [{"type": "input_text", "text": chunk}],
            })
        })
        .collect();
    serde_json::Value::Array(parts)
}

async fn try_response(
    client: &dyn RemoteClient,
    policy: &RetryPolicy,
    breaker: &mut CircuitBreaker,
    payload: serde_json::Value,
) -> (bool, Option<serde_json::Value>, Option<String>) {
    let result = with_retry(
        || {
            let payload = payload.clone();
            async move { client.create_response(payload).await }
        },
        policy,
        Some(breaker),
        |_| false,
    )
    .await;

    match result {
        Ok(resp) => (true, Some(resp), None),
        Err(e) => (false, None, Some(e.to_string())),
    }
}

/// Probe one model across basic call, `previous_response_id` continuity,
/// `temperature`, and `tools`/`file_search` (when `vector_store_id` is set).
pub async fn probe_one(
    client: &dyn RemoteClient,
    policy: &RetryPolicy,
    breaker: &mut CircuitBreaker,
    model_id: &str,
    vector_store_id: Option<&str>,
) -> ModelCapabilities {
    let mut errors = HashMap::new();

    let basic_payload = serde_json::json!({
        "model": model_id,
        "instructions": instructions_for("CAP_PING"),
        "input": input_parts("ping"),
    });
    let (ok_basic, resp1, err1) = try_response(client, policy, breaker, basic_payload).await;

    if !ok_basic {
        errors.insert("basic".to_string(), err1.unwrap_or_else(|| "unknown".to_string()));
        return ModelCapabilities {
            model: model_id.to_string(),
            tested_at: Utc::now(),
            ok_basic: false,
            supports_previous_response_id: Support::Yes,
            supports_temperature: Support::No("basic call failed".to_string()),
            supports_tools: Support::No("basic call failed".to_string()),
            supports_file_search: Support::No("basic call failed".to_string()),
            supports_vector_store: Support::No("basic call failed".to_string()),
            notes: "basic call failed".to_string(),
            errors,
        };
    }

    let resp1_id = resp1.as_ref().and_then(|r| r.get("id")).and_then(|v| v.as_str()).unwrap_or_default().to_string();

    let mut supports_prev = Support::Yes;
    if !resp1_id.is_empty() {
        let payload = serde_json::json!({
            "model": model_id,
            "instructions": instructions_for("CAP_PREV"),
            "input": input_parts("pong"),
            "previous_response_id": resp1_id,
        });
        let (ok_prev, _, err_prev) = try_response(client, policy, breaker, payload).await;
        if !ok_prev {
            if let Some(err) = err_prev {
                if err_indicates_param_unsupported(&err, "previous_response_id") {
                    supports_prev = Support::No(err.clone());
                    errors.insert("previous_response_id_param".to_string(), err);
                } else {
                    errors.insert("previous_response_id_inconclusive".to_string(), err);
                }
            }
        }
    }

    let mut supports_temp = Support::Yes;
    let temp_payload = serde_json::json!({
        "model": model_id,
        "temperature": 1.1,
        "instructions": instructions_for("CAP_TEMP"),
        "input": input_parts("temp"),
    });
    let (ok_temp, _, err_temp) = try_response(client, policy, breaker, temp_payload).await;
    if !ok_temp {
        if let Some(err) = err_temp {
            if err_indicates_param_unsupported(&err, "temperature") {
                supports_temp = Support::No(err.clone());
                errors.insert("temperature_param".to_string(), err);
            } else {
                errors.insert("temperature_inconclusive".to_string(), err);
            }
        }
    }

    let mut supports_tools = Support::No("file_search not probed".to_string());
    let mut supports_file_search = Support::No("file_search not probed".to_string());
    if let Some(vs_id) = vector_store_id {
        let tools_payload = serde_json::json!({
            "model": model_id,
            "instructions": "Try to use file_search tool. Return ONLY valid JSON: {\"contract\":\"CAP_TOOLS\",\"ok\":true}. No extra text.",
            "input": input_parts("Search in files for the word NEEDLE and confirm you used file_search."),
            "tools": [{"type": "file_search", "vector_store_ids": [vs_id]}],
        });
        let (ok_tools, _, err_tools) = try_response(client, policy, breaker, tools_payload).await;
        if ok_tools {
            supports_tools = Support::Yes;
            supports_file_search = Support::Yes;
        } else if let Some(err) = err_tools {
            if err_indicates_param_unsupported(&err, "tools") {
                supports_tools = Support::No(err.clone());
                supports_file_search = Support::No(err.clone());
                errors.insert("tools_param".to_string(), err);
            } else {
                supports_tools = Support::Inconclusive(err.clone());
                supports_file_search = Support::Inconclusive(err.clone());
                errors.insert("tools_inconclusive".to_string(), err);
            }
        }
    }

    ModelCapabilities {
        model: model_id.to_string(),
        tested_at: Utc::now(),
        ok_basic: true,
        supports_previous_response_id: supports_prev,
        supports_temperature: supports_temp,
        supports_tools: supports_tools.clone(),
        supports_file_search: supports_file_search.clone(),
        supports_vector_store: supports_file_search,
        notes: "ok".to_string(),
        errors,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn param_unsupported_heuristic_matches_schema_rejection() {
        assert!(err_indicates_param_unsupported(
            "Unknown parameter: 'temperature'",
            "temperature"
        ));
        assert!(!err_indicates_param_unsupported("502 Bad Gateway", "temperature"));
    }

    #[test]
    fn legacy_round_trip_preserves_inconclusive_reason() {
        let caps = ModelCapabilities {
            model: "gpt-4o".to_string(),
            tested_at: Utc::now(),
            ok_basic: true,
            supports_previous_response_id: Support::Yes,
            supports_temperature: Support::Inconclusive("timeout".to_string()),
            supports_tools: Support::No("rejected".to_string()),
            supports_file_search: Support::No("rejected".to_string()),
            supports_vector_store: Support::No("rejected".to_string()),
            notes: "ok".to_string(),
            errors: HashMap::new(),
        };
        let json = caps.to_legacy_json();
        let back = ModelCapabilities::from_legacy_json(&json);
        assert_eq!(back.supports_temperature, Support::Inconclusive("timeout".to_string()));
        assert_eq!(back.supports_tools, Support::No("rejected".to_string()));
    }

    #[test]
    fn cache_is_stale_when_absent_and_respects_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let path = camino::Utf8PathBuf::from_path_buf(dir.path().join("caps.json")).unwrap();
        let cache = ModelCapabilitiesCache::new(&path);
        assert!(cache.is_stale("gpt-4o", 24.0));
    }

    #[test]
    fn cache_save_and_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = camino::Utf8PathBuf::from_path_buf(dir.path().join("caps.json")).unwrap();
        let mut cache = ModelCapabilitiesCache::new(&path);
        cache.upsert(ModelCapabilities {
            model: "gpt-4o".to_string(),
            tested_at: Utc::now(),
            ok_basic: true,
            supports_previous_response_id: Support::Yes,
            supports_temperature: Support::Yes,
            supports_tools: Support::Yes,
            supports_file_search: Support::Yes,
            supports_vector_store: Support::Yes,
            notes: "ok".to_string(),
            errors: HashMap::new(),
        });
        cache.save().unwrap();

        let mut reloaded = ModelCapabilitiesCache::new(&path);
        reloaded.load().unwrap();
        assert!(reloaded.get("gpt-4o").is_some());
        assert!(!reloaded.is_stale("gpt-4o", 24.0));
    }
}
