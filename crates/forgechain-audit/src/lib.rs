//! Pricing reconciliation job (§4.6): scans `LOG/RUN_*` and `LOG/TEST_*`
//! directories, builds a receipt per response seen, and keeps the receipt
//! store's dedup index and the price table's freshness in sync.
//!
//! Ports `original_source/kajovo/core/pricing_audit.py`'s `PricingAuditor`.
//! Model-id/label inference, the GENERATE/MODIFY/QA/QFILE/C mode-flow
//! mapping, and the zero/meaningful-delta update rule mirror that file
//! field-for-field; the model-based pricing fallback mirrors
//! `pricing_fetcher.py` (see [`fetcher`]).

mod fetcher;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use forgechain_client::RemoteClient;
use forgechain_config::Settings;
use forgechain_pricing::{PriceTable, compute_cost};
use forgechain_receipt::{ExistingIndex, Receipt, ReceiptDb};
use forgechain_retry::{CircuitBreaker, RetryPolicy, is_transient_status, with_retry};
use forgechain_utils::error::ForgeError;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::Mutex;

pub use fetcher::{payload as fallback_pricing_payload, parse_response as parse_fallback_pricing_response};

/// Tally of one audit pass, serializable for CLI/JSON reporting.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditSummary {
    pub runs_scanned: u32,
    pub responses_seen: u32,
    pub inserted: u32,
    pub updated: u32,
    pub zero_usage: u32,
    pub missing_runs: u32,
    pub pricing_refresh: String,
    pub errors: Vec<String>,
}

struct BuiltReceipt {
    receipt: Receipt,
    zero_usage: bool,
}

struct RequestMeta {
    label: String,
    use_file_search: bool,
    mtime: f64,
}

fn is_transient(err: &ForgeError) -> bool {
    matches!(err, ForgeError::RemoteTransientExhausted(_))
        || matches!(
            err,
            ForgeError::RemoteRejection { status, .. }
                if is_transient_status(StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR))
        )
}

/// Scans run directories under a log root and reconciles them against a
/// receipt store, refreshing the price table first if it has gone stale.
pub struct PricingAuditor<'a> {
    settings: &'a Settings,
    db: &'a ReceiptDb,
    remote: Option<Arc<dyn RemoteClient>>,
    api_key: String,
    retry: RetryPolicy,
    breaker: Mutex<CircuitBreaker>,
}

impl<'a> PricingAuditor<'a> {
    #[must_use]
    pub fn new(
        settings: &'a Settings,
        db: &'a ReceiptDb,
        remote: Option<Arc<dyn RemoteClient>>,
        api_key: impl Into<String>,
    ) -> Self {
        let retry = RetryPolicy::from(&settings.retry);
        let breaker = Mutex::new(CircuitBreaker::from_policy(&retry));
        Self { settings, db, remote, api_key: api_key.into(), retry, breaker }
    }

    /// Run one full reconciliation pass: refresh pricing if stale, then scan
    /// every `RUN_*`/`TEST_*` directory under `log_dir` in lexical order.
    pub async fn audit(&self, price_table: &mut PriceTable, log_dir: &Utf8Path) -> AuditSummary {
        let mut summary = AuditSummary::default();
        self.refresh_pricing_if_needed(price_table, &mut summary).await;

        let mut idx = match self.db.existing_index() {
            Ok(idx) => idx,
            Err(e) => {
                summary.errors.push(format!("failed to load receipt index: {e}"));
                return summary;
            }
        };

        if !log_dir.is_dir() {
            summary.errors.push(format!("Log dir not found: {log_dir}"));
            return summary;
        }

        for run_dir in iter_run_dirs(log_dir) {
            summary.runs_scanned += 1;
            self.audit_run(price_table, &run_dir, &mut idx, &mut summary);
        }
        summary
    }

    async fn refresh_pricing_if_needed(&self, price_table: &mut PriceTable, summary: &mut AuditSummary) {
        let ttl_hours = self.settings.pricing.cache_ttl_hours;
        let elapsed = Utc::now().signed_duration_since(price_table.last_updated());
        let stale = ttl_hours == 0 || elapsed.num_milliseconds() as f64 / 1000.0 > f64::from(ttl_hours) * 3600.0;
        if !stale {
            return;
        }

        let url = self.settings.pricing.source_url.clone();
        if !url.is_empty() {
            let http = reqwest::Client::new();
            match price_table.refresh_from_url(&http, &url).await {
                Ok(()) => {
                    summary.pricing_refresh = "url".to_string();
                    tracing::info!("pricing refreshed from url");
                    return;
                }
                Err(e) => summary.errors.push(format!("Pricing refresh failed (url): {e}")),
            }
        }

        if self.api_key.is_empty() {
            summary.errors.push("Pricing refresh via model skipped (no API key)".to_string());
            return;
        }
        let Some(client) = self.remote.as_ref() else {
            summary.errors.push("Pricing refresh via model skipped (no remote client configured)".to_string());
            return;
        };

        let mut breaker = self.breaker.lock().await;
        let result = with_retry(
            || async { client.create_response(fetcher::payload()).await },
            &self.retry,
            Some(&mut breaker),
            is_transient,
        )
        .await;
        drop(breaker);

        match result {
            Ok(resp) => {
                let rows = fetcher::parse_response(&resp);
                if rows.is_empty() {
                    summary.errors.push("Pricing refresh via model returned empty rows.".to_string());
                } else {
                    let n = rows.len();
                    price_table.update_from_rows(rows, false, "GPT fallback");
                    summary.pricing_refresh = "model".to_string();
                    tracing::info!(rows = n, "pricing refreshed via model fallback");
                }
            }
            Err(e) => summary.errors.push(format!("Pricing refresh via model failed: {e}")),
        }
    }

    fn audit_run(&self, price_table: &PriceTable, run_dir: &Utf8Path, idx: &mut ExistingIndex, summary: &mut AuditSummary) {
        let run_state = load_run_state(run_dir);
        let req_meta = load_request_meta(run_dir);
        let resp_dir = run_dir.join("responses");

        let mut resp_files: Vec<Utf8PathBuf> = std::fs::read_dir(resp_dir.as_std_path())
            .into_iter()
            .flatten()
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().map(|ext| ext.eq_ignore_ascii_case("json")).unwrap_or(false))
            .filter_map(|p| Utf8PathBuf::from_path_buf(p).ok())
            .collect();

        if resp_files.is_empty() {
            match self.maybe_insert_fallback(idx, run_dir, &run_state) {
                Ok(n) => summary.missing_runs += n,
                Err(e) => summary.errors.push(format!("{run_dir}: {e}")),
            }
            return;
        }

        resp_files.sort_by(|a, b| {
            mtime_secs(a.as_std_path()).partial_cmp(&mtime_secs(b.as_std_path())).unwrap_or(std::cmp::Ordering::Equal)
        });

        for resp_path in resp_files {
            let text = match std::fs::read_to_string(resp_path.as_std_path()) {
                Ok(t) => t,
                Err(e) => {
                    summary.errors.push(format!("{run_dir}: failed to read {resp_path}: {e}"));
                    continue;
                }
            };
            let resp: Value = match serde_json::from_str(&text) {
                Ok(v) => v,
                Err(e) => {
                    summary.errors.push(format!("{run_dir}: failed to parse {resp_path}: {e}"));
                    continue;
                }
            };

            let built = build_receipt(price_table, run_dir, &run_state, &resp_path, &resp, &req_meta);
            summary.responses_seen += 1;
            if built.zero_usage {
                summary.zero_usage += 1;
            }
            match self.insert_or_update(idx, &built.receipt) {
                Ok("inserted") => summary.inserted += 1,
                Ok("updated") => summary.updated += 1,
                Ok(_) => {}
                Err(e) => summary.errors.push(format!("{run_dir}: {e}")),
            }
        }
    }

    fn maybe_insert_fallback(&self, idx: &mut ExistingIndex, run_dir: &Utf8Path, run_state: &Value) -> anyhow::Result<u32> {
        let run_id = run_dir.file_name().unwrap_or_default().to_string();
        if idx.run_ids.contains(&run_id) {
            return Ok(0);
        }
        let status = run_state.get("status").and_then(Value::as_str).unwrap_or("unknown").to_string();
        let receipt = Receipt {
            id: None,
            run_id: run_id.clone(),
            created_at: Utc::now(),
            project: run_state.get("project").and_then(Value::as_str).unwrap_or("UNKNOWN").to_string(),
            model: run_state.get("model").and_then(Value::as_str).unwrap_or("").to_string(),
            mode: run_state.get("mode").and_then(Value::as_str).unwrap_or("UNKNOWN").to_string(),
            flow_type: "FALLBACK".to_string(),
            response_id: None,
            batch_id: None,
            input_tokens: 0,
            output_tokens: 0,
            tool_cost: 0.0,
            storage_cost: 0.0,
            total_cost: 0.0,
            pricing_verified: false,
            notes: format!("Audit fallback (no responses; status={status})"),
            log_paths: vec![format!("run_dir={run_dir}")],
            usage: json!({"status": status}),
        };
        self.db.insert(&receipt)?;
        idx.run_ids.insert(run_id);
        Ok(1)
    }

    fn insert_or_update(&self, idx: &mut ExistingIndex, receipt: &Receipt) -> anyhow::Result<&'static str> {
        if let Some(response_id) = &receipt.response_id {
            if let Some((id, existing_total)) = idx.response_cost.get(response_id).copied() {
                return if needs_update(existing_total, receipt.total_cost) {
                    self.db.update_receipt(id, receipt)?;
                    idx.response_cost.insert(response_id.clone(), (id, receipt.total_cost));
                    Ok("updated")
                } else {
                    Ok("skipped")
                };
            }
        }
        if let Some(batch_id) = &receipt.batch_id {
            if let Some((id, existing_total)) = idx.batch_cost.get(batch_id).copied() {
                return if needs_update(existing_total, receipt.total_cost) {
                    self.db.update_receipt(id, receipt)?;
                    idx.batch_cost.insert(batch_id.clone(), (id, receipt.total_cost));
                    Ok("updated")
                } else {
                    Ok("skipped")
                };
            }
        }

        let row_id = self.db.insert(receipt)?;
        if let Some(r) = &receipt.response_id {
            idx.response_ids.insert(r.clone());
            idx.response_cost.insert(r.clone(), (row_id, receipt.total_cost));
        }
        if let Some(b) = &receipt.batch_id {
            idx.batch_ids.insert(b.clone());
            idx.batch_cost.insert(b.clone(), (row_id, receipt.total_cost));
        }
        idx.run_ids.insert(receipt.run_id.clone());
        Ok("inserted")
    }
}

/// Avoid zeroing out a receipt unless the new total is genuinely zero too;
/// otherwise update on any change larger than float noise.
fn needs_update(existing_total: f64, new_total: f64) -> bool {
    if existing_total == 0.0 && new_total != 0.0 {
        return true;
    }
    (existing_total - new_total).abs() > 1e-6
}

fn iter_run_dirs(log_dir: &Utf8Path) -> Vec<Utf8PathBuf> {
    let mut runs: Vec<Utf8PathBuf> = std::fs::read_dir(log_dir.as_std_path())
        .into_iter()
        .flatten()
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .filter_map(|p| Utf8PathBuf::from_path_buf(p).ok())
        .filter(|p| {
            let name = p.file_name().unwrap_or_default();
            name.starts_with("RUN_") || name.starts_with("TEST_")
        })
        .collect();
    runs.sort();
    runs
}

fn load_run_state(run_dir: &Utf8Path) -> Value {
    std::fs::read_to_string(run_dir.join("run_state.json").as_std_path())
        .ok()
        .and_then(|text| serde_json::from_str(&text).ok())
        .unwrap_or_else(|| json!({}))
}

fn load_request_meta(run_dir: &Utf8Path) -> Vec<RequestMeta> {
    let req_dir = run_dir.join("requests");
    let mut meta: Vec<RequestMeta> = std::fs::read_dir(req_dir.as_std_path())
        .into_iter()
        .flatten()
        .flatten()
        .filter_map(|entry| {
            let path = entry.path();
            let fname = path.file_name()?.to_str()?.to_string();
            let lower = fname.to_lowercase();
            if !lower.ends_with(".json") && !lower.ends_with(".jsonl") {
                return None;
            }
            let text = std::fs::read_to_string(&path).ok()?;
            let data: Value = serde_json::from_str(&text).ok()?;
            let payload = data.get("payload").or_else(|| data.get("body")).unwrap_or(&data);
            let use_fs = payload
                .get("tools")
                .and_then(Value::as_array)
                .map(|tools| tools.iter().any(|t| t.get("type").and_then(Value::as_str) == Some("file_search")))
                .unwrap_or(false);
            Some(RequestMeta { label: infer_label(&fname), use_file_search: use_fs, mtime: mtime_secs(&path) })
        })
        .collect();
    meta.sort_by(|a, b| a.mtime.partial_cmp(&b.mtime).unwrap_or(std::cmp::Ordering::Equal));
    meta
}

fn mtime_secs(path: &std::path::Path) -> f64 {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn mtime_datetime(path: &std::path::Path) -> DateTime<Utc> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok().map(DateTime::<Utc>::from).unwrap_or_else(Utc::now)
}

/// Scan a filename for a flow-label token, checked in priority order so a
/// longer/specific token (`A1`) wins over a prefix that also matches (`A`).
fn infer_label(name: &str) -> String {
    let upper = name.to_uppercase();
    for token in ["A3", "A2", "A1", "B3", "B2", "B1", "QA", "QFILE", "C_BATCH", "C"] {
        if upper.contains(token) {
            return token.to_string();
        }
    }
    if upper.contains("BATCH") {
        return "C".to_string();
    }
    "UNKNOWN".to_string()
}

fn infer_mode_flow(label: &str) -> (String, String) {
    match label {
        "A1" => ("GENERATE".to_string(), "A1".to_string()),
        "A2" => ("GENERATE".to_string(), "A2".to_string()),
        "A3" => ("GENERATE".to_string(), "A3".to_string()),
        "B1" => ("MODIFY".to_string(), "B1".to_string()),
        "B2" => ("MODIFY".to_string(), "B2".to_string()),
        "B3" => ("MODIFY".to_string(), "B3".to_string()),
        "QA" => ("QA".to_string(), "QA".to_string()),
        "QFILE" => ("QFILE".to_string(), "QFILE".to_string()),
        "C_BATCH" => ("C".to_string(), "C_BATCH".to_string()),
        "C" => ("C".to_string(), "C".to_string()),
        other => ("UNKNOWN".to_string(), if other.is_empty() { "UNKNOWN".to_string() } else { other.to_string() }),
    }
}

/// Pick the latest request with the same label that happened at or before
/// the response's mtime (plus a one-second grace window).
fn match_request_tools(label: &str, resp_mtime: f64, req_meta: &[RequestMeta]) -> bool {
    req_meta
        .iter()
        .filter(|m| m.label == label && m.mtime <= resp_mtime + 1.0)
        .last()
        .map(|m| m.use_file_search)
        .unwrap_or(false)
}

fn extract_usage(resp: &Value) -> (Value, i64, i64) {
    let has_entries = |v: &Value| v.as_object().map(|o| !o.is_empty()).unwrap_or(false);
    let mut usage = resp.get("usage").cloned().filter(Value::is_object);
    if !usage.as_ref().map(has_entries).unwrap_or(false) {
        usage = resp.get("response").and_then(|r| r.get("usage")).filter(|u| u.is_object()).cloned();
    }
    if !usage.as_ref().map(has_entries).unwrap_or(false) {
        usage = resp.get("body").and_then(|r| r.get("usage")).filter(|u| u.is_object()).cloned();
    }
    let usage = usage.unwrap_or_else(|| json!({}));
    let inp = usage.get("input_tokens").or_else(|| usage.get("prompt_tokens")).and_then(Value::as_i64).unwrap_or(0);
    let outp = usage.get("output_tokens").or_else(|| usage.get("completion_tokens")).and_then(Value::as_i64).unwrap_or(0);
    (usage, inp, outp)
}

fn build_receipt(
    price_table: &PriceTable,
    run_dir: &Utf8Path,
    run_state: &Value,
    resp_path: &Utf8Path,
    resp: &Value,
    req_meta: &[RequestMeta],
) -> BuiltReceipt {
    let run_id = run_dir.file_name().unwrap_or_default().to_string();
    let fname = resp_path.file_name().unwrap_or_default().to_string();
    let label = infer_label(&fname);
    let (mode, flow) = infer_mode_flow(&label);

    let response_id = resp
        .get("id")
        .and_then(Value::as_str)
        .or_else(|| resp.get("response").and_then(|r| r.get("id")).and_then(Value::as_str))
        .map(str::to_string);
    let batch_id = resp.get("batch_id").and_then(Value::as_str).map(str::to_string);
    let model = resp
        .get("model")
        .and_then(Value::as_str)
        .or_else(|| resp.get("response").and_then(|r| r.get("model")).and_then(Value::as_str))
        .map(str::to_string)
        .or_else(|| run_state.get("model").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_default();

    let (usage, inp, outp) = extract_usage(resp);
    let zero_usage = inp == 0 && outp == 0;
    let use_fs = match_request_tools(&label, mtime_secs(resp_path.as_std_path()), req_meta);

    let fallback_table = PriceTable::builtin_fallback();
    let row = price_table
        .get(&model)
        .or_else(|| fallback_table.get(&model))
        .or_else(|| fallback_table.get("gpt-4o-mini"))
        .expect("builtin fallback always carries gpt-4o-mini");

    let is_batch = mode == "C";
    let (total, tool_cost, storage_cost) = compute_cost(row, inp.max(0) as u64, outp.max(0) as u64, is_batch, use_fs, 0.0);

    let mut notes = flow.clone();
    if zero_usage {
        if usage.as_object().map(|o| !o.is_empty()).unwrap_or(false) {
            notes.push_str(" (usage present but zero tokens)");
        } else {
            notes.push_str(" (usage missing)");
        }
    }

    let receipt = Receipt {
        id: None,
        run_id,
        created_at: mtime_datetime(resp_path.as_std_path()),
        project: run_state.get("project").and_then(Value::as_str).unwrap_or("UNKNOWN").to_string(),
        model,
        mode,
        flow_type: flow,
        response_id,
        batch_id,
        input_tokens: inp,
        output_tokens: outp,
        tool_cost,
        storage_cost,
        total_cost: total,
        pricing_verified: price_table.verified(),
        notes,
        log_paths: vec![format!("run_dir={run_dir}"), format!("response_file={resp_path}")],
        usage,
    };

    BuiltReceipt { receipt, zero_usage }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forgechain_config::Settings;
    use std::fs;

    fn write_run(log_dir: &Utf8Path, run_id: &str, responses: &[(&str, Value)], state: Value) {
        let run_dir = log_dir.join(run_id);
        fs::create_dir_all(run_dir.join("responses")).unwrap();
        fs::write(run_dir.join("run_state.json"), serde_json::to_vec(&state).unwrap()).unwrap();
        for (name, body) in responses {
            fs::write(run_dir.join("responses").join(name), serde_json::to_vec(body).unwrap()).unwrap();
        }
    }

    #[tokio::test]
    async fn audit_inserts_one_receipt_per_response_and_skips_on_rerun() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = Utf8PathBuf::from_path_buf(dir.path().join("LOG")).unwrap();
        write_run(
            &log_dir,
            "RUN_270720260900_AB12",
            &[("demo_A1_resp.json", json!({"id": "resp-1", "model": "gpt-4o-mini", "usage": {"input_tokens": 100, "output_tokens": 20}}))],
            json!({"project": "demo", "status": "completed", "model": "gpt-4o-mini", "mode": "GENERATE"}),
        );

        let settings = Settings::default();
        let db = ReceiptDb::in_memory().unwrap();
        let auditor = PricingAuditor::new(&settings, &db, None, "");
        let mut price_table = PriceTable::builtin_fallback();

        let summary = auditor.audit(&mut price_table, &log_dir).await;
        assert_eq!(summary.runs_scanned, 1);
        assert_eq!(summary.responses_seen, 1);
        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.updated, 0);

        let summary2 = auditor.audit(&mut price_table, &log_dir).await;
        assert_eq!(summary2.inserted, 0);
        assert_eq!(summary2.updated, 0);
    }

    #[tokio::test]
    async fn audit_inserts_fallback_receipt_for_run_with_no_responses() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = Utf8PathBuf::from_path_buf(dir.path().join("LOG")).unwrap();
        fs::create_dir_all(log_dir.join("RUN_270720260900_ZZ99")).unwrap();
        fs::write(
            log_dir.join("RUN_270720260900_ZZ99").join("run_state.json"),
            serde_json::to_vec(&json!({"project": "demo", "status": "failed"})).unwrap(),
        )
        .unwrap();

        let settings = Settings::default();
        let db = ReceiptDb::in_memory().unwrap();
        let auditor = PricingAuditor::new(&settings, &db, None, "");
        let mut price_table = PriceTable::builtin_fallback();

        let summary = auditor.audit(&mut price_table, &log_dir).await;
        assert_eq!(summary.missing_runs, 1);
        let rows = db.query().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].flow_type, "FALLBACK");
    }

    #[test]
    fn infer_label_prefers_longer_specific_tokens_over_plain_c() {
        assert_eq!(infer_label("demo_A1_response.json"), "A1");
        assert_eq!(infer_label("demo_C_BATCH_response.json"), "C_BATCH");
        assert_eq!(infer_label("demo_qfile_resp.json"), "QFILE");
        assert_eq!(infer_label("demo_resp.json"), "UNKNOWN");
    }

    #[test]
    fn infer_mode_flow_maps_known_labels() {
        assert_eq!(infer_mode_flow("B2"), ("MODIFY".to_string(), "B2".to_string()));
        assert_eq!(infer_mode_flow("QA"), ("QA".to_string(), "QA".to_string()));
        assert_eq!(infer_mode_flow("UNKNOWN"), ("UNKNOWN".to_string(), "UNKNOWN".to_string()));
    }

    #[test]
    fn needs_update_triggers_on_meaningful_delta_or_zero_to_nonzero() {
        assert!(needs_update(0.0, 0.01));
        assert!(needs_update(1.0, 1.5));
        assert!(!needs_update(1.0, 1.0000001));
        assert!(!needs_update(0.0, 0.0));
    }

    #[test]
    fn extract_usage_falls_back_through_nested_shapes() {
        let (usage, inp, outp) = extract_usage(&json!({"response": {"usage": {"input_tokens": 5, "output_tokens": 2}}}));
        assert_eq!(inp, 5);
        assert_eq!(outp, 2);
        assert!(usage.is_object());
    }
}
