//! The `PipelineOrchestrator`, ported from `pipeline.py`'s `RunWorker.run`
//! onto the same async-task-plus-progress-channel shape
//! [`forgechain_cascade::CascadeOrchestrator`] already established for the
//! generic cascade path (`cascade_pipeline.py::CascadeRunWorker.run`).

use crate::config::{Mode, RunConfig};
use crate::diagnostics::{DiagnosticsBundle, DiagnosticsCollector};
use crate::payload::{append_io_reference, input_parts, payload_base};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use forgechain_client::RemoteClient;
use forgechain_config::Settings;
use forgechain_contract::{extract_text_from_response, parse_json_strict, validate_paths};
use forgechain_manifest::{ScanFilters, build_manifest, scan_tree};
use forgechain_pricing::{PriceRow, PriceTable, compute_cost};
use forgechain_receipt::{Receipt, ReceiptDb};
use forgechain_retry::{CircuitBreaker, RetryPolicy, is_transient_status, with_retry};
use forgechain_runlog::{RunLogger, SaveKind};
use forgechain_utils::atomic_write::write_file_atomic;
use forgechain_utils::error::ForgeError;
use forgechain_utils::paths::SandboxRoot;
use forgechain_utils::types::{RunId, random_suffix};
use serde_json::{Value, json};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc};
use tracing::warn;

/// Progress updates, the async analogue of the original's Qt signals.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    Progress { percent: u8, subpercent: u8, status: String },
    LogLine(String),
}

/// Everything one run produces: the chained response id to continue from,
/// plus mode-specific detail (`plan`, `structure`, `saved`, `batch_id`, ...)
/// carried as a loosely-typed bag, mirroring the original returning a plain
/// dict from each `_run_*` method.
#[derive(Debug, Clone, Default)]
pub struct PipelineResult {
    pub mode: String,
    pub response_id: String,
    pub pricing_snapshot: bool,
    pub extra: Value,
}

/// Per-run accumulators that used to be instance attributes on `RunWorker`
/// (`self._total_input_tokens`, `self._has_receipt`, `self._used_file_search`,
/// `self._final_response_id`, `self._last_prev_id_error`).
#[derive(Debug, Clone, Default)]
struct RunState {
    total_input_tokens: i64,
    total_output_tokens: i64,
    has_receipt: bool,
    used_file_search: bool,
    final_response_id: String,
    in_dir_file_id: Option<String>,
}

/// `_files_with_in_dir`: append the IN-mirror zip's file id (when present)
/// to a base attachment list, unless it's already there.
fn file_ids_with_in_dir(mut ids: Vec<String>, state: &RunState) -> Vec<String> {
    if let Some(fid) = &state.in_dir_file_id {
        if !ids.iter().any(|id| id == fid) {
            ids.push(fid.clone());
        }
    }
    ids
}

/// Result of zipping and uploading the IN directory, mirroring
/// `self._in_dir_info` (`pipeline.py::_prepare_in_dir_upload`).
#[derive(Debug, Clone)]
struct InDirInfo {
    #[allow(dead_code)]
    zip_path: Utf8PathBuf,
    file_id: String,
    vector_store_id: Option<String>,
}

fn is_transient(err: &ForgeError) -> bool {
    matches!(err, ForgeError::RemoteTransientExhausted(_))
        || matches!(
            err,
            ForgeError::RemoteRejection { status, .. }
                if is_transient_status(reqwest::StatusCode::from_u16(*status).unwrap_or(reqwest::StatusCode::INTERNAL_SERVER_ERROR))
        )
}

/// The API rejects an invalid/expired `previous_response_id` as an ordinary
/// bad-request error body; detect it the way `pipeline.py` does
/// (`"previous_response_id" in str(e).lower()`) and reclassify it so the run
/// aborts with [`ForgeError::ContinuationInvalid`] rather than a generic
/// `RemoteRejection`.
fn reject_invalid_previous_response_id(err: ForgeError) -> ForgeError {
    if let ForgeError::RemoteRejection { ref body, .. } = err {
        if body.to_lowercase().contains("previous_response_id") {
            return ForgeError::ContinuationInvalid(
                "Response ID je neplatne nebo expirovane (API odmitlo previous_response_id). Ukoncuji RUN.".to_string(),
            );
        }
    }
    err
}

fn usage_from_resp(resp: &Value) -> (u64, u64) {
    let Some(usage) = resp.get("usage").and_then(Value::as_object) else {
        return (0, 0);
    };
    let inp = usage
        .get("input_tokens")
        .or_else(|| usage.get("prompt_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let out = usage
        .get("output_tokens")
        .or_else(|| usage.get("completion_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    (inp, out)
}

/// Developer-role instructions naming the exact JSON shape a contract
/// expects, in the register `contracts.py` uses for its schema reminders.
fn contract_instructions(contract: &str) -> String {
    match contract {
        "A1_PLAN" => {
            "Vrat presne jeden JSON objekt (kontrakt A1_PLAN): {\"contract\":\"A1_PLAN\",\"plan\": string, \
             \"notes\": string}. Zadny markdown, zadny text mimo JSON."
                .to_string()
        }
        "A2_STRUCTURE" => {
            "Vrat presne jeden JSON objekt (kontrakt A2_STRUCTURE): {\"contract\":\"A2_STRUCTURE\",\"root\":string,\
             \"files\":[{\"path\":string,\"purpose\":string,\"language\":string,\"generated_in_phase\":string}]}."
                .to_string()
        }
        "A3_FILE" => {
            "Vrat presne jeden JSON objekt (kontrakt A3_FILE): {\"contract\":\"A3_FILE\",\"path\":string,\
             \"content\":string,\"chunking\":{\"chunk_index\":int,\"chunk_count\":int,\"has_more\":bool,\
             \"next_chunk_index\":int|null}}. Zadny markdown."
                .to_string()
        }
        "B1_PLAN" => {
            "Vrat presne jeden JSON objekt (kontrakt B1_PLAN): {\"contract\":\"B1_PLAN\",\"diagnosis\":string,\
             \"change_plan\":string,\"missing_inputs\":[string]}."
                .to_string()
        }
        "B2_STRUCTURE" => {
            "Vrat presne jeden JSON objekt (kontrakt B2_STRUCTURE): {\"contract\":\"B2_STRUCTURE\",\
             \"touched_files\":[{\"path\":string,\"action\":\"modify\"|\"add\",\"intent\":string}],\
             \"invariants\":[string]}."
                .to_string()
        }
        "B3_FILE" => {
            "Vrat presne jeden JSON objekt (kontrakt B3_FILE): {\"contract\":\"B3_FILE\",\"path\":string,\
             \"action\":\"modify\"|\"add\",\"content\":string,\"notes\":string,\"chunking\":{\"chunk_index\":int,\
             \"chunk_count\":int,\"has_more\":bool,\"next_chunk_index\":int|null}}."
                .to_string()
        }
        "C_FILES_ALL" => {
            "Vrat presne jeden JSON objekt (kontrakt C_FILES_ALL): {\"contract\":\"C_FILES_ALL\",\
             \"files\":[{\"path\":string,\"content\":string}]}. Zadny markdown."
                .to_string()
        }
        _ => "Vrat presne jeden JSON objekt. Zadny markdown.".to_string(),
    }
}

/// Owns one GENERATE/MODIFY/QA/QFILE/BATCH run's execution. Long-lived
/// collaborators are injected, matching the Design Note's
/// no-globals rule (§9) already followed by `CascadeOrchestrator`.
pub struct PipelineOrchestrator {
    client: Arc<dyn RemoteClient>,
    diagnostics: Arc<dyn DiagnosticsCollector>,
    db: Arc<StdMutex<ReceiptDb>>,
    price_table: Mutex<PriceTable>,
    settings: Settings,
    policy: RetryPolicy,
    breaker: Mutex<CircuitBreaker>,
    base_log_dir: camino::Utf8PathBuf,
    stop: Arc<AtomicBool>,
}

impl PipelineOrchestrator {
    #[must_use]
    pub fn new(
        client: Arc<dyn RemoteClient>,
        diagnostics: Arc<dyn DiagnosticsCollector>,
        db: Arc<StdMutex<ReceiptDb>>,
        price_table: PriceTable,
        settings: Settings,
        policy: RetryPolicy,
        base_log_dir: camino::Utf8PathBuf,
    ) -> Self {
        Self {
            breaker: Mutex::new(CircuitBreaker::from_policy(&policy)),
            client,
            diagnostics,
            db,
            price_table: Mutex::new(price_table),
            settings,
            policy,
            base_log_dir,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn cancellation_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    fn check_stop(&self) -> Result<(), ForgeError> {
        if self.stop.load(Ordering::SeqCst) {
            return Err(ForgeError::CancelRequested);
        }
        Ok(())
    }

    async fn emit(&self, progress: &Option<mpsc::Sender<ProgressEvent>>, percent: u8, subpercent: u8, status: impl Into<String>) {
        let Some(tx) = progress else { return };
        let status = status.into();
        let _ = tx.send(ProgressEvent::Progress { percent, subpercent, status: status.clone() }).await;
        let _ = tx.send(ProgressEvent::LogLine(status)).await;
    }

    async fn call_response(&self, payload: Value) -> Result<Value, ForgeError> {
        self.check_stop()?;
        let mut breaker = self.breaker.lock().await;
        let result = with_retry(
            || async { self.client.create_response(payload.clone()).await },
            &self.policy,
            Some(&mut breaker),
            is_transient,
        )
        .await;
        result.map_err(reject_invalid_previous_response_id)
    }

    async fn upload(&self, path: &Path, purpose: &str) -> Result<Value, ForgeError> {
        self.check_stop()?;
        let mut breaker = self.breaker.lock().await;
        with_retry(
            || async { self.client.upload_file(path, purpose).await },
            &self.policy,
            Some(&mut breaker),
            is_transient,
        )
        .await
    }

    fn is_skipped(cfg: &RunConfig, path: &str) -> bool {
        let ext = Path::new(path)
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
            .unwrap_or_default();
        cfg.skip_exts.iter().any(|e| e.eq_ignore_ascii_case(&ext)) || cfg.skip_paths.iter().any(|p| path.starts_with(p.as_str()))
    }

    /// Execute the run described by `cfg`. Always produces a terminal
    /// run-state record before returning, matching `RunWorker.run`'s
    /// `try/except BaseException` wrapping the entire dispatch.
    pub async fn run(&self, cfg: RunConfig, progress: Option<mpsc::Sender<ProgressEvent>>) -> Result<PipelineResult, ForgeError> {
        let run_id = RunId::new(Utc::now(), &random_suffix());
        let logger = RunLogger::create(&self.base_log_dir, run_id.clone(), &cfg.project).map_err(ForgeError::Other)?;
        logger
            .update_state(json!({
                "status": "running",
                "started_at": Utc::now().to_rfc3339(),
                "mode": cfg.mode.as_str(),
                "send_as_c": cfg.send_as_c,
                "project": cfg.project,
                "model": cfg.model,
            }))
            .map_err(ForgeError::Other)?;

        self.emit(&progress, 1, 0, format!("{} run starting", cfg.mode.as_str())).await;

        let mut state = RunState::default();
        let outcome = self.run_inner(&cfg, &logger, &progress, &mut state, run_id.as_str()).await;

        match &outcome {
            Ok(result) => {
                logger
                    .update_state(json!({
                        "status": "completed",
                        "finished_at": Utc::now().to_rfc3339(),
                        "response_id": result.response_id,
                        "pricing_snapshot": result.pricing_snapshot,
                    }))
                    .map_err(ForgeError::Other)?;
                logger
                    .event("run.finished_ok", json!({"response_id": result.response_id}))
                    .map_err(ForgeError::Other)?;
            }
            Err(ForgeError::CancelRequested) => {
                let _ = self
                    .ensure_receipt_on_failure(&cfg, &logger, &mut state, "stopped_by_user", "RUN_STOPPED", run_id.as_str())
                    .await;
                logger
                    .update_state(json!({"status": "stopped", "finished_at": Utc::now().to_rfc3339()}))
                    .map_err(ForgeError::Other)?;
                logger.event("run.stopped", json!({})).map_err(ForgeError::Other)?;
            }
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "pipeline run failed");
                let _ = logger.exception("run", &anyhow::anyhow!(e.to_string()));
                let _ = self
                    .ensure_receipt_on_failure(&cfg, &logger, &mut state, &format!("failed: {e}"), "RUN_FAILED", run_id.as_str())
                    .await;
                logger
                    .update_state(json!({"status": "failed", "finished_at": Utc::now().to_rfc3339(), "error": e.to_string()}))
                    .map_err(ForgeError::Other)?;
                logger.event("run.failed", json!({"error": e.to_string()})).map_err(ForgeError::Other)?;
            }
        }

        outcome
    }

    async fn run_inner(
        &self,
        cfg: &RunConfig,
        logger: &RunLogger,
        progress: &Option<mpsc::Sender<ProgressEvent>>,
        state: &mut RunState,
        run_id: &str,
    ) -> Result<PipelineResult, ForgeError> {
        self.check_stop()?;

        if cfg.mode == Mode::Qfile && cfg.send_as_c {
            return Err(ForgeError::Contract("QFILE cannot be combined with BATCH".to_string()));
        }
        if !cfg.model_caps.supports_previous_response_id.as_bool() && !cfg.send_as_c && matches!(cfg.mode, Mode::Generate | Mode::Modify) {
            return Err(ForgeError::ContinuationInvalid(
                "Selected model explicitly rejects previous_response_id (required for cascades)".to_string(),
            ));
        }

        let diag_bundle = self.diagnostics.collect().await.map_err(ForgeError::Other)?;
        let diag_file_ids = match &diag_bundle {
            Some(bundle) => self.upload_diagnostics(bundle, logger).await?,
            None => Vec::new(),
        };

        self.emit(progress, 4, 0, "IN: zipping + upload...").await;
        let in_dir_info = self.prepare_in_dir_upload(cfg, logger).await?;
        state.in_dir_file_id = in_dir_info.as_ref().map(|info| info.file_id.clone());

        let mut vector_store_ids = cfg.attached_vector_store_ids.clone();
        if let Some(info) = &in_dir_info {
            if let Some(vs_id) = &info.vector_store_id {
                vector_store_ids.push(vs_id.clone());
            }
        }
        if !diag_file_ids.is_empty() && cfg.model_caps.supports_vector_store.as_bool() {
            match self.attach_diagnostics_vector_store(&diag_file_ids, logger).await {
                Ok(vs_id) => vector_store_ids.push(vs_id),
                Err(e) => {
                    let _ = logger.event("diagnostics.vector_store_failed", json!({"error": e.to_string()}));
                }
            }
        }

        let fs_tools = if cfg.model_caps.supports_file_search.as_bool()
            && (cfg.use_file_search || !diag_file_ids.is_empty())
            && !vector_store_ids.is_empty()
        {
            Some(vec![json!({"type": "file_search", "vector_store_ids": vector_store_ids})])
        } else {
            None
        };

        let _ = logger.event(
            "io.reference",
            json!({"file_ids": file_ids_with_in_dir(cfg.input_file_ids_or_attached(), state), "vector_store_ids": vector_store_ids}),
        );

        let pricing_updated = self.refresh_pricing_if_needed().await;

        let base_prev_id = if cfg.send_as_c {
            None
        } else if matches!(cfg.mode, Mode::Generate | Mode::Modify) {
            self.ingest_prompt_if_needed(cfg, logger, state).await?
        } else {
            cfg.response_id.clone()
        };

        let mut result = if cfg.send_as_c {
            self.run_c_batch(cfg, logger, state, run_id).await?
        } else {
            match cfg.mode {
                Mode::Generate => self.run_a_generate(cfg, logger, progress, state, base_prev_id, &fs_tools, run_id).await?,
                Mode::Modify => {
                    self.run_b_modify(cfg, logger, progress, state, base_prev_id, vector_store_ids.clone(), &diag_file_ids, run_id)
                        .await?
                }
                Mode::Qa => self.run_qa(cfg, logger, state, base_prev_id, run_id).await?,
                Mode::Qfile => self.run_qfile(cfg, logger, state, base_prev_id, run_id).await?,
            }
        };

        if result.response_id.is_empty() {
            result.response_id = state.final_response_id.clone();
        }
        result.pricing_snapshot = pricing_updated;
        Ok(result)
    }

    /// `_ingest_prompt_if_needed`: a prompt that doesn't even fit in one
    /// 20,000-char input part needs no special handling; one that does is
    /// chained in ahead of the actual A1/B1 request so the model has already
    /// seen all of it by the time the real work starts.
    async fn ingest_prompt_if_needed(&self, cfg: &RunConfig, logger: &RunLogger, state: &mut RunState) -> Result<Option<String>, ForgeError> {
        let chunks = forgechain_client::split_text(&cfg.prompt, 20_000);
        if chunks.len() <= 1 {
            return Ok(cfg.response_id.clone());
        }

        let mut prev_id = cfg.response_id.clone();
        for (i, chunk) in chunks.iter().enumerate() {
            self.check_stop()?;
            let input = vec![json!({"type": "message", "role": "user", "content": [{"type": "input_text", "text": chunk}]})];
            let instructions = "Prijmi tento kontext beze zmeny a potvrd prijeti jednim slovem.";
            let payload = payload_base(
                &cfg.model,
                instructions,
                input,
                prev_id.as_deref(),
                cfg.temperature,
                cfg.model_caps.supports_temperature.as_bool(),
            );
            logger.save_json(SaveKind::Requests, &format!("A0_ingest_{i:02}"), &payload).map_err(ForgeError::Other)?;
            let resp = self.call_response(payload).await?;
            logger.save_json(SaveKind::Responses, &format!("A0_ingest_{i:02}"), &resp).map_err(ForgeError::Other)?;
            let rid = resp.get("id").and_then(Value::as_str).unwrap_or("").to_string();
            if !rid.is_empty() {
                state.final_response_id = rid.clone();
                prev_id = Some(rid);
            }
        }
        Ok(prev_id)
    }

    /// The shared A3/B3 chunked file-generation loop. Gives up on a single
    /// chunk (writing it as empty content) after three contract-mismatch
    /// attempts rather than failing the whole run; aborts the whole run
    /// immediately on a `previous_response_id`-shaped rejection or past the
    /// 5,000-chunk guard.
    #[allow(clippy::too_many_arguments)]
    async fn gen_file_chunks(
        &self,
        cfg: &RunConfig,
        logger: &RunLogger,
        state: &mut RunState,
        prev_id: &str,
        contract: &str,
        path: &str,
        action: Option<&str>,
    ) -> Result<String, ForgeError> {
        let instructions = contract_instructions(contract);
        let mut content = String::new();
        let mut chunk_index: u64 = 0;
        let mut current_prev = prev_id.to_string();

        loop {
            self.check_stop()?;
            let prompt = match action {
                Some(a) => format!("Vrat obsah souboru PATH={path} ACTION={a} CHUNK_INDEX={chunk_index}"),
                None => format!("Vrat obsah souboru PATH={path} CHUNK_INDEX={chunk_index}"),
            };
            let input = input_parts(&prompt, &[]);

            let mut parsed = None;
            for attempt in 0..3 {
                self.check_stop()?;
                let payload = payload_base(
                    &cfg.model,
                    &instructions,
                    input.clone(),
                    Some(&current_prev),
                    cfg.temperature,
                    cfg.model_caps.supports_temperature.as_bool(),
                );
                let resp = self.call_response(payload).await?;
                let rid = resp.get("id").and_then(Value::as_str).unwrap_or("").to_string();
                if !rid.is_empty() {
                    current_prev = rid.clone();
                    state.final_response_id = rid;
                }
                let text = extract_text_from_response(&resp);
                match parse_json_strict(&text) {
                    Ok(v)
                        if v.get("contract").and_then(Value::as_str) == Some(contract)
                            && v.get("path").and_then(Value::as_str) == Some(path)
                            && v.get("content").and_then(Value::as_str).is_some() =>
                    {
                        parsed = Some(v);
                        break;
                    }
                    _ => {
                        logger
                            .event("contract.mismatch", json!({"path": path, "contract": contract, "attempt": attempt}))
                            .map_err(ForgeError::Other)?;
                    }
                }
            }

            let Some(parsed) = parsed else {
                break;
            };
            content.push_str(parsed.get("content").and_then(Value::as_str).unwrap_or(""));

            let has_more = parsed
                .get("chunking")
                .and_then(|c| c.get("has_more"))
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if !has_more {
                break;
            }
            chunk_index = parsed
                .get("chunking")
                .and_then(|c| c.get("next_chunk_index"))
                .and_then(Value::as_u64)
                .unwrap_or(chunk_index + 1);
            if chunk_index > 5000 {
                return Err(ForgeError::Contract("Chunk loop guard".to_string()));
            }
        }

        Ok(content)
    }

    async fn save_out_files(&self, cfg: &RunConfig, logger: &RunLogger, files: &[(String, String)]) -> Result<Vec<Value>, ForgeError> {
        std::fs::create_dir_all(cfg.out_dir.as_std_path()).map_err(ForgeError::Io)?;
        if cfg.versing && !files.is_empty() {
            self.create_snapshot(&cfg.out_dir, logger)?;
        }

        let sandbox = SandboxRoot::new_default(cfg.out_dir.as_std_path()).map_err(|e| ForgeError::PathViolation(e.to_string()))?;
        let mut saved = Vec::new();
        for (rel, content) in files {
            let sandbox_path = sandbox.join(rel).map_err(|e| ForgeError::PathViolation(e.to_string()))?;
            let before_size = std::fs::metadata(sandbox_path.as_path()).ok().map(|m| m.len());
            let utf8_path = camino::Utf8PathBuf::from_path_buf(sandbox_path.as_path().to_path_buf())
                .map_err(|_| ForgeError::PathViolation(format!("non-UTF-8 output path: {rel}")))?;
            write_file_atomic(&utf8_path, content).map_err(ForgeError::Other)?;
            let after_size = std::fs::metadata(sandbox_path.as_path()).ok().map(|m| m.len());
            logger.record_fs_change("write", rel, None, before_size, after_size).map_err(ForgeError::Other)?;
            saved.push(json!({"path": rel, "dst": utf8_path.as_str(), "bytes": after_size.unwrap_or(0)}));
        }
        logger
            .save_json(SaveKind::Manifests, "out_saved_map", &json!({"saved": saved}))
            .map_err(ForgeError::Other)?;
        Ok(saved)
    }

    /// Copies `out_dir` into a timestamped sibling folder inside itself
    /// before any file is overwritten, skipping `venv`/`.venv`/`LOG` and any
    /// prior snapshot directory (the new snapshot dir's own name matches
    /// [`forgechain_manifest::is_versioning_snapshot_dir`], so the recursive
    /// copy naturally excludes itself).
    fn create_snapshot(&self, out_dir: &Utf8Path, logger: &RunLogger) -> Result<(), ForgeError> {
        let basename = out_dir.file_name().unwrap_or("out").to_string();
        let stamp = Utc::now().format("%Y%m%d%H%M").to_string();
        let snapshot_dir = out_dir.join(format!("{basename}{stamp}"));
        std::fs::create_dir_all(snapshot_dir.as_std_path()).map_err(ForgeError::Io)?;
        Self::copy_dir_excluding(out_dir, &snapshot_dir, &["venv", ".venv", "LOG"], &basename)?;
        let _ = logger.event("versioning.snapshot", json!({"snapshot_dir": snapshot_dir.as_str()}));
        Ok(())
    }

    fn copy_dir_excluding(src: &Utf8Path, dst: &Utf8Path, deny_dirs: &[&str], root_name: &str) -> Result<(), ForgeError> {
        for entry in std::fs::read_dir(src.as_std_path()).map_err(ForgeError::Io)? {
            let entry = entry.map_err(ForgeError::Io)?;
            let name = entry.file_name().to_string_lossy().to_string();
            if entry.file_type().map_err(ForgeError::Io)?.is_dir() {
                if deny_dirs.contains(&name.as_str()) || forgechain_manifest::is_versioning_snapshot_dir(&name, root_name) {
                    continue;
                }
                let new_dst = dst.join(&name);
                std::fs::create_dir_all(new_dst.as_std_path()).map_err(ForgeError::Io)?;
                Self::copy_dir_excluding(&src.join(&name), &new_dst, deny_dirs, root_name)?;
            } else {
                std::fs::copy(entry.path(), dst.join(&name).as_std_path()).map_err(ForgeError::Io)?;
            }
        }
        Ok(())
    }

    async fn record_receipt(
        &self,
        cfg: &RunConfig,
        logger: &RunLogger,
        state: &mut RunState,
        resp: &Value,
        mode: &str,
        flow_type: &str,
        response_id: Option<String>,
        batch_id: Option<String>,
        is_batch: bool,
        run_id: &str,
    ) -> Result<(), ForgeError> {
        let usage = resp.get("usage").cloned().unwrap_or(Value::Null);
        let (inp, out) = usage_from_resp(resp);
        state.total_input_tokens += inp as i64;
        state.total_output_tokens += out as i64;

        let table = self.price_table.lock().await;
        let row: Option<PriceRow> = match table.get(&cfg.model) {
            Some(r) => Some(r.clone()),
            None => {
                let fallback = PriceTable::builtin_fallback();
                fallback.get(&cfg.model).or_else(|| fallback.get("gpt-4o-mini")).cloned()
            }
        };
        let verified = table.verified() && row.is_some();
        let (total, tool_cost, storage_cost) =
            if let Some(r) = &row { compute_cost(r, inp, out, is_batch, state.used_file_search, 0.0) } else { (0.0, 0.0, 0.0) };
        drop(table);

        let receipt = Receipt {
            id: None,
            run_id: run_id.to_string(),
            created_at: Utc::now(),
            project: cfg.project.clone(),
            model: cfg.model.clone(),
            mode: mode.to_string(),
            flow_type: flow_type.to_string(),
            response_id,
            batch_id,
            input_tokens: inp as i64,
            output_tokens: out as i64,
            tool_cost,
            storage_cost,
            total_cost: total,
            pricing_verified: verified,
            notes: cfg.prompt.chars().take(4000).collect(),
            log_paths: vec![logger.paths().run_dir.to_string()],
            usage,
        };
        self.db.lock().unwrap().insert(&receipt).map_err(ForgeError::Other)?;
        state.has_receipt = true;
        Ok(())
    }

    async fn ensure_receipt_on_failure(
        &self,
        cfg: &RunConfig,
        logger: &RunLogger,
        state: &mut RunState,
        reason: &str,
        flow_type: &str,
        run_id: &str,
    ) -> Result<(), ForgeError> {
        if state.has_receipt {
            return Ok(());
        }
        let receipt = Receipt {
            id: None,
            run_id: run_id.to_string(),
            created_at: Utc::now(),
            project: cfg.project.clone(),
            model: cfg.model.clone(),
            mode: cfg.mode.as_str().to_string(),
            flow_type: flow_type.to_string(),
            response_id: None,
            batch_id: None,
            input_tokens: state.total_input_tokens,
            output_tokens: state.total_output_tokens,
            tool_cost: 0.0,
            storage_cost: 0.0,
            total_cost: 0.0,
            pricing_verified: false,
            notes: format!("Fallback receipt ({reason})"),
            log_paths: vec![logger.paths().run_dir.to_string()],
            usage: json!({"reason": reason}),
        };
        self.db.lock().unwrap().insert(&receipt).map_err(ForgeError::Other)?;
        state.has_receipt = true;
        Ok(())
    }

    async fn refresh_pricing_if_needed(&self) -> bool {
        if !self.settings.pricing.auto_refresh_on_start {
            return false;
        }
        let mut table = self.price_table.lock().await;
        let stale = Utc::now().signed_duration_since(table.last_updated())
            > chrono::Duration::hours(i64::from(self.settings.pricing.cache_ttl_hours));
        if !stale {
            return false;
        }
        let client = reqwest::Client::new();
        table.refresh_from_url(&client, &self.settings.pricing.source_url).await.is_ok()
    }

    async fn upload_diagnostics(&self, bundle: &DiagnosticsBundle, logger: &RunLogger) -> Result<Vec<String>, ForgeError> {
        let mut entries = Vec::new();
        for f in &bundle.files {
            if let Ok(content) = std::fs::read_to_string(f.as_std_path()) {
                let rel = f.strip_prefix(&bundle.root).unwrap_or(f.as_path()).to_string();
                entries.push(json!({"path": rel, "content": content}));
            }
        }
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        let blob = json!({"files": entries});
        let path = logger.save_json(SaveKind::Misc, "diagnostics", &blob).map_err(ForgeError::Other)?;
        let upload = self.upload(path.as_std_path(), "user_data").await?;
        let fid = upload.get("id").and_then(Value::as_str).unwrap_or("").to_string();
        if fid.is_empty() { Ok(Vec::new()) } else { Ok(vec![fid]) }
    }

    /// `_prepare_in_dir_upload`: zip the whole IN directory (excluding
    /// `venv`/`.venv`/`LOG`), upload the archive, and, when the model
    /// supports it, index it into its own vector store for `file_search`.
    async fn prepare_in_dir_upload(&self, cfg: &RunConfig, logger: &RunLogger) -> Result<Option<InDirInfo>, ForgeError> {
        let Some(in_dir) = &cfg.in_dir else { return Ok(None) };
        if !in_dir.is_dir() {
            return Ok(None);
        }

        let zip_path = self.zip_in_dir(in_dir, logger)?;
        let upload = self.upload(zip_path.as_std_path(), "user_data").await?;
        let file_id = upload
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| ForgeError::VectorStoreFailed("upload_file returned no id for IN-dir archive".to_string()))?
            .to_string();
        let _ = logger.event(
            "upload.in_dir",
            json!({"zip": zip_path.as_str(), "file_id": file_id, "bytes": std::fs::metadata(&zip_path).map(|m| m.len()).unwrap_or(0)}),
        );

        let mut vector_store_id = None;
        if cfg.model_caps.supports_vector_store.as_bool() {
            match self.index_in_dir_archive(&file_id, logger).await {
                Ok(vs_id) => {
                    let _ = logger.event("vector_store.in_dir", json!({"vector_store_id": vs_id, "file_id": file_id}));
                    vector_store_id = Some(vs_id);
                }
                Err(e) => {
                    let _ = logger.event("vector_store.in_dir_failed", json!({"error": e.to_string()}));
                }
            }
        }

        Ok(Some(InDirInfo { zip_path, file_id, vector_store_id }))
    }

    /// `_zip_in_dir`: archive every file under `root` except the `venv`,
    /// `.venv`, and `LOG` subtrees into the run's files directory.
    fn zip_in_dir(&self, root: &Utf8Path, logger: &RunLogger) -> Result<Utf8PathBuf, ForgeError> {
        let filters = ScanFilters {
            deny_dirs: vec!["venv".to_string(), ".venv".to_string(), "LOG".to_string()],
            ..ScanFilters::default()
        };
        let root_name = root.file_name().unwrap_or("in").to_string();
        let items = scan_tree(root, &root_name, &filters).map_err(ForgeError::Other)?;

        let zip_path = logger.paths().files_dir.join(format!("in_dir_{}.zip", logger.paths().run_id));
        let file = std::fs::File::create(zip_path.as_std_path()).map_err(ForgeError::Io)?;
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        for item in &items {
            let rel = item.abs_path.strip_prefix(root).unwrap_or(&item.abs_path).as_str().replace('\\', "/");
            let Ok(bytes) = std::fs::read(item.abs_path.as_std_path()) else {
                let _ = logger.event("zip.skip", json!({"path": item.abs_path.as_str()}));
                continue;
            };
            writer.start_file(rel, options.clone()).map_err(|e| ForgeError::Other(anyhow::anyhow!(e)))?;
            std::io::Write::write_all(&mut writer, &bytes).map_err(ForgeError::Io)?;
        }
        writer.finish().map_err(|e| ForgeError::Other(anyhow::anyhow!(e)))?;
        Ok(zip_path)
    }

    async fn index_in_dir_archive(&self, file_id: &str, logger: &RunLogger) -> Result<String, ForgeError> {
        let vs = {
            let mut breaker = self.breaker.lock().await;
            with_retry(
                || async { self.client.create_vector_store("forgechain-in-dir").await },
                &self.policy,
                Some(&mut breaker),
                is_transient,
            )
            .await?
        };
        let vs_id = vs
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| ForgeError::VectorStoreFailed("create_vector_store returned no id".to_string()))?
            .to_string();

        let vs_file = {
            let mut breaker = self.breaker.lock().await;
            with_retry(
                || async { self.client.add_file_to_vector_store(&vs_id, file_id).await },
                &self.policy,
                Some(&mut breaker),
                is_transient,
            )
            .await?
        };
        if let Some(vs_file_id) = vs_file.get("id").and_then(Value::as_str) {
            self.wait_vector_store_files(&vs_id, std::slice::from_ref(&vs_file_id.to_string()), logger).await?;
        }
        Ok(vs_id)
    }

    async fn attach_diagnostics_vector_store(&self, diag_file_ids: &[String], logger: &RunLogger) -> Result<String, ForgeError> {
        let vs = {
            let mut breaker = self.breaker.lock().await;
            with_retry(
                || async { self.client.create_vector_store("forgechain-diagnostics").await },
                &self.policy,
                Some(&mut breaker),
                is_transient,
            )
            .await?
        };
        let vs_id = vs
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| ForgeError::VectorStoreFailed("create_vector_store returned no id".to_string()))?
            .to_string();

        for fid in diag_file_ids {
            self.check_stop()?;
            let mut breaker = self.breaker.lock().await;
            with_retry(
                || async { self.client.add_file_to_vector_store(&vs_id, fid).await },
                &self.policy,
                Some(&mut breaker),
                is_transient,
            )
            .await?;
        }

        self.wait_vector_store_files(&vs_id, diag_file_ids, logger).await?;
        Ok(vs_id)
    }

    /// Polls each attached file's indexing status every 2s, up to a 180s
    /// ceiling; a `failed` status aborts immediately rather than waiting out
    /// the timeout.
    async fn wait_vector_store_files(&self, vs_id: &str, file_ids: &[String], logger: &RunLogger) -> Result<(), ForgeError> {
        let deadline = Instant::now() + Duration::from_secs(180);
        loop {
            self.check_stop()?;
            let mut all_done = true;
            for fid in file_ids {
                let info = self.client.retrieve_vector_store_file(vs_id, fid).await?;
                let status = info.get("status").and_then(Value::as_str).unwrap_or("");
                if status == "failed" {
                    return Err(ForgeError::VectorStoreFailed(format!("file {fid} failed to index")));
                }
                if status != "completed" {
                    all_done = false;
                }
            }
            if all_done {
                let _ = logger.event("vector_store.ready", json!({"vector_store_id": vs_id}));
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ForgeError::VectorStoreFailed("timed out waiting for vector store indexing".to_string()));
            }
            tokio::time::sleep(Duration::from_secs_f64(2.0)).await;
        }
    }

    async fn run_qa(
        &self,
        cfg: &RunConfig,
        logger: &RunLogger,
        state: &mut RunState,
        prev_id: Option<String>,
        run_id: &str,
    ) -> Result<PipelineResult, ForgeError> {
        let instructions = "Jsi QA asistent. Vrat pouze cisty text bez markdownu, bez souboru.";
        let reminder = "Pozn.: Vrat pouze cisty text (bez markdownu) a neposilej zadne soubory.";
        let prompt = if cfg.prompt.contains(reminder) { cfg.prompt.clone() } else { format!("{}\n\n{reminder}", cfg.prompt) };

        let input = input_parts(&prompt, &file_ids_with_in_dir(cfg.input_file_ids_or_attached(), state));
        let payload = payload_base(
            &cfg.model,
            instructions,
            input,
            prev_id.as_deref(),
            cfg.temperature,
            cfg.model_caps.supports_temperature.as_bool(),
        );
        logger.save_json(SaveKind::Requests, "QA", &payload).map_err(ForgeError::Other)?;
        let resp = self.call_response(payload).await?;
        logger.save_json(SaveKind::Responses, "QA", &resp).map_err(ForgeError::Other)?;

        let response_id = resp.get("id").and_then(Value::as_str).unwrap_or("").to_string();
        if !response_id.is_empty() {
            state.final_response_id = response_id.clone();
        }
        let text = extract_text_from_response(&resp);
        self.record_receipt(cfg, logger, state, &resp, "QA", "QA", Some(response_id.clone()), None, false, run_id).await?;

        Ok(PipelineResult { mode: "QA".to_string(), response_id, pricing_snapshot: false, extra: json!({"text": text}) })
    }

    async fn run_qfile(
        &self,
        cfg: &RunConfig,
        logger: &RunLogger,
        state: &mut RunState,
        prev_id: Option<String>,
        run_id: &str,
    ) -> Result<PipelineResult, ForgeError> {
        if cfg.prompt.trim().is_empty() {
            return Err(ForgeError::Contract("QFILE: Zadani je prazdne.".to_string()));
        }

        let instructions = contract_instructions("A3_FILE");
        let prompt = format!(
            "{}\n\nVrat jediny soubor jako JSON kontrakt A3_FILE s chunk_index=0, chunk_count=1, has_more=false.",
            cfg.prompt
        );
        let input = input_parts(&prompt, &file_ids_with_in_dir(cfg.input_file_ids_or_attached(), state));
        let payload = payload_base(&cfg.model, &instructions, input, prev_id.as_deref(), 0.0, cfg.model_caps.supports_temperature.as_bool());
        logger.save_json(SaveKind::Requests, "QFILE", &payload).map_err(ForgeError::Other)?;
        let resp = self.call_response(payload).await?;
        logger.save_json(SaveKind::Responses, "QFILE", &resp).map_err(ForgeError::Other)?;

        let response_id = resp.get("id").and_then(Value::as_str).unwrap_or("").to_string();
        if !response_id.is_empty() {
            state.final_response_id = response_id.clone();
        }
        let text = extract_text_from_response(&resp);
        let parsed = parse_json_strict(&text)?;
        if parsed.get("contract").and_then(Value::as_str) != Some("A3_FILE") {
            return Err(ForgeError::Contract("QFILE: expected contract A3_FILE".to_string()));
        }

        let has_more = parsed.get("chunking").and_then(|c| c.get("has_more")).and_then(Value::as_bool).unwrap_or(false);
        if has_more {
            return Err(ForgeError::Contract("QFILE: model returned has_more=true for a single-shot request".to_string()));
        }
        let path = parsed
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| ForgeError::Contract("QFILE: response missing path".to_string()))?
            .to_string();
        let content = parsed.get("content").and_then(Value::as_str).unwrap_or("").to_string();
        validate_paths(std::slice::from_ref(&parsed))?;

        let saved = self.save_out_files(cfg, logger, &[(path, content)]).await?;
        self.record_receipt(cfg, logger, state, &resp, "QFILE", "QFILE", Some(response_id.clone()), None, false, run_id).await?;

        Ok(PipelineResult {
            mode: "QFILE".to_string(),
            response_id,
            pricing_snapshot: false,
            extra: json!({"saved": saved, "contract": parsed, "text": text}),
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_a_generate(
        &self,
        cfg: &RunConfig,
        logger: &RunLogger,
        progress: &Option<mpsc::Sender<ProgressEvent>>,
        state: &mut RunState,
        prev_id: Option<String>,
        fs_tools: &Option<Vec<Value>>,
        run_id: &str,
    ) -> Result<PipelineResult, ForgeError> {
        self.check_stop()?;

        if let (Some(files), Some(resume_prev)) = (&cfg.resume_files, &cfg.resume_prev_id) {
            self.emit(progress, 10, 0, "resuming GENERATE from saved structure").await;
            let mut saved_files = Vec::new();
            for f in files {
                self.check_stop()?;
                let path = f.get("path").and_then(Value::as_str).unwrap_or("").to_string();
                if path.is_empty() || Self::is_skipped(cfg, &path) {
                    continue;
                }
                let content = self.gen_file_chunks(cfg, logger, state, resume_prev, "A3_FILE", &path, None).await?;
                saved_files.push((path, content));
            }
            let saved = self.save_out_files(cfg, logger, &saved_files).await?;
            return Ok(PipelineResult {
                mode: "GENERATE".to_string(),
                response_id: state.final_response_id.clone(),
                pricing_snapshot: false,
                extra: json!({"plan": Value::Null, "structure": {"files": files}, "saved": saved}),
            });
        }

        self.emit(progress, 5, 0, "A1 plan").await;
        let plan_instructions = contract_instructions("A1_PLAN");
        let input1 = input_parts(&cfg.prompt, &file_ids_with_in_dir(cfg.input_file_ids_or_attached(), state));
        let mut payload1 = payload_base(
            &cfg.model,
            &plan_instructions,
            input1,
            prev_id.as_deref(),
            cfg.temperature,
            cfg.model_caps.supports_temperature.as_bool(),
        );
        if let Some(tools) = fs_tools {
            payload1["tools"] = json!(tools);
            state.used_file_search = true;
        }
        logger.save_json(SaveKind::Requests, "A1_PLAN", &payload1).map_err(ForgeError::Other)?;
        let resp1 = self.call_response(payload1).await?;
        logger.save_json(SaveKind::Responses, "A1_PLAN", &resp1).map_err(ForgeError::Other)?;
        let resp1_id = resp1.get("id").and_then(Value::as_str).unwrap_or("").to_string();
        if !resp1_id.is_empty() {
            state.final_response_id = resp1_id.clone();
        }
        let plan = parse_json_strict(&extract_text_from_response(&resp1))?;
        if plan.get("contract").and_then(Value::as_str) != Some("A1_PLAN") {
            return Err(ForgeError::Contract("A1_PLAN contract mismatch".to_string()));
        }

        self.emit(progress, 20, 0, "A2 structure").await;
        let structure_instructions = contract_instructions("A2_STRUCTURE");
        let input2 = input_parts("Vytvor strukturu souboru (A2_STRUCTURE) na zaklade planu.", &[]);
        let payload2 = payload_base(
            &cfg.model,
            &structure_instructions,
            input2,
            Some(&resp1_id),
            cfg.temperature,
            cfg.model_caps.supports_temperature.as_bool(),
        );
        logger.save_json(SaveKind::Requests, "A2_STRUCTURE", &payload2).map_err(ForgeError::Other)?;
        let resp2 = self.call_response(payload2).await?;
        logger.save_json(SaveKind::Responses, "A2_STRUCTURE", &resp2).map_err(ForgeError::Other)?;
        let resp2_id = resp2.get("id").and_then(Value::as_str).unwrap_or("").to_string();
        if !resp2_id.is_empty() {
            state.final_response_id = resp2_id.clone();
        }
        let structure = parse_json_strict(&extract_text_from_response(&resp2))?;
        if structure.get("contract").and_then(Value::as_str) != Some("A2_STRUCTURE") {
            return Err(ForgeError::Contract("A2_STRUCTURE contract mismatch".to_string()));
        }
        let files = structure.get("files").and_then(Value::as_array).cloned().unwrap_or_default();
        validate_paths(&files)?;
        logger
            .save_json(SaveKind::Manifests, &format!("resume_structure_{run_id}"), &json!({"files": files, "prev_id": resp2_id}))
            .map_err(ForgeError::Other)?;

        let total = files.len().max(1);
        let mut saved_files = Vec::new();
        for (i, f) in files.iter().enumerate() {
            self.check_stop()?;
            let path = f.get("path").and_then(Value::as_str).unwrap_or("").to_string();
            if path.is_empty() || Self::is_skipped(cfg, &path) {
                continue;
            }
            self.emit(progress, (30 + (i * 60 / total)) as u8, 0, format!("generating {path}")).await;
            let content = self.gen_file_chunks(cfg, logger, state, &resp2_id, "A3_FILE", &path, None).await?;
            saved_files.push((path, content));
        }
        let saved = self.save_out_files(cfg, logger, &saved_files).await?;
        self.record_receipt(cfg, logger, state, &resp2, "GENERATE", "A", Some(resp2_id.clone()), None, false, run_id).await?;

        Ok(PipelineResult {
            mode: "GENERATE".to_string(),
            response_id: resp2_id,
            pricing_snapshot: false,
            extra: json!({"plan": plan, "structure": structure, "saved": saved}),
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_b_modify(
        &self,
        cfg: &RunConfig,
        logger: &RunLogger,
        progress: &Option<mpsc::Sender<ProgressEvent>>,
        state: &mut RunState,
        prev_id: Option<String>,
        mut vector_store_ids: Vec<String>,
        diag_file_ids: &[String],
        run_id: &str,
    ) -> Result<PipelineResult, ForgeError> {
        let in_dir = cfg.in_dir.as_ref().ok_or_else(|| ForgeError::Config("MODIFY mode requires an IN directory".to_string()))?;

        self.emit(progress, 5, 0, "scanning IN directory").await;
        let security = &self.settings.security;
        let filters = ScanFilters {
            deny_dirs: vec!["venv".to_string(), ".venv".to_string(), "LOG".to_string()],
            deny_extensions: security.deny_extensions_in.clone().unwrap_or_default(),
            allow_extensions: security.allow_extensions_in.clone().unwrap_or_default(),
            deny_globs: security.deny_globs_in.clone().unwrap_or_default(),
            allow_globs: security.allow_globs_in.clone().unwrap_or_default(),
            max_size_bytes: None,
        };
        let root_name = in_dir.file_name().unwrap_or("in").to_string();
        let items = scan_tree(in_dir, &root_name, &filters).map_err(ForgeError::Other)?;
        let manifest = build_manifest(in_dir, &items, None);
        let manifest_value = serde_json::to_value(&manifest).map_err(ForgeError::Json)?;
        let manifest_path = logger.save_json(SaveKind::Manifests, "in_manifest", &manifest_value).map_err(ForgeError::Other)?;

        let manifest_upload = self.upload(manifest_path.as_std_path(), "user_data").await?;
        let manifest_file_id = manifest_upload.get("id").and_then(Value::as_str).unwrap_or("").to_string();

        self.emit(progress, 15, 0, "uploading IN tree").await;
        let mut uploaded_ids = Vec::new();
        for item in items.iter().filter(|i| i.uploadable) {
            self.check_stop()?;
            let up = self.upload(item.abs_path.as_std_path(), "user_data").await?;
            if let Some(fid) = up.get("id").and_then(Value::as_str) {
                uploaded_ids.push(fid.to_string());
            }
        }

        let wants_fs = cfg.model_caps.supports_file_search.as_bool() && cfg.use_file_search;
        let mut vs_id_b = None;
        if wants_fs {
            match self.attach_manifest_vector_store(&manifest_file_id, &uploaded_ids, logger).await {
                Ok(vs_id) => {
                    vector_store_ids.push(vs_id.clone());
                    vs_id_b = Some(vs_id);
                }
                Err(e) => {
                    let _ = logger.event("vector_store.attach_failed", json!({"error": e.to_string()}));
                }
            }
        }
        let supports_fs = wants_fs && !vector_store_ids.is_empty();

        let mut ref_files = file_ids_with_in_dir(cfg.attached_file_ids.clone(), state);
        ref_files.extend(diag_file_ids.iter().cloned());
        ref_files.push(manifest_file_id.clone());
        ref_files.extend(uploaded_ids.iter().cloned());

        let mut input_files = file_ids_with_in_dir(cfg.input_file_ids_or_attached(), state);
        input_files.push(manifest_file_id.clone());
        input_files.extend(uploaded_ids.iter().cloned());

        self.emit(progress, 30, 0, "B1 plan").await;
        let b1_instructions = contract_instructions("B1_PLAN");
        let prompt_with_ref = append_io_reference(&cfg.prompt, &ref_files, &vector_store_ids);
        let input1 = input_parts(&prompt_with_ref, &input_files);
        let mut payload1 = payload_base(
            &cfg.model,
            &b1_instructions,
            input1,
            prev_id.as_deref(),
            cfg.temperature,
            cfg.model_caps.supports_temperature.as_bool(),
        );
        if supports_fs {
            payload1["tools"] = json!([{"type": "file_search", "vector_store_ids": vector_store_ids}]);
            state.used_file_search = true;
        }
        logger.save_json(SaveKind::Requests, "B1_PLAN", &payload1).map_err(ForgeError::Other)?;
        let resp1 = self.call_response(payload1).await?;
        logger.save_json(SaveKind::Responses, "B1_PLAN", &resp1).map_err(ForgeError::Other)?;
        let resp1_id = resp1.get("id").and_then(Value::as_str).unwrap_or("").to_string();
        if !resp1_id.is_empty() {
            state.final_response_id = resp1_id.clone();
        }
        let plan = parse_json_strict(&extract_text_from_response(&resp1))?;
        if plan.get("contract").and_then(Value::as_str) != Some("B1_PLAN") {
            return Err(ForgeError::Contract("B1_PLAN contract mismatch".to_string()));
        }

        self.emit(progress, 45, 0, "B2 structure").await;
        let b2_instructions = contract_instructions("B2_STRUCTURE");
        let input2 = input_parts("Na zaklade diagnozy a change_plan urci touched_files (B2_STRUCTURE).", &[]);
        let payload2 = payload_base(
            &cfg.model,
            &b2_instructions,
            input2,
            Some(&resp1_id),
            cfg.temperature,
            cfg.model_caps.supports_temperature.as_bool(),
        );
        logger.save_json(SaveKind::Requests, "B2_STRUCTURE", &payload2).map_err(ForgeError::Other)?;
        let resp2 = self.call_response(payload2).await?;
        logger.save_json(SaveKind::Responses, "B2_STRUCTURE", &resp2).map_err(ForgeError::Other)?;
        let resp2_id = resp2.get("id").and_then(Value::as_str).unwrap_or("").to_string();
        if !resp2_id.is_empty() {
            state.final_response_id = resp2_id.clone();
        }
        let structure = parse_json_strict(&extract_text_from_response(&resp2))?;
        if structure.get("contract").and_then(Value::as_str) != Some("B2_STRUCTURE") {
            return Err(ForgeError::Contract("B2_STRUCTURE contract mismatch".to_string()));
        }
        let touched = structure.get("touched_files").and_then(Value::as_array).cloned().unwrap_or_default();
        validate_paths(&touched)?;

        let total = touched.len().max(1);
        let mut saved_files = Vec::new();
        for (i, t) in touched.iter().enumerate() {
            self.check_stop()?;
            let path = t.get("path").and_then(Value::as_str).unwrap_or("").to_string();
            if path.is_empty() || Self::is_skipped(cfg, &path) {
                continue;
            }
            let action = t.get("action").and_then(Value::as_str).unwrap_or("modify");
            self.emit(progress, (55 + (i * 40 / total)) as u8, 0, format!("modifying {path}")).await;
            let content = self.gen_file_chunks(cfg, logger, state, &resp2_id, "B3_FILE", &path, Some(action)).await?;
            saved_files.push((path, content));
        }
        let saved = self.save_out_files(cfg, logger, &saved_files).await?;
        self.record_receipt(cfg, logger, state, &resp2, "MODIFY", "B", Some(resp2_id.clone()), None, false, run_id).await?;

        Ok(PipelineResult {
            mode: "MODIFY".to_string(),
            response_id: resp2_id,
            pricing_snapshot: false,
            extra: json!({
                "plan": plan,
                "structure": structure,
                "saved": saved,
                "vector_store_id": vs_id_b,
                "supports_file_search": supports_fs,
            }),
        })
    }

    async fn attach_manifest_vector_store(&self, manifest_file_id: &str, uploaded_ids: &[String], logger: &RunLogger) -> Result<String, ForgeError> {
        let vs = {
            let mut breaker = self.breaker.lock().await;
            with_retry(
                || async { self.client.create_vector_store("forgechain-modify").await },
                &self.policy,
                Some(&mut breaker),
                is_transient,
            )
            .await?
        };
        let vs_id = vs
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| ForgeError::VectorStoreFailed("create_vector_store returned no id".to_string()))?
            .to_string();

        let mut to_attach: Vec<String> = uploaded_ids.iter().take(2000).cloned().collect();
        to_attach.push(manifest_file_id.to_string());

        for fid in &to_attach {
            self.check_stop()?;
            let mut breaker = self.breaker.lock().await;
            with_retry(
                || async { self.client.add_file_to_vector_store(&vs_id, fid).await },
                &self.policy,
                Some(&mut breaker),
                is_transient,
            )
            .await?;
        }

        self.wait_vector_store_files(&vs_id, &to_attach, logger).await?;
        Ok(vs_id)
    }

    /// BATCH mode never chains `previous_response_id`, even if the caller
    /// supplied one — a fresh request is always submitted standalone.
    async fn run_c_batch(&self, cfg: &RunConfig, logger: &RunLogger, state: &RunState, run_id: &str) -> Result<PipelineResult, ForgeError> {
        let instructions = contract_instructions("C_FILES_ALL");
        let input = input_parts(&cfg.prompt, &file_ids_with_in_dir(cfg.input_file_ids_or_attached(), state));
        let mut body = json!({"model": cfg.model, "instructions": instructions, "input": input});
        if cfg.model_caps.supports_temperature.as_bool() {
            body["temperature"] = json!(cfg.temperature);
        }

        let custom_id = format!("{run_id}_C1");
        let jsonl_line = json!({"custom_id": custom_id, "method": "POST", "url": "/v1/responses", "body": body});
        let jsonl_text = format!("{}\n", serde_json::to_string(&jsonl_line).map_err(ForgeError::Json)?);
        let jsonl_path = logger.paths().requests_dir.join(format!("{custom_id}.jsonl"));
        write_file_atomic(&jsonl_path, &jsonl_text).map_err(ForgeError::Other)?;

        let upload = self.upload(jsonl_path.as_std_path(), "batch").await?;
        let input_file_id = upload.get("id").and_then(Value::as_str).unwrap_or("").to_string();

        let batch = {
            let mut breaker = self.breaker.lock().await;
            with_retry(
                || async { self.client.create_batch(&input_file_id, "/v1/responses").await },
                &self.policy,
                Some(&mut breaker),
                is_transient,
            )
            .await?
        };
        let batch_id = batch.get("id").and_then(Value::as_str).unwrap_or("").to_string();
        let status = batch.get("status").and_then(Value::as_str).unwrap_or("").to_string();
        logger.update_state(json!({"batch_id": batch_id, "batch_status": status})).map_err(ForgeError::Other)?;

        Ok(PipelineResult {
            mode: "C".to_string(),
            response_id: String::new(),
            pricing_snapshot: false,
            extra: json!({"batch_id": batch_id, "status": status, "input_file_id": input_file_id}),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::NoDiagnostics;
    use async_trait::async_trait;
    use chrono::Utc as ChronoUtc;
    use forgechain_capability::ModelCapabilities;
    use forgechain_utils::types::Support;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicU32;

    struct StubClient {
        responses_issued: AtomicU32,
    }

    impl StubClient {
        fn new() -> Self {
            Self { responses_issued: AtomicU32::new(0) }
        }
    }

    #[async_trait]
    impl RemoteClient for StubClient {
        async fn create_response(&self, payload: Value) -> Result<Value, ForgeError> {
            let n = self.responses_issued.fetch_add(1, Ordering::SeqCst);
            let instructions = payload.get("instructions").and_then(Value::as_str).unwrap_or("");
            let text = if instructions.contains("A1_PLAN") {
                r#"{"contract":"A1_PLAN","plan":"do the thing","notes":"n/a"}"#.to_string()
            } else if instructions.contains("A2_STRUCTURE") {
                r#"{"contract":"A2_STRUCTURE","root":"out","files":[{"path":"main.rs","purpose":"entry","language":"rust","generated_in_phase":"A3"}]}"#
                    .to_string()
            } else if instructions.contains("A3_FILE") || instructions.contains("B3_FILE") {
                let contract = if instructions.contains("B3_FILE") { "B3_FILE" } else { "A3_FILE" };
                format!(
                    r#"{{"contract":"{contract}","path":"main.rs","action":"modify","content":"fn main() {{}}","notes":"","chunking":{{"chunk_index":0,"chunk_count":1,"has_more":false,"next_chunk_index":null}}}}"#
                )
            } else if instructions.contains("B1_PLAN") {
                r#"{"contract":"B1_PLAN","diagnosis":"stale dep","change_plan":"bump version","missing_inputs":[]}"#.to_string()
            } else if instructions.contains("B2_STRUCTURE") {
                r#"{"contract":"B2_STRUCTURE","touched_files":[{"path":"main.rs","action":"modify","intent":"bump"}],"invariants":[]}"#
                    .to_string()
            } else {
                "plain text answer".to_string()
            };
            Ok(json!({"id": format!("resp_{n}"), "output_text": text, "usage": {"input_tokens": 10, "output_tokens": 5}}))
        }

        async fn upload_file(&self, _path: &Path, _purpose: &str) -> Result<Value, ForgeError> {
            Ok(json!({"id": "file_abc"}))
        }

        async fn create_vector_store(&self, _name: &str) -> Result<Value, ForgeError> {
            Ok(json!({"id": "vs_1"}))
        }

        async fn add_file_to_vector_store(&self, _vector_store_id: &str, _file_id: &str) -> Result<Value, ForgeError> {
            Ok(json!({"status": "in_progress"}))
        }

        async fn retrieve_vector_store_file(&self, _vector_store_id: &str, _file_id: &str) -> Result<Value, ForgeError> {
            Ok(json!({"status": "completed"}))
        }

        async fn create_batch(&self, _input_file_id: &str, _endpoint: &str) -> Result<Value, ForgeError> {
            Ok(json!({"id": "batch_1", "status": "validating"}))
        }

        async fn retrieve_batch(&self, _batch_id: &str) -> Result<Value, ForgeError> {
            Ok(json!({"id": "batch_1", "status": "completed"}))
        }
    }

    fn caps() -> ModelCapabilities {
        ModelCapabilities {
            model: "gpt-4o-mini".to_string(),
            tested_at: ChronoUtc::now(),
            ok_basic: true,
            supports_previous_response_id: Support::Yes,
            supports_temperature: Support::Yes,
            supports_tools: Support::Yes,
            supports_file_search: Support::No("not needed in these tests".to_string()),
            supports_vector_store: Support::No("not needed in these tests".to_string()),
            notes: String::new(),
            errors: HashMap::new(),
        }
    }

    fn orchestrator(client: StubClient) -> (PipelineOrchestrator, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let log_dir = camino::Utf8PathBuf::from_path_buf(tmp.path().join("LOG")).unwrap();
        let db = Arc::new(StdMutex::new(ReceiptDb::in_memory().unwrap()));
        let orch = PipelineOrchestrator::new(
            Arc::new(client),
            Arc::new(NoDiagnostics),
            db,
            PriceTable::builtin_fallback(),
            Settings::default(),
            RetryPolicy { max_attempts: 2, ..RetryPolicy::default() },
            log_dir,
        );
        (orch, tmp)
    }

    fn base_cfg(mode: Mode, out_dir: &camino::Utf8Path) -> RunConfig {
        RunConfig {
            project: "demo".to_string(),
            prompt: "build a tiny rust binary".to_string(),
            mode,
            send_as_c: false,
            model: "gpt-4o-mini".to_string(),
            response_id: None,
            attached_file_ids: vec![],
            input_file_ids: vec![],
            attached_vector_store_ids: vec![],
            in_dir: None,
            out_dir: out_dir.to_path_buf(),
            versing: false,
            temperature: 0.2,
            use_file_search: false,
            skip_paths: vec![],
            skip_exts: vec![],
            model_caps: caps(),
            resume_files: None,
            resume_prev_id: None,
        }
    }

    #[tokio::test]
    async fn qa_mode_returns_text_and_records_a_receipt() {
        let (orch, tmp) = orchestrator(StubClient::new());
        let out_dir = camino::Utf8PathBuf::from_path_buf(tmp.path().join("out")).unwrap();
        let cfg = base_cfg(Mode::Qa, &out_dir);
        let result = orch.run(cfg, None).await.unwrap();
        assert_eq!(result.mode, "QA");
        assert!(!result.response_id.is_empty());
        assert_eq!(result.extra["text"], "plain text answer");
    }

    #[tokio::test]
    async fn qfile_mode_writes_the_single_file() {
        let (orch, tmp) = orchestrator(StubClient::new());
        let out_dir = camino::Utf8PathBuf::from_path_buf(tmp.path().join("out")).unwrap();
        let mut cfg = base_cfg(Mode::Qfile, &out_dir);
        cfg.prompt = "Vrat main.rs".to_string();
        let result = orch.run(cfg, None).await.unwrap();
        assert_eq!(result.mode, "QFILE");
        let written = std::fs::read_to_string(out_dir.join("main.rs")).unwrap();
        assert_eq!(written, "fn main() {}");
    }

    #[tokio::test]
    async fn qfile_mode_rejects_empty_prompt() {
        let (orch, tmp) = orchestrator(StubClient::new());
        let out_dir = camino::Utf8PathBuf::from_path_buf(tmp.path().join("out")).unwrap();
        let mut cfg = base_cfg(Mode::Qfile, &out_dir);
        cfg.prompt = "   ".to_string();
        let err = orch.run(cfg, None).await.unwrap_err();
        assert!(matches!(err, ForgeError::Contract(_)));
    }

    #[tokio::test]
    async fn generate_mode_runs_plan_structure_and_per_file_chunks() {
        let (orch, tmp) = orchestrator(StubClient::new());
        let out_dir = camino::Utf8PathBuf::from_path_buf(tmp.path().join("out")).unwrap();
        let cfg = base_cfg(Mode::Generate, &out_dir);
        let result = orch.run(cfg, None).await.unwrap();
        assert_eq!(result.mode, "GENERATE");
        assert!(result.extra["plan"]["plan"].is_string());
        let written = std::fs::read_to_string(out_dir.join("main.rs")).unwrap();
        assert_eq!(written, "fn main() {}");
    }

    #[tokio::test]
    async fn generate_resume_path_skips_plan_and_structure() {
        let (orch, tmp) = orchestrator(StubClient::new());
        let out_dir = camino::Utf8PathBuf::from_path_buf(tmp.path().join("out")).unwrap();
        let mut cfg = base_cfg(Mode::Generate, &out_dir);
        cfg.resume_files = Some(vec![json!({"path": "main.rs"})]);
        cfg.resume_prev_id = Some("resp_prev".to_string());
        let result = orch.run(cfg, None).await.unwrap();
        assert_eq!(result.mode, "GENERATE");
        assert!(result.extra["plan"].is_null());
        let written = std::fs::read_to_string(out_dir.join("main.rs")).unwrap();
        assert_eq!(written, "fn main() {}");
    }

    #[tokio::test]
    async fn batch_mode_returns_a_batch_id_without_a_receipt() {
        let (orch, tmp) = orchestrator(StubClient::new());
        let out_dir = camino::Utf8PathBuf::from_path_buf(tmp.path().join("out")).unwrap();
        let mut cfg = base_cfg(Mode::Generate, &out_dir);
        cfg.send_as_c = true;
        let result = orch.run(cfg, None).await.unwrap();
        assert_eq!(result.mode, "C");
        assert_eq!(result.extra["batch_id"], "batch_1");
    }

    #[tokio::test]
    async fn previous_response_id_unsupported_blocks_non_batch_modes() {
        let (orch, tmp) = orchestrator(StubClient::new());
        let out_dir = camino::Utf8PathBuf::from_path_buf(tmp.path().join("out")).unwrap();
        let mut cfg = base_cfg(Mode::Generate, &out_dir);
        cfg.model_caps.supports_previous_response_id = Support::No("model rejects it".to_string());
        let err = orch.run(cfg, None).await.unwrap_err();
        assert!(matches!(err, ForgeError::ContinuationInvalid(_)));
    }

    #[tokio::test]
    async fn qfile_cannot_be_combined_with_batch() {
        let (orch, tmp) = orchestrator(StubClient::new());
        let out_dir = camino::Utf8PathBuf::from_path_buf(tmp.path().join("out")).unwrap();
        let mut cfg = base_cfg(Mode::Qfile, &out_dir);
        cfg.send_as_c = true;
        let err = orch.run(cfg, None).await.unwrap_err();
        assert!(matches!(err, ForgeError::Contract(_)));
    }

    #[tokio::test]
    async fn stop_flag_cancels_an_in_flight_run() {
        let (orch, tmp) = orchestrator(StubClient::new());
        let out_dir = camino::Utf8PathBuf::from_path_buf(tmp.path().join("out")).unwrap();
        let cfg = base_cfg(Mode::Qa, &out_dir);
        orch.request_stop();
        let err = orch.run(cfg, None).await.unwrap_err();
        assert!(matches!(err, ForgeError::CancelRequested));
    }

    #[tokio::test]
    async fn versioning_snapshot_is_created_before_overwriting_out_files() {
        let (orch, tmp) = orchestrator(StubClient::new());
        let out_dir = camino::Utf8PathBuf::from_path_buf(tmp.path().join("out")).unwrap();
        std::fs::create_dir_all(out_dir.as_std_path()).unwrap();
        std::fs::write(out_dir.join("main.rs").as_std_path(), "old content").unwrap();
        let mut cfg = base_cfg(Mode::Qfile, &out_dir);
        cfg.versing = true;
        cfg.prompt = "Vrat main.rs".to_string();
        orch.run(cfg, None).await.unwrap();
        let snapshots: Vec<_> = std::fs::read_dir(out_dir.as_std_path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with("out") && e.path().is_dir())
            .collect();
        assert_eq!(snapshots.len(), 1);
    }
}
