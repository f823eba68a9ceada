//! Generic N-step cascade executor (§4.10), ported from
//! `cascade_pipeline.py::CascadeRunWorker.run` onto an async `tokio` task
//! reporting progress over an `mpsc` channel in place of the original's Qt
//! signals (§5's async analogue of the Qt-signal boundary).

use crate::placeholder::{StepContext, resolve_json, resolve_text};
use crate::schema::{schema_for, validate_json_output, validate_schema_minimal};
use crate::types::{CascadeDefinition, CascadeStep, OutputSchemaKind, OutputType};
use camino::Utf8PathBuf;
use chrono::Utc;
use forgechain_client::{RemoteClient, split_text};
use forgechain_contract::{extract_text_from_response, parse_json_strict};
use forgechain_retry::{CircuitBreaker, RetryPolicy, is_transient_status, with_retry};
use forgechain_runlog::{RunLogger, SaveKind};
use forgechain_utils::error::ForgeError;
use forgechain_utils::paths::SandboxRoot;
use forgechain_utils::types::{RunId, random_suffix};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, mpsc};
use tracing::{info, warn};

/// Per-run input: which cascade to execute, under which project name, and
/// where expected output files land.
pub struct CascadeRunConfig {
    pub project: String,
    pub cascade: CascadeDefinition,
    pub out_dir: Option<Utf8PathBuf>,
}

/// One update emitted on the progress channel — the async analogue of the
/// original's `progress`/`subprogress`/`status`/`logline` Qt signals.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    Progress { percent: u8, subpercent: u8, status: String },
    LogLine(String),
}

#[derive(Debug, Clone, Default)]
pub struct CascadeResult {
    pub run_id: String,
    pub response_id: String,
    pub step_response_ids: HashMap<String, String>,
    pub step_json_outputs: HashMap<String, Value>,
}

fn is_transient(err: &ForgeError) -> bool {
    matches!(err, ForgeError::RemoteTransientExhausted(_))
        || matches!(
            err,
            ForgeError::RemoteRejection { status, .. }
                if is_transient_status(reqwest::StatusCode::from_u16(*status).unwrap_or(reqwest::StatusCode::INTERNAL_SERVER_ERROR))
        )
}

fn developer_message(schema_kind: Option<OutputSchemaKind>) -> &'static str {
    match schema_kind {
        Some(OutputSchemaKind::Prompts) => {
            "Return only valid JSON matching the required schema: a single object with a top-level \"prompts\" array of {name, text} entries. No prose, no markdown fences."
        }
        _ => "Return only valid JSON matching the required schema. No prose, no markdown fences.",
    }
}

/// Owns one cascade run's execution. Long-lived collaborators (client,
/// retry policy, breaker, base log directory) are injected rather than
/// held as globals (Design Note, §9); the stop flag is shared so a caller
/// holding an `Arc` to it can request cancellation concurrently.
pub struct CascadeOrchestrator {
    client: Arc<dyn RemoteClient>,
    policy: RetryPolicy,
    breaker: Mutex<CircuitBreaker>,
    base_log_dir: Utf8PathBuf,
    stop: Arc<AtomicBool>,
}

impl CascadeOrchestrator {
    #[must_use]
    pub fn new(client: Arc<dyn RemoteClient>, policy: RetryPolicy, base_log_dir: Utf8PathBuf) -> Self {
        Self {
            breaker: Mutex::new(CircuitBreaker::from_policy(&policy)),
            policy,
            client,
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

    fn effective_out_dir(cfg: &CascadeRunConfig) -> Result<Utf8PathBuf, ForgeError> {
        if let Some(d) = &cfg.out_dir {
            return Ok(d.clone());
        }
        if !cfg.cascade.default_out_dir.trim().is_empty() {
            return Ok(Utf8PathBuf::from(cfg.cascade.default_out_dir.trim()));
        }
        Err(ForgeError::Config(
            "expected_out_files requires an OUT directory (none configured and cascade has no default_out_dir)".to_string(),
        ))
    }

    /// Execute the cascade described by `cfg`, reporting progress on
    /// `progress` if given. Always produces a terminal run-state record
    /// (`completed`, `stopped_by_user`, or `failed`) before returning.
    pub async fn run(
        &self,
        cfg: CascadeRunConfig,
        progress: Option<mpsc::Sender<ProgressEvent>>,
    ) -> Result<CascadeResult, ForgeError> {
        let run_id = RunId::new(Utc::now(), &random_suffix());
        let logger = RunLogger::create(&self.base_log_dir, run_id.clone(), &cfg.project)
            .map_err(ForgeError::Other)?;
        logger
            .update_state(json!({
                "status": "running",
                "started_at": Utc::now().to_rfc3339(),
                "mode": "CASCADE",
                "project": cfg.project,
                "cascade_name": cfg.cascade.name,
                "steps": cfg.cascade.steps.len(),
            }))
            .map_err(ForgeError::Other)?;

        info!(run_id = %run_id, cascade = %cfg.cascade.name, steps = cfg.cascade.steps.len(), "cascade run starting");
        self.emit(&progress, 1, 0, format!("cascade start: {}", cfg.cascade.name)).await;

        let mut outcome = self.run_steps(&cfg, &logger, &progress).await;
        if let Ok(result) = &mut outcome {
            result.run_id = run_id.as_str().to_string();
        }

        match &outcome {
            Ok(result) => {
                logger
                    .update_state(json!({
                        "status": "completed",
                        "finished_at": Utc::now().to_rfc3339(),
                        "last_response_id": result.response_id,
                        "steps_done": cfg.cascade.steps.len(),
                    }))
                    .map_err(ForgeError::Other)?;
                logger.event("cascade.completed", json!({
                    "run_id": result.run_id,
                    "response_id": result.response_id,
                })).map_err(ForgeError::Other)?;
            }
            Err(ForgeError::CancelRequested) => {
                logger
                    .update_state(json!({"status": "stopped_by_user", "finished_at": Utc::now().to_rfc3339()}))
                    .map_err(ForgeError::Other)?;
                logger.event("cascade.stopped", json!({})).map_err(ForgeError::Other)?;
            }
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "cascade run failed");
                logger
                    .update_state(json!({"status": "failed", "finished_at": Utc::now().to_rfc3339(), "error": e.to_string()}))
                    .map_err(ForgeError::Other)?;
                logger.event("cascade.failed", json!({"error": e.to_string()})).map_err(ForgeError::Other)?;
            }
        }

        outcome
    }

    async fn run_steps(
        &self,
        cfg: &CascadeRunConfig,
        logger: &RunLogger,
        progress: &Option<mpsc::Sender<ProgressEvent>>,
    ) -> Result<CascadeResult, ForgeError> {
        let mut ctx = StepContext::default();
        let mut step_response_ids: HashMap<String, String> = HashMap::new();
        let mut step_json_outputs: HashMap<String, Value> = HashMap::new();
        let mut last_response_id = String::new();
        let total = cfg.cascade.steps.len().max(1);

        for (pos, step) in cfg.cascade.steps.iter().enumerate() {
            self.check_stop()?;
            let idx = (pos + 1) as u32;
            let step_label = if step.title.is_empty() { format!("Step {idx}") } else { step.title.clone() };
            let base_percent = ((pos * 100) / total) as u8;
            self.emit(progress, base_percent, 0, format!("step {idx}/{total}: {step_label}")).await;
            logger
                .event("cascade.step.start", json!({"idx": idx, "title": step_label, "model": step.model}))
                .map_err(ForgeError::Other)?;

            let mut file_ids = step.files_existing_ids.clone();
            for local_path in &step.files_local_paths {
                self.check_stop()?;
                let resolved = resolve_text(local_path, &ctx)?;
                if resolved.is_empty() {
                    continue;
                }
                if !Path::new(&resolved).is_file() {
                    return Err(ForgeError::Contract(format!("local file does not exist: {resolved}")));
                }
                self.emit(progress, base_percent, 20, format!("uploading file for step {idx}: {resolved}")).await;
                logger.event("cascade.step.file_upload.start", json!({"idx": idx, "path": resolved})).map_err(ForgeError::Other)?;

                let upload = {
                    let mut breaker = self.breaker.lock().await;
                    with_retry(
                        || async { self.client.upload_file(Path::new(&resolved), "user_data").await },
                        &self.policy,
                        Some(&mut breaker),
                        is_transient,
                    )
                    .await?
                };
                let fid = upload.get("id").and_then(Value::as_str).unwrap_or("").trim().to_string();
                if fid.is_empty() {
                    return Err(ForgeError::Contract(format!("file upload did not return a file id: {resolved}")));
                }
                file_ids.push(fid.clone());
                logger
                    .event("cascade.step.file_upload.ok", json!({"idx": idx, "path": resolved, "file_id": fid}))
                    .map_err(ForgeError::Other)?;
            }

            let resolved_instructions = resolve_text(&step.instructions, &ctx)?;
            let resolved_input_text = resolve_text(&step.input_text, &ctx)?;
            let resolved_prev_expr = step
                .previous_response_id_expr
                .as_deref()
                .map(|expr| resolve_text(expr, &ctx))
                .transpose()?
                .unwrap_or_default();
            let resolved_content_json = step
                .input_content_json
                .as_ref()
                .map(|v| resolve_json(v, &ctx))
                .transpose()?;

            let mut content_parts: Vec<Value> = Vec::new();
            for chunk in split_text(&resolved_input_text, 20_000) {
                if !chunk.is_empty() {
                    content_parts.push(json!({"type": "input_text", "text": chunk}));
                }
            }
            for fid in &file_ids {
                if !fid.is_empty() {
                    content_parts.push(json!({"type": "input_file", "file_id": fid}));
                }
            }
            if let Some(resolved) = &resolved_content_json {
                match resolved {
                    Value::Array(parts) => {
                        for part in parts {
                            if !part.is_object() {
                                return Err(ForgeError::Contract(format!(
                                    "input_content_json list must contain object parts (step {idx})"
                                )));
                            }
                            content_parts.push(part.clone());
                        }
                    }
                    Value::Object(_) => content_parts.push(resolved.clone()),
                    _ => {
                        return Err(ForgeError::Contract(format!(
                            "input_content_json must be an object or list (step {idx})"
                        )));
                    }
                }
            }

            let schema = if step.output_type == OutputType::Json {
                let schema = schema_for(step.output_schema_kind, step.output_schema_custom.as_ref())
                    .ok_or_else(|| ForgeError::Contract(format!("step {idx}: output_type=json but no schema configured")))?;
                validate_schema_minimal(&schema)?;
                Some(schema)
            } else {
                None
            };

            let mut input_messages: Vec<Value> = Vec::new();
            if step.output_type == OutputType::Json {
                input_messages.push(json!({
                    "type": "message",
                    "role": "developer",
                    "content": [{"type": "input_text", "text": developer_message(step.output_schema_kind)}],
                }));
            }
            input_messages.push(json!({"type": "message", "role": "user", "content": content_parts}));

            let mut payload = json!({
                "model": step.model,
                "instructions": resolved_instructions,
                "input": input_messages,
            });
            if let Some(temp) = step.temperature {
                payload["temperature"] = json!(temp);
            }
            if !resolved_prev_expr.is_empty() {
                payload["previous_response_id"] = json!(resolved_prev_expr);
            }
            if let Some(schema) = &schema {
                payload["text"] = json!({
                    "format": {
                        "type": "json_schema",
                        "name": format!("cascade_step_{idx:02}_schema"),
                        "strict": true,
                        "schema": schema,
                    },
                });
            }

            logger
                .save_json(SaveKind::Requests, &format!("cascade_step_{idx:02}"), &payload)
                .map_err(ForgeError::Other)?;
            self.emit(progress, base_percent, 55, format!("request for step {idx}")).await;

            self.check_stop()?;
            let response = {
                let mut breaker = self.breaker.lock().await;
                with_retry(
                    || async { self.client.create_response(payload.clone()).await },
                    &self.policy,
                    Some(&mut breaker),
                    is_transient,
                )
                .await?
            };
            logger
                .save_json(SaveKind::Responses, &format!("cascade_step_{idx:02}"), &response)
                .map_err(ForgeError::Other)?;

            let response_id = response.get("id").and_then(Value::as_str).unwrap_or("").trim().to_string();
            if !response_id.is_empty() {
                ctx.set_response_id(idx, response_id.clone());
                step_response_ids.insert(idx.to_string(), response_id.clone());
                last_response_id = response_id.clone();
            }

            if step.output_type == OutputType::Json {
                let text = extract_text_from_response(&response);
                let parsed = parse_json_strict(&text)?;
                validate_json_output(&parsed, schema.as_ref().unwrap())?;
                ctx.set_json(idx, parsed.clone());
                step_json_outputs.insert(idx.to_string(), parsed.clone());
                logger
                    .save_json(SaveKind::Misc, &format!("cascade_step_{idx:02}_json"), &parsed)
                    .map_err(ForgeError::Other)?;

                if !step.expected_out_files.is_empty() {
                    self.write_expected_out_files(cfg, step, idx, &parsed, &mut ctx, logger).await?;
                }
            }

            logger
                .event(
                    "cascade.step.ok",
                    json!({
                        "idx": idx,
                        "title": step_label,
                        "response_id": response_id,
                        "json_output": step.output_type == OutputType::Json,
                        "file_ids": file_ids,
                    }),
                )
                .map_err(ForgeError::Other)?;
            self.emit(progress, (((pos + 1) * 100) / total) as u8, 100, format!("step {idx} complete")).await;
        }

        Ok(CascadeResult {
            run_id: "".to_string(),
            response_id: last_response_id,
            step_response_ids,
            step_json_outputs,
        })
    }

    /// Step 6 of §4.10: the step's parsed JSON must carry a `files` manifest
    /// covering every declared `expected_out_files` entry; write each one
    /// atomically under the sandboxed effective OUT dir, upload it, and
    /// record `(abs_path, file_id)` so later steps can reference it via
    /// `{{step.N.out_file_path:REL}}` / `{{step.N.out_file_id:REL}}`.
    async fn write_expected_out_files(
        &self,
        cfg: &CascadeRunConfig,
        step: &CascadeStep,
        idx: u32,
        parsed: &Value,
        ctx: &mut StepContext,
        logger: &RunLogger,
    ) -> Result<(), ForgeError> {
        let out_dir = Self::effective_out_dir(cfg)?;
        std::fs::create_dir_all(out_dir.as_std_path()).map_err(ForgeError::Io)?;
        let sandbox = SandboxRoot::new_default(out_dir.as_std_path())
            .map_err(|e| ForgeError::PathViolation(e.to_string()))?;

        let files = parsed
            .get("files")
            .and_then(Value::as_array)
            .ok_or_else(|| ForgeError::Contract(format!("step {idx}: expected_out_files set but response has no files[] manifest")))?;

        for rel in &step.expected_out_files {
            let entry = files
                .iter()
                .find(|f| f.get("path").and_then(Value::as_str) == Some(rel.as_str()))
                .ok_or_else(|| ForgeError::Contract(format!("step {idx}: expected output file missing from manifest: {rel}")))?;
            let content = entry.get("content").and_then(Value::as_str).unwrap_or("");

            let sandbox_path = sandbox.join(rel).map_err(|e| ForgeError::PathViolation(e.to_string()))?;
            let utf8_path = camino::Utf8PathBuf::from_path_buf(sandbox_path.as_path().to_path_buf())
                .map_err(|_| ForgeError::PathViolation(format!("non-UTF-8 output path: {rel}")))?;
            forgechain_utils::atomic_write::write_file_atomic(&utf8_path, content).map_err(ForgeError::Other)?;

            let upload = {
                let mut breaker = self.breaker.lock().await;
                with_retry(
                    || async { self.client.upload_file(sandbox_path.as_path(), "user_data").await },
                    &self.policy,
                    Some(&mut breaker),
                    is_transient,
                )
                .await?
            };
            let fid = upload.get("id").and_then(Value::as_str).unwrap_or("").trim().to_string();
            if fid.is_empty() {
                return Err(ForgeError::Contract(format!("upload of expected output file {rel} did not return a file id")));
            }

            logger
                .record_fs_change("write", rel, None, None, Some(content.len() as u64))
                .map_err(ForgeError::Other)?;
            ctx.set_out_file(idx, rel.clone(), sandbox_path.as_path().to_path_buf(), fid);
        }

        Ok(())
    }
}
