//! Per-subcommand execution, grounded on the teacher's
//! `src/cli/run.rs`'s `execute_*` dispatch shape: each function owns one
//! verb's collaborator wiring and returns `anyhow::Result<()>`, leaving exit
//! code translation to [`crate::run::run`].

use crate::args::{CascadeCommands, ModeArg, ResumeArgs, RunArgs};
use camino::Utf8PathBuf;
use forgechain_cascade::{CascadeDefinition, CascadeOrchestrator, CascadeRunConfig};
use forgechain_client::HttpRemoteClient;
use forgechain_config::Settings;
use forgechain_engine::{DiagnosticsCollector, Mode, NoDiagnostics, PipelineOrchestrator, RunConfig};
use forgechain_pricing::PriceTable;
use forgechain_receipt::ReceiptDb;
use forgechain_retry::RetryPolicy;
use std::sync::{Arc, Mutex as StdMutex};

fn api_key() -> anyhow::Result<String> {
    std::env::var("OPENAI_API_KEY")
        .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY must be set to reach the remote model service"))
}

fn utf8(path: &str) -> anyhow::Result<Utf8PathBuf> {
    Utf8PathBuf::from_path_buf(std::path::PathBuf::from(path))
        .map_err(|p| anyhow::anyhow!("path is not valid UTF-8: {}", p.display()))
}

async fn open_orchestrator(settings: &Settings) -> anyhow::Result<PipelineOrchestrator> {
    let client: Arc<dyn forgechain_client::RemoteClient> = Arc::new(HttpRemoteClient::new(api_key()?)?);
    let db_path = utf8(&settings.db_path)?;
    let db = ReceiptDb::open(&db_path)?;
    let price_table = PriceTable::builtin_fallback();
    let policy = RetryPolicy::from(&settings.retry);
    let log_dir = utf8(&settings.log_dir)?;
    Ok(PipelineOrchestrator::new(
        client,
        Arc::new(NoDiagnostics) as Arc<dyn DiagnosticsCollector>,
        Arc::new(StdMutex::new(db)),
        price_table,
        settings.clone(),
        policy,
        log_dir,
    ))
}

async fn probe_model(model: &str, settings: &Settings) -> anyhow::Result<forgechain_capability::ModelCapabilities> {
    let client = HttpRemoteClient::new(api_key()?)?;
    let policy = RetryPolicy::from(&settings.retry);
    let mut breaker = forgechain_retry::CircuitBreaker::from_policy(&policy);
    Ok(forgechain_capability::probe_one(&client, &policy, &mut breaker, model, None).await)
}

fn model_for(settings: &Settings, requested: Option<&String>) -> anyhow::Result<String> {
    requested
        .cloned()
        .filter(|m| !m.trim().is_empty())
        .or_else(|| Some(settings.default_model.clone()).filter(|m| !m.trim().is_empty()))
        .ok_or_else(|| anyhow::anyhow!("no --model given and no default_model configured"))
}

pub async fn execute_run(args: RunArgs, settings: &Settings) -> anyhow::Result<()> {
    let model = model_for(settings, args.model.as_ref())?;
    let caps = probe_model(&model, settings).await?;

    let (mode, send_as_c) = match args.mode {
        ModeArg::Generate => (Mode::Generate, false),
        ModeArg::Modify => (Mode::Modify, false),
        ModeArg::Qa => (Mode::Qa, false),
        ModeArg::Qfile => (Mode::Qfile, false),
        ModeArg::Batch => (Mode::Generate, true),
    };

    let prompt = std::fs::read_to_string(&args.prompt_file)
        .map_err(|e| anyhow::anyhow!("failed to read --prompt-file {}: {e}", args.prompt_file))?;

    let cfg = RunConfig {
        project: args.project,
        prompt,
        mode,
        send_as_c,
        model,
        response_id: args.response_id,
        attached_file_ids: vec![],
        input_file_ids: vec![],
        attached_vector_store_ids: vec![],
        in_dir: args.in_dir.as_deref().map(utf8).transpose()?,
        out_dir: utf8(&args.out_dir)?,
        versing: args.versing,
        temperature: args.temperature.unwrap_or(settings.default_temperature),
        use_file_search: args.use_file_search,
        skip_paths: vec![],
        skip_exts: vec![],
        model_caps: caps,
        resume_files: None,
        resume_prev_id: None,
    };

    let orchestrator = open_orchestrator(settings).await?;
    let result = orchestrator.run(cfg, None).await?;
    println!(
        "{}",
        serde_json::json!({
            "mode": result.mode,
            "response_id": result.response_id,
            "pricing_snapshot": result.pricing_snapshot,
        })
    );
    Ok(())
}

pub async fn execute_resume(args: ResumeArgs, settings: &Settings) -> anyhow::Result<()> {
    let model = model_for(settings, args.model.as_ref())?;
    let caps = probe_model(&model, settings).await?;

    let files_text = std::fs::read_to_string(&args.files_json)
        .map_err(|e| anyhow::anyhow!("failed to read --files-json {}: {e}", args.files_json))?;
    let files: Vec<serde_json::Value> = serde_json::from_str(&files_text)
        .map_err(|e| anyhow::anyhow!("--files-json is not a JSON array: {e}"))?;

    let cfg = RunConfig {
        project: args.project,
        prompt: String::new(),
        mode: Mode::Generate,
        send_as_c: false,
        model,
        response_id: None,
        attached_file_ids: vec![],
        input_file_ids: vec![],
        attached_vector_store_ids: vec![],
        in_dir: None,
        out_dir: utf8(&args.out_dir)?,
        versing: args.versing,
        temperature: settings.default_temperature,
        use_file_search: false,
        skip_paths: vec![],
        skip_exts: vec![],
        model_caps: caps,
        resume_files: Some(files),
        resume_prev_id: Some(args.response_id),
    };

    let orchestrator = open_orchestrator(settings).await?;
    let result = orchestrator.run(cfg, None).await?;
    println!("{}", serde_json::json!({"mode": result.mode, "response_id": result.response_id}));
    Ok(())
}

pub async fn execute_cascade(cmd: CascadeCommands, settings: &Settings) -> anyhow::Result<()> {
    match cmd {
        CascadeCommands::Validate { definition } => {
            let text = std::fs::read_to_string(&definition)
                .map_err(|e| anyhow::anyhow!("failed to read {definition}: {e}"))?;
            let value: serde_json::Value = serde_json::from_str(&text)
                .map_err(|e| anyhow::anyhow!("{definition} is not valid JSON: {e}"))?;
            let cascade = CascadeDefinition::from_value(&value);
            if cascade.steps.is_empty() {
                anyhow::bail!("{definition} defines no steps");
            }
            println!("{}", serde_json::json!({"name": cascade.name, "steps": cascade.steps.len()}));
            Ok(())
        }
        CascadeCommands::Run { definition, out_dir, project } => {
            let text = std::fs::read_to_string(&definition)
                .map_err(|e| anyhow::anyhow!("failed to read {definition}: {e}"))?;
            let value: serde_json::Value = serde_json::from_str(&text)
                .map_err(|e| anyhow::anyhow!("{definition} is not valid JSON: {e}"))?;
            let cascade = CascadeDefinition::from_value(&value);

            let client: Arc<dyn forgechain_client::RemoteClient> = Arc::new(HttpRemoteClient::new(api_key()?)?);
            let policy = RetryPolicy::from(&settings.retry);
            let log_dir = utf8(&settings.log_dir)?;
            let orchestrator = CascadeOrchestrator::new(client, policy, log_dir);

            let run_cfg = CascadeRunConfig {
                project: project.unwrap_or_else(|| cascade.name.clone()),
                cascade,
                out_dir: out_dir.as_deref().map(utf8).transpose()?,
            };
            let result = orchestrator.run(run_cfg, None).await?;
            println!(
                "{}",
                serde_json::json!({"run_id": result.run_id, "response_id": result.response_id, "steps": result.step_response_ids.len()})
            );
            Ok(())
        }
    }
}

pub async fn execute_audit(log_root: Option<String>, settings: &Settings) -> anyhow::Result<()> {
    let db_path = utf8(&settings.db_path)?;
    let db = ReceiptDb::open(&db_path)?;
    let remote: Option<Arc<dyn forgechain_client::RemoteClient>> = match api_key() {
        Ok(key) => Some(Arc::new(HttpRemoteClient::new(key)?)),
        Err(_) => None,
    };
    let auditor = forgechain_audit::PricingAuditor::new(settings, &db, remote, api_key().unwrap_or_default());

    let mut price_table = PriceTable::builtin_fallback();
    let log_dir = utf8(&log_root.unwrap_or_else(|| settings.log_dir.clone()))?;
    let summary = auditor.audit(&mut price_table, &log_dir).await;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

pub async fn execute_probe(models: Vec<String>, all: bool, vector_store_id: Option<String>, settings: &Settings) -> anyhow::Result<()> {
    if models.is_empty() {
        anyhow::bail!("probe requires at least one --model");
    }
    let cache_path = utf8(&settings.cache_dir)?.join("capabilities.json");
    let mut cache = forgechain_capability::ModelCapabilitiesCache::new(&cache_path);
    cache.load()?;

    let client = HttpRemoteClient::new(api_key()?)?;
    let policy = RetryPolicy::from(&settings.retry);
    let mut breaker = forgechain_retry::CircuitBreaker::from_policy(&policy);

    let mut report = Vec::new();
    for model in &models {
        if !all && !cache.is_stale(model, 24.0 * f64::from(settings.pricing.cache_ttl_hours.max(1))) {
            if let Some(caps) = cache.get(model) {
                report.push(caps.to_legacy_json());
                continue;
            }
        }
        let caps = forgechain_capability::probe_one(&client, &policy, &mut breaker, model, vector_store_id.as_deref()).await;
        report.push(caps.to_legacy_json());
        cache.upsert(caps);
    }
    cache.save()?;
    println!("{}", serde_json::Value::Array(report));
    Ok(())
}
