//! Generic cascade definitions and orchestrator (§3, §4.10).
//!
//! Grounded on `original_source/kajovo/core/{cascade_types,cascade_pipeline,cascade_log}.py`.
//! `cascade_pipeline.py` exists in the source tree in a single version; the
//! Design Note's "superset of duplicated orchestrators" resolves to: out-file
//! uploads always enabled, all four placeholder forms, and `text.format`
//! (never the stale `response_format` variant) for JSON-output steps.
//! The per-run directory/event/state contract is not reimplemented here —
//! [`forgechain_runlog::RunLogger`] already is that contract (`cascade_log.py`'s
//! `CascadeLogger` is byte-for-byte the same shape as `runlog.py`'s `RunLogger`).

pub mod orchestrator;
pub mod placeholder;
pub mod schema;
pub mod types;

pub use orchestrator::{CascadeOrchestrator, CascadeResult, CascadeRunConfig, ProgressEvent};
pub use placeholder::{PlaceholderError, StepContext};
pub use types::{CascadeDefinition, CascadeStep, OutputSchemaKind, OutputType};

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use forgechain_client::RemoteClient;
    use forgechain_retry::RetryPolicy;
    use forgechain_utils::error::ForgeError;
    use serde_json::{Value, json};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct StubClient {
        responses_issued: AtomicU32,
    }

    #[async_trait]
    impl RemoteClient for StubClient {
        async fn create_response(&self, payload: Value) -> Result<Value, ForgeError> {
            let n = self.responses_issued.fetch_add(1, Ordering::SeqCst);
            let wants_json = payload
                .get("text")
                .and_then(|t| t.get("format"))
                .is_some();
            let text = if wants_json {
                r#"{"files":[{"path":"out.txt","content":"hello"}]}"#.to_string()
            } else {
                "plain response text".to_string()
            };
            Ok(json!({"id": format!("resp_{n}"), "output_text": text}))
        }

        async fn upload_file(&self, _path: &std::path::Path, _purpose: &str) -> Result<Value, ForgeError> {
            Ok(json!({"id": "file_abc123"}))
        }

        async fn create_vector_store(&self, _name: &str) -> Result<Value, ForgeError> {
            unimplemented!("not exercised by cascade tests")
        }

        async fn add_file_to_vector_store(&self, _vector_store_id: &str, _file_id: &str) -> Result<Value, ForgeError> {
            unimplemented!("not exercised by cascade tests")
        }

        async fn retrieve_vector_store_file(&self, _vector_store_id: &str, _file_id: &str) -> Result<Value, ForgeError> {
            unimplemented!("not exercised by cascade tests")
        }

        async fn create_batch(&self, _input_file_id: &str, _endpoint: &str) -> Result<Value, ForgeError> {
            unimplemented!("not exercised by cascade tests")
        }

        async fn retrieve_batch(&self, _batch_id: &str) -> Result<Value, ForgeError> {
            unimplemented!("not exercised by cascade tests")
        }
    }

    fn text_step(title: &str, input_text: &str) -> CascadeStep {
        CascadeStep { title: title.to_string(), model: "gpt-4o-mini".to_string(), input_text: input_text.to_string(), ..Default::default() }
    }

    #[tokio::test]
    async fn two_text_steps_chain_previous_response_id() {
        let dir = tempfile::tempdir().unwrap();
        let base_log_dir = camino::Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let client = Arc::new(StubClient { responses_issued: AtomicU32::new(0) });
        let orchestrator = CascadeOrchestrator::new(client, RetryPolicy::default(), base_log_dir);

        let mut step2 = text_step("second", "chained");
        step2.previous_response_id_expr = Some("{{step.1.response_id}}".to_string());

        let cascade = CascadeDefinition {
            version: 1,
            name: "demo".to_string(),
            steps: vec![text_step("first", "hello"), step2],
            default_out_dir: String::new(),
            created_at: None,
            updated_at: None,
        };

        let cfg = CascadeRunConfig { project: "demo-project".to_string(), cascade, out_dir: None };
        let result = orchestrator.run(cfg, None).await.unwrap();

        assert_eq!(result.step_response_ids.len(), 2);
        assert_eq!(result.response_id, "resp_1");
    }

    #[tokio::test]
    async fn json_step_with_expected_out_files_writes_and_uploads() {
        let dir = tempfile::tempdir().unwrap();
        let base_log_dir = camino::Utf8PathBuf::from_path_buf(dir.path().join("LOG")).unwrap();
        let out_dir = tempfile::tempdir().unwrap();
        let out_path = camino::Utf8PathBuf::from_path_buf(out_dir.path().to_path_buf()).unwrap();

        let client = Arc::new(StubClient { responses_issued: AtomicU32::new(0) });
        let orchestrator = CascadeOrchestrator::new(client, RetryPolicy::default(), base_log_dir);

        let mut step = text_step("plan", "produce a manifest");
        step.output_type = OutputType::Json;
        step.output_schema_kind = Some(OutputSchemaKind::Manifest);
        step.expected_out_files = vec!["out.txt".to_string()];

        let cascade = CascadeDefinition {
            version: 1,
            name: "with-files".to_string(),
            steps: vec![step],
            default_out_dir: String::new(),
            created_at: None,
            updated_at: None,
        };

        let cfg = CascadeRunConfig { project: "demo".to_string(), cascade, out_dir: Some(out_path.clone()) };
        let result = orchestrator.run(cfg, None).await.unwrap();

        assert_eq!(result.step_json_outputs.len(), 1);
        let written = std::fs::read_to_string(out_path.join("out.txt")).unwrap();
        assert_eq!(written, "hello");
    }

    #[tokio::test]
    async fn missing_expected_output_in_manifest_fails_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let base_log_dir = camino::Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let out_dir = tempfile::tempdir().unwrap();
        let out_path = camino::Utf8PathBuf::from_path_buf(out_dir.path().to_path_buf()).unwrap();

        let client = Arc::new(StubClient { responses_issued: AtomicU32::new(0) });
        let orchestrator = CascadeOrchestrator::new(client, RetryPolicy::default(), base_log_dir);

        let mut step = text_step("plan", "produce a manifest");
        step.output_type = OutputType::Json;
        step.output_schema_kind = Some(OutputSchemaKind::Manifest);
        step.expected_out_files = vec!["not_in_manifest.txt".to_string()];

        let cascade = CascadeDefinition {
            version: 1,
            name: "missing-file".to_string(),
            steps: vec![step],
            default_out_dir: String::new(),
            created_at: None,
            updated_at: None,
        };

        let cfg = CascadeRunConfig { project: "demo".to_string(), cascade, out_dir: Some(out_path) };
        let err = orchestrator.run(cfg, None).await.unwrap_err();
        assert!(matches!(err, ForgeError::Contract(_)));
    }

    #[tokio::test]
    async fn cancellation_before_first_step_yields_cancel_requested() {
        let dir = tempfile::tempdir().unwrap();
        let base_log_dir = camino::Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let client = Arc::new(StubClient { responses_issued: AtomicU32::new(0) });
        let orchestrator = CascadeOrchestrator::new(client, RetryPolicy::default(), base_log_dir);
        orchestrator.request_stop();

        let cascade = CascadeDefinition {
            version: 1,
            name: "demo".to_string(),
            steps: vec![text_step("first", "hello")],
            default_out_dir: String::new(),
            created_at: None,
            updated_at: None,
        };
        let cfg = CascadeRunConfig { project: "demo".to_string(), cascade, out_dir: None };
        let err = orchestrator.run(cfg, None).await.unwrap_err();
        assert!(matches!(err, ForgeError::CancelRequested));
    }
}
