//! Remote service client abstraction (§4.1).
//!
//! One trait, multiple constructible implementations, injected as an
//! explicit collaborator into the orchestrator rather than held as a
//! process-wide global (Design Note §9). The HTTP implementation ports
//! `openai_client.py`'s request shape onto `reqwest`, reusing
//! [`forgechain_retry`] for the backoff/circuit-breaker loop the way the
//! teacher's `llm::http_client::HttpClient` reuses its own retry constants.

use async_trait::async_trait;
use forgechain_retry::{CircuitBreaker, RetryPolicy, is_transient_status, with_retry};
use forgechain_utils::error::ForgeError;
use reqwest::StatusCode;
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use tokio::sync::Mutex;

/// Everything the orchestrator needs from the remote language-model service.
/// Mirrors the subset of `OpenAIClient`'s methods this system actually calls:
/// responses, file upload, and vector store management for `file_search`.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn create_response(&self, payload: Value) -> Result<Value, ForgeError>;
    async fn upload_file(&self, path: &Path, purpose: &str) -> Result<Value, ForgeError>;
    async fn create_vector_store(&self, name: &str) -> Result<Value, ForgeError>;
    async fn add_file_to_vector_store(&self, vector_store_id: &str, file_id: &str) -> Result<Value, ForgeError>;
    async fn retrieve_vector_store_file(&self, vector_store_id: &str, file_id: &str) -> Result<Value, ForgeError>;
    async fn create_batch(&self, input_file_id: &str, endpoint: &str) -> Result<Value, ForgeError>;
    async fn retrieve_batch(&self, batch_id: &str) -> Result<Value, ForgeError>;
}

fn map_status_error(status: StatusCode, body: String) -> ForgeError {
    ForgeError::RemoteRejection { status: status.as_u16(), body }
}

/// HTTP implementation backed by `reqwest`, talking to an OpenAI-compatible
/// Responses API.
pub struct HttpRemoteClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    policy: RetryPolicy,
    breaker: Mutex<CircuitBreaker>,
}

impl HttpRemoteClient {
    pub fn new(api_key: impl Into<String>) -> anyhow::Result<Self> {
        Self::with_base_url(api_key, "https://api.openai.com/v1")
    }

    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;
        let policy = RetryPolicy::default();
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            breaker: Mutex::new(CircuitBreaker::from_policy(&policy)),
            policy,
        })
    }

    async fn post_json(&self, path: &str, body: &Value, timeout: Duration) -> Result<Value, ForgeError> {
        let mut breaker = self.breaker.lock().await;
        let url = format!("{}{}", self.base_url, path);

        let result = with_retry(
            || async {
                let resp = self
                    .client
                    .post(&url)
                    .bearer_auth(&self.api_key)
                    .timeout(timeout)
                    .json(body)
                    .send()
                    .await
                    .map_err(|e| ForgeError::RemoteTransientExhausted(e.to_string()))?;

                let status = resp.status();
                if status.is_success() {
                    return resp.json::<Value>().await.map_err(|e| ForgeError::Contract(e.to_string()));
                }

                let text = resp.text().await.unwrap_or_default();
                Err(map_status_error(status, text))
            },
            &self.policy,
            Some(&mut breaker),
            |e: &ForgeError| {
                matches!(e, ForgeError::RemoteTransientExhausted(_))
                    || matches!(e, ForgeError::RemoteRejection { status, .. } if is_transient_status(StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)))
            },
        )
        .await;

        result
    }
}

#[async_trait]
impl RemoteClient for HttpRemoteClient {
    async fn create_response(&self, payload: Value) -> Result<Value, ForgeError> {
        self.post_json("/responses", &payload, Duration::from_secs(120)).await
    }

    async fn upload_file(&self, path: &Path, purpose: &str) -> Result<Value, ForgeError> {
        let bytes = tokio::fs::read(path).await.map_err(ForgeError::Io)?;
        let filename = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
        let part = reqwest::multipart::Part::bytes(bytes).file_name(filename);
        let form = reqwest::multipart::Form::new().text("purpose", purpose.to_string()).part("file", part);

        let url = format!("{}/files", self.base_url);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| ForgeError::RemoteTransientExhausted(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(map_status_error(status, text));
        }
        resp.json::<Value>().await.map_err(|e| ForgeError::Contract(e.to_string()))
    }

    async fn create_vector_store(&self, name: &str) -> Result<Value, ForgeError> {
        self.post_json("/vector_stores", &serde_json::json!({"name": name}), Duration::from_secs(60)).await
    }

    async fn add_file_to_vector_store(&self, vector_store_id: &str, file_id: &str) -> Result<Value, ForgeError> {
        let path = format!("/vector_stores/{vector_store_id}/files");
        self.post_json(&path, &serde_json::json!({"file_id": file_id}), Duration::from_secs(60)).await
    }

    async fn retrieve_vector_store_file(&self, vector_store_id: &str, file_id: &str) -> Result<Value, ForgeError> {
        let url = format!("{}/vector_stores/{vector_store_id}/files/{file_id}", self.base_url);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| ForgeError::RemoteTransientExhausted(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(map_status_error(status, text));
        }
        resp.json::<Value>().await.map_err(|e| ForgeError::Contract(e.to_string()))
    }

    async fn create_batch(&self, input_file_id: &str, endpoint: &str) -> Result<Value, ForgeError> {
        self.post_json(
            "/batches",
            &serde_json::json!({"input_file_id": input_file_id, "endpoint": endpoint, "completion_window": "24h"}),
            Duration::from_secs(60),
        )
        .await
    }

    async fn retrieve_batch(&self, batch_id: &str) -> Result<Value, ForgeError> {
        let url = format!("{}/batches/{}", self.base_url, batch_id);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| ForgeError::RemoteTransientExhausted(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(map_status_error(status, text));
        }
        resp.json::<Value>().await.map_err(|e| ForgeError::Contract(e.to_string()))
    }
}

/// Split `text` into chunks of at most `max_chars`, matching `split_text` in
/// `model_capabilities.py` (used to shape long-prompt ingest input parts).
#[must_use]
pub fn split_text(text: &str, max_chars: usize) -> Vec<String> {
    if text.is_empty() {
        return vec![String::new()];
    }
    if max_chars == 0 {
        return vec![text.to_string()];
    }
    text.chars()
        .collect::<Vec<_>>()
        .chunks(max_chars)
        .map(|c| c.iter().collect())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_text_chunks_by_char_count() {
        let chunks = split_text("abcdefghij", 3);
        assert_eq!(chunks, vec!["abc", "def", "ghi", "j"]);
    }

    #[test]
    fn split_text_empty_yields_single_empty_chunk() {
        assert_eq!(split_text("", 10), vec![""]);
    }

    #[test]
    fn split_text_zero_max_chars_returns_whole_text() {
        assert_eq!(split_text("whole", 0), vec!["whole"]);
    }
}
