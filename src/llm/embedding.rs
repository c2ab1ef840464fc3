//! Batched embedding generation over an OpenAI-compatible `/embeddings`
//! endpoint. Input order is preserved; callers must never substitute zero
//! vectors on failure.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::core::error::{PipelineError, PipelineResult};

/// Provider-side batch cap: at most this many texts per wire call.
pub const MAX_BATCH: usize = 2048;

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed `texts`, one vector per input, same order.
    async fn embed(&self, texts: &[String]) -> PipelineResult<Vec<Vec<f32>>>;
}

pub struct HttpEmbedder {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl HttpEmbedder {
    pub fn new(
        client: reqwest::Client,
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    async fn embed_batch(&self, batch: &[String]) -> PipelineResult<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", self.endpoint.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&json!({ "model": self.model, "input": batch }))
            .send()
            .await
            .map_err(|e| PipelineError::EmbeddingUnavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::EmbeddingUnavailable(format!(
                "HTTP {}: {}",
                status, body
            )));
        }

        let envelope: Value = response
            .json()
            .await
            .map_err(|e| PipelineError::EmbeddingUnavailable(e.to_string()))?;
        let data = envelope["data"].as_array().ok_or_else(|| {
            PipelineError::EmbeddingUnavailable("missing data array in response".into())
        })?;
        if data.len() != batch.len() {
            return Err(PipelineError::EmbeddingUnavailable(format!(
                "expected {} embeddings, got {}",
                batch.len(),
                data.len()
            )));
        }

        // The API annotates each entry with its input index; order by it
        // rather than trusting response order.
        let mut vectors: Vec<Option<Vec<f32>>> = vec![None; batch.len()];
        for entry in data {
            let index = entry["index"].as_u64().ok_or_else(|| {
                PipelineError::EmbeddingUnavailable("embedding entry missing index".into())
            })? as usize;
            let vector: Vec<f32> = entry["embedding"]
                .as_array()
                .ok_or_else(|| {
                    PipelineError::EmbeddingUnavailable("embedding entry missing vector".into())
                })?
                .iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect();
            if vector.is_empty() {
                return Err(PipelineError::EmbeddingUnavailable(format!(
                    "empty vector at index {}",
                    index
                )));
            }
            if index >= batch.len() {
                return Err(PipelineError::EmbeddingUnavailable(format!(
                    "out-of-range index {} in response",
                    index
                )));
            }
            vectors[index] = Some(vector);
        }

        vectors
            .into_iter()
            .enumerate()
            .map(|(i, v)| {
                v.ok_or_else(|| {
                    PipelineError::EmbeddingUnavailable(format!("no embedding for input {}", i))
                })
            })
            .collect()
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, texts: &[String]) -> PipelineResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(MAX_BATCH) {
            debug!(batch_len = batch.len(), model = %self.model, "embedding batch");
            out.extend(self.embed_batch(batch).await?);
        }
        Ok(out)
    }
}
