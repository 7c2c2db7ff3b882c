//! Embedding model client.
//!
//! Uses the OpenAI-compatible `/embeddings` endpoint to produce the dense
//! vectors the embedding deduplicator compares with cosine similarity.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EmbeddingObject {
    /// Index within the request batch.
    index: usize,
    embedding: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingObject>,
}

impl EmbeddingResponse {
    /// Vectors in request order; the API may return them shuffled.
    fn into_ordered(self) -> Vec<Vec<f64>> {
        let mut sorted = self.data;
        sorted.sort_by_key(|e| e.index);
        sorted.into_iter().map(|e| e.embedding).collect()
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// HTTP client for an OpenAI-compatible embeddings API.
#[derive(Debug, Clone)]
pub struct EmbeddingClient {
    http_client: reqwest::Client,
    base_url: String,
    api_key: String,
    model_id: String,
}

impl EmbeddingClient {
    pub fn new(base_url: &str, api_key: &str, model_id: &str) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .expect("failed to build reqwest client for embedding");

        Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model_id: model_id.to_string(),
        }
    }

    /// Embed a batch of texts with one API call, preserving input order.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f64>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}/embeddings", self.base_url);
        debug!(model = %self.model_id, batch_size = texts.len(), "embedding batch");

        let body = serde_json::json!({
            "model": self.model_id,
            "input": texts,
        });

        let resp = self
            .http_client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("failed to send batch embedding request")?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("batch embedding API returned {status}: {text}");
        }

        let emb_resp: EmbeddingResponse = resp
            .json()
            .await
            .context("failed to parse batch embedding response")?;
        let embeddings = emb_resp.into_ordered();

        info!(
            model = %self.model_id,
            batch_size = embeddings.len(),
            dim = embeddings.first().map(|v| v.len()).unwrap_or(0),
            "batch embedding computed"
        );

        Ok(embeddings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedding_response_out_of_order() {
        let json = r#"{
            "data": [
                {"index": 1, "embedding": [0.4, 0.5]},
                {"index": 0, "embedding": [0.1, 0.2]}
            ],
            "usage": {"prompt_tokens": 5, "total_tokens": 5}
        }"#;

        let resp: EmbeddingResponse = serde_json::from_str(json).unwrap();
        let ordered = resp.into_ordered();
        assert!((ordered[0][0] - 0.1).abs() < 1e-9);
        assert!((ordered[1][0] - 0.4).abs() < 1e-9);
    }
}
