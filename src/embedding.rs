//! Embedding backends and vector encoding.
//!
//! - **[`OpenAiEmbedder`]**: calls an OpenAI-compatible `/v1/embeddings`
//!   endpoint, one request per batch, retried through [`crate::retry`].
//! - [`vec_to_blob`] / [`blob_to_vec`]: little-endian f32 BLOB encoding
//!   used by the SQLite vector table.
//!
//! # Provider Selection
//!
//! | Config Value | Embedder |
//! |-------------|----------|
//! | `"disabled"` | none; the pipeline skips the embed phase |
//! | `"openai"` | [`OpenAiEmbedder`] |

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::config::{EmbeddingConfig, RetryConfig};
use crate::retry::{with_retry, HttpStatusError, RetryPolicy};
use crate::traits::Embedder;

/// A well-formed HTTP exchange whose payload cannot be used. Never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EmbeddingResponseError {
    #[error("Invalid OpenAI response: missing data array")]
    MissingData,

    #[error("Invalid OpenAI response: missing embedding at position {0}")]
    MissingEmbedding(usize),

    #[error("Embedding has {got} dimensions, expected {expected}")]
    DimensionMismatch { got: usize, expected: usize },
}

pub struct OpenAiEmbedder {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    dims: usize,
    policy: RetryPolicy,
}

impl OpenAiEmbedder {
    /// Requires `model` and `dims` in config and `OPENAI_API_KEY` in the environment.
    pub fn new(config: &EmbeddingConfig, retry: &RetryConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            url: config.url.clone(),
            api_key,
            model,
            dims,
            policy: RetryPolicy::from(retry),
        })
    }

    async fn request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post(&self.url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HttpStatusError {
                status: status.as_u16(),
                body,
            }
            .into());
        }

        let json: serde_json::Value = response
            .json()
            .await
            .context("Invalid embeddings response body")?;
        parse_openai_response(&json, self.dims)
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        debug!(model = %self.model, batch = texts.len(), "embedding batch");
        with_retry(&self.policy, || self.request(texts), None).await
    }
}

/// Extract `data[].embedding`, ordered by each item's `index`.
fn parse_openai_response(json: &serde_json::Value, dims: usize) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or(EmbeddingResponseError::MissingData)?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or(EmbeddingResponseError::MissingEmbedding(position))?;

        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        if vec.len() != dims {
            return Err(EmbeddingResponseError::DimensionMismatch {
                got: vec.len(),
                expected: dims,
            }
            .into());
        }
        indexed.push((index, vec));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

/// Build the configured embedder; `None` when embedding is disabled.
pub fn create_embedder(
    config: &EmbeddingConfig,
    retry: &RetryConfig,
) -> Result<Option<Arc<dyn Embedder>>> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "openai" => Ok(Some(Arc::new(OpenAiEmbedder::new(config, retry)?))),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB produced by [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        let blob = vec_to_blob(&vec);
        assert_eq!(blob.len(), 20);
        assert_eq!(blob_to_vec(&blob), vec);
    }

    #[test]
    fn test_parse_orders_by_index() {
        let json = serde_json::json!({
            "data": [
                {"index": 1, "embedding": [0.5, 0.5]},
                {"index": 0, "embedding": [1.0, 0.0]},
            ]
        });
        let vectors = parse_openai_response(&json, 2).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.5, 0.5]]);
    }

    #[test]
    fn test_parse_rejects_wrong_dims() {
        let json = serde_json::json!({"data": [{"index": 0, "embedding": [1.0]}]});
        let err = parse_openai_response(&json, 3).unwrap_err();
        assert!(err.to_string().contains("expected 3"));
        assert_eq!(
            err.downcast_ref::<EmbeddingResponseError>(),
            Some(&EmbeddingResponseError::DimensionMismatch {
                got: 1,
                expected: 3
            })
        );
        assert!(!crate::retry::is_retryable(&err));
    }

    #[test]
    fn test_parse_rejects_missing_data() {
        let err = parse_openai_response(&serde_json::json!({"error": "x"}), 2).unwrap_err();
        assert!(!crate::retry::is_retryable(&err));
    }

    #[test]
    fn test_disabled_provider_builds_nothing() {
        let embedder =
            create_embedder(&EmbeddingConfig::default(), &RetryConfig::default()).unwrap();
        assert!(embedder.is_none());
    }
}
