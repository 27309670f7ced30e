use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

/// Failures of an embedding backend
#[derive(Debug, Clone, thiserror::Error)]
pub enum EmbeddingError {
    /// Backend could not be reached
    #[error("embedding backend unavailable: {0}")]
    Unavailable(String),

    /// Backend answered with an error or an unusable body
    #[error("embedding backend error: {0}")]
    Backend(String),

    /// Vectors of different lengths, or a count that does not match the input
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Turns texts into vectors
///
/// Real deployments use [`HttpEmbedder`]; tests use deterministic mocks.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts, returning one vector per text in order
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    /// Name recorded in logs
    fn model_name(&self) -> &str;
}

/// Cosine similarity between two vectors, 0 for zero-length input
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Configuration for an OpenAI-compatible `/embeddings` endpoint
#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    /// Base URL, e.g. "https://api.openai.com/v1"
    pub api_url: String,
    /// Bearer token, optional for local servers
    pub api_key: Option<String>,
    pub model: String,
    /// Per-request timeout in seconds
    pub timeout_secs: u64,
}

impl EmbeddingConfig {
    /// Create config from environment variables
    pub fn from_env() -> Result<Self> {
        let api_url = std::env::var("EMBEDDING_API_URL")
            .context("EMBEDDING_API_URL environment variable not set")?;

        Ok(Self {
            api_url,
            api_key: std::env::var("EMBEDDING_API_KEY").ok(),
            model: std::env::var("EMBEDDING_MODEL")
                .unwrap_or_else(|_| "text-embedding-3-small".to_string()),
            timeout_secs: 30,
        })
    }
}

/// Embedder backed by an HTTP embeddings API
pub struct HttpEmbedder {
    client: Client,
    config: EmbeddingConfig,
}

impl HttpEmbedder {
    pub fn new(config: EmbeddingConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build embedding HTTP client")?;
        Ok(Self { client, config })
    }

    fn endpoint(&self) -> String {
        format!("{}/embeddings", self.config.api_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let request = EmbeddingRequest {
            model: &self.config.model,
            input: texts,
        };

        let mut builder = self.client.post(self.endpoint()).json(&request);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                EmbeddingError::Unavailable(e.to_string())
            } else {
                EmbeddingError::Backend(e.to_string())
            }
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::Backend(format!("{} - {}", status, body)));
        }

        let mut response: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::Backend(format!("invalid response body: {}", e)))?;

        if response.data.len() != texts.len() {
            return Err(EmbeddingError::DimensionMismatch {
                expected: texts.len(),
                actual: response.data.len(),
            });
        }

        response.data.sort_by_key(|d| d.index);
        Ok(response.data.into_iter().map(|d| d.embedding).collect())
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}

/// Deterministic embedder for tests and offline runs
///
/// Each axis is a phrase; a text's vector has 1.0 on every axis phrase it
/// contains, plus a small constant component so no vector is all zeros.
pub struct MockEmbedder {
    axes: Vec<String>,
    failure: Option<EmbeddingError>,
    calls: AtomicUsize,
}

impl MockEmbedder {
    pub fn with_axes(axes: &[&str]) -> Self {
        Self {
            axes: axes.iter().map(|a| a.to_string()).collect(),
            failure: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Mock whose every request fails like an unreachable server
    pub fn unavailable() -> Self {
        Self {
            axes: Vec::new(),
            failure: Some(EmbeddingError::Unavailable(
                "connection refused (mock)".to_string(),
            )),
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of batch requests received
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector: Vec<f32> = self
            .axes
            .iter()
            .map(|axis| if text.contains(axis.as_str()) { 1.0 } else { 0.0 })
            .collect();
        vector.push(0.05);
        vector
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }

    fn model_name(&self) -> &str {
        "mock"
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_endpoint_joins_path() {
        let embedder = HttpEmbedder::new(EmbeddingConfig {
            api_url: "http://localhost:8080/v1/".to_string(),
            api_key: None,
            model: "bge-m3".to_string(),
            timeout_secs: 5,
        })
        .unwrap();
        assert_eq!(embedder.endpoint(), "http://localhost:8080/v1/embeddings");
        assert_eq!(embedder.model_name(), "bge-m3");
    }

    #[test]
    fn test_response_parses_out_of_order() {
        let body = r#"{"data": [{"index": 1, "embedding": [0.0, 1.0]}, {"index": 0, "embedding": [1.0, 0.0]}]}"#;
        let mut response: EmbeddingResponse = serde_json::from_str(body).unwrap();
        response.data.sort_by_key(|d| d.index);
        assert_eq!(response.data[0].embedding, vec![1.0, 0.0]);
    }
}
