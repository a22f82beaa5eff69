//! Embedding provider implementations.
//!
//! Concrete backends for the core [`EmbeddingProvider`] trait:
//! - **[`DisabledProvider`]**: every call fails with `BackendUnavailable`,
//!   so ingestion degrades to lexical-only and retrieval to the lexical
//!   channel.
//! - **[`OllamaProvider`]**: calls `POST {url}/api/embeddings` once per text.
//! - `hash`: the core [`HashEmbedder`], deterministic and offline.
//!
//! # Provider Selection
//!
//! [`create_provider`] builds the configured provider and wraps every
//! enabled one in the bounded [`EmbeddingCache`]:
//!
//! ```rust,no_run
//! # use cope_rag::config::EmbeddingConfig;
//! # use cope_rag::embedding::create_provider;
//! let config = EmbeddingConfig::default(); // provider = "disabled"
//! let provider = create_provider(&config, 768).unwrap();
//! assert_eq!(provider.model_name(), "disabled");
//! ```
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use cope_rag_core::embedding::{
    CachedEmbedder, EmbeddingCache, EmbeddingProvider, HashEmbedder, SystemClock,
};
use cope_rag_core::Error;

use crate::config::EmbeddingConfig;

// ============ Disabled Provider ============

/// A provider that refuses to embed.
///
/// Used when `embedding.provider = "disabled"`.
pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }

    fn dims(&self) -> usize {
        0
    }

    async fn embed(&self, _texts: &[String]) -> cope_rag_core::Result<Vec<Vec<f32>>> {
        Err(Error::BackendUnavailable(
            "embedding provider is disabled".to_string(),
        ))
    }
}

// ============ Ollama Provider ============

/// Embedding provider using an Ollama instance.
///
/// Texts are embedded sequentially, one request each, to bound memory and
/// stay within upstream rate limits.
pub struct OllamaProvider {
    model: String,
    dims: usize,
    url: String,
    max_retries: u32,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct OllamaEmbedding {
    embedding: Vec<f32>,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig, dims: usize) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model,
            dims,
            url: config.url.trim_end_matches('/').to_string(),
            max_retries: config.max_retries,
            client,
        })
    }

    async fn embed_one(&self, text: &str) -> cope_rag_core::Result<Vec<f32>> {
        let body = serde_json::json!({
            "model": self.model,
            "prompt": text,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                debug!(attempt, ?delay, "retrying Ollama embedding");
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(format!("{}/api/embeddings", self.url))
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let parsed: OllamaEmbedding = response.json().await.map_err(|e| {
                            Error::BackendUnavailable(format!("invalid Ollama response: {}", e))
                        })?;
                        return Ok(parsed.embedding);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(format!("Ollama API error {}: {}", status, body_text));
                        continue;
                    }

                    return Err(Error::BackendUnavailable(format!(
                        "Ollama API error {}: {}",
                        status, body_text
                    )));
                }
                Err(e) => {
                    last_err = Some(format!(
                        "Ollama connection error (is Ollama running at {}?): {}",
                        self.url, e
                    ));
                }
            }
        }

        Err(Error::BackendUnavailable(last_err.unwrap_or_else(|| {
            "Ollama embedding failed after retries".to_string()
        })))
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> cope_rag_core::Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed_one(text).await?);
        }
        Ok(out)
    }
}

/// Create the configured embedding provider.
///
/// `dims` is the vector size of the target collection.
///
/// # Errors
///
/// Returns an error for unknown provider names or missing configuration.
pub fn create_provider(config: &EmbeddingConfig, dims: usize) -> Result<Arc<dyn EmbeddingProvider>> {
    let inner: Arc<dyn EmbeddingProvider> = match config.provider.as_str() {
        "disabled" => return Ok(Arc::new(DisabledProvider)),
        "ollama" => Arc::new(OllamaProvider::new(config, dims)?),
        "hash" => Arc::new(HashEmbedder::new(dims)),
        other => bail!("Unknown embedding provider: {}", other),
    };

    let cache = EmbeddingCache::new(
        config.cache_capacity,
        Duration::from_secs(config.cache_ttl_secs),
        Arc::new(SystemClock),
    );
    Ok(Arc::new(CachedEmbedder::new(inner, cache)))
}
