//! HTTP client for a Qdrant-compatible vector store.
//!
//! Implements the core [`VectorStore`] trait over Qdrant's REST API:
//!
//! | Operation | Request |
//! |-----------|---------|
//! | ensure | `GET /collections/{c}`, then `PUT /collections/{c}` if missing |
//! | upsert | `PUT /collections/{c}/points?wait=true` |
//! | search | `POST /collections/{c}/points/search` |
//! | delete | `POST /collections/{c}/points/delete?wait=true` |
//!
//! Every transport or HTTP failure surfaces as
//! [`Error::BackendUnavailable`]. Hit payloads are deserialized into
//! [`Chunk`]; a payload that does not fit is skipped with a warning.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use cope_rag_core::models::Chunk;
use cope_rag_core::store::{DeleteSelector, FieldMatch, Point, PointFilter, ScoredPoint, VectorStore};
use cope_rag_core::{Error, Result};

use crate::config::VectorStoreConfig;

/// Vector store client bound to one collection.
pub struct QdrantStore {
    base_url: String,
    collection: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    result: Vec<SearchHit>,
}

#[derive(Deserialize)]
struct SearchHit {
    score: f64,
    #[serde(default)]
    payload: Option<Value>,
}

impl QdrantStore {
    pub fn new(config: &VectorStoreConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            collection: config.collection.clone(),
            client,
        })
    }

    fn collection_url(&self) -> String {
        format!("{}/collections/{}", self.base_url, self.collection)
    }

    async fn send(&self, request: reqwest::RequestBuilder, what: &str) -> Result<reqwest::Response> {
        let response = request
            .send()
            .await
            .map_err(|e| Error::BackendUnavailable(format!("vector store {}: {}", what, e)))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::BackendUnavailable(format!(
                "vector store {} failed ({}): {}",
                what, status, body
            )));
        }
        Ok(response)
    }
}

/// Translate a [`PointFilter`] into Qdrant's `{"must": [...]}` shape.
pub fn filter_to_json(filter: &PointFilter) -> Value {
    let must: Vec<Value> = filter
        .must
        .iter()
        .map(|cond| {
            let matches = match &cond.matches {
                FieldMatch::Equals(v) => json!({ "value": v }),
                FieldMatch::Any(vs) => json!({ "any": vs }),
            };
            json!({ "key": cond.field.key(), "match": matches })
        })
        .collect();
    json!({ "must": must })
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn ensure_collection(&self, dims: usize) -> Result<()> {
        let url = self.collection_url();
        let existing = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::BackendUnavailable(format!("vector store ensure: {}", e)))?;
        if existing.status().is_success() {
            return Ok(());
        }

        debug!(collection = %self.collection, dims, "creating vector collection");
        let body = json!({ "vectors": { "size": dims, "distance": "Cosine" } });
        self.send(self.client.put(&url).json(&body), "create collection")
            .await?;
        Ok(())
    }

    async fn upsert(&self, points: Vec<Point>) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }
        let points: Vec<Value> = points
            .into_iter()
            .map(|p| -> Result<Value> {
                Ok(json!({
                    "id": p.id,
                    "vector": p.vector,
                    "payload": serde_json::to_value(&p.payload)?,
                }))
            })
            .collect::<Result<Vec<_>>>()?;
        let url = format!("{}/points?wait=true", self.collection_url());
        self.send(self.client.put(url).json(&json!({ "points": points })), "upsert")
            .await?;
        Ok(())
    }

    async fn search(&self, vector: &[f32], limit: usize, filter: &PointFilter) -> Result<Vec<ScoredPoint>> {
        let mut body = json!({
            "vector": vector,
            "limit": limit,
            "with_payload": true,
        });
        if !filter.is_empty() {
            body["filter"] = filter_to_json(filter);
        }
        let url = format!("{}/points/search", self.collection_url());
        let response = self.send(self.client.post(url).json(&body), "search").await?;
        let parsed: SearchResponse = response
            .json()
            .await
            .map_err(|e| Error::BackendUnavailable(format!("invalid search response: {}", e)))?;

        let mut out = Vec::with_capacity(parsed.result.len());
        for hit in parsed.result {
            let Some(payload) = hit.payload else {
                continue;
            };
            match serde_json::from_value::<Chunk>(payload) {
                Ok(chunk) => out.push(ScoredPoint {
                    payload: chunk,
                    score: hit.score,
                }),
                Err(e) => warn!(error = %e, "skipping vector hit with malformed payload"),
            }
        }
        Ok(out)
    }

    async fn delete(&self, selector: DeleteSelector) -> Result<()> {
        let body = match &selector {
            DeleteSelector::Ids(ids) if ids.is_empty() => return Ok(()),
            DeleteSelector::Ids(ids) => json!({ "points": ids }),
            DeleteSelector::Filter(filter) => json!({ "filter": filter_to_json(filter) }),
        };
        let url = format!("{}/points/delete?wait=true", self.collection_url());
        self.send(self.client.post(url).json(&body), "delete").await?;
        Ok(())
    }
}
