//! Vector storage abstraction.
//!
//! The [`VectorStore`] trait covers the four operations the ingestion and
//! retrieval pipeline needs from a vector database, enabling pluggable
//! backends (the HTTP client in the app crate, the in-memory store here).
//!
//! A store is bound to one collection when constructed. Payloads are typed
//! [`Chunk`] records, validated when a backend deserializes them.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::Chunk;

/// A vector plus its chunk payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: Chunk,
}

/// A search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredPoint {
    pub payload: Chunk,
    pub score: f64,
}

/// Payload fields a filter may constrain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadField {
    Source,
    DocId,
    FilePath,
    DocType,
    Tags,
}

impl PayloadField {
    /// Key of this field in the serialized payload.
    pub fn key(&self) -> &'static str {
        match self {
            PayloadField::Source => "source",
            PayloadField::DocId => "doc_id",
            PayloadField::FilePath => "file_path",
            PayloadField::DocType => "doc_type",
            PayloadField::Tags => "tags",
        }
    }

    fn values(&self, chunk: &Chunk) -> Vec<String> {
        match self {
            PayloadField::Source => vec![chunk.source.as_str().to_string()],
            PayloadField::DocId => vec![chunk.doc_id.clone()],
            PayloadField::FilePath => chunk.file_path.iter().cloned().collect(),
            PayloadField::DocType => vec![chunk.doc_type.as_str().to_string()],
            PayloadField::Tags => chunk.tags.iter().cloned().collect(),
        }
    }
}

/// Match condition on one payload field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldMatch {
    Equals(String),
    Any(Vec<String>),
}

/// A single `must` condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    pub field: PayloadField,
    pub matches: FieldMatch,
}

/// Conjunction of payload conditions. An empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PointFilter {
    pub must: Vec<Condition>,
}

impl PointFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn equals(mut self, field: PayloadField, value: impl Into<String>) -> Self {
        self.must.push(Condition {
            field,
            matches: FieldMatch::Equals(value.into()),
        });
        self
    }

    /// Adds an any-of condition. Empty `values` add nothing.
    pub fn any(mut self, field: PayloadField, values: &[String]) -> Self {
        if !values.is_empty() {
            self.must.push(Condition {
                field,
                matches: FieldMatch::Any(values.to_vec()),
            });
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.must.is_empty()
    }

    /// Exact (case-sensitive) evaluation, as a vector database would do it.
    pub fn matches(&self, chunk: &Chunk) -> bool {
        self.must.iter().all(|cond| {
            let values = cond.field.values(chunk);
            match &cond.matches {
                FieldMatch::Equals(v) => values.iter().any(|x| x == v),
                FieldMatch::Any(vs) => values.iter().any(|x| vs.contains(x)),
            }
        })
    }
}

/// What [`VectorStore::delete`] removes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteSelector {
    Filter(PointFilter),
    Ids(Vec<String>),
}

/// Abstract vector store bound to a single collection.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`ensure_collection`](VectorStore::ensure_collection) | Create the collection if missing |
/// | [`upsert`](VectorStore::upsert) | Insert or overwrite points by id |
/// | [`search`](VectorStore::search) | Cosine search with a payload filter |
/// | [`delete`](VectorStore::delete) | Remove points by filter or ids |
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn ensure_collection(&self, dims: usize) -> Result<()>;

    async fn upsert(&self, points: Vec<Point>) -> Result<()>;

    /// Highest-scoring points first.
    async fn search(&self, vector: &[f32], limit: usize, filter: &PointFilter) -> Result<Vec<ScoredPoint>>;

    async fn delete(&self, selector: DeleteSelector) -> Result<()>;
}
