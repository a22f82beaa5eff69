//! Core data models that flow through ingestion and retrieval.
//!
//! Vector-store payloads, the lexical chunk cache, and the indexing manifest
//! are all (de)serialized through these types, so untyped maps never travel
//! through the pipeline.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which corpus a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkSource {
    Pdf,
    Note,
}

impl ChunkSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkSource::Pdf => "pdf",
            ChunkSource::Note => "note",
        }
    }
}

impl fmt::Display for ChunkSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Content type of a document or note.
///
/// The four known kinds drive chunk sizing and intent bonuses; anything
/// else is carried through verbatim as [`DocType::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DocType {
    Theory,
    Practice,
    Reflection,
    Artifacts,
    Other(String),
}

impl DocType {
    pub fn as_str(&self) -> &str {
        match self {
            DocType::Theory => "theory",
            DocType::Practice => "practice",
            DocType::Reflection => "reflection",
            DocType::Artifacts => "artifacts",
            DocType::Other(s) => s,
        }
    }
}

impl Default for DocType {
    fn default() -> Self {
        DocType::Theory
    }
}

impl From<&str> for DocType {
    fn from(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "theory" => DocType::Theory,
            "practice" => DocType::Practice,
            "reflection" => DocType::Reflection,
            "artifacts" | "artifact" => DocType::Artifacts,
            _ => DocType::Other(value.trim().to_string()),
        }
    }
}

impl From<String> for DocType {
    fn from(value: String) -> Self {
        DocType::from(value.as_str())
    }
}

impl From<DocType> for String {
    fn from(value: DocType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for DocType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where inside its source a chunk lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Locator {
    /// 1-based PDF page number.
    Page(u32),
    /// Enclosing markdown heading; `None` for text before the first heading.
    Heading(Option<String>),
}

/// The unit of retrievable text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Content-derived UUID, stable across re-ingestion of unchanged text.
    pub id: String,
    pub text: String,
    pub source: ChunkSource,
    /// PDF document id, or `note:<path>` for notes.
    pub doc_id: String,
    /// Vault-relative path (notes only).
    #[serde(default)]
    pub file_path: Option<String>,
    pub locator: Locator,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub doc_type: DocType,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub course: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub modified_at: Option<DateTime<Utc>>,
    /// Channel-local score.
    #[serde(default, skip_serializing)]
    pub score: f64,
    /// Score after cross-source fusion and rerank.
    #[serde(default, skip_serializing)]
    pub fused_score: f64,
}

impl Chunk {
    pub fn page(&self) -> Option<u32> {
        match self.locator {
            Locator::Page(p) => Some(p),
            Locator::Heading(_) => None,
        }
    }

    pub fn heading(&self) -> Option<&str> {
        match &self.locator {
            Locator::Heading(h) => h.as_deref(),
            Locator::Page(_) => None,
        }
    }

    /// Source-aware key used to collapse duplicates during fusion.
    ///
    /// Notes collapse per `(file_path, heading)`; PDF chunks per
    /// `(doc_id, page, first 40 chars)`.
    pub fn dedup_key(&self) -> String {
        match self.source {
            ChunkSource::Note => format!(
                "note:{}:{}",
                self.file_path.as_deref().unwrap_or(&self.doc_id),
                self.heading().unwrap_or("")
            ),
            ChunkSource::Pdf => format!(
                "pdf:{}:{}:{}",
                self.doc_id,
                self.page().unwrap_or(0),
                text_prefix(&self.text, 40)
            ),
        }
    }

    /// Content key used to merge lexical and vector candidates.
    pub fn candidate_key(&self) -> String {
        let locator = match &self.locator {
            Locator::Page(p) => p.to_string(),
            Locator::Heading(h) => h.clone().unwrap_or_default(),
        };
        format!("{}|{}|{}", self.doc_id, locator, text_prefix(&self.text, 120))
    }
}

/// First `n` characters of `text` (char-boundary safe).
pub fn text_prefix(text: &str, n: usize) -> &str {
    match text.char_indices().nth(n) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Per-note bookkeeping for incremental indexing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: String,
    pub content_hash: String,
    #[serde(default)]
    pub modified_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub chunk_ids: Vec<String>,
}

/// A single failed item within a batch operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    pub item: String,
    pub message: String,
}

/// Summary of one indexing run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestStats {
    pub notes_seen: usize,
    /// Notes (re)embedded and upserted during this run.
    pub indexed: usize,
    /// Notes whose hash and modification time were unchanged.
    pub skipped: usize,
    /// Notes that disappeared from the vault since the last run.
    pub deleted: usize,
    pub chunks_indexed: usize,
    pub errors: Vec<ItemError>,
}

impl IngestStats {
    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    pub fn record_error(&mut self, item: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ItemError {
            item: item.into(),
            message: message.into(),
        });
    }
}

/// Caller-supplied metadata restrictions applied before scoring.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataFilters {
    #[serde(default)]
    pub doc_types: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub note_types: Vec<String>,
    #[serde(default)]
    pub course: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub recency_days: Option<u32>,
}

impl MetadataFilters {
    pub fn is_empty(&self) -> bool {
        self.doc_types.is_empty()
            && self.tags.is_empty()
            && self.note_types.is_empty()
            && self.course.is_none()
            && self.language.is_none()
            && self.recency_days.is_none()
    }
}

/// Query intent, used to reward chunk types that suit the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    LessonDesign,
    Evaluation,
    Reflection,
    Explanation,
    Unknown,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::LessonDesign => "lesson_design",
            Intent::Evaluation => "evaluation",
            Intent::Reflection => "reflection",
            Intent::Explanation => "explanation",
            Intent::Unknown => "unknown",
        }
    }
}

/// A compressed excerpt ready for prompt insertion, with its provenance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Citation {
    pub excerpt: String,
    pub source: ChunkSource,
    pub doc_id: String,
    pub title: Option<String>,
    pub file_path: Option<String>,
    pub heading: Option<String>,
    pub page: Option<u32>,
    pub doc_type: DocType,
    pub tags: Vec<String>,
    pub score: f64,
    pub fused_score: f64,
    pub modified_at: Option<DateTime<Utc>>,
}
