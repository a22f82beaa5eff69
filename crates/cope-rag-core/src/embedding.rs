//! Embedding provider trait, bounded embedding cache, and vector utilities.
//!
//! Defines the [`EmbeddingProvider`] trait that all embedding backends
//! implement. Network providers live in the `cope-rag` app crate; this
//! module carries the pieces that need no I/O:
//!
//! - [`EmbeddingCache`]: LRU keyed by `(model, text)` with TTL expiry
//!   checked on read, driven by an injected [`Clock`].
//! - [`CachedEmbedder`]: wraps any provider with a cache.
//! - [`HashEmbedder`]: deterministic bag-of-words hashing, for offline use
//!   and tests.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lru::LruCache;
use sha2::{Digest, Sha256};

use crate::error::Result;

/// Trait for embedding providers.
///
/// `embed` returns exactly one vector per input text, each of length
/// [`dims`](EmbeddingProvider::dims).
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"nomic-embed-text"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality.
    fn dims(&self) -> usize;
    /// Embed a batch of texts.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns `0.0` for empty vectors or vectors of different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

/// Source of "now" for TTL checks.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::days(36_500));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct CacheEntry {
    vector: Vec<f32>,
    inserted_at: DateTime<Utc>,
}

/// Bounded LRU embedding cache with TTL expiry.
///
/// Expired entries are dropped when read. When full, inserting evicts the
/// least recently used entry. Concurrent writers for the same key simply
/// overwrite each other. A zero capacity disables caching.
pub struct EmbeddingCache {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    entries: Option<Mutex<LruCache<(String, String), CacheEntry>>>,
}

impl EmbeddingCache {
    pub fn new(capacity: usize, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            clock,
            entries: NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap))),
        }
    }

    fn lock(&self) -> Option<MutexGuard<'_, LruCache<(String, String), CacheEntry>>> {
        self.entries
            .as_ref()
            .map(|m| m.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn expired(&self, inserted_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match (now - inserted_at).to_std() {
            Ok(age) => age >= self.ttl,
            Err(_) => false,
        }
    }

    pub fn get(&self, model: &str, text: &str) -> Option<Vec<f32>> {
        let now = self.clock.now();
        let mut entries = self.lock()?;
        let key = (model.to_string(), text.to_string());
        let inserted_at = entries.get(&key)?.inserted_at;
        if self.expired(inserted_at, now) {
            entries.pop(&key);
            return None;
        }
        entries.get(&key).map(|e| e.vector.clone())
    }

    pub fn insert(&self, model: &str, text: &str, vector: Vec<f32>) {
        let now = self.clock.now();
        if let Some(mut entries) = self.lock() {
            entries.put(
                (model.to_string(), text.to_string()),
                CacheEntry {
                    vector,
                    inserted_at: now,
                },
            );
        }
    }

    pub fn len(&self) -> usize {
        self.lock().map_or(0, |entries| entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An [`EmbeddingProvider`] that consults an [`EmbeddingCache`] first.
///
/// Only cache misses are forwarded to the inner provider, in one batch.
pub struct CachedEmbedder {
    inner: Arc<dyn EmbeddingProvider>,
    cache: EmbeddingCache,
}

impl CachedEmbedder {
    pub fn new(inner: Arc<dyn EmbeddingProvider>, cache: EmbeddingCache) -> Self {
        Self { inner, cache }
    }

    pub fn cache(&self) -> &EmbeddingCache {
        &self.cache
    }
}

#[async_trait]
impl EmbeddingProvider for CachedEmbedder {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn dims(&self) -> usize {
        self.inner.dims()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let model = self.inner.model_name().to_string();
        let mut out: Vec<Option<Vec<f32>>> = texts.iter().map(|t| self.cache.get(&model, t)).collect();

        let missing: Vec<usize> = (0..texts.len()).filter(|&i| out[i].is_none()).collect();
        if !missing.is_empty() {
            let batch: Vec<String> = missing.iter().map(|&i| texts[i].clone()).collect();
            let vectors = self.inner.embed(&batch).await?;
            for (&i, vector) in missing.iter().zip(vectors) {
                self.cache.insert(&model, &texts[i], vector.clone());
                out[i] = Some(vector);
            }
        }

        Ok(out.into_iter().flatten().collect())
    }
}

/// Deterministic bag-of-words embedder.
///
/// Each lower-cased word token is hashed into one of `dims` buckets and the
/// result is L2-normalized, so texts sharing words have positive cosine
/// similarity.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dims: usize,
    model: String,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self {
            dims: dims.max(1),
            model: format!("hash-{}", dims.max(1)),
        }
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for token in crate::search::terms(text) {
            let digest = Sha256::digest(token.as_bytes());
            let mut idx_bytes = [0u8; 8];
            idx_bytes.copy_from_slice(&digest[..8]);
            let idx = (u64::from_le_bytes(idx_bytes) % self.dims as u64) as usize;
            v[idx] += 1.0;
        }
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for x in v.iter_mut() {
                *x /= norm;
            }
        }
        v
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}
