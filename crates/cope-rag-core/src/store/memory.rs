//! In-memory [`VectorStore`] implementation for tests and offline use.
//!
//! Uses a `HashMap` behind `std::sync::RwLock`. Search is brute-force
//! cosine similarity over all stored vectors.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::error::Result;
use crate::search::sort_by_score_desc;

use super::{DeleteSelector, Point, PointFilter, ScoredPoint, VectorStore};

/// In-memory vector store.
#[derive(Default)]
pub struct InMemoryVectorStore {
    dims: RwLock<Option<usize>>,
    points: RwLock<HashMap<String, Point>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Point>> {
        self.points.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Point>> {
        self.points.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read().contains_key(id)
    }

    /// Ids of points whose payload matches `filter`, sorted.
    pub fn ids_matching(&self, filter: &PointFilter) -> Vec<String> {
        let mut ids: Vec<String> = self
            .read()
            .values()
            .filter(|p| filter.matches(&p.payload))
            .map(|p| p.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn dims(&self) -> Option<usize> {
        *self.dims.read().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn ensure_collection(&self, dims: usize) -> Result<()> {
        let mut current = self.dims.write().unwrap_or_else(|e| e.into_inner());
        if current.is_none() {
            *current = Some(dims);
        }
        Ok(())
    }

    async fn upsert(&self, points: Vec<Point>) -> Result<()> {
        let mut stored = self.write();
        for p in points {
            stored.insert(p.id.clone(), p);
        }
        Ok(())
    }

    async fn search(&self, vector: &[f32], limit: usize, filter: &PointFilter) -> Result<Vec<ScoredPoint>> {
        let stored = self.read();
        let mut hits: Vec<(&String, ScoredPoint)> = stored
            .values()
            .filter(|p| filter.matches(&p.payload))
            .map(|p| {
                (
                    &p.id,
                    ScoredPoint {
                        payload: p.payload.clone(),
                        score: f64::from(cosine_similarity(vector, &p.vector)),
                    },
                )
            })
            .collect();
        // Deterministic order among equal scores.
        hits.sort_by(|a, b| a.0.cmp(b.0));
        sort_by_score_desc(&mut hits, |h| h.1.score);
        Ok(hits.into_iter().take(limit).map(|(_, h)| h).collect())
    }

    async fn delete(&self, selector: DeleteSelector) -> Result<()> {
        let mut stored = self.write();
        match selector {
            DeleteSelector::Ids(ids) => {
                for id in ids {
                    stored.remove(&id);
                }
            }
            DeleteSelector::Filter(filter) => stored.retain(|_, p| !filter.matches(&p.payload)),
        }
        Ok(())
    }
}
