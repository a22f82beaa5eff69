//! Cross-source result fusion and heuristic reranking.
//!
//! # Fusion
//!
//! ```text
//! fused = weight(source) × minmax(score within its channel)
//! ```
//!
//! Each channel is normalized on its own so neither corpus dominates purely
//! on raw score scale. Hits collapse on [`Chunk::dedup_key`], keeping the
//! maximum fused score.
//!
//! # Rerank
//!
//! Adds small boosts on top of `fused_score`:
//! - heading contains a query token: `+heading_boost`
//! - a tag equals a query token: `+tag_boost`
//! - recency: `max(0, recency_max_boost - min(age_days, 60) / 1000)`
//!
//! then stable-sorts descending.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::Chunk;
use crate::search::{normalize_scores, sort_by_score_desc};

/// Query tokens considered by rerank.
const RERANK_QUERY_TOKENS: usize = 5;
/// Age (days) after which the recency boost stops decaying.
const RECENCY_HORIZON_DAYS: i64 = 60;

/// Per-source weights applied after normalization.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FusionWeights {
    pub pdf: f64,
    pub note: f64,
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self {
            pdf: 0.52,
            note: 0.48,
        }
    }
}

/// Boost magnitudes used by [`rerank`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RerankBoosts {
    pub heading: f64,
    pub tag: f64,
    pub recency_max: f64,
}

impl Default for RerankBoosts {
    fn default() -> Self {
        Self {
            heading: 0.08,
            tag: 0.06,
            recency_max: 0.08,
        }
    }
}

/// Merge PDF and note hits into one ranked list of at most `top_k` items.
///
/// Uses each hit's channel-local `score`; sets `fused_score`.
pub fn fuse(pdf_hits: Vec<Chunk>, note_hits: Vec<Chunk>, top_k: usize, weights: FusionWeights) -> Vec<Chunk> {
    let pdf_norm = normalize_scores(&pdf_hits.iter().map(|h| h.score).collect::<Vec<_>>());
    let note_norm = normalize_scores(&note_hits.iter().map(|h| h.score).collect::<Vec<_>>());

    let mut order: Vec<String> = Vec::new();
    let mut merged: HashMap<String, Chunk> = HashMap::new();

    let weighted = pdf_hits
        .into_iter()
        .zip(pdf_norm)
        .map(|(h, s)| (h, weights.pdf * s))
        .chain(note_hits.into_iter().zip(note_norm).map(|(h, s)| (h, weights.note * s)));

    for (mut hit, fused) in weighted {
        hit.fused_score = fused;
        let key = hit.dedup_key();
        match merged.get_mut(&key) {
            Some(existing) => {
                if hit.fused_score > existing.fused_score {
                    existing.fused_score = hit.fused_score;
                }
            }
            None => {
                order.push(key.clone());
                merged.insert(key, hit);
            }
        }
    }

    let mut out: Vec<Chunk> = order
        .into_iter()
        .filter_map(|k| merged.remove(&k))
        .collect();
    sort_by_score_desc(&mut out, |h| h.fused_score);
    out.truncate(top_k);
    out
}

fn query_tokens(query: &str) -> Vec<String> {
    query
        .to_lowercase()
        .split_whitespace()
        .take(RERANK_QUERY_TOKENS)
        .filter(|t| t.chars().count() > 2)
        .map(str::to_string)
        .collect()
}

/// Add heading/tag/recency boosts to `fused_score` and re-sort in place.
///
/// Ties keep their incoming order.
pub fn rerank(query: &str, hits: &mut [Chunk], boosts: RerankBoosts, now: DateTime<Utc>) {
    let tokens = query_tokens(query);
    for hit in hits.iter_mut() {
        let mut boost = 0.0;

        if let Some(heading) = hit.heading().map(str::to_lowercase) {
            if tokens.iter().any(|t| heading.contains(t.as_str())) {
                boost += boosts.heading;
            }
        }

        if hit
            .tags
            .iter()
            .any(|tag| tokens.iter().any(|t| tag.to_lowercase() == *t))
        {
            boost += boosts.tag;
        }

        if let Some(modified) = hit.modified_at {
            let age_days = (now - modified).num_days().clamp(0, RECENCY_HORIZON_DAYS);
            boost += (boosts.recency_max - age_days as f64 / 1000.0).max(0.0);
        }

        hit.fused_score += boost;
    }
    sort_by_score_desc(hits, |h| h.fused_score);
}
