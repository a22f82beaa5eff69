//! Lexical scoring, metadata filters, and candidate reranking.
//!
//! The retriever works through these pure functions. It loads candidates
//! from the lexical cache and the vector store, then filters, scores,
//! deduplicates, and diversifies them here.
//!
//! # Candidate scoring
//!
//! 1. Lexical coarse pass: `Σ weight(q) × |terms(q) ∩ terms(chunk)|` over
//!    the original query (weight 1.0) and expansions (weight 0.5).
//! 2. Merge lexical and vector candidates, dedup by [`Chunk::candidate_key`].
//! 3. Rerank: `lexical_overlap(query) + intent_doc_type_bonus(intent, type)`.
//! 4. Truncate to `top_k`.

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::models::{Chunk, DocType, Intent, MetadataFilters};

/// Weight of expansion queries relative to the original query.
pub const EXPANSION_WEIGHT: f64 = 0.5;
/// Query terms shorter than this are ignored by lexical scoring.
pub const MIN_TERM_CHARS: usize = 3;

/// Recency boost for notes modified within a week.
pub const RECENT_WEEK_BOOST: f64 = 0.25;
/// Recency boost for notes modified within a month.
pub const RECENT_MONTH_BOOST: f64 = 0.12;

/// Lower-cased word tokens (`\w+`) of `text`.
pub fn terms(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
}

/// Number of distinct query terms (≥ 3 chars) present in `text`.
pub fn lexical_score(query: &str, text: &str) -> usize {
    let q_terms: BTreeSet<String> = terms(query)
        .filter(|t| t.chars().count() >= MIN_TERM_CHARS)
        .collect();
    if q_terms.is_empty() {
        return 0;
    }
    let t_terms: HashSet<String> = terms(text).collect();
    q_terms.iter().filter(|t| t_terms.contains(*t)).count()
}

/// Lexical score of the original query plus down-weighted expansions.
pub fn weighted_lexical_score(query: &str, expansions: &[String], text: &str) -> f64 {
    let mut score = lexical_score(query, text) as f64;
    for q in expansions {
        score += EXPANSION_WEIGHT * lexical_score(q, text) as f64;
    }
    score
}

fn lowered(values: &[String]) -> HashSet<String> {
    values.iter().map(|v| v.to_lowercase()).collect()
}

fn has_tag_overlap(wanted: &HashSet<String>, tags: &BTreeSet<String>) -> bool {
    tags.iter().any(|t| wanted.contains(&t.to_lowercase()))
}

/// Document-channel filter: doc-type allow-list and tag intersection.
pub fn matches_document_filters(chunk: &Chunk, filters: &MetadataFilters) -> bool {
    if !filters.doc_types.is_empty() {
        let allowed = lowered(&filters.doc_types);
        if !allowed.contains(&chunk.doc_type.as_str().to_lowercase()) {
            return false;
        }
    }
    if !filters.tags.is_empty() && !has_tag_overlap(&lowered(&filters.tags), &chunk.tags) {
        return false;
    }
    true
}

/// Note-channel filter: tags, note types, course, language, and recency.
///
/// Notes without a modification time pass the recency filter.
pub fn matches_note_filters(chunk: &Chunk, filters: &MetadataFilters, now: DateTime<Utc>) -> bool {
    if !filters.tags.is_empty() && !has_tag_overlap(&lowered(&filters.tags), &chunk.tags) {
        return false;
    }
    if !filters.note_types.is_empty() {
        let allowed = lowered(&filters.note_types);
        if !allowed.contains(&chunk.doc_type.as_str().to_lowercase()) {
            return false;
        }
    }
    if let Some(course) = filters.course.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
        let chunk_course = chunk.course.as_deref().unwrap_or("");
        if !course.eq_ignore_ascii_case(chunk_course.trim()) {
            return false;
        }
    }
    if let Some(language) = filters.language.as_deref().map(str::trim).filter(|l| !l.is_empty()) {
        let chunk_language = chunk.language.as_deref().unwrap_or("");
        if !language.eq_ignore_ascii_case(chunk_language.trim()) {
            return false;
        }
    }
    if let (Some(days), Some(modified)) = (filters.recency_days.filter(|d| *d > 0), chunk.modified_at) {
        let cutoff = now - chrono::Duration::days(i64::from(days));
        if modified < cutoff {
            return false;
        }
    }
    true
}

/// Fixed bonus rewarding chunk types that suit the query intent.
pub fn intent_doc_type_bonus(intent: Intent, doc_type: &DocType) -> f64 {
    match (intent, doc_type) {
        (Intent::LessonDesign, DocType::Practice) => 0.35,
        (Intent::LessonDesign, DocType::Theory) => 0.15,
        (Intent::Reflection, DocType::Reflection) => 0.4,
        (Intent::Evaluation, DocType::Artifacts) => 0.35,
        (Intent::Evaluation, DocType::Practice) => 0.1,
        (Intent::Explanation, DocType::Theory) => 0.25,
        _ => 0.0,
    }
}

/// Recency boost for a note modified at `modified_at`.
pub fn recency_boost(modified_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> f64 {
    let Some(modified) = modified_at else {
        return 0.0;
    };
    let age_days = (now - modified).num_days().max(0);
    if age_days <= 7 {
        RECENT_WEEK_BOOST
    } else if age_days <= 30 {
        RECENT_MONTH_BOOST
    } else {
        0.0
    }
}

/// Deduplicate merged candidates and rerank by lexical overlap plus intent bonus.
///
/// The first occurrence of each [`Chunk::candidate_key`] wins. Each
/// returned chunk's `score` is set to its rerank score.
pub fn rerank_candidates(query: &str, candidates: Vec<Chunk>, intent: Intent, top_k: usize) -> Vec<Chunk> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut scored: Vec<Chunk> = Vec::with_capacity(candidates.len());
    for mut chunk in candidates {
        if !seen.insert(chunk.candidate_key()) {
            continue;
        }
        chunk.score = lexical_score(query, &chunk.text) as f64
            + intent_doc_type_bonus(intent, &chunk.doc_type);
        scored.push(chunk);
    }
    sort_by_score_desc(&mut scored, |c| c.score);
    scored.truncate(top_k);
    scored
}

/// Guarantee one hit per target document before filling with the best rest.
///
/// With zero or one target document this is a plain truncation.
pub fn diversify(hits: Vec<Chunk>, target_doc_ids: &[String], max_items: usize) -> Vec<Chunk> {
    if target_doc_ids.len() <= 1 {
        let mut hits = hits;
        hits.truncate(max_items);
        return hits;
    }

    let mut first_by_doc: HashMap<&str, usize> = HashMap::new();
    for (i, h) in hits.iter().enumerate() {
        first_by_doc.entry(h.doc_id.as_str()).or_insert(i);
    }

    let mut picked: Vec<usize> = Vec::new();
    for doc_id in target_doc_ids {
        if picked.len() >= max_items {
            break;
        }
        if let Some(&i) = first_by_doc.get(doc_id.as_str()) {
            if !picked.contains(&i) {
                picked.push(i);
            }
        }
    }
    for i in 0..hits.len() {
        if picked.len() >= max_items {
            break;
        }
        if !picked.contains(&i) {
            picked.push(i);
        }
    }

    let mut slots: Vec<Option<Chunk>> = hits.into_iter().map(Some).collect();
    picked
        .into_iter()
        .filter_map(|i| slots.get_mut(i).and_then(Option::take))
        .collect()
}

/// Min-max normalize raw scores to `[0.0, 1.0]`.
///
/// If all scores are equal (including a single score), they normalize to `1.0`.
pub fn normalize_scores(scores: &[f64]) -> Vec<f64> {
    if scores.is_empty() {
        return Vec::new();
    }
    let s_min = scores.iter().copied().fold(f64::INFINITY, f64::min);
    let s_max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    scores
        .iter()
        .map(|s| {
            if (s_max - s_min).abs() < 1e-9 {
                1.0
            } else {
                (s - s_min) / (s_max - s_min)
            }
        })
        .collect()
}

/// Stable descending sort by an `f64` key.
pub fn sort_by_score_desc<T>(items: &mut [T], key: impl Fn(&T) -> f64) {
    items.sort_by(|a, b| {
        key(b)
            .partial_cmp(&key(a))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChunkSource, Locator};

    fn pdf_chunk(doc_id: &str, page: u32, text: &str, doc_type: DocType) -> Chunk {
        Chunk {
            id: format!("{}-{}", doc_id, page),
            text: text.to_string(),
            source: ChunkSource::Pdf,
            doc_id: doc_id.to_string(),
            file_path: None,
            locator: Locator::Page(page),
            title: None,
            doc_type,
            tags: BTreeSet::new(),
            course: None,
            language: None,
            modified_at: None,
            score: 0.0,
            fused_score: 0.0,
        }
    }

    #[test]
    fn test_lexical_score_ignores_short_terms() {
        assert_eq!(lexical_score("le plan de séance", "Un plan de séance complet"), 2);
        assert_eq!(lexical_score("a b", "a b"), 0);
        assert_eq!(lexical_score("", "anything"), 0);
    }

    #[test]
    fn test_weighted_score_discounts_expansions() {
        let s = weighted_lexical_score("volley", &["service volley".to_string()], "volley service");
        assert!((s - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_document_filters() {
        let mut c = pdf_chunk("1", 1, "t", DocType::Practice);
        c.tags.insert("EPS".to_string());
        let practice = MetadataFilters {
            doc_types: vec!["practice".into()],
            ..Default::default()
        };
        assert!(matches_document_filters(&c, &practice));
        let theory = MetadataFilters {
            doc_types: vec!["theory".into()],
            ..Default::default()
        };
        assert!(!matches_document_filters(&c, &theory));
        let tags = MetadataFilters {
            tags: vec!["eps".into()],
            ..Default::default()
        };
        assert!(matches_document_filters(&c, &tags));
        let other_tags = MetadataFilters {
            tags: vec!["math".into()],
            ..Default::default()
        };
        assert!(!matches_document_filters(&c, &other_tags));
    }

    #[test]
    fn test_note_filters_recency_and_course() {
        let now = Utc::now();
        let mut c = pdf_chunk("n", 1, "t", DocType::Reflection);
        c.course = Some("EPS101".into());
        c.modified_at = Some(now - chrono::Duration::days(40));
        let recent = MetadataFilters {
            recency_days: Some(30),
            ..Default::default()
        };
        assert!(!matches_note_filters(&c, &recent, now));
        c.modified_at = None;
        assert!(matches_note_filters(&c, &recent, now));

        let course = MetadataFilters {
            course: Some("eps101".into()),
            note_types: vec!["Reflection".into()],
            ..Default::default()
        };
        assert!(matches_note_filters(&c, &course, now));
        c.course = Some("EPS202".into());
        assert!(!matches_note_filters(&c, &course, now));
    }

    #[test]
    fn test_recency_tiers() {
        let now = Utc::now();
        let days = |d: i64| Some(now - chrono::Duration::days(d));
        assert_eq!(recency_boost(days(2), now), RECENT_WEEK_BOOST);
        assert_eq!(recency_boost(days(20), now), RECENT_MONTH_BOOST);
        assert_eq!(recency_boost(days(90), now), 0.0);
        assert_eq!(recency_boost(None, now), 0.0);
    }

    #[test]
    fn test_rerank_dedups_and_applies_intent_bonus() {
        let theory = pdf_chunk("1", 1, "volley service technique", DocType::Theory);
        let practice = pdf_chunk("2", 1, "volley service technique", DocType::Practice);
        let dup = practice.clone();
        let out = rerank_candidates("volley service", vec![theory, practice, dup], Intent::LessonDesign, 5);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].doc_id, "2");
        assert!((out[0].score - 2.35).abs() < 1e-9);
    }

    #[test]
    fn test_diversify_includes_each_target_document() {
        let hits = vec![
            pdf_chunk("a", 1, "x", DocType::Theory),
            pdf_chunk("a", 2, "x", DocType::Theory),
            pdf_chunk("a", 3, "x", DocType::Theory),
            pdf_chunk("b", 1, "x", DocType::Theory),
        ];
        let out = diversify(hits.clone(), &["a".into(), "b".into()], 2);
        let docs: Vec<&str> = out.iter().map(|c| c.doc_id.as_str()).collect();
        assert_eq!(docs, vec!["a", "b"]);

        let single = diversify(hits, &["a".into()], 2);
        assert_eq!(single.len(), 2);
        assert!(single.iter().all(|c| c.doc_id == "a"));
    }

    #[test]
    fn test_normalize_scores() {
        assert!(normalize_scores(&[]).is_empty());
        assert_eq!(normalize_scores(&[5.0]), vec![1.0]);
        assert_eq!(normalize_scores(&[3.0, 3.0]), vec![1.0, 1.0]);
        let n = normalize_scores(&[10.0, 5.0, 0.0]);
        assert!((n[0] - 1.0).abs() < 1e-9);
        assert!((n[1] - 0.5).abs() < 1e-9);
        assert!(n[2].abs() < 1e-9);
    }

    #[test]
    fn test_sort_is_stable() {
        let mut items = vec![("a", 1.0), ("b", 2.0), ("c", 1.0)];
        sort_by_score_desc(&mut items, |x| x.1);
        assert_eq!(items.iter().map(|x| x.0).collect::<Vec<_>>(), vec!["b", "a", "c"]);
    }
}
