//! Context compression: fit ranked hits into a character budget.
//!
//! Hits are walked greedily in rank order. Each contributes at most two
//! sentences (or a raw slice when sentence splitting yields nothing), and
//! a hit that would overflow the remaining budget ends the walk. A citation
//! is never half-included.

use crate::models::{Chunk, Citation};

/// Fixed per-citation overhead charged against the budget.
pub const CITATION_OVERHEAD: usize = 4;
/// Upper bound on a single hit's excerpt when built from sentences.
pub const LOCAL_BUDGET_CHARS: usize = 320;
/// Length of the raw slice used when no sentence fits.
pub const FALLBACK_SLICE_CHARS: usize = 260;
/// Stop once the remaining budget falls to this.
pub const MIN_REMAINING_BUDGET: usize = 100;
const MAX_SENTENCES: usize = 2;

/// Split on whitespace following `.`, `!` or `?`.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0usize;
    let mut prev_terminal = false;
    let mut in_gap = false;
    for (i, c) in text.char_indices() {
        if c.is_whitespace() {
            if prev_terminal && !in_gap {
                out.push(&text[start..i]);
                in_gap = true;
            }
            if in_gap {
                start = i + c.len_utf8();
            }
        } else {
            in_gap = false;
        }
        if !c.is_whitespace() {
            prev_terminal = matches!(c, '.' | '!' | '?');
        }
    }
    if start < text.len() {
        out.push(&text[start..]);
    }
    out
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn excerpt_for(text: &str, budget: usize) -> String {
    let local_budget = LOCAL_BUDGET_CHARS.min(budget);
    let mut picked: Vec<&str> = Vec::new();
    let mut picked_len = 0usize;
    for sentence in split_sentences(text) {
        let joined_len = if picked.is_empty() {
            char_len(sentence)
        } else {
            picked_len + 1 + char_len(sentence)
        };
        if joined_len > local_budget {
            break;
        }
        picked.push(sentence);
        picked_len = joined_len;
        if picked.len() >= MAX_SENTENCES {
            break;
        }
    }
    let joined = picked.join(" ");
    let joined = joined.trim();
    if joined.is_empty() {
        crate::models::text_prefix(text, FALLBACK_SLICE_CHARS.min(budget)).to_string()
    } else {
        joined.to_string()
    }
}

/// Compress ranked hits into citations totalling at most
/// `max_chars + CITATION_OVERHEAD × n` characters of excerpt.
pub fn compress(hits: &[Chunk], max_chars: usize) -> Vec<Citation> {
    let mut out = Vec::new();
    let mut budget = max_chars;

    for hit in hits {
        let text = hit.text.trim();
        if text.is_empty() {
            continue;
        }
        let excerpt = excerpt_for(text, budget);
        if excerpt.is_empty() {
            continue;
        }
        let cost = char_len(&excerpt) + CITATION_OVERHEAD;
        if cost > budget {
            break;
        }
        out.push(Citation {
            excerpt,
            source: hit.source,
            doc_id: hit.doc_id.clone(),
            title: hit.title.clone(),
            file_path: hit.file_path.clone(),
            heading: hit.heading().map(str::to_string),
            page: hit.page(),
            doc_type: hit.doc_type.clone(),
            tags: hit.tags.iter().cloned().collect(),
            score: hit.score,
            fused_score: hit.fused_score,
            modified_at: hit.modified_at,
        });
        budget -= cost;
        if budget <= MIN_REMAINING_BUDGET {
            break;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChunkSource, DocType, Locator};
    use std::collections::BTreeSet;

    fn hit(text: &str) -> Chunk {
        Chunk {
            id: "id".into(),
            text: text.to_string(),
            source: ChunkSource::Pdf,
            doc_id: "7".into(),
            file_path: None,
            locator: Locator::Page(3),
            title: Some("Guide".into()),
            doc_type: DocType::Practice,
            tags: BTreeSet::new(),
            course: None,
            language: None,
            modified_at: None,
            score: 1.0,
            fused_score: 0.5,
        }
    }

    #[test]
    fn test_split_sentences() {
        assert_eq!(
            split_sentences("One. Two!  Three? four"),
            vec!["One.", "Two!", "Three?", "four"]
        );
        assert_eq!(split_sentences("v1.2 is out"), vec!["v1.2 is out"]);
    }

    #[test]
    fn test_takes_at_most_two_sentences() {
        let out = compress(&[hit("First one. Second one. Third one.")], 1600);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].excerpt, "First one. Second one.");
        assert_eq!(out[0].page, Some(3));
        assert_eq!(out[0].doc_type, DocType::Practice);
    }

    #[test]
    fn test_falls_back_to_raw_slice() {
        let long = "x".repeat(1000);
        let out = compress(&[hit(&long)], 1600);
        assert_eq!(out[0].excerpt.chars().count(), FALLBACK_SLICE_CHARS);
    }

    #[test]
    fn test_total_never_exceeds_budget() {
        let hits: Vec<Chunk> = (0..30)
            .map(|i| hit(&format!("Sentence number {} is here. And another follows it.", i)))
            .collect();
        for max_chars in [0, 50, 150, 400, 1600] {
            let out = compress(&hits, max_chars);
            let total: usize = out.iter().map(|c| c.excerpt.chars().count()).sum();
            assert!(total + CITATION_OVERHEAD * out.len() <= max_chars);
        }
    }

    #[test]
    fn test_skips_blank_hits() {
        let out = compress(&[hit("   "), hit("Real text.")], 1600);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].excerpt, "Real text.");
    }

    #[test]
    fn test_stops_when_budget_runs_low() {
        let hits = vec![hit(&"a".repeat(200)), hit("Tiny.")];
        let out = compress(&hits, 300);
        // 300 - (200 + 4) = 96 <= 100
        assert_eq!(out.len(), 1);
    }
}
