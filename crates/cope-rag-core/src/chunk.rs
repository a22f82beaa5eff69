//! Overlapping fixed-size window chunker and the content-type sizing policy.
//!
//! Windows are measured in characters (not bytes), so multi-byte text never
//! splits inside a code point.
//!
//! # Algorithm
//!
//! 1. If the text fits in one window, return it whole.
//! 2. Otherwise emit `text[start..start + size]` and advance `start` by
//!    `max(1, size - overlap)`.
//! 3. Stop once a window reaches the end of the text.
//! 4. Drop windows that are empty after trimming.
//!
//! Stitching the windows back together (dropping the duplicated overlap
//! region of each window after the first) reproduces the input.
//!
//! # Example
//!
//! ```rust
//! use cope_rag_core::chunk::chunk_text;
//!
//! let text = "abc ".repeat(600);
//! let chunks = chunk_text(&text, 200, 50);
//! assert!(chunks.len() >= 13);
//! assert!(chunks.iter().all(|c| c.chars().count() <= 200));
//! ```

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::DocType;

/// Window size and overlap, in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkParams {
    pub size: usize,
    pub overlap: usize,
}

impl ChunkParams {
    pub const fn new(size: usize, overlap: usize) -> Self {
        Self { size, overlap }
    }

    /// Distance between the starts of consecutive windows.
    pub fn step(&self) -> usize {
        self.size.saturating_sub(self.overlap).max(1)
    }
}

/// Documents longer than this (in chars) count as "long" theory material.
pub const LONG_DOCUMENT_CHARS: usize = 12_000;
/// Documents shorter than this (in chars) count as "short".
pub const SHORT_DOCUMENT_CHARS: usize = 3_000;

/// Pick chunk parameters for a document of `doc_type` and `text_len` chars.
///
/// Practice, reflection, and artifact material gets tight windows so
/// citations stay precise; long theory documents get wide windows to keep
/// the chunk count down.
pub fn chunk_params(doc_type: &DocType, text_len: usize) -> ChunkParams {
    match doc_type {
        DocType::Practice => ChunkParams::new(700, 120),
        DocType::Reflection => ChunkParams::new(650, 140),
        DocType::Artifacts => ChunkParams::new(500, 100),
        _ if text_len > LONG_DOCUMENT_CHARS => ChunkParams::new(1000, 180),
        _ if text_len < SHORT_DOCUMENT_CHARS => ChunkParams::new(600, 100),
        _ => ChunkParams::new(850, 140),
    }
}

const ARTIFACT_KEYWORDS: &[&str] = &[
    "atelier", "grille", "rubrique", "template", "artefact", "artifact",
];
const REFLECTION_KEYWORDS: &[&str] = &["réflex", "reflex", "metacog", "métacog", "journal", "retour", "feedback"];
const PRACTICE_KEYWORDS: &[&str] = &[
    "séance",
    "seance",
    "exercice",
    "drill",
    "plan",
    "mise en pratique",
    "volleyball",
    "gymnase",
];

/// Infer a document type from its title, tags, and a text sample.
///
/// Keyword families are checked in priority order: artifacts, then
/// reflection, then practice. Anything else is theory.
pub fn infer_doc_type(title: &str, tags: &[String], sample_text: &str) -> DocType {
    let mut hay = String::with_capacity(title.len() + sample_text.len() + 16);
    hay.push_str(title);
    for tag in tags {
        hay.push(' ');
        hay.push_str(tag);
    }
    hay.push(' ');
    hay.push_str(sample_text);
    let hay = hay.to_lowercase();

    let has_any = |keywords: &[&str]| keywords.iter().any(|k| hay.contains(k));
    if has_any(ARTIFACT_KEYWORDS) {
        DocType::Artifacts
    } else if has_any(REFLECTION_KEYWORDS) {
        DocType::Reflection
    } else if has_any(PRACTICE_KEYWORDS) {
        DocType::Practice
    } else {
        DocType::Theory
    }
}

/// Split `text` into overlapping windows of at most `size` characters.
///
/// Returns an empty vector for empty or whitespace-only text and for
/// `size == 0`.
pub fn chunk_text(text: &str, size: usize, overlap: usize) -> Vec<String> {
    if size == 0 || text.trim().is_empty() {
        return Vec::new();
    }

    // Byte offset of every char, plus the end sentinel.
    let mut bounds: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
    let char_len = bounds.len();
    bounds.push(text.len());

    if char_len <= size {
        return vec![text.to_string()];
    }

    let step = ChunkParams::new(size, overlap).step();
    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < char_len {
        let end = (start + size).min(char_len);
        let piece = &text[bounds[start]..bounds[end]];
        if !piece.trim().is_empty() {
            chunks.push(piece.to_string());
        }
        if end == char_len {
            break;
        }
        start += step;
    }

    chunks
}

/// Deterministic UUID for a chunk, derived from its identifying material.
///
/// The first 16 bytes of the SHA-256 digest become the UUID, so identical
/// material always yields the same id and vector upserts overwrite in place.
pub fn content_uuid(material: &str) -> String {
    let digest = Sha256::digest(material.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes).to_string()
}

/// SHA-256 hex digest of `text`, used for change detection.
pub fn content_hash(text: &str) -> String {
    format!("{:x}", Sha256::digest(text.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stitch(chunks: &[String], params: ChunkParams) -> String {
        let dup = params.size - params.step();
        let mut out = String::new();
        for (i, c) in chunks.iter().enumerate() {
            if i == 0 {
                out.push_str(c);
            } else {
                out.extend(c.chars().skip(dup));
            }
        }
        out
    }

    #[test]
    fn test_repeated_text_example() {
        let text = "abc ".repeat(600);
        let chunks = chunk_text(&text, 200, 50);
        assert!(chunks.len() >= 13, "got {} chunks", chunks.len());
        assert!(chunks.iter().all(|c| c.chars().count() <= 200));
    }

    #[test]
    fn test_short_text_single_chunk() {
        let chunks = chunk_text("Hello, world!", 200, 50);
        assert_eq!(chunks, vec!["Hello, world!".to_string()]);
    }

    #[test]
    fn test_empty_and_blank_text() {
        assert!(chunk_text("", 200, 50).is_empty());
        assert!(chunk_text("   \n\t ", 200, 50).is_empty());
        assert!(chunk_text("abc", 0, 0).is_empty());
    }

    #[test]
    fn test_stitching_reconstructs_text() {
        let text: String = (0..97)
            .map(|i| format!("word{}-", i))
            .collect::<Vec<_>>()
            .concat();
        for params in [
            ChunkParams::new(50, 10),
            ChunkParams::new(64, 0),
            ChunkParams::new(33, 32),
        ] {
            let chunks = chunk_text(&text, params.size, params.overlap);
            assert!(chunks.iter().all(|c| c.chars().count() <= params.size));
            assert_eq!(stitch(&chunks, params), text, "params {:?}", params);
        }
    }

    #[test]
    fn test_overlap_larger_than_size_still_advances() {
        let text = "x".repeat(30);
        let chunks = chunk_text(&text, 10, 50);
        // step is 1: windows start at 0..=20
        assert_eq!(chunks.len(), 21);
    }

    #[test]
    fn test_multibyte_text_counts_chars() {
        let text = "é".repeat(25);
        let chunks = chunk_text(&text, 10, 2);
        assert!(chunks.iter().all(|c| c.chars().count() <= 10));
        assert_eq!(stitch(&chunks, ChunkParams::new(10, 2)), text);
    }

    #[test]
    fn test_policy_table() {
        assert_eq!(chunk_params(&DocType::Practice, 50_000), ChunkParams::new(700, 120));
        assert_eq!(chunk_params(&DocType::Reflection, 10), ChunkParams::new(650, 140));
        assert_eq!(chunk_params(&DocType::Artifacts, 10), ChunkParams::new(500, 100));
        assert_eq!(chunk_params(&DocType::Theory, 20_000), ChunkParams::new(1000, 180));
        assert_eq!(chunk_params(&DocType::Theory, 1_000), ChunkParams::new(600, 100));
        assert_eq!(chunk_params(&DocType::Theory, 5_000), ChunkParams::new(850, 140));
        let p = chunk_params(&DocType::Practice, 5000);
        assert!(p.size <= 700 && p.overlap >= 100);
    }

    #[test]
    fn test_infer_doc_type() {
        assert_eq!(
            infer_doc_type("Grille d'évaluation formative", &["rubrique".into()], ""),
            DocType::Artifacts
        );
        assert_eq!(infer_doc_type("Journal de bord", &[], ""), DocType::Reflection);
        assert_eq!(
            infer_doc_type("Séance volleyball", &[], "échauffement"),
            DocType::Practice
        );
        assert_eq!(
            infer_doc_type("Fondements", &[], "les théories de l'apprentissage"),
            DocType::Theory
        );
    }

    #[test]
    fn test_content_uuid_is_deterministic() {
        let a = content_uuid("notes/a.md|Intro|0|hello");
        let b = content_uuid("notes/a.md|Intro|0|hello");
        let c = content_uuid("notes/a.md|Intro|1|hello");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(Uuid::parse_str(&a).is_ok());
    }
}
