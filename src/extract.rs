//! Per-page PDF text extraction.
//!
//! Extraction is pipeline-layer: callers hand over bytes and get back
//! `(page_number, text)` pairs. Malformed input never panics; it surfaces
//! as [`Error::ExtractionFailed`] and the caller decides what to skip.

use cope_rag_core::{Error, Result};

/// One extracted page. `number` is 1-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageText {
    pub number: u32,
    pub text: String,
}

/// Source of per-page text.
pub trait PageExtractor: Send + Sync {
    fn pages(&self, bytes: &[u8]) -> Result<Vec<PageText>>;
}

/// [`PageExtractor`] backed by `pdf-extract`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PdfExtractor;

impl PageExtractor for PdfExtractor {
    fn pages(&self, bytes: &[u8]) -> Result<Vec<PageText>> {
        let pages = pdf_extract::extract_text_from_mem_by_pages(bytes)
            .map_err(|e| Error::ExtractionFailed(format!("PDF: {}", e)))?;
        Ok(pages
            .into_iter()
            .enumerate()
            .map(|(i, text)| PageText {
                number: i as u32 + 1,
                text: normalize_page_text(&text),
            })
            .collect())
    }
}

/// Collapse the whitespace runs PDF layout leaves behind.
pub fn normalize_page_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Sample used for document-type inference: the head of the first pages.
pub fn type_sample(pages: &[PageText], pages_to_sample: usize, chars_per_page: usize) -> String {
    pages
        .iter()
        .take(pages_to_sample)
        .map(|p| p.text.chars().take(chars_per_page).collect::<String>())
        .collect::<Vec<_>>()
        .join("\n")
}
