//! Markdown note parser: frontmatter, title, headings, tags, wikilinks, and
//! heading-bounded chunking.
//!
//! Parsing never fails. Missing or malformed frontmatter yields an empty
//! map, and the body is still processed.
//!
//! # Example
//!
//! ```rust
//! use cope_rag_core::markdown::parse_note;
//!
//! let parsed = parse_note("Cours/Didactique.md", "---\ntags: [eps]\n---\n# Didactique\nTexte #pedagogie [[LienNote]]\n");
//! assert_eq!(parsed.title, "Didactique");
//! assert_eq!(parsed.tags, vec!["eps".to_string(), "pedagogie".to_string()]);
//! assert_eq!(parsed.outlinks, vec!["LienNote".to_string()]);
//! ```

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chunk::{chunk_text, content_uuid};
use crate::models::{text_prefix, Chunk, ChunkSource, DocType, Locator};

/// A note as read from the vault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Note {
    /// Vault-relative path with `/` separators.
    pub path: String,
    pub content: String,
    pub modified_at: Option<DateTime<Utc>>,
}

/// A frontmatter value: bracketed lists become [`FrontmatterValue::List`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FrontmatterValue {
    Bool(bool),
    List(Vec<String>),
    Text(String),
}

impl FrontmatterValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FrontmatterValue::Text(s) if !s.is_empty() => Some(s),
            _ => None,
        }
    }
}

/// Structural facts extracted from a note.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedNote {
    pub title: String,
    pub frontmatter: BTreeMap<String, FrontmatterValue>,
    pub body: String,
    pub headings: Vec<String>,
    /// Deduplicated, case-preserving, sorted.
    pub tags: Vec<String>,
    pub outlinks: Vec<String>,
}

impl ParsedNote {
    fn frontmatter_text(&self, key: &str) -> Option<String> {
        self.frontmatter
            .get(key)
            .and_then(FrontmatterValue::as_text)
            .map(str::to_string)
    }
}

/// Parse a note's content.
pub fn parse_note(path: &str, content: &str) -> ParsedNote {
    let content = content.replace("\r\n", "\n");
    let (frontmatter, body) = split_frontmatter(&content);
    let sections = split_sections(&body);
    let headings: Vec<String> = sections
        .iter()
        .filter_map(|s| s.heading.clone())
        .collect();

    let title = frontmatter
        .get("title")
        .and_then(FrontmatterValue::as_text)
        .map(str::to_string)
        .or_else(|| {
            sections
                .iter()
                .find(|s| s.level == 1)
                .and_then(|s| s.heading.clone())
        })
        .unwrap_or_else(|| file_stem(path));

    let tags = extract_tags(&frontmatter, &body);
    let outlinks = extract_wikilinks(&body);

    ParsedNote {
        title,
        frontmatter,
        body,
        headings,
        tags,
        outlinks,
    }
}

/// Split a parsed note into heading-bounded, size-limited chunks.
///
/// Each section (text between consecutive headings, plus any preamble
/// before the first heading) is windowed independently. Chunk ids derive
/// from `(path, heading, index, text prefix)`.
pub fn chunk_by_headings(
    note: &Note,
    parsed: &ParsedNote,
    max_chars: usize,
    overlap: usize,
) -> Vec<Chunk> {
    let tags: BTreeSet<String> = parsed.tags.iter().cloned().collect();
    let doc_type = parsed
        .frontmatter_text("type")
        .or_else(|| parsed.frontmatter_text("note_type"))
        .map(DocType::from)
        .unwrap_or_else(|| infer_note_type(&note.path));
    let course = parsed.frontmatter_text("course");
    let language = parsed.frontmatter_text("language");

    let mut chunks = Vec::new();
    let mut index = 0usize;
    for section in split_sections(&parsed.body) {
        let text = section.text.trim();
        if text.is_empty() {
            continue;
        }
        for part in chunk_text(text, max_chars, overlap) {
            let id = content_uuid(&format!(
                "{}|{}|{}|{}",
                note.path,
                section.heading.as_deref().unwrap_or(""),
                index,
                text_prefix(&part, 120)
            ));
            chunks.push(Chunk {
                id,
                text: part,
                source: ChunkSource::Note,
                doc_id: format!("note:{}", note.path),
                file_path: Some(note.path.clone()),
                locator: Locator::Heading(section.heading.clone()),
                title: Some(parsed.title.clone()),
                doc_type: doc_type.clone(),
                tags: tags.clone(),
                course: course.clone(),
                language: language.clone(),
                modified_at: note.modified_at,
                score: 0.0,
                fused_score: 0.0,
            });
            index += 1;
        }
    }
    chunks
}

/// Infer a note type from the folders on its path.
///
/// Folders named `practice`, `reflection`, or `artifacts` (also `séance`
/// for practice) map to those types; everything else is theory.
pub fn infer_note_type(path: &str) -> DocType {
    let lower = path.to_lowercase();
    let mut folders: Vec<&str> = lower.split('/').collect();
    folders.pop();
    for folder in folders {
        if folder.contains("reflection") {
            return DocType::Reflection;
        }
        if folder.contains("artifact") {
            return DocType::Artifacts;
        }
        if folder.contains("practice") || folder.contains("seance") || folder.contains("séance") {
            return DocType::Practice;
        }
    }
    DocType::Theory
}

fn file_stem(path: &str) -> String {
    let name = path.rsplit('/').next().unwrap_or(path);
    match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
        _ => name.to_string(),
    }
}

fn split_frontmatter(content: &str) -> (BTreeMap<String, FrontmatterValue>, String) {
    let Some(rest) = content.strip_prefix("---\n") else {
        return (BTreeMap::new(), content.to_string());
    };
    let (raw, body) = if let Some(end) = rest.find("\n---\n") {
        (&rest[..end], &rest[end + 5..])
    } else if let Some(raw) = rest.strip_suffix("\n---") {
        (raw, "")
    } else {
        return (BTreeMap::new(), content.to_string());
    };

    let mut frontmatter = BTreeMap::new();
    for line in raw.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() || line.starts_with(' ') || line.starts_with('-') {
            continue;
        }
        frontmatter.insert(key.to_string(), parse_scalar(value.trim()));
    }
    (frontmatter, body.to_string())
}

fn parse_scalar(value: &str) -> FrontmatterValue {
    if value.starts_with('[') && value.ends_with(']') && value.len() >= 2 {
        let items = value[1..value.len() - 1]
            .split(',')
            .map(|x| x.trim().trim_matches(|c| c == '"' || c == '\'').to_string())
            .filter(|x| !x.is_empty())
            .collect();
        return FrontmatterValue::List(items);
    }
    match value.to_lowercase().as_str() {
        "true" => FrontmatterValue::Bool(true),
        "false" => FrontmatterValue::Bool(false),
        _ => FrontmatterValue::Text(value.trim_matches(|c| c == '"' || c == '\'').to_string()),
    }
}

struct Section {
    heading: Option<String>,
    level: usize,
    text: String,
}

/// Recognize an ATX heading line (`#` .. `######` followed by whitespace).
fn heading_of(line: &str) -> Option<(usize, String)> {
    let hashes = line.chars().take_while(|c| *c == '#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    let rest = &line[hashes..];
    if !rest.starts_with(' ') && !rest.starts_with('\t') {
        return None;
    }
    let title = rest.trim().trim_end_matches('#').trim();
    if title.is_empty() {
        return None;
    }
    Some((hashes, title.to_string()))
}

fn split_sections(body: &str) -> Vec<Section> {
    let mut sections = vec![Section {
        heading: None,
        level: 0,
        text: String::new(),
    }];
    let mut in_fence = false;

    for line in body.lines() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
        }
        if !in_fence {
            if let Some((level, title)) = heading_of(line) {
                sections.push(Section {
                    heading: Some(title),
                    level,
                    text: String::new(),
                });
                continue;
            }
        }
        if let Some(current) = sections.last_mut() {
            current.text.push_str(line);
            current.text.push('\n');
        }
    }
    sections
}

fn is_tag_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '-' || c == '/'
}

fn extract_tags(frontmatter: &BTreeMap<String, FrontmatterValue>, body: &str) -> Vec<String> {
    let mut tags: BTreeSet<String> = BTreeSet::new();
    match frontmatter.get("tags") {
        Some(FrontmatterValue::List(items)) => {
            tags.extend(items.iter().map(|t| t.trim_start_matches('#').to_string()));
        }
        Some(FrontmatterValue::Text(s)) => {
            tags.extend(
                s.split(',')
                    .map(|t| t.trim().trim_start_matches('#').to_string()),
            );
        }
        _ => {}
    }

    let mut in_fence = false;
    for line in body.lines() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        let mut prev: Option<char> = None;
        for (i, c) in line.char_indices() {
            let boundary = prev.map_or(true, |p| !(p.is_alphanumeric() || p == '_'));
            if c == '#' && boundary {
                let tag: String = line[i + 1..].chars().take_while(|c| is_tag_char(*c)).collect();
                if !tag.is_empty() {
                    tags.insert(tag);
                }
            }
            prev = Some(c);
        }
    }

    tags.into_iter().filter(|t| !t.is_empty()).collect()
}

fn extract_wikilinks(body: &str) -> Vec<String> {
    let mut links = Vec::new();
    let mut rest = body;
    while let Some(start) = rest.find("[[") {
        let after = &rest[start + 2..];
        let Some(end) = after.find("]]") else {
            break;
        };
        let inner = &after[..end];
        if !inner.contains(']') && !inner.trim().is_empty() {
            let target = inner.split('|').next().unwrap_or(inner).trim();
            if !target.is_empty() {
                links.push(target.to_string());
            }
        }
        rest = &after[end + 2..];
    }
    links
}
