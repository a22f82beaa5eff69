//! Markdown rendering for answers saved into the vault.

use std::collections::BTreeMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use cope_rag_core::models::{ChunkSource, Citation};
use cope_rag_core::Error;

use crate::vault::fs::sanitize_filename;
use crate::vault::Vault;

/// Characters of each excerpt shown in the retrieved-context summary.
const SUMMARY_EXCERPT_CHARS: usize = 180;
/// Sources listed in the retrieved-context summary.
const SUMMARY_SOURCES: usize = 8;

/// One answered question, ready to become a note.
#[derive(Debug, Clone)]
pub struct AnswerNote {
    pub created_at: DateTime<Utc>,
    pub session_id: String,
    pub model_name: Option<String>,
    pub question: String,
    pub answer: String,
    pub tags: Vec<String>,
    pub sources: Vec<Citation>,
    /// Key/value learning trace, rendered in key order.
    pub learning_trace: Option<BTreeMap<String, String>>,
    pub include_sources: bool,
    pub include_trace: bool,
    pub include_context_summary: bool,
}

impl AnswerNote {
    pub fn new(session_id: impl Into<String>, question: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            created_at: Utc::now(),
            session_id: session_id.into(),
            model_name: None,
            question: question.into(),
            answer: answer.into(),
            tags: vec!["EPS".into(), "RAG".into()],
            sources: Vec::new(),
            learning_trace: None,
            include_sources: true,
            include_trace: true,
            include_context_summary: false,
        }
    }
}

fn source_label(c: &Citation) -> &str {
    c.title
        .as_deref()
        .or(c.file_path.as_deref())
        .unwrap_or(&c.doc_id)
}

fn citation_line(c: &Citation) -> String {
    match c.source {
        ChunkSource::Note => format!(
            "- [Note] {} ({}#{})",
            source_label(c),
            c.file_path.as_deref().unwrap_or(&c.doc_id),
            c.heading.as_deref().unwrap_or("section")
        ),
        ChunkSource::Pdf => match c.page {
            Some(page) => format!("- [PDF] {} (doc:{} p.{})", source_label(c), c.doc_id, page),
            None => format!("- [PDF] {} (doc:{})", source_label(c), c.doc_id),
        },
    }
}

/// Render an answer as a markdown note with a frontmatter block.
pub fn format_answer_note(note: &AnswerNote) -> String {
    let mut lines: Vec<String> = vec!["---".into()];
    lines.push(format!("created_at: {}", note.created_at.to_rfc3339()));
    lines.push(format!("session_id: {}", note.session_id));
    lines.push(format!(
        "model_name: {}",
        note.model_name.as_deref().unwrap_or("unknown")
    ));
    lines.push(format!("tags: [{}]", note.tags.join(", ")));
    if note.sources.is_empty() {
        lines.push("sources_used: []".into());
    } else {
        lines.push("sources_used:".into());
        for c in &note.sources {
            lines.push(format!("  - {}: {}", c.source, source_label(c)));
        }
    }
    lines.push("---".into());
    lines.push(String::new());

    lines.push("# Question".into());
    lines.push(note.question.trim().to_string());
    lines.push(String::new());
    lines.push("# Answer (RAG)".into());
    lines.push(note.answer.trim().to_string());
    lines.push(String::new());

    if note.include_sources {
        lines.push("# Sources / Citations".into());
        if note.sources.is_empty() {
            lines.push("- None".into());
        } else {
            lines.extend(note.sources.iter().map(citation_line));
        }
        lines.push(String::new());
    }

    if note.include_trace {
        lines.push("# Learning trace".into());
        match &note.learning_trace {
            Some(trace) if !trace.is_empty() => {
                lines.extend(trace.iter().map(|(k, v)| format!("- {}: {}", k, v)));
            }
            _ => lines.push("- N/A".into()),
        }
        lines.push(String::new());
    }

    if note.include_context_summary {
        lines.push("# Retrieved context summary".into());
        for c in note.sources.iter().take(SUMMARY_SOURCES) {
            let excerpt: String = c.excerpt.chars().take(SUMMARY_EXCERPT_CHARS).collect();
            lines.push(format!("- {}: {}", c.source, excerpt));
        }
        lines.push(String::new());
    }

    lines.join("\n")
}

/// `"YYYY-MM-DD - <topic> - <id>.md"`, with the topic made filename-safe.
pub fn default_note_name(topic: &str, short_id: &str, date: DateTime<Utc>) -> String {
    let topic = if topic.trim().is_empty() { "knowledge" } else { topic };
    format!(
        "{} - {} - {}.md",
        date.format("%Y-%m-%d"),
        sanitize_filename(topic),
        short_id
    )
}

/// Random 8-character id for note names.
pub fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Write a rendered answer into the active vault, returning the path used.
pub async fn save_answer_note(vault: &Vault, folder: &str, file_name: &str, note: &AnswerNote) -> Result<String> {
    let backend = vault
        .active()
        .await
        .ok_or_else(|| Error::BackendUnavailable("no vault backend is available".into()))?;
    let folder = folder.trim_matches('/');
    let path = if folder.is_empty() {
        file_name.to_string()
    } else {
        format!("{}/{}", folder, file_name)
    };
    Ok(backend.create_note(&path, &format_answer_note(note)).await?)
}
