//! Filesystem vault backend.
//!
//! Every path operation resolves to an absolute path and verifies it lies
//! under the vault root before touching the disk. Symlinks are followed
//! by canonicalizing the deepest existing ancestor of the target, so a
//! link pointing outside the root is rejected like a `..` escape.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use walkdir::WalkDir;

use cope_rag_core::markdown::parse_note;
use cope_rag_core::search::lexical_score;
use cope_rag_core::{Error, Result};

use super::rules::VaultRules;
use super::{BackendKind, NoteFile, NoteHit, VaultAdapter, VaultHealth};
use crate::config::{CollisionPolicy, VaultConfig};

/// Longest sanitized file stem.
pub const MAX_FILENAME_CHARS: usize = 120;
const SNIPPET_CHARS: usize = 200;
const SNIPPET_LEAD_CHARS: usize = 60;

pub struct FsVault {
    root: PathBuf,
    rules: VaultRules,
    max_notes: usize,
    max_note_bytes: u64,
    collision_policy: CollisionPolicy,
}

/// Collapse `.` and `..` without touching the filesystem.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Canonicalize the deepest existing ancestor and re-append the rest.
fn canonicalize_existing_prefix(path: &Path) -> PathBuf {
    let mut existing = path.to_path_buf();
    let mut rest: Vec<std::ffi::OsString> = Vec::new();
    loop {
        if let Ok(canonical) = existing.canonicalize() {
            let mut out = canonical;
            for part in rest.iter().rev() {
                out.push(part);
            }
            return out;
        }
        match (existing.file_name().map(|n| n.to_os_string()), existing.parent()) {
            (Some(name), Some(parent)) => {
                rest.push(name);
                existing = parent.to_path_buf();
            }
            _ => return path.to_path_buf(),
        }
    }
}

fn to_utc(time: std::io::Result<std::time::SystemTime>) -> Option<DateTime<Utc>> {
    time.ok().map(DateTime::<Utc>::from)
}

/// Make `name` safe to use as a file stem.
///
/// Strips characters illegal in filenames, collapses whitespace, trims
/// leading/trailing dots, and caps the length. Falls back to `"note"`.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' | '#' | '^' | '[' | ']' => ' ',
            c if c.is_control() => ' ',
            c => c,
        })
        .collect();
    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    let trimmed = collapsed.trim_matches(|c: char| c == '.' || c.is_whitespace());
    let capped: String = trimmed.chars().take(MAX_FILENAME_CHARS).collect();
    let capped = capped.trim_end().to_string();
    if capped.is_empty() {
        "note".to_string()
    } else {
        capped
    }
}

fn with_md_extension(path: &str) -> String {
    if path.to_lowercase().ends_with(".md") {
        path.to_string()
    } else {
        format!("{}.md", path)
    }
}

/// Sanitize the file-name part of a relative note path, keeping folders.
fn sanitize_note_path(path: &str) -> String {
    let path = super::rules::normalize_rel(path);
    let (dir, file) = match path.rsplit_once('/') {
        Some((d, f)) => (Some(d), f),
        None => (None, path.as_str()),
    };
    let stem = file.strip_suffix(".md").or_else(|| file.strip_suffix(".MD")).unwrap_or(file);
    let name = format!("{}.md", sanitize_filename(stem));
    match dir {
        Some(d) => format!("{}/{}", d, name),
        None => name,
    }
}

fn snippet_for(content: &str, query: &str) -> String {
    let lowered = content.to_lowercase();
    let first_hit = query
        .split_whitespace()
        .map(str::to_lowercase)
        .filter(|t| t.chars().count() >= 3)
        .filter_map(|t| lowered.find(&t))
        .min();
    let start_char = first_hit
        .map(|byte| lowered[..byte].chars().count().saturating_sub(SNIPPET_LEAD_CHARS))
        .unwrap_or(0);
    let window: String = content.chars().skip(start_char).take(SNIPPET_CHARS).collect();
    window.split_whitespace().collect::<Vec<_>>().join(" ")
}

impl FsVault {
    pub fn new(config: &VaultConfig) -> anyhow::Result<Self> {
        let path = config
            .path
            .as_ref()
            .ok_or_else(|| Error::ConfigInvalid("vault.path is required for the filesystem vault".into()))?;
        let absolute = if path.is_absolute() {
            path.clone()
        } else {
            std::env::current_dir()?.join(path)
        };
        let root = canonicalize_existing_prefix(&normalize_lexically(&absolute));
        Ok(Self {
            root,
            rules: VaultRules::from_config(config)?,
            max_notes: config.max_notes_to_index,
            max_note_bytes: config.max_note_bytes,
            collision_policy: config.collision_policy,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `path` (vault-relative or absolute) to `(absolute, relative)`.
    ///
    /// Fails with `PathRejected` when the target escapes the root or the
    /// include/exclude rules forbid it.
    pub fn resolve(&self, path: &str) -> Result<(PathBuf, String)> {
        let trimmed = path.trim();
        if trimmed.is_empty() {
            return Err(Error::path_rejected(path, "empty path"));
        }
        let candidate = Path::new(trimmed);
        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root.join(candidate)
        };
        let resolved = canonicalize_existing_prefix(&normalize_lexically(&joined));

        let rel = match resolved.strip_prefix(&self.root) {
            Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
            Err(_) => return Err(Error::path_rejected(path, "outside the vault root")),
        };
        if rel.is_empty() {
            return Err(Error::path_rejected(path, "the vault root is not a note"));
        }
        self.rules.check(&rel)?;
        Ok((resolved, rel))
    }

    fn free_rename_target(&self, rel: &str) -> Result<(PathBuf, String)> {
        let stem = rel.strip_suffix(".md").unwrap_or(rel);
        for n in 1..1000 {
            let candidate = if n == 1 {
                format!("{}-new.md", stem)
            } else {
                format!("{}-new-{}.md", stem, n)
            };
            let (abs, rel) = self.resolve(&candidate)?;
            if !abs.exists() {
                return Ok((abs, rel));
            }
        }
        Err(Error::path_rejected(rel, "no free file name for the new note"))
    }
}

#[async_trait]
impl VaultAdapter for FsVault {
    fn kind(&self) -> BackendKind {
        BackendKind::Filesystem
    }

    async fn list_notes(&self) -> Result<Vec<String>> {
        if !self.root.is_dir() {
            return Err(Error::BackendUnavailable(format!(
                "vault root is not a directory: {}",
                self.root.display()
            )));
        }

        let mut notes = Vec::new();
        for entry in WalkDir::new(&self.root).follow_links(false) {
            let entry = entry.map_err(|e| Error::Io(e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let is_md = path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("md"));
            if !is_md {
                continue;
            }
            let Ok(relative) = path.strip_prefix(&self.root) else {
                continue;
            };
            let rel = relative.to_string_lossy().replace('\\', "/");
            if !self.rules.allows(&rel) {
                continue;
            }
            if entry.metadata().map(|m| m.len()).unwrap_or(0) > self.max_note_bytes {
                continue;
            }
            notes.push(rel);
        }

        notes.sort();
        notes.truncate(self.max_notes);
        Ok(notes)
    }

    async fn read_note(&self, path: &str) -> Result<NoteFile> {
        let (abs, rel) = self.resolve(path)?;
        let metadata = tokio::fs::metadata(&abs).await?;
        if metadata.len() > self.max_note_bytes {
            return Err(Error::ExtractionFailed(format!(
                "{} is {} bytes, above the {} byte limit",
                rel,
                metadata.len(),
                self.max_note_bytes
            )));
        }
        let bytes = tokio::fs::read(&abs).await?;
        Ok(NoteFile {
            path: rel,
            content: String::from_utf8_lossy(&bytes).into_owned(),
            modified_at: to_utc(metadata.modified()),
        })
    }

    async fn create_note(&self, path: &str, content: &str) -> Result<String> {
        let wanted = sanitize_note_path(&with_md_extension(path));
        let (mut abs, mut rel) = self.resolve(&wanted)?;
        if abs.exists() {
            match self.collision_policy {
                CollisionPolicy::Append => return self.append_note(&rel, content).await,
                CollisionPolicy::Rename => {
                    (abs, rel) = self.free_rename_target(&rel)?;
                }
            }
        }
        if let Some(parent) = abs.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&abs, content).await?;
        Ok(rel)
    }

    async fn append_note(&self, path: &str, content: &str) -> Result<String> {
        let (abs, rel) = self.resolve(&with_md_extension(path))?;
        let existing = match tokio::fs::read_to_string(&abs).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        let combined = if existing.trim().is_empty() {
            content.to_string()
        } else {
            format!("{}\n\n{}", existing.trim_end(), content)
        };
        if let Some(parent) = abs.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&abs, combined).await?;
        Ok(rel)
    }

    async fn search_notes(&self, query: &str, limit: usize) -> Result<Vec<NoteHit>> {
        let mut scored: Vec<(usize, NoteHit)> = Vec::new();
        for rel in self.list_notes().await? {
            let Ok(note) = self.read_note(&rel).await else {
                continue;
            };
            let parsed = parse_note(&note.path, &note.content);
            let score = lexical_score(query, &format!("{}\n{}", parsed.title, note.content));
            if score == 0 {
                continue;
            }
            scored.push((
                score,
                NoteHit {
                    path: note.path,
                    title: parsed.title,
                    snippet: snippet_for(&note.content, query),
                },
            ));
        }
        // Stable: equal scores keep path order.
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(scored.into_iter().take(limit).map(|(_, hit)| hit).collect())
    }

    async fn health(&self) -> VaultHealth {
        if self.root.is_dir() {
            VaultHealth::ok(format!("vault at {}", self.root.display()))
        } else {
            VaultHealth::down(format!("vault path missing: {}", self.root.display()))
        }
    }
}
