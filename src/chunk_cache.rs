//! Local lexical chunk cache, one JSON file per document.
//!
//! Ingestion writes here before any embedding call, so lexical retrieval
//! keeps working when the embedding service or vector store is down.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use cope_rag_core::chunk::content_hash;
use cope_rag_core::models::Chunk;

use crate::manifest::{read_json, write_json_atomic};

#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    doc_id: String,
    chunks: Vec<Chunk>,
}

/// Turn an arbitrary id into a file stem that cannot escape its directory.
///
/// Ids that needed rewriting get a short hash suffix so distinct ids never
/// share a file.
pub fn safe_file_stem(id: &str) -> String {
    let cleaned: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned == id && !cleaned.is_empty() {
        cleaned
    } else {
        format!("{}-{}", cleaned, &content_hash(id)[..12])
    }
}

/// Directory of per-document chunk files.
#[derive(Debug, Clone)]
pub struct ChunkCache {
    dir: PathBuf,
}

impl ChunkCache {
    pub fn new(storage_root: &Path) -> Self {
        Self {
            dir: storage_root.join("chunks"),
        }
    }

    fn path_for(&self, doc_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", safe_file_stem(doc_id)))
    }

    /// Replace the cached chunks of `doc_id`.
    pub fn save(&self, doc_id: &str, chunks: &[Chunk]) -> Result<()> {
        let file = CacheFile {
            doc_id: doc_id.to_string(),
            chunks: chunks.to_vec(),
        };
        write_json_atomic(&self.path_for(doc_id), &file)
            .with_context(|| format!("Failed to cache chunks for document {}", doc_id))
    }

    pub fn load(&self, doc_id: &str) -> Result<Vec<Chunk>> {
        Ok(read_json::<CacheFile>(&self.path_for(doc_id))?
            .map(|f| f.chunks)
            .unwrap_or_default())
    }

    /// Chunks of the given documents, or of every cached document.
    ///
    /// Unreadable cache files are skipped with a warning.
    pub fn load_many(&self, doc_ids: Option<&[String]>) -> Result<Vec<Chunk>> {
        if let Some(ids) = doc_ids {
            let mut out = Vec::new();
            for id in ids {
                match self.load(id) {
                    Ok(chunks) => out.extend(chunks),
                    Err(e) => warn!(doc_id = %id, error = %e, "skipping unreadable chunk cache"),
                }
            }
            return Ok(out);
        }

        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("Failed to read {}", self.dir.display())),
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        let mut out = Vec::new();
        for path in paths {
            match read_json::<CacheFile>(&path) {
                Ok(Some(file)) => out.extend(file.chunks),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable chunk cache"),
            }
        }
        Ok(out)
    }

    /// Delete the cache file; `Ok(false)` when there was none.
    pub fn remove(&self, doc_id: &str) -> Result<bool> {
        match std::fs::remove_file(self.path_for(doc_id)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Failed to remove chunk cache for {}", doc_id)),
        }
    }
}
