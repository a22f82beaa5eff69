//! TOML configuration.
//!
//! Every section has defaults, so an empty file is a valid filesystem-less
//! configuration until validation asks for a vault path.
//!
//! ```toml
//! [storage]
//! root = "./data"
//!
//! [embedding]
//! provider = "ollama"
//! model = "nomic-embed-text"
//!
//! [vault]
//! mode = "filesystem"
//! path = "/home/me/Vault"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use cope_rag_core::fusion::{FusionWeights, RerankBoosts};
use cope_rag_core::Error;

/// Environment variable that supplies `vault.api_key` when the file omits it.
pub const VAULT_API_KEY_ENV: &str = "COPE_VAULT_API_KEY";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub vector_store: VectorStoreConfig,
    #[serde(default)]
    pub vault: VaultConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Directory holding the manifest, status snapshot, and chunk caches.
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
        }
    }
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("./data")
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `disabled`, `ollama`, or `hash`.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_embedding_url")]
    pub url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            url: default_embedding_url(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            cache_capacity: default_cache_capacity(),
            cache_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_embedding_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}
fn default_cache_capacity() -> usize {
    2048
}
fn default_cache_ttl_secs() -> u64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct VectorStoreConfig {
    #[serde(default = "default_vector_url")]
    pub url: String,
    #[serde(default = "default_collection")]
    pub collection: String,
    /// Vector size of the collection; must match the embedding model.
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_vector_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            url: default_vector_url(),
            collection: default_collection(),
            dims: default_dims(),
            timeout_secs: default_vector_timeout_secs(),
        }
    }
}

fn default_vector_url() -> String {
    "http://localhost:6333".to_string()
}
fn default_collection() -> String {
    "cope_chunks".to_string()
}
fn default_dims() -> usize {
    768
}
fn default_vector_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum VaultMode {
    #[default]
    Filesystem,
    Remote,
}

/// What `create_note` does when the target file already exists.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CollisionPolicy {
    /// Write to `<stem>-new.md` (then `-new-2`, ...).
    #[default]
    Rename,
    /// Append to the existing note.
    Append,
}

/// Where notes live and which of them to index.
#[derive(Debug, Deserialize, Clone)]
pub struct VaultConfig {
    #[serde(default)]
    pub mode: VaultMode,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub remote_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    /// When non-empty, only notes under these folders are visible.
    #[serde(default)]
    pub included_folders: Vec<String>,
    #[serde(default = "default_excluded_folders")]
    pub excluded_folders: Vec<String>,
    #[serde(default = "default_excluded_patterns")]
    pub excluded_patterns: Vec<String>,
    #[serde(default = "default_max_notes")]
    pub max_notes_to_index: usize,
    #[serde(default = "default_max_note_bytes")]
    pub max_note_bytes: u64,
    #[serde(default = "default_true")]
    pub incremental_indexing: bool,
    #[serde(default = "default_vault_name")]
    pub vault_name: String,
    #[serde(default)]
    pub collision_policy: CollisionPolicy,
    #[serde(default = "default_note_chunk_chars")]
    pub note_chunk_chars: usize,
    #[serde(default = "default_note_chunk_overlap")]
    pub note_chunk_overlap: usize,
    #[serde(default = "default_remote_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            mode: VaultMode::default(),
            path: None,
            remote_url: None,
            api_key: None,
            included_folders: Vec::new(),
            excluded_folders: default_excluded_folders(),
            excluded_patterns: default_excluded_patterns(),
            max_notes_to_index: default_max_notes(),
            max_note_bytes: default_max_note_bytes(),
            incremental_indexing: true,
            vault_name: default_vault_name(),
            collision_policy: CollisionPolicy::default(),
            note_chunk_chars: default_note_chunk_chars(),
            note_chunk_overlap: default_note_chunk_overlap(),
            timeout_secs: default_remote_timeout_secs(),
        }
    }
}

impl VaultConfig {
    /// Filesystem-mode config rooted at `path`, everything else default.
    pub fn filesystem(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn has_remote(&self) -> bool {
        self.remote_url.as_deref().is_some_and(|u| !u.trim().is_empty())
            && self.api_key.as_deref().is_some_and(|k| !k.trim().is_empty())
    }

    pub fn validate(&self) -> cope_rag_core::Result<()> {
        match self.mode {
            VaultMode::Filesystem => {
                if self.path.as_ref().map_or(true, |p| p.as_os_str().is_empty()) {
                    return Err(Error::ConfigInvalid(
                        "vault.path is required when vault.mode = \"filesystem\"".into(),
                    ));
                }
            }
            VaultMode::Remote => {
                if self.remote_url.as_deref().map_or(true, |u| u.trim().is_empty()) {
                    return Err(Error::ConfigInvalid(
                        "vault.remote_url is required when vault.mode = \"remote\"".into(),
                    ));
                }
                if self.api_key.as_deref().map_or(true, |k| k.trim().is_empty()) {
                    return Err(Error::ConfigInvalid(format!(
                        "vault.api_key (or {}) is required when vault.mode = \"remote\"",
                        VAULT_API_KEY_ENV
                    )));
                }
            }
        }
        if self.note_chunk_chars == 0 {
            return Err(Error::ConfigInvalid("vault.note_chunk_chars must be > 0".into()));
        }
        if self.note_chunk_overlap >= self.note_chunk_chars {
            return Err(Error::ConfigInvalid(
                "vault.note_chunk_overlap must be smaller than vault.note_chunk_chars".into(),
            ));
        }
        Ok(())
    }
}

fn default_excluded_folders() -> Vec<String> {
    vec![
        ".obsidian".to_string(),
        "templates".to_string(),
        "attachments".to_string(),
    ]
}
fn default_excluded_patterns() -> Vec<String> {
    vec![
        ".obsidian/**".to_string(),
        "templates/**".to_string(),
        "attachments/**".to_string(),
    ]
}
fn default_max_notes() -> usize {
    5000
}
fn default_max_note_bytes() -> u64 {
    400_000
}
fn default_true() -> bool {
    true
}
fn default_vault_name() -> String {
    "default".to_string()
}
fn default_note_chunk_chars() -> usize {
    1400
}
fn default_note_chunk_overlap() -> usize {
    180
}
fn default_remote_timeout_secs() -> u64 {
    8
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_note_top_k")]
    pub note_top_k: usize,
    #[serde(default = "default_context_max_chars")]
    pub context_max_chars: usize,
    #[serde(default = "default_pdf_weight")]
    pub pdf_weight: f64,
    #[serde(default = "default_note_weight")]
    pub note_weight: f64,
    #[serde(default = "default_heading_boost")]
    pub heading_boost: f64,
    #[serde(default = "default_tag_boost")]
    pub tag_boost: f64,
    #[serde(default = "default_recency_max_boost")]
    pub recency_max_boost: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            note_top_k: default_note_top_k(),
            context_max_chars: default_context_max_chars(),
            pdf_weight: default_pdf_weight(),
            note_weight: default_note_weight(),
            heading_boost: default_heading_boost(),
            tag_boost: default_tag_boost(),
            recency_max_boost: default_recency_max_boost(),
        }
    }
}

impl RetrievalConfig {
    pub fn fusion_weights(&self) -> FusionWeights {
        FusionWeights {
            pdf: self.pdf_weight,
            note: self.note_weight,
        }
    }

    pub fn rerank_boosts(&self) -> RerankBoosts {
        RerankBoosts {
            heading: self.heading_boost,
            tag: self.tag_boost,
            recency_max: self.recency_max_boost,
        }
    }
}

fn default_top_k() -> usize {
    4
}
fn default_note_top_k() -> usize {
    6
}
fn default_context_max_chars() -> usize {
    1600
}
fn default_pdf_weight() -> f64 {
    0.52
}
fn default_note_weight() -> f64 {
    0.48
}
fn default_heading_boost() -> f64 {
    0.08
}
fn default_tag_boost() -> f64 {
    0.06
}
fn default_recency_max_boost() -> f64 {
    0.08
}

impl Config {
    /// Check every section, failing with [`Error::ConfigInvalid`].
    pub fn validate(&self) -> cope_rag_core::Result<()> {
        self.vault.validate()?;

        if self.retrieval.top_k == 0 {
            return Err(Error::ConfigInvalid("retrieval.top_k must be >= 1".into()));
        }
        for (name, w) in [
            ("retrieval.pdf_weight", self.retrieval.pdf_weight),
            ("retrieval.note_weight", self.retrieval.note_weight),
        ] {
            if !(0.0..=1.0).contains(&w) {
                return Err(Error::ConfigInvalid(format!("{} must be in [0.0, 1.0]", name)));
            }
        }

        match self.embedding.provider.as_str() {
            "disabled" | "hash" => {}
            "ollama" => {
                if self.embedding.model.as_deref().map_or(true, |m| m.trim().is_empty()) {
                    return Err(Error::ConfigInvalid(
                        "embedding.model must be specified when provider is 'ollama'".into(),
                    ));
                }
            }
            other => {
                return Err(Error::ConfigInvalid(format!(
                    "unknown embedding provider '{}'; must be disabled, ollama, or hash",
                    other
                )))
            }
        }

        if self.vector_store.dims == 0 {
            return Err(Error::ConfigInvalid("vector_store.dims must be > 0".into()));
        }
        if self.vector_store.collection.trim().is_empty() {
            return Err(Error::ConfigInvalid("vector_store.collection must not be empty".into()));
        }
        Ok(())
    }
}

/// Parse and validate a configuration from TOML text.
pub fn parse_config(content: &str) -> Result<Config> {
    let mut config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if config.vault.api_key.is_none() {
        if let Ok(key) = std::env::var(VAULT_API_KEY_ENV) {
            if !key.trim().is_empty() {
                config.vault.api_key = Some(key);
            }
        }
    }

    config.validate()?;
    Ok(config)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}
