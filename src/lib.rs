//! # cope-rag
//!
//! Grounded context for a teaching assistant, drawn from two corpora:
//! uploaded PDF documents and a personal markdown note vault.
//!
//! The pure pipeline (chunking, note parsing, scoring, fusion, compression,
//! and the embedding and vector-store traits) lives in [`cope_rag_core`].
//! This crate binds it to the outside world: configuration, HTTP clients,
//! vault backends, persisted state, and the `cope` CLI.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ PDF upload │──▶│  Ingestor    │──▶│ chunk cache  │ (lexical)
//! └────────────┘   │ extract+chunk│──▶│ vector store │ (semantic)
//!                  └──────────────┘   └──────┬───────┘
//! ┌────────────┐   ┌──────────────┐          │
//! │ Note vault │──▶│ Note indexer │──────────┤
//! │ fs/remote  │   │ manifest diff│          ▼
//! └────────────┘   └──────────────┘   ┌──────────────┐
//!                                     │  Retriever   │ fuse → rerank
//!                                     │ PDF + notes  │ → compress
//!                                     └──────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`embedding`] | HTTP embedding provider and provider selection |
//! | [`qdrant`] | HTTP vector-store client |
//! | [`vault`] | Filesystem and remote note backends behind one façade |
//! | [`manifest`] | Persisted manifest and status snapshot |
//! | [`chunk_cache`] | Per-document lexical chunk cache |
//! | [`indexer`] | Incremental note-vault indexing |
//! | [`extract`] | Per-page PDF text extraction |
//! | [`ingest`] | PDF document ingestion and removal |
//! | [`retrieve`] | PDF and note retrieval, grounding pipeline |
//! | [`formatter`] | Answer-to-note rendering |

pub mod chunk_cache;
pub mod config;
pub mod embedding;
pub mod extract;
pub mod formatter;
pub mod indexer;
pub mod ingest;
pub mod manifest;
pub mod qdrant;
pub mod retrieve;
pub mod vault;
