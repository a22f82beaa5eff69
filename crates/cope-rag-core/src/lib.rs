//! # cope-rag core
//!
//! Pure retrieval-augmentation logic shared by the `cope-rag` app crate:
//! the chunk data model, windowed chunking with a content-type policy,
//! markdown note parsing, lexical scoring and metadata filters, cross-source
//! fusion and reranking, context compression, query intent handling, and
//! the embedding / vector-store abstractions.
//!
//! This crate contains no tokio, filesystem, or network code. Everything
//! that touches the outside world lives in the app crate and talks to this
//! crate through the [`embedding::EmbeddingProvider`] and
//! [`store::VectorStore`] traits.

pub mod chunk;
pub mod compress;
pub mod embedding;
pub mod error;
pub mod fusion;
pub mod markdown;
pub mod models;
pub mod query;
pub mod search;
pub mod store;

pub use error::{Error, Result};
