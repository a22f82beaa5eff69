//! # cope CLI
//!
//! Thin command-line wrapper over the `cope_rag` pipeline.
//!
//! ## Usage
//!
//! ```bash
//! cope --config ./config/cope.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `cope index` | Incrementally index the note vault |
//! | `cope status` | Show the last indexing run and manifest size |
//! | `cope ingest <doc_id> <file.pdf> --title ...` | Ingest a PDF document |
//! | `cope remove <doc_id>` | Remove a document's cache and vectors |
//! | `cope search "<query>"` | Ground a query and print the citations |
//! | `cope search "<query>" --save-to <folder>` | Also save the result as a vault note |
//! | `cope vault health` | Probe the configured vault backends |
//!
//! Logs go to stderr and honour `RUST_LOG` (default `info`).

use std::path::PathBuf;

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cope_rag::config::{load_config, Config};
use cope_rag::formatter::{default_note_name, save_answer_note, short_id, AnswerNote};
use cope_rag::indexer::{index_status, run_incremental_index};
use cope_rag::ingest::{DocumentIngestor, DocumentMetadata};
use cope_rag::retrieve::{GroundedContext, GroundingRequest, Retriever};
use cope_rag::vault::Vault;
use cope_rag_core::models::{ChunkSource, DocType, MetadataFilters};

/// Grounded retrieval over PDF documents and a markdown note vault.
///
/// All commands read a TOML configuration; see `config/cope.example.toml`.
#[derive(Parser)]
#[command(name = "cope", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/cope.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Incrementally index the configured note vault.
    ///
    /// Unchanged notes are skipped; notes gone from the vault lose their
    /// vectors. Per-note failures are listed but do not stop the run.
    Index,

    /// Show the last indexing run and the manifest size.
    Status,

    /// Ingest a PDF document.
    Ingest {
        /// Caller-chosen document id.
        doc_id: String,
        /// Path to the PDF file.
        file: PathBuf,
        #[arg(long)]
        title: String,
        /// theory, practice, reflection, artifacts, or any label. Inferred when omitted.
        #[arg(long)]
        doc_type: Option<String>,
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long)]
        course: Option<String>,
        #[arg(long)]
        language: Option<String>,
    },

    /// Remove a document's lexical cache and vectors.
    Remove { doc_id: String },

    /// Ground a query and print the compressed citations.
    Search {
        query: String,
        /// Include vault notes.
        #[arg(long)]
        notes: bool,
        /// Boost notes over PDF documents.
        #[arg(long)]
        prefer_notes: bool,
        /// Restrict to these document ids.
        #[arg(long = "doc")]
        doc_ids: Vec<String>,
        #[arg(long = "doc-type")]
        doc_types: Vec<String>,
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Conversation mode, e.g. `justification`.
        #[arg(long)]
        mode: Option<String>,
        /// Print the grounded context as JSON.
        #[arg(long)]
        json: bool,
        /// Save the question and its citations as a note in this vault folder.
        #[arg(long, value_name = "FOLDER")]
        save_to: Option<String>,
    },

    /// Vault backend commands.
    Vault {
        #[command(subcommand)]
        action: VaultAction,
    },
}

#[derive(Subcommand)]
enum VaultAction {
    /// Probe every configured backend and show which one is active.
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;

    match cli.command {
        Commands::Index => run_index(&cfg).await?,
        Commands::Status => run_status(&cfg)?,
        Commands::Ingest {
            doc_id,
            file,
            title,
            doc_type,
            tags,
            course,
            language,
        } => {
            let metadata = DocumentMetadata {
                doc_type: doc_type.map(DocType::from),
                tags,
                course,
                language,
            };
            let report = DocumentIngestor::from_config(&cfg)?
                .ingest_file(&doc_id, &file, &title, metadata)
                .await?;
            println!("ingest {}", report.doc_id);
            println!("  type: {}", report.doc_type);
            println!("  pages: {}", report.pages);
            println!("  chunks: {}", report.chunks);
            println!("  vectors: {}", report.vectors_indexed);
            if let Some(e) = report.vector_error {
                println!("  vector indexing skipped: {}", e);
            }
            println!("ok");
        }
        Commands::Remove { doc_id } => {
            let report = DocumentIngestor::from_config(&cfg)?
                .remove_document(&doc_id)
                .await?;
            println!("remove {}", report.doc_id);
            println!("  cache removed: {}", report.cache_removed);
            if let Some(e) = report.vector_error {
                println!("  vector deletion failed: {}", e);
            }
        }
        Commands::Search {
            query,
            notes,
            prefer_notes,
            doc_ids,
            doc_types,
            tags,
            mode,
            json,
            save_to,
        } => {
            let request = GroundingRequest {
                query,
                mode,
                doc_ids,
                include_notes: notes || prefer_notes,
                prefer_notes,
                filters: MetadataFilters {
                    doc_types,
                    tags,
                    ..Default::default()
                },
            };
            run_search(&cfg, &request, json, save_to.as_deref()).await?;
        }
        Commands::Vault {
            action: VaultAction::Health,
        } => {
            let status = Vault::from_config(&cfg.vault)?.status().await;
            for (name, health) in [("remote", &status.remote), ("filesystem", &status.filesystem)] {
                match health {
                    Some(h) => println!(
                        "{:<11} {} ({})",
                        name,
                        if h.ok { "OK" } else { "DOWN" },
                        h.detail
                    ),
                    None => println!("{:<11} not configured", name),
                }
            }
            println!("active: {}", status.active);
        }
    }

    Ok(())
}

async fn run_index(cfg: &Config) -> Result<()> {
    let stats = run_incremental_index(cfg).await?;
    println!("index {}", cfg.vault.vault_name);
    println!("  notes seen: {}", stats.notes_seen);
    println!("  indexed: {}", stats.indexed);
    println!("  skipped: {}", stats.skipped);
    println!("  deleted: {}", stats.deleted);
    println!("  chunks: {}", stats.chunks_indexed);
    println!("  errors: {}", stats.error_count());
    for e in &stats.errors {
        println!("    {}: {}", e.item, e.message);
    }
    println!("ok");
    Ok(())
}

fn run_status(cfg: &Config) -> Result<()> {
    let status = index_status(cfg)?;
    println!("vault {}", cfg.vault.vault_name);
    println!("  manifest entries: {}", status.manifest_entries);
    match status.last_run {
        Some(run) => {
            println!("  last run: {}", run.last_run.to_rfc3339());
            println!("  backend: {}", run.backend);
            println!(
                "  indexed: {}  skipped: {}  deleted: {}  errors: {}",
                run.stats.indexed,
                run.stats.skipped,
                run.stats.deleted,
                run.stats.error_count()
            );
        }
        None => println!("  last run: never"),
    }
    Ok(())
}

async fn run_search(
    cfg: &Config,
    request: &GroundingRequest,
    json: bool,
    save_to: Option<&str>,
) -> Result<()> {
    let context = Retriever::from_config(cfg)?.ground(request).await?;
    if let Some(folder) = save_to {
        let path = save_search_note(cfg, request, &context, folder).await?;
        if !json {
            println!("saved: {}", path);
        }
    }
    if json {
        println!("{}", serde_json::to_string_pretty(&context)?);
        return Ok(());
    }

    println!("intent: {}", context.intent.as_str());
    if context.insufficient {
        println!("No sufficient sources found.");
        return Ok(());
    }
    for (i, c) in context.citations.iter().enumerate() {
        let label = c.title.as_deref().unwrap_or(&c.doc_id);
        let locator = match (c.source, c.page, c.heading.as_deref()) {
            (ChunkSource::Pdf, Some(page), _) => format!("p.{}", page),
            (ChunkSource::Note, _, Some(heading)) => format!("#{}", heading),
            _ => String::new(),
        };
        println!(
            "{}. [{}] {} {} (score: {:.3})",
            i + 1,
            c.source,
            label,
            locator,
            c.fused_score
        );
        println!("   {}", c.excerpt);
    }
    Ok(())
}

/// Save the grounded excerpts as an answer note; returns the vault path.
async fn save_search_note(
    cfg: &Config,
    request: &GroundingRequest,
    context: &GroundedContext,
    folder: &str,
) -> Result<String> {
    let answer = if context.insufficient {
        "No sufficient sources found.".to_string()
    } else {
        context
            .citations
            .iter()
            .map(|c| format!("- {}", c.excerpt))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let id = short_id();
    let mut note = AnswerNote::new(id.clone(), request.query.clone(), answer);
    note.sources = context.citations.clone();
    note.include_context_summary = true;
    note.include_trace = false;
    let file_name = default_note_name(&request.query, &id, Utc::now());
    let vault = Vault::from_config(&cfg.vault)?;
    save_answer_note(&vault, folder, &file_name, &note).await
}
