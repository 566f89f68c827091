//! # kc — knowledge collector CLI
//!
//! Drives the collector without the HTTP layer: initialize the store, run
//! indexing for one or all sources, search, navigate, inspect status, or
//! start the API server.

mod analytics;
mod chunker;
mod config;
mod connector;
mod connector_calendar;
mod connector_confluence;
mod connector_drive;
mod connector_github;
mod connector_gmail;
mod connector_jira;
mod connector_slack;
mod cursor_store;
mod embedding;
mod extract;
mod file_processor;
mod google_auth;
mod indexer;
mod migrate;
mod models;
mod navigate;
mod raw_store;
mod relevance;
mod search;
mod server;
mod vector_store;
mod workflow;

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use crate::analytics::AnalyticsStore;
use crate::connector::{ConnectorRegistry, FetchRequest};
use crate::cursor_store::CursorStore;
use crate::indexer::IndexingEngine;
use crate::models::Source;
use crate::navigate::Navigator;
use crate::raw_store::RawStore;
use crate::relevance::Identity;
use crate::search::{SearchEngine, SearchRequest, SearchType};
use crate::vector_store::VectorStore;
use crate::workflow::WorkflowRunner;

#[derive(Parser)]
#[command(
    name = "kc",
    about = "Knowledge Collector — an enterprise knowledge collector and hybrid retrieval engine",
    version
)]
struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, default_value = "./config/kc.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema
    Init,

    /// Run indexing for one source (or all) until drained
    Index {
        /// Source name, or "all"
        source: String,

        /// Ignore the cursor and reindex everything
        #[arg(long)]
        full: bool,
    },

    /// Search indexed documents
    Search {
        /// Search query
        query: String,

        /// Search type: vector, keyword, or hybrid
        #[arg(long, default_value = "vector")]
        search_type: String,

        /// Comma-separated source filter
        #[arg(long)]
        sources: Option<String>,

        /// Maximum number of results
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Navigate from a document to related documents
    Navigate {
        /// Document or chunk id
        id: String,

        /// Direction: prev, next, siblings, parent, children
        #[arg(long, default_value = "siblings")]
        direction: String,

        /// Scope: chunk, datapoint, context
        #[arg(long, default_value = "chunk")]
        scope: String,

        /// Maximum related documents
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// Show per-source indexing status
    Status,

    /// Backfill numeric timestamp mirrors for one source
    MigrateTimestamps {
        /// Source name
        source: String,
    },

    /// Start the HTTP API server
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    let pool = migrate::open(&cfg.db.path).await?;

    let cursor_store = CursorStore::new(pool.clone());
    let analytics = AnalyticsStore::new(pool.clone());
    let vector_store = VectorStore::new(pool.clone(), cfg.embedding.clone());
    let identity = Identity::from_config(&cfg);
    let raw_store = cfg.app.raw_dir.clone().map(RawStore::new);
    let engine = IndexingEngine::new(
        cursor_store.clone(),
        analytics.clone(),
        vector_store.clone(),
        identity,
        raw_store,
    );
    let registry = Arc::new(ConnectorRegistry::from_config(&cfg));

    match cli.command {
        Commands::Init => {
            println!("Database initialized successfully.");
        }
        Commands::Index { source, full } => {
            let request = FetchRequest {
                full_reindex: full,
                ..Default::default()
            };
            let sources: Vec<Source> = if source == "all" {
                Source::ALL.to_vec()
            } else {
                vec![source.parse()?]
            };

            for source in sources {
                let Some(connector) = registry.find(source) else {
                    continue;
                };
                if !connector.is_configured() {
                    println!("{:<12} not configured, skipped", source.to_string());
                    continue;
                }
                let cancel = AtomicBool::new(false);
                match engine.run_source(connector, &request, &cancel, None).await {
                    Ok(summary) => println!(
                        "{:<12} {} batches, {} processed ({} new, {} updated, {} skipped)",
                        source.to_string(),
                        summary.batches,
                        summary.documents_processed,
                        summary.documents_new,
                        summary.documents_updated,
                        summary.documents_skipped
                    ),
                    Err(e) => println!("{:<12} failed: {}", source.to_string(), e),
                }
            }
        }
        Commands::Search {
            query,
            search_type,
            sources,
            limit,
        } => {
            let search_type = match search_type.as_str() {
                "vector" => SearchType::Vector,
                "keyword" => SearchType::Keyword,
                "hybrid" => SearchType::Hybrid,
                other => anyhow::bail!(
                    "Unknown search type: {}. Use vector, keyword, or hybrid.",
                    other
                ),
            };
            let mut request = SearchRequest::new(query);
            request.search_type = search_type;
            request.limit = limit;
            if let Some(sources) = sources {
                for part in sources.split(',').filter(|p| !p.trim().is_empty()) {
                    request.sources.push(part.trim().parse()?);
                }
            }

            let search = SearchEngine::new(vector_store.clone(), cfg.embedding.clone());
            let response = search.search(&request).await?;
            if response.results.is_empty() {
                println!("No results.");
                return Ok(());
            }
            for (i, result) in response.results.iter().enumerate() {
                let title = result
                    .metadata
                    .get("title")
                    .and_then(|v| v.as_str())
                    .unwrap_or("(untitled)");
                println!("{}. [{:.2}] {} / {}", i + 1, result.score, result.source, title);
                let excerpt: String = result.content.chars().take(160).collect();
                println!("    excerpt: \"{}\"", excerpt.replace('\n', " "));
                println!("    id: {}", result.id);
                println!();
            }
        }
        Commands::Navigate {
            id,
            direction,
            scope,
            limit,
        } => {
            let navigator = Navigator::new(vector_store.clone());
            let response = navigator
                .navigate(&id, direction.parse()?, scope.parse()?, limit)
                .await?;
            println!(
                "current: {} ({} siblings, prev={}, next={})",
                response.current.id,
                response.navigation.total_siblings,
                response.navigation.has_prev,
                response.navigation.has_next
            );
            for related in &response.related {
                println!("  {}", related.id);
            }
        }
        Commands::Status => {
            println!("{:<12} {:<10} {:>10}   LAST SYNC", "SOURCE", "STATUS", "DOCS");
            for source in Source::ALL {
                let status = cursor_store.get_status(source).await?;
                println!(
                    "{:<12} {:<10} {:>10}   {}",
                    source.to_string(),
                    status.status.as_str(),
                    status.documents_indexed,
                    status.last_sync.as_deref().unwrap_or("never")
                );
            }
        }
        Commands::MigrateTimestamps { source } => {
            let source: Source = source.parse()?;
            let migrated = vector_store.migrate_timestamps(source).await?;
            println!("migrated {} chunks", migrated);
        }
        Commands::Serve => {
            let workflows = WorkflowRunner::new(engine.clone(), registry.clone());
            let search = SearchEngine::new(vector_store.clone(), cfg.embedding.clone());
            let navigator = Navigator::new(vector_store.clone());
            server::run_server(
                &cfg,
                registry,
                cursor_store,
                analytics,
                engine,
                workflows,
                search,
                navigator,
            )
            .await?;
        }
    }

    Ok(())
}
