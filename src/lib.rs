//! # Knowledge Collector
//!
//! **An enterprise knowledge collector and hybrid retrieval engine.**
//!
//! Continuously ingests documents from heterogeneous sources (Jira, Slack,
//! Gmail, Drive, Confluence, Calendar, GitHub), normalizes them into a
//! common document model, enriches each with relevance signals, stores
//! them in a content-addressed chunk store with embeddings, and serves
//! hybrid (vector + keyword + metadata) search and graph-like navigation
//! over the unified corpus.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌───────────────┐
//! │ Connectors   │──▶│ Indexing     │──▶│ Vector store   │
//! │ 7 sources    │   │ engine       │   │ chunks + vecs  │
//! └─────────────┘   └──────┬───────┘   └──────┬────────┘
//!                          │                   │
//!                   cursors + hashes     search + navigation
//!                          │                   │
//!                   ┌──────▼───────┐   ┌──────▼────────┐
//!                   │ Cursor store │   │ HTTP API (kc) │
//!                   └──────────────┘   └───────────────┘
//! ```
//!
//! ## Data Flow
//!
//! 1. A workflow picks a source, loads its [`models::Cursor`] and settings,
//!    and calls the connector for one batch.
//! 2. [`relevance`] attaches per-source features and a `relevance_score`.
//! 3. The [`indexer`] diffs content hashes against the [`cursor_store`] and
//!    drops unchanged documents.
//! 4. Changed documents are chunked, contextualized, and upserted by the
//!    [`vector_store`]; unchanged chunks take a metadata-only path.
//! 5. The cursor advances, analytics record the run, and `has_more` tells
//!    the caller whether to loop.
//! 6. [`search`] and [`navigate`] read from the vector store only.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration + env-backed credentials |
//! | [`models`] | Core data types: `Document`, `Cursor`, statuses, runs |
//! | [`connector`] | The uniform connector contract and registry |
//! | [`connector_jira`] … [`connector_github`] | Per-source adapters |
//! | [`chunker`] | Token-budgeted text and code chunking |
//! | [`file_processor`] | MIME policy and binary-to-markdown conversion |
//! | [`extract`] | pdf/docx/pptx/xlsx/html/csv extraction |
//! | [`relevance`] | Per-source relevance enrichment |
//! | [`indexer`] | Batch orchestration, hash diff, cursor advancement |
//! | [`cursor_store`] | Cursors, hashes, locks, status, settings |
//! | [`analytics`] | Run history and aggregate stats |
//! | [`vector_store`] | Content-addressed chunk store with embeddings |
//! | [`embedding`] | Hosted + default embedding providers |
//! | [`search`] | Hybrid search with RRF and ranking boosts |
//! | [`navigate`] | prev/next/siblings/parent/children traversal |
//! | [`workflow`] | In-process per-source run tasks with cancellation |
//! | [`server`] | Axum HTTP API with api-key guard and SSE |

pub mod analytics;
pub mod chunker;
pub mod config;
pub mod connector;
pub mod connector_calendar;
pub mod connector_confluence;
pub mod connector_drive;
pub mod connector_github;
pub mod connector_gmail;
pub mod connector_jira;
pub mod connector_slack;
pub mod cursor_store;
pub mod embedding;
pub mod extract;
pub mod file_processor;
pub mod google_auth;
pub mod indexer;
pub mod migrate;
pub mod models;
pub mod navigate;
pub mod raw_store;
pub mod relevance;
pub mod search;
pub mod server;
pub mod vector_store;
pub mod workflow;
