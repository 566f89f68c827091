//! HTTP API server.
//!
//! Exposes the collector over JSON: indexing control, per-source settings,
//! discovery listings, hybrid search, navigation, a server-sent-events
//! status stream, workflow inspection, and analytics.
//!
//! # Auth
//!
//! When `app.api_key` (or `APP_API_KEY`) is set, every request must carry
//! a matching `x-api-key` header; mismatches get `401`.
//!
//! # Error Contract
//!
//! Errors are JSON `{ "statusCode": 400, "message": "..." }` — 400 for bad
//! input, 401 for auth, 403 for disabled sources, 404 for missing
//! resources.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::analytics::AnalyticsStore;
use crate::config::Config;
use crate::connector::{ConnectorRegistry, FetchRequest};
use crate::cursor_store::CursorStore;
use crate::indexer::IndexingEngine;
use crate::models::{now_iso, IndexStatus, Source};
use crate::navigate::{Direction, Navigator, Scope};
use crate::search::{SearchEngine, SearchRequest, SearchType};
use crate::workflow::WorkflowRunner;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    api_key: Option<String>,
    registry: Arc<ConnectorRegistry>,
    cursor_store: CursorStore,
    analytics: AnalyticsStore,
    engine: IndexingEngine,
    workflows: WorkflowRunner,
    search: Arc<SearchEngine>,
    navigator: Arc<Navigator>,
}

/// Start the HTTP server; runs until the process terminates.
pub async fn run_server(
    config: &Config,
    registry: Arc<ConnectorRegistry>,
    cursor_store: CursorStore,
    analytics: AnalyticsStore,
    engine: IndexingEngine,
    workflows: WorkflowRunner,
    search: SearchEngine,
    navigator: Navigator,
) -> anyhow::Result<()> {
    let state = AppState {
        api_key: config.app.api_key(),
        registry,
        cursor_store,
        analytics,
        engine,
        workflows,
        search: Arc::new(search),
        navigator: Arc::new(navigator),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/index/all", post(handle_index_all))
        .route("/index/all/reset", delete(handle_reset_all))
        .route("/index/sources", get(handle_sources))
        .route("/index/enabled-sources", get(handle_enabled_sources))
        .route("/index/sources/{source}/enabled", put(handle_set_enabled))
        .route("/index/settings/{source}", get(handle_get_settings).post(handle_save_settings))
        .route("/index/discovery/{kind}", get(handle_discovery))
        .route("/index/{source}", post(handle_index_source).delete(handle_reset_source))
        .route(
            "/index/{source}/status",
            get(handle_source_status).delete(handle_reset_status),
        )
        .route("/index/{source}/{id}", delete(handle_delete_document))
        .route("/search", get(handle_search))
        .route("/navigate", get(handle_navigate))
        .route("/events/indexing", get(handle_events))
        .route("/workflows/recent", get(handle_recent_workflows))
        .route(
            "/workflows/{id}",
            get(handle_get_workflow).delete(handle_cancel_workflow),
        )
        .route("/analytics/system", get(handle_system_stats))
        .route("/analytics/{source}/stats", get(handle_source_stats))
        .route("/analytics/{source}/runs", get(handle_recent_runs))
        .route("/analytics/{source}/daily", get(handle_daily_stats))
        .route("/health", get(handle_health))
        .layer(middleware::from_fn_with_state(state.clone(), api_key_guard))
        .layer(cors)
        .with_state(state);

    let bind_addr = config.server.bind.clone();
    tracing::info!(bind = %bind_addr, "HTTP server listening");
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

// ============ Error response ============

/// JSON error body: `{ statusCode, message }`.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    status_code: u16,
    message: String,
}

struct AppError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            status_code: self.status.as_u16(),
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        message: message.into(),
    }
}

fn unauthorized() -> AppError {
    AppError {
        status: StatusCode::UNAUTHORIZED,
        message: "invalid or missing api key".to_string(),
    }
}

fn forbidden(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::FORBIDDEN,
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        message: message.into(),
    }
}

fn internal_error(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        message: message.into(),
    }
}

fn parse_source(source: &str) -> Result<Source, AppError> {
    source
        .parse::<Source>()
        .map_err(|e| bad_request(e.to_string()))
}

// ============ Auth guard ============

async fn api_key_guard(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Some(expected) = state.api_key.as_deref() {
        let provided = request
            .headers()
            .get("x-api-key")
            .and_then(|v| v.to_str().ok());
        if provided != Some(expected) {
            return unauthorized().into_response();
        }
    }
    next.run(request).await
}

// ============ Indexing control ============

#[derive(Serialize)]
struct IndexAllResponse {
    started: Vec<String>,
    skipped: Vec<String>,
}

async fn handle_index_all(
    State(state): State<AppState>,
    body: Option<Json<FetchRequest>>,
) -> Result<Json<IndexAllResponse>, AppError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let mut started = Vec::new();
    let mut skipped = Vec::new();

    for source in Source::ALL {
        let enabled = state
            .cursor_store
            .is_enabled(source)
            .await
            .map_err(|e| internal_error(e.to_string()))?;
        let configured = state
            .registry
            .find(source)
            .map(|c| c.is_configured())
            .unwrap_or(false);
        if !enabled || !configured {
            skipped.push(source.as_str().to_string());
            continue;
        }
        match state.workflows.start(source, request.clone()) {
            Ok(_) => started.push(source.as_str().to_string()),
            Err(_) => skipped.push(source.as_str().to_string()),
        }
    }

    Ok(Json(IndexAllResponse { started, skipped }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IndexStartedResponse {
    source: Source,
    workflow_id: String,
}

async fn handle_index_source(
    State(state): State<AppState>,
    Path(source): Path<String>,
    body: Option<Json<FetchRequest>>,
) -> Result<Json<IndexStartedResponse>, AppError> {
    let source = parse_source(&source)?;
    let enabled = state
        .cursor_store
        .is_enabled(source)
        .await
        .map_err(|e| internal_error(e.to_string()))?;
    if !enabled {
        return Err(forbidden(format!("source '{}' is disabled", source)));
    }

    let request = body.map(|Json(r)| r).unwrap_or_default();
    let workflow_id = state
        .workflows
        .start(source, request)
        .map_err(|e| bad_request(e.to_string()))?;

    Ok(Json(IndexStartedResponse {
        source,
        workflow_id,
    }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SourceInfo {
    #[serde(flatten)]
    status: IndexStatus,
    enabled: bool,
    configured: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    execution_time_ms: Option<i64>,
}

async fn collect_source_info(state: &AppState) -> anyhow::Result<Vec<SourceInfo>> {
    let mut out = Vec::with_capacity(Source::ALL.len());
    for source in Source::ALL {
        let workflows = state.workflows.clone();
        let status = state
            .engine
            .reset_stale_status(source, move |id| workflows.is_running(id))
            .await?;
        let stats = state.analytics.get_source_stats(source).await?;
        let execution_time_ms = state
            .analytics
            .get_recent_runs(source, 1)
            .await?
            .first()
            .and_then(|r| r.duration_ms);
        out.push(SourceInfo {
            status,
            enabled: state.cursor_store.is_enabled(source).await?,
            configured: state
                .registry
                .find(source)
                .map(|c| c.is_configured())
                .unwrap_or(false),
            execution_time_ms: execution_time_ms.or(if stats.total_runs > 0 {
                Some(stats.avg_duration_ms as i64)
            } else {
                None
            }),
        });
    }
    Ok(out)
}

async fn handle_sources(
    State(state): State<AppState>,
) -> Result<Json<Vec<SourceInfo>>, AppError> {
    collect_source_info(&state)
        .await
        .map(Json)
        .map_err(|e| internal_error(e.to_string()))
}

async fn handle_source_status(
    State(state): State<AppState>,
    Path(source): Path<String>,
) -> Result<Json<IndexStatus>, AppError> {
    let source = parse_source(&source)?;
    let workflows = state.workflows.clone();
    state
        .engine
        .reset_stale_status(source, move |id| workflows.is_running(id))
        .await
        .map(Json)
        .map_err(|e| internal_error(e.to_string()))
}

async fn handle_reset_source(
    State(state): State<AppState>,
    Path(source): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let source = parse_source(&source)?;
    state
        .cursor_store
        .reset_cursor(source)
        .await
        .map_err(|e| internal_error(e.to_string()))?;
    state
        .cursor_store
        .reset_status(source)
        .await
        .map_err(|e| internal_error(e.to_string()))?;
    Ok(Json(serde_json::json!({ "reset": source.as_str() })))
}

async fn handle_reset_status(
    State(state): State<AppState>,
    Path(source): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let source = parse_source(&source)?;
    state
        .cursor_store
        .reset_status(source)
        .await
        .map_err(|e| internal_error(e.to_string()))?;
    state
        .cursor_store
        .release_lock(source)
        .await
        .map_err(|e| internal_error(e.to_string()))?;
    Ok(Json(serde_json::json!({ "reset": source.as_str() })))
}

async fn handle_reset_all(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    for source in Source::ALL {
        state
            .cursor_store
            .reset_cursor(source)
            .await
            .map_err(|e| internal_error(e.to_string()))?;
        state
            .cursor_store
            .reset_status(source)
            .await
            .map_err(|e| internal_error(e.to_string()))?;
    }
    Ok(Json(serde_json::json!({ "reset": "all" })))
}

async fn handle_delete_document(
    State(state): State<AppState>,
    Path((source, id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, AppError> {
    let source = parse_source(&source)?;
    state
        .engine
        .delete_document(source, &id)
        .await
        .map_err(|e| internal_error(e.to_string()))?;
    Ok(Json(serde_json::json!({ "deleted": id })))
}

// ============ Settings / enabled flags ============

async fn handle_get_settings(
    State(state): State<AppState>,
    Path(source): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let source = parse_source(&source)?;
    let settings = state
        .cursor_store
        .get_settings(source)
        .await
        .map_err(|e| internal_error(e.to_string()))?;
    Ok(Json(settings.unwrap_or(serde_json::json!({}))))
}

async fn handle_save_settings(
    State(state): State<AppState>,
    Path(source): Path<String>,
    Json(settings): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, AppError> {
    let source = parse_source(&source)?;
    // Settings must deserialize as a filter request.
    serde_json::from_value::<FetchRequest>(settings.clone())
        .map_err(|e| bad_request(format!("invalid settings: {}", e)))?;
    state
        .cursor_store
        .save_settings(source, &settings)
        .await
        .map_err(|e| internal_error(e.to_string()))?;
    Ok(Json(settings))
}

async fn handle_enabled_sources(
    State(state): State<AppState>,
) -> Result<Json<BTreeMap<String, bool>>, AppError> {
    let mut out = BTreeMap::new();
    for source in Source::ALL {
        out.insert(
            source.as_str().to_string(),
            state
                .cursor_store
                .is_enabled(source)
                .await
                .map_err(|e| internal_error(e.to_string()))?,
        );
    }
    Ok(Json(out))
}

#[derive(Deserialize)]
struct EnabledBody {
    enabled: bool,
}

async fn handle_set_enabled(
    State(state): State<AppState>,
    Path(source): Path<String>,
    Json(body): Json<EnabledBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let source = parse_source(&source)?;
    state
        .cursor_store
        .set_enabled(source, body.enabled)
        .await
        .map_err(|e| internal_error(e.to_string()))?;
    Ok(Json(
        serde_json::json!({ "source": source.as_str(), "enabled": body.enabled }),
    ))
}

// ============ Discovery ============

async fn handle_discovery(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let source = match kind.as_str() {
        "jira-projects" => Source::Jira,
        "slack-channels" => Source::Slack,
        "drive-folders" => Source::Drive,
        "confluence-spaces" => Source::Confluence,
        "calendars" => Source::Calendar,
        "gmail-labels" => Source::Gmail,
        "github-repos" => Source::Github,
        other => return Err(bad_request(format!("unknown discovery kind: '{}'", other))),
    };

    let connector = state
        .registry
        .find(source)
        .ok_or_else(|| bad_request("unknown source"))?;
    if !connector.is_configured() {
        return Err(forbidden(format!("source '{}' is not configured", source)));
    }

    let items = connector
        .discover()
        .await
        .map_err(|e| internal_error(e.to_string()))?;
    Ok(Json(serde_json::json!({ "items": items })))
}

// ============ Search / navigation ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchParams {
    #[serde(alias = "q")]
    query: String,
    sources: Option<String>,
    search_type: Option<SearchType>,
    limit: Option<usize>,
    offset: Option<usize>,
    /// JSON-encoded metadata equality map.
    r#where: Option<String>,
    start_date: Option<String>,
    end_date: Option<String>,
}

#[derive(Serialize)]
struct SearchResponseBody {
    results: Vec<crate::models::SearchResult>,
    total: usize,
}

async fn handle_search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<SearchResponseBody>, AppError> {
    if params.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }

    let mut sources = Vec::new();
    if let Some(raw) = &params.sources {
        for part in raw.split(',').filter(|p| !p.trim().is_empty()) {
            sources.push(parse_source(part.trim())?);
        }
    }

    let where_clause: BTreeMap<String, serde_json::Value> = match &params.r#where {
        Some(raw) => serde_json::from_str(raw)
            .map_err(|e| bad_request(format!("invalid where clause: {}", e)))?,
        None => BTreeMap::new(),
    };

    let request = SearchRequest {
        query: params.query,
        sources,
        search_type: params.search_type.unwrap_or_default(),
        limit: params.limit.unwrap_or(20),
        offset: params.offset.unwrap_or(0),
        where_clause,
        start_date: params.start_date,
        end_date: params.end_date,
    };

    let response = state
        .search
        .search(&request)
        .await
        .map_err(|e| internal_error(e.to_string()))?;
    Ok(Json(SearchResponseBody {
        results: response.results,
        total: response.total,
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NavigateParams {
    document_id: String,
    direction: String,
    scope: Option<String>,
    limit: Option<usize>,
}

async fn handle_navigate(
    State(state): State<AppState>,
    Query(params): Query<NavigateParams>,
) -> Result<Json<crate::navigate::NavigateResponse>, AppError> {
    let direction: Direction = params
        .direction
        .parse()
        .map_err(|e: anyhow::Error| bad_request(e.to_string()))?;
    let scope: Scope = match &params.scope {
        Some(s) => s
            .parse()
            .map_err(|e: anyhow::Error| bad_request(e.to_string()))?,
        None => Scope::default(),
    };

    state
        .navigator
        .navigate(
            &params.document_id,
            direction,
            scope,
            params.limit.unwrap_or(crate::navigate::DEFAULT_LIMIT),
        )
        .await
        .map(Json)
        .map_err(|e| {
            if e.to_string().contains("not found") {
                not_found(e.to_string())
            } else {
                internal_error(e.to_string())
            }
        })
}

// ============ Status event stream ============

#[derive(Deserialize)]
struct EventParams {
    /// Emission interval in milliseconds, clamped to ≥ 1000.
    interval: Option<u64>,
}

async fn handle_events(
    State(state): State<AppState>,
    Query(params): Query<EventParams>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let interval_ms = params.interval.unwrap_or(5000).max(1000);

    let stream = futures::stream::unfold((state, true), move |(state, first)| async move {
        if !first {
            tokio::time::sleep(Duration::from_millis(interval_ms)).await;
        }

        let statuses = match collect_source_info(&state).await {
            Ok(infos) => serde_json::to_value(infos).unwrap_or_default(),
            Err(_) => serde_json::Value::Array(Vec::new()),
        };
        let payload = serde_json::json!({
            "type": "status_update",
            "statuses": statuses,
            "timestamp": now_iso(),
        });
        let event = Event::default().data(payload.to_string());
        Some((Ok::<_, Infallible>(event), (state, false)))
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

// ============ Workflows ============

async fn handle_recent_workflows(
    State(state): State<AppState>,
) -> Json<Vec<crate::workflow::WorkflowInfo>> {
    Json(state.workflows.recent())
}

async fn handle_get_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<crate::workflow::WorkflowInfo>, AppError> {
    state
        .workflows
        .get(&id)
        .map(Json)
        .ok_or_else(|| not_found(format!("workflow not found: {}", id)))
}

async fn handle_cancel_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    if state.workflows.cancel(&id) {
        Ok(Json(serde_json::json!({ "cancelled": id })))
    } else {
        Err(not_found(format!(
            "no running workflow with id: {}",
            id
        )))
    }
}

// ============ Analytics ============

async fn handle_system_stats(
    State(state): State<AppState>,
) -> Result<Json<crate::analytics::SystemStats>, AppError> {
    state
        .analytics
        .get_system_stats(&Source::ALL)
        .await
        .map(Json)
        .map_err(|e| internal_error(e.to_string()))
}

async fn handle_source_stats(
    State(state): State<AppState>,
    Path(source): Path<String>,
) -> Result<Json<crate::models::SourceStats>, AppError> {
    let source = parse_source(&source)?;
    state
        .analytics
        .get_source_stats(source)
        .await
        .map(Json)
        .map_err(|e| internal_error(e.to_string()))
}

#[derive(Deserialize)]
struct RunsParams {
    limit: Option<usize>,
}

async fn handle_recent_runs(
    State(state): State<AppState>,
    Path(source): Path<String>,
    Query(params): Query<RunsParams>,
) -> Result<Json<Vec<crate::models::IndexingRun>>, AppError> {
    let source = parse_source(&source)?;
    state
        .analytics
        .get_recent_runs(source, params.limit.unwrap_or(20))
        .await
        .map(Json)
        .map_err(|e| internal_error(e.to_string()))
}

#[derive(Deserialize)]
struct DailyParams {
    days: Option<usize>,
}

async fn handle_daily_stats(
    State(state): State<AppState>,
    Path(source): Path<String>,
    Query(params): Query<DailyParams>,
) -> Result<Json<Vec<crate::models::DailyStats>>, AppError> {
    let source = parse_source(&source)?;
    state
        .analytics
        .get_daily_stats(source, params.days.unwrap_or(30).min(90))
        .await
        .map(Json)
        .map_err(|e| internal_error(e.to_string()))
}

// ============ Health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
