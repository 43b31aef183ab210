//! HTTP surface: ingestion intake, search, SPL, alarms, redaction config.
//!
//! Authentication and authorization live outside the core; the only caller
//! identity the core consumes is the reveal authorization flag on the
//! request context (the `X-Authorized-Reveal` header set by the outer
//! middleware).

use crate::alarm::{scheduler::EvalReport, Alarm, AlarmScheduler, AlarmStore};
use crate::cache::SearchCache;
use crate::core::config::{SyslogFormat, SyslogProtocol, SyslogSourceConfig};
use crate::core::error::GrepWiseError;
use crate::core::types::{now_ms, LogEntry, LogId, LogLevel, TimeRange};
use crate::ingest::{IngestBuffer, SyslogManager};
use crate::partition::PartitionManager;
use crate::query::{QueryExecutor, QueryOutput, QueryResult};
use crate::redact::{RedactionGroup, Redactor, SEARCH_MASK};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Shared handler state.
#[derive(Clone)]
pub struct ApiState {
    pub buffer: IngestBuffer,
    pub executor: Arc<QueryExecutor>,
    pub redactor: Arc<Redactor>,
    pub alarms: Arc<AlarmStore>,
    pub scheduler: Arc<AlarmScheduler>,
    pub syslog: Arc<SyslogManager>,
    pub manager: Arc<PartitionManager>,
    pub cache: Arc<SearchCache<Arc<QueryResult>>>,
    pub default_limit: usize,
}

/// Build the full router.
pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/logs", post(ingest_log))
        .route("/logs/search", get(search_logs))
        .route("/logs/spl", post(run_spl))
        .route("/logs/count", get(count_logs))
        .route("/logs/:id", get(get_log))
        .route("/sources", get(list_sources).post(create_source))
        .route("/sources/:id", delete(delete_source))
        .route("/alarms", get(list_alarms).post(create_alarm))
        .route(
            "/alarms/:id",
            get(get_alarm).put(update_alarm).delete(delete_alarm),
        )
        .route("/alarms/:id/evaluate", post(evaluate_alarm))
        .route("/redaction/config", get(get_redaction).post(set_redaction))
        .route("/redaction/reload", post(reload_redaction))
        .route("/health", get(health))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(
                    CorsLayer::new()
                        .allow_origin(tower_http::cors::Any)
                        .allow_methods(tower_http::cors::Any)
                        .allow_headers(tower_http::cors::Any),
                ),
        )
        .with_state(state)
}

/// Error wrapper mapping kinds to HTTP statuses.
struct ApiError(GrepWiseError);

impl From<GrepWiseError> for ApiError {
    fn from(err: GrepWiseError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            GrepWiseError::QuerySyntax { .. }
            | GrepWiseError::EvalUnsupported(_)
            | GrepWiseError::BadConfig(_) => StatusCode::BAD_REQUEST,
            GrepWiseError::UnauthorizedReveal => StatusCode::FORBIDDEN,
            GrepWiseError::NotFound(_) => StatusCode::NOT_FOUND,
            GrepWiseError::BufferFull
            | GrepWiseError::PartitionUnavailable(_)
            | GrepWiseError::PartitionClosed(_)
            | GrepWiseError::ArchiveUnavailable(_)
            | GrepWiseError::NotifyChannelDown(_) => StatusCode::SERVICE_UNAVAILABLE,
            GrepWiseError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            GrepWiseError::QueryTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({
            "error": self.0.to_string(),
            "kind": self.0.category(),
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// --- ingestion ---

#[derive(Debug, Deserialize)]
struct IngestRequest {
    timestamp: Option<i64>,
    level: Option<String>,
    message: String,
    source: Option<String>,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

async fn ingest_log(
    State(state): State<ApiState>,
    Json(request): Json<IngestRequest>,
) -> ApiResult<impl IntoResponse> {
    let ingest_time = now_ms();
    let timestamp = request.timestamp.unwrap_or(ingest_time);
    let level = match &request.level {
        Some(level) => LogLevel::from_str(level).map_err(ApiError)?,
        None => LogLevel::detect(&request.message),
    };
    let source = request.source.unwrap_or_else(|| "http".to_string());
    let mut entry = LogEntry::new(timestamp, level, request.message, source);
    if timestamp != ingest_time {
        entry.record_time = Some(timestamp);
    }
    for (k, v) in request.metadata {
        entry.metadata.insert(&k, &v);
    }
    let id = entry.id.clone();
    state.buffer.push(entry).await?;
    Ok((StatusCode::ACCEPTED, Json(serde_json::json!({ "id": id }))))
}

/// Wire shape of a source, matching the UI contract.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SourceDto {
    id: String,
    name: String,
    enabled: bool,
    source_type: String,
    syslog_port: u16,
    syslog_protocol: SyslogProtocol,
    syslog_format: SyslogFormat,
}

impl SourceDto {
    fn into_config(self) -> Result<SyslogSourceConfig, GrepWiseError> {
        if self.source_type != "SYSLOG" {
            return Err(GrepWiseError::config(format!(
                "unsupported sourceType: {}",
                self.source_type
            )));
        }
        Ok(SyslogSourceConfig {
            id: self.id,
            name: self.name,
            enabled: self.enabled,
            syslog_port: self.syslog_port,
            syslog_protocol: self.syslog_protocol,
            syslog_format: self.syslog_format,
        })
    }

    fn from_config(config: SyslogSourceConfig) -> Self {
        Self {
            id: config.id,
            name: config.name,
            enabled: config.enabled,
            source_type: "SYSLOG".to_string(),
            syslog_port: config.syslog_port,
            syslog_protocol: config.syslog_protocol,
            syslog_format: config.syslog_format,
        }
    }
}

async fn create_source(
    State(state): State<ApiState>,
    Json(dto): Json<SourceDto>,
) -> ApiResult<impl IntoResponse> {
    let config = dto.into_config()?;
    state.syslog.add_source(config.clone(), true).await?;
    Ok((StatusCode::CREATED, Json(SourceDto::from_config(config))))
}

async fn list_sources(State(state): State<ApiState>) -> Json<Vec<SourceDto>> {
    Json(
        state
            .syslog
            .list_sources()
            .into_iter()
            .map(SourceDto::from_config)
            .collect(),
    )
}

async fn delete_source(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.syslog.remove_source(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

// --- search ---

#[derive(Debug, Deserialize)]
struct SearchParams {
    #[serde(default)]
    q: Option<String>,
    start: Option<i64>,
    end: Option<i64>,
    size: Option<usize>,
    page: Option<usize>,
}

impl SearchParams {
    fn range(&self) -> TimeRange {
        TimeRange::new(self.start.unwrap_or(0), self.end.unwrap_or(i64::MAX))
    }
}

#[derive(Debug, Serialize)]
struct TimeSlot {
    time: i64,
    count: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchResponse {
    results: Vec<LogEntry>,
    total: usize,
    time_slots: Vec<TimeSlot>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    warnings: Vec<String>,
}

async fn search_logs(
    State(state): State<ApiState>,
    Query(params): Query<SearchParams>,
) -> ApiResult<Json<SearchResponse>> {
    let size = params.size.unwrap_or(state.default_limit).max(1);
    let page = params.page.unwrap_or(0);
    let q = params.q.clone().unwrap_or_default();
    let page_result = state
        .executor
        .search_page(&q, params.range(), size, page)
        .await?;

    let results = page_result
        .results
        .iter()
        .map(|e| state.redactor.redact(e, SEARCH_MASK))
        .collect();
    Ok(Json(SearchResponse {
        results,
        total: page_result.total,
        time_slots: page_result
            .time_slots
            .into_iter()
            .map(|(time, count)| TimeSlot { time, count })
            .collect(),
        warnings: page_result.warnings,
    }))
}

async fn count_logs(
    State(state): State<ApiState>,
    Query(params): Query<SearchParams>,
) -> ApiResult<Json<usize>> {
    let q = params.q.clone().unwrap_or_default();
    let count = state.executor.count(&q, params.range()).await?;
    Ok(Json(count))
}

async fn run_spl(
    State(state): State<ApiState>,
    Query(params): Query<SearchParams>,
    body: String,
) -> ApiResult<Response> {
    let result = state.executor.execute(body.trim(), params.range()).await?;
    match result.output {
        QueryOutput::Entries(entries) => {
            let redacted: Vec<LogEntry> = entries
                .iter()
                .map(|e| state.redactor.redact(e, SEARCH_MASK))
                .collect();
            Ok(Json(redacted).into_response())
        },
        QueryOutput::Stats(stats) => Ok(Json(stats).into_response()),
    }
}

#[derive(Debug, Deserialize)]
struct GetLogParams {
    #[serde(default)]
    reveal: bool,
}

/// Reveal requires the outer auth layer's approval, carried on the request
/// context header.
fn reveal_authorized(headers: &HeaderMap) -> bool {
    headers
        .get("x-authorized-reveal")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

async fn get_log(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(params): Query<GetLogParams>,
    headers: HeaderMap,
) -> ApiResult<Json<LogEntry>> {
    let entry = state
        .executor
        .get_by_id(&LogId::new(&id))
        .ok_or(GrepWiseError::NotFound(format!("log {}", id)))?;
    if params.reveal {
        if !reveal_authorized(&headers) {
            return Err(ApiError(GrepWiseError::UnauthorizedReveal));
        }
        return Ok(Json(entry));
    }
    Ok(Json(state.redactor.redact(&entry, SEARCH_MASK)))
}

// --- alarms ---

async fn list_alarms(State(state): State<ApiState>) -> Json<Vec<Alarm>> {
    Json(state.alarms.list())
}

async fn create_alarm(
    State(state): State<ApiState>,
    Json(alarm): Json<Alarm>,
) -> ApiResult<impl IntoResponse> {
    let created = state.alarms.create(alarm)?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn get_alarm(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Alarm>> {
    state
        .alarms
        .get(&id)
        .map(Json)
        .ok_or_else(|| ApiError(GrepWiseError::NotFound(format!("alarm {}", id))))
}

async fn update_alarm(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(mut alarm): Json<Alarm>,
) -> ApiResult<Json<Alarm>> {
    alarm.id = id;
    state.alarms.update(alarm.clone())?;
    Ok(Json(alarm))
}

async fn delete_alarm(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.alarms.delete(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn evaluate_alarm(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<EvalReportDto>> {
    let report = state.scheduler.evaluate_at(&id, now_ms()).await?;
    Ok(Json(EvalReportDto::from(report)))
}

#[derive(Debug, Serialize)]
struct EvalReportDto {
    alarm_id: String,
    state: crate::alarm::AlarmState,
    observed: BTreeMap<String, u64>,
    fired: Vec<String>,
}

impl From<EvalReport> for EvalReportDto {
    fn from(report: EvalReport) -> Self {
        Self {
            alarm_id: report.alarm_id,
            state: report.state,
            observed: report.observed,
            fired: report.fired,
        }
    }
}

// --- redaction ---

async fn get_redaction(State(state): State<ApiState>) -> Json<crate::redact::RedactionView> {
    Json(state.redactor.view())
}

async fn set_redaction(
    State(state): State<ApiState>,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<StatusCode> {
    // The write endpoint accepts the grouped format only.
    if let Some(object) = body.as_object() {
        if object.len() == 2 && object.contains_key("keys") && object.contains_key("patterns") {
            return Err(ApiError(GrepWiseError::config(
                "flat redaction payloads are read-only; POST the grouped format",
            )));
        }
    }
    let groups: BTreeMap<String, RedactionGroup> = serde_json::from_value(body)
        .map_err(|e| ApiError(GrepWiseError::config(format!("bad redaction config: {}", e))))?;
    state.redactor.set_config(groups)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn reload_redaction(State(state): State<ApiState>) -> ApiResult<StatusCode> {
    state.redactor.reload()?;
    Ok(StatusCode::NO_CONTENT)
}

// --- health ---

async fn health(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let metas = state.manager.metas();
    let mut by_state: BTreeMap<String, usize> = BTreeMap::new();
    for meta in &metas {
        *by_state.entry(format!("{:?}", meta.state).to_uppercase()).or_insert(0) += 1;
    }
    Json(serde_json::json!({
        "status": "ok",
        "buffer_depth": state.buffer.depth(),
        "partitions": by_state,
        "active_partitions": state.manager.active_count(),
        "cache": state.cache.stats(),
    }))
}
