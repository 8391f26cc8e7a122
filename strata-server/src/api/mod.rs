//! HTTP control surface

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use strata_core::compaction::{CompactionConfig, CompactionStats};
use strata_core::query::Filter;
use strata_core::storage::{EngineStats, StorageEngine};
use strata_core::{DataType, SeriesKey, StrataError, TimeRange, TsValue};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

/// Application state
pub type AppState = Arc<StorageEngine>;

type ApiResult<T> = Result<T, (StatusCode, Json<ErrorResponse>)>;

/// Create the API router
pub fn create_router(engine: Arc<StorageEngine>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/write", post(write))
        .route("/query", get(query))
        .route("/delete", post(delete))
        .route("/flush", post(flush))
        .route(
            "/compaction/settings",
            get(compaction_settings).put(update_compaction_settings),
        )
        .route("/compaction/trigger", post(trigger_compaction))
        .route("/stats", get(stats))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(engine)
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct WritePoint {
    pub device: String,
    pub measurement: String,
    pub timestamp: i64,
    pub value: serde_json::Value,
    /// Defaults to INT64 for integers, DOUBLE for other numbers
    pub data_type: Option<DataType>,
}

#[derive(Debug, Deserialize)]
pub struct WriteRequest {
    pub storage_group: String,
    pub points: Vec<WritePoint>,
}

#[derive(Debug, Serialize)]
pub struct WriteResponse {
    pub written: usize,
}

#[derive(Debug, Deserialize)]
pub struct QueryParams {
    pub sg: String,
    pub device: String,
    pub measurement: String,
    pub start: Option<i64>,
    pub end: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct QueryResponse {
    pub series: String,
    pub points: Vec<(i64, serde_json::Value)>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteRequest {
    pub storage_group: String,
    pub device: String,
    pub measurement: String,
    pub start: i64,
    pub end: i64,
}

#[derive(Debug, Default, Deserialize)]
pub struct FlushRequest {
    pub storage_group: Option<String>,
    pub partition: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct FlushResponse {
    pub flushed_files: usize,
}

#[derive(Debug, Serialize)]
pub struct TriggerResponse {
    pub submitted: usize,
    pub compaction: CompactionStats,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn bad_request(error: impl Into<String>) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
}

fn engine_error(e: StrataError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match &e {
        StrataError::StorageGroupNotFound(_) => StatusCode::NOT_FOUND,
        StrataError::TypeMismatch { .. } | StrataError::Config(_) => StatusCode::BAD_REQUEST,
        StrataError::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: strata_core::VERSION.to_string(),
    })
}

async fn write(
    State(engine): State<AppState>,
    Json(request): Json<WriteRequest>,
) -> ApiResult<Json<WriteResponse>> {
    let mut written = 0;
    for point in request.points {
        let value = parse_value(&point.value, point.data_type).map_err(bad_request)?;
        let series = SeriesKey::new(point.device, point.measurement);
        engine
            .insert(&request.storage_group, &series, point.timestamp, value)
            .map_err(engine_error)?;
        written += 1;
    }
    Ok(Json(WriteResponse { written }))
}

async fn query(
    State(engine): State<AppState>,
    Query(params): Query<QueryParams>,
) -> ApiResult<Json<QueryResponse>> {
    let filter = query_filter(params.start, params.end).map_err(bad_request)?;
    let series = SeriesKey::new(params.device, params.measurement);

    let points = engine
        .query(&params.sg, &series, filter)
        .map_err(engine_error)?;
    Ok(Json(QueryResponse {
        series: series.canonical(),
        points: points
            .into_iter()
            .map(|p| (p.timestamp, value_to_json(&p.value)))
            .collect(),
    }))
}

async fn delete(
    State(engine): State<AppState>,
    Json(request): Json<DeleteRequest>,
) -> ApiResult<StatusCode> {
    if request.start > request.end {
        return Err(bad_request("start must not be after end"));
    }
    let series = SeriesKey::new(request.device, request.measurement);
    engine
        .delete(
            &request.storage_group,
            &series,
            TimeRange::new(request.start, request.end),
        )
        .map_err(engine_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn flush(
    State(engine): State<AppState>,
    request: Option<Json<FlushRequest>>,
) -> ApiResult<Json<FlushResponse>> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let handle = match (request.storage_group, request.partition) {
        (Some(sg), Some(partition)) => engine.flush(&sg, partition),
        (None, None) => engine.flush_all(),
        _ => return Err(bad_request("storage_group and partition go together")),
    }
    .map_err(engine_error)?;

    let sealed = tokio::task::spawn_blocking(move || handle.wait())
        .await
        .map_err(|e| engine_error(StrataError::Internal(e.to_string())))?
        .map_err(engine_error)?;
    Ok(Json(FlushResponse {
        flushed_files: sealed.len(),
    }))
}

async fn compaction_settings(State(engine): State<AppState>) -> Json<CompactionConfig> {
    Json(engine.compaction_config())
}

async fn update_compaction_settings(
    State(engine): State<AppState>,
    Json(config): Json<CompactionConfig>,
) -> Json<CompactionConfig> {
    engine.update_compaction_config(config);
    Json(engine.compaction_config())
}

async fn trigger_compaction(State(engine): State<AppState>) -> Json<TriggerResponse> {
    let submitted = engine.schedule_compaction();
    info!("Manual compaction trigger submitted {} tasks", submitted);
    Json(TriggerResponse {
        submitted,
        compaction: engine.compaction_stats(),
    })
}

async fn stats(State(engine): State<AppState>) -> Json<EngineStats> {
    Json(engine.stats())
}

fn query_filter(start: Option<i64>, end: Option<i64>) -> Result<Option<Filter>, String> {
    match (start, end) {
        (None, None) => Ok(None),
        (Some(start), Some(end)) if start > end => {
            Err(format!("start {} must not be after end {}", start, end))
        }
        (start, end) => Ok(Some(Filter::time_range(
            start.unwrap_or(i64::MIN),
            end.unwrap_or(i64::MAX),
        ))),
    }
}

// ============================================================================
// Value conversion
// ============================================================================

fn parse_value(value: &serde_json::Value, data_type: Option<DataType>) -> Result<TsValue, String> {
    use serde_json::Value;

    let data_type = match (data_type, value) {
        (Some(data_type), _) => data_type,
        (None, Value::Bool(_)) => DataType::Boolean,
        (None, Value::Number(n)) if n.is_i64() => DataType::Int64,
        (None, Value::Number(_)) => DataType::Double,
        (None, Value::String(_)) => DataType::Text,
        (None, Value::Array(_)) => DataType::Vector,
        (None, other) => return Err(format!("Unsupported value: {}", other)),
    };

    let mismatch = || format!("Value {} is not {}", value, data_type);
    match data_type {
        DataType::Boolean => value.as_bool().map(TsValue::Boolean).ok_or_else(mismatch),
        DataType::Int32 => value
            .as_i64()
            .and_then(|v| i32::try_from(v).ok())
            .map(TsValue::Int32)
            .ok_or_else(mismatch),
        DataType::Int64 => value.as_i64().map(TsValue::Int64).ok_or_else(mismatch),
        DataType::Float => value
            .as_f64()
            .map(|v| TsValue::Float(v as f32))
            .ok_or_else(mismatch),
        DataType::Double => value.as_f64().map(TsValue::Double).ok_or_else(mismatch),
        DataType::Text => value
            .as_str()
            .map(|s| TsValue::Text(s.to_string()))
            .ok_or_else(mismatch),
        DataType::Vector => {
            let items = value.as_array().ok_or_else(mismatch)?;
            items
                .iter()
                .map(|item| match item {
                    Value::Null => Ok(None),
                    item => parse_value(item, None).map(Some),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(TsValue::Vector)
        }
    }
}

fn value_to_json(value: &TsValue) -> serde_json::Value {
    match value {
        TsValue::Boolean(b) => serde_json::json!(b),
        TsValue::Int32(v) => serde_json::json!(v),
        TsValue::Int64(v) => serde_json::json!(v),
        TsValue::Float(v) => serde_json::json!(v),
        TsValue::Double(v) => serde_json::json!(v),
        TsValue::Text(s) => serde_json::json!(s),
        TsValue::Vector(values) => serde_json::Value::Array(
            values
                .iter()
                .map(|v| v.as_ref().map_or(serde_json::Value::Null, value_to_json))
                .collect(),
        ),
    }
}
