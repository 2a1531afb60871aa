use crate::ingest::{run_blocking, IngestError};
use crate::logging::TraceId;
use crate::state::AppState;
use axum::body::Bytes;
use axum::extract::{Extension, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tally_common::types::{MetricRecord, MetricTable};
use tally_storage::Storage;
use utoipa::ToSchema;
use utoipa_axum::{router::OpenApiRouter, routes};

/// Header carrying the signature of a positional update.
pub const METRIC_HASH_HEADER: &str = "x-metric-hash";

/// Header carrying the client-assigned id of a batch.
pub const BATCH_ID_HEADER: &str = "x-batch-id";

/// Error envelope.
#[derive(Serialize, ToSchema)]
pub struct ApiError {
    /// Numeric error code, 0 on success.
    pub err_code: i32,
    pub err_msg: String,
    /// Same value as the `X-Trace-Id` response header.
    pub trace_id: String,
}

/// Success envelope.
#[derive(Serialize)]
pub struct ApiResponse<T>
where
    T: Serialize,
{
    pub err_code: i32,
    pub err_msg: String,
    pub trace_id: String,
    pub data: Option<T>,
}

pub fn success_response<T>(status: StatusCode, trace_id: &str, data: T) -> Response
where
    T: Serialize,
{
    (
        status,
        Json(ApiResponse {
            err_code: 0,
            err_msg: "success".to_string(),
            trace_id: trace_id.to_string(),
            data: Some(data),
        }),
    )
        .into_response()
}

fn to_custom_error_code(code: &str) -> i32 {
    match code {
        "bad_request" => 1001,
        "not_found" => 1004,
        "forbidden" => 1006,
        "unknown_kind" => 1011,
        "invalid_hash" => 1012,
        "decrypt_failed" => 1013,
        "storage_error" => 1501,
        "internal_error" => 1500,
        _ => 1999,
    }
}

pub fn error_response(status: StatusCode, trace_id: &str, code: &str, msg: &str) -> Response {
    (
        status,
        Json(ApiResponse::<Value> {
            err_code: to_custom_error_code(code),
            err_msg: msg.to_string(),
            trace_id: trace_id.to_string(),
            data: None,
        }),
    )
        .into_response()
}

fn ingest_error_response(trace_id: &str, err: IngestError) -> Response {
    error_response(err.status(), trace_id, err.code(), &err.to_string())
}

fn parse_body<T: DeserializeOwned>(trace_id: &str, body: &Bytes) -> Result<T, Response> {
    serde_json::from_slice(body).map_err(|e| {
        error_response(
            StatusCode::BAD_REQUEST,
            trace_id,
            "bad_request",
            &format!("invalid JSON body: {e}"),
        )
    })
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Full metric table.
#[utoipa::path(
    get,
    path = "/",
    tag = "Metrics",
    responses(
        (status = 200, description = "Every stored gauge and counter", body = MetricTable),
        (status = 500, description = "Store unavailable", body = ApiError)
    )
)]
async fn list_metrics(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
) -> Response {
    match run_blocking(state.ingest.clone(), |ingest| ingest.read_all()).await {
        Ok(table) => Json(table).into_response(),
        Err(e) => ingest_error_response(&trace_id, e),
    }
}

/// Liveness report.
#[derive(Serialize, ToSchema)]
struct PingResponse {
    version: String,
    uptime_secs: i64,
    /// `memory` or `sqlite`.
    backend: String,
}

/// Checks that the store is reachable.
#[utoipa::path(
    get,
    path = "/ping",
    tag = "Health",
    responses(
        (status = 200, description = "Store reachable", body = PingResponse),
        (status = 500, description = "Store unreachable", body = ApiError)
    )
)]
async fn ping(Extension(trace_id): Extension<TraceId>, State(state): State<AppState>) -> Response {
    if let Err(e) = run_blocking(state.ingest.clone(), |ingest| ingest.ping()).await {
        tracing::error!(trace_id = %trace_id.0, error = %e, "Ping failed");
        return ingest_error_response(&trace_id, e);
    }
    let backend = match state.store.as_ref() {
        Storage::Memory(_) => "memory",
        Storage::Durable(_) => "sqlite",
    };
    success_response(
        StatusCode::OK,
        &trace_id,
        PingResponse {
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_secs: (Utc::now() - state.start_time).num_seconds(),
            backend: backend.to_string(),
        },
    )
}

/// Value stored after an update.
#[derive(Serialize, ToSchema)]
struct StoredValue {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    value: String,
}

/// Positional update. Gauges are replaced, counters add the value.
#[utoipa::path(
    post,
    path = "/update/{kind}/{name}/{value}",
    tag = "Metrics",
    params(
        ("kind" = String, Path, description = "gauge or counter"),
        ("name" = String, Path, description = "Metric name"),
        ("value" = String, Path, description = "Float for gauges, integer delta for counters"),
        ("X-Metric-Hash" = Option<String>, Header, description = "Signature, required when a signing key is configured")
    ),
    responses(
        (status = 200, description = "Update applied", body = StoredValue),
        (status = 400, description = "Malformed value or bad signature", body = ApiError),
        (status = 501, description = "Unknown kind", body = ApiError)
    )
)]
async fn update_positional(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
    Path((kind, name, value)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Response {
    let tag = header_str(&headers, METRIC_HASH_HEADER).map(str::to_string);
    let id = name.clone();
    let result = run_blocking(state.ingest.clone(), move |ingest| {
        ingest.update_positional(&kind, &name, &value, tag.as_deref())
    })
    .await;
    match result {
        Ok(stored) => success_response(
            StatusCode::OK,
            &trace_id,
            StoredValue {
                id,
                kind: stored.kind().to_string(),
                value: stored.to_string(),
            },
        ),
        Err(e) => ingest_error_response(&trace_id, e),
    }
}

#[derive(Serialize, ToSchema)]
struct UpdateAck {
    /// The request's signature, echoed back.
    hash: Option<String>,
}

/// Structured single update.
#[utoipa::path(
    post,
    path = "/update/",
    tag = "Metrics",
    request_body = MetricRecord,
    responses(
        (status = 200, description = "Update applied", body = UpdateAck),
        (status = 400, description = "Decode, validation or signature failure", body = ApiError)
    )
)]
async fn update_record(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
    body: Bytes,
) -> Response {
    let record: MetricRecord = match parse_body(&trace_id, &body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let hash = record.tag().map(str::to_string);
    match run_blocking(state.ingest.clone(), move |ingest| ingest.update_record(&record)).await {
        Ok(_) => success_response(StatusCode::OK, &trace_id, UpdateAck { hash }),
        Err(e) => ingest_error_response(&trace_id, e),
    }
}

#[derive(Serialize, ToSchema)]
struct BatchAck {
    applied: usize,
    /// The batch id was already applied; nothing changed.
    duplicate: bool,
}

/// Batch update, applied entirely or not at all.
#[utoipa::path(
    post,
    path = "/updates/",
    tag = "Metrics",
    request_body = Vec<MetricRecord>,
    params(
        ("X-Batch-Id" = Option<String>, Header, description = "Client-assigned id used to drop replays")
    ),
    responses(
        (status = 200, description = "Batch applied or acknowledged as duplicate", body = BatchAck),
        (status = 400, description = "Some record failed; nothing applied", body = ApiError)
    )
)]
async fn update_batch(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let records: Vec<MetricRecord> = match parse_body(&trace_id, &body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let batch_id = header_str(&headers, BATCH_ID_HEADER).map(str::to_string);
    let result = run_blocking(state.ingest.clone(), move |ingest| {
        ingest.update_batch(batch_id.as_deref(), &records)
    })
    .await;
    match result {
        Ok(outcome) => success_response(
            StatusCode::OK,
            &trace_id,
            BatchAck {
                applied: outcome.applied,
                duplicate: outcome.duplicate,
            },
        ),
        Err(e) => ingest_error_response(&trace_id, e),
    }
}

/// Current value as plain text.
#[utoipa::path(
    get,
    path = "/value/{kind}/{name}",
    tag = "Metrics",
    params(
        ("kind" = String, Path, description = "gauge or counter"),
        ("name" = String, Path, description = "Metric name")
    ),
    responses(
        (status = 200, description = "Value", body = String, content_type = "text/plain"),
        (status = 404, description = "No such metric", body = ApiError)
    )
)]
async fn read_value(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
    Path((kind, name)): Path<(String, String)>,
) -> Response {
    match run_blocking(state.ingest.clone(), move |ingest| ingest.read(&kind, &name)).await {
        Ok(value) => (StatusCode::OK, value.to_string()).into_response(),
        Err(e) => ingest_error_response(&trace_id, e),
    }
}

/// Current value as a record, signed when a key is configured.
#[utoipa::path(
    post,
    path = "/value/",
    tag = "Metrics",
    request_body = MetricRecord,
    responses(
        (status = 200, description = "Stored record", body = MetricRecord),
        (status = 400, description = "Malformed query", body = ApiError),
        (status = 404, description = "No such metric", body = ApiError)
    )
)]
async fn read_record(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
    body: Bytes,
) -> Response {
    let query: MetricRecord = match parse_body(&trace_id, &body) {
        Ok(q) => q,
        Err(resp) => return resp,
    };
    match run_blocking(state.ingest.clone(), move |ingest| ingest.read_record(&query)).await {
        Ok(record) => Json(record).into_response(),
        Err(e) => ingest_error_response(&trace_id, e),
    }
}

pub fn metric_routes() -> OpenApiRouter<AppState> {
    OpenApiRouter::new()
        .routes(routes!(list_metrics))
        .routes(routes!(ping))
        .routes(routes!(update_positional))
        .routes(routes!(update_record))
        .routes(routes!(update_batch))
        .routes(routes!(read_value))
        .routes(routes!(read_record))
}
