//! Inbound HTTP surface: the vendor push callback, device read routes over
//! the store and the file log, and a liveness check.

use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use telemetry_store::domain::{Device, Sensor};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use crate::{
    clock::Clock,
    pipeline::{Pipeline, PipelineError},
    sinks::log_store::{LogFilter, LogRecord, LogStatus, TimeRange},
    transform::{normalize_push, parse_timestamp},
};

pub const SIGNATURE_HEADER: &str = "X-TLink-Signature";

#[derive(Clone)]
pub struct WebhookState {
    pipeline: Arc<Pipeline>,
    secret: Option<Arc<[u8]>>,
    history_limit: usize,
    clock: Arc<dyn Clock>,
}

impl WebhookState {
    /// An empty `secret` disables signature checks.
    pub fn new(pipeline: Arc<Pipeline>, secret: &str, history_limit: usize, clock: Arc<dyn Clock>) -> Self {
        let secret = (!secret.is_empty()).then(|| Arc::from(secret.as_bytes()));
        Self {
            pipeline,
            secret,
            history_limit,
            clock,
        }
    }
}

pub fn router(state: WebhookState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/webhooks/tlink", post(ingest_push))
        .route("/devices/:device_id/latest", get(device_latest))
        .route("/devices/:device_id/history", get(device_history))
        .route("/logs/:device_id", get(device_history))
        .route("/logs/:device_id/:sensor_id", get(sensor_logs))
        .route("/healthz", get(|| async { "ok" }))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(state)
}

/// Serve `app` on `bind_addr` until `cancel` fires, then drain in-flight
/// requests.
pub async fn serve(bind_addr: &str, app: Router, cancel: CancellationToken) -> std::io::Result<()> {
    let addr: SocketAddr = bind_addr
        .parse()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("invalid bind addr: {e}")))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "webhook listener bound");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn internal(e: impl std::fmt::Display) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::Validation(e) => ApiError::new(StatusCode::BAD_REQUEST, e.to_string()),
            PipelineError::Store(e) => ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        }
    }
}

fn reject(reason: &'static str, err: ApiError) -> ApiError {
    metrics::counter!("webhook_rejected_total", "reason" => reason).increment(1);
    tracing::warn!(reason, status = err.status.as_u16(), error = %err.message, "push callback rejected");
    err
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct IngestResponse {
    status: &'static str,
    stored_readings: u64,
    defects: usize,
}

async fn ingest_push(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<IngestResponse>, ApiError> {
    metrics::counter!("webhook_requests_total").increment(1);
    let received_at = state.clock.now();

    if let Some(secret) = &state.secret {
        let provided = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
        if !verify_signature(secret, provided, &body) {
            return Err(reject(
                "signature",
                ApiError::new(StatusCode::UNAUTHORIZED, "invalid or missing signature"),
            ));
        }
    }

    let payload: Value = serde_json::from_slice(&body).map_err(|e| {
        reject(
            "json",
            ApiError::new(StatusCode::BAD_REQUEST, format!("invalid JSON: {e}")),
        )
    })?;

    let normalized = normalize_push(&payload, received_at)
        .map_err(|e| reject("validation", PipelineError::from(e).into()))?;
    for defect in &normalized.defects {
        tracing::warn!(
            device_id = normalized.frame.device_external_id,
            index = defect.index,
            sensor_id = ?defect.sensor_external_id,
            reason = %defect.kind,
            "skipping push reading"
        );
    }

    let outcome = state
        .pipeline
        .ingest(normalized)
        .await
        .map_err(|e| reject("store", e.into()))?;

    Ok(Json(IngestResponse {
        status: "ok",
        stored_readings: outcome.stored,
        defects: outcome.defects,
    }))
}

/// Accepts `sha256=<hex>` or bare `<hex>` of HMAC-SHA256(secret, body).
pub fn verify_signature(secret: &[u8], provided: Option<&str>, body: &[u8]) -> bool {
    let Some(provided) = provided.map(str::trim) else {
        return false;
    };
    let hex_digest = provided.strip_prefix("sha256=").unwrap_or(provided);
    let Ok(provided) = hex::decode(hex_digest) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    let expected = mac.finalize().into_bytes();
    expected.as_slice().ct_eq(&provided).into()
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    start: Option<String>,
    end: Option<String>,
    limit: Option<usize>,
    status: Option<String>,
}

impl HistoryParams {
    fn range(&self) -> Result<TimeRange, ApiError> {
        Ok(TimeRange {
            start: parse_bound("start", self.start.as_deref())?,
            end: parse_bound("end", self.end.as_deref())?,
        })
    }

    fn status(&self) -> Result<Option<LogStatus>, ApiError> {
        match self.status.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
            None => Ok(None),
            Some(v) => v
                .parse::<LogStatus>()
                .map(Some)
                .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e)),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HistoryResponse {
    device_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    sensor_id: Option<i64>,
    records: Vec<LogRecord>,
    skipped: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeviceSummary {
    device_id: i64,
    owner_id: Option<String>,
    device_name: Option<String>,
    device_no: Option<String>,
    last_flag: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    last_push_time: Option<OffsetDateTime>,
}

impl From<Device> for DeviceSummary {
    fn from(d: Device) -> Self {
        Self {
            device_id: d.external_id,
            owner_id: d.owner_external_id,
            device_name: d.device_name,
            device_no: d.device_no,
            last_flag: d.last_flag,
            last_push_time: d.last_push_time,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SensorLatest {
    sensor_id: i64,
    sensor_type_id: Option<i64>,
    sensor_name: Option<String>,
    unit: Option<String>,
    latest_value: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    latest_recorded_at: Option<OffsetDateTime>,
    is_alarm: Option<bool>,
    is_line: Option<bool>,
}

impl From<Sensor> for SensorLatest {
    fn from(s: Sensor) -> Self {
        Self {
            sensor_id: s.external_id,
            sensor_type_id: s.sensor_type_id,
            sensor_name: s.sensor_name,
            unit: s.unit,
            latest_value: s.latest_value,
            latest_recorded_at: s.latest_recorded_at,
            is_alarm: s.is_alarm,
            is_line: s.is_line,
        }
    }
}

#[derive(Debug, Serialize)]
struct LatestResponse {
    device: DeviceSummary,
    sensors: Vec<SensorLatest>,
}

fn parse_bound(name: &str, value: Option<&str>) -> Result<Option<OffsetDateTime>, ApiError> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(v) => parse_timestamp(v)
            .map(Some)
            .ok_or_else(|| ApiError::new(StatusCode::BAD_REQUEST, format!("invalid {name} timestamp {v:?}"))),
    }
}

async fn require_device(state: &WebhookState, device_id: i64) -> Result<Device, ApiError> {
    state
        .pipeline
        .store()
        .device(device_id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "device not found"))
}

async fn device_latest(
    State(state): State<WebhookState>,
    Path(device_id): Path<i64>,
) -> Result<Json<LatestResponse>, ApiError> {
    let device = require_device(&state, device_id).await?;
    let sensors = state
        .pipeline
        .store()
        .device_sensors(device_id)
        .await
        .map_err(ApiError::internal)?;

    Ok(Json(LatestResponse {
        device: device.into(),
        sensors: sensors.into_iter().map(SensorLatest::from).collect(),
    }))
}

async fn device_history(
    State(state): State<WebhookState>,
    Path(device_id): Path<i64>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<HistoryResponse>, ApiError> {
    require_device(&state, device_id).await?;
    read_log(&state, device_id, None, &params).await.map(Json)
}

async fn sensor_logs(
    State(state): State<WebhookState>,
    Path((device_id, sensor_id)): Path<(i64, i64)>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<HistoryResponse>, ApiError> {
    require_device(&state, device_id).await?;
    let sensors = state
        .pipeline
        .store()
        .device_sensors(device_id)
        .await
        .map_err(ApiError::internal)?;
    if !sensors.iter().any(|s| s.external_id == sensor_id) {
        return Err(ApiError::new(StatusCode::NOT_FOUND, "sensor not found for device"));
    }
    read_log(&state, device_id, Some(sensor_id), &params).await.map(Json)
}

/// File-log records for the device, with `sensorName`/`unit` filled from the
/// store where the line lacks them. Sensors unknown to the store still appear.
async fn read_log(
    state: &WebhookState,
    device_id: i64,
    sensor_id: Option<i64>,
    params: &HistoryParams,
) -> Result<HistoryResponse, ApiError> {
    let filter = LogFilter {
        range: params.range()?,
        sensor_id,
        status: params.status()?,
    };
    let limit = params.limit.unwrap_or(state.history_limit);

    let query = state
        .pipeline
        .log()
        .query(device_id, &filter, limit)
        .await
        .map_err(ApiError::internal)?;

    let mut records = query.records;
    match state.pipeline.store().device_sensors(device_id).await {
        Ok(sensors) => {
            let known: HashMap<i64, _> = sensors.into_iter().map(|s| (s.external_id, s)).collect();
            for record in &mut records {
                let Some(sensor) = record.sensor_id.and_then(|id| known.get(&id)) else {
                    continue;
                };
                if record.sensor_name.is_none() {
                    record.sensor_name = sensor.sensor_name.clone();
                }
                if record.unit.is_none() {
                    record.unit = sensor.unit.clone();
                }
            }
        }
        Err(e) => tracing::warn!(error = %e, device_id, "history served without sensor metadata"),
    }

    Ok(HistoryResponse {
        device_id,
        sensor_id,
        records,
        skipped: query.skipped,
    })
}
