//! HTTP surface: ingest, command submission, history, and the WebSocket upgrade.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use fanrelay_core::{DeviceId, NewCommand, NewReading};
use fanrelay_store::StoreError;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::error;

use crate::connection;
use crate::delivery::DeliveryError;
use crate::server::AppState;

const DEFAULT_RECENT_LIMIT: u32 = 50;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
            }
            Self::Store(e) => internal(&e),
            Self::Delivery(e) => internal(&e),
        }
    }
}

fn internal(e: &dyn std::error::Error) -> Response {
    error!(error = %e, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "db error" })),
    )
        .into_response()
}

fn require_device(device_id: &DeviceId) -> Result<(), ApiError> {
    if device_id.is_blank() {
        return Err(ApiError::BadRequest("device_id is required".into()));
    }
    Ok(())
}

/// GET /
pub async fn root() -> &'static str {
    "Backend is running!"
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "connections": state.registry.connection_count(),
        "devices": state.registry.device_count(),
    }))
}

/// POST /telemetry
pub async fn ingest_telemetry(
    State(state): State<AppState>,
    Json(body): Json<NewReading>,
) -> Result<Json<Value>, ApiError> {
    require_device(&body.device_id)?;
    let reading = state.readings.insert(&body)?;
    let _ = state.fanout.publish(&reading);
    Ok(Json(json!({ "ok": true, "reading": reading })))
}

/// POST /command
pub async fn submit_command(
    State(state): State<AppState>,
    Json(body): Json<NewCommand>,
) -> Result<Json<Value>, ApiError> {
    require_device(&body.device_id)?;
    if body.command_type.trim().is_empty() {
        return Err(ApiError::BadRequest("command_type is required".into()));
    }
    let report = state.engine.submit(&body).await?;
    Ok(Json(json!({
        "ok": true,
        "command": report.command,
        "pushed": report.pushed,
    })))
}

#[derive(Debug, Default, Deserialize)]
pub struct RecentQuery {
    pub device_id: Option<DeviceId>,
    pub limit: Option<u32>,
}

/// GET /telemetry/recent
pub async fn recent_telemetry(
    State(state): State<AppState>,
    Query(query): Query<RecentQuery>,
) -> Result<Json<Value>, ApiError> {
    let device = query.device_id.filter(|d| !d.is_blank());
    let rows = state
        .readings
        .recent(device.as_ref(), query.limit.unwrap_or(DEFAULT_RECENT_LIMIT))?;
    Ok(Json(json!({ "rows": rows })))
}

/// GET /commands/recent
pub async fn recent_commands(
    State(state): State<AppState>,
    Query(query): Query<RecentQuery>,
) -> Result<Json<Value>, ApiError> {
    let Some(device) = query.device_id.filter(|d| !d.is_blank()) else {
        return Err(ApiError::BadRequest("device_id is required".into()));
    };
    let rows = state
        .commands
        .recent_for_device(&device, query.limit.unwrap_or(DEFAULT_RECENT_LIMIT))?;
    Ok(Json(json!({ "rows": rows })))
}

/// GET /ws
pub async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| connection::serve_connection(socket, state))
}
