//! Stream registration, listing and equipment re-pointing.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, put},
    Json, Router,
};
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use super::{ApiError, AppState};
use crate::models::{MetricType, SensorStream};

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/sites/{site_id}/streams", get(list).post(register))
        .route("/streams/{stream_id}/equipment", put(repoint))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    equipment_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    name: String,
    metric: MetricType,
    equipment_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct RepointRequest {
    equipment_id: Option<Uuid>,
}

async fn list(
    Path(site_id): Path<Uuid>,
    Query(params): Query<ListQuery>,
    State(state): State<AppState>,
) -> Result<Json<Vec<SensorStream>>, ApiError> {
    // ---
    let streams = state.streams.list_streams(site_id, params.equipment_id).await?;
    Ok(Json(streams))
}

async fn register(
    Path(site_id): Path<Uuid>,
    State(state): State<AppState>,
    Json(body): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<SensorStream>), ApiError> {
    // ---
    info!("POST /sites/{}/streams - {}", site_id, body.name);
    if body.name.trim().is_empty() {
        return Err(ApiError::BadRequest("stream name must not be empty".into()));
    }

    let stream = state
        .streams
        .register_stream(site_id, body.equipment_id, body.name.trim(), body.metric)
        .await?;
    Ok((StatusCode::CREATED, Json(stream)))
}

async fn repoint(
    Path(stream_id): Path<Uuid>,
    State(state): State<AppState>,
    Json(body): Json<RepointRequest>,
) -> Result<Json<SensorStream>, ApiError> {
    // ---
    let stream = state.streams.repoint_stream(stream_id, body.equipment_id).await?;
    Ok(Json(stream))
}
