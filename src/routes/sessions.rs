use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::post,
    Json, Router,
};
use serde::Deserialize;
use uuid::Uuid;

use super::{ApiError, AppState};
use crate::models::IngestionSession;

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/sessions", post(start))
        .route("/sessions/{session_id}/heartbeat", post(heartbeat))
        .route("/sessions/{session_id}/end", post(end))
}

#[derive(Debug, Deserialize)]
pub struct StartRequest {
    site_id: Uuid,
    equipment_id: Uuid,
    protocol: String,
}

async fn start(
    State(state): State<AppState>,
    Json(body): Json<StartRequest>,
) -> Result<(StatusCode, Json<IngestionSession>), ApiError> {
    // ---
    let session = state
        .sessions
        .start_session(body.site_id, body.equipment_id, &body.protocol)
        .await?;
    Ok((StatusCode::CREATED, Json(session)))
}

async fn heartbeat(
    Path(session_id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<IngestionSession>, ApiError> {
    Ok(Json(state.sessions.heartbeat(session_id).await?))
}

async fn end(
    Path(session_id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<IngestionSession>, ApiError> {
    Ok(Json(state.sessions.end_session(session_id).await?))
}
