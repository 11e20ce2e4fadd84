//! Active alert listing and operator acknowledgement.

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use super::{ApiError, AppState};
use crate::models::AlertInstance;

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/sites/{site_id}/alerts", get(list_active))
        .route("/alerts/{alert_id}/acknowledge", post(acknowledge))
}

#[derive(Debug, Deserialize)]
pub struct AcknowledgeRequest {
    /// Operator name or id recorded on the instance.
    by: String,
}

async fn list_active(
    Path(site_id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<Vec<AlertInstance>>, ApiError> {
    Ok(Json(state.engine.active_alerts(site_id).await?))
}

async fn acknowledge(
    Path(alert_id): Path<Uuid>,
    State(state): State<AppState>,
    Json(body): Json<AcknowledgeRequest>,
) -> Result<Json<AlertInstance>, ApiError> {
    // ---
    info!("POST /alerts/{}/acknowledge by {}", alert_id, body.by);
    if body.by.trim().is_empty() {
        return Err(ApiError::BadRequest("'by' must not be empty".into()));
    }

    let instance = state.engine.acknowledge_alert(alert_id, body.by.trim()).await?;
    Ok(Json(instance))
}
