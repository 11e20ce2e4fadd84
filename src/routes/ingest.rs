//! Batch ingestion: `POST /sites/{site_id}/readings`.

use axum::{
    extract::{Path, State},
    routing::post,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use super::{ApiError, AppState};
use crate::models::RawReading;
use crate::pipeline::IngestResult;

// ---

pub fn router() -> Router<AppState> {
    Router::new().route("/sites/{site_id}/readings", post(handler))
}

/// One reading as sent by a device gateway. The ingestion timestamp is
/// assigned on arrival.
#[derive(Debug, Deserialize)]
pub struct ReadingInput {
    stream_id: Uuid,
    value: f64,
    unit: String,
    source_ts: Option<DateTime<Utc>>,
    message_id: Option<String>,
    #[serde(default)]
    metadata: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    readings: Vec<ReadingInput>,
}

async fn handler(
    Path(site_id): Path<Uuid>,
    State(state): State<AppState>,
    Json(body): Json<IngestRequest>,
) -> Result<Json<IngestResult>, ApiError> {
    // ---
    info!("POST /sites/{}/readings - {} readings", site_id, body.readings.len());

    let ingested_at = state.clock.now();
    let raw = body
        .readings
        .into_iter()
        .map(|r| RawReading {
            stream_id: r.stream_id,
            value: r.value,
            unit: r.unit,
            source_ts: r.source_ts,
            ingested_at,
            message_id: r.message_id,
            metadata: r.metadata,
        })
        .collect();

    let result = state.pipeline.ingest_batch(site_id, raw).await?;
    Ok(Json(result))
}
