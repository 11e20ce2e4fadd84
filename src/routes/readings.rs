//! Stored readings of one stream, newest first.

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use super::{ApiError, AppState};
use crate::models::NormalizedReading;
use crate::store::with_timeout;

const DEFAULT_LIMIT: u32 = 1000;
const MAX_LIMIT: u32 = 10_000;

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/streams/{stream_id}/readings", get(handler))
        .route("/streams/{stream_id}/readings/latest", get(latest))
}

/// Query parameters for filtering stored readings.
#[derive(Debug, Deserialize)]
pub struct ReadingsQuery {
    /// Timestamp range filter (e.g., "2025-03-21T00:00:00Z,2025-03-22T00:00:00Z").
    /// Start is exclusive, end inclusive.
    timestamp_range: Option<String>,
    limit: Option<u32>,
}

async fn handler(
    Path(stream_id): Path<Uuid>,
    Query(params): Query<ReadingsQuery>,
    State(state): State<AppState>,
) -> Result<Json<Vec<NormalizedReading>>, ApiError> {
    // ---
    debug!("GET /streams/{}/readings - {:?}", stream_id, params);

    let (from, to) = match params.timestamp_range.as_deref() {
        Some(range) => parse_range(range)?,
        None => open_range(),
    };
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);

    let readings = with_timeout(
        state.timeout,
        state.readings.query_range(stream_id, from, to, Some(limit)),
    )
    .await?;
    Ok(Json(readings))
}

/// Newest stored reading, or 404 when the stream has none.
async fn latest(
    Path(stream_id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<NormalizedReading>, ApiError> {
    // ---
    with_timeout(state.timeout, state.readings.latest(stream_id))
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no readings for stream {}", stream_id)))
}

/// Parse `"start,end"` (RFC 3339 both sides).
fn parse_range(range: &str) -> Result<(DateTime<Utc>, DateTime<Utc>), ApiError> {
    // ---
    let (start, end) = range
        .split_once(',')
        .ok_or_else(|| ApiError::BadRequest("timestamp_range must be 'start,end'".into()))?;

    let parse = |s: &str| {
        DateTime::parse_from_rfc3339(s.trim())
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| ApiError::BadRequest(format!("invalid timestamp '{}': {}", s.trim(), e)))
    };
    let (from, to) = (parse(start)?, parse(end)?);

    if from > to {
        return Err(ApiError::BadRequest("timestamp_range start is after end".into()));
    }
    Ok((from, to))
}

/// Widest range that PostgreSQL `timestamptz` can store.
fn open_range() -> (DateTime<Utc>, DateTime<Utc>) {
    // ---
    let from = DateTime::from_timestamp(0, 0).unwrap_or(DateTime::<Utc>::MIN_UTC);
    let to = DateTime::from_timestamp(253_402_300_799, 0).unwrap_or(DateTime::<Utc>::MAX_UTC);
    (from, to)
}
