//! HTTP adapter over the telemetry core.
//!
//! Gateway for the route submodules (EMBP): each sibling file exports a
//! subrouter, and this module merges them and attaches [`AppState`].
//! Handlers stay thin; all behavior lives in the library services.

use std::sync::Arc;
use std::time::Duration;

use axum::{http::StatusCode, response::IntoResponse, response::Response, Json, Router};
use serde_json::json;
use tracing::{error, warn};

use crate::alerts::{AlertEngine, EngineSettings};
use crate::clock::Clock;
use crate::directory::StreamRegistry;
use crate::error::{AlertError, DirectoryError, IngestError, SessionError, StoreError};
use crate::normalizer::Normalizer;
use crate::notify::Notifier;
use crate::pipeline::{IngestionPipeline, SessionManager};
use crate::store::{AlertStore, ReadingStore, SessionStore, StreamDirectory};

mod alerts;
mod health;
mod ingest;
mod readings;
mod sessions;
mod streams;

// ---

/// Services shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<IngestionPipeline>,
    pub sessions: Arc<SessionManager>,
    pub engine: Arc<AlertEngine>,
    pub streams: Arc<StreamRegistry>,
    pub readings: Arc<dyn ReadingStore>,
    pub clock: Arc<dyn Clock>,
    pub timeout: Duration,
}

impl AppState {
    // ---
    /// Wire every service onto one backend that implements all storage
    /// traits. The engine's timeout is used for every storage call.
    pub fn new<S>(
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn Notifier>,
        normalizer: Normalizer,
        settings: EngineSettings,
    ) -> Self
    where
        S: StreamDirectory + ReadingStore + SessionStore + AlertStore + 'static,
    {
        // ---
        let timeout = settings.timeout;
        AppState {
            pipeline: Arc::new(IngestionPipeline::new(
                store.clone(),
                store.clone(),
                normalizer,
                clock.clone(),
                notifier.clone(),
                timeout,
            )),
            sessions: Arc::new(SessionManager::new(store.clone(), clock.clone(), timeout)),
            engine: Arc::new(AlertEngine::new(
                store.clone(),
                store.clone(),
                clock.clone(),
                notifier,
                settings,
            )),
            streams: Arc::new(StreamRegistry::new(store.clone(), clock.clone(), timeout)),
            readings: store,
            clock,
            timeout,
        }
    }
}

pub fn router(state: AppState) -> Router {
    // ---
    Router::new()
        .merge(health::router())
        .merge(ingest::router())
        .merge(readings::router())
        .merge(streams::router())
        .merge(sessions::router())
        .merge(alerts::router())
        .with_state(state)
}

// ---

/// Error half of every handler's return type.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    Conflict(String),
    BadRequest(String),
    Unavailable(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // ---
        let (status, message) = match self {
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, m),
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::Unavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, m),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        error!("Storage failure: {}", e);
        ApiError::Unavailable(e.to_string())
    }
}

impl From<IngestError> for ApiError {
    fn from(e: IngestError) -> Self {
        error!("Batch rejected: {}", e);
        ApiError::Unavailable(e.to_string())
    }
}

impl From<DirectoryError> for ApiError {
    fn from(e: DirectoryError) -> Self {
        match e {
            DirectoryError::NotFound(_) => ApiError::NotFound(e.to_string()),
            DirectoryError::Store(inner) => inner.into(),
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        // ---
        match e {
            SessionError::NotFound(_) => ApiError::NotFound(e.to_string()),
            SessionError::Ended(_) => {
                warn!("{}", e);
                ApiError::Conflict(e.to_string())
            }
            SessionError::Store(inner) => inner.into(),
        }
    }
}

impl From<AlertError> for ApiError {
    fn from(e: AlertError) -> Self {
        // ---
        match e {
            AlertError::NotFound(_) => ApiError::NotFound(e.to_string()),
            AlertError::NotActive(_) => ApiError::Conflict(e.to_string()),
            AlertError::Store(inner) => inner.into(),
        }
    }
}
