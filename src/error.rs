//! Error types for the telemetry core.
//!
//! Quality judgments (out-of-range, future timestamp) and duplicates are
//! not errors and never appear here.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::models::{MetricType, Unit};

// ---

/// Per-reading conversion failures, plus parse failures for persisted
/// enum text.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NormalizeError {
    #[error("unknown unit '{0}'")]
    UnknownUnit(String),
    #[error("unit {unit} cannot be converted for metric {metric}")]
    UnsupportedConversion { unit: Unit, metric: MetricType },
    #[error("value is not a finite number")]
    NonFiniteValue,
    #[error("unknown metric type '{0}'")]
    UnknownMetric(String),
    #[error("unknown quality code '{0}'")]
    UnknownQuality(String),
    #[error("unknown severity '{0}'")]
    UnknownSeverity(String),
}

/// Failures at the storage boundary.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("storage call timed out after {0:?}")]
    Timeout(Duration),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl From<NormalizeError> for StoreError {
    fn from(e: NormalizeError) -> Self {
        StoreError::Corrupt(e.to_string())
    }
}

/// Batch-level ingestion failure. Nothing from the batch was persisted.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("failed to resolve streams: {0}")]
    Directory(#[source] StoreError),
    #[error("failed to check duplicates: {0}")]
    Dedup(#[source] StoreError),
    #[error("failed to flush batch: {0}")]
    Flush(#[source] StoreError),
}

/// Why a single reading in a batch was rejected.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReadingRejection {
    #[error("unknown stream {0}")]
    UnknownStream(Uuid),
    #[error("stream {0} belongs to another site")]
    WrongSite(Uuid),
    #[error(transparent)]
    Normalize(#[from] NormalizeError),
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("stream {0} not found")]
    NotFound(Uuid),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session {0} not found")]
    NotFound(Uuid),
    #[error("session {0} has already ended")]
    Ended(Uuid),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum AlertError {
    #[error("alert instance {0} not found")]
    NotFound(Uuid),
    #[error("alert instance {0} is not active")]
    NotActive(Uuid),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Downstream fan-out failure. Logged by callers, never propagated into
/// ingestion or evaluation results.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("webhook request failed: {0}")]
    Http(#[from] reqwest::Error),
}
