//! Raw and normalized sensor readings.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::NormalizeError;

// ---

/// Reading as delivered by a device or vendor bridge. Never stored as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawReading {
    // ---
    pub stream_id: Uuid,
    pub value: f64,
    /// Unit label exactly as the vendor reported it.
    pub unit: String,
    pub source_ts: Option<DateTime<Utc>>,
    pub ingested_at: DateTime<Utc>,
    pub message_id: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Permanent judgment attached to a normalized reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityCode {
    Good,
    BadOutOfRange,
    BadFutureTimestamp,
}

impl QualityCode {
    // ---
    pub fn is_good(self) -> bool {
        self == QualityCode::Good
    }

    pub fn as_str(self) -> &'static str {
        // ---
        match self {
            QualityCode::Good => "good",
            QualityCode::BadOutOfRange => "bad_out_of_range",
            QualityCode::BadFutureTimestamp => "bad_future_timestamp",
        }
    }
}

impl fmt::Display for QualityCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QualityCode {
    type Err = NormalizeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // ---
        match s {
            "good" => Ok(QualityCode::Good),
            "bad_out_of_range" => Ok(QualityCode::BadOutOfRange),
            "bad_future_timestamp" => Ok(QualityCode::BadFutureTimestamp),
            other => Err(NormalizeError::UnknownQuality(other.to_string())),
        }
    }
}

/// Reading in the stream's canonical unit. Immutable and append-only:
/// corrections arrive as new readings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedReading {
    // ---
    pub stream_id: Uuid,
    pub value: f64,
    pub quality: QualityCode,
    pub source_ts: Option<DateTime<Utc>>,
    pub ingested_at: DateTime<Utc>,
    pub message_id: Option<String>,
    pub metadata: serde_json::Value,
}

impl NormalizedReading {
    /// Timestamp used for ordering and windowing. Devices that send no
    /// timestamp are placed at their ingestion time.
    pub fn effective_ts(&self) -> DateTime<Utc> {
        self.source_ts.unwrap_or(self.ingested_at)
    }

    /// Idempotency key, present only when the provider sent a message id.
    pub fn dedup_key(&self) -> Option<(Uuid, &str)> {
        self.message_id.as_deref().map(|id| (self.stream_id, id))
    }
}
