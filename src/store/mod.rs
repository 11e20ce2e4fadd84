//! Storage boundary.
//!
//! Ingestion and alert evaluation share no in-process state; they meet
//! only through these traits. Two backends implement all of them:
//! [`PgStore`] for production and [`InMemoryStore`] for tests and local
//! runs.
//!
//! Both backends enforce the two uniqueness guarantees the core relies on:
//! - one stored reading per `(stream_id, message_id)` when a message id is
//!   present
//! - one active alert instance per `(rule_id, stream_id)`

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{AlertInstance, AlertRule, IngestionSession, NormalizedReading, SensorStream};

pub mod memory;
pub mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PgStore;

// ---

/// Run a storage call with a deadline so no caller blocks unboundedly.
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    // ---
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(limit)),
    }
}

/// Resolves stream ids to their static configuration.
#[async_trait]
pub trait StreamDirectory: Send + Sync {
    // ---
    async fn get_streams(&self, ids: &[Uuid]) -> Result<HashMap<Uuid, SensorStream>, StoreError>;

    async fn list_streams(
        &self,
        site_id: Uuid,
        equipment_id: Option<Uuid>,
    ) -> Result<Vec<SensorStream>, StoreError>;

    async fn insert_stream(&self, stream: &SensorStream) -> Result<(), StoreError>;

    /// Point a stream at different equipment. Returns `None` for an
    /// unknown stream. Never touches the metric type.
    async fn set_equipment(
        &self,
        stream_id: Uuid,
        equipment_id: Option<Uuid>,
    ) -> Result<Option<SensorStream>, StoreError>;
}

/// Append-only store of normalized readings.
#[async_trait]
pub trait ReadingStore: Send + Sync {
    // ---
    /// Message ids from `candidates` already stored, keyed by stream.
    async fn existing_message_ids(
        &self,
        candidates: &HashMap<Uuid, Vec<String>>,
    ) -> Result<HashSet<(Uuid, String)>, StoreError>;

    /// Persist the whole batch or nothing. Rows refused by the
    /// `(stream_id, message_id)` uniqueness guard are skipped and their
    /// keys returned; every other row is written.
    async fn append(
        &self,
        readings: &[NormalizedReading],
    ) -> Result<HashSet<(Uuid, String)>, StoreError>;

    /// Readings with effective timestamp in `(from, to]`, newest first.
    /// Readings sharing a timestamp come back newest insert first.
    async fn query_range(
        &self,
        stream_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: Option<u32>,
    ) -> Result<Vec<NormalizedReading>, StoreError>;

    async fn latest(&self, stream_id: Uuid) -> Result<Option<NormalizedReading>, StoreError>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    // ---
    async fn insert_session(&self, session: &IngestionSession) -> Result<(), StoreError>;

    async fn get_session(&self, id: Uuid) -> Result<Option<IngestionSession>, StoreError>;

    /// Record a heartbeat on an open session. Returns `None` when the
    /// session is missing or already ended.
    async fn touch_session(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<IngestionSession>, StoreError>;

    /// Close an open session. Returns `None` when the session is missing
    /// or already ended; an existing end time is never overwritten.
    async fn close_session(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<IngestionSession>, StoreError>;

    /// Close every open session whose last heartbeat is before `cutoff`.
    /// Returns the ids closed by this call.
    async fn close_stale_sessions(
        &self,
        cutoff: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, StoreError>;
}

#[async_trait]
pub trait AlertStore: Send + Sync {
    // ---
    async fn sites_with_active_rules(&self) -> Result<Vec<Uuid>, StoreError>;

    async fn active_rules(&self, site_id: Uuid) -> Result<Vec<AlertRule>, StoreError>;

    async fn active_instance(
        &self,
        rule_id: Uuid,
        stream_id: Uuid,
    ) -> Result<Option<AlertInstance>, StoreError>;

    async fn get_instance(&self, id: Uuid) -> Result<Option<AlertInstance>, StoreError>;

    /// Active instances for every rule of `site_id`.
    async fn active_instances(&self, site_id: Uuid) -> Result<Vec<AlertInstance>, StoreError>;

    /// Insert a new active instance. Returns `false` without writing when
    /// an active instance for the same (rule, stream) already exists.
    async fn create_instance(&self, instance: &AlertInstance) -> Result<bool, StoreError>;

    /// Update last-seen value on an active instance.
    async fn touch_instance(
        &self,
        id: Uuid,
        value: f64,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Set `cleared_at` if still active. Returns the cleared instance, or
    /// `None` when it was not active.
    async fn clear_instance(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<AlertInstance>, StoreError>;

    /// Acknowledge an active, unacknowledged instance. Returns `None` when
    /// nothing was changed.
    async fn acknowledge_instance(
        &self,
        id: Uuid,
        by: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<AlertInstance>, StoreError>;
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[tokio::test]
    async fn test_with_timeout_expires() {
        // ---
        let slow = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, StoreError>(())
        };
        let err = with_timeout(Duration::from_millis(10), slow).await.unwrap_err();
        assert!(matches!(err, StoreError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_with_timeout_passes_result_through() {
        // ---
        let value = with_timeout(Duration::from_secs(1), async { Ok::<_, StoreError>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }
}
