//! Stream registration and equipment re-pointing.
//!
//! A stream's metric type is fixed at registration. Nothing here or in
//! the store can change it afterwards.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{DirectoryError, StoreError};
use crate::models::{MetricType, SensorStream};
use crate::store::{with_timeout, StreamDirectory};

// ---

pub struct StreamRegistry {
    store: Arc<dyn StreamDirectory>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl StreamRegistry {
    // ---
    pub fn new(store: Arc<dyn StreamDirectory>, clock: Arc<dyn Clock>, timeout: Duration) -> Self {
        StreamRegistry {
            store,
            clock,
            timeout,
        }
    }

    /// Create a stream stored in `metric`'s canonical unit.
    pub async fn register_stream(
        &self,
        site_id: Uuid,
        equipment_id: Option<Uuid>,
        name: &str,
        metric: MetricType,
    ) -> Result<SensorStream, DirectoryError> {
        // ---
        let stream = SensorStream::new(site_id, equipment_id, name, metric, self.clock.now());
        with_timeout(self.timeout, self.store.insert_stream(&stream)).await?;

        info!(
            "Registered {} stream '{}' ({}) for site {}",
            metric, stream.name, stream.id, site_id
        );
        Ok(stream)
    }

    /// Move a stream to other equipment, or detach it with `None`.
    pub async fn repoint_stream(
        &self,
        stream_id: Uuid,
        equipment_id: Option<Uuid>,
    ) -> Result<SensorStream, DirectoryError> {
        // ---
        let updated =
            with_timeout(self.timeout, self.store.set_equipment(stream_id, equipment_id)).await?;
        let stream = updated.ok_or(DirectoryError::NotFound(stream_id))?;

        info!("Stream {} now points at equipment {:?}", stream_id, equipment_id);
        Ok(stream)
    }

    pub async fn list_streams(
        &self,
        site_id: Uuid,
        equipment_id: Option<Uuid>,
    ) -> Result<Vec<SensorStream>, StoreError> {
        with_timeout(self.timeout, self.store.list_streams(site_id, equipment_id)).await
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::Unit;
    use crate::store::InMemoryStore;
    use chrono::{TimeZone, Utc};

    fn registry() -> StreamRegistry {
        // ---
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 2, 3, 10, 0, 0).unwrap());
        StreamRegistry::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(clock),
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn test_register_uses_canonical_unit() {
        // ---
        let registry = registry();
        let site = Uuid::new_v4();
        let stream = registry
            .register_stream(site, None, "mother-room-vpd", MetricType::Vpd)
            .await
            .unwrap();

        assert_eq!(stream.canonical_unit, Unit::Kilopascal);
        assert_eq!(registry.list_streams(site, None).await.unwrap(), vec![stream]);
    }

    #[tokio::test]
    async fn test_repoint_keeps_metric() {
        // ---
        let registry = registry();
        let site = Uuid::new_v4();
        let old_equipment = Uuid::new_v4();
        let new_equipment = Uuid::new_v4();
        let stream = registry
            .register_stream(site, Some(old_equipment), "tank-ec", MetricType::Ec)
            .await
            .unwrap();

        let moved = registry.repoint_stream(stream.id, Some(new_equipment)).await.unwrap();
        assert_eq!(moved.equipment_id, Some(new_equipment));
        assert_eq!(moved.metric, MetricType::Ec);
        assert_eq!(moved.canonical_unit, stream.canonical_unit);

        let on_new = registry.list_streams(site, Some(new_equipment)).await.unwrap();
        assert_eq!(on_new.len(), 1);
        assert!(registry
            .list_streams(site, Some(old_equipment))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_repoint_unknown_stream() {
        // ---
        let missing = Uuid::new_v4();
        let err = registry().repoint_stream(missing, None).await.unwrap_err();
        assert!(matches!(err, DirectoryError::NotFound(id) if id == missing));
    }
}
