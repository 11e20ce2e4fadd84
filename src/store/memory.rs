//! In-process backend.
//!
//! All state sits behind one async mutex, so every trait call is atomic
//! with respect to every other. Used by the test suite and for running
//! the service without PostgreSQL.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{AlertStore, ReadingStore, SessionStore, StreamDirectory};
use crate::error::StoreError;
use crate::models::{AlertInstance, AlertRule, IngestionSession, NormalizedReading, SensorStream};

// ---

#[derive(Default)]
struct Inner {
    streams: HashMap<Uuid, SensorStream>,
    readings: Vec<NormalizedReading>,
    message_keys: HashSet<(Uuid, String)>,
    sessions: HashMap<Uuid, IngestionSession>,
    rules: Vec<AlertRule>,
    instances: Vec<AlertInstance>,
}

#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
    fail_writes: AtomicBool,
    unreadable_streams: Mutex<HashSet<Uuid>>,
}

impl InMemoryStore {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent reading append fail, as an unreachable
    /// database would.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make range queries for `stream_id` fail.
    pub async fn set_stream_unreadable(&self, stream_id: Uuid) {
        self.unreadable_streams.lock().await.insert(stream_id);
    }

    pub async fn add_rule(&self, rule: AlertRule) {
        self.inner.lock().await.rules.push(rule);
    }

    /// Every stored reading for `stream_id`, in append order.
    pub async fn readings(&self, stream_id: Uuid) -> Vec<NormalizedReading> {
        // ---
        let inner = self.inner.lock().await;
        inner
            .readings
            .iter()
            .filter(|r| r.stream_id == stream_id)
            .cloned()
            .collect()
    }

    /// Full instance history, cleared ones included.
    pub async fn instances(&self, rule_id: Uuid, stream_id: Uuid) -> Vec<AlertInstance> {
        // ---
        let inner = self.inner.lock().await;
        inner
            .instances
            .iter()
            .filter(|i| i.rule_id == rule_id && i.stream_id == stream_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl StreamDirectory for InMemoryStore {
    // ---
    async fn get_streams(&self, ids: &[Uuid]) -> Result<HashMap<Uuid, SensorStream>, StoreError> {
        // ---
        let inner = self.inner.lock().await;
        Ok(ids
            .iter()
            .filter_map(|id| inner.streams.get(id).map(|s| (*id, s.clone())))
            .collect())
    }

    async fn list_streams(
        &self,
        site_id: Uuid,
        equipment_id: Option<Uuid>,
    ) -> Result<Vec<SensorStream>, StoreError> {
        // ---
        let inner = self.inner.lock().await;
        let mut streams: Vec<SensorStream> = inner
            .streams
            .values()
            .filter(|s| s.site_id == site_id)
            .filter(|s| equipment_id.map_or(true, |e| s.equipment_id == Some(e)))
            .cloned()
            .collect();
        streams.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(streams)
    }

    async fn insert_stream(&self, stream: &SensorStream) -> Result<(), StoreError> {
        self.inner.lock().await.streams.insert(stream.id, stream.clone());
        Ok(())
    }

    async fn set_equipment(
        &self,
        stream_id: Uuid,
        equipment_id: Option<Uuid>,
    ) -> Result<Option<SensorStream>, StoreError> {
        // ---
        let mut inner = self.inner.lock().await;
        Ok(inner.streams.get_mut(&stream_id).map(|s| {
            s.equipment_id = equipment_id;
            s.clone()
        }))
    }
}

#[async_trait]
impl ReadingStore for InMemoryStore {
    // ---
    async fn existing_message_ids(
        &self,
        candidates: &HashMap<Uuid, Vec<String>>,
    ) -> Result<HashSet<(Uuid, String)>, StoreError> {
        // ---
        let inner = self.inner.lock().await;
        Ok(candidates
            .iter()
            .flat_map(|(stream_id, ids)| ids.iter().map(move |id| (*stream_id, id.clone())))
            .filter(|key| inner.message_keys.contains(key))
            .collect())
    }

    async fn append(
        &self,
        readings: &[NormalizedReading],
    ) -> Result<HashSet<(Uuid, String)>, StoreError> {
        // ---
        let mut inner = self.inner.lock().await;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes disabled".to_string()));
        }

        let mut refused = HashSet::new();
        for reading in readings {
            if let Some((stream_id, message_id)) = reading.dedup_key() {
                let key = (stream_id, message_id.to_string());
                if !inner.message_keys.insert(key.clone()) {
                    refused.insert(key);
                    continue;
                }
            }
            inner.readings.push(reading.clone());
        }
        Ok(refused)
    }

    async fn query_range(
        &self,
        stream_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: Option<u32>,
    ) -> Result<Vec<NormalizedReading>, StoreError> {
        // ---
        if self.unreadable_streams.lock().await.contains(&stream_id) {
            return Err(StoreError::Unavailable(format!("stream {stream_id} unreadable")));
        }

        let inner = self.inner.lock().await;
        let mut rows: Vec<NormalizedReading> = inner
            .readings
            .iter()
            .rev()
            .filter(|r| r.stream_id == stream_id)
            .filter(|r| r.effective_ts() > from && r.effective_ts() <= to)
            .cloned()
            .collect();
        // Stable over reversed insertion order: ties come back newest insert first
        rows.sort_by_key(|r| std::cmp::Reverse(r.effective_ts()));
        if let Some(limit) = limit {
            rows.truncate(limit as usize);
        }
        Ok(rows)
    }

    async fn latest(&self, stream_id: Uuid) -> Result<Option<NormalizedReading>, StoreError> {
        // ---
        let inner = self.inner.lock().await;
        Ok(inner
            .readings
            .iter()
            .filter(|r| r.stream_id == stream_id)
            .max_by_key(|r| r.effective_ts())
            .cloned())
    }
}

#[async_trait]
impl SessionStore for InMemoryStore {
    // ---
    async fn insert_session(&self, session: &IngestionSession) -> Result<(), StoreError> {
        self.inner.lock().await.sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<IngestionSession>, StoreError> {
        Ok(self.inner.lock().await.sessions.get(&id).cloned())
    }

    async fn touch_session(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<IngestionSession>, StoreError> {
        // ---
        let mut inner = self.inner.lock().await;
        Ok(inner.sessions.get_mut(&id).filter(|s| s.is_open()).map(|s| {
            s.last_heartbeat_at = s.last_heartbeat_at.max(at);
            s.clone()
        }))
    }

    async fn close_session(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<IngestionSession>, StoreError> {
        // ---
        let mut inner = self.inner.lock().await;
        Ok(inner.sessions.get_mut(&id).filter(|s| s.is_open()).map(|s| {
            s.ended_at = Some(at);
            s.clone()
        }))
    }

    async fn close_stale_sessions(
        &self,
        cutoff: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, StoreError> {
        // ---
        let mut inner = self.inner.lock().await;
        let mut closed = Vec::new();
        for session in inner.sessions.values_mut() {
            if session.is_stale(cutoff) {
                session.ended_at = Some(at);
                closed.push(session.id);
            }
        }
        Ok(closed)
    }
}

#[async_trait]
impl AlertStore for InMemoryStore {
    // ---
    async fn sites_with_active_rules(&self) -> Result<Vec<Uuid>, StoreError> {
        // ---
        let inner = self.inner.lock().await;
        let mut sites: Vec<Uuid> = inner
            .rules
            .iter()
            .filter(|r| r.active)
            .map(|r| r.site_id)
            .collect();
        sites.sort();
        sites.dedup();
        Ok(sites)
    }

    async fn active_rules(&self, site_id: Uuid) -> Result<Vec<AlertRule>, StoreError> {
        // ---
        let inner = self.inner.lock().await;
        Ok(inner
            .rules
            .iter()
            .filter(|r| r.active && r.site_id == site_id)
            .cloned()
            .collect())
    }

    async fn active_instance(
        &self,
        rule_id: Uuid,
        stream_id: Uuid,
    ) -> Result<Option<AlertInstance>, StoreError> {
        // ---
        let inner = self.inner.lock().await;
        Ok(inner
            .instances
            .iter()
            .find(|i| i.rule_id == rule_id && i.stream_id == stream_id && i.is_active())
            .cloned())
    }

    async fn get_instance(&self, id: Uuid) -> Result<Option<AlertInstance>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.instances.iter().find(|i| i.id == id).cloned())
    }

    async fn active_instances(&self, site_id: Uuid) -> Result<Vec<AlertInstance>, StoreError> {
        // ---
        let inner = self.inner.lock().await;
        let site_rules: HashSet<Uuid> = inner
            .rules
            .iter()
            .filter(|r| r.site_id == site_id)
            .map(|r| r.id)
            .collect();
        Ok(inner
            .instances
            .iter()
            .filter(|i| i.is_active() && site_rules.contains(&i.rule_id))
            .cloned()
            .collect())
    }

    async fn create_instance(&self, instance: &AlertInstance) -> Result<bool, StoreError> {
        // ---
        let mut inner = self.inner.lock().await;
        let taken = inner.instances.iter().any(|i| {
            i.rule_id == instance.rule_id && i.stream_id == instance.stream_id && i.is_active()
        });
        if taken {
            return Ok(false);
        }
        inner.instances.push(instance.clone());
        Ok(true)
    }

    async fn touch_instance(
        &self,
        id: Uuid,
        value: f64,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        // ---
        let mut inner = self.inner.lock().await;
        if let Some(instance) = inner.instances.iter_mut().find(|i| i.id == id && i.is_active()) {
            instance.last_value = value;
            instance.last_seen_at = at;
        }
        Ok(())
    }

    async fn clear_instance(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<AlertInstance>, StoreError> {
        // ---
        let mut inner = self.inner.lock().await;
        Ok(inner
            .instances
            .iter_mut()
            .find(|i| i.id == id && i.is_active())
            .map(|i| {
                i.cleared_at = Some(at);
                i.clone()
            }))
    }

    async fn acknowledge_instance(
        &self,
        id: Uuid,
        by: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<AlertInstance>, StoreError> {
        // ---
        let mut inner = self.inner.lock().await;
        Ok(inner
            .instances
            .iter_mut()
            .find(|i| i.id == id && i.is_active() && i.acknowledged_at.is_none())
            .map(|i| {
                i.acknowledged_at = Some(at);
                i.acknowledged_by = Some(by.to_string());
                i.clone()
            }))
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::models::QualityCode;
    use chrono::{Duration, TimeZone};

    fn reading(stream_id: Uuid, message_id: Option<&str>, ts: DateTime<Utc>) -> NormalizedReading {
        // ---
        NormalizedReading {
            stream_id,
            value: 1.0,
            quality: QualityCode::Good,
            source_ts: Some(ts),
            ingested_at: ts,
            message_id: message_id.map(str::to_string),
            metadata: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn test_append_skips_conflicting_message_ids() {
        // ---
        let store = InMemoryStore::new();
        let stream = Uuid::new_v4();
        let ts = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();

        let first = store
            .append(&[reading(stream, Some("a"), ts), reading(stream, None, ts)])
            .await
            .unwrap();
        let second = store
            .append(&[reading(stream, Some("a"), ts), reading(stream, None, ts)])
            .await
            .unwrap();

        assert!(first.is_empty());
        assert_eq!(second, HashSet::from([(stream, "a".to_string())]));
        assert_eq!(store.readings(stream).await.len(), 3);
    }

    #[tokio::test]
    async fn test_failed_append_writes_nothing() {
        // ---
        let store = InMemoryStore::new();
        let stream = Uuid::new_v4();
        store.set_fail_writes(true);

        let ts = Utc::now();
        assert!(store.append(&[reading(stream, Some("a"), ts)]).await.is_err());
        assert!(store.readings(stream).await.is_empty());
    }

    #[tokio::test]
    async fn test_query_range_is_half_open_and_newest_first() {
        // ---
        let store = InMemoryStore::new();
        let stream = Uuid::new_v4();
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let batch: Vec<_> = (0..5)
            .map(|i| reading(stream, None, t0 + Duration::minutes(i)))
            .collect();
        store.append(&batch).await.unwrap();

        let rows = store
            .query_range(stream, t0, t0 + Duration::minutes(3), Some(2))
            .await
            .unwrap();
        let stamps: Vec<_> = rows.iter().map(|r| r.effective_ts()).collect();
        assert_eq!(
            stamps,
            vec![t0 + Duration::minutes(3), t0 + Duration::minutes(2)]
        );
    }

    #[tokio::test]
    async fn test_query_range_breaks_ties_by_newest_insert() {
        // ---
        let store = InMemoryStore::new();
        let stream = Uuid::new_v4();
        let ts = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let mut original = reading(stream, Some("orig"), ts);
        original.value = 20.0;
        let mut correction = reading(stream, Some("fix"), ts);
        correction.value = 5.0;
        store.append(&[original]).await.unwrap();
        store.append(&[correction]).await.unwrap();

        let rows = store
            .query_range(stream, ts - Duration::minutes(1), ts, None)
            .await
            .unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r.message_id.as_deref()).collect();
        assert_eq!(ids, vec![Some("fix"), Some("orig")]);

        let latest = store.latest(stream).await.unwrap().unwrap();
        assert_eq!(latest.value, 5.0);
    }
}
