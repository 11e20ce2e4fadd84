//! Idempotency for at-least-once delivery.
//!
//! Only readings carrying a provider message id take part; a reading
//! without one is never a duplicate. The checks here are a fast path that
//! keeps known duplicates out of the flush. The authoritative guarantee is
//! the `(stream_id, message_id)` uniqueness guard in the store, which
//! resolves batches racing past this check.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::NormalizedReading;
use crate::store::{with_timeout, ReadingStore};

// ---

/// Result of [`Deduplicator::deduplicate_batch`].
#[derive(Debug, Default)]
pub struct DedupOutcome {
    /// Readings still to be stored, in their original order.
    pub survivors: Vec<NormalizedReading>,
    /// Readings dropped as repeats, within the batch or of stored rows.
    pub removed: usize,
}

pub struct Deduplicator {
    store: Arc<dyn ReadingStore>,
    timeout: Duration,
}

impl Deduplicator {
    // ---
    pub fn new(store: Arc<dyn ReadingStore>, timeout: Duration) -> Self {
        Deduplicator { store, timeout }
    }

    /// Whether `(stream_id, message_id)` was already accepted.
    pub async fn is_duplicate(
        &self,
        stream_id: Uuid,
        message_id: Option<&str>,
    ) -> Result<bool, StoreError> {
        // ---
        let Some(message_id) = message_id else {
            return Ok(false);
        };

        let found = self
            .get_duplicates(stream_id, &[message_id.to_string()])
            .await?;
        Ok(!found.is_empty())
    }

    /// The subset of `message_ids` already stored for `stream_id`.
    pub async fn get_duplicates(
        &self,
        stream_id: Uuid,
        message_ids: &[String],
    ) -> Result<HashSet<String>, StoreError> {
        // ---
        let candidates = HashMap::from([(stream_id, message_ids.to_vec())]);
        let found = self.get_duplicates_by_stream(&candidates).await?;
        Ok(found.into_iter().map(|(_, message_id)| message_id).collect())
    }

    /// Multi-stream variant of [`Self::get_duplicates`]: one storage call
    /// for any number of streams.
    pub async fn get_duplicates_by_stream(
        &self,
        candidates: &HashMap<Uuid, Vec<String>>,
    ) -> Result<HashSet<(Uuid, String)>, StoreError> {
        // ---
        if candidates.values().all(Vec::is_empty) {
            return Ok(HashSet::new());
        }
        with_timeout(self.timeout, self.store.existing_message_ids(candidates)).await
    }

    /// Drop repeats within `readings` and readings already stored.
    /// The first occurrence of a key in the batch wins.
    pub async fn deduplicate_batch(
        &self,
        readings: Vec<NormalizedReading>,
    ) -> Result<DedupOutcome, StoreError> {
        // ---
        let (unique, in_batch) = strip_in_batch_repeats(readings);

        let mut candidates: HashMap<Uuid, Vec<String>> = HashMap::new();
        for (stream_id, message_id) in unique.iter().filter_map(|r| r.dedup_key()) {
            candidates
                .entry(stream_id)
                .or_default()
                .push(message_id.to_string());
        }
        let stored = self.get_duplicates_by_stream(&candidates).await?;

        let before = unique.len();
        let survivors: Vec<NormalizedReading> = unique
            .into_iter()
            .filter(|r| match r.dedup_key() {
                Some((stream_id, message_id)) => {
                    !stored.contains(&(stream_id, message_id.to_string()))
                }
                None => true,
            })
            .collect();
        let against_store = before - survivors.len();

        debug!(
            "Dedup removed {} in-batch and {} stored repeats, {} survivors",
            in_batch,
            against_store,
            survivors.len()
        );

        Ok(DedupOutcome {
            survivors,
            removed: in_batch + against_store,
        })
    }
}

/// Keep the first reading for each message key; readings without a
/// message id always pass. Returns survivors and the number removed.
fn strip_in_batch_repeats(readings: Vec<NormalizedReading>) -> (Vec<NormalizedReading>, usize) {
    // ---
    let mut seen: HashSet<(Uuid, String)> = HashSet::new();
    let mut removed = 0;

    let kept = readings
        .into_iter()
        .filter(|r| match r.dedup_key() {
            Some((stream_id, message_id)) => {
                let first = seen.insert((stream_id, message_id.to_string()));
                if !first {
                    removed += 1;
                }
                first
            }
            None => true,
        })
        .collect();

    (kept, removed)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::models::QualityCode;
    use crate::store::InMemoryStore;
    use chrono::Utc;

    fn reading(stream_id: Uuid, message_id: Option<&str>, value: f64) -> NormalizedReading {
        // ---
        NormalizedReading {
            stream_id,
            value,
            quality: QualityCode::Good,
            source_ts: None,
            ingested_at: Utc::now(),
            message_id: message_id.map(str::to_string),
            metadata: serde_json::Value::Null,
        }
    }

    fn dedup(store: Arc<InMemoryStore>) -> Deduplicator {
        Deduplicator::new(store, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_missing_message_id_is_never_duplicate() {
        // ---
        let store = Arc::new(InMemoryStore::new());
        let stream = Uuid::new_v4();
        store.append(&[reading(stream, None, 1.0)]).await.unwrap();

        assert!(!dedup(store).is_duplicate(stream, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_stored_message_id_is_duplicate() {
        // ---
        let store = Arc::new(InMemoryStore::new());
        let stream = Uuid::new_v4();
        store.append(&[reading(stream, Some("m-1"), 1.0)]).await.unwrap();

        let d = dedup(store);
        assert!(d.is_duplicate(stream, Some("m-1")).await.unwrap());
        assert!(!d.is_duplicate(stream, Some("m-2")).await.unwrap());
        // Same message id on a different stream is a different reading
        assert!(!d.is_duplicate(Uuid::new_v4(), Some("m-1")).await.unwrap());
    }

    #[tokio::test]
    async fn test_batch_catches_in_batch_and_stored_repeats() {
        // ---
        let store = Arc::new(InMemoryStore::new());
        let stream = Uuid::new_v4();
        store.append(&[reading(stream, Some("old"), 1.0)]).await.unwrap();

        let batch = vec![
            reading(stream, Some("old"), 1.0),
            reading(stream, Some("new"), 2.0),
            reading(stream, Some("new"), 3.0),
            reading(stream, None, 4.0),
            reading(stream, None, 5.0),
        ];
        let outcome = dedup(store).deduplicate_batch(batch).await.unwrap();

        assert_eq!(outcome.removed, 2);
        let values: Vec<f64> = outcome.survivors.iter().map(|r| r.value).collect();
        assert_eq!(values, vec![2.0, 4.0, 5.0]);
    }

    #[tokio::test]
    async fn test_duplicates_by_stream() {
        // ---
        let store = Arc::new(InMemoryStore::new());
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        store
            .append(&[reading(a, Some("x"), 1.0), reading(b, Some("y"), 1.0)])
            .await
            .unwrap();

        let candidates = HashMap::from([
            (a, vec!["x".to_string(), "y".to_string()]),
            (b, vec!["x".to_string(), "y".to_string()]),
        ]);
        let found = dedup(store).get_duplicates_by_stream(&candidates).await.unwrap();

        assert_eq!(
            found,
            HashSet::from([(a, "x".to_string()), (b, "y".to_string())])
        );
    }

    #[tokio::test]
    async fn test_get_duplicates_for_one_stream() {
        // ---
        let store = Arc::new(InMemoryStore::new());
        let stream = Uuid::new_v4();
        store
            .append(&[reading(stream, Some("a"), 1.0), reading(stream, Some("c"), 1.0)])
            .await
            .unwrap();

        let ids: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let found = dedup(store).get_duplicates(stream, &ids).await.unwrap();
        assert_eq!(found, HashSet::from(["a".to_string(), "c".to_string()]));
    }
}
