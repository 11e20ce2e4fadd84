//! Ingestion pipeline: resolve, normalize, deduplicate, flush.
//!
//! One bad reading never blocks the rest of its batch. Validation
//! failures become per-reading errors, duplicates are counted, and only a
//! storage failure fails the batch as a whole. In that case nothing from
//! the batch is persisted.

use std::collections::HashSet;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use serde::{Serialize, Serializer};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::clock::Clock;
use crate::dedup::Deduplicator;
use crate::error::{IngestError, ReadingRejection};
use crate::models::{NormalizedReading, RawReading};
use crate::normalizer::Normalizer;
use crate::notify::{publish, Notifier, TelemetryEvent};
use crate::store::{with_timeout, ReadingStore, StreamDirectory};

pub mod session;

pub use session::SessionManager;

// ---

/// Why one reading of a batch was not accepted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReadingError {
    /// Position of the reading in the submitted batch.
    pub index: usize,
    pub stream_id: Uuid,
    #[serde(serialize_with = "as_display")]
    pub reason: ReadingRejection,
}

fn as_display<T: Display, S: Serializer>(value: &T, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

/// Outcome of one [`IngestionPipeline::ingest_batch`] call.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IngestResult {
    pub accepted: usize,
    pub duplicates: usize,
    pub errors: Vec<ReadingError>,
}

pub struct IngestionPipeline {
    directory: Arc<dyn StreamDirectory>,
    readings: Arc<dyn ReadingStore>,
    dedup: Deduplicator,
    normalizer: Normalizer,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
    timeout: Duration,
}

impl IngestionPipeline {
    // ---
    pub fn new(
        directory: Arc<dyn StreamDirectory>,
        readings: Arc<dyn ReadingStore>,
        normalizer: Normalizer,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn Notifier>,
        timeout: Duration,
    ) -> Self {
        // ---
        IngestionPipeline {
            dedup: Deduplicator::new(readings.clone(), timeout),
            directory,
            readings,
            normalizer,
            clock,
            notifier,
            timeout,
        }
    }

    /// Normalize and store a batch of raw readings for `site_id`.
    ///
    /// Input order is preserved among the stored readings. Returns `Err`
    /// only for storage failures, which leave nothing from the batch
    /// persisted and are safe to retry.
    #[instrument(skip(self, raw), fields(batch = raw.len()))]
    pub async fn ingest_batch(
        &self,
        site_id: Uuid,
        raw: Vec<RawReading>,
    ) -> Result<IngestResult, IngestError> {
        // ---
        let mut result = IngestResult::default();
        if raw.is_empty() {
            return Ok(result);
        }

        // Step 1: Resolve every referenced stream in one lookup
        let ids: Vec<Uuid> = raw
            .iter()
            .map(|r| r.stream_id)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let streams = with_timeout(self.timeout, self.directory.get_streams(&ids))
            .await
            .map_err(IngestError::Directory)?;

        // Step 2: Normalize, collecting per-reading failures
        let now = self.clock.now();
        let mut normalized = Vec::with_capacity(raw.len());

        for (index, reading) in raw.iter().enumerate() {
            let outcome = match streams.get(&reading.stream_id) {
                None => Err(ReadingRejection::UnknownStream(reading.stream_id)),
                Some(stream) if stream.site_id != site_id => {
                    Err(ReadingRejection::WrongSite(reading.stream_id))
                }
                Some(stream) => self
                    .normalizer
                    .normalize(reading, stream, now)
                    .map_err(ReadingRejection::from),
            };

            match outcome {
                Ok(n) => normalized.push(n),
                Err(reason) => {
                    debug!("Rejected reading {} for stream {}: {}", index, reading.stream_id, reason);
                    result.errors.push(ReadingError {
                        index,
                        stream_id: reading.stream_id,
                        reason,
                    });
                }
            }
        }

        // Step 3: Strip duplicates, in-batch and against stored readings
        let outcome = self
            .dedup
            .deduplicate_batch(normalized)
            .await
            .map_err(IngestError::Dedup)?;
        result.duplicates = outcome.removed;

        // Step 4: Flush survivors as one all-or-nothing write
        let stored = self.flush(outcome.survivors).await?;
        result.duplicates += stored.raced;
        result.accepted = stored.readings.len();

        info!(
            "Ingested batch for site {}: accepted={} duplicates={} errors={}",
            site_id,
            result.accepted,
            result.duplicates,
            result.errors.len()
        );

        if !stored.readings.is_empty() {
            publish(
                self.notifier.as_ref(),
                TelemetryEvent::ReadingsAccepted {
                    site_id,
                    readings: stored.readings,
                },
            )
            .await;
        }

        Ok(result)
    }

    async fn flush(&self, survivors: Vec<NormalizedReading>) -> Result<Flushed, IngestError> {
        // ---
        if survivors.is_empty() {
            return Ok(Flushed::default());
        }

        let refused = with_timeout(self.timeout, self.readings.append(&survivors))
            .await
            .map_err(IngestError::Flush)?;

        if refused.is_empty() {
            return Ok(Flushed {
                readings: survivors,
                raced: 0,
            });
        }

        // Another batch stored these keys between our check and our write
        debug!("{} readings lost a race to a concurrent batch", refused.len());
        let readings: Vec<NormalizedReading> = survivors
            .into_iter()
            .filter(|r| match r.dedup_key() {
                Some((stream_id, message_id)) => {
                    !refused.contains(&(stream_id, message_id.to_string()))
                }
                None => true,
            })
            .collect();

        Ok(Flushed {
            readings,
            raced: refused.len(),
        })
    }
}

#[derive(Default)]
struct Flushed {
    readings: Vec<NormalizedReading>,
    raced: usize,
}
