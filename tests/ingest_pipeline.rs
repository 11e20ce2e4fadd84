use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use tokio_test::assert_ok;
use uuid::Uuid;

use canopy_telemetry::models::{MetricType, QualityCode, RawReading, SensorStream};
use canopy_telemetry::notify::LogNotifier;
use canopy_telemetry::store::{InMemoryStore, StreamDirectory};
use canopy_telemetry::{IngestionPipeline, ManualClock, Normalizer};

// ---

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 4, 2, 6, 30, 0).unwrap()
}

fn pipeline(store: &Arc<InMemoryStore>) -> IngestionPipeline {
    // ---
    IngestionPipeline::new(
        store.clone(),
        store.clone(),
        Normalizer::default(),
        Arc::new(ManualClock::new(t0())),
        Arc::new(LogNotifier),
        Duration::from_secs(1),
    )
}

async fn temperature_stream(store: &InMemoryStore) -> SensorStream {
    // ---
    let stream = SensorStream::new(Uuid::new_v4(), None, "dry-room", MetricType::Temperature, t0());
    store.insert_stream(&stream).await.unwrap();
    stream
}

fn raw(stream: &SensorStream, value: f64, unit: &str, message_id: &str) -> RawReading {
    // ---
    RawReading {
        stream_id: stream.id,
        value,
        unit: unit.to_string(),
        source_ts: Some(t0() - ChronoDuration::seconds(5)),
        ingested_at: t0(),
        message_id: Some(message_id.to_string()),
        metadata: serde_json::json!({ "gateway": "gw-7" }),
    }
}

#[tokio::test]
async fn freezing_point_is_stored_as_good() -> Result<()> {
    // ---
    let store = Arc::new(InMemoryStore::new());
    let stream = temperature_stream(&store).await;

    let result = assert_ok!(
        pipeline(&store)
            .ingest_batch(stream.site_id, vec![raw(&stream, 32.0, "°F", "m-1")])
            .await
    );
    assert_eq!(result.accepted, 1);

    let stored = store.readings(stream.id).await;
    assert_eq!(stored[0].value, 32.0);
    assert_eq!(stored[0].quality, QualityCode::Good);
    assert_eq!(stored[0].metadata["gateway"], "gw-7");
    Ok(())
}

#[tokio::test]
async fn out_of_range_is_stored_as_bad() -> Result<()> {
    // ---
    let store = Arc::new(InMemoryStore::new());
    let stream = temperature_stream(&store).await;

    let result = pipeline(&store)
        .ingest_batch(stream.site_id, vec![raw(&stream, 200.0, "°F", "m-1")])
        .await?;
    assert_eq!(result.accepted, 1);
    assert!(result.errors.is_empty());

    let stored = store.readings(stream.id).await;
    assert_eq!(stored[0].value, 200.0);
    assert_eq!(stored[0].quality, QualityCode::BadOutOfRange);
    Ok(())
}

#[tokio::test]
async fn celsius_is_converted_to_canonical() -> Result<()> {
    // ---
    let store = Arc::new(InMemoryStore::new());
    let stream = temperature_stream(&store).await;

    pipeline(&store)
        .ingest_batch(stream.site_id, vec![raw(&stream, 25.0, "°C", "m-1")])
        .await?;

    let stored = store.readings(stream.id).await;
    assert!((stored[0].value - 77.0).abs() < 1e-9);
    Ok(())
}

#[tokio::test]
async fn resubmitting_a_batch_is_idempotent() -> Result<()> {
    // ---
    let store = Arc::new(InMemoryStore::new());
    let stream = temperature_stream(&store).await;
    let pipeline = pipeline(&store);

    let batch = vec![
        raw(&stream, 70.0, "°F", "m-1"),
        raw(&stream, 71.0, "°F", "m-2"),
        // Repeated inside the batch
        raw(&stream, 70.0, "°F", "m-1"),
    ];

    let first = pipeline.ingest_batch(stream.site_id, batch.clone()).await?;
    assert_eq!(first.accepted, 2);
    assert_eq!(first.duplicates, 1);

    let second = pipeline.ingest_batch(stream.site_id, batch).await?;
    assert_eq!(second.accepted, 0);
    assert_eq!(second.duplicates, 3);
    assert!(second.errors.is_empty());

    assert_eq!(store.readings(stream.id).await.len(), 2);
    Ok(())
}

#[tokio::test]
async fn readings_without_message_id_are_never_duplicates() -> Result<()> {
    // ---
    let store = Arc::new(InMemoryStore::new());
    let stream = temperature_stream(&store).await;

    let mut reading = raw(&stream, 68.0, "°F", "unused");
    reading.message_id = None;

    let result = pipeline(&store)
        .ingest_batch(stream.site_id, vec![reading.clone(), reading])
        .await?;
    assert_eq!(result.accepted, 2);
    assert_eq!(result.duplicates, 0);
    Ok(())
}

#[tokio::test]
async fn racing_batches_store_each_message_once() -> Result<()> {
    // ---
    let store = Arc::new(InMemoryStore::new());
    let stream = temperature_stream(&store).await;
    let (left, right) = (pipeline(&store), pipeline(&store));

    let batch: Vec<RawReading> = (0..50)
        .map(|i| raw(&stream, 60.0 + i as f64 * 0.1, "°F", &format!("m-{i}")))
        .collect();

    let (a, b) = tokio::join!(
        left.ingest_batch(stream.site_id, batch.clone()),
        right.ingest_batch(stream.site_id, batch)
    );
    let (a, b) = (a?, b?);

    assert_eq!(a.accepted + b.accepted, 50);
    assert_eq!(a.duplicates + b.duplicates, 50);
    assert_eq!(store.readings(stream.id).await.len(), 50);
    Ok(())
}

#[tokio::test]
async fn future_timestamp_is_flagged() -> Result<()> {
    // ---
    let store = Arc::new(InMemoryStore::new());
    let stream = temperature_stream(&store).await;

    let mut reading = raw(&stream, 500.0, "°F", "m-1");
    reading.source_ts = Some(t0() + ChronoDuration::minutes(10));

    pipeline(&store).ingest_batch(stream.site_id, vec![reading]).await?;

    // Out of range as well, the future timestamp wins
    let stored = store.readings(stream.id).await;
    assert_eq!(stored[0].quality, QualityCode::BadFutureTimestamp);
    Ok(())
}
