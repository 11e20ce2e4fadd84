use std::sync::Arc;

use anyhow::Result;
use chrono::{TimeZone, Utc};
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use uuid::Uuid;

use canopy_telemetry::models::{AlertRule, RuleCondition, Severity};
use canopy_telemetry::routes::{self, AppState};
use canopy_telemetry::store::InMemoryStore;
use canopy_telemetry::{EngineSettings, LogNotifier, ManualClock, Normalizer};

// ---

struct TestServer {
    base: String,
    client: Client,
    store: Arc<InMemoryStore>,
    state: AppState,
}

/// Serve the full router on an ephemeral port.
async fn spawn_server() -> Result<TestServer> {
    // ---
    let store = Arc::new(InMemoryStore::new());
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2025, 9, 1, 12, 0, 0).unwrap(),
    ));
    let state = AppState::new(
        store.clone(),
        clock,
        Arc::new(LogNotifier),
        Normalizer::default(),
        EngineSettings::default(),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let app = routes::router(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    Ok(TestServer {
        base: format!("http://{}", addr),
        client: Client::new(),
        store,
        state,
    })
}

impl TestServer {
    // ---
    async fn register_stream(&self, site_id: Uuid, metric: &str) -> Result<Value> {
        // ---
        let resp = self
            .client
            .post(format!("{}/sites/{}/streams", self.base, site_id))
            .json(&json!({ "name": format!("{metric}-sensor"), "metric": metric }))
            .send()
            .await?;
        assert_eq!(resp.status(), StatusCode::CREATED);
        Ok(resp.json().await?)
    }
}

#[tokio::test]
async fn health_is_ok() -> Result<()> {
    // ---
    let server = spawn_server().await?;
    let body: Value = server
        .client
        .get(format!("{}/health", server.base))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(body["status"], "ok");
    Ok(())
}

#[tokio::test]
async fn ingest_then_query_readings() -> Result<()> {
    // ---
    let server = spawn_server().await?;
    let site_id = Uuid::new_v4();
    let stream = server.register_stream(site_id, "temperature").await?;
    assert_eq!(stream["canonical_unit"], "°F");
    let stream_id = stream["id"].as_str().unwrap_or_default().to_string();

    let batch = json!({
        "readings": [
            { "stream_id": stream_id, "value": 20.0, "unit": "°C",
              "source_ts": "2025-09-01T11:58:00Z", "message_id": "a" },
            { "stream_id": stream_id, "value": 21.0, "unit": "°C",
              "source_ts": "2025-09-01T11:59:00Z", "message_id": "b" },
            { "stream_id": stream_id, "value": 21.0, "unit": "°C",
              "source_ts": "2025-09-01T11:59:00Z", "message_id": "b" },
            { "stream_id": stream_id, "value": 5.0, "unit": "ppm", "message_id": "c" }
        ]
    });
    let result: Value = server
        .client
        .post(format!("{}/sites/{}/readings", server.base, site_id))
        .json(&batch)
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(result["accepted"], 2);
    assert_eq!(result["duplicates"], 1);
    assert_eq!(result["errors"][0]["index"], 3);

    // Newest first
    let readings: Vec<Value> = server
        .client
        .get(format!("{}/streams/{}/readings?limit=10", server.base, stream_id))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(readings.len(), 2);
    assert_eq!(readings[0]["message_id"], "b");
    assert_eq!(readings[0]["quality"], "good");

    let latest: Value = server
        .client
        .get(format!("{}/streams/{}/readings/latest", server.base, stream_id))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(latest["message_id"], "b");

    let range = "2025-09-01T11:57:00Z,2025-09-01T11:58:30Z";
    let filtered: Vec<Value> = server
        .client
        .get(format!(
            "{}/streams/{}/readings?timestamp_range={}",
            server.base, stream_id, range
        ))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0]["message_id"], "a");

    let bad = server
        .client
        .get(format!(
            "{}/streams/{}/readings?timestamp_range=yesterday",
            server.base, stream_id
        ))
        .send()
        .await?;
    assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn storage_outage_returns_503() -> Result<()> {
    // ---
    let server = spawn_server().await?;
    let site_id = Uuid::new_v4();
    let stream = server.register_stream(site_id, "humidity").await?;
    server.store.set_fail_writes(true);

    let resp = server
        .client
        .post(format!("{}/sites/{}/readings", server.base, site_id))
        .json(&json!({ "readings": [
            { "stream_id": stream["id"], "value": 55.0, "unit": "%" }
        ]}))
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    Ok(())
}

#[tokio::test]
async fn repoint_stream_equipment() -> Result<()> {
    // ---
    let server = spawn_server().await?;
    let site_id = Uuid::new_v4();
    let stream = server.register_stream(site_id, "ph").await?;
    let equipment = Uuid::new_v4();

    let moved: Value = server
        .client
        .put(format!("{}/streams/{}/equipment", server.base, stream["id"].as_str().unwrap()))
        .json(&json!({ "equipment_id": equipment }))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(moved["equipment_id"], equipment.to_string());
    assert_eq!(moved["metric"], "ph");

    let listed: Vec<Value> = server
        .client
        .get(format!("{}/sites/{}/streams?equipment_id={}", server.base, site_id, equipment))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(listed.len(), 1);

    let missing = server
        .client
        .put(format!("{}/streams/{}/equipment", server.base, Uuid::new_v4()))
        .json(&json!({ "equipment_id": null }))
        .send()
        .await?;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn session_lifecycle() -> Result<()> {
    // ---
    let server = spawn_server().await?;
    let resp = server
        .client
        .post(format!("{}/sessions", server.base))
        .json(&json!({
            "site_id": Uuid::new_v4(),
            "equipment_id": Uuid::new_v4(),
            "protocol": "mqtt"
        }))
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let session: Value = resp.json().await?;
    let id = session["id"].as_str().unwrap().to_string();

    let beat = server
        .client
        .post(format!("{}/sessions/{}/heartbeat", server.base, id))
        .send()
        .await?;
    assert_eq!(beat.status(), StatusCode::OK);

    let ended: Value = server
        .client
        .post(format!("{}/sessions/{}/end", server.base, id))
        .send()
        .await?
        .json()
        .await?;
    assert!(ended["ended_at"].is_string());

    let late = server
        .client
        .post(format!("{}/sessions/{}/heartbeat", server.base, id))
        .send()
        .await?;
    assert_eq!(late.status(), StatusCode::CONFLICT);

    let unknown = server
        .client
        .post(format!("{}/sessions/{}/heartbeat", server.base, Uuid::new_v4()))
        .send()
        .await?;
    assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn list_and_acknowledge_alerts() -> Result<()> {
    // ---
    let server = spawn_server().await?;
    let site_id = Uuid::new_v4();
    let stream = server.register_stream(site_id, "co2").await?;
    let stream_id: Uuid = stream["id"].as_str().unwrap().parse()?;

    let rule = AlertRule {
        id: Uuid::new_v4(),
        site_id,
        name: "CO2 high".to_string(),
        severity: Severity::Warning,
        condition: RuleCondition::ThresholdAbove { threshold: 1500.0 },
        stream_ids: vec![stream_id],
        active: true,
    };
    server.store.add_rule(rule).await;

    server
        .client
        .post(format!("{}/sites/{}/readings", server.base, site_id))
        .json(&json!({ "readings": [
            { "stream_id": stream_id, "value": 1800.0, "unit": "ppm",
              "source_ts": "2025-09-01T11:59:30Z" }
        ]}))
        .send()
        .await?;
    server.state.engine.evaluate_rules(site_id).await?;

    let active: Vec<Value> = server
        .client
        .get(format!("{}/sites/{}/alerts", server.base, site_id))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0]["severity"], "warning");
    let alert_id = active[0]["id"].as_str().unwrap().to_string();

    let acked: Value = server
        .client
        .post(format!("{}/alerts/{}/acknowledge", server.base, alert_id))
        .json(&json!({ "by": "night-shift" }))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(acked["acknowledged_by"], "night-shift");
    assert!(acked["cleared_at"].is_null());

    let unknown = server
        .client
        .post(format!("{}/alerts/{}/acknowledge", server.base, Uuid::new_v4()))
        .json(&json!({ "by": "night-shift" }))
        .send()
        .await?;
    assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
    Ok(())
}
