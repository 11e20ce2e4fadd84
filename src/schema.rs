//! Database schema management for `canopy-telemetry`.
//!
//! Ensures required tables and indexes exist before serving requests.
//! Applied once on startup from `main.rs` (EMBP: single gateway call).

use anyhow::Result;
use sqlx::PgPool;

// ---

const STATEMENTS: &[&str] = &[
    // Stream directory. `metric` is never updated after insert.
    r#"
    CREATE TABLE IF NOT EXISTS sensor_streams (
        id             UUID PRIMARY KEY,
        site_id        UUID        NOT NULL,
        equipment_id   UUID,
        name           TEXT        NOT NULL,
        metric         TEXT        NOT NULL,
        canonical_unit TEXT        NOT NULL,
        created_at     TIMESTAMPTZ NOT NULL
    );
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_sensor_streams_site
        ON sensor_streams (site_id, equipment_id);
    "#,
    // Normalized readings, append-only. NULL message ids never conflict.
    r#"
    CREATE TABLE IF NOT EXISTS sensor_readings (
        id           BIGSERIAL PRIMARY KEY,
        stream_id    UUID             NOT NULL REFERENCES sensor_streams (id),
        value        DOUBLE PRECISION NOT NULL,
        quality      TEXT             NOT NULL,
        source_ts    TIMESTAMPTZ,
        ingested_at  TIMESTAMPTZ      NOT NULL,
        effective_ts TIMESTAMPTZ      NOT NULL,
        message_id   TEXT,
        metadata     JSONB            NOT NULL DEFAULT '{}'::jsonb,
        UNIQUE (stream_id, message_id)
    );
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_sensor_readings_stream_ts
        ON sensor_readings (stream_id, effective_ts DESC);
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ingestion_sessions (
        id                UUID PRIMARY KEY,
        site_id           UUID        NOT NULL,
        equipment_id      UUID        NOT NULL,
        protocol          TEXT        NOT NULL,
        started_at        TIMESTAMPTZ NOT NULL,
        last_heartbeat_at TIMESTAMPTZ NOT NULL,
        ended_at          TIMESTAMPTZ
    );
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_ingestion_sessions_open
        ON ingestion_sessions (last_heartbeat_at) WHERE ended_at IS NULL;
    "#,
    // Rule condition is the JSON form of `RuleCondition`.
    r#"
    CREATE TABLE IF NOT EXISTS alert_rules (
        id         UUID PRIMARY KEY,
        site_id    UUID    NOT NULL,
        name       TEXT    NOT NULL,
        severity   TEXT    NOT NULL,
        condition  JSONB   NOT NULL,
        stream_ids UUID[]  NOT NULL,
        active     BOOLEAN NOT NULL DEFAULT TRUE
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS alert_instances (
        id               UUID PRIMARY KEY,
        rule_id          UUID             NOT NULL REFERENCES alert_rules (id),
        stream_id        UUID             NOT NULL,
        severity         TEXT             NOT NULL,
        message          TEXT             NOT NULL,
        triggering_value DOUBLE PRECISION NOT NULL,
        threshold_value  DOUBLE PRECISION NOT NULL,
        last_value       DOUBLE PRECISION NOT NULL,
        last_seen_at     TIMESTAMPTZ      NOT NULL,
        fired_at         TIMESTAMPTZ      NOT NULL,
        cleared_at       TIMESTAMPTZ,
        acknowledged_at  TIMESTAMPTZ,
        acknowledged_by  TEXT
    );
    "#,
    // Older deployments carried a separate kind column next to `condition`.
    r#"
    ALTER TABLE alert_rules DROP COLUMN IF EXISTS rule_type;
    "#,
    // At most one active instance per (rule, stream).
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS uq_alert_instances_active
        ON alert_instances (rule_id, stream_id) WHERE cleared_at IS NULL;
    "#,
];

/// Create or update the database schema (idempotent).
///
/// Safe to call on every startup; no-op if objects already exist.
/// Errors are propagated if any SQL execution fails.
pub async fn create_schema(pool: &PgPool) -> Result<()> {
    // ---
    let mut tx = pool.begin().await?;

    for statement in STATEMENTS {
        sqlx::query(statement).execute(&mut *tx).await?;
    }

    tx.commit().await?;
    tracing::debug!("Schema ensured ({} statements)", STATEMENTS.len());
    Ok(())
}
