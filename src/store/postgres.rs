//! PostgreSQL backend.
//!
//! Uniqueness guarantees live in the schema (see `schema.rs`), not here:
//! `UNIQUE (stream_id, message_id)` on readings and a partial unique index
//! on active alert instances. Racing writers are resolved by
//! `ON CONFLICT DO NOTHING` and conditional `UPDATE ... WHERE`.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use super::{AlertStore, ReadingStore, SessionStore, StreamDirectory};
use crate::error::StoreError;
use crate::models::{
    AlertInstance, AlertRule, IngestionSession, NormalizedReading, RuleCondition, SensorStream,
};

// ---

/// Rows per INSERT statement; keeps bind parameters under the protocol
/// limit of 65535.
const APPEND_CHUNK: usize = 4_000;

const READING_COLUMNS: &str =
    "stream_id, value, quality, source_ts, ingested_at, message_id, metadata";

/// Columns of `alert_rules` that map onto [`RuleRow`]. The rule kind lives
/// in the `condition` JSON tag.
pub(crate) const RULE_COLUMNS: &str = "id, site_id, name, severity, condition, stream_ids, active";

const INSTANCE_COLUMNS: &str = "id, rule_id, stream_id, severity, message, triggering_value, \
     threshold_value, last_value, last_seen_at, fired_at, cleared_at, acknowledged_at, \
     acknowledged_by";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    // ---
    pub fn new(pool: PgPool) -> Self {
        PgStore { pool }
    }
}

#[derive(sqlx::FromRow)]
struct StreamRow {
    id: Uuid,
    site_id: Uuid,
    equipment_id: Option<Uuid>,
    name: String,
    metric: String,
    canonical_unit: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<StreamRow> for SensorStream {
    type Error = StoreError;

    fn try_from(row: StreamRow) -> Result<Self, Self::Error> {
        // ---
        Ok(SensorStream {
            id: row.id,
            site_id: row.site_id,
            equipment_id: row.equipment_id,
            name: row.name,
            metric: row.metric.parse()?,
            canonical_unit: row.canonical_unit.parse()?,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ReadingRow {
    stream_id: Uuid,
    value: f64,
    quality: String,
    source_ts: Option<DateTime<Utc>>,
    ingested_at: DateTime<Utc>,
    message_id: Option<String>,
    metadata: serde_json::Value,
}

impl TryFrom<ReadingRow> for NormalizedReading {
    type Error = StoreError;

    fn try_from(row: ReadingRow) -> Result<Self, Self::Error> {
        // ---
        Ok(NormalizedReading {
            stream_id: row.stream_id,
            value: row.value,
            quality: row.quality.parse()?,
            source_ts: row.source_ts,
            ingested_at: row.ingested_at,
            message_id: row.message_id,
            metadata: row.metadata,
        })
    }
}

#[derive(sqlx::FromRow)]
struct RuleRow {
    id: Uuid,
    site_id: Uuid,
    name: String,
    severity: String,
    condition: Json<RuleCondition>,
    stream_ids: Vec<Uuid>,
    active: bool,
}

impl TryFrom<RuleRow> for AlertRule {
    type Error = StoreError;

    fn try_from(row: RuleRow) -> Result<Self, Self::Error> {
        // ---
        Ok(AlertRule {
            id: row.id,
            site_id: row.site_id,
            name: row.name,
            severity: row.severity.parse()?,
            condition: row.condition.0,
            stream_ids: row.stream_ids,
            active: row.active,
        })
    }
}

#[derive(sqlx::FromRow)]
struct InstanceRow {
    id: Uuid,
    rule_id: Uuid,
    stream_id: Uuid,
    severity: String,
    message: String,
    triggering_value: f64,
    threshold_value: f64,
    last_value: f64,
    last_seen_at: DateTime<Utc>,
    fired_at: DateTime<Utc>,
    cleared_at: Option<DateTime<Utc>>,
    acknowledged_at: Option<DateTime<Utc>>,
    acknowledged_by: Option<String>,
}

impl TryFrom<InstanceRow> for AlertInstance {
    type Error = StoreError;

    fn try_from(row: InstanceRow) -> Result<Self, Self::Error> {
        // ---
        Ok(AlertInstance {
            id: row.id,
            rule_id: row.rule_id,
            stream_id: row.stream_id,
            severity: row.severity.parse()?,
            message: row.message,
            triggering_value: row.triggering_value,
            threshold_value: row.threshold_value,
            last_value: row.last_value,
            last_seen_at: row.last_seen_at,
            fired_at: row.fired_at,
            cleared_at: row.cleared_at,
            acknowledged_at: row.acknowledged_at,
            acknowledged_by: row.acknowledged_by,
        })
    }
}

fn convert_all<R, T>(rows: Vec<R>) -> Result<Vec<T>, StoreError>
where
    T: TryFrom<R, Error = StoreError>,
{
    rows.into_iter().map(T::try_from).collect()
}

#[async_trait]
impl StreamDirectory for PgStore {
    // ---
    async fn get_streams(&self, ids: &[Uuid]) -> Result<HashMap<Uuid, SensorStream>, StoreError> {
        // ---
        let rows: Vec<StreamRow> =
            sqlx::query_as("SELECT * FROM sensor_streams WHERE id = ANY($1)")
                .bind(ids)
                .fetch_all(&self.pool)
                .await?;

        let streams: Vec<SensorStream> = convert_all(rows)?;
        Ok(streams.into_iter().map(|s| (s.id, s)).collect())
    }

    async fn list_streams(
        &self,
        site_id: Uuid,
        equipment_id: Option<Uuid>,
    ) -> Result<Vec<SensorStream>, StoreError> {
        // ---
        let rows: Vec<StreamRow> = sqlx::query_as(
            r#"
            SELECT * FROM sensor_streams
            WHERE site_id = $1 AND ($2::uuid IS NULL OR equipment_id = $2)
            ORDER BY name
            "#,
        )
        .bind(site_id)
        .bind(equipment_id)
        .fetch_all(&self.pool)
        .await?;

        convert_all(rows)
    }

    async fn insert_stream(&self, stream: &SensorStream) -> Result<(), StoreError> {
        // ---
        sqlx::query(
            r#"
            INSERT INTO sensor_streams (
                id, site_id, equipment_id, name, metric, canonical_unit, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(stream.id)
        .bind(stream.site_id)
        .bind(stream.equipment_id)
        .bind(&stream.name)
        .bind(stream.metric.as_str())
        .bind(stream.canonical_unit.symbol())
        .bind(stream.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_equipment(
        &self,
        stream_id: Uuid,
        equipment_id: Option<Uuid>,
    ) -> Result<Option<SensorStream>, StoreError> {
        // ---
        let row: Option<StreamRow> = sqlx::query_as(
            "UPDATE sensor_streams SET equipment_id = $2 WHERE id = $1 RETURNING *",
        )
        .bind(stream_id)
        .bind(equipment_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(SensorStream::try_from).transpose()
    }
}

#[async_trait]
impl ReadingStore for PgStore {
    // ---
    async fn existing_message_ids(
        &self,
        candidates: &HashMap<Uuid, Vec<String>>,
    ) -> Result<HashSet<(Uuid, String)>, StoreError> {
        // ---
        let (stream_ids, message_ids): (Vec<Uuid>, Vec<String>) = candidates
            .iter()
            .flat_map(|(stream_id, ids)| ids.iter().map(move |id| (*stream_id, id.clone())))
            .unzip();

        if stream_ids.is_empty() {
            return Ok(HashSet::new());
        }

        let rows: Vec<(Uuid, String)> = sqlx::query_as(
            r#"
            SELECT r.stream_id, r.message_id
            FROM sensor_readings r
            JOIN UNNEST($1::uuid[], $2::text[]) AS c(stream_id, message_id)
              ON r.stream_id = c.stream_id AND r.message_id = c.message_id
            "#,
        )
        .bind(&stream_ids)
        .bind(&message_ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().collect())
    }

    async fn append(
        &self,
        readings: &[NormalizedReading],
    ) -> Result<HashSet<(Uuid, String)>, StoreError> {
        // ---
        let mut refused = HashSet::new();
        if readings.is_empty() {
            return Ok(refused);
        }

        let mut tx = self.pool.begin().await?;

        for chunk in readings.chunks(APPEND_CHUNK) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO sensor_readings (stream_id, value, quality, source_ts, \
                 ingested_at, effective_ts, message_id, metadata) ",
            );
            qb.push_values(chunk, |mut row, r| {
                row.push_bind(r.stream_id)
                    .push_bind(r.value)
                    .push_bind(r.quality.as_str())
                    .push_bind(r.source_ts)
                    .push_bind(r.ingested_at)
                    .push_bind(r.effective_ts())
                    .push_bind(r.message_id.as_deref())
                    .push_bind(&r.metadata);
            });
            qb.push(" ON CONFLICT (stream_id, message_id) DO NOTHING");
            qb.push(" RETURNING stream_id, message_id");

            let inserted: HashSet<(Uuid, String)> = qb
                .build_query_as::<(Uuid, Option<String>)>()
                .fetch_all(&mut *tx)
                .await?
                .into_iter()
                .filter_map(|(stream_id, message_id)| message_id.map(|m| (stream_id, m)))
                .collect();

            refused.extend(
                chunk
                    .iter()
                    .filter_map(|r| r.dedup_key())
                    .map(|(stream_id, message_id)| (stream_id, message_id.to_string()))
                    .filter(|key| !inserted.contains(key)),
            );
        }

        tx.commit().await?;
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
        let sql = format!(
            "SELECT {READING_COLUMNS} FROM sensor_readings \
             WHERE stream_id = $1 AND effective_ts > $2 AND effective_ts <= $3 \
             ORDER BY effective_ts DESC, id DESC LIMIT $4"
        );
        let rows: Vec<ReadingRow> = sqlx::query_as(&sql)
            .bind(stream_id)
            .bind(from)
            .bind(to)
            .bind(limit.map(i64::from))
            .fetch_all(&self.pool)
            .await?;

        convert_all(rows)
    }

    async fn latest(&self, stream_id: Uuid) -> Result<Option<NormalizedReading>, StoreError> {
        // ---
        let sql = format!(
            "SELECT {READING_COLUMNS} FROM sensor_readings WHERE stream_id = $1 \
             ORDER BY effective_ts DESC, id DESC LIMIT 1"
        );
        let row: Option<ReadingRow> = sqlx::query_as(&sql)
            .bind(stream_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(NormalizedReading::try_from).transpose()
    }
}

#[async_trait]
impl SessionStore for PgStore {
    // ---
    async fn insert_session(&self, session: &IngestionSession) -> Result<(), StoreError> {
        // ---
        sqlx::query(
            r#"
            INSERT INTO ingestion_sessions (
                id, site_id, equipment_id, protocol, started_at, last_heartbeat_at, ended_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(session.id)
        .bind(session.site_id)
        .bind(session.equipment_id)
        .bind(&session.protocol)
        .bind(session.started_at)
        .bind(session.last_heartbeat_at)
        .bind(session.ended_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<IngestionSession>, StoreError> {
        // ---
        Ok(
            sqlx::query_as("SELECT * FROM ingestion_sessions WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn touch_session(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<IngestionSession>, StoreError> {
        // ---
        Ok(sqlx::query_as(
            r#"
            UPDATE ingestion_sessions
            SET last_heartbeat_at = GREATEST(last_heartbeat_at, $2)
            WHERE id = $1 AND ended_at IS NULL
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn close_session(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<IngestionSession>, StoreError> {
        // ---
        Ok(sqlx::query_as(
            r#"
            UPDATE ingestion_sessions SET ended_at = $2
            WHERE id = $1 AND ended_at IS NULL
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn close_stale_sessions(
        &self,
        cutoff: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, StoreError> {
        // ---
        Ok(sqlx::query_scalar(
            r#"
            UPDATE ingestion_sessions SET ended_at = $2
            WHERE ended_at IS NULL AND last_heartbeat_at < $1
            RETURNING id
            "#,
        )
        .bind(cutoff)
        .bind(at)
        .fetch_all(&self.pool)
        .await?)
    }
}

#[async_trait]
impl AlertStore for PgStore {
    // ---
    async fn sites_with_active_rules(&self) -> Result<Vec<Uuid>, StoreError> {
        // ---
        Ok(sqlx::query_scalar(
            "SELECT DISTINCT site_id FROM alert_rules WHERE active ORDER BY site_id",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    async fn active_rules(&self, site_id: Uuid) -> Result<Vec<AlertRule>, StoreError> {
        // ---
        let sql = format!(
            "SELECT {RULE_COLUMNS} FROM alert_rules WHERE site_id = $1 AND active ORDER BY name"
        );
        let rows: Vec<RuleRow> = sqlx::query_as(&sql)
            .bind(site_id)
            .fetch_all(&self.pool)
            .await?;

        convert_all(rows)
    }

    async fn active_instance(
        &self,
        rule_id: Uuid,
        stream_id: Uuid,
    ) -> Result<Option<AlertInstance>, StoreError> {
        // ---
        let sql = format!(
            "SELECT {INSTANCE_COLUMNS} FROM alert_instances \
             WHERE rule_id = $1 AND stream_id = $2 AND cleared_at IS NULL"
        );
        let row: Option<InstanceRow> = sqlx::query_as(&sql)
            .bind(rule_id)
            .bind(stream_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(AlertInstance::try_from).transpose()
    }

    async fn get_instance(&self, id: Uuid) -> Result<Option<AlertInstance>, StoreError> {
        // ---
        let sql = format!("SELECT {INSTANCE_COLUMNS} FROM alert_instances WHERE id = $1");
        let row: Option<InstanceRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(AlertInstance::try_from).transpose()
    }

    async fn active_instances(&self, site_id: Uuid) -> Result<Vec<AlertInstance>, StoreError> {
        // ---
        let rows: Vec<InstanceRow> = sqlx::query_as(
            r#"
            SELECT i.id, i.rule_id, i.stream_id, i.severity, i.message, i.triggering_value,
                   i.threshold_value, i.last_value, i.last_seen_at, i.fired_at, i.cleared_at,
                   i.acknowledged_at, i.acknowledged_by
            FROM alert_instances i
            JOIN alert_rules r ON r.id = i.rule_id
            WHERE r.site_id = $1 AND i.cleared_at IS NULL
            ORDER BY i.fired_at DESC
            "#,
        )
        .bind(site_id)
        .fetch_all(&self.pool)
        .await?;

        convert_all(rows)
    }

    async fn create_instance(&self, instance: &AlertInstance) -> Result<bool, StoreError> {
        // ---
        let sql = format!(
            "INSERT INTO alert_instances ({INSTANCE_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
             ON CONFLICT (rule_id, stream_id) WHERE cleared_at IS NULL DO NOTHING"
        );
        let result = sqlx::query(&sql)
            .bind(instance.id)
            .bind(instance.rule_id)
            .bind(instance.stream_id)
            .bind(instance.severity.as_str())
            .bind(&instance.message)
            .bind(instance.triggering_value)
            .bind(instance.threshold_value)
            .bind(instance.last_value)
            .bind(instance.last_seen_at)
            .bind(instance.fired_at)
            .bind(instance.cleared_at)
            .bind(instance.acknowledged_at)
            .bind(instance.acknowledged_by.as_deref())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn touch_instance(
        &self,
        id: Uuid,
        value: f64,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        // ---
        sqlx::query(
            r#"
            UPDATE alert_instances SET last_value = $2, last_seen_at = $3
            WHERE id = $1 AND cleared_at IS NULL
            "#,
        )
        .bind(id)
        .bind(value)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn clear_instance(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<AlertInstance>, StoreError> {
        // ---
        let sql = format!(
            "UPDATE alert_instances SET cleared_at = $2 \
             WHERE id = $1 AND cleared_at IS NULL RETURNING {INSTANCE_COLUMNS}"
        );
        let row: Option<InstanceRow> = sqlx::query_as(&sql)
            .bind(id)
            .bind(at)
            .fetch_optional(&self.pool)
            .await?;

        row.map(AlertInstance::try_from).transpose()
    }

    async fn acknowledge_instance(
        &self,
        id: Uuid,
        by: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<AlertInstance>, StoreError> {
        // ---
        let sql = format!(
            "UPDATE alert_instances SET acknowledged_at = $2, acknowledged_by = $3 \
             WHERE id = $1 AND cleared_at IS NULL AND acknowledged_at IS NULL \
             RETURNING {INSTANCE_COLUMNS}"
        );
        let row: Option<InstanceRow> = sqlx::query_as(&sql)
            .bind(id)
            .bind(at)
            .bind(by)
            .fetch_optional(&self.pool)
            .await?;

        row.map(AlertInstance::try_from).transpose()
    }
}
