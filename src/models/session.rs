use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---

/// Tracked connection lifetime of one telemetry-producing device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct IngestionSession {
    // ---
    pub id: Uuid,
    pub site_id: Uuid,
    pub equipment_id: Uuid,
    pub protocol: String,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl IngestionSession {
    // ---
    pub fn start(
        site_id: Uuid,
        equipment_id: Uuid,
        protocol: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        // ---
        IngestionSession {
            id: Uuid::new_v4(),
            site_id,
            equipment_id,
            protocol: protocol.into(),
            started_at: now,
            last_heartbeat_at: now,
            ended_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }

    /// Open and silent since before `cutoff`.
    pub fn is_stale(&self, cutoff: DateTime<Utc>) -> bool {
        self.is_open() && self.last_heartbeat_at < cutoff
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_staleness() {
        // ---
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        let mut session = IngestionSession::start(Uuid::new_v4(), Uuid::new_v4(), "mqtt", t0);

        assert!(session.is_stale(t0 + Duration::seconds(1)));
        assert!(!session.is_stale(t0));

        session.ended_at = Some(t0);
        assert!(!session.is_stale(t0 + Duration::hours(1)));
    }
}
