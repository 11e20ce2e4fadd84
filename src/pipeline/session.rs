//! Ingestion session bookkeeping.
//!
//! Sessions are advisory: they record which devices are connected but
//! never gate whether readings are accepted.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{SessionError, StoreError};
use crate::models::IngestionSession;
use crate::store::{with_timeout, SessionStore};

// ---

pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl SessionManager {
    // ---
    pub fn new(store: Arc<dyn SessionStore>, clock: Arc<dyn Clock>, timeout: Duration) -> Self {
        SessionManager {
            store,
            clock,
            timeout,
        }
    }

    pub async fn start_session(
        &self,
        site_id: Uuid,
        equipment_id: Uuid,
        protocol: &str,
    ) -> Result<IngestionSession, SessionError> {
        // ---
        let session = IngestionSession::start(site_id, equipment_id, protocol, self.clock.now());
        with_timeout(self.timeout, self.store.insert_session(&session)).await?;

        info!(
            "Started {} session {} for equipment {}",
            session.protocol, session.id, equipment_id
        );
        Ok(session)
    }

    /// Record that the device behind `session_id` is still alive.
    pub async fn heartbeat(&self, session_id: Uuid) -> Result<IngestionSession, SessionError> {
        // ---
        let now = self.clock.now();
        match with_timeout(self.timeout, self.store.touch_session(session_id, now)).await? {
            Some(session) => Ok(session),
            None => Err(self.missing_or_ended(session_id).await?),
        }
    }

    /// Close a session. Ending an already-ended session returns it
    /// unchanged.
    pub async fn end_session(&self, session_id: Uuid) -> Result<IngestionSession, SessionError> {
        // ---
        let now = self.clock.now();
        if let Some(session) =
            with_timeout(self.timeout, self.store.close_session(session_id, now)).await?
        {
            info!("Ended session {}", session_id);
            return Ok(session);
        }

        with_timeout(self.timeout, self.store.get_session(session_id))
            .await?
            .ok_or(SessionError::NotFound(session_id))
    }

    /// Close open sessions with no heartbeat within `threshold`. Sessions
    /// that already ended keep their original end time. Returns the ids
    /// closed by this call.
    pub async fn reap_stale(&self, threshold: Duration) -> Result<Vec<Uuid>, StoreError> {
        // ---
        let now = self.clock.now();
        let cutoff = ChronoDuration::from_std(threshold)
            .ok()
            .and_then(|t| now.checked_sub_signed(t))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let reaped =
            with_timeout(self.timeout, self.store.close_stale_sessions(cutoff, now)).await?;

        if reaped.is_empty() {
            debug!("No stale sessions older than {}", cutoff);
        } else {
            info!("Reaped {} stale sessions", reaped.len());
        }
        Ok(reaped)
    }

    async fn missing_or_ended(&self, session_id: Uuid) -> Result<SessionError, SessionError> {
        // ---
        let existing = with_timeout(self.timeout, self.store.get_session(session_id)).await?;
        Ok(match existing {
            Some(_) => SessionError::Ended(session_id),
            None => SessionError::NotFound(session_id),
        })
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::InMemoryStore;
    use chrono::TimeZone;

    fn manager() -> (Arc<ManualClock>, SessionManager) {
        // ---
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 5, 1, 8, 0, 0).unwrap(),
        ));
        let manager = SessionManager::new(
            Arc::new(InMemoryStore::new()),
            clock.clone(),
            Duration::from_secs(1),
        );
        (clock, manager)
    }

    #[tokio::test]
    async fn test_heartbeat_moves_last_seen() {
        // ---
        let (clock, sessions) = manager();
        let s = sessions
            .start_session(Uuid::new_v4(), Uuid::new_v4(), "mqtt")
            .await
            .unwrap();

        clock.advance(ChronoDuration::seconds(30));
        let beat = sessions.heartbeat(s.id).await.unwrap();
        assert_eq!(beat.last_heartbeat_at, s.started_at + ChronoDuration::seconds(30));
    }

    #[tokio::test]
    async fn test_heartbeat_on_ended_or_unknown_session() {
        // ---
        let (_, sessions) = manager();
        let s = sessions
            .start_session(Uuid::new_v4(), Uuid::new_v4(), "modbus")
            .await
            .unwrap();
        sessions.end_session(s.id).await.unwrap();

        assert!(matches!(
            sessions.heartbeat(s.id).await,
            Err(SessionError::Ended(id)) if id == s.id
        ));
        assert!(matches!(
            sessions.heartbeat(Uuid::new_v4()).await,
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_end_session_is_idempotent() {
        // ---
        let (clock, sessions) = manager();
        let s = sessions
            .start_session(Uuid::new_v4(), Uuid::new_v4(), "http")
            .await
            .unwrap();

        let first = sessions.end_session(s.id).await.unwrap();
        clock.advance(ChronoDuration::minutes(10));
        let second = sessions.end_session(s.id).await.unwrap();

        assert_eq!(first.ended_at, second.ended_at);
    }

    #[tokio::test]
    async fn test_reap_skips_ended_sessions() {
        // ---
        let (clock, sessions) = manager();
        let site = Uuid::new_v4();
        let quiet = sessions.start_session(site, Uuid::new_v4(), "mqtt").await.unwrap();
        let ended = sessions.start_session(site, Uuid::new_v4(), "mqtt").await.unwrap();
        let ended = sessions.end_session(ended.id).await.unwrap();

        clock.advance(ChronoDuration::minutes(2));
        let alive = sessions.start_session(site, Uuid::new_v4(), "mqtt").await.unwrap();

        clock.advance(ChronoDuration::minutes(4));
        let reaped = sessions.reap_stale(Duration::from_secs(300)).await.unwrap();
        assert_eq!(reaped, vec![quiet.id]);

        // Only the newly silent session is closed; ended ones keep their end time
        clock.advance(ChronoDuration::minutes(10));
        let reaped = sessions.reap_stale(Duration::from_secs(300)).await.unwrap();
        assert_eq!(reaped, vec![alive.id]);
        let after = sessions.end_session(ended.id).await.unwrap();
        assert_eq!(after.ended_at, ended.ended_at);
    }
}
