//! Real-time fan-out of accepted readings and alert transitions.
//!
//! Notifiers run only after the data they describe has been persisted.
//! A failed notification is logged and dropped; it never fails the batch
//! or tick that produced it.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::NotifyError;
use crate::models::{AlertInstance, NormalizedReading};

// ---

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TelemetryEvent {
    ReadingsAccepted {
        site_id: Uuid,
        readings: Vec<NormalizedReading>,
    },
    AlertFired {
        alert: AlertInstance,
    },
    AlertCleared {
        alert: AlertInstance,
    },
}

impl TelemetryEvent {
    // ---
    pub fn kind(&self) -> &'static str {
        // ---
        match self {
            TelemetryEvent::ReadingsAccepted { .. } => "readings_accepted",
            TelemetryEvent::AlertFired { .. } => "alert_fired",
            TelemetryEvent::AlertCleared { .. } => "alert_cleared",
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &TelemetryEvent) -> Result<(), NotifyError>;
}

/// Deliver `event`, logging instead of returning any failure.
pub async fn publish(notifier: &dyn Notifier, event: TelemetryEvent) {
    // ---
    if let Err(e) = notifier.notify(&event).await {
        warn!("Failed to publish {} event: {}", event.kind(), e);
    }
}

/// Writes events to the log. Default when no webhook is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &TelemetryEvent) -> Result<(), NotifyError> {
        // ---
        match event {
            TelemetryEvent::ReadingsAccepted { site_id, readings } => {
                info!(site_id = %site_id, count = readings.len(), "readings accepted");
            }
            TelemetryEvent::AlertFired { alert } => {
                info!(alert_id = %alert.id, rule_id = %alert.rule_id, stream_id = %alert.stream_id,
                      "alert fired: {}", alert.message);
            }
            TelemetryEvent::AlertCleared { alert } => {
                info!(alert_id = %alert.id, rule_id = %alert.rule_id, stream_id = %alert.stream_id,
                      "alert cleared");
            }
        }
        Ok(())
    }
}

/// POSTs each event as JSON to a subscriber endpoint.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    // ---
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        // ---
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(WebhookNotifier {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, event: &TelemetryEvent) -> Result<(), NotifyError> {
        // ---
        self.client
            .post(&self.url)
            .json(event)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::models::QualityCode;
    use chrono::Utc;

    #[test]
    fn test_event_is_tagged() {
        // ---
        let event = TelemetryEvent::ReadingsAccepted {
            site_id: Uuid::nil(),
            readings: vec![NormalizedReading {
                stream_id: Uuid::nil(),
                value: 70.0,
                quality: QualityCode::Good,
                source_ts: None,
                ingested_at: Utc::now(),
                message_id: None,
                metadata: serde_json::Value::Null,
            }],
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "readings_accepted");
        assert_eq!(json["readings"][0]["quality"], "good");
        assert_eq!(event.kind(), "readings_accepted");
    }

    #[tokio::test]
    async fn test_unreachable_webhook_does_not_panic() {
        // ---
        let notifier =
            WebhookNotifier::new("http://127.0.0.1:9/hook", Duration::from_millis(200)).unwrap();
        let event = TelemetryEvent::ReadingsAccepted {
            site_id: Uuid::nil(),
            readings: vec![],
        };

        assert!(notifier.notify(&event).await.is_err());
        publish(&notifier, event).await;
    }
}
