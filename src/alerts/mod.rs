//! Alert evaluation engine.
//!
//! Each (rule, stream) pair moves through Inactive -> Active -> cleared.
//! A new instance is created only on a breach with no active instance;
//! a cleared instance is never reactivated. The store's uniqueness guard
//! on active instances serializes concurrent evaluators: the loser of a
//! create race sees `false` and treats the tick as a no-op.
//!
//! The engine reads readings through the store only. It has no link to
//! the ingestion pipeline.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{AlertError, StoreError};
use crate::models::{AlertInstance, AlertRule};
use crate::notify::{publish, Notifier, TelemetryEvent};
use crate::store::{with_timeout, AlertStore, ReadingStore};

pub mod condition;

pub use condition::{evaluate, Evaluation};

// ---

#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    /// How far back from `as_of` readings are considered.
    pub window: ChronoDuration,
    /// Upper bound on readings fetched per stream and tick.
    pub max_readings: u32,
    /// Deadline for each storage call.
    pub timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            window: ChronoDuration::minutes(15),
            max_readings: 500,
            timeout: Duration::from_secs(5),
        }
    }
}

/// What one pair evaluation did.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Fired(AlertInstance),
    Cleared(AlertInstance),
    /// Still breaching; last-seen value updated.
    Refreshed,
    Unchanged,
}

/// Counts for one evaluation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickSummary {
    pub rules: usize,
    pub pairs: usize,
    pub fired: usize,
    pub cleared: usize,
    pub unchanged: usize,
    pub failed: usize,
}

impl TickSummary {
    // ---
    fn record(&mut self, transition: &Transition) {
        // ---
        self.pairs += 1;
        match transition {
            Transition::Fired(_) => self.fired += 1,
            Transition::Cleared(_) => self.cleared += 1,
            Transition::Refreshed | Transition::Unchanged => self.unchanged += 1,
        }
    }

    fn merge(&mut self, other: TickSummary) {
        // ---
        self.rules += other.rules;
        self.pairs += other.pairs;
        self.fired += other.fired;
        self.cleared += other.cleared;
        self.unchanged += other.unchanged;
        self.failed += other.failed;
    }
}

pub struct AlertEngine {
    alerts: Arc<dyn AlertStore>,
    readings: Arc<dyn ReadingStore>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
    settings: EngineSettings,
}

impl AlertEngine {
    // ---
    pub fn new(
        alerts: Arc<dyn AlertStore>,
        readings: Arc<dyn ReadingStore>,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn Notifier>,
        settings: EngineSettings,
    ) -> Self {
        // ---
        AlertEngine {
            alerts,
            readings,
            clock,
            notifier,
            settings,
        }
    }

    /// One pass over every site that has active rules.
    pub async fn evaluate_all_sites(&self) -> Result<TickSummary, StoreError> {
        // ---
        let sites =
            with_timeout(self.settings.timeout, self.alerts.sites_with_active_rules()).await?;

        let mut total = TickSummary::default();
        for site_id in sites {
            match self.evaluate_rules(site_id).await {
                Ok(summary) => total.merge(summary),
                Err(e) => {
                    error!(site_id = %site_id, "Failed to load rules for site: {}", e);
                    total.failed += 1;
                }
            }
        }
        Ok(total)
    }

    /// Evaluate every active rule of `site_id` as of now.
    ///
    /// Fails only when the rules themselves cannot be loaded; failures of
    /// individual (rule, stream) pairs are logged and counted.
    #[instrument(skip(self))]
    pub async fn evaluate_rules(&self, site_id: Uuid) -> Result<TickSummary, StoreError> {
        // ---
        let rules = with_timeout(self.settings.timeout, self.alerts.active_rules(site_id)).await?;
        let as_of = self.clock.now();

        let mut summary = TickSummary::default();
        for rule in &rules {
            summary.merge(self.evaluate_rule(rule, as_of).await);
        }

        debug!(
            "Evaluated {} rules over {} pairs: fired={} cleared={} failed={}",
            summary.rules, summary.pairs, summary.fired, summary.cleared, summary.failed
        );
        Ok(summary)
    }

    /// Evaluate one rule against each of its target streams.
    pub async fn evaluate_rule(&self, rule: &AlertRule, as_of: DateTime<Utc>) -> TickSummary {
        // ---
        let mut summary = TickSummary {
            rules: 1,
            ..TickSummary::default()
        };

        if !rule.active {
            return summary;
        }

        for &stream_id in &rule.stream_ids {
            match self.evaluate_pair(rule, stream_id, as_of).await {
                Ok(transition) => summary.record(&transition),
                Err(e) => {
                    error!(
                        rule_id = %rule.id,
                        stream_id = %stream_id,
                        "Rule evaluation failed: {}", e
                    );
                    summary.pairs += 1;
                    summary.failed += 1;
                }
            }
        }
        summary
    }

    /// Evaluate `rule` on one stream and apply the resulting transition.
    pub async fn evaluate_pair(
        &self,
        rule: &AlertRule,
        stream_id: Uuid,
        as_of: DateTime<Utc>,
    ) -> Result<Transition, AlertError> {
        // ---
        let from = as_of
            .checked_sub_signed(self.settings.window)
            .unwrap_or(DateTime::UNIX_EPOCH);
        let mut readings = with_timeout(
            self.settings.timeout,
            self.readings
                .query_range(stream_id, from, as_of, Some(self.settings.max_readings)),
        )
        .await?;
        // Newest first from the store; evaluation wants insertion order
        readings.reverse();

        let evaluation = evaluate(&rule.condition, &readings);
        let active = with_timeout(
            self.settings.timeout,
            self.alerts.active_instance(rule.id, stream_id),
        )
        .await?;

        let transition = match (evaluation, active) {
            (Evaluation::Breached { value, threshold }, None) => {
                match self.fire_alert(rule, stream_id, value, threshold, as_of).await? {
                    Some(instance) => Transition::Fired(instance),
                    None => Transition::Unchanged,
                }
            }
            (Evaluation::Breached { value, .. }, Some(instance)) => {
                with_timeout(
                    self.settings.timeout,
                    self.alerts.touch_instance(instance.id, value, as_of),
                )
                .await?;
                Transition::Refreshed
            }
            (Evaluation::Normal { .. }, Some(instance)) => {
                match self.clear_alert(instance.id, as_of).await {
                    Ok(cleared) => Transition::Cleared(cleared),
                    // Cleared by a concurrent evaluator in the meantime
                    Err(AlertError::NotActive(_)) => Transition::Unchanged,
                    Err(e) => return Err(e),
                }
            }
            (Evaluation::Normal { .. }, None) | (Evaluation::NoData, _) => Transition::Unchanged,
        };

        Ok(transition)
    }

    /// Open a new instance for (rule, stream). Returns `None` when one is
    /// already active; the existing instance is left untouched.
    pub async fn fire_alert(
        &self,
        rule: &AlertRule,
        stream_id: Uuid,
        value: f64,
        threshold: f64,
        at: DateTime<Utc>,
    ) -> Result<Option<AlertInstance>, AlertError> {
        // ---
        let instance = AlertInstance::fire(rule, stream_id, value, threshold, at);
        let created =
            with_timeout(self.settings.timeout, self.alerts.create_instance(&instance)).await?;

        if !created {
            warn!(
                rule_id = %rule.id,
                stream_id = %stream_id,
                "Alert already active, not firing another"
            );
            return Ok(None);
        }

        info!(
            rule_id = %rule.id,
            stream_id = %stream_id,
            alert_id = %instance.id,
            "Alert fired: {}", instance.message
        );
        publish(
            self.notifier.as_ref(),
            TelemetryEvent::AlertFired {
                alert: instance.clone(),
            },
        )
        .await;
        Ok(Some(instance))
    }

    /// Close an active instance. History is kept: only `cleared_at` is set.
    pub async fn clear_alert(
        &self,
        instance_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<AlertInstance, AlertError> {
        // ---
        let cleared =
            with_timeout(self.settings.timeout, self.alerts.clear_instance(instance_id, at))
                .await?;

        let Some(instance) = cleared else {
            return Err(self.inactive_error(instance_id).await?);
        };

        info!(
            rule_id = %instance.rule_id,
            stream_id = %instance.stream_id,
            alert_id = %instance.id,
            "Alert cleared"
        );
        publish(
            self.notifier.as_ref(),
            TelemetryEvent::AlertCleared {
                alert: instance.clone(),
            },
        )
        .await;
        Ok(instance)
    }

    /// Operator acknowledgement. Does not change active/cleared status.
    /// Acknowledging twice keeps the first acknowledgement.
    pub async fn acknowledge_alert(
        &self,
        instance_id: Uuid,
        by: &str,
    ) -> Result<AlertInstance, AlertError> {
        // ---
        let now = self.clock.now();
        let acked = with_timeout(
            self.settings.timeout,
            self.alerts.acknowledge_instance(instance_id, by, now),
        )
        .await?;

        if let Some(instance) = acked {
            info!(alert_id = %instance_id, "Alert acknowledged by {}", by);
            return Ok(instance);
        }

        match with_timeout(self.settings.timeout, self.alerts.get_instance(instance_id)).await? {
            None => Err(AlertError::NotFound(instance_id)),
            Some(instance) if !instance.is_active() => Err(AlertError::NotActive(instance_id)),
            Some(instance) => Ok(instance),
        }
    }

    pub async fn active_alerts(&self, site_id: Uuid) -> Result<Vec<AlertInstance>, StoreError> {
        with_timeout(self.settings.timeout, self.alerts.active_instances(site_id)).await
    }

    async fn inactive_error(&self, instance_id: Uuid) -> Result<AlertError, AlertError> {
        // ---
        let existing =
            with_timeout(self.settings.timeout, self.alerts.get_instance(instance_id)).await?;
        Ok(match existing {
            Some(_) => AlertError::NotActive(instance_id),
            None => AlertError::NotFound(instance_id),
        })
    }
}
