//! Data models for the telemetry core.
//!
//! Gateway for the model submodules (EMBP): callers import from
//! `crate::models`, never from the sibling files directly.

mod alert;
mod reading;
mod session;
mod stream;

pub use alert::{AlertInstance, AlertRule, RuleCondition, Severity};
pub use reading::{NormalizedReading, QualityCode, RawReading};
pub use session::IngestionSession;
pub use stream::{MetricType, SensorStream, Unit};
