//! Telemetry core for cultivation sensors.
//!
//! Raw readings arrive in batches, are normalized to a canonical unit per
//! metric, quality-flagged, de-duplicated and stored. A separate engine
//! evaluates alert rules against stored readings on a schedule. The two
//! halves share nothing but the storage traits in [`store`].
//!
//! Module boundaries follow the gateway pattern: each directory module
//! re-exports its public surface from `mod.rs`, and callers import from
//! the gateway rather than from sibling files.

pub mod alerts;
pub mod clock;
pub mod config;
pub mod dedup;
pub mod directory;
pub mod error;
pub mod models;
pub mod normalizer;
pub mod notify;
pub mod pipeline;
pub mod routes;
pub mod schema;
pub mod store;
pub mod workers;

pub use alerts::{AlertEngine, EngineSettings, TickSummary};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use dedup::Deduplicator;
pub use directory::StreamRegistry;
pub use normalizer::Normalizer;
pub use notify::{LogNotifier, Notifier, WebhookNotifier};
pub use pipeline::{IngestResult, IngestionPipeline, SessionManager};
