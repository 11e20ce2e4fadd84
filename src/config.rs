//! Configuration loader for the `canopy-telemetry` service.
//!
//! This module centralizes all runtime configuration values and their defaults,
//! loading from environment variables (with optional `.env` file support
//! provided by the caller). By consolidating configuration logic here, we
//! avoid scattering `env::var` calls throughout the codebase.
//!
use std::env;
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::alerts::EngineSettings;

/// Upper bound for every duration setting: ten years, in seconds.
const MAX_SPAN_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Parse an optional integer environment variable with a default value.
macro_rules! parse_env_u32 {
    ($var_name:expr, $default:expr) => {
        env::var($var_name)
            .ok()
            .map(|v| v.parse::<u32>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($default)
    };
}

/// Same as `parse_env_u32!`, for durations and other wide values.
macro_rules! parse_env_u64 {
    ($var_name:expr, $default:expr) => {
        env::var($var_name)
            .ok()
            .map(|v| v.parse::<u64>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($default)
    };
}

/// Parse a required string environment variable.
macro_rules! require_env {
    ($var_name:expr) => {
        env::var($var_name)
            .map_err(|_| anyhow!("{} must be set in .env or environment", $var_name))?
    };
}

/// Strongly typed application configuration.
///
/// All fields are immutable after loading, ensuring a consistent configuration
/// snapshot for the lifetime of the application.
#[derive(Debug, Clone)]
pub struct Config {
    // ---
    /// PostgreSQL connection string.
    pub db_url: String,

    /// Maximum number of database connections in the pool.
    pub db_pool_max: u32,

    /// Address the HTTP adapter binds to.
    pub bind_addr: String,

    /// Seconds between alert evaluation ticks.
    pub eval_interval_secs: u64,

    /// Look-back window for rule evaluation, in seconds.
    pub eval_window_secs: u64,

    /// Readings fetched per stream per tick.
    pub eval_max_readings: u32,

    /// Seconds between stale-session sweeps.
    pub reaper_interval_secs: u64,

    /// A session with no heartbeat for this long is closed.
    pub session_stale_secs: u64,

    /// Tolerated clock skew before a source timestamp counts as future.
    pub future_skew_secs: u64,

    /// Deadline for each storage call.
    pub store_timeout_ms: u64,

    /// Subscriber endpoint that receives every telemetry event: accepted
    /// readings, fired alerts and cleared alerts. Log-only when unset.
    pub event_webhook_url: Option<String>,
}

/// Load configuration from environment variables with defaults.
///
/// Required:
/// - `DATABASE_URL` – PostgreSQL connection string
///
/// Optional:
/// - `DB_POOL_MAX` – max DB connections (default: 5)
/// - `BIND_ADDR` – HTTP listen address (default: `0.0.0.0:8080`)
/// - `EVAL_INTERVAL_SECS` (30), `EVAL_WINDOW_SECS` (900), `EVAL_MAX_READINGS` (500)
/// - `REAPER_INTERVAL_SECS` (60), `SESSION_STALE_SECS` (300)
/// - `FUTURE_SKEW_SECS` (60), `STORE_TIMEOUT_MS` (5000)
/// - `EVENT_WEBHOOK_URL` – unset by default
///
/// Returns an error if any required variable is missing or invalid.
pub fn load_from_env() -> Result<Config> {
    // ---
    let db_url = require_env!("DATABASE_URL");
    let db_pool_max = parse_env_u32!("DB_POOL_MAX", 5);
    let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

    let cfg = Config {
        db_url,
        db_pool_max,
        bind_addr,
        eval_interval_secs: parse_env_u64!("EVAL_INTERVAL_SECS", 30),
        eval_window_secs: parse_env_u64!("EVAL_WINDOW_SECS", 900),
        eval_max_readings: parse_env_u32!("EVAL_MAX_READINGS", 500),
        reaper_interval_secs: parse_env_u64!("REAPER_INTERVAL_SECS", 60),
        session_stale_secs: parse_env_u64!("SESSION_STALE_SECS", 300),
        future_skew_secs: parse_env_u64!("FUTURE_SKEW_SECS", 60),
        store_timeout_ms: parse_env_u64!("STORE_TIMEOUT_MS", 5000),
        event_webhook_url: env::var("EVENT_WEBHOOK_URL").ok().filter(|u| !u.is_empty()),
    };
    cfg.validate()?;
    Ok(cfg)
}

impl Config {
    // ---
    fn validate(&self) -> Result<()> {
        // ---
        if self.eval_interval_secs == 0 || self.reaper_interval_secs == 0 {
            return Err(anyhow!("worker intervals must be > 0"));
        }
        if self.store_timeout_ms == 0 {
            return Err(anyhow!("STORE_TIMEOUT_MS must be > 0"));
        }

        let spans = [
            ("EVAL_INTERVAL_SECS", self.eval_interval_secs),
            ("EVAL_WINDOW_SECS", self.eval_window_secs),
            ("REAPER_INTERVAL_SECS", self.reaper_interval_secs),
            ("SESSION_STALE_SECS", self.session_stale_secs),
            ("FUTURE_SKEW_SECS", self.future_skew_secs),
            ("STORE_TIMEOUT_MS", self.store_timeout_ms / 1000),
        ];
        for (name, secs) in spans {
            if secs > MAX_SPAN_SECS {
                return Err(anyhow!("{} exceeds {} seconds", name, MAX_SPAN_SECS));
            }
        }
        Ok(())
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn future_skew(&self) -> chrono::Duration {
        span(self.future_skew_secs)
    }

    pub fn session_stale(&self) -> Duration {
        Duration::from_secs(self.session_stale_secs)
    }

    pub fn engine_settings(&self) -> EngineSettings {
        // ---
        EngineSettings {
            window: span(self.eval_window_secs),
            max_readings: self.eval_max_readings,
            timeout: self.store_timeout(),
        }
    }

    /// Database URL with the password replaced by `****`.
    pub fn masked_db_url(&self) -> String {
        // ---
        if let Some(at_pos) = self.db_url.rfind('@') {
            if let Some(colon_pos) = self.db_url[..at_pos].rfind(':') {
                return format!(
                    "{}:****{}",
                    &self.db_url[..colon_pos],
                    &self.db_url[at_pos..]
                );
            }
        }
        self.db_url.clone()
    }

    /// Log the loaded configuration for debugging purposes.
    ///
    /// Masks sensitive information like database passwords while showing
    /// all configuration values that were loaded.
    pub fn log_config(&self) {
        // ---
        tracing::info!("Configuration loaded:");
        tracing::info!("  DATABASE_URL         : {}", self.masked_db_url());
        tracing::info!("  DB_POOL_MAX          : {}", self.db_pool_max);
        tracing::info!("  BIND_ADDR            : {}", self.bind_addr);
        tracing::info!("  EVAL_INTERVAL_SECS   : {}", self.eval_interval_secs);
        tracing::info!("  EVAL_WINDOW_SECS     : {}", self.eval_window_secs);
        tracing::info!("  EVAL_MAX_READINGS    : {}", self.eval_max_readings);
        tracing::info!("  REAPER_INTERVAL_SECS : {}", self.reaper_interval_secs);
        tracing::info!("  SESSION_STALE_SECS   : {}", self.session_stale_secs);
        tracing::info!("  FUTURE_SKEW_SECS     : {}", self.future_skew_secs);
        tracing::info!("  STORE_TIMEOUT_MS     : {}", self.store_timeout_ms);
        tracing::info!(
            "  EVENT_WEBHOOK_URL    : {}",
            self.event_webhook_url.as_deref().unwrap_or("(log only)")
        );
    }
}

/// Seconds as a chrono span, saturating instead of panicking.
fn span(secs: u64) -> chrono::TimeDelta {
    // ---
    i64::try_from(secs)
        .ok()
        .and_then(chrono::TimeDelta::try_seconds)
        .unwrap_or(chrono::TimeDelta::MAX)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn config(db_url: &str) -> Config {
        // ---
        Config {
            db_url: db_url.to_string(),
            db_pool_max: 5,
            bind_addr: "127.0.0.1:0".to_string(),
            eval_interval_secs: 30,
            eval_window_secs: 900,
            eval_max_readings: 500,
            reaper_interval_secs: 60,
            session_stale_secs: 300,
            future_skew_secs: 60,
            store_timeout_ms: 5000,
            event_webhook_url: None,
        }
    }

    #[test]
    fn test_password_is_masked() {
        // ---
        let cfg = config("postgres://grower:hunter2@db:5432/telemetry");
        assert_eq!(cfg.masked_db_url(), "postgres://grower:****@db:5432/telemetry");

        let no_password = config("postgres://db/telemetry");
        assert_eq!(no_password.masked_db_url(), "postgres://db/telemetry");
    }

    #[test]
    fn test_engine_settings_follow_config() {
        // ---
        let settings = config("postgres://db/t").engine_settings();
        assert_eq!(settings.window, chrono::Duration::minutes(15));
        assert_eq!(settings.max_readings, 500);
        assert_eq!(settings.timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_zero_interval_is_rejected() {
        // ---
        let mut cfg = config("postgres://db/t");
        cfg.eval_interval_secs = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_oversized_spans_are_rejected() {
        // ---
        let mut cfg = config("postgres://db/t");
        cfg.future_skew_secs = u64::MAX;
        assert!(cfg.validate().is_err());

        let mut cfg = config("postgres://db/t");
        cfg.eval_window_secs = MAX_SPAN_SECS + 1;
        assert!(cfg.validate().is_err());

        let mut cfg = config("postgres://db/t");
        cfg.eval_window_secs = MAX_SPAN_SECS;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_span_saturates() {
        // ---
        assert_eq!(span(u64::MAX), chrono::TimeDelta::MAX);
        assert_eq!(span(60), chrono::Duration::minutes(1));
    }

    #[test]
    fn test_event_webhook_url_is_read() {
        // ---
        env::set_var("DATABASE_URL", "postgres://db/t");
        env::set_var("EVENT_WEBHOOK_URL", "http://hooks.local/telemetry");
        let cfg = load_from_env().unwrap();
        assert_eq!(
            cfg.event_webhook_url.as_deref(),
            Some("http://hooks.local/telemetry")
        );
    }
}
